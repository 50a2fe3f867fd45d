use super::{exit_result::ExitResult, RewindCommand};
use crate::dirty_pages::{DirtyPageTracker, DirtyTracking};
use nix::unistd::getpid;

pub struct ProbeCommand;

impl ProbeCommand {
    pub fn new() -> ProbeCommand {
        ProbeCommand
    }
}

impl Default for ProbeCommand {
    fn default() -> Self {
        Self::new()
    }
}

fn describe(tracking: DirtyTracking) -> &'static str {
    match tracking {
        DirtyTracking::SoftDirty => "soft-dirty tracking available: savestates are incremental",
        DirtyTracking::Unsupported => "soft-dirty tracking unavailable: every savestate is a full snapshot",
    }
}

impl RewindCommand for ProbeCommand {
    fn run(&mut self) -> ExitResult<()> {
        let tracker = DirtyPageTracker::new(getpid().as_raw());
        println!("{}", describe(tracker.tracking()));
        ExitResult::Ok(())
    }
}
