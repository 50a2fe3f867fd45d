use super::{
    exit_result::ExitResult,
    rewind_options::{RewindOptions, RewindSubCommand},
    RewindCommand,
};
use crate::address_space::{memory_region::MemoryRegion, read_regions};
use libc::pid_t;
use nix::unistd::getpid;

pub struct MapsCommand {
    pid: Option<pid_t>,
}

impl MapsCommand {
    pub fn new(options: &RewindOptions) -> MapsCommand {
        match options.cmd.clone() {
            RewindSubCommand::Maps { pid } => MapsCommand { pid },
            _ => panic!("Unexpected RewindSubCommand variant. Not a `Maps` variant!"),
        }
    }
}

fn format_region(r: &MemoryRegion) -> String {
    format!(
        "{:<100} [{}{}]",
        r.str(),
        r.kind(),
        if r.has_contents() { ", captured" } else { "" }
    )
}

impl RewindCommand for MapsCommand {
    fn run(&mut self) -> ExitResult<()> {
        let pid = self.pid.unwrap_or_else(|| getpid().as_raw());
        match read_regions(pid, None) {
            Ok(regions) => {
                for r in &regions {
                    println!("{}", format_region(r));
                }
                ExitResult::Ok(())
            }
            Err(e) => ExitResult::err_from(e, 1),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::address_space::test::ScratchMapping;

    #[test]
    fn marks_captured_regions() {
        let scratch = ScratchMapping::new(1);
        let regions = read_regions(getpid().as_raw(), None).unwrap();
        let r = regions.iter().find(|r| r.contains_ptr(scratch.start())).unwrap();
        assert!(format_region(r).ends_with("[other, captured]"));
        let vdso = regions.iter().find(|r| r.fsname() == "[vdso]");
        if let Some(v) = vdso {
            assert!(format_region(v).ends_with("[special]"));
        }
    }
}
