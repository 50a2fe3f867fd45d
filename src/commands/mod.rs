use exit_result::ExitResult;

pub mod exit_result;
pub mod info_command;
pub mod maps_command;
pub mod probe_command;
pub mod rewind_options;
pub mod selftest_command;
pub mod verify_command;

/// Exit code for a savestate that failed its checks.
pub const EXIT_CORRUPT: i32 = 2;

pub trait RewindCommand {
    fn run(&mut self) -> ExitResult<()>;
}
