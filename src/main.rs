use rewind::commands::{
    info_command::InfoCommand,
    maps_command::MapsCommand,
    probe_command::ProbeCommand,
    rewind_options::{RewindOptions, RewindSubCommand},
    selftest_command::SelftestCommand,
    verify_command::VerifyCommand,
    RewindCommand,
};
use std::process;
use structopt::StructOpt;

fn main() {
    let options = RewindOptions::from_args();

    let result = match &options.cmd {
        RewindSubCommand::Info { .. } => InfoCommand::new(&options).run(),
        RewindSubCommand::Verify { .. } => VerifyCommand::new(&options).run(),
        RewindSubCommand::Maps { .. } => MapsCommand::new(&options).run(),
        RewindSubCommand::Probe => ProbeCommand::new().run(),
        RewindSubCommand::Selftest { .. } => SelftestCommand::new(&options).run(),
    };
    process::exit(result.report());
}
