use libc::pid_t;
use std::{error::Error, path::PathBuf};
use structopt::{clap, clap::AppSettings, StructOpt};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "rewind",
    about = "Inspect, verify and exercise in-process savestates",
    after_help = "Use REWIND_LOG to control logging; e.g. REWIND_LOG=all:warn,coordinator:debug"
)]
#[structopt(global_settings = &[AppSettings::UnifiedHelpMessage])]
pub struct RewindOptions {
    #[structopt(subcommand)]
    pub cmd: RewindSubCommand,
}

#[derive(Debug, StructOpt, Clone)]
pub enum RewindSubCommand {
    /// Dump the header, region table and handle table of a savestate in JSON format.
    #[structopt(name = "info")]
    Info {
        #[structopt(parse(from_os_str))]
        savestate: PathBuf,

        #[structopt(long, help = "Indent the JSON output.")]
        pretty: bool,
    },

    /// Check a savestate and every generation it depends on, decompressing all pages.
    #[structopt(name = "verify")]
    Verify {
        #[structopt(parse(from_os_str))]
        savestate: PathBuf,
    },

    /// Print the memory map of a process with the classification used for savestates.
    #[structopt(name = "maps")]
    Maps {
        /// Process to inspect. If omitted this process is used
        #[structopt(parse(try_from_str = parse_pid))]
        pid: Option<pid_t>,
    },

    /// Report whether the kernel maintains soft-dirty bits for incremental savestates.
    #[structopt(name = "probe")]
    Probe,

    /// Save, disturb and load scratch memory, worker threads and a pipe inside this process.
    #[structopt(name = "selftest")]
    Selftest {
        #[structopt(long, default_value = "64", parse(try_from_str = parse_positive))]
        pages: usize,

        #[structopt(long, default_value = "4")]
        threads: usize,

        #[structopt(long, default_value = "3", parse(try_from_str = parse_positive))]
        rounds: usize,

        /// Where to put the savestates. A fresh directory under $REWIND_TMPDIR if omitted
        #[structopt(long, parse(from_os_str))]
        dir: Option<PathBuf>,

        #[structopt(long, help = "Write full savestates only.")]
        full: bool,
    },
}

fn parse_pid(maybe_pid: &str) -> Result<pid_t, Box<dyn Error>> {
    let pid = maybe_pid.trim().parse::<pid_t>()?;
    if pid < 1 {
        Err(Box::new(clap::Error::with_description(
            "pid cannot be 0 or negative",
            clap::ErrorKind::InvalidValue,
        )))
    } else {
        Ok(pid)
    }
}

fn parse_positive(maybe_count: &str) -> Result<usize, Box<dyn Error>> {
    let count = maybe_count.trim().parse::<usize>()?;
    if count == 0 {
        Err(Box::new(clap::Error::with_description(
            "Please provide a number greater than 0",
            clap::ErrorKind::InvalidValue,
        )))
    } else {
        Ok(count)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_subcommands() {
        let o = RewindOptions::from_iter_safe(&["rewind", "info", "--pretty", "/tmp/a.state"]).unwrap();
        match o.cmd {
            RewindSubCommand::Info { savestate, pretty } => {
                assert_eq!(savestate, PathBuf::from("/tmp/a.state"));
                assert!(pretty);
            }
            other => panic!("unexpected {:?}", other),
        }

        let o = RewindOptions::from_iter_safe(&["rewind", "selftest", "--rounds", "2"]).unwrap();
        match o.cmd {
            RewindSubCommand::Selftest {
                pages,
                threads,
                rounds,
                dir,
                full,
            } => {
                assert_eq!((pages, threads, rounds), (64, 4, 2));
                assert!(dir.is_none());
                assert!(!full);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn rejects_bad_numbers() {
        assert!(RewindOptions::from_iter_safe(&["rewind", "maps", "0"]).is_err());
        assert!(RewindOptions::from_iter_safe(&["rewind", "selftest", "--pages", "0"]).is_err());
        let o = RewindOptions::from_iter_safe(&["rewind", "maps", "42"]).unwrap();
        assert!(matches!(o.cmd, RewindSubCommand::Maps { pid: Some(42) }));
    }
}
