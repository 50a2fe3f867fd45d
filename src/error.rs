use libc::pid_t;
use std::{io, path::PathBuf};
use thiserror::Error;

/// Everything that can go wrong while checkpointing or restoring.
///
/// Only the orchestrator decides whether an error aborts the save, degrades
/// the engine or terminates the subject.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("os error: {0}")]
    Os(#[from] nix::Error),

    #[error("could not read any mapping from /proc/{0}/maps")]
    MapsUnreadable(pid_t),

    #[error("savestate `{}` is corrupt: {}", .path.display(), .reason)]
    Corrupt { path: PathBuf, reason: String },

    #[error("threads {0:?} did not acknowledge suspension in time")]
    SuspendStalled(Vec<pid_t>),

    #[error("process is exiting")]
    Exiting,

    #[error("thread {0} is not the checkpoint thread")]
    NotCheckpointThread(pid_t),

    #[error("thread {0} is already the checkpoint thread")]
    CheckpointThreadTaken(pid_t),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("compression: {0}")]
    Compression(String),

    #[error("subject memory was partially overwritten: {0}")]
    SubjectCorrupted(Box<CheckpointError>),

    #[error("savestate metadata: {0}")]
    Meta(#[from] bincode::Error),
}

impl CheckpointError {
    pub fn corrupt<P: Into<PathBuf>, S: Into<String>>(path: P, reason: S) -> CheckpointError {
        CheckpointError::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether the subject is still in a consistent state after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, CheckpointError::SubjectCorrupted(_))
    }
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

#[cfg(test)]
mod test {
    use super::*;
    use nix::errno::Errno;

    #[test]
    fn conversions_and_messages() {
        let e: CheckpointError = Errno::ESRCH.into();
        assert!(matches!(e, CheckpointError::Os(Errno::ESRCH)));
        let e = CheckpointError::corrupt("/tmp/x.state", "short chunk");
        assert_eq!(e.to_string(), "savestate `/tmp/x.state` is corrupt: short chunk");
        assert!(e.is_recoverable());
        assert!(!CheckpointError::SubjectCorrupted(Box::new(e)).is_recoverable());
        let e = CheckpointError::Compression("brotli compression failed".into());
        assert_eq!(e.to_string(), "compression: brotli compression failed");
        assert!(e.is_recoverable());
        assert_eq!(
            CheckpointError::SuspendStalled(vec![12, 13]).to_string(),
            "threads [12, 13] did not acknowledge suspension in time"
        );
    }
}
