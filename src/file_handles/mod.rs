//! Descriptors, streams and pipes of the subject whose state has to survive
//! a rewind.

pub mod registry;

use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display, Formatter},
    os::unix::io::RawFd,
    path::{Path, PathBuf},
};

pub use registry::FileHandleRegistry;

/// Identifies a handle for its whole life. Never reused, unlike the
/// descriptor number.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct HandleId(u64);

impl HandleId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for HandleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum HandleKind {
    File {
        path: PathBuf,
        /// Status flags at registration, used to reopen the file.
        flags: i32,
    },
    Pipe {
        flags: i32,
        /// Drained backlog. `None` when unknown or already re-injected.
        contents: Option<Vec<u8>>,
    },
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FileHandle {
    pub id: HandleId,
    /// The second descriptor is the write end of a pipe, -1 otherwise.
    pub fds: [RawFd; 2],
    /// Address of the `FILE` for stdio streams.
    pub stream: Option<usize>,
    pub kind: HandleKind,
    /// -1 when not frozen.
    pub offset: i64,
    /// File size, or pipe backlog size; -1 when not frozen.
    pub size: i64,
    pub tracked: bool,
    /// The subject closed it after it became tracked.
    pub closed: bool,
}

impl FileHandle {
    pub fn is_pipe(&self) -> bool {
        matches!(self.kind, HandleKind::Pipe { .. })
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.kind {
            HandleKind::File { path, .. } => Some(path),
            HandleKind::Pipe { .. } => None,
        }
    }

    pub fn stream_ptr(&self) -> Option<*mut libc::FILE> {
        self.stream.map(|s| s as *mut libc::FILE)
    }
}

impl Display for FileHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.kind {
            HandleKind::File { path, .. } => {
                write!(f, "{} {:?} (fd={})", self.id, path, self.fds[0])
            }
            HandleKind::Pipe { .. } => {
                write!(f, "{} pipe (fd={},{})", self.id, self.fds[0], self.fds[1])
            }
        }
    }
}
