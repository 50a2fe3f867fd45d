use nix::{
    fcntl::{open, OFlag},
    sys::stat::Mode,
    unistd::close,
    NixPath,
};
use std::os::unix::io::{AsRawFd, RawFd};

/// Owns a descriptor and closes it on drop.
// We DON'T want this to be Copy or Clone because of the Drop.
pub struct ScopedFd {
    fd: RawFd,
}

impl ScopedFd {
    pub fn new() -> Self {
        ScopedFd { fd: -1 }
    }

    pub fn from_raw(fd: RawFd) -> Self {
        ScopedFd { fd }
    }

    pub fn open_path<P: ?Sized + NixPath>(path: &P, oflag: OFlag) -> nix::Result<Self> {
        Self::open_path_with_mode(path, oflag, Mode::empty())
    }

    pub fn open_path_with_mode<P: ?Sized + NixPath>(
        path: &P,
        oflag: OFlag,
        mode: Mode,
    ) -> nix::Result<Self> {
        let rawfd = open(path, oflag | OFlag::O_CLOEXEC, mode)?;
        Ok(ScopedFd { fd: rawfd })
    }

    pub fn close(&mut self) {
        if self.fd >= 0 {
            // We swallow any error on close
            close(self.fd).unwrap_or(());
        }

        self.fd = -1;
    }

    pub fn is_open(&self) -> bool {
        self.fd >= 0
    }

    pub fn as_raw(&self) -> RawFd {
        self.fd
    }

    /// Give up ownership without closing.
    pub fn extract(&mut self) -> RawFd {
        let result = self.fd;
        self.fd = -1;
        result
    }
}

impl Default for ScopedFd {
    fn default() -> Self {
        Self::new()
    }
}

impl AsRawFd for ScopedFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for ScopedFd {
    fn drop(&mut self) {
        self.close()
    }
}
