use nix::{
    errno::Errno,
    sys::uio::{pread, pwrite},
    unistd::{read, sysconf, write, SysconfVar::PAGE_SIZE},
};
use std::{convert::TryInto, env, os::unix::io::RawFd, path::PathBuf};

lazy_static! {
    static ref SYSTEM_PAGE_SIZE: usize = page_size_init();
}

#[cfg(test)]
lazy_static! {
    /// Soft-dirty bits are process wide. Tests that clear them or rely on
    /// them staying set must not overlap.
    pub static ref SOFT_DIRTY_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
}

#[cfg(test)]
pub fn soft_dirty_test_guard() -> std::sync::MutexGuard<'static, ()> {
    SOFT_DIRTY_TEST_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn page_size_init() -> usize {
    match sysconf(PAGE_SIZE) {
        Ok(Some(sz)) => sz.try_into().unwrap_or(4096),
        _ => 4096,
    }
}

pub fn page_size() -> usize {
    *SYSTEM_PAGE_SIZE
}

pub fn ceil_page_size(size: usize) -> usize {
    (size + page_size() - 1) & !(page_size() - 1)
}

pub fn floor_page_size(sz: usize) -> usize {
    sz & !(page_size() - 1)
}

/// Whether every byte is zero. Looks at a word at a time.
pub fn is_zeroed(buf: &[u8]) -> bool {
    // Safe: every bit pattern is a valid u64.
    let (prefix, words, suffix) = unsafe { buf.align_to::<u64>() };
    prefix.iter().all(|&b| b == 0) && words.iter().all(|&w| w == 0) && suffix.iter().all(|&b| b == 0)
}

pub fn pwrite_all_fallible(fd: RawFd, mut buf: &[u8], mut offset: u64) -> nix::Result<()> {
    while !buf.is_empty() {
        match pwrite(fd, buf, offset as libc::off_t) {
            Ok(0) => return Err(Errno::EIO),
            Ok(nwritten) => {
                buf = &buf[nwritten..];
                offset += nwritten as u64;
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Returns the number of bytes read, which is only short at end of file.
pub fn pread_all_fallible(fd: RawFd, buf: &mut [u8], offset: u64) -> nix::Result<usize> {
    let mut nread = 0;
    while nread < buf.len() {
        match pread(fd, &mut buf[nread..], (offset + nread as u64) as libc::off_t) {
            Ok(0) => break,
            Ok(n) => nread += n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(nread)
}

pub fn write_all(fd: RawFd, mut buf: &[u8]) -> nix::Result<()> {
    while !buf.is_empty() {
        match write(fd, buf) {
            Ok(0) => return Err(Errno::EIO),
            Ok(nwritten) => buf = &buf[nwritten..],
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Read until `buf` is full, EOF, or an error. EOF gives a short count.
pub fn read_all(fd: RawFd, buf: &mut [u8]) -> nix::Result<usize> {
    let mut nread = 0;
    while nread < buf.len() {
        match read(fd, &mut buf[nread..]) {
            Ok(0) => break,
            Ok(n) => nread += n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(nread)
}

/// Directory for scratch files, `REWIND_TMPDIR` or `TMPDIR`, falling back to /tmp.
pub fn tmp_dir() -> PathBuf {
    env::var_os("REWIND_TMPDIR")
        .or_else(|| env::var_os("TMPDIR"))
        .map_or_else(|| PathBuf::from("/tmp"), PathBuf::from)
}

pub fn gettid() -> libc::pid_t {
    // Raw syscall so this is usable from a signal handler.
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}
