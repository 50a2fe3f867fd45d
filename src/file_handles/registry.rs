use super::{FileHandle, HandleId, HandleKind};
use crate::{
    error::Result,
    log::LogLevel::{LogDebug, LogError, LogWarn},
    sig::{AtomicSig, Sig, SignalBlock, SIGXFSZ},
    util::write_all,
};
use libc::pid_t;
use nix::{
    dir::{Dir, Type},
    errno::Errno,
    fcntl::{fcntl, open, readlink, FcntlArg, OFlag},
    sys::stat::Mode,
    unistd::{close, dup2, fdatasync, getpid, lseek, pipe2, read, Whence},
};
use std::{
    collections::HashSet,
    ops::{Deref, DerefMut},
    os::unix::io::{AsRawFd, RawFd},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

struct Inner {
    handles: Vec<FileHandle>,
    next_id: u64,
    /// Descriptors `scan_existing()` must leave alone.
    ignored: Vec<RawFd>,
}

impl Inner {
    fn push(&mut self, kind: HandleKind, fds: [RawFd; 2], stream: Option<usize>) -> HandleId {
        let id = HandleId(self.next_id);
        self.next_id += 1;
        self.handles.push(FileHandle {
            id,
            fds,
            stream,
            kind,
            offset: -1,
            size: -1,
            tracked: false,
            closed: false,
        });
        id
    }
}

/// The registry lock. The suspend signal stays blocked while it is held.
struct Locked<'a> {
    guard: MutexGuard<'a, Inner>,
    _block: SignalBlock,
}

impl<'a> Deref for Locked<'a> {
    type Target = Inner;
    fn deref(&self) -> &Inner {
        &self.guard
    }
}

impl<'a> DerefMut for Locked<'a> {
    fn deref_mut(&mut self) -> &mut Inner {
        &mut self.guard
    }
}

/// Every descriptor, stream and pipe of the subject that a rewind has to put
/// back the way it was.
///
/// Subject threads call `open*()` and `close()` as they go; the checkpoint
/// thread calls the rest while the subject is suspended.
pub struct FileHandleRegistry {
    pid: pid_t,
    suspend_signal: AtomicSig,
    inner: Mutex<Inner>,
}

impl Default for FileHandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FileHandleRegistry {
    pub fn new() -> FileHandleRegistry {
        FileHandleRegistry {
            pid: getpid().as_raw(),
            suspend_signal: AtomicSig::new(SIGXFSZ),
            inner: Mutex::new(Inner {
                handles: Vec::new(),
                next_id: 0,
                ignored: Vec::new(),
            }),
        }
    }

    pub fn set_suspend_signal(&self, sig: Sig) {
        self.suspend_signal.set(sig);
    }

    fn lock(&self) -> Locked<'_> {
        // Block first: a thread frozen with the lock held would deadlock the
        // checkpoint thread.
        let block = SignalBlock::new(self.suspend_signal.get());
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Locked {
            guard,
            _block: block,
        }
    }

    /// Never register `fd` during `scan_existing()`.
    pub fn ignore(&self, fd: RawFd) {
        self.lock().ignored.push(fd);
    }

    pub fn open(&self, path: &Path, fd: RawFd) -> Option<HandleId> {
        if fd < 0 {
            return None;
        }
        let mut inner = self.lock();
        if let Some(h) = inner.handles.iter().find(|h| h.fds[0] == fd) {
            log!(LogWarn, "Opened file descriptor {} was already registered", fd);
            return Some(h.id);
        }
        let flags = fcntl(fd, FcntlArg::F_GETFL).unwrap_or(libc::O_RDONLY);
        let kind = HandleKind::File {
            path: path.to_owned(),
            flags,
        };
        Some(inner.push(kind, [fd, -1], None))
    }

    /// # Safety
    ///
    /// `stream` must be null or a live stdio stream.
    pub unsafe fn open_stream(&self, path: &Path, stream: *mut libc::FILE) -> Option<HandleId> {
        if stream.is_null() {
            return None;
        }
        let fd = libc::fileno(stream);
        let mut inner = self.lock();
        if let Some(h) = inner.handles.iter().find(|h| h.stream == Some(stream as usize)) {
            log!(LogWarn, "Opened stream {:p} was already registered", stream);
            return Some(h.id);
        }
        let flags = fcntl(fd, FcntlArg::F_GETFL).unwrap_or(libc::O_RDONLY);
        let kind = HandleKind::File {
            path: path.to_owned(),
            flags,
        };
        Some(inner.push(kind, [fd, -1], Some(stream as usize)))
    }

    /// Create a pipe whose write end is non-blocking. Returns (read, write).
    pub fn open_pipe(&self, flags: OFlag) -> Result<(RawFd, RawFd)> {
        let (r, w) = pipe2(flags)?;
        set_nonblocking(w)?;
        let kind = HandleKind::Pipe {
            flags: flags.bits(),
            contents: None,
        };
        self.lock().push(kind, [r, w], None);
        Ok((r, w))
    }

    pub fn fd_from_path(&self, path: &Path) -> Option<RawFd> {
        self.lock()
            .handles
            .iter()
            .find(|h| !h.closed && h.path() == Some(path))
            .map(|h| h.fds[0])
    }

    /// The subject wants to close `fd`. Returns whether it must actually be
    /// closed: a tracked handle is only marked closed so that loading an
    /// earlier savestate can still use it.
    pub fn close(&self, fd: RawFd) -> bool {
        if fd < 0 {
            return true;
        }
        let mut inner = self.lock();
        let pos = match inner.handles.iter().position(|h| h.fds[0] == fd && !h.closed) {
            Some(pos) => pos,
            None => {
                log!(LogDebug, "Unknown file descriptor {}", fd);
                return true;
            }
        };
        if inner.handles[pos].tracked {
            inner.handles[pos].closed = true;
            return false;
        }
        let h = inner.handles.remove(pos);
        if h.is_pipe() {
            close(h.fds[1]).unwrap_or(());
        }
        true
    }

    /// Register descriptors that were opened behind the registry's back.
    /// Only files with an absolute path outside /dev and /proc are taken.
    /// Returns the number of new handles.
    pub fn scan_existing(&self) -> Result<usize> {
        let dir_path = format!("/proc/{}/fd", self.pid);
        let mut dir = Dir::open(
            dir_path.as_str(),
            OFlag::O_RDONLY | OFlag::O_DIRECTORY,
            Mode::empty(),
        )?;
        let dir_fd = dir.as_raw_fd();
        let local = self.pid == getpid().as_raw();
        let mut inner = self.lock();
        let mut added = 0;
        for entry in dir.iter() {
            let entry = entry?;
            if entry.file_type().map_or(false, |t| t != Type::Symlink) {
                continue;
            }
            let fd: RawFd = match entry.file_name().to_str().ok().and_then(|s| s.parse().ok()) {
                Some(fd) => fd,
                None => continue,
            };
            if fd < 3 || (local && fd == dir_fd) || inner.ignored.contains(&fd) {
                continue;
            }
            if inner.handles.iter().any(|h| h.fds.contains(&fd)) {
                continue;
            }
            let target = match readlink(format!("{}/{}", dir_path, fd).as_str()) {
                Ok(t) => PathBuf::from(t),
                Err(e) => {
                    log!(LogWarn, "Could not get symlink to file fd {}: {}", fd, e);
                    continue;
                }
            };
            // Sockets, pipes and anonymous inodes have no absolute path.
            if !target.is_absolute() || target.starts_with("/dev") || target.starts_with("/proc") {
                continue;
            }
            let flags = if local {
                fcntl(fd, FcntlArg::F_GETFL).unwrap_or(libc::O_RDONLY)
            } else {
                libc::O_RDONLY
            };
            log!(LogDebug, "Add file {:?} with fd {} to file handle list", target, fd);
            inner.push(HandleKind::File { path: target, flags }, [fd, -1], None);
            added += 1;
        }
        Ok(added)
    }

    /// Freeze every handle. The subject must be suspended: pipes are
    /// emptied into the registry.
    pub fn begin_tracking(&self, pipe_drain_limit: usize) {
        let mut inner = self.lock();
        // Closes that were deferred for the previous generation can now
        // happen for real.
        let (closed, open): (Vec<FileHandle>, Vec<FileHandle>) =
            inner.handles.drain(..).partition(|h| h.closed);
        inner.handles = open;
        for h in &closed {
            log!(LogDebug, "Closing superseded {}", h);
            close_handle(h);
        }

        for h in inner.handles.iter_mut() {
            h.tracked = true;
            if h.is_pipe() {
                let drained = drain_pipe(h, pipe_drain_limit);
                h.size = drained.as_ref().map_or(-1, |c| c.len() as i64);
                if let HandleKind::Pipe { contents, .. } = &mut h.kind {
                    *contents = drained;
                }
                log!(LogDebug, "Save pipe size: {}", h.size);
            } else {
                freeze_file(h);
                log!(
                    LogDebug,
                    "Save {} offset {} and size {}",
                    h,
                    h.offset,
                    h.size
                );
            }
        }
    }

    /// Put offsets and pipe contents back. Descriptors that are gone are
    /// reopened at their old numbers.
    pub fn restore(&self) {
        let mut inner = self.lock();
        for h in inner.handles.iter_mut() {
            if !h.tracked {
                log!(LogError, "{} not tracked when recovering", h);
                continue;
            }
            if h.closed {
                continue;
            }
            if let Err(e) = ensure_open(h) {
                log!(LogError, "Could not reopen {}: {}", h, e);
                continue;
            }
            if h.is_pipe() {
                restore_pipe(h);
            } else {
                restore_file(h);
            }
        }
    }

    /// Close every handle that is not part of `table`, the handle table of
    /// the savestate about to be loaded.
    pub fn close_untracked(&self, table: &[FileHandle]) {
        let keep: HashSet<HandleId> = table.iter().map(|h| h.id).collect();
        let mut inner = self.lock();
        let (stale, kept): (Vec<FileHandle>, Vec<FileHandle>) =
            inner.handles.drain(..).partition(|h| !keep.contains(&h.id));
        inner.handles = kept;
        for h in &stale {
            log!(LogDebug, "Closing {}, unknown to the savestate", h);
            close_handle(h);
        }
    }

    pub fn snapshot(&self) -> Vec<FileHandle> {
        self.lock().handles.clone()
    }

    /// Adopt the handle table of a loaded savestate. Ids keep increasing past
    /// anything the table uses.
    pub fn replace_with(&self, table: Vec<FileHandle>) {
        let mut inner = self.lock();
        let above = table.iter().map(|h| h.id.0 + 1).max().unwrap_or(0);
        inner.next_id = inner.next_id.max(above);
        inner.handles = table;
    }

    pub fn get(&self, fd: RawFd) -> Option<FileHandle> {
        self.lock().handles.iter().find(|h| h.fds[0] == fd).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

fn pipe_backlog(fd: RawFd) -> nix::Result<usize> {
    let mut n: libc::c_int = 0;
    let ret = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut n as *mut libc::c_int) };
    Errno::result(ret)?;
    Ok(n as usize)
}

/// Read up to `buf.len()` bytes; returns how many arrived before EOF or an
/// error.
fn read_available(fd: RawFd, buf: &mut [u8]) -> (usize, Option<Errno>) {
    let mut nread = 0;
    while nread < buf.len() {
        match read(fd, &mut buf[nread..]) {
            Ok(0) => break,
            Ok(n) => nread += n,
            Err(Errno::EINTR) => continue,
            Err(e) => return (nread, Some(e)),
        }
    }
    (nread, None)
}

fn drain_pipe(h: &FileHandle, limit: usize) -> Option<Vec<u8>> {
    let avail = match pipe_backlog(h.fds[0]) {
        Ok(n) => n,
        Err(e) => {
            log!(LogWarn, "FIONREAD on {} failed: {}", h, e);
            return None;
        }
    };
    if avail > limit {
        log!(
            LogWarn,
            "{} holds {} bytes, more than the limit of {}; contents not saved",
            h,
            avail,
            limit
        );
        return None;
    }
    let mut buf = vec![0u8; avail];
    let (n, err) = read_available(h.fds[0], &mut buf);
    if n == avail {
        return Some(buf);
    }
    log!(
        LogWarn,
        "Draining {} stopped after {} of {} bytes ({:?}); contents not saved",
        h,
        n,
        avail,
        err
    );
    if let Err(e) = write_all(h.fds[1], &buf[..n]) {
        log!(LogError, "Could not put {} bytes back into {}: {}", n, h, e);
    }
    None
}

fn freeze_file(h: &mut FileHandle) {
    let fd = h.fds[0];
    if let Some(stream) = h.stream_ptr() {
        unsafe {
            libc::fflush(stream);
            if let Err(e) = fdatasync(fd) {
                log!(LogDebug, "fdatasync({}): {}", fd, e);
            }
            h.offset = libc::ftello(stream);
            libc::fseeko(stream, 0, libc::SEEK_END);
            h.size = libc::ftello(stream);
            libc::fseeko(stream, h.offset, libc::SEEK_SET);
        }
    } else {
        if let Err(e) = fdatasync(fd) {
            log!(LogDebug, "fdatasync({}): {}", fd, e);
        }
        h.offset = lseek(fd, 0, Whence::SeekCur).unwrap_or(-1);
        h.size = lseek(fd, 0, Whence::SeekEnd).unwrap_or(-1);
        if h.offset >= 0 {
            lseek(fd, h.offset, Whence::SeekSet).unwrap_or(-1);
        }
    }
}

fn restore_file(h: &mut FileHandle) {
    if h.offset < 0 {
        return;
    }
    let fd = h.fds[0];
    let (current_size, ret) = match h.stream_ptr() {
        Some(stream) => unsafe {
            libc::fseeko(stream, 0, libc::SEEK_END);
            let size = libc::ftello(stream);
            (size, libc::fseeko(stream, h.offset, libc::SEEK_SET) as i64)
        },
        None => (
            lseek(fd, 0, Whence::SeekEnd).unwrap_or(-1),
            lseek(fd, h.offset, Whence::SeekSet).unwrap_or(-1),
        ),
    };
    if current_size != h.size {
        log!(
            LogWarn,
            "Restore {} changed size from {} to {}",
            h,
            h.size,
            current_size
        );
    }
    if ret == -1 {
        log!(LogError, "Error seeking {} to {}", h, h.offset);
    } else {
        log!(LogDebug, "Restore {} offset to {}", h, h.offset);
    }
    h.offset = -1;
}

fn restore_pipe(h: &mut FileHandle) {
    let contents = match &mut h.kind {
        HandleKind::Pipe { contents, .. } => contents.take(),
        HandleKind::File { .. } => None,
    };
    let contents = match contents {
        Some(c) => c,
        None => return,
    };
    match pipe_backlog(h.fds[0]) {
        Ok(0) => (),
        Ok(n) => {
            let mut discard = vec![0u8; n];
            read_available(h.fds[0], &mut discard);
        }
        Err(e) => log!(LogWarn, "FIONREAD on {} failed: {}", h, e),
    }
    match write_all(h.fds[1], &contents) {
        Ok(()) => log!(LogDebug, "Put {} bytes back into {}", contents.len(), h),
        Err(e) => log!(LogError, "Error recovering {} bytes into {}: {}", contents.len(), h, e),
    }
    h.size = -1;
}

fn close_handle(h: &FileHandle) {
    match h.stream_ptr() {
        Some(stream) => unsafe {
            libc::fclose(stream);
        },
        None => close(h.fds[0]).unwrap_or(()),
    }
    if h.is_pipe() {
        close(h.fds[1]).unwrap_or(());
    }
}

/// Move `fd` to the lowest free descriptor at or above `floor`.
fn park(fd: RawFd, floor: RawFd) -> nix::Result<RawFd> {
    let parked = fcntl(fd, FcntlArg::F_DUPFD_CLOEXEC(floor))?;
    close(fd)?;
    Ok(parked)
}

fn move_fd(from: RawFd, to: RawFd) -> nix::Result<()> {
    if from != to {
        dup2(from, to)?;
        close(from)?;
    }
    Ok(())
}

/// Recreate the descriptors of a handle the subject closed after it was
/// saved.
fn ensure_open(h: &FileHandle) -> nix::Result<()> {
    if fcntl(h.fds[0], FcntlArg::F_GETFD).is_ok() {
        return Ok(());
    }
    let floor = h.fds[0].max(h.fds[1]) + 1;
    match &h.kind {
        HandleKind::File { path, flags } => {
            let oflag = OFlag::from_bits_truncate(*flags)
                & !(OFlag::O_CREAT | OFlag::O_TRUNC | OFlag::O_EXCL);
            let fd = open(path.as_path(), oflag, Mode::empty())?;
            move_fd(park(fd, floor)?, h.fds[0])?;
        }
        HandleKind::Pipe { flags, .. } => {
            let (r, w) = pipe2(OFlag::from_bits_truncate(*flags))?;
            let (r, w) = (park(r, floor)?, park(w, floor)?);
            move_fd(r, h.fds[0])?;
            move_fd(w, h.fds[1])?;
            set_nonblocking(h.fds[1])?;
        }
    }
    log!(LogDebug, "Reopened {}", h);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::{fs, io::Write, os::unix::io::IntoRawFd};

    /// Far above anything concurrently running tests get, so closing and
    /// reopening it cannot hit someone else's descriptor.
    fn high_fd(fd: RawFd) -> RawFd {
        let high = fcntl(fd, FcntlArg::F_DUPFD_CLOEXEC(700)).unwrap();
        close(fd).unwrap();
        high
    }

    fn is_open(fd: RawFd) -> bool {
        fcntl(fd, FcntlArg::F_GETFD).is_ok()
    }

    fn hundred_byte_file(dir: &Path) -> (PathBuf, RawFd) {
        let path = dir.join("data");
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(&(0..100u8).collect::<Vec<u8>>()).unwrap();
        drop(f);
        let fd = open(path.as_path(), OFlag::O_RDWR, Mode::empty()).unwrap();
        (path, high_fd(fd))
    }

    fn read_at_current(fd: RawFd, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        let (got, _) = read_available(fd, &mut buf);
        buf.truncate(got);
        buf
    }

    #[test]
    fn untracked_close_forgets_the_handle() {
        let reg = FileHandleRegistry::new();
        let dir = tempfile::tempdir().unwrap();
        let (path, fd) = hundred_byte_file(dir.path());
        let id = reg.open(&path, fd).unwrap();
        assert_eq!(reg.open(&path, fd), Some(id));
        assert_eq!(reg.fd_from_path(&path), Some(fd));
        assert!(reg.close(fd));
        assert!(reg.is_empty());
        assert!(reg.close(12345));
        assert!(reg.open(&path, -1).is_none());
        close(fd).unwrap();
    }

    #[test]
    fn handle_ids_are_never_reused() {
        let reg = FileHandleRegistry::new();
        let dir = tempfile::tempdir().unwrap();
        let (path, fd) = hundred_byte_file(dir.path());
        let first = reg.open(&path, fd).unwrap();
        assert!(reg.close(fd));
        // Same descriptor number, different handle.
        let second = reg.open(&path, fd).unwrap();
        assert_ne!(first, second);

        let mut table = reg.snapshot();
        table[0].id = HandleId(41);
        reg.replace_with(table);
        assert!(reg.close(fd));
        assert_eq!(reg.open(&path, fd), Some(HandleId(42)));
        close(fd).unwrap();
    }

    #[test]
    fn tracked_close_is_deferred() {
        let reg = FileHandleRegistry::new();
        let dir = tempfile::tempdir().unwrap();
        let (path, fd) = hundred_byte_file(dir.path());
        reg.open(&path, fd).unwrap();
        reg.begin_tracking(1 << 20);

        assert!(!reg.close(fd));
        assert!(reg.get(fd).unwrap().closed);
        assert!(is_open(fd));
        assert_eq!(reg.fd_from_path(&path), None);

        reg.begin_tracking(1 << 20);
        assert!(!is_open(fd));
        assert!(reg.get(fd).is_none());
    }

    #[test]
    fn offset_survives_a_rewind() {
        let reg = FileHandleRegistry::new();
        let dir = tempfile::tempdir().unwrap();
        let (path, fd) = hundred_byte_file(dir.path());
        reg.open(&path, fd).unwrap();
        lseek(fd, 37, Whence::SeekSet).unwrap();

        reg.begin_tracking(1 << 20);
        let table = reg.snapshot();
        assert_eq!(table[0].offset, 37);
        assert_eq!(table[0].size, 100);
        reg.restore();

        lseek(fd, 90, Whence::SeekSet).unwrap();
        reg.close_untracked(&table);
        reg.replace_with(table);
        reg.restore();
        assert_eq!(read_at_current(fd, 3), vec![37, 38, 39]);
        close(fd).unwrap();
    }

    #[test]
    fn closed_file_is_reopened_at_its_number() {
        let reg = FileHandleRegistry::new();
        let dir = tempfile::tempdir().unwrap();
        let (path, fd) = hundred_byte_file(dir.path());
        reg.open(&path, fd).unwrap();
        lseek(fd, 10, Whence::SeekSet).unwrap();
        reg.begin_tracking(1 << 20);
        let table = reg.snapshot();
        reg.restore();

        assert!(!reg.close(fd));
        reg.begin_tracking(1 << 20);
        assert!(!is_open(fd));

        reg.close_untracked(&table);
        reg.replace_with(table);
        reg.restore();
        assert!(is_open(fd));
        assert_eq!(read_at_current(fd, 2), vec![10, 11]);
        close(fd).unwrap();
    }

    #[test]
    fn later_handles_are_closed_on_load() {
        let reg = FileHandleRegistry::new();
        let dir = tempfile::tempdir().unwrap();
        reg.begin_tracking(1 << 20);
        let empty = reg.snapshot();

        let (path, fd) = hundred_byte_file(dir.path());
        reg.open(&path, fd).unwrap();
        reg.close_untracked(&empty);
        assert!(!is_open(fd));
        assert!(reg.is_empty());
    }

    #[test]
    fn pipe_contents_survive_a_rewind() {
        let reg = FileHandleRegistry::new();
        let (r, w) = reg.open_pipe(OFlag::O_CLOEXEC).unwrap();
        let (r, w) = (high_fd(r), high_fd(w));
        // The registry knows the original numbers; move its record along.
        let mut table = reg.snapshot();
        table[0].fds = [r, w];
        reg.replace_with(table);
        assert!(OFlag::from_bits_truncate(fcntl(w, FcntlArg::F_GETFL).unwrap())
            .contains(OFlag::O_NONBLOCK));

        write_all(w, b"hello").unwrap();
        reg.begin_tracking(1 << 20);
        let table = reg.snapshot();
        assert_eq!(table[0].size, 5);
        // A save puts the bytes straight back.
        reg.restore();
        assert_eq!(pipe_backlog(r).unwrap(), 5);

        write_all(w, b" junk").unwrap();
        reg.close_untracked(&table);
        reg.replace_with(table);
        reg.restore();
        assert_eq!(read_at_current(r, 5), b"hello");
        assert_eq!(pipe_backlog(r).unwrap(), 0);
        close(r).unwrap();
        close(w).unwrap();
    }

    #[test]
    fn oversized_pipe_is_left_alone() {
        let reg = FileHandleRegistry::new();
        let (r, w) = reg.open_pipe(OFlag::O_CLOEXEC).unwrap();
        let (r, w) = (high_fd(r), high_fd(w));
        let mut table = reg.snapshot();
        table[0].fds = [r, w];
        reg.replace_with(table);

        write_all(w, &[7u8; 64]).unwrap();
        reg.begin_tracking(16);
        let h = reg.get(r).unwrap();
        assert_eq!(h.size, -1);
        assert_eq!(h.kind, HandleKind::Pipe { flags: OFlag::O_CLOEXEC.bits(), contents: None });
        assert_eq!(pipe_backlog(r).unwrap(), 64);
        close(r).unwrap();
        close(w).unwrap();
    }

    #[test]
    fn scan_finds_unregistered_files() {
        let reg = FileHandleRegistry::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scanned");
        fs::write(&path, b"x").unwrap();
        let fd = fs::File::open(&path).unwrap().into_raw_fd();
        reg.ignore(fd + 1);

        assert!(reg.scan_existing().unwrap() >= 1);
        let h = reg.get(fd).unwrap();
        assert_eq!(h.path(), Some(fs::canonicalize(&path).unwrap().as_path()));
        assert!(!h.tracked);
        close(fd).unwrap();
    }
}
