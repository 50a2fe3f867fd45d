use nix::errno::Errno;
use std::{cell::UnsafeCell, mem, time::Duration};

/// An unnamed POSIX semaphore. `post()` may be called from a signal handler.
///
/// The `sem_t` lives on the heap so it never moves after `sem_init`.
pub struct Semaphore {
    sem: Box<UnsafeCell<libc::sem_t>>,
}

unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    pub fn new(value: u32) -> Semaphore {
        let sem = Box::new(UnsafeCell::new(unsafe { mem::zeroed::<libc::sem_t>() }));
        // Cannot fail for a process private semaphore with a small value.
        unsafe { libc::sem_init(sem.get(), 0, value) };
        Semaphore { sem }
    }

    pub fn post(&self) {
        unsafe { libc::sem_post(self.sem.get()) };
    }

    /// Wait until posted, restarting after signal interruptions.
    pub fn wait(&self) {
        loop {
            let ret = unsafe { libc::sem_wait(self.sem.get()) };
            if ret == 0 || Errno::last() != Errno::EINTR {
                return;
            }
        }
    }

    pub fn try_wait(&self) -> bool {
        unsafe { libc::sem_trywait(self.sem.get()) == 0 }
    }

    /// Wait at most `timeout`. Returns whether the semaphore was taken.
    pub fn timed_wait(&self, timeout: Duration) -> bool {
        let mut deadline = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut deadline) };
        let nsec = deadline.tv_nsec as u64 + timeout.subsec_nanos() as u64;
        deadline.tv_sec += timeout.as_secs() as libc::time_t + (nsec / 1_000_000_000) as libc::time_t;
        deadline.tv_nsec = (nsec % 1_000_000_000) as libc::c_long;
        loop {
            let ret = unsafe { libc::sem_timedwait(self.sem.get(), &deadline) };
            if ret == 0 {
                return true;
            }
            if Errno::last() != Errno::EINTR {
                return false;
            }
        }
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe { libc::sem_destroy(self.sem.get()) };
    }
}
