//! State shared between the coordinator and the suspend signal handler.
//!
//! Everything here is reachable from a signal handler, so it is allocated up
//! front and only touched through atomics and semaphores once a thread has
//! been signaled.

use super::semaphore::Semaphore;
use crate::util::gettid;
use libc::{c_int, c_void, pid_t};
use std::{
    cell::UnsafeCell,
    mem, ptr, slice,
    sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicUsize, Ordering},
};

/// Threads that can be frozen at the same time.
pub const MAX_SLOTS: usize = 1024;

/// Per-thread run state.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RunState {
    Running = 0,
    Signaled = 1,
    Suspended = 2,
    Resuming = 3,
}

impl RunState {
    fn from_u8(v: u8) -> RunState {
        match v {
            1 => RunState::Signaled,
            2 => RunState::Suspended,
            3 => RunState::Resuming,
            _ => RunState::Running,
        }
    }
}

pub struct Slot {
    /// 0 when free.
    tid: AtomicI32,
    state: AtomicU8,
    resume: Semaphore,
    sigmask: UnsafeCell<libc::sigset_t>,
    mcontext: UnsafeCell<libc::mcontext_t>,
    /// The handler installs `sigmask` as the thread's mask when it returns.
    apply_sigmask: AtomicBool,
    /// Address of the kernel's signal frame on the thread's stack, 0 if unknown.
    frame: AtomicUsize,
}

// The cells are written by the owning thread's handler before it publishes
// `Suspended`, and read by the coordinator only after observing it.
unsafe impl Sync for Slot {}

impl Slot {
    fn new() -> Slot {
        Slot {
            tid: AtomicI32::new(0),
            state: AtomicU8::new(RunState::Running as u8),
            resume: Semaphore::new(0),
            sigmask: UnsafeCell::new(unsafe { mem::zeroed() }),
            mcontext: UnsafeCell::new(unsafe { mem::zeroed() }),
            apply_sigmask: AtomicBool::new(false),
            frame: AtomicUsize::new(0),
        }
    }

    pub fn tid(&self) -> pid_t {
        self.tid.load(Ordering::Acquire)
    }

    pub fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: RunState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Atomically move from `from` to `to`. Returns whether it happened.
    pub fn transition(&self, from: RunState, to: RunState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Let a `Suspended` thread go.
    pub fn release_thread(&self) {
        if self.transition(RunState::Suspended, RunState::Resuming) {
            self.resume.post();
        }
    }

    /// The blocked signal mask the thread had when it was interrupted. Only
    /// meaningful while it is suspended.
    pub fn sigmask_bytes(&self) -> Vec<u8> {
        unsafe { as_bytes(&*self.sigmask.get()).to_vec() }
    }

    /// The machine context of the interrupted thread.
    pub fn register_bytes(&self) -> Vec<u8> {
        unsafe { as_bytes(&*self.mcontext.get()).to_vec() }
    }

    /// Have a suspended thread come back with the blocked mask `bytes`
    /// instead of the one it was interrupted with.
    pub fn stage_sigmask(&self, bytes: &[u8]) -> bool {
        if self.state() != RunState::Suspended || bytes.len() != mem::size_of::<libc::sigset_t>() {
            return false;
        }
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.sigmask.get() as *mut u8, bytes.len());
        }
        self.apply_sigmask.store(true, Ordering::Release);
        true
    }

    /// Where the suspended thread's signal frame lives. The handler and the
    /// semaphore wait run just below it.
    pub fn frame(&self) -> Option<usize> {
        match self.frame.load(Ordering::Acquire) {
            0 => None,
            addr => Some(addr),
        }
    }

    pub fn free(&self) {
        self.apply_sigmask.store(false, Ordering::Release);
        self.frame.store(0, Ordering::Release);
        self.set_state(RunState::Running);
        self.tid.store(0, Ordering::Release);
    }
}

unsafe fn as_bytes<T>(v: &T) -> &[u8] {
    slice::from_raw_parts(v as *const T as *const u8, mem::size_of::<T>())
}

lazy_static! {
    static ref SLOTS: Vec<Slot> = (0..MAX_SLOTS).map(|_| Slot::new()).collect();
    /// Posted by handlers whenever a thread reaches `Suspended` or `Running`.
    /// Shared by all coordinators; waiters re-check slot states after every
    /// wakeup or timeout, so a stolen post only costs one wait slice.
    pub static ref ACK: Semaphore = Semaphore::new(0);
}

/// Set when the process is on its way out; suspension waits give up.
pub static EXITING: AtomicBool = AtomicBool::new(false);

/// Start and length of the slot table.
pub fn table() -> (usize, usize) {
    (SLOTS.as_ptr() as usize, SLOTS.len() * mem::size_of::<Slot>())
}

/// Make sure the tables exist before any handler can run.
pub fn init() {
    lazy_static::initialize(&SLOTS);
    lazy_static::initialize(&ACK);
}

/// The slot of `tid`, claiming a free one if needed. `None` when the table is
/// full.
pub fn claim(tid: pid_t) -> Option<&'static Slot> {
    if let Some(slot) = find(tid) {
        return Some(slot);
    }
    SLOTS.iter().find(|s| {
        s.tid
            .compare_exchange(0, tid, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    })
}

/// Async-signal-safe.
pub fn find(tid: pid_t) -> Option<&'static Slot> {
    SLOTS.iter().find(|s| s.tid() == tid)
}

/// The suspend signal handler.
pub extern "C" fn handle_suspend_signal(_sig: c_int, _info: *mut libc::siginfo_t, ctx: *mut c_void) {
    let saved_errno = unsafe { *libc::__errno_location() };
    let slot = match find(gettid()) {
        Some(slot) => slot,
        None => return,
    };
    if slot.state() != RunState::Signaled {
        // Late delivery after the coordinator gave up on us.
        return;
    }
    if !ctx.is_null() {
        unsafe {
            let uc = ctx as *const libc::ucontext_t;
            ptr::copy_nonoverlapping(&(*uc).uc_sigmask, slot.sigmask.get(), 1);
            ptr::copy_nonoverlapping(&(*uc).uc_mcontext, slot.mcontext.get(), 1);
        }
        slot.frame.store(ctx as usize, Ordering::Release);
    }
    if slot.transition(RunState::Signaled, RunState::Suspended) {
        ACK.post();
        while slot.state() != RunState::Resuming {
            slot.resume.wait();
        }
        if slot.apply_sigmask.swap(false, Ordering::AcqRel) && !ctx.is_null() {
            // The kernel installs uc_sigmask on return from the handler.
            unsafe {
                let uc = ctx as *mut libc::ucontext_t;
                ptr::copy_nonoverlapping(slot.sigmask.get(), &mut (*uc).uc_sigmask, 1);
            }
        }
        slot.set_state(RunState::Running);
        ACK.post();
    }
    unsafe { *libc::__errno_location() = saved_errno };
}
