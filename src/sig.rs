use crate::kernel_metadata::signal_name;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::{
    convert::TryFrom,
    fmt::{self, Display, Formatter},
    mem, ptr,
    sync::atomic::{AtomicI32, Ordering},
};

pub const SIGUSR1: Sig = Sig(libc::SIGUSR1);
pub const SIGUSR2: Sig = Sig(libc::SIGUSR2);
pub const SIGXCPU: Sig = Sig(libc::SIGXCPU);
pub const SIGXFSZ: Sig = Sig(libc::SIGXFSZ);
pub const SIGPWR: Sig = Sig(libc::SIGPWR);
pub const SIGSYS: Sig = Sig(libc::SIGSYS);

/// A signal number. Realtime signals are allowed, which is why this is not
/// simply a `nix::sys::signal::Signal`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Sig(i32);

impl Sig {
    pub fn as_str(&self) -> String {
        signal_name(self.0)
    }

    pub fn as_raw(self) -> i32 {
        self.0
    }

    pub fn is_realtime(self) -> bool {
        libc::SIGRTMIN() <= self.0 && self.0 <= libc::SIGRTMAX()
    }

    /// `None` for realtime signals, which nix does not model.
    pub fn as_nix_signal(&self) -> Option<Signal> {
        Signal::try_from(self.0).ok()
    }
}

impl TryFrom<i32> for Sig {
    type Error = String;

    fn try_from(sig: i32) -> Result<Self, Self::Error> {
        if sig > 0 && sig <= libc::SIGRTMAX() {
            Ok(Sig(sig))
        } else {
            Err(format!("Invalid signal `{}`", sig))
        }
    }
}

impl Display for Sig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Blocks a signal in the calling thread until dropped.
///
/// Code that takes a lock the checkpoint thread also needs holds one of these
/// for the suspend signal, so it is never frozen with the lock held.
pub struct SignalBlock {
    old: libc::sigset_t,
}

impl SignalBlock {
    pub fn new(sig: Sig) -> SignalBlock {
        unsafe {
            let mut set: libc::sigset_t = mem::zeroed();
            let mut old: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, sig.as_raw());
            libc::pthread_sigmask(libc::SIG_BLOCK, &set, &mut old);
            SignalBlock { old }
        }
    }
}

impl Drop for SignalBlock {
    fn drop(&mut self) {
        unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, &self.old, ptr::null_mut()) };
    }
}

/// A signal that can be changed after construction of whatever owns it.
pub struct AtomicSig(AtomicI32);

impl AtomicSig {
    pub fn new(sig: Sig) -> AtomicSig {
        AtomicSig(AtomicI32::new(sig.0))
    }

    pub fn get(&self) -> Sig {
        Sig(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, sig: Sig) {
        self.0.store(sig.0, Ordering::Relaxed)
    }
}
