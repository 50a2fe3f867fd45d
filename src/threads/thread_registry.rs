use crate::{
    error::{CheckpointError, Result},
    log::LogLevel::LogDebug,
    sig::{AtomicSig, Sig, SignalBlock, SIGXFSZ},
    util::gettid,
};
use libc::pid_t;
use std::{
    collections::BTreeMap,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
};

/// Global suspension phase.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Phase {
    Idle,
    Suspending,
    Suspended,
    Resuming,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ThreadRecord {
    pub tid: pid_t,
    pub is_checkpoint_thread: bool,
    /// How often the thread has been frozen.
    pub suspend_count: u64,
}

pub(crate) struct RegistryState {
    pub threads: BTreeMap<pid_t, ThreadRecord>,
    pub phase: Phase,
}

impl RegistryState {
    pub fn checkpoint_tid(&self) -> Option<pid_t> {
        self.threads
            .values()
            .find(|r| r.is_checkpoint_thread)
            .map(|r| r.tid)
    }

    /// Threads that have to be frozen.
    pub fn subject_tids(&self) -> Vec<pid_t> {
        self.threads
            .values()
            .filter(|r| !r.is_checkpoint_thread)
            .map(|r| r.tid)
            .collect()
    }
}

pub(crate) struct LockedRegistry<'a> {
    pub guard: MutexGuard<'a, RegistryState>,
    _block: SignalBlock,
}

/// Threads of the subject, and the checkpoint thread among them.
///
/// Shares its mutex and condition variable with the coordinator: a thread
/// that registers while the subject is suspended waits until everything is
/// running again.
pub struct ThreadRegistry {
    suspend_signal: AtomicSig,
    state: Mutex<RegistryState>,
    cond: Condvar,
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadRegistry {
    pub fn new() -> ThreadRegistry {
        ThreadRegistry {
            suspend_signal: AtomicSig::new(SIGXFSZ),
            state: Mutex::new(RegistryState {
                threads: BTreeMap::new(),
                phase: Phase::Idle,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn set_suspend_signal(&self, sig: Sig) {
        self.suspend_signal.set(sig);
    }

    pub(crate) fn lock(&self) -> LockedRegistry<'_> {
        let block = SignalBlock::new(self.suspend_signal.get());
        let guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        LockedRegistry {
            guard,
            _block: block,
        }
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        let mut locked = self.lock();
        locked.guard.phase = phase;
        if phase == Phase::Idle {
            self.cond.notify_all();
        }
    }

    /// Add the calling thread. Blocks while the subject is suspended.
    pub fn register(self: &Arc<Self>) -> RegisteredThread {
        self.insert(false)
            .unwrap_or_else(|_| unreachable!("subject threads never conflict"))
    }

    /// Add the calling thread as the one that drives saves and loads.
    pub fn register_checkpoint_thread(self: &Arc<Self>) -> Result<RegisteredThread> {
        self.insert(true)
    }

    fn insert(self: &Arc<Self>, is_checkpoint_thread: bool) -> Result<RegisteredThread> {
        let tid = gettid();
        let mut locked = self.lock();
        while matches!(locked.guard.phase, Phase::Suspended | Phase::Resuming) {
            log!(LogDebug, "Thread {} waits for the subject to resume", tid);
            locked.guard = self
                .cond
                .wait(locked.guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if is_checkpoint_thread {
            match locked.guard.checkpoint_tid() {
                Some(other) if other != tid => {
                    return Err(CheckpointError::CheckpointThreadTaken(other))
                }
                _ => (),
            }
        }
        let record = locked.guard.threads.entry(tid).or_insert(ThreadRecord {
            tid,
            is_checkpoint_thread,
            suspend_count: 0,
        });
        record.is_checkpoint_thread |= is_checkpoint_thread;
        log!(LogDebug, "Registered thread {}", tid);
        Ok(RegisteredThread {
            registry: self.clone(),
            tid,
        })
    }

    pub fn unregister(&self, tid: pid_t) {
        let mut locked = self.lock();
        if locked.guard.threads.remove(&tid).is_some() {
            log!(LogDebug, "Unregistered thread {}", tid);
        }
    }

    pub fn checkpoint_tid(&self) -> Option<pid_t> {
        self.lock().guard.checkpoint_tid()
    }

    pub fn phase(&self) -> Phase {
        self.lock().guard.phase
    }

    pub fn records(&self) -> Vec<ThreadRecord> {
        self.lock().guard.threads.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().guard.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Unregisters its thread when dropped.
pub struct RegisteredThread {
    registry: Arc<ThreadRegistry>,
    tid: pid_t,
}

impl RegisteredThread {
    pub fn tid(&self) -> pid_t {
        self.tid
    }
}

impl Drop for RegisteredThread {
    fn drop(&mut self) {
        self.registry.unregister(self.tid);
    }
}
