use super::{
    suspend_slots::{self, handle_suspend_signal, RunState, Slot, ACK, EXITING},
    thread_registry::{Phase, ThreadRegistry},
};
use crate::{
    address_space::memory_range::MemoryRange,
    config::{CheckpointConfig, ThreadScope},
    error::{CheckpointError, Result},
    log::LogLevel::{LogDebug, LogError, LogInfo, LogWarn},
    remote_ptr::RemotePtr,
    savestate::ThreadState,
    sig::Sig,
    util::gettid,
};
use libc::pid_t;
use nix::{
    errno::Errno,
    unistd::getpid,
};
use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    fs, mem, ptr,
    sync::{atomic::Ordering, Arc, Mutex},
    time::{Duration, Instant},
};

/// Stack a suspended thread uses below its signal frame: the handler itself
/// and the semaphore wait.
const STACK_BELOW_FRAME: usize = 16 << 10;
/// The signal frame and the FPU state the kernel saves above it.
const STACK_ABOVE_FRAME: usize = 16 << 10;

lazy_static! {
    /// Signals whose handler is already installed.
    static ref INSTALLED: Mutex<HashSet<i32>> = Mutex::new(HashSet::new());
}

/// Ask every pending suspension wait to give up.
pub fn set_exiting(exiting: bool) {
    EXITING.store(exiting, Ordering::SeqCst);
}

/// What one `suspend_all()` took.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SuspendStats {
    pub suspended: usize,
    /// Threads that took longer than the fast timeout to acknowledge.
    pub excused: usize,
    /// Rounds of signaling newly discovered threads.
    pub rounds: usize,
}

/// Freezes and thaws the threads of the subject from the checkpoint thread.
pub struct ThreadCoordinator {
    threads: Arc<ThreadRegistry>,
    signal: Sig,
    scope: ThreadScope,
    fast_ack_timeout: Duration,
    stall_timeout: Duration,
    wait_slice: Duration,
    /// Threads signaled by the current suspension.
    signaled: BTreeMap<pid_t, &'static Slot>,
    /// Excused threads since creation, for diagnostics.
    excused_total: u64,
}

impl ThreadCoordinator {
    pub fn new(threads: Arc<ThreadRegistry>, config: &CheckpointConfig) -> Result<ThreadCoordinator> {
        suspend_slots::init();
        install_handler(config.suspend_signal)?;
        threads.set_suspend_signal(config.suspend_signal);
        Ok(ThreadCoordinator {
            threads,
            signal: config.suspend_signal,
            scope: config.thread_scope.clone(),
            fast_ack_timeout: config.fast_ack_timeout,
            stall_timeout: config.stall_timeout,
            wait_slice: config.wait_slice,
            signaled: BTreeMap::new(),
            excused_total: 0,
        })
    }

    pub fn excused_total(&self) -> u64 {
        self.excused_total
    }

    pub fn is_suspended(&self) -> bool {
        self.threads.phase() == Phase::Suspended
    }

    fn check_caller(&self) -> Result<()> {
        let tid = gettid();
        if self.threads.checkpoint_tid() != Some(tid) {
            return Err(CheckpointError::NotCheckpointThread(tid));
        }
        Ok(())
    }

    /// Threads that should be frozen right now.
    fn candidates(&self, registered: Vec<pid_t>) -> Vec<pid_t> {
        let me = gettid();
        let mut tids = match self.scope {
            ThreadScope::Registered => registered,
            ThreadScope::WholeProcess => process_tids(),
        };
        tids.retain(|&tid| tid != me && !self.signaled.contains_key(&tid));
        tids
    }

    /// Freeze every thread in scope. Returns once a re-scan finds no new
    /// thread and every signaled thread has acknowledged.
    ///
    /// Threads stop wherever the signal finds them, possibly holding the
    /// allocator's arena lock or a stdio lock. Until `resume_all()`, the
    /// calling thread must not depend on locks a frozen thread may hold:
    /// log output is held back in memory (see `log::hold_output`), but heap
    /// allocation still goes through the process allocator. A subject thread
    /// frozen inside `malloc` on the checkpoint thread's arena therefore
    /// deadlocks the save; such threads should block the suspend signal
    /// around allocation-heavy code or share no arena with the checkpoint
    /// thread.
    pub fn suspend_all(&mut self) -> Result<SuspendStats> {
        self.check_caller()?;
        self.threads.set_phase(Phase::Suspending);
        match self.suspend_rounds() {
            Ok(stats) => {
                log!(
                    LogDebug,
                    "Suspended {} thread(s) in {} round(s), {} excused",
                    stats.suspended,
                    stats.rounds,
                    stats.excused
                );
                Ok(stats)
            }
            Err(e) => {
                log!(LogWarn, "Suspension failed: {}", e);
                self.cancel_pending();
                if let Err(resume_err) = self.resume_all() {
                    log!(LogError, "Could not resume after failed suspension: {}", resume_err);
                }
                Err(e)
            }
        }
    }

    fn suspend_rounds(&mut self) -> Result<SuspendStats> {
        let mut stats = SuspendStats::default();
        loop {
            let registered = self.threads.lock().guard.subject_tids();
            let new = self.candidates(registered);
            if new.is_empty() {
                // The last look happens under the registry lock, together
                // with the phase switch, so no thread can slip in between.
                let mut locked = self.threads.lock();
                let registered = locked.guard.subject_tids();
                if self.candidates(registered).is_empty() {
                    locked.guard.phase = Phase::Suspended;
                    for tid in self.signaled.keys() {
                        if let Some(r) = locked.guard.threads.get_mut(tid) {
                            r.suspend_count += 1;
                        }
                    }
                    stats.suspended = self.signaled.len();
                    return Ok(stats);
                }
                continue;
            }

            stats.rounds += 1;
            for tid in new {
                self.signal_thread(tid)?;
            }
            stats.excused += self.wait_for_acks()?;
        }
    }

    fn signal_thread(&mut self, tid: pid_t) -> Result<()> {
        let slot = match suspend_slots::claim(tid) {
            Some(slot) => slot,
            None => {
                return Err(CheckpointError::Unsupported(format!(
                    "more than {} threads",
                    suspend_slots::MAX_SLOTS
                )))
            }
        };
        slot.set_state(RunState::Signaled);
        match tgkill(tid, self.signal.as_raw()) {
            Ok(()) => {
                log!(LogDebug, "Signaled thread {} with {}", tid, self.signal);
                self.signaled.insert(tid, slot);
            }
            Err(Errno::ESRCH) => {
                log!(LogDebug, "Thread {} is gone", tid);
                slot.free();
            }
            Err(e) => {
                slot.free();
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Drop threads that died after being signaled.
    fn drop_dead(&mut self) {
        let dead: Vec<pid_t> = self
            .signaled
            .keys()
            .copied()
            .filter(|&tid| tgkill(tid, 0) == Err(Errno::ESRCH))
            .collect();
        for tid in dead {
            log!(LogInfo, "Thread {} died while suspended", tid);
            if let Some(slot) = self.signaled.remove(&tid) {
                slot.free();
            }
        }
    }

    fn pending(&self, state: RunState) -> Vec<pid_t> {
        self.signaled
            .iter()
            .filter(|(_, slot)| slot.state() != state)
            .map(|(&tid, _)| tid)
            .collect()
    }

    /// Sliced wait until every signaled thread is `Suspended`. Returns the
    /// number of threads excused on the way.
    fn wait_for_acks(&mut self) -> Result<usize> {
        let start = Instant::now();
        let mut excused: BTreeSet<pid_t> = BTreeSet::new();
        loop {
            if EXITING.load(Ordering::SeqCst) {
                return Err(CheckpointError::Exiting);
            }
            let pending = self.pending(RunState::Suspended);
            if pending.is_empty() {
                return Ok(excused.len());
            }
            let elapsed = start.elapsed();
            if elapsed >= self.fast_ack_timeout {
                self.drop_dead();
                for tid in self.pending(RunState::Suspended) {
                    if excused.insert(tid) {
                        self.excused_total += 1;
                        log!(
                            LogWarn,
                            "Thread {} has not acknowledged after {:?}, still waiting",
                            tid,
                            elapsed
                        );
                    }
                }
            }
            if elapsed >= self.stall_timeout {
                let stalled = self.pending(RunState::Suspended);
                if !stalled.is_empty() {
                    return Err(CheckpointError::SuspendStalled(stalled));
                }
            }
            ACK.timed_wait(self.wait_slice);
        }
    }

    /// Withdraw outstanding signals. A thread that gets there first counts
    /// as suspended.
    fn cancel_pending(&mut self) {
        let cancelled: Vec<pid_t> = self
            .signaled
            .iter()
            .filter(|(_, slot)| slot.transition(RunState::Signaled, RunState::Running))
            .map(|(&tid, _)| tid)
            .collect();
        for tid in cancelled {
            if let Some(slot) = self.signaled.remove(&tid) {
                slot.free();
            }
        }
    }

    /// Signal masks and machine contexts of the frozen threads.
    pub fn thread_states(&self) -> Vec<ThreadState> {
        let mut states: Vec<ThreadState> = self
            .signaled
            .iter()
            .filter(|(_, slot)| slot.state() == RunState::Suspended)
            .map(|(&tid, slot)| ThreadState {
                tid,
                is_checkpoint_thread: false,
                sigmask: slot.sigmask_bytes(),
                registers: slot.register_bytes(),
            })
            .collect();
        states.push(ThreadState {
            tid: gettid(),
            is_checkpoint_thread: true,
            sigmask: current_sigmask(),
            registers: Vec::new(),
        });
        states
    }

    /// Memory the frozen threads are parked in: the slot table and the stack
    /// around every signal frame. Overwriting any of it breaks `resume_all()`.
    pub fn working_set(&self) -> Vec<MemoryRange> {
        let (table, len) = suspend_slots::table();
        let mut ranges = vec![MemoryRange::new_range(RemotePtr::from(table), len)];
        for slot in self.signaled.values() {
            if let Some(frame) = slot.frame() {
                let frame = RemotePtr::from(frame).floor_page();
                let below = RemotePtr::from(frame.as_usize().saturating_sub(STACK_BELOW_FRAME));
                ranges.push(MemoryRange::from_range(below, frame + STACK_ABOVE_FRAME));
            }
        }
        ranges
    }

    /// Threads that are frozen now and appear in `states` get their saved
    /// signal mask back when they resume. Returns how many matched.
    pub fn stage_sigmasks(&self, states: &[ThreadState]) -> usize {
        states
            .iter()
            .filter(|s| !s.is_checkpoint_thread)
            .filter(|s| match self.signaled.get(&s.tid) {
                Some(slot) => slot.stage_sigmask(&s.sigmask),
                None => false,
            })
            .count()
    }

    /// Release every frozen thread and wait for each to run again.
    pub fn resume_all(&mut self) -> Result<()> {
        self.threads.set_phase(Phase::Resuming);
        for slot in self.signaled.values() {
            slot.release_thread();
        }

        let start = Instant::now();
        let mut result = Ok(());
        loop {
            let pending = self.pending(RunState::Running);
            if pending.is_empty() {
                break;
            }
            if start.elapsed() >= self.fast_ack_timeout {
                self.drop_dead();
            }
            if start.elapsed() >= self.stall_timeout {
                // Their slots stay claimed: the handlers may still wake up.
                log!(LogError, "Threads {:?} did not resume", pending);
                for tid in &pending {
                    self.signaled.remove(tid);
                }
                result = Err(CheckpointError::SuspendStalled(pending));
                break;
            }
            ACK.timed_wait(self.wait_slice);
        }

        for (_, slot) in mem::take(&mut self.signaled) {
            slot.free();
        }
        self.threads.set_phase(Phase::Idle);
        result
    }
}

impl Drop for ThreadCoordinator {
    fn drop(&mut self) {
        if !self.signaled.is_empty() {
            log!(LogWarn, "Coordinator dropped with threads suspended, resuming them");
            if let Err(e) = self.resume_all() {
                log!(LogError, "{}", e);
            }
        }
    }
}

fn tgkill(tid: pid_t, sig: i32) -> std::result::Result<(), Errno> {
    let ret = unsafe { libc::syscall(libc::SYS_tgkill, getpid().as_raw(), tid, sig) };
    Errno::result(ret).map(drop)
}

fn process_tids() -> Vec<pid_t> {
    match fs::read_dir("/proc/self/task") {
        Ok(dir) => dir
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().and_then(|s| s.parse().ok()))
            .collect(),
        Err(e) => {
            log!(LogWarn, "Cannot list /proc/self/task: {}", e);
            Vec::new()
        }
    }
}

fn current_sigmask() -> Vec<u8> {
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::pthread_sigmask(libc::SIG_BLOCK, ptr::null(), &mut set);
        std::slice::from_raw_parts(
            &set as *const libc::sigset_t as *const u8,
            mem::size_of::<libc::sigset_t>(),
        )
        .to_vec()
    }
}

fn install_handler(sig: Sig) -> Result<()> {
    let mut installed = INSTALLED
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    if installed.contains(&sig.as_raw()) {
        return Ok(());
    }
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = handle_suspend_signal as *const () as usize;
        sa.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        Errno::result(libc::sigaction(sig.as_raw(), &sa, ptr::null_mut()))?;
    }
    installed.insert(sig.as_raw());
    log!(LogDebug, "Installed suspend handler for {}", sig);
    Ok(())
}
