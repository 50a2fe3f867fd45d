//! Threads the program never registered are frozen when the scope is the
//! whole process. Kept in its own test binary: every other thread of the
//! process, the harness included, gets suspended.

use rewind::{
    config::ThreadScope,
    threads::{Phase, ThreadCoordinator, ThreadRegistry},
    CheckpointConfig,
};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

fn counters(workers: &[(Arc<AtomicU64>, thread::JoinHandle<()>)]) -> Vec<u64> {
    workers.iter().map(|(c, _)| c.load(Ordering::SeqCst)).collect()
}

#[test]
fn unregistered_threads_are_frozen_and_thawed() {
    let stop = Arc::new(AtomicBool::new(false));
    let workers: Vec<(Arc<AtomicU64>, thread::JoinHandle<()>)> = (0..3)
        .map(|_| {
            let count = Arc::new(AtomicU64::new(0));
            let (c, s) = (count.clone(), stop.clone());
            let handle = thread::spawn(move || {
                while !s.load(Ordering::SeqCst) {
                    c.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_micros(200));
                }
            });
            (count, handle)
        })
        .collect();
    while counters(&workers).iter().any(|&n| n == 0) {
        thread::yield_now();
    }

    let registry = Arc::new(ThreadRegistry::new());
    let _me = registry.register_checkpoint_thread().unwrap();
    let config = CheckpointConfig {
        thread_scope: ThreadScope::WholeProcess,
        ..Default::default()
    };
    let mut coordinator = ThreadCoordinator::new(registry.clone(), &config).unwrap();

    let stats = coordinator.suspend_all().unwrap();
    assert!(stats.suspended >= workers.len(), "{:?}", stats);
    assert_eq!(registry.phase(), Phase::Suspended);
    let frozen = counters(&workers);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(counters(&workers), frozen);

    coordinator.resume_all().unwrap();
    assert_eq!(registry.phase(), Phase::Idle);
    let start = Instant::now();
    while counters(&workers).iter().zip(&frozen).any(|(now, then)| now == then)
        && start.elapsed() < Duration::from_secs(2)
    {
        thread::sleep(Duration::from_millis(1));
    }
    for (now, then) in counters(&workers).iter().zip(&frozen) {
        assert!(now > then);
    }

    stop.store(true, Ordering::SeqCst);
    for (_, handle) in workers {
        handle.join().unwrap();
    }
}
