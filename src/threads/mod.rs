//! Freezing the subject's threads.
//!
//! Every thread but the checkpoint thread is sent the suspend signal. Its
//! handler records the interrupted context, acknowledges and sleeps on a
//! per-thread semaphore until it is released. Everything else happens on the
//! checkpoint thread.

pub mod coordinator;
pub mod semaphore;
pub mod suspend_slots;
pub mod thread_registry;

pub use coordinator::{set_exiting, SuspendStats, ThreadCoordinator};
pub use thread_registry::{Phase, RegisteredThread, ThreadRecord, ThreadRegistry};
