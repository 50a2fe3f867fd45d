//! In-process savestate engine: freeze every thread of the running process,
//! snapshot its memory and descriptors incrementally, and rewind to any saved
//! generation later.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate static_assertions;

#[macro_use]
pub mod log;
pub mod address_space;
pub mod checkpoint;
pub mod commands;
pub mod config;
pub mod dirty_pages;
pub mod error;
pub mod file_handles;
pub mod kernel_metadata;
pub mod page_store;
pub mod remote_ptr;
pub mod savestate;
pub mod scoped_fd;
pub mod sig;
pub mod threads;
pub mod util;

pub use checkpoint::{Checkpointer, SizeInfo};
pub use config::CheckpointConfig;
pub use error::{CheckpointError, Result};
