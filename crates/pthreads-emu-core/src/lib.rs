//! # pthreads-emu-core
//!
//! POSIX threads synchronisation for a host that only offers primitive
//! kernel objects: events, counting semaphores and critical sections.
//!
//! Every primitive is available twice: as a typed object whose methods
//! return [`error::Result`], and as a `pthread_*` / `sem_*` free function
//! returning an errno value. Only the free functions turn a cancellation
//! into thread exit. No `unsafe` code is permitted outside the MCS queue
//! lock.

#![deny(unsafe_code)]

pub mod config;
pub mod errno;
pub mod error;
pub mod kernel;
pub mod pthread;
pub mod sched;
pub mod semaphore;
pub mod time;
pub mod trace;

pub use error::{Error, Result};
