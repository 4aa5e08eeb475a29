//! Kernel primitive adapter.
//!
//! The library is written against a small set of host objects: waitable
//! events (manual- and auto-reset), counting semaphores, critical sections,
//! atomic CAS, a real-time clock, and a thread-spawn primitive. This module
//! supplies them on top of `parking_lot` and `std::thread`, together with:
//!
//! - [`Alert`], the "wait for this object or the thread's cancel event"
//!   pairing used by every cancellation point;
//! - per-process and per-thread creation accounting, so callers can assert
//!   that a code path allocated no kernel object;
//! - a thread-local fault-injection hook that makes the next creations fail,
//!   used to exercise rollback paths.

mod alert;
pub mod clock;
mod event;
mod semaphore;
mod slot;

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

pub use alert::{Alert, Waitable};
pub use event::Event;
pub use semaphore::Semaphore;
pub use slot::KernelSlot;

use crate::error::{Error, Result};
use crate::trace::{self, LogLevel};

/// Outcome of a blocking wait on a kernel object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The object was signaled (a unit was consumed for semaphores and
    /// auto-reset events).
    Signaled,
    /// The absolute deadline passed first.
    TimedOut,
    /// The waiter's [`Alert`] was raised first.
    Alerted,
}

/// Host mutual-exclusion primitive.
pub type CriticalSection<T> = parking_lot::Mutex<T>;

/// Const constructor for statically allocated critical sections.
#[must_use]
pub const fn critical_section<T>(value: T) -> CriticalSection<T> {
    parking_lot::const_mutex(value)
}

// ---------------------------------------------------------------------------
// Object accounting
// ---------------------------------------------------------------------------

static CREATED: AtomicU64 = AtomicU64::new(0);
static CLOSED: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static CREATED_HERE: Cell<u64> = const { Cell::new(0) };
    /// (creations to let through, creations to fail after that)
    static FAIL_PLAN: Cell<(u32, u32)> = const { Cell::new((0, 0)) };
}

/// Process-wide kernel object counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KernelStats {
    pub created: u64,
    pub closed: u64,
}

impl KernelStats {
    /// Objects created and not yet closed.
    #[must_use]
    pub const fn live(self) -> u64 {
        self.created.saturating_sub(self.closed)
    }
}

#[must_use]
pub fn stats() -> KernelStats {
    KernelStats {
        created: CREATED.load(Ordering::Relaxed),
        closed: CLOSED.load(Ordering::Relaxed),
    }
}

/// Number of kernel objects created by the calling thread so far.
#[must_use]
pub fn created_by_current_thread() -> u64 {
    CREATED_HERE.with(Cell::get)
}

/// Make the calling thread's next `count` kernel creations fail with `EAGAIN`.
#[doc(hidden)]
pub fn fail_next_creations_for_tests(count: u32) {
    fail_creations_for_tests(0, count);
}

/// Let `skip` creations succeed, then fail the following `count`.
#[doc(hidden)]
pub fn fail_creations_for_tests(skip: u32, count: u32) {
    FAIL_PLAN.with(|plan| plan.set((skip, count)));
}

fn check_injected(kind: &'static str) -> Result<()> {
    let injected = FAIL_PLAN
        .try_with(|plan| match plan.get() {
            (_, 0) => false,
            (0, count) => {
                plan.set((0, count - 1));
                true
            }
            (skip, count) => {
                plan.set((skip - 1, count));
                false
            }
        })
        .unwrap_or(false);
    if injected {
        trace::event(LogLevel::Warn, "kernel_create_failed", |r| {
            r.with_object(kind).with_errno(Error::Again.errno())
        });
        return Err(Error::Again);
    }
    Ok(())
}

fn admit(kind: &'static str) -> Result<()> {
    check_injected(kind)?;
    CREATED.fetch_add(1, Ordering::Relaxed);
    let _ = CREATED_HERE.try_with(|c| c.set(c.get() + 1));
    Ok(())
}

fn release() {
    CLOSED.fetch_add(1, Ordering::Relaxed);
}

// ---------------------------------------------------------------------------
// Threads and processors
// ---------------------------------------------------------------------------

/// Starts a host thread running `body`.
///
/// `stack_size` of 0 selects the host default.
pub fn spawn_host<F>(name: Option<String>, stack_size: usize, body: F) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    check_injected("thread")?;
    let mut builder = std::thread::Builder::new();
    if let Some(name) = name {
        builder = builder.name(name);
    }
    if stack_size > 0 {
        builder = builder.stack_size(stack_size);
    }
    match builder.spawn(body) {
        Ok(_detached) => Ok(()),
        Err(_) => Err(Error::Again),
    }
}

/// Yields the rest of the caller's time slice.
#[inline]
pub fn yield_now() {
    std::thread::yield_now();
}

/// Processors the host reports as available to this process.
#[must_use]
pub fn host_processors() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}
