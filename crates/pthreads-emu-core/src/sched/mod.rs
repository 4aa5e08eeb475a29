//! Scheduling helpers (`<sched.h>` plus the `_np` extensions).

use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, SystemTime};

use libc::{c_int, timespec};

use crate::config;
use crate::error::{Error, Result, to_errno};
use crate::kernel::{self, Event, WaitStatus};
use crate::pthread::cancel::CancelPoint;
use crate::pthread::unwind;
use crate::time::interval_from_timespec;

/// Processors available to this process, honouring `PTHREADS_EMU_CPUS`.
#[must_use]
pub fn processors() -> usize {
    config::processor_override().unwrap_or_else(kernel::host_processors)
}

/// Sleep for `interval`. A cancellation point.
pub fn delay(interval: Duration) -> Result<()> {
    let point = CancelPoint::enter()?;
    if interval.is_zero() {
        kernel::yield_now();
        return Ok(());
    }
    let deadline = SystemTime::now()
        .checked_add(interval)
        .ok_or(Error::Invalid)?;
    let never = Event::new(true, false)?;
    match never.wait(Some(deadline), point.alert()) {
        WaitStatus::Alerted => Err(point.interrupted()),
        WaitStatus::Signaled | WaitStatus::TimedOut => Ok(()),
    }
}

static CONCURRENCY: AtomicI32 = AtomicI32::new(0);

/// Concurrency hint; recorded but otherwise ignored.
#[must_use]
pub fn concurrency() -> i32 {
    CONCURRENCY.load(Ordering::Relaxed)
}

pub fn set_concurrency(level: i32) -> Result<()> {
    if level < 0 {
        return Err(Error::Invalid);
    }
    CONCURRENCY.store(level, Ordering::Relaxed);
    Ok(())
}

// ---------------------------------------------------------------------------
// POSIX surface
// ---------------------------------------------------------------------------

pub fn sched_yield() -> c_int {
    kernel::yield_now();
    0
}

pub fn pthread_num_processors_np() -> c_int {
    c_int::try_from(processors()).unwrap_or(c_int::MAX)
}

pub fn pthread_delay_np(interval: &timespec) -> c_int {
    unwind::lower(interval_from_timespec(interval).and_then(delay))
}

pub fn pthread_getconcurrency() -> c_int {
    concurrency()
}

pub fn pthread_setconcurrency(level: c_int) -> c_int {
    to_errno(set_concurrency(level))
}
