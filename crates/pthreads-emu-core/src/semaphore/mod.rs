//! POSIX unnamed semaphores (`<semaphore.h>`).
//!
//! A thin validity layer over the kernel counting semaphore. Waits are
//! cancellation points. The POSIX surface follows the `sem_*` convention of
//! returning -1 and setting `errno` on failure.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::SystemTime;

use libc::{c_int, timespec};

use crate::errno::set_errno;
use crate::error::{Error, Result};
use crate::kernel::{KernelSlot, Semaphore, WaitStatus};
use crate::pthread::cancel::CancelPoint;
use crate::pthread::static_init::{Lifecycle, Phase};
use crate::pthread::unwind;
use crate::time::deadline_from_timespec;

/// Largest value a semaphore can hold.
pub const SEM_VALUE_MAX: u32 = i32::MAX as u32;

/// Unnamed semaphore.
pub struct Sem {
    life: Lifecycle,
    units: KernelSlot<Semaphore>,
    waiters: AtomicU32,
}

impl Sem {
    #[must_use]
    pub const fn uninit() -> Self {
        Self {
            life: Lifecycle::new_destroyed(),
            units: KernelSlot::new(),
            waiters: AtomicU32::new(0),
        }
    }

    pub fn new(pshared: bool, value: u32) -> Result<Self> {
        let sem = Self::uninit();
        sem.init(pshared, value)?;
        Ok(sem)
    }

    /// `ENOSYS` for process-shared semaphores, `EINVAL` above
    /// [`SEM_VALUE_MAX`].
    pub fn init(&self, pshared: bool, value: u32) -> Result<()> {
        if pshared {
            return Err(Error::NotImplemented);
        }
        if value > SEM_VALUE_MAX {
            return Err(Error::Invalid);
        }
        self.life.initialize(|| {
            self.units.install(Semaphore::new(value, SEM_VALUE_MAX)?);
            self.waiters.store(0, Ordering::Relaxed);
            Ok(())
        })
    }

    fn units(&self) -> Result<Arc<Semaphore>> {
        if self.life.phase() != Phase::Ready {
            return Err(Error::Invalid);
        }
        self.units.get().ok_or(Error::Invalid)
    }

    /// `EBUSY` while threads are blocked in a wait.
    pub fn destroy(&self) -> Result<()> {
        self.life.destroy("sem", || {
            if self.waiters.load(Ordering::SeqCst) > 0 {
                return Err(Error::Busy);
            }
            self.units.take();
            Ok(())
        })
    }

    pub fn wait(&self) -> Result<()> {
        self.wait_until(None)
    }

    pub fn timed_wait(&self, deadline: SystemTime) -> Result<()> {
        self.wait_until(Some(deadline))
    }

    fn wait_until(&self, deadline: Option<SystemTime>) -> Result<()> {
        let units = self.units()?;
        let point = CancelPoint::enter()?;
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let status = units.wait(deadline, point.alert());
        self.waiters.fetch_sub(1, Ordering::SeqCst);
        match status {
            WaitStatus::Signaled => Ok(()),
            WaitStatus::TimedOut => Err(Error::TimedOut),
            WaitStatus::Alerted => Err(point.interrupted()),
        }
    }

    /// `EAGAIN` when the value is zero.
    pub fn try_wait(&self) -> Result<()> {
        if self.units()?.try_wait() {
            Ok(())
        } else {
            Err(Error::Again)
        }
    }

    pub fn post(&self) -> Result<()> {
        self.post_multiple(1)
    }

    /// Add `count` units at once. `ERANGE` if that would pass
    /// [`SEM_VALUE_MAX`].
    pub fn post_multiple(&self, count: u32) -> Result<()> {
        if count == 0 {
            return Err(Error::Invalid);
        }
        self.units()?.post(count)
    }

    /// Current value; when zero, minus the number of blocked waiters.
    pub fn value(&self) -> Result<i32> {
        let units = self.units()?;
        let value = units.value();
        if value == 0 {
            let waiting = self.waiters.load(Ordering::SeqCst);
            return Ok(-i32::try_from(waiting).unwrap_or(i32::MAX));
        }
        Ok(i32::try_from(value).unwrap_or(i32::MAX))
    }
}

impl Default for Sem {
    fn default() -> Self {
        Self::uninit()
    }
}

impl std::fmt::Debug for Sem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sem")
            .field("phase", &self.life.phase())
            .field("value", &self.value().ok())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// POSIX surface
// ---------------------------------------------------------------------------

fn sem_result(result: Result<()>) -> c_int {
    match result {
        Ok(()) => 0,
        Err(err) => {
            set_errno(err.errno());
            -1
        }
    }
}

/// Like [`sem_result`] for cancellation points.
fn sem_wait_result(result: Result<()>) -> c_int {
    match unwind::settle(result) {
        Ok(()) => 0,
        Err(errno) => {
            set_errno(errno);
            -1
        }
    }
}

pub fn sem_init(sem: &Sem, pshared: c_int, value: u32) -> c_int {
    sem_result(sem.init(pshared != 0, value))
}

pub fn sem_destroy(sem: &Sem) -> c_int {
    sem_result(sem.destroy())
}

pub fn sem_wait(sem: &Sem) -> c_int {
    sem_wait_result(sem.wait())
}

pub fn sem_trywait(sem: &Sem) -> c_int {
    sem_result(sem.try_wait())
}

pub fn sem_timedwait(sem: &Sem, abstime: &timespec) -> c_int {
    sem_wait_result(deadline_from_timespec(abstime).and_then(|deadline| sem.timed_wait(deadline)))
}

pub fn sem_post(sem: &Sem) -> c_int {
    sem_result(sem.post())
}

pub fn sem_post_multiple(sem: &Sem, count: c_int) -> c_int {
    match u32::try_from(count) {
        Ok(count) => sem_result(sem.post_multiple(count)),
        Err(_) => sem_result(Err(Error::Invalid)),
    }
}

pub fn sem_getvalue(sem: &Sem, sval: &mut c_int) -> c_int {
    match sem.value() {
        Ok(value) => {
            *sval = value;
            0
        }
        Err(err) => sem_result(Err(err)),
    }
}
