//! Counting semaphores.

use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Condvar, Mutex};

use super::alert::{Alert, Armed, Waitable};
use super::{WaitStatus, admit, clock, release};
use crate::error::{Error, Result};

/// Counting semaphore with a fixed maximum count.
pub struct Semaphore {
    max: u32,
    count: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(initial: u32, max: u32) -> Result<Arc<Self>> {
        if max == 0 || initial > max {
            return Err(Error::Invalid);
        }
        admit("semaphore")?;
        Ok(Arc::new(Self {
            max,
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }))
    }

    /// Add `units` to the count, waking up to that many waiters.
    ///
    /// Fails with [`Error::Range`] and leaves the count unchanged when the
    /// result would exceed the maximum.
    pub fn post(&self, units: u32) -> Result<()> {
        if units == 0 {
            return Ok(());
        }
        let mut count = self.count.lock();
        let next = count
            .checked_add(units)
            .filter(|&n| n <= self.max)
            .ok_or(Error::Range)?;
        *count = next;
        if units == 1 {
            self.cond.notify_one();
        } else {
            self.cond.notify_all();
        }
        Ok(())
    }

    /// Take one unit if available without blocking.
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    /// Take one unit, blocking until available, `deadline`, or `alert`.
    ///
    /// An available unit is always preferred over a raised alert or an
    /// expired deadline.
    pub fn wait(self: &Arc<Self>, deadline: Option<SystemTime>, alert: Option<&Alert>) -> WaitStatus {
        let _armed = Armed::new(alert, || Arc::clone(self) as Arc<dyn Waitable>);
        let mut count = self.count.lock();
        loop {
            if *count > 0 {
                *count -= 1;
                return WaitStatus::Signaled;
            }
            if alert.is_some_and(Alert::is_raised) {
                return WaitStatus::Alerted;
            }
            match deadline {
                None => self.cond.wait(&mut count),
                Some(deadline) => {
                    let Some(left) = clock::remaining(deadline) else {
                        return WaitStatus::TimedOut;
                    };
                    let _ = self.cond.wait_for(&mut count, left);
                }
            }
        }
    }

    #[must_use]
    pub fn value(&self) -> u32 {
        *self.count.lock()
    }

    #[must_use]
    pub const fn max(&self) -> u32 {
        self.max
    }
}

impl Waitable for Semaphore {
    fn interrupt(&self) {
        let _count = self.count.lock();
        self.cond.notify_all();
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        release();
    }
}
