//! One-time initialisation.
//!
//! The first caller to move the control from `INIT` to `RUNNING` runs the
//! routine; everyone else sleeps on a semaphore until the state leaves
//! `RUNNING`. If the routine unwinds (cancellation, exit, panic) the control
//! goes back to `INIT` and sleepers are woken so one of them can take over.
//! The semaphore is created by the first thread that has to sleep.

use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use libc::c_int;

use crate::error::{Result, to_errno};
use crate::kernel::{KernelSlot, Semaphore};
use crate::trace::{self, LogLevel};

const INIT: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;

const WAKEUP_UNITS_MAX: u32 = i32::MAX as u32;

pub struct PthreadOnce {
    state: AtomicU8,
    /// Callers parked on `wakeup`. Incremented only after `wakeup` exists.
    waiters: AtomicU32,
    wakeup: KernelSlot<Semaphore>,
}

pub const PTHREAD_ONCE_INIT: PthreadOnce = PthreadOnce::new();

/// Resets the control if the routine does not finish normally.
struct Rollback<'a>(&'a PthreadOnce);

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        self.0.finish(INIT);
        trace::event(LogLevel::Debug, "once_rollback", |r| r.with_object("once"));
    }
}

impl PthreadOnce {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(INIT),
            waiters: AtomicU32::new(0),
            wakeup: KernelSlot::new(),
        }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) == DONE
    }

    /// Run `routine` unless it already ran to completion.
    ///
    /// Fails only when a caller that must wait cannot get its semaphore.
    pub fn call(&self, routine: impl FnOnce()) -> Result<()> {
        if self.is_done() {
            return Ok(());
        }
        let mut routine = Some(routine);
        loop {
            match self
                .state
                .compare_exchange(INIT, RUNNING, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => {
                    let rollback = Rollback(self);
                    if let Some(routine) = routine.take() {
                        routine();
                    }
                    std::mem::forget(rollback);
                    self.finish(DONE);
                    return Ok(());
                }
                Err(DONE) => return Ok(()),
                Err(_) => self.park()?,
            }
        }
    }

    /// Sleep until the state leaves `RUNNING`.
    fn park(&self) -> Result<()> {
        let wakeup = self
            .wakeup
            .get_or_try_init(|| Semaphore::new(0, WAKEUP_UNITS_MAX))?;
        self.waiters.fetch_add(1, Ordering::SeqCst);
        if self.state.load(Ordering::SeqCst) == RUNNING {
            let _ = wakeup.wait(None, None);
        }
        self.waiters.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn finish(&self, state: u8) {
        self.state.store(state, Ordering::SeqCst);
        let parked = self.waiters.load(Ordering::SeqCst);
        if parked > 0 {
            if let Some(wakeup) = self.wakeup.get() {
                let _ = wakeup.post(parked.min(WAKEUP_UNITS_MAX - wakeup.value()));
            }
        }
    }
}

impl Default for PthreadOnce {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PthreadOnce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PthreadOnce")
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("waiters", &self.waiters.load(Ordering::Relaxed))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// POSIX surface
// ---------------------------------------------------------------------------

pub fn pthread_once(once: &PthreadOnce, init_routine: fn()) -> c_int {
    to_errno(once.call(init_routine))
}
