//! POSIX condition variables.
//!
//! Waiters sleep on a counting semaphore. Two counters, guarded by one
//! critical section, keep wakeups exact:
//!
//! - `waiters`: threads registered and not yet returned;
//! - `pending`: units posted to the semaphore and not yet claimed.
//!
//! `signal` posts one unit only while `waiters > pending`, so a signal with
//! nobody waiting is lost as POSIX requires. `broadcast` posts
//! `waiters - pending` units, then holds the registration gate until the
//! last woken waiter reports back, so a thread that starts waiting after the
//! broadcast cannot steal one of its wakeups.

use std::sync::Arc;
use std::time::SystemTime;

use libc::{c_int, timespec};

use super::PTHREAD_PROCESS_PRIVATE;
use super::cancel::CancelPoint;
use super::mutex::PthreadMutex;
use super::static_init::{Lifecycle, Phase};
use super::unwind;
use crate::error::{Error, Result, to_errno};
use crate::kernel::{CriticalSection, Event, KernelSlot, Semaphore, WaitStatus, critical_section};
use crate::time::deadline_from_timespec;

/// Semaphore ceiling; far above any real waiter count.
const WAKEUP_UNITS_MAX: u32 = i32::MAX as u32;

/// Condition variable creation attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PthreadCondAttr {
    pub pshared: i32,
}

impl Default for PthreadCondAttr {
    fn default() -> Self {
        Self {
            pshared: PTHREAD_PROCESS_PRIVATE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Counters {
    waiters: u32,
    pending: u32,
    broadcasting: bool,
}

const NO_WAITERS: Counters = Counters {
    waiters: 0,
    pending: 0,
    broadcasting: false,
};

/// POSIX condition variable.
pub struct PthreadCond {
    life: Lifecycle,
    counters: CriticalSection<Counters>,
    /// Held by registration and for the whole of a broadcast.
    gate: CriticalSection<()>,
    wakeups: KernelSlot<Semaphore>,
    /// Auto-reset; set by the last waiter a broadcast released.
    all_woken: KernelSlot<Event>,
}

/// Static initialiser; kernel objects are created on first use.
pub const PTHREAD_COND_INITIALIZER: PthreadCond = PthreadCond::static_initializer();

impl PthreadCond {
    #[must_use]
    pub const fn static_initializer() -> Self {
        Self::with_life(Lifecycle::new_static())
    }

    /// Storage that has not been initialised yet.
    #[must_use]
    pub const fn uninit() -> Self {
        Self::with_life(Lifecycle::new_destroyed())
    }

    const fn with_life(life: Lifecycle) -> Self {
        Self {
            life,
            counters: critical_section(NO_WAITERS),
            gate: critical_section(()),
            wakeups: KernelSlot::new(),
            all_woken: KernelSlot::new(),
        }
    }

    pub fn new(attr: Option<&PthreadCondAttr>) -> Result<Self> {
        let cond = Self::uninit();
        cond.init(attr)?;
        Ok(cond)
    }

    pub fn init(&self, attr: Option<&PthreadCondAttr>) -> Result<()> {
        if attr.is_some_and(|attr| attr.pshared != PTHREAD_PROCESS_PRIVATE) {
            return Err(Error::NotImplemented);
        }
        self.life.initialize(|| self.setup())
    }

    fn setup(&self) -> Result<()> {
        let wakeups = Semaphore::new(0, WAKEUP_UNITS_MAX)?;
        let all_woken = Event::new(false, false)?;
        *self.counters.lock() = NO_WAITERS;
        self.wakeups.install(wakeups);
        self.all_woken.install(all_woken);
        Ok(())
    }

    pub(crate) fn setup_embedded(&self) -> Result<()> {
        self.setup()?;
        self.life.mark_ready();
        Ok(())
    }

    pub(crate) fn teardown_embedded(&self) {
        self.life.mark_destroyed();
        self.wakeups.take();
        self.all_woken.take();
    }

    #[inline]
    fn ready(&self) -> Result<()> {
        self.life.ensure("cond", || self.setup())
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.life.phase()
    }

    /// Threads currently inside a wait.
    #[must_use]
    pub fn waiters(&self) -> u32 {
        self.counters.lock().waiters
    }

    /// Release `mutex`, wait for a wakeup, relock `mutex`.
    ///
    /// A cancellation point. The mutex is held again on every return,
    /// including cancellation.
    pub fn wait(&self, mutex: &PthreadMutex) -> Result<()> {
        self.wait_until(mutex, None)
    }

    /// [`wait`](Self::wait) with an absolute real-time deadline.
    pub fn timed_wait(&self, mutex: &PthreadMutex, deadline: SystemTime) -> Result<()> {
        self.wait_until(mutex, Some(deadline))
    }

    fn wait_until(&self, mutex: &PthreadMutex, deadline: Option<SystemTime>) -> Result<()> {
        self.ready()?;
        let point = CancelPoint::enter()?;
        let wakeups: Arc<Semaphore> = self.wakeups.get().ok_or(Error::Invalid)?;

        {
            let _gate = self.gate.lock();
            self.counters.lock().waiters += 1;
        }
        if let Err(err) = mutex.unlock() {
            self.leave(&wakeups, WaitStatus::TimedOut);
            return Err(err);
        }

        let status = wakeups.wait(deadline, point.alert());
        let status = self.leave(&wakeups, status);
        mutex.lock()?;
        match status {
            WaitStatus::Signaled => Ok(()),
            WaitStatus::TimedOut => Err(Error::TimedOut),
            WaitStatus::Alerted => Err(point.interrupted()),
        }
    }

    /// Deregister a waiter, settling the unit accounting.
    ///
    /// A waiter that timed out while a unit was posted for it claims the
    /// unit and reports a wakeup. A canceled one drops the surplus unit so
    /// a later waiter cannot consume a stale wakeup.
    fn leave(&self, wakeups: &Semaphore, status: WaitStatus) -> WaitStatus {
        let (status, broadcast_done) = {
            let mut c = self.counters.lock();
            c.waiters -= 1;
            let mut status = status;
            if status == WaitStatus::Signaled {
                c.pending -= 1;
            } else if c.pending > c.waiters && wakeups.try_wait() {
                c.pending -= 1;
                if status == WaitStatus::TimedOut {
                    status = WaitStatus::Signaled;
                }
            }
            let done = c.broadcasting && c.pending == 0;
            if done {
                c.broadcasting = false;
            }
            (status, done)
        };
        if broadcast_done {
            if let Some(all_woken) = self.all_woken.get() {
                all_woken.set();
            }
        }
        status
    }

    /// Wake one waiter, if any.
    pub fn signal(&self) -> Result<()> {
        match self.life.phase() {
            // Nobody can be waiting on a condition that was never used.
            Phase::Static => return Ok(()),
            Phase::Destroyed => return Err(Error::Invalid),
            Phase::Ready => {}
        }
        let wakeups = self.wakeups.get().ok_or(Error::Invalid)?;
        let mut c = self.counters.lock();
        if c.waiters > c.pending {
            wakeups.post(1)?;
            c.pending += 1;
        }
        Ok(())
    }

    /// Wake every current waiter and wait until they have all left the
    /// semaphore.
    pub fn broadcast(&self) -> Result<()> {
        match self.life.phase() {
            Phase::Static => return Ok(()),
            Phase::Destroyed => return Err(Error::Invalid),
            Phase::Ready => {}
        }
        let wakeups = self.wakeups.get().ok_or(Error::Invalid)?;
        let all_woken = self.all_woken.get().ok_or(Error::Invalid)?;

        let _gate = self.gate.lock();
        {
            let mut c = self.counters.lock();
            let released = c.waiters - c.pending;
            if released == 0 {
                return Ok(());
            }
            wakeups.post(released)?;
            c.pending += released;
            c.broadcasting = true;
        }
        all_woken.wait(None, None);
        Ok(())
    }

    /// `EBUSY` while threads are waiting.
    pub fn destroy(&self) -> Result<()> {
        self.life.destroy("cond", || {
            let _gate = self.gate.lock();
            let c = self.counters.lock();
            if c.waiters > 0 || c.broadcasting {
                return Err(Error::Busy);
            }
            drop(c);
            self.wakeups.take();
            self.all_woken.take();
            Ok(())
        })
    }
}

impl Default for PthreadCond {
    fn default() -> Self {
        PTHREAD_COND_INITIALIZER
    }
}

impl std::fmt::Debug for PthreadCond {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let c = *self.counters.lock();
        f.debug_struct("PthreadCond")
            .field("phase", &self.phase())
            .field("waiters", &c.waiters)
            .field("pending", &c.pending)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// POSIX surface
// ---------------------------------------------------------------------------

pub fn pthread_cond_init(cond: &PthreadCond, attr: Option<&PthreadCondAttr>) -> c_int {
    to_errno(cond.init(attr))
}

pub fn pthread_cond_destroy(cond: &PthreadCond) -> c_int {
    to_errno(cond.destroy())
}

pub fn pthread_cond_wait(cond: &PthreadCond, mutex: &PthreadMutex) -> c_int {
    unwind::lower(cond.wait(mutex))
}

pub fn pthread_cond_timedwait(cond: &PthreadCond, mutex: &PthreadMutex, abstime: &timespec) -> c_int {
    unwind::lower(deadline_from_timespec(abstime).and_then(|deadline| cond.timed_wait(mutex, deadline)))
}

pub fn pthread_cond_signal(cond: &PthreadCond) -> c_int {
    to_errno(cond.signal())
}

pub fn pthread_cond_broadcast(cond: &PthreadCond) -> c_int {
    to_errno(cond.broadcast())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
