//! POSIX reader-writer locks.
//!
//! Writer-preferring: a reader blocks while a writer holds the lock or any
//! writer is queued. State lives behind an internal NORMAL mutex with one
//! condition variable per side:
//!
//! - `state`: `> 0` readers holding, `-1` a writer holding, `0` free;
//! - `blocked_readers` / `blocked_writers`: threads parked on each side.
//!
//! Waits go through the condition variables, so a blocked acquisition is
//! also a cancellation point.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::time::SystemTime;

use libc::{c_int, timespec};

use super::cond::PthreadCond;
use super::mutex::{PTHREAD_MUTEX_NORMAL, PthreadMutex};
use super::static_init::{Lifecycle, Phase};
use super::{PTHREAD_PROCESS_PRIVATE, unwind};
use crate::error::{Error, Result, to_errno};
use crate::time::deadline_from_timespec;

// ---------------------------------------------------------------------------
// Rwlock kind constants
// ---------------------------------------------------------------------------

/// Default rwlock; writers are always preferred here.
pub const PTHREAD_RWLOCK_DEFAULT_NP: i32 = 0;
pub const PTHREAD_RWLOCK_PREFER_READER_NP: i32 = 0;
pub const PTHREAD_RWLOCK_PREFER_WRITER_NP: i32 = 1;
pub const PTHREAD_RWLOCK_PREFER_WRITER_NONRECURSIVE_NP: i32 = 2;

const FREE: i32 = 0;
const WRITE_HELD: i32 = -1;

/// Returns true if `kind` is a recognized rwlock preference.
#[must_use]
pub const fn valid_rwlock_kind(kind: i32) -> bool {
    matches!(kind, 0..=2)
}

/// Reader-writer lock creation attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PthreadRwlockAttr {
    pub pshared: i32,
    /// Accepted for compatibility; the lock always prefers writers.
    pub kind: i32,
}

impl Default for PthreadRwlockAttr {
    fn default() -> Self {
        Self {
            pshared: PTHREAD_PROCESS_PRIVATE,
            kind: PTHREAD_RWLOCK_DEFAULT_NP,
        }
    }
}

/// POSIX reader-writer lock.
pub struct PthreadRwlock {
    life: Lifecycle,
    mutex: PthreadMutex,
    readers: PthreadCond,
    writers: PthreadCond,
    state: AtomicI32,
    blocked_readers: AtomicU32,
    blocked_writers: AtomicU32,
}

pub const PTHREAD_RWLOCK_INITIALIZER: PthreadRwlock = PthreadRwlock::static_initializer();

impl PthreadRwlock {
    #[must_use]
    pub const fn static_initializer() -> Self {
        Self::with_life(Lifecycle::new_static())
    }

    #[must_use]
    pub const fn uninit() -> Self {
        Self::with_life(Lifecycle::new_destroyed())
    }

    const fn with_life(life: Lifecycle) -> Self {
        Self {
            life,
            mutex: PthreadMutex::uninit(),
            readers: PthreadCond::uninit(),
            writers: PthreadCond::uninit(),
            state: AtomicI32::new(FREE),
            blocked_readers: AtomicU32::new(0),
            blocked_writers: AtomicU32::new(0),
        }
    }

    pub fn new(attr: Option<&PthreadRwlockAttr>) -> Result<Self> {
        let lock = Self::uninit();
        lock.init(attr)?;
        Ok(lock)
    }

    pub fn init(&self, attr: Option<&PthreadRwlockAttr>) -> Result<()> {
        if let Some(attr) = attr {
            if attr.pshared != PTHREAD_PROCESS_PRIVATE {
                return Err(Error::NotImplemented);
            }
            if !valid_rwlock_kind(attr.kind) {
                return Err(Error::Invalid);
            }
        }
        self.life.initialize(|| self.setup())
    }

    /// Build the internal mutex and both conditions, undoing the finished
    /// steps if a later one fails.
    fn setup(&self) -> Result<()> {
        self.mutex.setup_embedded(PTHREAD_MUTEX_NORMAL)?;
        if let Err(err) = self.readers.setup_embedded() {
            self.mutex.teardown_embedded();
            return Err(err);
        }
        if let Err(err) = self.writers.setup_embedded() {
            self.readers.teardown_embedded();
            self.mutex.teardown_embedded();
            return Err(err);
        }
        self.state.store(FREE, Ordering::Relaxed);
        self.blocked_readers.store(0, Ordering::Relaxed);
        self.blocked_writers.store(0, Ordering::Relaxed);
        Ok(())
    }

    #[inline]
    fn ready(&self) -> Result<()> {
        self.life.ensure("rwlock", || self.setup())
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.life.phase()
    }

    /// Readers holding the lock, or -1 for a writer.
    #[must_use]
    pub fn holders(&self) -> i32 {
        self.state.load(Ordering::Relaxed)
    }

    /// Run `f` with the internal mutex held.
    fn locked<R>(&self, f: impl FnOnce() -> Result<R>) -> Result<R> {
        self.ready()?;
        self.mutex.lock()?;
        let result = f();
        self.mutex.unlock()?;
        result
    }

    fn park(&self, cond: &PthreadCond, blocked: &AtomicU32, deadline: Option<SystemTime>) -> Result<()> {
        blocked.fetch_add(1, Ordering::Relaxed);
        let woke = match deadline {
            Some(deadline) => cond.timed_wait(&self.mutex, deadline),
            None => cond.wait(&self.mutex),
        };
        blocked.fetch_sub(1, Ordering::Relaxed);
        woke
    }

    fn read_blocked(&self) -> bool {
        self.state.load(Ordering::Relaxed) < FREE || self.blocked_writers.load(Ordering::Relaxed) > 0
    }

    fn add_reader(&self) -> Result<()> {
        let readers = self.state.load(Ordering::Relaxed);
        let next = readers.checked_add(1).ok_or(Error::Again)?;
        self.state.store(next, Ordering::Relaxed);
        Ok(())
    }

    fn acquire_read(&self, deadline: Option<SystemTime>) -> Result<()> {
        self.locked(|| {
            while self.read_blocked() {
                self.park(&self.readers, &self.blocked_readers, deadline)?;
            }
            self.add_reader()
        })
    }

    fn acquire_write(&self, deadline: Option<SystemTime>) -> Result<()> {
        self.locked(|| {
            while self.state.load(Ordering::Relaxed) != FREE {
                if let Err(err) = self.park(&self.writers, &self.blocked_writers, deadline) {
                    self.release_readers_after_writer_left()?;
                    return Err(err);
                }
            }
            self.state.store(WRITE_HELD, Ordering::Relaxed);
            Ok(())
        })
    }

    /// A queued writer gave up; readers it was holding back may proceed.
    fn release_readers_after_writer_left(&self) -> Result<()> {
        if self.blocked_writers.load(Ordering::Relaxed) == 0
            && self.blocked_readers.load(Ordering::Relaxed) > 0
            && self.state.load(Ordering::Relaxed) >= FREE
        {
            self.readers.broadcast()?;
        }
        Ok(())
    }

    pub fn read_lock(&self) -> Result<()> {
        self.acquire_read(None)
    }

    pub fn timed_read_lock(&self, deadline: SystemTime) -> Result<()> {
        self.acquire_read(Some(deadline))
    }

    pub fn try_read_lock(&self) -> Result<()> {
        self.locked(|| {
            if self.read_blocked() {
                return Err(Error::Busy);
            }
            self.add_reader()
        })
    }

    pub fn write_lock(&self) -> Result<()> {
        self.acquire_write(None)
    }

    pub fn timed_write_lock(&self, deadline: SystemTime) -> Result<()> {
        self.acquire_write(Some(deadline))
    }

    pub fn try_write_lock(&self) -> Result<()> {
        self.locked(|| {
            if self.state.load(Ordering::Relaxed) != FREE {
                return Err(Error::Busy);
            }
            self.state.store(WRITE_HELD, Ordering::Relaxed);
            Ok(())
        })
    }

    /// Release one read hold or the write hold. `EPERM` if neither is held.
    pub fn unlock(&self) -> Result<()> {
        if self.life.phase() == Phase::Static {
            return Err(Error::NotPermitted);
        }
        self.locked(|| {
            match self.state.load(Ordering::Relaxed) {
                WRITE_HELD => self.state.store(FREE, Ordering::Relaxed),
                FREE => return Err(Error::NotPermitted),
                readers => self.state.store(readers - 1, Ordering::Relaxed),
            }
            if self.blocked_writers.load(Ordering::Relaxed) > 0 {
                if self.state.load(Ordering::Relaxed) == FREE {
                    self.writers.signal()?;
                }
            } else if self.blocked_readers.load(Ordering::Relaxed) > 0 {
                self.readers.broadcast()?;
            }
            Ok(())
        })
    }

    /// `EBUSY` while held or waited on.
    pub fn destroy(&self) -> Result<()> {
        self.life.destroy("rwlock", || {
            self.mutex.try_lock()?;
            let idle = self.state.load(Ordering::Relaxed) == FREE
                && self.blocked_readers.load(Ordering::Relaxed) == 0
                && self.blocked_writers.load(Ordering::Relaxed) == 0;
            self.mutex.unlock()?;
            if !idle {
                return Err(Error::Busy);
            }
            self.writers.teardown_embedded();
            self.readers.teardown_embedded();
            self.mutex.teardown_embedded();
            Ok(())
        })
    }
}

impl Default for PthreadRwlock {
    fn default() -> Self {
        PTHREAD_RWLOCK_INITIALIZER
    }
}

impl std::fmt::Debug for PthreadRwlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PthreadRwlock")
            .field("phase", &self.phase())
            .field("state", &self.holders())
            .field("blocked_readers", &self.blocked_readers.load(Ordering::Relaxed))
            .field("blocked_writers", &self.blocked_writers.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// POSIX surface
// ---------------------------------------------------------------------------

pub fn pthread_rwlock_init(rwlock: &PthreadRwlock, attr: Option<&PthreadRwlockAttr>) -> c_int {
    to_errno(rwlock.init(attr))
}

pub fn pthread_rwlock_destroy(rwlock: &PthreadRwlock) -> c_int {
    to_errno(rwlock.destroy())
}

pub fn pthread_rwlock_rdlock(rwlock: &PthreadRwlock) -> c_int {
    unwind::lower(rwlock.read_lock())
}

pub fn pthread_rwlock_tryrdlock(rwlock: &PthreadRwlock) -> c_int {
    to_errno(rwlock.try_read_lock())
}

pub fn pthread_rwlock_timedrdlock(rwlock: &PthreadRwlock, abstime: &timespec) -> c_int {
    unwind::lower(deadline_from_timespec(abstime).and_then(|deadline| rwlock.timed_read_lock(deadline)))
}

pub fn pthread_rwlock_wrlock(rwlock: &PthreadRwlock) -> c_int {
    unwind::lower(rwlock.write_lock())
}

pub fn pthread_rwlock_trywrlock(rwlock: &PthreadRwlock) -> c_int {
    to_errno(rwlock.try_write_lock())
}

pub fn pthread_rwlock_timedwrlock(rwlock: &PthreadRwlock, abstime: &timespec) -> c_int {
    unwind::lower(deadline_from_timespec(abstime).and_then(|deadline| rwlock.timed_write_lock(deadline)))
}

pub fn pthread_rwlock_unlock(rwlock: &PthreadRwlock) -> c_int {
    to_errno(rwlock.unlock())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
