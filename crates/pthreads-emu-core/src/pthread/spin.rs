//! POSIX spin locks.
//!
//! On a multiprocessor the lock is a CAS loop on one byte. With a single
//! processor spinning only burns the holder's time slice, so the lock is
//! backed by an internal NORMAL mutex instead. The choice is made at
//! initialisation, lazily for statically initialised locks.

use std::sync::atomic::{AtomicU8, Ordering};

use libc::c_int;

use super::PTHREAD_PROCESS_PRIVATE;
use super::mutex::{PTHREAD_MUTEX_NORMAL, PthreadMutex};
use super::static_init::{Lifecycle, Phase};
use crate::error::{Error, Result, to_errno};
use crate::kernel;
use crate::sched;

const UNLOCKED: u8 = 0;
const LOCKED: u8 = 1;

const MODE_SPIN: u8 = 0;
const MODE_MUTEX: u8 = 1;

/// Spins between yields while contended.
const SPINS_PER_YIELD: u32 = 64;

pub struct PthreadSpinlock {
    life: Lifecycle,
    mode: AtomicU8,
    word: AtomicU8,
    mutex: PthreadMutex,
}

pub const PTHREAD_SPINLOCK_INITIALIZER: PthreadSpinlock = PthreadSpinlock::static_initializer();

impl PthreadSpinlock {
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
            mode: AtomicU8::new(MODE_SPIN),
            word: AtomicU8::new(UNLOCKED),
            mutex: PthreadMutex::uninit(),
        }
    }

    pub fn new(pshared: i32) -> Result<Self> {
        let lock = Self::uninit();
        lock.init(pshared)?;
        Ok(lock)
    }

    pub fn init(&self, pshared: i32) -> Result<()> {
        if pshared != PTHREAD_PROCESS_PRIVATE {
            return Err(Error::NotImplemented);
        }
        self.life.initialize(|| self.setup())
    }

    fn setup(&self) -> Result<()> {
        self.word.store(UNLOCKED, Ordering::Relaxed);
        if sched::processors() > 1 {
            self.mode.store(MODE_SPIN, Ordering::Relaxed);
        } else {
            self.mutex.setup_embedded(PTHREAD_MUTEX_NORMAL)?;
            self.mode.store(MODE_MUTEX, Ordering::Relaxed);
        }
        Ok(())
    }

    #[inline]
    fn ready(&self) -> Result<()> {
        self.life.ensure("spin", || self.setup())
    }

    fn uses_mutex(&self) -> bool {
        self.mode.load(Ordering::Relaxed) == MODE_MUTEX
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.life.phase()
    }

    /// True when this lock fell back to a mutex.
    #[must_use]
    pub fn is_mutex_backed(&self) -> bool {
        self.life.phase() == Phase::Ready && self.uses_mutex()
    }

    pub fn lock(&self) -> Result<()> {
        self.ready()?;
        if self.uses_mutex() {
            return self.mutex.lock();
        }
        let mut spins = 0u32;
        while self
            .word
            .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.word.load(Ordering::Relaxed) == LOCKED {
                spins += 1;
                if spins % SPINS_PER_YIELD == 0 {
                    kernel::yield_now();
                } else {
                    std::hint::spin_loop();
                }
            }
        }
        Ok(())
    }

    pub fn try_lock(&self) -> Result<()> {
        self.ready()?;
        if self.uses_mutex() {
            return self.mutex.try_lock();
        }
        self.word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .map(drop)
            .map_err(|_| Error::Busy)
    }

    /// `EPERM` when the lock is not held.
    pub fn unlock(&self) -> Result<()> {
        match self.life.phase() {
            Phase::Ready => {}
            Phase::Static => return Err(Error::NotPermitted),
            Phase::Destroyed => return Err(Error::Invalid),
        }
        if self.uses_mutex() {
            return self.mutex.unlock();
        }
        match self.word.swap(UNLOCKED, Ordering::Release) {
            LOCKED => Ok(()),
            _ => Err(Error::NotPermitted),
        }
    }

    /// `EBUSY` while held.
    pub fn destroy(&self) -> Result<()> {
        self.life.destroy("spin", || {
            if self.uses_mutex() {
                self.mutex.try_lock()?;
                self.mutex.unlock()?;
                self.mutex.teardown_embedded();
                return Ok(());
            }
            if self.word.load(Ordering::Acquire) != UNLOCKED {
                return Err(Error::Busy);
            }
            Ok(())
        })
    }
}

impl Default for PthreadSpinlock {
    fn default() -> Self {
        PTHREAD_SPINLOCK_INITIALIZER
    }
}

impl std::fmt::Debug for PthreadSpinlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PthreadSpinlock")
            .field("phase", &self.phase())
            .field("mutex_backed", &self.uses_mutex())
            .field("locked", &(self.word.load(Ordering::Relaxed) == LOCKED))
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// POSIX surface
// ---------------------------------------------------------------------------

pub fn pthread_spin_init(lock: &PthreadSpinlock, pshared: c_int) -> c_int {
    to_errno(lock.init(pshared))
}

pub fn pthread_spin_destroy(lock: &PthreadSpinlock) -> c_int {
    to_errno(lock.destroy())
}

pub fn pthread_spin_lock(lock: &PthreadSpinlock) -> c_int {
    to_errno(lock.lock())
}

pub fn pthread_spin_trylock(lock: &PthreadSpinlock) -> c_int {
    to_errno(lock.try_lock())
}

pub fn pthread_spin_unlock(lock: &PthreadSpinlock) -> c_int {
    to_errno(lock.unlock())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
