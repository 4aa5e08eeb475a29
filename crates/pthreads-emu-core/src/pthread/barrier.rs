//! POSIX barriers.
//!
//! Arrivals count down under an internal mutex. The thread that brings the
//! count to zero re-arms it for the next cycle and pulses the breach event;
//! every other arrival takes a pulse ticket before dropping the mutex and
//! sleeps until the generation moves on. Exactly one thread per cycle gets
//! [`PTHREAD_BARRIER_SERIAL_THREAD`].

use std::sync::atomic::{AtomicU32, Ordering};

use libc::c_int;

use super::cancel::CancelPoint;
use super::mutex::{PTHREAD_MUTEX_NORMAL, PthreadMutex};
use super::static_init::{Lifecycle, Phase};
use super::{PTHREAD_PROCESS_PRIVATE, unwind};
use crate::error::{Error, Result, to_errno};
use crate::kernel::{self, Event, KernelSlot, WaitStatus};

/// Returned to the one thread per cycle that completes the barrier.
pub const PTHREAD_BARRIER_SERIAL_THREAD: c_int = -1;

/// Barrier creation attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PthreadBarrierAttr {
    pub pshared: i32,
}

impl Default for PthreadBarrierAttr {
    fn default() -> Self {
        Self {
            pshared: PTHREAD_PROCESS_PRIVATE,
        }
    }
}

/// Outcome of a barrier wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierWait {
    /// This thread completed the cycle.
    Serial,
    Released,
}

impl BarrierWait {
    #[must_use]
    pub const fn is_serial(self) -> bool {
        matches!(self, Self::Serial)
    }

    #[must_use]
    pub const fn raw(self) -> c_int {
        match self {
            Self::Serial => PTHREAD_BARRIER_SERIAL_THREAD,
            Self::Released => 0,
        }
    }
}

pub struct PthreadBarrier {
    life: Lifecycle,
    height: AtomicU32,
    /// Arrivals still missing this cycle; guarded by `mutex`.
    countdown: AtomicU32,
    mutex: PthreadMutex,
    breach: KernelSlot<Event>,
}

impl PthreadBarrier {
    #[must_use]
    pub const fn uninit() -> Self {
        Self {
            life: Lifecycle::new_destroyed(),
            height: AtomicU32::new(0),
            countdown: AtomicU32::new(0),
            mutex: PthreadMutex::uninit(),
            breach: KernelSlot::new(),
        }
    }

    pub fn new(attr: Option<&PthreadBarrierAttr>, count: u32) -> Result<Self> {
        let barrier = Self::uninit();
        barrier.init(attr, count)?;
        Ok(barrier)
    }

    /// `EINVAL` for a zero `count`.
    pub fn init(&self, attr: Option<&PthreadBarrierAttr>, count: u32) -> Result<()> {
        if count == 0 {
            return Err(Error::Invalid);
        }
        if attr.is_some_and(|attr| attr.pshared != PTHREAD_PROCESS_PRIVATE) {
            return Err(Error::NotImplemented);
        }
        self.life.initialize(|| {
            self.mutex.setup_embedded(PTHREAD_MUTEX_NORMAL)?;
            let breach = match Event::new(true, false) {
                Ok(event) => event,
                Err(err) => {
                    self.mutex.teardown_embedded();
                    return Err(err);
                }
            };
            self.breach.install(breach);
            self.height.store(count, Ordering::Relaxed);
            self.countdown.store(count, Ordering::Relaxed);
            Ok(())
        })
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.life.phase()
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height.load(Ordering::Relaxed)
    }

    /// Arrivals blocked in the current cycle.
    #[must_use]
    pub fn waiting(&self) -> u32 {
        self.height().saturating_sub(self.countdown.load(Ordering::Relaxed))
    }

    /// Block until `height` threads have arrived.
    ///
    /// A cancellation point for the threads that have to sleep. A canceled
    /// arrival is withdrawn from the current cycle.
    pub fn wait(&self) -> Result<BarrierWait> {
        if self.life.phase() != Phase::Ready {
            return Err(Error::Invalid);
        }
        let point = CancelPoint::enter()?;
        let breach = self.breach.get().ok_or(Error::Invalid)?;
        let height = self.height();
        if height == 1 {
            return Ok(BarrierWait::Serial);
        }

        self.mutex.lock()?;
        let left = self.countdown.load(Ordering::Relaxed) - 1;
        if left == 0 {
            self.countdown.store(height, Ordering::Relaxed);
            breach.pulse();
            self.mutex.unlock()?;
            kernel::yield_now();
            return Ok(BarrierWait::Serial);
        }
        self.countdown.store(left, Ordering::Relaxed);
        let ticket = breach.ticket();
        self.mutex.unlock()?;

        if breach.wait_pulse(ticket, point.alert()) == WaitStatus::Alerted {
            self.mutex.lock()?;
            let withdrawn = breach.ticket() == ticket;
            if withdrawn {
                self.countdown.fetch_add(1, Ordering::Relaxed);
            }
            self.mutex.unlock()?;
            if withdrawn {
                return Err(point.interrupted());
            }
        }
        Ok(BarrierWait::Released)
    }

    /// `EBUSY` while a cycle is partly filled.
    pub fn destroy(&self) -> Result<()> {
        self.life.destroy("barrier", || {
            self.mutex.lock()?;
            let busy = self.countdown.load(Ordering::Relaxed) != self.height();
            self.mutex.unlock()?;
            if busy {
                return Err(Error::Busy);
            }
            self.breach.take();
            self.mutex.teardown_embedded();
            Ok(())
        })
    }
}

impl Default for PthreadBarrier {
    fn default() -> Self {
        Self::uninit()
    }
}

impl std::fmt::Debug for PthreadBarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PthreadBarrier")
            .field("phase", &self.phase())
            .field("height", &self.height())
            .field("countdown", &self.countdown.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// POSIX surface
// ---------------------------------------------------------------------------

pub fn pthread_barrier_init(barrier: &PthreadBarrier, attr: Option<&PthreadBarrierAttr>, count: u32) -> c_int {
    to_errno(barrier.init(attr, count))
}

pub fn pthread_barrier_destroy(barrier: &PthreadBarrier) -> c_int {
    to_errno(barrier.destroy())
}

/// Returns [`PTHREAD_BARRIER_SERIAL_THREAD`] to one thread per cycle and 0
/// to the rest.
pub fn pthread_barrier_wait(barrier: &PthreadBarrier) -> c_int {
    match unwind::settle(barrier.wait()) {
        Ok(outcome) => outcome.raw(),
        Err(errno) => errno,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn zero_height_is_invalid() {
        let barrier = PthreadBarrier::uninit();
        assert_eq!(barrier.init(None, 0), Err(Error::Invalid));
        assert_eq!(barrier.wait(), Err(Error::Invalid));
    }

    #[test]
    fn height_one_always_serial() {
        let barrier = PthreadBarrier::new(None, 1).unwrap();
        for _ in 0..3 {
            assert_eq!(barrier.wait(), Ok(BarrierWait::Serial));
        }
        assert_eq!(pthread_barrier_wait(&barrier), PTHREAD_BARRIER_SERIAL_THREAD);
    }

    #[test]
    fn one_serial_thread_per_cycle() {
        const HEIGHT: usize = 4;
        const CYCLES: usize = 200;
        let barrier = Arc::new(PthreadBarrier::new(None, HEIGHT as u32).unwrap());
        let serials = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..HEIGHT)
            .map(|_| {
                let (b, s) = (Arc::clone(&barrier), Arc::clone(&serials));
                std::thread::spawn(move || {
                    for _ in 0..CYCLES {
                        if b.wait().unwrap().is_serial() {
                            s.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(serials.load(Ordering::SeqCst), CYCLES);
        assert_eq!(barrier.destroy(), Ok(()));
    }

    #[test]
    fn destroy_busy_with_partial_cycle() {
        let barrier = Arc::new(PthreadBarrier::new(None, 2).unwrap());
        let b = Arc::clone(&barrier);
        let first = std::thread::spawn(move || b.wait());
        while barrier.countdown.load(Ordering::Relaxed) == 2 {
            std::thread::yield_now();
        }
        assert_eq!(barrier.destroy(), Err(Error::Busy));
        assert_eq!(barrier.wait(), Ok(BarrierWait::Serial));
        assert_eq!(first.join().unwrap(), Ok(BarrierWait::Released));
        assert_eq!(barrier.destroy(), Ok(()));
    }

    #[test]
    fn process_shared_is_not_implemented() {
        let barrier = PthreadBarrier::uninit();
        let attr = PthreadBarrierAttr {
            pshared: crate::pthread::PTHREAD_PROCESS_SHARED,
        };
        assert_eq!(barrier.init(Some(&attr), 2), Err(Error::NotImplemented));
        assert_eq!(pthread_barrier_init(&barrier, None, 2), 0);
    }
}
