//! Lazy initialisation of statically initialised primitives.
//!
//! A primitive built from a `PTHREAD_*_INITIALIZER` constant owns no kernel
//! object. Its first operation creates them under one process-wide guard,
//! and re-checks the lifecycle tag after taking the guard: a concurrent
//! initialiser may have finished first, or a concurrent `destroy` may have
//! invalidated the object.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::{Error, Result};
use crate::kernel::{CriticalSection, critical_section};
use crate::trace::{self, LogLevel};

/// Process-wide admission guard for static initialisation and destroy.
static GUARD: CriticalSection<()> = critical_section(());

const STATIC: u8 = 0;
const READY: u8 = 1;
const DESTROYED: u8 = 2;

/// Lifecycle tag of a primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Built from a static initialiser and not used yet.
    Static,
    /// Initialised; kernel objects exist.
    Ready,
    /// Destroyed (or never initialised); every operation is `EINVAL`.
    Destroyed,
}

pub(crate) struct Lifecycle(AtomicU8);

impl Lifecycle {
    pub(crate) const fn new_static() -> Self {
        Self(AtomicU8::new(STATIC))
    }

    pub(crate) const fn new_destroyed() -> Self {
        Self(AtomicU8::new(DESTROYED))
    }

    pub(crate) fn phase(&self) -> Phase {
        match self.0.load(Ordering::Acquire) {
            STATIC => Phase::Static,
            READY => Phase::Ready,
            _ => Phase::Destroyed,
        }
    }

    /// Flip phases of an object embedded in a composite whose own
    /// lifecycle already holds the guard.
    pub(crate) fn mark_ready(&self) {
        self.0.store(READY, Ordering::Release);
    }

    pub(crate) fn mark_destroyed(&self) {
        self.0.store(DESTROYED, Ordering::Release);
    }

    /// Fast-path validity check, running `init` the first time a static
    /// object is used.
    #[inline]
    pub(crate) fn ensure(&self, object: &'static str, init: impl FnOnce() -> Result<()>) -> Result<()> {
        match self.0.load(Ordering::Acquire) {
            READY => Ok(()),
            STATIC => self.ensure_slow(object, init),
            _ => Err(Error::Invalid),
        }
    }

    #[cold]
    fn ensure_slow(&self, object: &'static str, init: impl FnOnce() -> Result<()>) -> Result<()> {
        let _guard = GUARD.lock();
        match self.0.load(Ordering::Acquire) {
            READY => Ok(()),
            STATIC => {
                init()?;
                self.0.store(READY, Ordering::Release);
                trace::event(LogLevel::Debug, "static_lazy_init", |r| r.with_object(object));
                Ok(())
            }
            _ => Err(Error::Invalid),
        }
    }

    /// Explicit `init`: allowed on static and destroyed objects, `EBUSY` on
    /// ready ones.
    pub(crate) fn initialize(&self, init: impl FnOnce() -> Result<()>) -> Result<()> {
        let _guard = GUARD.lock();
        if self.0.load(Ordering::Acquire) == READY {
            return Err(Error::Busy);
        }
        init()?;
        self.0.store(READY, Ordering::Release);
        Ok(())
    }

    /// Destroy protocol.
    ///
    /// A never-used static object is invalidated without creating anything.
    /// A ready one is handed to `teardown`, which may refuse with `EBUSY`.
    /// A static object that got initialised while we waited for the guard
    /// is reported busy.
    pub(crate) fn destroy(&self, object: &'static str, teardown: impl FnOnce() -> Result<()>) -> Result<()> {
        let result = {
            let _guard = GUARD.lock();
            match self.0.load(Ordering::Acquire) {
                STATIC => {
                    self.0.store(DESTROYED, Ordering::Release);
                    Ok(())
                }
                READY => teardown().map(|()| self.0.store(DESTROYED, Ordering::Release)),
                _ => Err(Error::Invalid),
            }
        };
        if result == Err(Error::Busy) {
            trace::event(LogLevel::Info, "destroy_busy", |r| {
                r.with_object(object).with_errno(Error::Busy.errno())
            });
        }
        result
    }
}
