//! Deferred and asynchronous cancellation.
//!
//! `cancel` marks the target pending and raises its alert, which wakes it
//! out of whatever cancellation point it is blocked in. The target acts on
//! the request only at a cancellation point, at [`test_cancel`], or when it
//! re-enables cancellation with a request outstanding. Asynchronous type is
//! accepted but delivered at those same places: the host offers no safe way
//! to redirect another thread's execution.
//!
//! Cancellation points here: condition waits, `join`, semaphore waits,
//! barrier waits, `delay_np`, and `test_cancel`.

use std::sync::atomic::{AtomicBool, Ordering};

use libc::c_int;

use super::thread::{self, Pthread};
use super::unwind;
use crate::error::{Error, Result, to_errno};
use crate::kernel::Alert;
use crate::trace::{self, LogLevel};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const PTHREAD_CANCEL_ENABLE: c_int = 0;
pub const PTHREAD_CANCEL_DISABLE: c_int = 1;
pub const PTHREAD_CANCEL_DEFERRED: c_int = 0;
pub const PTHREAD_CANCEL_ASYNCHRONOUS: c_int = 1;

/// Exit value recorded for a canceled thread.
pub const PTHREAD_CANCELED: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelState {
    Enable,
    Disable,
}

impl CancelState {
    pub const fn from_raw(raw: c_int) -> Option<Self> {
        match raw {
            PTHREAD_CANCEL_ENABLE => Some(Self::Enable),
            PTHREAD_CANCEL_DISABLE => Some(Self::Disable),
            _ => None,
        }
    }

    pub const fn raw(self) -> c_int {
        match self {
            Self::Enable => PTHREAD_CANCEL_ENABLE,
            Self::Disable => PTHREAD_CANCEL_DISABLE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelType {
    Deferred,
    Asynchronous,
}

impl CancelType {
    pub const fn from_raw(raw: c_int) -> Option<Self> {
        match raw {
            PTHREAD_CANCEL_DEFERRED => Some(Self::Deferred),
            PTHREAD_CANCEL_ASYNCHRONOUS => Some(Self::Asynchronous),
            _ => None,
        }
    }

    pub const fn raw(self) -> c_int {
        match self {
            Self::Deferred => PTHREAD_CANCEL_DEFERRED,
            Self::Asynchronous => PTHREAD_CANCEL_ASYNCHRONOUS,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-thread control block
// ---------------------------------------------------------------------------

/// Cancellation fields of a thread control block.
#[derive(Debug, Default)]
pub(crate) struct CancelControl {
    disabled: AtomicBool,
    asynchronous: AtomicBool,
    pending: AtomicBool,
    alert: Alert,
}

impl CancelControl {
    /// Enabled, deferred, nothing pending.
    pub(crate) fn reset(&self) {
        self.disabled.store(false, Ordering::SeqCst);
        self.asynchronous.store(false, Ordering::SeqCst);
        self.pending.store(false, Ordering::SeqCst);
        self.alert.clear();
    }

    fn request(&self) {
        self.pending.store(true, Ordering::SeqCst);
        if !self.disabled.load(Ordering::SeqCst) {
            self.alert.raise();
        }
    }

    fn state(&self) -> CancelState {
        if self.disabled.load(Ordering::SeqCst) {
            CancelState::Disable
        } else {
            CancelState::Enable
        }
    }

    fn kind(&self) -> CancelType {
        if self.asynchronous.load(Ordering::SeqCst) {
            CancelType::Asynchronous
        } else {
            CancelType::Deferred
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    /// Take the pending request if cancellation is enabled.
    fn consume(&self) -> bool {
        if self.disabled.load(Ordering::SeqCst) || !self.pending.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.alert.clear();
        true
    }

    /// Alert to hand to a blocking wait, if the wait may be canceled.
    pub(crate) fn wait_alert(&self) -> Option<&Alert> {
        (!self.disabled.load(Ordering::SeqCst)).then_some(&self.alert)
    }
}

fn acted(handle: Pthread) -> Error {
    trace::event(LogLevel::Debug, "cancel_acted", |r| {
        r.with_thread(handle.packed()).with_object("thread")
    });
    Error::Canceled
}

// ---------------------------------------------------------------------------
// Cancellation points
// ---------------------------------------------------------------------------

/// Entered cancellation point; borrows the calling thread's alert for the
/// duration of one blocking wait.
pub(crate) struct CancelPoint {
    bound: thread::Bound,
}

impl CancelPoint {
    /// Check for a pending request before blocking.
    pub(crate) fn enter() -> Result<Self> {
        let bound = thread::try_current_bound()?;
        if bound.block.cancel.consume() {
            return Err(acted(bound.handle));
        }
        Ok(Self { bound })
    }

    pub(crate) fn alert(&self) -> Option<&Alert> {
        self.bound.block.cancel.wait_alert()
    }

    /// The wait came back `Alerted`: consume the request.
    pub(crate) fn interrupted(&self) -> Error {
        self.bound.block.cancel.consume();
        acted(self.bound.handle)
    }
}

/// Act on a pending request.
pub fn test_cancel() -> Result<()> {
    CancelPoint::enter().map(drop)
}

/// Request cancellation of `target`.
///
/// Returns `Err(Canceled)` when the caller targets itself with
/// asynchronous cancellation enabled; the request is then acted on
/// immediately.
pub fn cancel(target: Pthread) -> Result<()> {
    let block = thread::block_of(target).ok_or(Error::NoSuchThread)?;
    block.cancel.request();
    trace::event(LogLevel::Debug, "cancel_request", |r| {
        r.with_thread(target.packed()).with_object("thread")
    });
    if target == thread::current()
        && block.cancel.kind() == CancelType::Asynchronous
        && block.cancel.consume()
    {
        return Err(acted(target));
    }
    Ok(())
}

/// Set the caller's cancel state, returning the previous one.
///
/// Enabling with a request pending under asynchronous type acts on it.
pub fn set_cancel_state(state: CancelState) -> Result<CancelState> {
    let bound = thread::try_current_bound()?;
    let control = &bound.block.cancel;
    let old = control.state();
    control.disabled.store(state == CancelState::Disable, Ordering::SeqCst);
    if state == CancelState::Enable && control.is_pending() {
        control.alert.raise();
        if control.kind() == CancelType::Asynchronous && control.consume() {
            return Err(acted(bound.handle));
        }
    }
    Ok(old)
}

/// Set the caller's cancel type, returning the previous one.
pub fn set_cancel_type(kind: CancelType) -> Result<CancelType> {
    let bound = thread::try_current_bound()?;
    let control = &bound.block.cancel;
    let old = control.kind();
    control
        .asynchronous
        .store(kind == CancelType::Asynchronous, Ordering::SeqCst);
    if kind == CancelType::Asynchronous && control.consume() {
        return Err(acted(bound.handle));
    }
    Ok(old)
}

// ---------------------------------------------------------------------------
// POSIX surface
// ---------------------------------------------------------------------------

pub fn pthread_cancel(thread: Pthread) -> c_int {
    unwind::lower(cancel(thread))
}

pub fn pthread_testcancel() {
    unwind::lower(test_cancel());
}

pub fn pthread_setcancelstate(state: c_int, oldstate: Option<&mut c_int>) -> c_int {
    let Some(state) = CancelState::from_raw(state) else {
        return to_errno(Err(Error::Invalid));
    };
    match unwind::settle(set_cancel_state(state)) {
        Ok(old) => {
            if let Some(slot) = oldstate {
                *slot = old.raw();
            }
            0
        }
        Err(errno) => errno,
    }
}

pub fn pthread_setcanceltype(kind: c_int, oldtype: Option<&mut c_int>) -> c_int {
    let Some(kind) = CancelType::from_raw(kind) else {
        return to_errno(Err(Error::Invalid));
    };
    match unwind::settle(set_cancel_type(kind)) {
        Ok(old) => {
            if let Some(slot) = oldtype {
                *slot = old.raw();
            }
            0
        }
        Err(errno) => errno,
    }
}
