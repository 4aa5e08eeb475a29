//! Wait-for-object-or-cancel pairing.
//!
//! A thread blocked at a cancellation point waits on two things at once:
//! the object it is interested in and its own cancel event. The host has
//! a "wait for multiple objects" call for this; here the waiter arms its
//! [`Alert`] with the object before blocking, and raising the alert
//! interrupts whatever object is armed. Waits check the raised flag under
//! the object's own lock, so a raise can never slip between the check and
//! the sleep.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

/// A kernel object whose blocked waiters can be woken to re-check an alert.
pub trait Waitable: Send + Sync {
    /// Wake every waiter so it re-evaluates its wait condition.
    fn interrupt(&self);
}

/// Per-thread cancel event.
#[derive(Default)]
pub struct Alert {
    raised: AtomicBool,
    armed: Mutex<Option<Arc<dyn Waitable>>>,
}

impl Alert {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the alert, interrupting the armed wait, if any.
    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
        let armed = self.armed.lock().clone();
        if let Some(target) = armed {
            target.interrupt();
        }
    }

    /// Reset to the unsignaled state.
    pub fn clear(&self) {
        self.raised.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    pub(super) fn arm(&self, target: Arc<dyn Waitable>) {
        *self.armed.lock() = Some(target);
    }

    pub(super) fn disarm(&self) {
        *self.armed.lock() = None;
    }
}

impl std::fmt::Debug for Alert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Alert")
            .field("raised", &self.is_raised())
            .finish_non_exhaustive()
    }
}

/// Arms `alert` for the lifetime of the guard.
pub(super) struct Armed<'a>(Option<&'a Alert>);

impl<'a> Armed<'a> {
    pub(super) fn new(alert: Option<&'a Alert>, target: impl FnOnce() -> Arc<dyn Waitable>) -> Self {
        if let Some(alert) = alert {
            alert.arm(target());
        }
        Self(alert)
    }
}

impl Drop for Armed<'_> {
    fn drop(&mut self) {
        if let Some(alert) = self.0 {
            alert.disarm();
        }
    }
}
