//! Waitable events.

use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Condvar, Mutex};

use super::alert::{Alert, Armed, Waitable};
use super::{WaitStatus, admit, clock, release};
use crate::error::Result;

#[derive(Default)]
struct EventState {
    signaled: bool,
    /// Bumped by every [`Event::pulse`].
    generation: u64,
}

/// Manual- or auto-reset event.
///
/// A manual-reset event stays signaled until [`reset`](Event::reset); an
/// auto-reset event releases one waiter per [`set`](Event::set) and
/// returns to unsignaled. [`pulse`](Event::pulse) releases the waiters
/// that hold the current generation ticket without leaving the event
/// signaled.
pub struct Event {
    manual_reset: bool,
    state: Mutex<EventState>,
    cond: Condvar,
}

impl Event {
    pub fn new(manual_reset: bool, initially_signaled: bool) -> Result<Arc<Self>> {
        admit("event")?;
        Ok(Arc::new(Self {
            manual_reset,
            state: Mutex::new(EventState {
                signaled: initially_signaled,
                generation: 0,
            }),
            cond: Condvar::new(),
        }))
    }

    pub fn set(&self) {
        let mut st = self.state.lock();
        st.signaled = true;
        if self.manual_reset {
            self.cond.notify_all();
        } else {
            self.cond.notify_one();
        }
    }

    pub fn reset(&self) {
        self.state.lock().signaled = false;
    }

    #[must_use]
    pub fn is_signaled(&self) -> bool {
        self.state.lock().signaled
    }

    /// Generation ticket to pass to [`wait_pulse`](Event::wait_pulse).
    ///
    /// Take the ticket while holding whatever lock orders you against the
    /// pulser, so a pulse can't be missed.
    #[must_use]
    pub fn ticket(&self) -> u64 {
        self.state.lock().generation
    }

    /// Release every thread waiting on an older ticket.
    pub fn pulse(&self) {
        let mut st = self.state.lock();
        st.generation = st.generation.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Block until signaled, `deadline` passes, or `alert` is raised.
    pub fn wait(self: &Arc<Self>, deadline: Option<SystemTime>, alert: Option<&Alert>) -> WaitStatus {
        let _armed = Armed::new(alert, || Arc::clone(self) as Arc<dyn Waitable>);
        let mut st = self.state.lock();
        loop {
            if st.signaled {
                if !self.manual_reset {
                    st.signaled = false;
                }
                return WaitStatus::Signaled;
            }
            if alert.is_some_and(Alert::is_raised) {
                return WaitStatus::Alerted;
            }
            match deadline {
                None => self.cond.wait(&mut st),
                Some(deadline) => {
                    let Some(left) = clock::remaining(deadline) else {
                        return WaitStatus::TimedOut;
                    };
                    let _ = self.cond.wait_for(&mut st, left);
                }
            }
        }
    }

    /// Block until the generation moves past `ticket` or `alert` is raised.
    pub fn wait_pulse(self: &Arc<Self>, ticket: u64, alert: Option<&Alert>) -> WaitStatus {
        let _armed = Armed::new(alert, || Arc::clone(self) as Arc<dyn Waitable>);
        let mut st = self.state.lock();
        loop {
            if st.generation != ticket {
                return WaitStatus::Signaled;
            }
            if alert.is_some_and(Alert::is_raised) {
                return WaitStatus::Alerted;
            }
            self.cond.wait(&mut st);
        }
    }
}

impl Waitable for Event {
    fn interrupt(&self) {
        let _st = self.state.lock();
        self.cond.notify_all();
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        release();
    }
}
