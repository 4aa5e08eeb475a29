//! Thread abort by unwinding.
//!
//! Cancellation and `pthread_exit` leave the thread by unwinding with a
//! private payload. The spawn trampoline catches it, runs the cleanup
//! stack and TSD destructors, and records the exit value. Threads not
//! created here have no trampoline, so they finish their bookkeeping
//! before the unwind starts.

use std::any::Any;
use std::panic;

use libc::c_int;

use super::cancel::PTHREAD_CANCELED;
use super::thread;
use crate::error::{Error, Result, to_errno};

/// Reason a thread is leaving early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Abort {
    Exit(usize),
    Canceled,
}

impl Abort {
    pub(crate) const fn exit_value(self) -> usize {
        match self {
            Self::Exit(value) => value,
            Self::Canceled => PTHREAD_CANCELED,
        }
    }
}

/// Unwind payload. Never escapes a spawned thread.
struct ThreadAbort(Abort);

/// Terminate the calling thread with `value`.
pub fn exit(value: usize) -> ! {
    raise(Abort::Exit(value))
}

/// Terminate the calling thread as canceled.
pub fn act_on_cancel() -> ! {
    raise(Abort::Canceled)
}

fn raise(abort: Abort) -> ! {
    if !thread::current_is_spawned() {
        thread::finish_adopted(abort);
    }
    panic::resume_unwind(Box::new(ThreadAbort(abort)))
}

/// Split a caught unwind payload into an abort or a foreign panic.
pub(crate) fn classify(
    payload: Box<dyn Any + Send>,
) -> std::result::Result<Abort, Box<dyn Any + Send>> {
    payload
        .downcast::<ThreadAbort>()
        .map(|abort| abort.0)
}

/// Lower a core result to an errno, turning cancellation into thread exit.
pub(crate) fn lower(result: Result<()>) -> c_int {
    match result {
        Err(Error::Canceled) => act_on_cancel(),
        other => to_errno(other),
    }
}

/// Like [`lower`] but keeps the success value.
pub(crate) fn settle<T>(result: Result<T>) -> std::result::Result<T, c_int> {
    match result {
        Ok(value) => Ok(value),
        Err(Error::Canceled) => act_on_cancel(),
        Err(err) => Err(err.errno()),
    }
}
