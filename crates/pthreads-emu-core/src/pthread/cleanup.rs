//! Per-thread cleanup-handler stack.
//!
//! Handlers run most-recently-pushed first, each exactly once, when the
//! thread leaves through cancellation or `pthread_exit`, or when popped
//! with `execute`. A normal return from the start routine discards
//! whatever is left without running it.

use std::cell::RefCell;

use libc::c_int;

/// One pushed handler.
pub struct CleanupHandler(Box<dyn FnOnce()>);

impl CleanupHandler {
    fn run(self) {
        (self.0)();
    }
}

thread_local! {
    static STACK: RefCell<Vec<CleanupHandler>> = const { RefCell::new(Vec::new()) };
}

/// Push `routine`; returns the depth below it (the prior top).
pub fn push(routine: impl FnOnce() + 'static) -> usize {
    STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        let prior = stack.len();
        stack.push(CleanupHandler(Box::new(routine)));
        prior
    })
}

/// Pop the top handler, running it when `execute` is set.
///
/// Returns false when the stack was empty.
pub fn pop(execute: bool) -> bool {
    let top = STACK.with(|stack| stack.borrow_mut().pop());
    match top {
        Some(handler) => {
            if execute {
                handler.run();
            }
            true
        }
        None => false,
    }
}

/// Number of handlers currently pushed.
#[must_use]
pub fn depth() -> usize {
    STACK.try_with(|stack| stack.borrow().len()).unwrap_or(0)
}

/// Run every pushed handler, top first. Handlers pushed by a running
/// handler are run too.
pub(crate) fn run_all() -> usize {
    let mut ran = 0;
    loop {
        let top = STACK
            .try_with(|stack| stack.borrow_mut().pop())
            .ok()
            .flatten();
        let Some(handler) = top else {
            return ran;
        };
        handler.run();
        ran += 1;
    }
}

/// Drop every pushed handler without running it.
pub(crate) fn discard_all() {
    let _ = STACK.try_with(|stack| stack.borrow_mut().clear());
}

// ---------------------------------------------------------------------------
// POSIX surface
// ---------------------------------------------------------------------------

pub fn pthread_cleanup_push(routine: fn(usize), arg: usize) {
    push(move || routine(arg));
}

pub fn pthread_cleanup_pop(execute: c_int) {
    pop(execute != 0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn handlers_run_lifo_exactly_once() {
        std::thread::spawn(|| {
            let log = Rc::new(RefCell::new(Vec::new()));
            for i in 0..3 {
                let log = Rc::clone(&log);
                assert_eq!(push(move || log.borrow_mut().push(i)), i);
            }
            assert_eq!(depth(), 3);
            assert_eq!(run_all(), 3);
            assert_eq!(run_all(), 0);
            assert_eq!(*log.borrow(), vec![2, 1, 0]);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn pop_executes_only_on_request() {
        std::thread::spawn(|| {
            let hits = Rc::new(RefCell::new(0));
            let h = Rc::clone(&hits);
            push(move || *h.borrow_mut() += 1);
            let h = Rc::clone(&hits);
            push(move || *h.borrow_mut() += 10);
            assert!(pop(false));
            assert!(pop(true));
            assert!(!pop(true));
            assert_eq!(*hits.borrow(), 1);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn discard_drops_without_running() {
        std::thread::spawn(|| {
            let hits = Rc::new(RefCell::new(0));
            let h = Rc::clone(&hits);
            push(move || *h.borrow_mut() += 1);
            discard_all();
            assert_eq!(depth(), 0);
            assert_eq!(*hits.borrow(), 0);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn posix_push_pop_passes_argument() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static SEEN: AtomicUsize = AtomicUsize::new(0);
        fn record(arg: usize) {
            SEEN.store(arg, Ordering::SeqCst);
        }
        std::thread::spawn(|| {
            pthread_cleanup_push(record, 42);
            pthread_cleanup_pop(1);
        })
        .join()
        .unwrap();
        assert_eq!(SEEN.load(Ordering::SeqCst), 42);
    }
}
