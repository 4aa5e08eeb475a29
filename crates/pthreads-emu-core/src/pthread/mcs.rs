//! MCS queue lock.
//!
//! Each acquirer enqueues a node that lives on its own stack frame, swaps
//! it onto the tail, links behind its predecessor and waits on a per-node
//! flag until the predecessor hands the lock over. Hand-off order is
//! strictly FIFO.
//!
//! Flags are words holding 0 (clear), `FLAG_SET`, or the address of a
//! kernel event owned by the thread waiting on the flag. A waiter only
//! creates that event when the flag is still clear, i.e. under genuine
//! contention, and closes it before returning.
//!
//! A releasing owner always waits for its successor to finish the link
//! handshake before handing over, so no thread touches a node after its
//! owner has left the critical section.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::kernel::{self, Event};

const FLAG_CLEAR: usize = 0;
const FLAG_SET: usize = usize::MAX;

/// One-shot hand-off flag.
struct Flag(AtomicUsize);

impl Flag {
    const fn new() -> Self {
        Self(AtomicUsize::new(FLAG_CLEAR))
    }

    /// Set the flag, waking its waiter if one parked on an event.
    ///
    /// # Safety
    ///
    /// `flag` must point to a live node whose owner is either still
    /// linking or blocked in [`Flag::wait`] on this flag.
    unsafe fn set(flag: *const Self) {
        // SAFETY: caller guarantees the node is live for the CAS.
        let observed = unsafe { &(*flag).0 }.compare_exchange(
            FLAG_CLEAR,
            FLAG_SET,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if let Err(handle) = observed {
            if handle == FLAG_SET {
                return;
            }
            let event = handle as *const Event;
            // SAFETY: `handle` came from `Arc::as_ptr` in `wait`. Its owner
            // holds that Arc until the event is set, which only happens
            // below, so the count is positive while we take our own.
            let event = unsafe {
                Arc::increment_strong_count(event);
                Arc::from_raw(event)
            };
            event.set();
        }
    }

    /// Block until the flag is set.
    fn wait(&self) {
        if self.0.load(Ordering::SeqCst) != FLAG_CLEAR {
            return;
        }
        match Event::new(false, false) {
            Ok(event) => {
                let handle = Arc::as_ptr(&event) as usize;
                if self
                    .0
                    .compare_exchange(FLAG_CLEAR, handle, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    event.wait(None, None);
                }
            }
            // No event available: fall back to polling the flag.
            Err(_) => {
                while self.0.load(Ordering::Acquire) == FLAG_CLEAR {
                    std::hint::spin_loop();
                    kernel::yield_now();
                }
            }
        }
    }
}

/// Queue node supplied by each acquirer.
struct McsNode {
    next: AtomicPtr<McsNode>,
    next_flag: Flag,
    ready_flag: Flag,
}

impl McsNode {
    const fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            next_flag: Flag::new(),
            ready_flag: Flag::new(),
        }
    }
}

/// FIFO queue lock protecting a `T`.
pub struct McsLock<T: ?Sized> {
    tail: AtomicPtr<McsNode>,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialised by the queue; `T: Send` suffices
// because only one thread observes it at a time.
unsafe impl<T: ?Sized + Send> Send for McsLock<T> {}
// SAFETY: as above.
unsafe impl<T: ?Sized + Send> Sync for McsLock<T> {}

impl<T> McsLock<T> {
    #[must_use]
    pub const fn new(data: T) -> Self {
        Self {
            tail: AtomicPtr::new(ptr::null_mut()),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> McsLock<T> {
    /// Run `f` with exclusive access, queueing behind current holders.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let node = McsNode::new();
        self.acquire(&node);
        let _release = Release { lock: self, node: &node };
        // SAFETY: our node is at the head of the queue until `_release`
        // drops, so no other thread holds a reference into `data`.
        f(unsafe { &mut *self.data.get() })
    }

    /// Run `f` only if the lock is free right now.
    pub fn try_with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let node = McsNode::new();
        let me = ptr::from_ref(&node).cast_mut();
        self.tail
            .compare_exchange(ptr::null_mut(), me, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        let _release = Release { lock: self, node: &node };
        // SAFETY: as in `with`.
        Some(f(unsafe { &mut *self.data.get() }))
    }

    /// Returns true when some thread holds or waits for the lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        !self.tail.load(Ordering::Acquire).is_null()
    }

    fn acquire(&self, node: &McsNode) {
        let me = ptr::from_ref(node).cast_mut();
        let pred = self.tail.swap(me, Ordering::AcqRel);
        if !pred.is_null() {
            // SAFETY: the predecessor's release blocks on its `next_flag`
            // before returning, so its node outlives this link handshake.
            unsafe {
                (*pred).next.store(me, Ordering::Release);
                Flag::set(&raw const (*pred).next_flag);
            }
            node.ready_flag.wait();
        }
    }

    fn release(&self, node: &McsNode) {
        let me = ptr::from_ref(node).cast_mut();
        if node.next.load(Ordering::SeqCst).is_null()
            && self
                .tail
                .compare_exchange(me, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            return;
        }
        // A successor swapped itself in; wait until it has linked.
        node.next_flag.wait();
        let next = node.next.load(Ordering::Acquire);
        // SAFETY: the successor is blocked on its `ready_flag` until this
        // set, so its node is live.
        unsafe { Flag::set(&raw const (*next).ready_flag) };
    }
}

impl<T: Default> Default for McsLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

struct Release<'a, T: ?Sized> {
    lock: &'a McsLock<T>,
    node: &'a McsNode,
}

impl<T: ?Sized> Drop for Release<'_, T> {
    fn drop(&mut self) {
        self.lock.release(self.node);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
