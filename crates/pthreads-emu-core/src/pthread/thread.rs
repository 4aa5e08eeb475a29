//! Thread identity, creation, join, detach and slot reuse.
//!
//! Every thread the library has seen owns a control block in a growable
//! arena. A handle is the block's slot index paired with the block's reuse
//! counter at the time the handle was issued. Reclaiming a block bumps the
//! counter and queues the slot for reuse (FIFO, under an MCS lock), so a
//! handle kept past its thread's reclamation never compares equal to the
//! handle of the slot's next occupant and is rejected with `ESRCH`.
//!
//! Threads started elsewhere are adopted on first contact: they get a
//! detached block, bound through a thread-local anchor whose destructor
//! retires the block when the host thread ends.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::ThreadId;

use libc::c_int;
use parking_lot::{Mutex, RwLock};

use super::cancel::{CancelControl, CancelPoint, PTHREAD_CANCELED};
use super::mcs::McsLock;
use super::unwind::{self, Abort};
use super::{cleanup, tls};
use crate::error::{Error, Result, to_errno};
use crate::kernel::{self, CriticalSection, Event, KernelSlot, WaitStatus, critical_section};
use crate::trace::{self, LogLevel};

pub use super::unwind::exit;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const PTHREAD_CREATE_JOINABLE: c_int = 0;
pub const PTHREAD_CREATE_DETACHED: c_int = 1;

/// Smallest stack accepted by [`PthreadAttr`].
pub const PTHREAD_STACK_MIN: usize = 16 * 1024;

/// Most control blocks `create` will hand out.
pub const PTHREAD_THREADS_MAX: u32 = 1 << 16;

/// Adopted threads are not capped by [`PTHREAD_THREADS_MAX`]; this is the
/// hard arena limit that keeps packed handles non-zero.
const ARENA_LIMIT: u32 = u32::MAX - 1;

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Thread handle: arena slot plus reuse generation.
///
/// The default value never names a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Pthread {
    slot: u32,
    reuse: u32,
}

impl Pthread {
    #[must_use]
    pub const fn slot(self) -> u32 {
        self.slot
    }

    #[must_use]
    pub const fn reuse(self) -> u32 {
        self.reuse
    }

    /// Single-word form used for mutex ownership and trace records.
    /// Never zero for a handle the library issued.
    #[must_use]
    pub const fn packed(self) -> u64 {
        ((self.reuse as u64) << 32) | (self.slot as u64 + 1)
    }

    #[must_use]
    pub const fn from_packed(packed: u64) -> Option<Self> {
        let low = (packed & 0xFFFF_FFFF) as u32;
        if low == 0 {
            return None;
        }
        Some(Self {
            slot: low - 1,
            reuse: (packed >> 32) as u32,
        })
    }
}

const fn next_reuse(reuse: u32) -> u32 {
    match reuse.wrapping_add(1) {
        0 => 1,
        n => n,
    }
}

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

/// Thread creation attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PthreadAttr {
    pub detach_state: c_int,
    /// 0 selects the host default.
    pub stack_size: usize,
    pub name: Option<String>,
}

impl Default for PthreadAttr {
    fn default() -> Self {
        Self {
            detach_state: PTHREAD_CREATE_JOINABLE,
            stack_size: 0,
            name: None,
        }
    }
}

impl PthreadAttr {
    #[must_use]
    pub fn detached() -> Self {
        Self {
            detach_state: PTHREAD_CREATE_DETACHED,
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.detach_state != PTHREAD_CREATE_JOINABLE && self.detach_state != PTHREAD_CREATE_DETACHED {
            return Err(Error::Invalid);
        }
        if self.stack_size != 0 && self.stack_size < PTHREAD_STACK_MIN {
            return Err(Error::Invalid);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Control blocks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ThreadPhase {
    /// On the reuse queue or never used.
    #[default]
    Free,
    Starting,
    Running,
    /// Finished, not yet reclaimed.
    Exited,
}

#[derive(Debug, Default)]
struct ControlState {
    phase: ThreadPhase,
    detached: bool,
    adopted: bool,
    join_waiters: u32,
    exit_value: usize,
    host: Option<ThreadId>,
}

pub(crate) struct ThreadBlock {
    slot: u32,
    reuse: AtomicU32,
    state: Mutex<ControlState>,
    /// Manual-reset; set once the exit value is recorded. Spawned threads only.
    terminated: KernelSlot<Event>,
    pub(crate) cancel: CancelControl,
}

impl ThreadBlock {
    fn new(slot: u32) -> Self {
        Self {
            slot,
            reuse: AtomicU32::new(1),
            state: Mutex::new(ControlState::default()),
            terminated: KernelSlot::new(),
            cancel: CancelControl::default(),
        }
    }

    fn issued(&self, handle: Pthread, state: &ControlState) -> bool {
        self.reuse.load(Ordering::Acquire) == handle.reuse && state.phase != ThreadPhase::Free
    }

    /// Zero the block and bump its generation. Caller queues the slot.
    fn retire(&self, state: &mut ControlState) -> u32 {
        *state = ControlState::default();
        let reuse = self.reuse.load(Ordering::Relaxed);
        self.reuse.store(next_reuse(reuse), Ordering::Release);
        self.terminated.take();
        self.cancel.reset();
        self.slot
    }
}

/// A handle with its block.
#[derive(Clone)]
pub(crate) struct Bound {
    pub(crate) handle: Pthread,
    pub(crate) block: Arc<ThreadBlock>,
}

struct Registry {
    blocks: RwLock<Vec<Arc<ThreadBlock>>>,
    reuse: McsLock<VecDeque<u32>>,
    adopted: CriticalSection<Option<HashMap<ThreadId, Pthread>>>,
}

static REGISTRY: Registry = Registry {
    blocks: parking_lot::const_rwlock(Vec::new()),
    reuse: McsLock::new(VecDeque::new()),
    adopted: critical_section(None),
};

fn recycle(slot: u32) {
    REGISTRY.reuse.with(|queue| queue.push_back(slot));
    trace::event(LogLevel::Trace, "thread_reclaim", |r| {
        r.with_object("thread")
            .with_details(serde_json::json!({ "slot": slot }))
    });
}

fn allocate(adopted: bool) -> Result<Bound> {
    if refused_by_test() {
        return Err(Error::Again);
    }
    let recycled = REGISTRY.reuse.with(VecDeque::pop_front);
    let block = match recycled {
        Some(slot) => REGISTRY
            .blocks
            .read()
            .get(slot as usize)
            .cloned()
            .ok_or(Error::Again)?,
        None => {
            let mut blocks = REGISTRY.blocks.write();
            let limit = if adopted { ARENA_LIMIT } else { PTHREAD_THREADS_MAX };
            let slot = u32::try_from(blocks.len())
                .ok()
                .filter(|slot| *slot < limit)
                .ok_or(Error::Again)?;
            let block = Arc::new(ThreadBlock::new(slot));
            blocks.push(Arc::clone(&block));
            block
        }
    };
    {
        let mut st = block.state.lock();
        st.phase = ThreadPhase::Starting;
        st.detached = adopted;
        st.adopted = adopted;
    }
    let handle = Pthread {
        slot: block.slot,
        reuse: block.reuse.load(Ordering::Acquire),
    };
    Ok(Bound { handle, block })
}

/// Block named by `handle`, if the handle is still current.
pub(crate) fn block_of(handle: Pthread) -> Option<Arc<ThreadBlock>> {
    let block = REGISTRY.blocks.read().get(handle.slot as usize).cloned()?;
    let issued = block.issued(handle, &block.state.lock());
    issued.then_some(block)
}

/// True while the thread behind a packed handle is still running.
pub(crate) fn packed_is_live(packed: u64) -> bool {
    Pthread::from_packed(packed)
        .and_then(block_of)
        .is_some_and(|block| {
            matches!(
                block.state.lock().phase,
                ThreadPhase::Starting | ThreadPhase::Running
            )
        })
}

// ---------------------------------------------------------------------------
// Calling-thread anchor
// ---------------------------------------------------------------------------

struct Anchor {
    bound: RefCell<Option<Bound>>,
    spawned: Cell<bool>,
}

impl Drop for Anchor {
    fn drop(&mut self) {
        if self.spawned.get() {
            return;
        }
        if let Some(bound) = self.bound.get_mut().take() {
            retire_adopted(&bound, 0);
        }
    }
}

thread_local! {
    static ANCHOR: Anchor = const {
        Anchor {
            bound: RefCell::new(None),
            spawned: Cell::new(false),
        }
    };
    static PACKED: Cell<u64> = const { Cell::new(0) };
}

fn bind(bound: &Bound, spawned: bool) {
    let _ = ANCHOR.try_with(|anchor| {
        *anchor.bound.borrow_mut() = Some(bound.clone());
        anchor.spawned.set(spawned);
    });
    let _ = PACKED.try_with(|packed| packed.set(bound.handle.packed()));
}

fn unbind() {
    let _ = ANCHOR.try_with(|anchor| {
        anchor.bound.borrow_mut().take();
        anchor.spawned.set(false);
    });
    let _ = PACKED.try_with(|packed| packed.set(0));
}

/// Handle and block of the calling thread, adopting it if needed.
///
/// `EAGAIN` when a foreign thread cannot be given a block.
pub(crate) fn try_current_bound() -> Result<Bound> {
    let bound = ANCHOR
        .try_with(|anchor| anchor.bound.borrow().clone())
        .ok()
        .flatten();
    match bound {
        Some(bound) => Ok(bound),
        None => {
            let bound = adopt()?;
            bind(&bound, false);
            Ok(bound)
        }
    }
}

/// Packed handle of the calling thread.
#[inline]
pub(crate) fn current_packed() -> u64 {
    match PACKED.try_with(Cell::get) {
        Ok(packed) if packed != 0 => packed,
        _ => current().packed(),
    }
}

pub(crate) fn current_is_spawned() -> bool {
    ANCHOR.try_with(|anchor| anchor.spawned.get()).unwrap_or(false)
}

fn adopt() -> Result<Bound> {
    let host = std::thread::current().id();
    let known = REGISTRY
        .adopted
        .lock()
        .as_ref()
        .and_then(|map| map.get(&host).copied());
    if let Some(bound) = known.and_then(|handle| block_of(handle).map(|block| Bound { handle, block })) {
        return Ok(bound);
    }

    let bound = allocate(true).inspect_err(|err| {
        trace::event(LogLevel::Error, "thread_table_exhausted", |r| {
            r.with_object("thread").with_errno(err.errno())
        });
    })?;
    {
        let mut st = bound.block.state.lock();
        st.phase = ThreadPhase::Running;
        st.host = Some(host);
    }
    REGISTRY
        .adopted
        .lock()
        .get_or_insert_with(HashMap::new)
        .insert(host, bound.handle);
    trace::event(LogLevel::Debug, "thread_adopt", |r| {
        r.with_thread(bound.handle.packed()).with_object("thread")
    });
    Ok(bound)
}

/// Identity of a foreign thread that could not be adopted. Distinct per
/// host thread and never issued by the arena, so `kill` and `join` on it
/// report `ESRCH`. The next successful adoption replaces it.
fn unregistered() -> Pthread {
    static NEXT: AtomicU32 = AtomicU32::new(1);
    thread_local! {
        static ID: Cell<u32> = const { Cell::new(0) };
    }
    let reuse = ID
        .try_with(|id| {
            if id.get() == 0 {
                id.set(next_reuse(NEXT.fetch_add(1, Ordering::Relaxed)));
            }
            id.get()
        })
        .unwrap_or(0);
    Pthread {
        slot: ARENA_LIMIT,
        reuse,
    }
}

thread_local! {
    static REFUSED_SLOTS: Cell<u32> = const { Cell::new(0) };
}

/// Make the calling thread's next `count` block allocations fail with `EAGAIN`.
#[doc(hidden)]
pub fn refuse_slots_for_tests(count: u32) {
    REFUSED_SLOTS.with(|refused| refused.set(count));
}

fn refused_by_test() -> bool {
    REFUSED_SLOTS
        .try_with(|refused| match refused.get() {
            0 => false,
            n => {
                refused.set(n - 1);
                true
            }
        })
        .unwrap_or(false)
}

fn retire_adopted(bound: &Bound, exit_value: usize) {
    let (host, slot) = {
        let mut st = bound.block.state.lock();
        if !bound.block.issued(bound.handle, &st) {
            return;
        }
        st.exit_value = exit_value;
        st.phase = ThreadPhase::Exited;
        let host = st.host;
        (host, bound.block.retire(&mut st))
    };
    if let Some(host) = host {
        if let Some(map) = REGISTRY.adopted.lock().as_mut() {
            map.remove(&host);
        }
    }
    trace::event(LogLevel::Debug, "thread_exit", |r| {
        r.with_thread(bound.handle.packed())
            .with_object("thread")
            .with_details(serde_json::json!({ "adopted": true, "exit_value": exit_value }))
    });
    recycle(slot);
}

/// Finish an adopted thread that is leaving through exit or cancellation.
pub(crate) fn finish_adopted(abort: Abort) {
    let bound = try_current_bound();
    contain("cleanup", cleanup::run_all);
    contain("tsd", tls::run_destructors);
    unbind();
    if let Ok(bound) = bound {
        retire_adopted(&bound, abort.exit_value());
    }
}

/// Run exit-time work, keeping a panic in it from skipping the rest.
fn contain<R>(stage: &'static str, work: impl FnOnce() -> R) {
    if panic::catch_unwind(AssertUnwindSafe(work)).is_err() {
        trace::event(LogLevel::Error, "exit_stage_panicked", |r| {
            r.with_object("thread")
                .with_details(serde_json::json!({ "stage": stage }))
        });
    }
}

// ---------------------------------------------------------------------------
// Creation and exit
// ---------------------------------------------------------------------------

/// Start a thread running `start`; its return value becomes the exit value.
pub fn spawn<F>(attr: Option<&PthreadAttr>, start: F) -> Result<Pthread>
where
    F: FnOnce() -> usize + Send + 'static,
{
    let default_attr = PthreadAttr::default();
    let attr = attr.unwrap_or(&default_attr);
    attr.validate()?;

    let bound = allocate(false)?;
    let handle = bound.handle;
    let rollback = |bound: &Bound| {
        let slot = bound.block.retire(&mut bound.block.state.lock());
        recycle(slot);
    };

    let terminated = match Event::new(true, false) {
        Ok(event) => event,
        Err(err) => {
            rollback(&bound);
            return Err(err);
        }
    };
    bound.block.terminated.install(terminated);
    bound.block.cancel.reset();
    bound.block.state.lock().detached = attr.detach_state == PTHREAD_CREATE_DETACHED;

    let child = bound.clone();
    let name = attr
        .name
        .clone()
        .or_else(|| Some(format!("pthread-{}", handle.slot)));
    if let Err(err) = kernel::spawn_host(name, attr.stack_size, move || trampoline(child, start)) {
        rollback(&bound);
        trace::event(LogLevel::Warn, "thread_spawn_failed", |r| {
            r.with_object("thread").with_errno(err.errno())
        });
        return Err(err);
    }
    trace::event(LogLevel::Debug, "thread_spawn", |r| {
        r.with_thread(handle.packed()).with_object("thread")
    });
    Ok(handle)
}

fn trampoline<F>(bound: Bound, start: F)
where
    F: FnOnce() -> usize,
{
    bind(&bound, true);
    {
        let mut st = bound.block.state.lock();
        st.phase = ThreadPhase::Running;
        st.host = Some(std::thread::current().id());
    }

    let (exit_value, foreign_panic) = match panic::catch_unwind(AssertUnwindSafe(start)) {
        Ok(value) => {
            cleanup::discard_all();
            (value, None)
        }
        Err(payload) => {
            contain("cleanup", cleanup::run_all);
            match unwind::classify(payload) {
                Ok(abort) => (abort.exit_value(), None),
                Err(payload) => {
                    trace::event(LogLevel::Error, "thread_panicked", |r| {
                        r.with_thread(bound.handle.packed()).with_object("thread")
                    });
                    (PTHREAD_CANCELED, Some(payload))
                }
            }
        }
    };
    contain("tsd", tls::run_destructors);
    unbind();

    let recycled = {
        let mut st = bound.block.state.lock();
        st.exit_value = exit_value;
        st.phase = ThreadPhase::Exited;
        if let Some(event) = bound.block.terminated.get() {
            event.set();
        }
        (st.detached && st.join_waiters == 0).then(|| bound.block.retire(&mut st))
    };
    trace::event(LogLevel::Debug, "thread_exit", |r| {
        r.with_thread(bound.handle.packed())
            .with_object("thread")
            .with_details(serde_json::json!({ "exit_value": exit_value }))
    });
    if let Some(slot) = recycled {
        recycle(slot);
    }
    if let Some(payload) = foreign_panic {
        panic::resume_unwind(payload);
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Handle of the calling thread.
#[must_use]
pub fn current() -> Pthread {
    try_current_bound().map_or_else(|_| unregistered(), |bound| bound.handle)
}

#[must_use]
pub fn equal(a: Pthread, b: Pthread) -> bool {
    a == b
}

/// Liveness probe. Only signal 0 is supported.
pub fn kill(target: Pthread, signal: c_int) -> Result<()> {
    if signal != 0 {
        return Err(Error::Invalid);
    }
    if packed_is_live(target.packed()) {
        Ok(())
    } else {
        Err(Error::NoSuchThread)
    }
}

// ---------------------------------------------------------------------------
// Join and detach
// ---------------------------------------------------------------------------

/// Wait for `target` to finish and take its exit value.
///
/// A cancellation point. The last of several concurrent joiners reclaims
/// the target's block.
pub fn join(target: Pthread) -> Result<usize> {
    if target == current() {
        return Err(Error::Deadlock);
    }
    let point = CancelPoint::enter()?;
    let block = block_of(target).ok_or(Error::NoSuchThread)?;
    let terminated = {
        let mut st = block.state.lock();
        if !block.issued(target, &st) {
            return Err(Error::NoSuchThread);
        }
        if st.detached {
            return Err(Error::Invalid);
        }
        st.join_waiters += 1;
        block.terminated.get()
    };

    let status = terminated.map_or(WaitStatus::Signaled, |event| event.wait(None, point.alert()));

    let (value, recycled) = {
        let mut st = block.state.lock();
        st.join_waiters -= 1;
        if status == WaitStatus::Alerted {
            drop(st);
            return Err(point.interrupted());
        }
        let value = st.exit_value;
        let recycled = (st.join_waiters == 0).then(|| block.retire(&mut st));
        (value, recycled)
    };
    if let Some(slot) = recycled {
        recycle(slot);
    }
    trace::event(LogLevel::Debug, "thread_join", |r| {
        r.with_thread(target.packed()).with_object("thread")
    });
    Ok(value)
}

/// Mark `target` detached; an already finished thread is reclaimed now.
pub fn detach(target: Pthread) -> Result<()> {
    let block = block_of(target).ok_or(Error::NoSuchThread)?;
    let recycled = {
        let mut st = block.state.lock();
        if !block.issued(target, &st) {
            return Err(Error::NoSuchThread);
        }
        if st.detached {
            return Err(Error::Invalid);
        }
        st.detached = true;
        (st.phase == ThreadPhase::Exited && st.join_waiters == 0).then(|| block.retire(&mut st))
    };
    if let Some(slot) = recycled {
        recycle(slot);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// POSIX surface
// ---------------------------------------------------------------------------

pub fn pthread_attr_init(attr: &mut PthreadAttr) -> c_int {
    *attr = PthreadAttr::default();
    0
}

pub fn pthread_attr_destroy(attr: &mut PthreadAttr) -> c_int {
    attr.name = None;
    0
}

pub fn pthread_attr_setdetachstate(attr: &mut PthreadAttr, state: c_int) -> c_int {
    if state != PTHREAD_CREATE_JOINABLE && state != PTHREAD_CREATE_DETACHED {
        return to_errno(Err(Error::Invalid));
    }
    attr.detach_state = state;
    0
}

pub fn pthread_attr_getdetachstate(attr: &PthreadAttr, state: &mut c_int) -> c_int {
    *state = attr.detach_state;
    0
}

pub fn pthread_attr_setstacksize(attr: &mut PthreadAttr, size: usize) -> c_int {
    if size < PTHREAD_STACK_MIN {
        return to_errno(Err(Error::Invalid));
    }
    attr.stack_size = size;
    0
}

pub fn pthread_attr_getstacksize(attr: &PthreadAttr, size: &mut usize) -> c_int {
    *size = attr.stack_size;
    0
}

pub fn pthread_create(
    thread: &mut Pthread,
    attr: Option<&PthreadAttr>,
    start: fn(usize) -> usize,
    arg: usize,
) -> c_int {
    match spawn(attr, move || start(arg)) {
        Ok(handle) => {
            *thread = handle;
            0
        }
        Err(err) => err.errno(),
    }
}

pub fn pthread_join(thread: Pthread, value: Option<&mut usize>) -> c_int {
    match unwind::settle(join(thread)) {
        Ok(exit_value) => {
            if let Some(slot) = value {
                *slot = exit_value;
            }
            0
        }
        Err(errno) => errno,
    }
}

pub fn pthread_detach(thread: Pthread) -> c_int {
    to_errno(detach(thread))
}

pub fn pthread_self() -> Pthread {
    current()
}

pub fn pthread_equal(a: Pthread, b: Pthread) -> c_int {
    c_int::from(equal(a, b))
}

pub fn pthread_exit(value: usize) -> ! {
    exit(value)
}

pub fn pthread_kill(thread: Pthread, signal: c_int) -> c_int {
    to_errno(kill(thread, signal))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
