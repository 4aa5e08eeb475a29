//! POSIX mutexes.
//!
//! Three kinds share one lock word (`lock_idx`): 0 free, 1 locked, -1 locked
//! with possible waiters. Acquirers that lose the race exchange in -1 and
//! park on an auto-reset kernel event until an exchange returns 0; an
//! unlock that swaps out -1 sets the event.
//!
//! - NORMAL keeps no owner, so unlock by any thread succeeds and relocking
//!   by the holder deadlocks.
//! - RECURSIVE and ERRORCHECK record the owner's packed thread identity;
//!   relocking either increments a recursion count or fails with `EDEADLK`.
//!
//! Statically initialised mutexes create their event on first use (see
//! [`static_init`](super::static_init)).

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::time::SystemTime;

use libc::{c_int, timespec};

use super::static_init::{Lifecycle, Phase};
use super::{PTHREAD_PROCESS_PRIVATE, PTHREAD_PROCESS_SHARED, thread};
use crate::errno;
use crate::error::{Error, Result, to_errno};
use crate::kernel::{Event, KernelSlot, WaitStatus};
use crate::time::deadline_from_timespec;

// ---------------------------------------------------------------------------
// Mutex type constants
// ---------------------------------------------------------------------------

/// Normal (default) mutex: no error checking, no recursive locking.
pub const PTHREAD_MUTEX_NORMAL: i32 = 0;
/// Recursive mutex: the owning thread can re-lock without deadlock.
pub const PTHREAD_MUTEX_RECURSIVE: i32 = 1;
/// Error-checking mutex: returns EDEADLK on recursive lock.
pub const PTHREAD_MUTEX_ERRORCHECK: i32 = 2;
/// Default mutex type.
pub const PTHREAD_MUTEX_DEFAULT: i32 = PTHREAD_MUTEX_NORMAL;

/// No priority protocol.
pub const PTHREAD_PRIO_NONE: i32 = 0;
/// Priority inheritance (not supported).
pub const PTHREAD_PRIO_INHERIT: i32 = 1;
/// Priority protection (not supported).
pub const PTHREAD_PRIO_PROTECT: i32 = 2;

const UNLOCKED: i32 = 0;
const LOCKED: i32 = 1;
const CONTENDED: i32 = -1;

/// Owner word for NORMAL mutexes, which do not track their holder.
const OWNER_NONE: u64 = 0;

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

/// Mutex creation attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PthreadMutexAttr {
    pub kind: i32,
    pub pshared: i32,
    pub robust: bool,
    pub protocol: i32,
}

impl Default for PthreadMutexAttr {
    fn default() -> Self {
        Self {
            kind: PTHREAD_MUTEX_DEFAULT,
            pshared: PTHREAD_PROCESS_PRIVATE,
            robust: false,
            protocol: PTHREAD_PRIO_NONE,
        }
    }
}

impl PthreadMutexAttr {
    #[must_use]
    pub fn with_kind(kind: i32) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    fn contract(&self) -> MutexAttributeContract {
        MutexAttributeContract {
            process_shared: self.pshared == PTHREAD_PROCESS_SHARED,
            robust: self.robust,
            priority_inherit: self.protocol == PTHREAD_PRIO_INHERIT,
            priority_protect: self.protocol == PTHREAD_PRIO_PROTECT,
        }
    }
}

/// Optional attribute classes a mutex may be asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MutexAttributeContract {
    /// `PTHREAD_PROCESS_SHARED`.
    pub process_shared: bool,
    /// Robust mutex mode.
    pub robust: bool,
    /// Priority inheritance protocol.
    pub priority_inherit: bool,
    /// Priority protection protocol.
    pub priority_protect: bool,
}

/// Returns true when the attribute profile can be honoured.
#[must_use]
pub const fn mutex_attr_is_supported(attrs: MutexAttributeContract) -> bool {
    !(attrs.process_shared || attrs.robust || attrs.priority_inherit || attrs.priority_protect)
}

/// Errno for an attribute profile: process sharing is `ENOSYS`, the other
/// optional features `ENOTSUP`.
#[must_use]
pub const fn mutex_attr_support_errno(attrs: MutexAttributeContract) -> i32 {
    if attrs.process_shared {
        errno::ENOSYS
    } else if mutex_attr_is_supported(attrs) {
        0
    } else {
        errno::ENOTSUP
    }
}

// ---------------------------------------------------------------------------
// Semantics contract
// ---------------------------------------------------------------------------

/// Abstract mutex state used by the transition contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexContractState {
    /// Built from a static initialiser and never used.
    StaticInitializer,
    /// Mutex is initialized and currently unlocked.
    Unlocked,
    /// Mutex is locked by the calling thread.
    LockedBySelf,
    /// Mutex is locked by a different thread.
    LockedByOther,
    /// Mutex has been destroyed (or was never initialised).
    Destroyed,
}

/// Contract-level operation set for mutex transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexContractOp {
    Init,
    Lock,
    TryLock,
    Unlock,
    Destroy,
}

/// Deterministic transition result for a contract operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutexContractOutcome {
    /// Next abstract state after applying the operation.
    pub next: MutexContractState,
    /// POSIX errno-style result (0 on success).
    pub errno: i32,
    /// Whether the operation may block awaiting progress by another thread.
    pub blocks: bool,
}

const fn outcome(next: MutexContractState, errno: i32, blocks: bool) -> MutexContractOutcome {
    MutexContractOutcome { next, errno, blocks }
}

/// Transition table for NORMAL/ERRORCHECK/RECURSIVE mutexes, as implemented
/// by [`PthreadMutex`] for an uncontended lock word.
#[must_use]
pub const fn mutex_contract_transition(
    kind: i32,
    state: MutexContractState,
    op: MutexContractOp,
) -> MutexContractOutcome {
    use MutexContractOp as Op;
    use MutexContractState as S;

    if !valid_mutex_type(kind) {
        return outcome(state, errno::EINVAL, false);
    }

    match state {
        S::StaticInitializer => match op {
            Op::Init => outcome(S::Unlocked, 0, false),
            Op::Lock | Op::TryLock => outcome(S::LockedBySelf, 0, false),
            Op::Unlock => outcome(S::StaticInitializer, errno::EPERM, false),
            Op::Destroy => outcome(S::Destroyed, 0, false),
        },
        S::Destroyed => match op {
            Op::Init => outcome(S::Unlocked, 0, false),
            _ => outcome(S::Destroyed, errno::EINVAL, false),
        },
        S::Unlocked => match op {
            Op::Init => outcome(S::Unlocked, errno::EBUSY, false),
            Op::Lock | Op::TryLock => outcome(S::LockedBySelf, 0, false),
            Op::Unlock => outcome(S::Unlocked, errno::EPERM, false),
            Op::Destroy => outcome(S::Destroyed, 0, false),
        },
        S::LockedByOther => match op {
            Op::Init => outcome(S::LockedByOther, errno::EBUSY, false),
            Op::Lock => outcome(S::LockedByOther, 0, true),
            Op::TryLock => outcome(S::LockedByOther, errno::EBUSY, false),
            // NORMAL has no owner to compare against: the caller is taken
            // to be the holder.
            Op::Unlock if kind == PTHREAD_MUTEX_NORMAL => outcome(S::Unlocked, 0, false),
            Op::Unlock => outcome(S::LockedByOther, errno::EPERM, false),
            Op::Destroy if kind == PTHREAD_MUTEX_NORMAL => outcome(S::Destroyed, 0, false),
            Op::Destroy => outcome(S::LockedByOther, errno::EBUSY, false),
        },
        S::LockedBySelf => match op {
            Op::Init => outcome(S::LockedBySelf, errno::EBUSY, false),
            Op::Destroy => outcome(S::Destroyed, 0, false),
            Op::Unlock => outcome(S::Unlocked, 0, false),
            Op::TryLock if kind == PTHREAD_MUTEX_RECURSIVE => outcome(S::LockedBySelf, 0, false),
            Op::TryLock => outcome(S::LockedBySelf, errno::EBUSY, false),
            Op::Lock if kind == PTHREAD_MUTEX_RECURSIVE => outcome(S::LockedBySelf, 0, false),
            Op::Lock if kind == PTHREAD_MUTEX_ERRORCHECK => {
                outcome(S::LockedBySelf, errno::EDEADLK, false)
            }
            Op::Lock => outcome(S::LockedBySelf, 0, true),
        },
    }
}

// ---------------------------------------------------------------------------
// Validators
// ---------------------------------------------------------------------------

/// Returns true if `kind` is a recognized mutex type.
#[must_use]
pub const fn valid_mutex_type(kind: i32) -> bool {
    matches!(
        kind,
        PTHREAD_MUTEX_NORMAL | PTHREAD_MUTEX_RECURSIVE | PTHREAD_MUTEX_ERRORCHECK
    )
}

fn validate_attr(attr: Option<&PthreadMutexAttr>) -> Result<i32> {
    let Some(attr) = attr else {
        return Ok(PTHREAD_MUTEX_DEFAULT);
    };
    if !valid_mutex_type(attr.kind) {
        return Err(Error::Invalid);
    }
    match mutex_attr_support_errno(attr.contract()) {
        0 => Ok(attr.kind),
        code => Err(Error::from_errno(code).unwrap_or(Error::Invalid)),
    }
}

// ---------------------------------------------------------------------------
// Mutex
// ---------------------------------------------------------------------------

/// POSIX mutex.
pub struct PthreadMutex {
    life: Lifecycle,
    kind: AtomicI32,
    lock_idx: AtomicI32,
    /// Packed identity of the holder (RECURSIVE and ERRORCHECK only).
    owner: AtomicU64,
    /// Recursion depth; only the holder touches it.
    count: AtomicU32,
    event: KernelSlot<Event>,
}

/// Static initialiser for a NORMAL mutex.
pub const PTHREAD_MUTEX_INITIALIZER: PthreadMutex = PthreadMutex::static_initializer(PTHREAD_MUTEX_NORMAL);
/// Static initialiser for a RECURSIVE mutex.
pub const PTHREAD_RECURSIVE_MUTEX_INITIALIZER: PthreadMutex =
    PthreadMutex::static_initializer(PTHREAD_MUTEX_RECURSIVE);
/// Static initialiser for an ERRORCHECK mutex.
pub const PTHREAD_ERRORCHECK_MUTEX_INITIALIZER: PthreadMutex =
    PthreadMutex::static_initializer(PTHREAD_MUTEX_ERRORCHECK);

impl PthreadMutex {
    /// Constant-initialised mutex of `kind`; creates nothing until used.
    #[must_use]
    pub const fn static_initializer(kind: i32) -> Self {
        Self {
            life: Lifecycle::new_static(),
            kind: AtomicI32::new(kind),
            lock_idx: AtomicI32::new(UNLOCKED),
            owner: AtomicU64::new(OWNER_NONE),
            count: AtomicU32::new(0),
            event: KernelSlot::new(),
        }
    }

    /// Storage that has not been initialised yet; every operation but
    /// [`init`](Self::init) fails with `EINVAL`.
    #[must_use]
    pub const fn uninit() -> Self {
        Self {
            life: Lifecycle::new_destroyed(),
            kind: AtomicI32::new(PTHREAD_MUTEX_DEFAULT),
            lock_idx: AtomicI32::new(UNLOCKED),
            owner: AtomicU64::new(OWNER_NONE),
            count: AtomicU32::new(0),
            event: KernelSlot::new(),
        }
    }

    /// Initialised mutex.
    pub fn new(attr: Option<&PthreadMutexAttr>) -> Result<Self> {
        let mutex = Self::uninit();
        mutex.init(attr)?;
        Ok(mutex)
    }

    /// (Re)initialise in place. `EBUSY` if already initialised.
    pub fn init(&self, attr: Option<&PthreadMutexAttr>) -> Result<()> {
        let kind = validate_attr(attr)?;
        self.life.initialize(|| {
            self.kind.store(kind, Ordering::Relaxed);
            self.setup()
        })
    }

    fn setup(&self) -> Result<()> {
        let event = Event::new(false, false)?;
        self.lock_idx.store(UNLOCKED, Ordering::Relaxed);
        self.owner.store(OWNER_NONE, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
        self.event.install(event);
        Ok(())
    }

    /// Internal init for a mutex embedded in a composite primitive that
    /// already holds the admission guard.
    pub(crate) fn setup_embedded(&self, kind: i32) -> Result<()> {
        self.kind.store(kind, Ordering::Relaxed);
        self.setup()?;
        self.life.mark_ready();
        Ok(())
    }

    pub(crate) fn teardown_embedded(&self) {
        self.life.mark_destroyed();
        self.event.take();
    }

    #[inline]
    fn ready(&self) -> Result<()> {
        self.life.ensure("mutex", || self.setup())
    }

    /// Kind this mutex was initialised with.
    #[must_use]
    pub fn kind(&self) -> i32 {
        self.kind.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.life.phase()
    }

    /// Returns true while some thread holds the mutex.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.lock_idx.load(Ordering::Acquire) != UNLOCKED
    }

    pub fn lock(&self) -> Result<()> {
        self.acquire(None)
    }

    /// Lock with an absolute real-time deadline.
    ///
    /// A free mutex is taken even when the deadline has passed; a held one
    /// fails with `ETIMEDOUT` once it has.
    pub fn timed_lock(&self, deadline: SystemTime) -> Result<()> {
        self.acquire(Some(deadline))
    }

    fn acquire(&self, deadline: Option<SystemTime>) -> Result<()> {
        self.ready()?;
        let kind = self.kind();
        if kind == PTHREAD_MUTEX_NORMAL {
            if self.lock_idx.swap(LOCKED, Ordering::Acquire) != UNLOCKED {
                self.block(deadline)?;
            }
            return Ok(());
        }

        let me = thread::current_packed();
        if self
            .lock_idx
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            if self.owner.load(Ordering::Relaxed) == me {
                return self.relock(kind);
            }
            self.block(deadline)?;
        }
        self.count.store(1, Ordering::Relaxed);
        self.owner.store(me, Ordering::Relaxed);
        Ok(())
    }

    fn relock(&self, kind: i32) -> Result<()> {
        if kind != PTHREAD_MUTEX_RECURSIVE {
            return Err(Error::Deadlock);
        }
        let depth = self.count.load(Ordering::Relaxed);
        let next = depth.checked_add(1).ok_or(Error::Again)?;
        self.count.store(next, Ordering::Relaxed);
        Ok(())
    }

    /// Park until an exchange of `CONTENDED` observes the mutex free.
    fn block(&self, deadline: Option<SystemTime>) -> Result<()> {
        let event: Arc<Event> = self.event.get().ok_or(Error::Invalid)?;
        while self.lock_idx.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
            match event.wait(deadline, None) {
                WaitStatus::Signaled | WaitStatus::Alerted => {}
                WaitStatus::TimedOut => return Err(Error::TimedOut),
            }
        }
        Ok(())
    }

    pub fn try_lock(&self) -> Result<()> {
        self.ready()?;
        let kind = self.kind();
        if self
            .lock_idx
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            if kind != PTHREAD_MUTEX_NORMAL {
                self.count.store(1, Ordering::Relaxed);
                self.owner.store(thread::current_packed(), Ordering::Relaxed);
            }
            return Ok(());
        }
        if kind == PTHREAD_MUTEX_RECURSIVE && self.owner.load(Ordering::Relaxed) == thread::current_packed() {
            return self.relock(kind);
        }
        Err(Error::Busy)
    }

    pub fn unlock(&self) -> Result<()> {
        match self.life.phase() {
            Phase::Ready => {}
            // Never locked, so nobody owns it.
            Phase::Static => return Err(Error::NotPermitted),
            Phase::Destroyed => return Err(Error::Invalid),
        }
        let kind = self.kind();
        if kind == PTHREAD_MUTEX_NORMAL {
            return match self.lock_idx.swap(UNLOCKED, Ordering::Release) {
                UNLOCKED => Err(Error::NotPermitted),
                CONTENDED => {
                    self.wake();
                    Ok(())
                }
                _ => Ok(()),
            };
        }

        if self.lock_idx.load(Ordering::Relaxed) == UNLOCKED
            || self.owner.load(Ordering::Relaxed) != thread::current_packed()
        {
            return Err(Error::NotPermitted);
        }
        let depth = self.count.load(Ordering::Relaxed);
        if kind == PTHREAD_MUTEX_RECURSIVE && depth > 1 {
            self.count.store(depth - 1, Ordering::Relaxed);
            return Ok(());
        }
        self.count.store(0, Ordering::Relaxed);
        self.owner.store(OWNER_NONE, Ordering::Relaxed);
        if self.lock_idx.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            self.wake();
        }
        Ok(())
    }

    fn wake(&self) {
        if let Some(event) = self.event.get() {
            event.set();
        }
    }

    /// Destroy. `EBUSY` while another live thread holds the mutex or
    /// threads are queued on it.
    pub fn destroy(&self) -> Result<()> {
        self.life.destroy("mutex", || {
            let taken = self
                .lock_idx
                .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok();
            if !taken {
                if self.lock_idx.load(Ordering::Relaxed) == CONTENDED {
                    return Err(Error::Busy);
                }
                if self.kind() != PTHREAD_MUTEX_NORMAL {
                    let owner = self.owner.load(Ordering::Relaxed);
                    if owner != thread::current_packed() && thread::packed_is_live(owner) {
                        return Err(Error::Busy);
                    }
                }
            }
            self.owner.store(OWNER_NONE, Ordering::Relaxed);
            self.count.store(0, Ordering::Relaxed);
            self.lock_idx.store(UNLOCKED, Ordering::Release);
            self.event.take();
            Ok(())
        })
    }
}

impl Default for PthreadMutex {
    fn default() -> Self {
        PTHREAD_MUTEX_INITIALIZER
    }
}

impl std::fmt::Debug for PthreadMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PthreadMutex")
            .field("phase", &self.phase())
            .field("kind", &self.kind())
            .field("lock_idx", &self.lock_idx.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// POSIX surface
// ---------------------------------------------------------------------------

pub fn pthread_mutex_init(mutex: &PthreadMutex, attr: Option<&PthreadMutexAttr>) -> c_int {
    to_errno(mutex.init(attr))
}

pub fn pthread_mutex_destroy(mutex: &PthreadMutex) -> c_int {
    to_errno(mutex.destroy())
}

pub fn pthread_mutex_lock(mutex: &PthreadMutex) -> c_int {
    to_errno(mutex.lock())
}

pub fn pthread_mutex_trylock(mutex: &PthreadMutex) -> c_int {
    to_errno(mutex.try_lock())
}

pub fn pthread_mutex_timedlock(mutex: &PthreadMutex, abstime: &timespec) -> c_int {
    to_errno(deadline_from_timespec(abstime).and_then(|deadline| mutex.timed_lock(deadline)))
}

pub fn pthread_mutex_unlock(mutex: &PthreadMutex) -> c_int {
    to_errno(mutex.unlock())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel;
    use std::time::Duration;

    #[test]
    fn mutex_type_constants() {
        assert_eq!(PTHREAD_MUTEX_NORMAL, 0);
        assert_eq!(PTHREAD_MUTEX_RECURSIVE, 1);
        assert_eq!(PTHREAD_MUTEX_ERRORCHECK, 2);
        assert_eq!(PTHREAD_MUTEX_DEFAULT, PTHREAD_MUTEX_NORMAL);
    }

    #[test]
    fn valid_mutex_type_check() {
        assert!(valid_mutex_type(PTHREAD_MUTEX_NORMAL));
        assert!(valid_mutex_type(PTHREAD_MUTEX_RECURSIVE));
        assert!(valid_mutex_type(PTHREAD_MUTEX_ERRORCHECK));
        assert!(!valid_mutex_type(3));
        assert!(!valid_mutex_type(-1));
    }

    #[test]
    fn attr_matrix_rejects_optional_features() {
        let supported = MutexAttributeContract::default();
        assert!(mutex_attr_is_supported(supported));
        assert_eq!(mutex_attr_support_errno(supported), 0);

        let robust = MutexAttributeContract {
            robust: true,
            ..MutexAttributeContract::default()
        };
        assert_eq!(mutex_attr_support_errno(robust), errno::ENOTSUP);

        let pshared = MutexAttributeContract {
            process_shared: true,
            ..MutexAttributeContract::default()
        };
        assert_eq!(mutex_attr_support_errno(pshared), errno::ENOSYS);
    }

    #[test]
    fn init_rejects_process_shared_and_bad_kind() {
        let m = PthreadMutex::uninit();
        let shared = PthreadMutexAttr {
            pshared: PTHREAD_PROCESS_SHARED,
            ..PthreadMutexAttr::default()
        };
        assert_eq!(m.init(Some(&shared)), Err(Error::NotImplemented));
        assert_eq!(m.init(Some(&PthreadMutexAttr::with_kind(7))), Err(Error::Invalid));
        assert_eq!(m.lock(), Err(Error::Invalid));
        m.init(None).unwrap();
        assert_eq!(m.init(None), Err(Error::Busy));
    }

    #[test]
    fn contract_normal_relock_blocks() {
        let outcome = mutex_contract_transition(
            PTHREAD_MUTEX_NORMAL,
            MutexContractState::LockedBySelf,
            MutexContractOp::Lock,
        );
        assert_eq!(outcome.next, MutexContractState::LockedBySelf);
        assert!(outcome.blocks);
    }

    #[test]
    fn contract_errorcheck_relock_is_edeadlk() {
        let outcome = mutex_contract_transition(
            PTHREAD_MUTEX_ERRORCHECK,
            MutexContractState::LockedBySelf,
            MutexContractOp::Lock,
        );
        assert_eq!(outcome.errno, errno::EDEADLK);
        assert!(!outcome.blocks);
    }

    #[test]
    fn contract_unknown_kind_is_einval() {
        let outcome = mutex_contract_transition(9, MutexContractState::Unlocked, MutexContractOp::Lock);
        assert_eq!(outcome.next, MutexContractState::Unlocked);
        assert_eq!(outcome.errno, errno::EINVAL);
    }

    #[test]
    fn errorcheck_relock_and_foreign_unlock() {
        let m = Arc::new(PthreadMutex::new(Some(&PthreadMutexAttr::with_kind(PTHREAD_MUTEX_ERRORCHECK))).unwrap());
        m.lock().unwrap();
        assert_eq!(m.lock(), Err(Error::Deadlock));
        assert_eq!(m.try_lock(), Err(Error::Busy));
        let other = Arc::clone(&m);
        let foreign = std::thread::spawn(move || other.unlock()).join().unwrap();
        assert_eq!(foreign, Err(Error::NotPermitted));
        m.unlock().unwrap();
        assert_eq!(m.unlock(), Err(Error::NotPermitted));
    }

    #[test]
    fn recursive_trylock_counts_depth() {
        let m = PTHREAD_RECURSIVE_MUTEX_INITIALIZER;
        m.lock().unwrap();
        m.try_lock().unwrap();
        m.lock().unwrap();
        m.unlock().unwrap();
        m.unlock().unwrap();
        assert!(m.is_locked());
        m.unlock().unwrap();
        assert!(!m.is_locked());
        assert_eq!(m.unlock(), Err(Error::NotPermitted));
    }

    #[test]
    fn normal_unlock_of_free_mutex_is_eperm() {
        let m = PthreadMutex::new(None).unwrap();
        assert_eq!(m.unlock(), Err(Error::NotPermitted));
        m.lock().unwrap();
        m.unlock().unwrap();
    }

    #[test]
    fn static_unlock_and_destroyed_use() {
        let m = PTHREAD_MUTEX_INITIALIZER;
        assert_eq!(m.unlock(), Err(Error::NotPermitted));
        m.destroy().unwrap();
        assert_eq!(m.lock(), Err(Error::Invalid));
        assert_eq!(m.unlock(), Err(Error::Invalid));
        assert_eq!(m.destroy(), Err(Error::Invalid));
        m.init(None).unwrap();
        m.lock().unwrap();
        m.unlock().unwrap();
    }

    #[test]
    fn timed_lock_on_free_mutex_succeeds_past_deadline() {
        let m = PthreadMutex::new(None).unwrap();
        let past = kernel::clock::now() - Duration::from_secs(1);
        m.timed_lock(past).unwrap();
        assert_eq!(m.timed_lock(past), Err(Error::TimedOut));
        m.unlock().unwrap();
    }

    #[test]
    fn timed_lock_times_out_against_holder() {
        let m = Arc::new(PthreadMutex::new(None).unwrap());
        m.lock().unwrap();
        let other = Arc::clone(&m);
        let started = std::time::Instant::now();
        let r = std::thread::spawn(move || {
            other.timed_lock(kernel::clock::now() + Duration::from_millis(30))
        })
        .join()
        .unwrap();
        assert_eq!(r, Err(Error::TimedOut));
        assert!(started.elapsed() >= Duration::from_millis(25));
        m.unlock().unwrap();
        m.lock().unwrap();
        m.unlock().unwrap();
    }

    #[test]
    fn destroy_refuses_foreign_owner() {
        let m = Arc::new(PthreadMutex::new(Some(&PthreadMutexAttr::with_kind(PTHREAD_MUTEX_RECURSIVE))).unwrap());
        let holder = Arc::clone(&m);
        let locked = Arc::new(std::sync::Barrier::new(2));
        let finish = Arc::new(std::sync::Barrier::new(2));
        let t = {
            let (locked, finish) = (Arc::clone(&locked), Arc::clone(&finish));
            std::thread::spawn(move || {
                holder.lock().unwrap();
                locked.wait();
                finish.wait();
                holder.unlock().unwrap();
            })
        };
        locked.wait();
        assert_eq!(m.destroy(), Err(Error::Busy));
        finish.wait();
        t.join().unwrap();
        m.destroy().unwrap();
    }

    #[test]
    fn owner_may_destroy_locked_mutex() {
        let m = PthreadMutex::new(Some(&PthreadMutexAttr::with_kind(PTHREAD_MUTEX_ERRORCHECK))).unwrap();
        m.lock().unwrap();
        m.destroy().unwrap();
        assert_eq!(m.phase(), Phase::Destroyed);
    }

    #[test]
    fn kernel_failure_during_init_rolls_back() {
        std::thread::spawn(|| {
            let m = PthreadMutex::uninit();
            kernel::fail_next_creations_for_tests(1);
            assert_eq!(m.init(None), Err(Error::Again));
            assert_eq!(m.phase(), Phase::Destroyed);
            m.init(None).unwrap();

            let s = PTHREAD_MUTEX_INITIALIZER;
            kernel::fail_next_creations_for_tests(1);
            assert_eq!(s.lock(), Err(Error::Again));
            assert_eq!(s.phase(), Phase::Static);
            s.lock().unwrap();
            s.unlock().unwrap();
        })
        .join()
        .unwrap();
    }

    #[test]
    fn posix_surface_returns_errno() {
        let m = PthreadMutex::uninit();
        assert_eq!(pthread_mutex_lock(&m), errno::EINVAL);
        assert_eq!(pthread_mutex_init(&m, None), 0);
        assert_eq!(pthread_mutex_trylock(&m), 0);
        assert_eq!(pthread_mutex_trylock(&m), errno::EBUSY);
        let bad = timespec { tv_sec: 0, tv_nsec: -1 };
        assert_eq!(pthread_mutex_timedlock(&m, &bad), errno::EINVAL);
        assert_eq!(pthread_mutex_unlock(&m), 0);
        assert_eq!(pthread_mutex_destroy(&m), 0);
    }
}
