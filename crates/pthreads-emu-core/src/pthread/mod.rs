//! POSIX threads.
//!
//! Mutexes, condition variables, reader-writer locks, barriers, spin locks,
//! once control, thread identity and lifecycle, cancellation, cleanup
//! handlers and thread-specific data.

pub mod barrier;
pub mod cancel;
pub mod cleanup;
pub mod cond;
#[allow(unsafe_code)]
pub mod mcs;
pub mod mutex;
pub mod once;
pub mod rwlock;
pub mod spin;
pub mod static_init;
pub mod thread;
pub mod tls;
pub(crate) mod unwind;

/// Objects usable only within the creating process.
pub const PTHREAD_PROCESS_PRIVATE: i32 = 0;
/// Objects shared between processes (not implemented).
pub const PTHREAD_PROCESS_SHARED: i32 = 1;

pub use barrier::{
    PTHREAD_BARRIER_SERIAL_THREAD, PthreadBarrier, PthreadBarrierAttr, pthread_barrier_destroy,
    pthread_barrier_init, pthread_barrier_wait,
};
pub use cancel::{
    PTHREAD_CANCEL_ASYNCHRONOUS, PTHREAD_CANCEL_DEFERRED, PTHREAD_CANCEL_DISABLE, PTHREAD_CANCEL_ENABLE,
    PTHREAD_CANCELED, pthread_cancel, pthread_setcancelstate, pthread_setcanceltype, pthread_testcancel,
};
pub use cleanup::{pthread_cleanup_pop, pthread_cleanup_push};
pub use cond::{
    PTHREAD_COND_INITIALIZER, PthreadCond, PthreadCondAttr, pthread_cond_broadcast, pthread_cond_destroy,
    pthread_cond_init, pthread_cond_signal, pthread_cond_timedwait, pthread_cond_wait,
};
pub use mcs::McsLock;
pub use mutex::{
    PTHREAD_ERRORCHECK_MUTEX_INITIALIZER, PTHREAD_MUTEX_DEFAULT, PTHREAD_MUTEX_ERRORCHECK,
    PTHREAD_MUTEX_INITIALIZER, PTHREAD_MUTEX_NORMAL, PTHREAD_MUTEX_RECURSIVE,
    PTHREAD_RECURSIVE_MUTEX_INITIALIZER, PthreadMutex, PthreadMutexAttr, pthread_mutex_destroy,
    pthread_mutex_init, pthread_mutex_lock, pthread_mutex_timedlock, pthread_mutex_trylock,
    pthread_mutex_unlock,
};
pub use once::{PTHREAD_ONCE_INIT, PthreadOnce, pthread_once};
pub use rwlock::{
    PTHREAD_RWLOCK_INITIALIZER, PthreadRwlock, PthreadRwlockAttr, pthread_rwlock_destroy,
    pthread_rwlock_init, pthread_rwlock_rdlock, pthread_rwlock_timedrdlock, pthread_rwlock_timedwrlock,
    pthread_rwlock_tryrdlock, pthread_rwlock_trywrlock, pthread_rwlock_unlock, pthread_rwlock_wrlock,
};
pub use spin::{
    PTHREAD_SPINLOCK_INITIALIZER, PthreadSpinlock, pthread_spin_destroy, pthread_spin_init,
    pthread_spin_lock, pthread_spin_trylock, pthread_spin_unlock,
};
pub use static_init::Phase;
pub use thread::{
    PTHREAD_CREATE_DETACHED, PTHREAD_CREATE_JOINABLE, Pthread, PthreadAttr, pthread_attr_destroy,
    pthread_attr_getdetachstate, pthread_attr_getstacksize, pthread_attr_init,
    pthread_attr_setdetachstate, pthread_attr_setstacksize, pthread_create, pthread_detach,
    pthread_equal, pthread_exit, pthread_join, pthread_kill, pthread_self,
};
pub use tls::{
    PTHREAD_KEYS_MAX, PthreadKey, pthread_getspecific, pthread_key_create, pthread_key_delete,
    pthread_setspecific,
};
