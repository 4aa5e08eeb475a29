//! Error number definitions.
//!
//! The error numbers returned by the POSIX surface, taken from the host's
//! `<errno.h>` so callers can compare against `libc` directly, plus the
//! thread-local `errno` slot that the `sem_*` family reports through.

use std::cell::Cell;

use libc::c_int;

thread_local! {
    static ERRNO: Cell<c_int> = const { Cell::new(0) };
}

pub const EPERM: c_int = libc::EPERM;
pub const ENOENT: c_int = libc::ENOENT;
pub const ESRCH: c_int = libc::ESRCH;
pub const EINTR: c_int = libc::EINTR;
pub const EAGAIN: c_int = libc::EAGAIN;
pub const ENOMEM: c_int = libc::ENOMEM;
pub const EBUSY: c_int = libc::EBUSY;
pub const EINVAL: c_int = libc::EINVAL;
pub const ERANGE: c_int = libc::ERANGE;
pub const EDEADLK: c_int = libc::EDEADLK;
pub const ENOSYS: c_int = libc::ENOSYS;
pub const EOVERFLOW: c_int = libc::EOVERFLOW;
pub const ENOTSUP: c_int = libc::ENOTSUP;
pub const ETIMEDOUT: c_int = libc::ETIMEDOUT;
pub const ECANCELED: c_int = libc::ECANCELED;

/// Returns the current thread-local errno value.
pub fn get_errno() -> c_int {
    ERRNO.get()
}

/// Sets the current thread-local errno value.
pub fn set_errno(value: c_int) {
    ERRNO.set(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_is_per_thread() {
        set_errno(EBUSY);
        let other = std::thread::spawn(|| {
            assert_eq!(get_errno(), 0);
            set_errno(EINVAL);
            get_errno()
        })
        .join()
        .unwrap();
        assert_eq!(other, EINVAL);
        assert_eq!(get_errno(), EBUSY);
        set_errno(0);
    }

    #[test]
    fn constants_match_host_values() {
        assert_eq!(EINVAL, libc::EINVAL);
        assert_eq!(ETIMEDOUT, libc::ETIMEDOUT);
        assert_ne!(EBUSY, EAGAIN);
        assert_ne!(ENOSYS, ENOTSUP);
    }
}
