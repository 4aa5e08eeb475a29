//! Typed errors for the core API.
//!
//! Every fallible core operation returns [`Result`]. The POSIX surface
//! lowers an [`Error`] to its error number with [`Error::errno`];
//! [`Error::Canceled`] never reaches a caller as a number, it is turned
//! into the thread-exit path instead.

use libc::c_int;
use thiserror::Error;

use crate::errno;

/// Failure taxonomy shared by every primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Error {
    /// Invalid, uninitialised or destroyed object, or a bad argument.
    #[error("invalid argument")]
    Invalid,
    /// The object is locked, held, or still has waiters.
    #[error("resource busy")]
    Busy,
    /// A kernel object or key slot could not be obtained.
    #[error("resource temporarily unavailable")]
    Again,
    /// Heap exhaustion while building an identity block.
    #[error("out of memory")]
    NoMemory,
    /// The call would deadlock the calling thread.
    #[error("resource deadlock would occur")]
    Deadlock,
    /// The absolute deadline passed before the call could complete.
    #[error("timed out")]
    TimedOut,
    /// The thread handle does not name a live identity.
    #[error("no such thread")]
    NoSuchThread,
    /// The caller does not own the object.
    #[error("operation not permitted")]
    NotPermitted,
    /// The requested configuration is not implemented (process-shared).
    #[error("function not implemented")]
    NotImplemented,
    /// The requested optional attribute is not supported.
    #[error("operation not supported")]
    NotSupported,
    /// A counter would exceed its representable maximum.
    #[error("value out of range")]
    Range,
    /// The calling thread acted on a pending cancellation request.
    #[error("thread canceled")]
    Canceled,
}

impl Error {
    /// POSIX error number for this error.
    #[must_use]
    pub const fn errno(self) -> c_int {
        match self {
            Self::Invalid => errno::EINVAL,
            Self::Busy => errno::EBUSY,
            Self::Again => errno::EAGAIN,
            Self::NoMemory => errno::ENOMEM,
            Self::Deadlock => errno::EDEADLK,
            Self::TimedOut => errno::ETIMEDOUT,
            Self::NoSuchThread => errno::ESRCH,
            Self::NotPermitted => errno::EPERM,
            Self::NotImplemented => errno::ENOSYS,
            Self::NotSupported => errno::ENOTSUP,
            Self::Range => errno::ERANGE,
            Self::Canceled => errno::ECANCELED,
        }
    }

    /// Inverse of [`Error::errno`]; `None` for 0 and unknown numbers.
    #[must_use]
    pub fn from_errno(value: c_int) -> Option<Self> {
        Some(match value {
            errno::EINVAL => Self::Invalid,
            errno::EBUSY => Self::Busy,
            errno::EAGAIN => Self::Again,
            errno::ENOMEM => Self::NoMemory,
            errno::EDEADLK => Self::Deadlock,
            errno::ETIMEDOUT => Self::TimedOut,
            errno::ESRCH => Self::NoSuchThread,
            errno::EPERM => Self::NotPermitted,
            errno::ENOSYS => Self::NotImplemented,
            errno::ENOTSUP => Self::NotSupported,
            errno::ERANGE => Self::Range,
            errno::ECANCELED => Self::Canceled,
            _ => return None,
        })
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Lowers a unit result to a POSIX return code.
///
/// Callers handle [`Error::Canceled`] before reaching this point.
#[must_use]
pub fn to_errno(result: Result<()>) -> c_int {
    match result {
        Ok(()) => 0,
        Err(err) => err.errno(),
    }
}
