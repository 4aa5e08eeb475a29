//! Absolute deadlines.
//!
//! Timed operations take a `struct timespec` against the real-time clock,
//! as POSIX specifies. This module validates and converts them; the
//! remaining time is recomputed from the clock at every retry by the
//! kernel waits themselves.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use libc::timespec;

use crate::error::{Error, Result};

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Converts an absolute real-time `timespec` to a [`SystemTime`].
///
/// `tv_nsec` outside `[0, 1e9)` is `EINVAL`. Times before the epoch clamp to
/// the epoch: they are in the past either way.
pub fn deadline_from_timespec(ts: &timespec) -> Result<SystemTime> {
    let nsec = i64::from(ts.tv_nsec);
    if !(0..NANOS_PER_SEC).contains(&nsec) {
        return Err(Error::Invalid);
    }
    let secs = i64::from(ts.tv_sec);
    if secs < 0 {
        return Ok(UNIX_EPOCH);
    }
    let since_epoch = Duration::new(secs.unsigned_abs(), u32::try_from(nsec).map_err(|_| Error::Invalid)?);
    UNIX_EPOCH.checked_add(since_epoch).ok_or(Error::Invalid)
}

/// Converts a relative interval `timespec` (for `pthread_delay_np`).
pub fn interval_from_timespec(ts: &timespec) -> Result<Duration> {
    let nsec = i64::from(ts.tv_nsec);
    let secs = i64::from(ts.tv_sec);
    if !(0..NANOS_PER_SEC).contains(&nsec) || secs < 0 {
        return Err(Error::Invalid);
    }
    Ok(Duration::new(secs.unsigned_abs(), u32::try_from(nsec).map_err(|_| Error::Invalid)?))
}

/// Real-time clock reading as a `timespec`, for building deadlines.
#[must_use]
pub fn realtime_now() -> timespec {
    timespec_from(SystemTime::now())
}

/// `timespec` for `now + delta`.
#[must_use]
pub fn realtime_after(delta: Duration) -> timespec {
    timespec_from(SystemTime::now() + delta)
}

fn timespec_from(t: SystemTime) -> timespec {
    let d = t.duration_since(UNIX_EPOCH).unwrap_or_default();
    timespec {
        tv_sec: d.as_secs().try_into().unwrap_or(libc::time_t::MAX),
        tv_nsec: d.subsec_nanos().try_into().unwrap_or(0),
    }
}
