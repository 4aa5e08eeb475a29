//! Real-time clock and deadline arithmetic.

use std::time::{Duration, SystemTime};

/// Current real-time clock reading.
#[inline]
#[must_use]
pub fn now() -> SystemTime {
    SystemTime::now()
}

/// Time left until `deadline`, measured against the clock now.
///
/// `None` once the deadline has been reached.
#[must_use]
pub fn remaining(deadline: SystemTime) -> Option<Duration> {
    match deadline.duration_since(now()) {
        Ok(left) if !left.is_zero() => Some(left),
        _ => None,
    }
}

/// Whole milliseconds left until `deadline`, rounded up, saturating.
#[must_use]
pub fn remaining_millis(deadline: SystemTime) -> u64 {
    remaining(deadline).map_or(0, |left| {
        let ms = left.as_nanos().div_ceil(1_000_000);
        u64::try_from(ms).unwrap_or(u64::MAX)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn past_deadline_has_nothing_remaining() {
        let past = now() - Duration::from_secs(1);
        assert_eq!(remaining(past), None);
        assert_eq!(remaining_millis(past), 0);
    }

    #[test]
    fn future_deadline_rounds_up_to_millis() {
        let soon = now() + Duration::from_micros(1500);
        let ms = remaining_millis(soon);
        assert!((1..=2).contains(&ms), "got {ms}");
        assert!(remaining(now() + Duration::from_secs(60)).is_some());
    }
}
