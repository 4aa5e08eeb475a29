//! Runtime configuration.
//!
//! Read from the environment once and cached in atomics:
//! - `PTHREADS_EMU_TRACE`: trace threshold, one of `off` (default), `error`,
//!   `warn`, `info`, `debug`, `trace`.
//! - `PTHREADS_EMU_TRACE_FILE`: append JSONL trace records to this file
//!   instead of stderr.
//! - `PTHREADS_EMU_CPUS`: processor count reported to the spinlock and to
//!   `pthread_num_processors_np`, overriding the host value.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::trace::LogLevel;

/// Threshold below which trace records are dropped.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TraceLevel {
    #[default]
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl TraceLevel {
    /// Parse from string (case-insensitive); unknown values disable tracing.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Self::Error,
            "warn" | "warning" => Self::Warn,
            "info" | "1" | "on" => Self::Info,
            "debug" => Self::Debug,
            "trace" | "all" => Self::Trace,
            _ => Self::Off,
        }
    }

    /// Returns true when a record at `level` passes this threshold.
    #[must_use]
    pub const fn admits(self, level: LogLevel) -> bool {
        let rank = match level {
            LogLevel::Error => 1,
            LogLevel::Warn => 2,
            LogLevel::Info => 3,
            LogLevel::Debug => 4,
            LogLevel::Trace => 5,
        };
        (self as u8) >= rank
    }

    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Error,
            2 => Self::Warn,
            3 => Self::Info,
            4 => Self::Debug,
            5 => Self::Trace,
            _ => Self::Off,
        }
    }
}

// Atomic cache: TraceLevel discriminant once resolved, or one of the two
// sentinels below. Resolution is a non-blocking state machine so a trace
// call made while the environment is being read sees `Off`.
static CACHED_TRACE: AtomicU8 = AtomicU8::new(TRACE_UNRESOLVED);

const TRACE_UNRESOLVED: u8 = 0xFE;
const TRACE_RESOLVING: u8 = 0xFF;

/// Configured trace threshold (reads the environment on first call).
#[must_use]
pub fn trace_level() -> TraceLevel {
    let cached = CACHED_TRACE.load(Ordering::Relaxed);
    if cached != TRACE_UNRESOLVED && cached != TRACE_RESOLVING {
        return TraceLevel::from_u8(cached);
    }
    if cached == TRACE_RESOLVING {
        return TraceLevel::Off;
    }
    if CACHED_TRACE
        .compare_exchange(
            TRACE_UNRESOLVED,
            TRACE_RESOLVING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        let v = CACHED_TRACE.load(Ordering::Relaxed);
        return if v != TRACE_UNRESOLVED && v != TRACE_RESOLVING {
            TraceLevel::from_u8(v)
        } else {
            TraceLevel::Off
        };
    }

    let level = std::env::var("PTHREADS_EMU_TRACE")
        .map(|v| TraceLevel::from_str_loose(&v))
        .unwrap_or_default();
    CACHED_TRACE.store(level as u8, Ordering::Release);
    level
}

/// Overrides the trace threshold for the rest of the process.
pub fn set_trace_level(level: TraceLevel) {
    CACHED_TRACE.store(level as u8, Ordering::Release);
}

/// Path of the JSONL trace file, if one is configured.
#[must_use]
pub fn trace_file() -> Option<PathBuf> {
    std::env::var_os("PTHREADS_EMU_TRACE_FILE")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

// 0 = unresolved, 1 = no override, n + 1 = override of n processors.
static CPU_OVERRIDE: AtomicUsize = AtomicUsize::new(0);

const fn decode_cpus(encoded: usize) -> Option<usize> {
    match encoded {
        0 | 1 => None,
        n => Some(n - 1),
    }
}

fn parse_cpus(raw: &str) -> Option<usize> {
    raw.trim().parse::<usize>().ok().filter(|&n| n > 0)
}

/// Processor-count override from `PTHREADS_EMU_CPUS` or [`set_processor_override`].
#[must_use]
pub fn processor_override() -> Option<usize> {
    let cached = CPU_OVERRIDE.load(Ordering::Acquire);
    if cached != 0 {
        return decode_cpus(cached);
    }
    let resolved = std::env::var("PTHREADS_EMU_CPUS")
        .ok()
        .and_then(|v| parse_cpus(&v));
    let encoded = resolved.map_or(1, |n| n + 1);
    // A concurrent explicit override wins over the environment.
    match CPU_OVERRIDE.compare_exchange(0, encoded, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => resolved,
        Err(current) => decode_cpus(current),
    }
}

/// Forces (or with `None`, clears) the processor-count override.
pub fn set_processor_override(cpus: Option<usize>) {
    let encoded = cpus.filter(|&n| n > 0).map_or(1, |n| n + 1);
    CPU_OVERRIDE.store(encoded, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_trace_levels() {
        assert_eq!(TraceLevel::from_str_loose("off"), TraceLevel::Off);
        assert_eq!(TraceLevel::from_str_loose("ERROR"), TraceLevel::Error);
        assert_eq!(TraceLevel::from_str_loose("warning"), TraceLevel::Warn);
        assert_eq!(TraceLevel::from_str_loose(" info "), TraceLevel::Info);
        assert_eq!(TraceLevel::from_str_loose("debug"), TraceLevel::Debug);
        assert_eq!(TraceLevel::from_str_loose("all"), TraceLevel::Trace);
        assert_eq!(TraceLevel::from_str_loose("bogus"), TraceLevel::Off);
    }

    #[test]
    fn threshold_admits_more_severe_levels() {
        assert!(!TraceLevel::Off.admits(LogLevel::Error));
        assert!(TraceLevel::Error.admits(LogLevel::Error));
        assert!(!TraceLevel::Error.admits(LogLevel::Warn));
        assert!(TraceLevel::Info.admits(LogLevel::Warn));
        assert!(!TraceLevel::Info.admits(LogLevel::Debug));
        assert!(TraceLevel::Trace.admits(LogLevel::Trace));
    }

    #[test]
    fn cpu_parser_rejects_zero_and_garbage() {
        assert_eq!(parse_cpus("4"), Some(4));
        assert_eq!(parse_cpus(" 1 "), Some(1));
        assert_eq!(parse_cpus("0"), None);
        assert_eq!(parse_cpus("many"), None);
    }

    #[test]
    fn level_round_trips_through_cache_encoding() {
        for level in [
            TraceLevel::Off,
            TraceLevel::Error,
            TraceLevel::Warn,
            TraceLevel::Info,
            TraceLevel::Debug,
            TraceLevel::Trace,
        ] {
            assert_eq!(TraceLevel::from_u8(level as u8), level);
        }
    }
}
