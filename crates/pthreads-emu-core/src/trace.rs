//! Structured JSONL trace records.
//!
//! One JSON object per line with required `timestamp_ns`, `level`, `event`
//! and optional context fields. Records below the threshold from
//! [`config::trace_level`](crate::config::trace_level) are never built.

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Severity level for trace records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// One trace line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    pub timestamp_ns: u64,
    pub level: LogLevel,
    pub event: String,

    /// Packed identity of the thread the record is about.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread: Option<u64>,
    /// Primitive family (`mutex`, `cond`, `thread`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errno: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl TraceRecord {
    /// Create a record with required fields only.
    #[must_use]
    pub fn new(level: LogLevel, event: impl Into<String>) -> Self {
        Self {
            timestamp_ns: now_ns(),
            level,
            event: event.into(),
            thread: None,
            object: None,
            errno: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_thread(mut self, thread: u64) -> Self {
        self.thread = Some(thread);
        self
    }

    #[must_use]
    pub fn with_object(mut self, object: impl Into<String>) -> Self {
        self.object = Some(object.into());
        self
    }

    #[must_use]
    pub fn with_errno(mut self, errno: i32) -> Self {
        self.errno = Some(errno);
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Serialize to a single JSON line (no trailing newline).
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

enum Sink {
    Stderr,
    Writer(Box<dyn Write + Send>),
    Buffer(Arc<Mutex<Vec<u8>>>),
}

static SINK: Mutex<Option<Sink>> = parking_lot::const_mutex(None);

fn default_sink() -> Sink {
    config::trace_file()
        .and_then(|path| OpenOptions::new().create(true).append(true).open(path).ok())
        .map_or(Sink::Stderr, |file| Sink::Writer(Box::new(file)))
}

/// Routes trace records to `writer` from now on.
pub fn set_writer(writer: Box<dyn Write + Send>) {
    *SINK.lock() = Some(Sink::Writer(writer));
}

/// In-memory sink handle returned by [`capture`].
#[derive(Clone)]
pub struct TraceCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl TraceCapture {
    /// Captured lines so far.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.buffer.lock())
            .lines()
            .map(str::to_owned)
            .collect()
    }
}

/// Routes trace records into memory; used by tests and the harness.
#[must_use]
pub fn capture() -> TraceCapture {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    *SINK.lock() = Some(Sink::Buffer(Arc::clone(&buffer)));
    TraceCapture { buffer }
}

/// Returns true when records at `level` are currently emitted.
#[inline]
#[must_use]
pub fn enabled(level: LogLevel) -> bool {
    config::trace_level().admits(level)
}

/// Write `record` to the active sink. Write failures are dropped.
pub fn emit(record: &TraceRecord) {
    let Ok(line) = record.to_jsonl() else {
        return;
    };
    let mut sink = SINK.lock();
    let sink = sink.get_or_insert_with(default_sink);
    let _ = match sink {
        Sink::Stderr => writeln!(std::io::stderr().lock(), "{line}"),
        Sink::Writer(w) => writeln!(w, "{line}"),
        Sink::Buffer(buf) => writeln!(buf.lock(), "{line}"),
    };
}

/// Builds and emits a record only when `level` is enabled.
#[inline]
pub fn event(level: LogLevel, name: &str, build: impl FnOnce(TraceRecord) -> TraceRecord) {
    if enabled(level) {
        emit(&build(TraceRecord::new(level, name)));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
