//! Structured trace output from real operations.

use std::sync::Arc;

use pthreads_emu_core::config::{self, TraceLevel};
use pthreads_emu_core::error::Error;
use pthreads_emu_core::pthread::{PTHREAD_MUTEX_ERRORCHECK, PthreadMutex, thread};
use pthreads_emu_core::trace::{self, TraceRecord};

#[test]
fn operations_emit_parseable_jsonl_records() {
    config::set_trace_level(TraceLevel::Debug);
    let capture = trace::capture();

    let mutex = Arc::new(PthreadMutex::static_initializer(PTHREAD_MUTEX_ERRORCHECK));
    mutex.lock().unwrap();
    let other = Arc::clone(&mutex);
    let child = thread::spawn(None, move || usize::from(other.destroy() == Err(Error::Busy))).unwrap();
    assert_eq!(thread::join(child), Ok(1));
    mutex.unlock().unwrap();
    mutex.destroy().unwrap();

    let lines = capture.lines();
    assert!(!lines.is_empty());
    let records: Vec<TraceRecord> = lines
        .iter()
        .map(|line| serde_json::from_str(line).unwrap_or_else(|e| panic!("bad line {line}: {e}")))
        .collect();
    for line in &lines {
        let v: serde_json::Value = serde_json::from_str(line).unwrap();
        assert!(v["timestamp_ns"].is_u64(), "{line}");
        assert!(v["level"].is_string(), "{line}");
        assert!(v["event"].is_string(), "{line}");
    }

    let events: Vec<&str> = records.iter().map(|r| r.event.as_str()).collect();
    assert!(events.contains(&"static_lazy_init"), "{events:?}");
    assert!(events.contains(&"thread_spawn"), "{events:?}");
    assert!(events.contains(&"thread_exit"), "{events:?}");
    assert!(events.contains(&"thread_join"), "{events:?}");

    let busy = records
        .iter()
        .find(|r| r.event == "destroy_busy")
        .expect("destroy_busy record");
    assert_eq!(busy.object.as_deref(), Some("mutex"));
    assert_eq!(busy.errno, Some(libc::EBUSY));

    config::set_trace_level(TraceLevel::Off);
    let before = capture.lines().len();
    let quiet = PthreadMutex::static_initializer(PTHREAD_MUTEX_ERRORCHECK);
    quiet.lock().unwrap();
    quiet.unlock().unwrap();
    assert_eq!(capture.lines().len(), before);
}
