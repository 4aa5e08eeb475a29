//! Drives every (kind, state, operation) cell of the mutex contract through
//! a real mutex and checks it against `mutex_contract_transition`.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use pthreads_emu_core::error::{Result, to_errno};
use pthreads_emu_core::pthread::Phase;
use pthreads_emu_core::pthread::mutex::{
    MutexContractOp, MutexContractState, PTHREAD_MUTEX_ERRORCHECK, PTHREAD_MUTEX_NORMAL,
    PTHREAD_MUTEX_RECURSIVE, PthreadMutex, PthreadMutexAttr, mutex_contract_transition,
};

const KINDS: [i32; 3] = [PTHREAD_MUTEX_NORMAL, PTHREAD_MUTEX_RECURSIVE, PTHREAD_MUTEX_ERRORCHECK];

const STATES: [MutexContractState; 5] = [
    MutexContractState::StaticInitializer,
    MutexContractState::Unlocked,
    MutexContractState::LockedBySelf,
    MutexContractState::LockedByOther,
    MutexContractState::Destroyed,
];

const OPS: [MutexContractOp; 5] = [
    MutexContractOp::Init,
    MutexContractOp::Lock,
    MutexContractOp::TryLock,
    MutexContractOp::Unlock,
    MutexContractOp::Destroy,
];

fn workspace_root() -> PathBuf {
    let manifest = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    manifest.parent().unwrap().parent().unwrap().to_path_buf()
}

fn state_name(state: MutexContractState) -> &'static str {
    match state {
        MutexContractState::StaticInitializer => "StaticInitializer",
        MutexContractState::Unlocked => "Unlocked",
        MutexContractState::LockedBySelf => "LockedBySelf",
        MutexContractState::LockedByOther => "LockedByOther",
        MutexContractState::Destroyed => "Destroyed",
    }
}

fn op_name(op: MutexContractOp) -> &'static str {
    match op {
        MutexContractOp::Init => "Init",
        MutexContractOp::Lock => "Lock",
        MutexContractOp::TryLock => "TryLock",
        MutexContractOp::Unlock => "Unlock",
        MutexContractOp::Destroy => "Destroy",
    }
}

fn kind_name(kind: i32) -> &'static str {
    match kind {
        PTHREAD_MUTEX_NORMAL => "NORMAL",
        PTHREAD_MUTEX_ERRORCHECK => "ERRORCHECK",
        PTHREAD_MUTEX_RECURSIVE => "RECURSIVE",
        _ => "UNKNOWN",
    }
}

/// Another thread holding the mutex until released.
struct Holder {
    release: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl Holder {
    fn hold(mutex: &Arc<PthreadMutex>) -> Self {
        let (locked_tx, locked_rx) = mpsc::channel();
        let (release, release_rx) = mpsc::channel::<()>();
        let m = Arc::clone(mutex);
        let handle = std::thread::spawn(move || {
            m.lock().unwrap();
            locked_tx.send(()).unwrap();
            let _ = release_rx.recv();
            // May already have been unlocked (NORMAL) or destroyed.
            let _ = m.unlock();
        });
        locked_rx.recv().unwrap();
        Self { release, handle }
    }

    fn finish(self) {
        let _ = self.release.send(());
        self.handle.join().unwrap();
    }
}

fn prepare(kind: i32, state: MutexContractState) -> (Arc<PthreadMutex>, Option<Holder>) {
    let attr = PthreadMutexAttr::with_kind(kind);
    let mutex = match state {
        MutexContractState::StaticInitializer => PthreadMutex::static_initializer(kind),
        _ => PthreadMutex::new(Some(&attr)).unwrap(),
    };
    let mutex = Arc::new(mutex);
    let mut holder = None;
    match state {
        MutexContractState::LockedBySelf => mutex.lock().unwrap(),
        MutexContractState::LockedByOther => holder = Some(Holder::hold(&mutex)),
        MutexContractState::Destroyed => mutex.destroy().unwrap(),
        MutexContractState::StaticInitializer | MutexContractState::Unlocked => {}
    }
    (mutex, holder)
}

fn apply(mutex: &PthreadMutex, kind: i32, op: MutexContractOp, blocks: bool) -> Result<()> {
    match op {
        MutexContractOp::Init => mutex.init(Some(&PthreadMutexAttr::with_kind(kind))),
        // A blocking lock is observed as a timeout.
        MutexContractOp::Lock if blocks => mutex.timed_lock(SystemTime::now() + Duration::from_millis(20)),
        MutexContractOp::Lock => mutex.lock(),
        MutexContractOp::TryLock => mutex.try_lock(),
        MutexContractOp::Unlock => mutex.unlock(),
        MutexContractOp::Destroy => mutex.destroy(),
    }
}

fn observe(mutex: &PthreadMutex, expected: MutexContractState) -> MutexContractState {
    match (mutex.phase(), mutex.is_locked()) {
        (Phase::Static, _) => MutexContractState::StaticInitializer,
        (Phase::Destroyed, _) => MutexContractState::Destroyed,
        (Phase::Ready, false) => MutexContractState::Unlocked,
        (Phase::Ready, true) if expected == MutexContractState::LockedByOther => {
            MutexContractState::LockedByOther
        }
        (Phase::Ready, true) => MutexContractState::LockedBySelf,
    }
}

#[test]
fn contract_matrix_matches_real_mutex_and_emits_structured_logs() {
    let root = workspace_root();
    let out_dir = root.join("target/conformance");
    fs::create_dir_all(&out_dir).expect("create target/conformance");
    let log_path = out_dir.join("pthread_mutex_contract_matrix.log.jsonl");
    let report_path = out_dir.join("pthread_mutex_contract_matrix.report.json");

    let mut log_lines = Vec::new();
    let mut mismatches = Vec::new();
    let mut total = 0usize;

    for kind in KINDS {
        for state in STATES {
            for op in OPS {
                total += 1;
                let want = mutex_contract_transition(kind, state, op);
                let (mutex, holder) = prepare(kind, state);

                let t0 = Instant::now();
                let errno = to_errno(apply(&mutex, kind, op, want.blocks));
                let timing_ns = t0.elapsed().as_nanos();
                let expected_errno = if want.blocks { libc::ETIMEDOUT } else { want.errno };
                let got_state = observe(&mutex, want.next);

                if let Some(holder) = holder {
                    holder.finish();
                }

                let ok = errno == expected_errno && got_state == want.next;
                if !ok {
                    mismatches.push(format!(
                        "{}:{}:{} expected(next={}, errno={}) got(next={}, errno={})",
                        kind_name(kind),
                        state_name(state),
                        op_name(op),
                        state_name(want.next),
                        expected_errno,
                        state_name(got_state),
                        errno
                    ));
                }
                log_lines.push(
                    serde_json::json!({
                        "trace_id": format!(
                            "pthread-mutex-contract:{}:{}:{}",
                            kind_name(kind),
                            state_name(state),
                            op_name(op)
                        ),
                        "operation": op_name(op),
                        "old_state": state_name(state),
                        "new_state": state_name(got_state),
                        "errno": errno,
                        "blocks": want.blocks,
                        "timing_ns": timing_ns,
                        "status": if ok { "ok" } else { "mismatch" },
                    })
                    .to_string(),
                );
            }
        }
    }

    fs::write(&log_path, format!("{}\n", log_lines.join("\n"))).expect("write jsonl log");
    let report = serde_json::json!({
        "ok": mismatches.is_empty(),
        "total_cases": total,
        "failed_cases": mismatches.len(),
        "log_jsonl": log_path.strip_prefix(&root).unwrap_or(&log_path).to_string_lossy(),
        "mismatches": mismatches,
    });
    fs::write(&report_path, serde_json::to_string_pretty(&report).unwrap()).expect("write report json");

    assert!(mismatches.is_empty(), "contract matrix mismatch(es): {mismatches:?}");
}
