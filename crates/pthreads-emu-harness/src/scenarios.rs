//! Stress scenarios.
//!
//! Each scenario runs a multi-threaded workload on library threads, checks
//! the invariant the primitive promises and reports how many operations it
//! performed. Workers never panic on a failed call; they hand the error
//! number back through their exit value.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use pthreads_emu_core::Error;
use pthreads_emu_core::pthread::{
    PTHREAD_CANCELED, PTHREAD_MUTEX_ERRORCHECK, PTHREAD_MUTEX_NORMAL, PTHREAD_MUTEX_RECURSIVE, Pthread,
    PthreadBarrier, PthreadCond, PthreadMutex, PthreadMutexAttr, PthreadOnce, PthreadRwlock, cancel,
    cleanup, pthread_cond_wait, thread,
};
use pthreads_emu_core::sched;
use pthreads_emu_core::semaphore::Sem;

use crate::error::{Context, HarnessError};

// ---------------------------------------------------------------------------
// Catalogue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    MutexCounter,
    CondBroadcast,
    RwlockMix,
    BarrierCycles,
    OnceRace,
    SemPipeline,
    ThreadChurn,
    CancelCleanup,
}

impl Scenario {
    pub const ALL: [Self; 8] = [
        Self::MutexCounter,
        Self::CondBroadcast,
        Self::RwlockMix,
        Self::BarrierCycles,
        Self::OnceRace,
        Self::SemPipeline,
        Self::ThreadChurn,
        Self::CancelCleanup,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::MutexCounter => "mutex_counter",
            Self::CondBroadcast => "cond_broadcast",
            Self::RwlockMix => "rwlock_mix",
            Self::BarrierCycles => "barrier_cycles",
            Self::OnceRace => "once_race",
            Self::SemPipeline => "sem_pipeline",
            Self::ThreadChurn => "thread_churn",
            Self::CancelCleanup => "cancel_cleanup",
        }
    }

    /// One-line description for `harness list`.
    #[must_use]
    pub const fn summary(self) -> &'static str {
        match self {
            Self::MutexCounter => "unsynchronised counter guarded by each mutex kind",
            Self::CondBroadcast => "rounds of broadcast releasing every waiter",
            Self::RwlockMix => "readers never observe a half-finished write",
            Self::BarrierCycles => "exactly one serial thread per barrier cycle",
            Self::OnceRace => "racing callers run each once routine exactly once",
            Self::SemPipeline => "producers and consumers balance semaphore units",
            Self::ThreadChurn => "create/join churn with stale-handle checks across slot reuse",
            Self::CancelCleanup => "cancel a thread blocked in a cond wait and unwind its cleanup",
        }
    }

    pub fn from_name(name: &str) -> Result<Self, HarnessError> {
        Self::ALL
            .into_iter()
            .find(|s| s.name() == name)
            .ok_or_else(|| HarnessError::UnknownScenario(name.to_string()))
    }

    pub fn run(self, config: &ScenarioConfig) -> Result<ScenarioReport, HarnessError> {
        config.validate()?;
        let start = Instant::now();
        let mut ops = OpCounts::default();
        match self {
            Self::MutexCounter => mutex_counter(config, &mut ops)?,
            Self::CondBroadcast => cond_broadcast(config, &mut ops)?,
            Self::RwlockMix => rwlock_mix(config, &mut ops)?,
            Self::BarrierCycles => barrier_cycles(config, &mut ops)?,
            Self::OnceRace => once_race(config, &mut ops)?,
            Self::SemPipeline => sem_pipeline(config, &mut ops)?,
            Self::ThreadChurn => thread_churn(config, &mut ops)?,
            Self::CancelCleanup => cancel_cleanup(config, &mut ops)?,
        }
        Ok(ScenarioReport {
            scenario: self,
            threads: config.threads,
            iterations: config.iterations,
            elapsed_ns: u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX),
            op_counts: ops.0,
        })
    }
}

/// Workload size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub threads: usize,
    pub iterations: u64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            iterations: 1_000,
        }
    }
}

impl ScenarioConfig {
    fn validate(&self) -> Result<(), HarnessError> {
        if self.threads < 2 {
            return Err(HarnessError::InvalidConfig(format!(
                "threads must be at least 2, got {}",
                self.threads
            )));
        }
        if self.iterations == 0 {
            return Err(HarnessError::InvalidConfig("iterations must be non-zero".into()));
        }
        Ok(())
    }

    fn threads_u32(&self) -> Result<u32, HarnessError> {
        u32::try_from(self.threads)
            .map_err(|_| HarnessError::InvalidConfig(format!("too many threads: {}", self.threads)))
    }
}

/// Outcome of one scenario run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub scenario: Scenario,
    pub threads: usize,
    pub iterations: u64,
    pub elapsed_ns: u64,
    pub op_counts: BTreeMap<String, u64>,
}

#[derive(Default)]
struct OpCounts(BTreeMap<String, u64>);

impl OpCounts {
    fn add(&mut self, op: &str, n: u64) {
        *self.0.entry(op.to_string()).or_default() += n;
    }
}

// ---------------------------------------------------------------------------
// Worker plumbing
// ---------------------------------------------------------------------------

fn exit_code(result: pthreads_emu_core::Result<()>) -> usize {
    match result {
        Ok(()) => 0,
        Err(err) => usize::try_from(err.errno()).unwrap_or(usize::MAX),
    }
}

/// Library threads started by [`Workers::start`].
struct Workers {
    handles: Vec<Pthread>,
    failure: Option<HarnessError>,
}

impl Workers {
    /// Runs `work(index)` on `threads` library threads.
    ///
    /// A create failure stops the fan-out; [`join`](Self::join) still
    /// reaps the threads already running and then reports it.
    fn start<F>(threads: usize, work: F) -> Self
    where
        F: Fn(usize) -> pthreads_emu_core::Result<()> + Send + Sync + 'static,
    {
        let work = Arc::new(work);
        let mut handles = Vec::with_capacity(threads);
        let mut failure = None;
        for index in 0..threads {
            let work = Arc::clone(&work);
            match thread::spawn(None, move || exit_code(work(index))) {
                Ok(handle) => handles.push(handle),
                Err(source) => {
                    failure = Some(HarnessError::Primitive {
                        op: "pthread_create",
                        source,
                    });
                    break;
                }
            }
        }
        Self { handles, failure }
    }

    fn join(self) -> Result<(), HarnessError> {
        let mut failure = self.failure;
        for handle in self.handles {
            let code = thread::join(handle).op("pthread_join")?;
            if code != 0 && failure.is_none() {
                let source = i32::try_from(code)
                    .ok()
                    .and_then(Error::from_errno)
                    .unwrap_or(Error::Invalid);
                failure = Some(HarnessError::Primitive { op: "worker", source });
            }
        }
        failure.map_or(Ok(()), Err)
    }
}

fn run_workers<F>(threads: usize, work: F) -> Result<(), HarnessError>
where
    F: Fn(usize) -> pthreads_emu_core::Result<()> + Send + Sync + 'static,
{
    Workers::start(threads, work).join()
}

fn check(scenario: Scenario, ok: bool, message: impl FnOnce() -> String) -> Result<(), HarnessError> {
    if ok {
        Ok(())
    } else {
        Err(HarnessError::Invariant {
            scenario: scenario.name(),
            message: message(),
        })
    }
}

/// Polls `done` with short sleeps; false once `limit` passes.
fn settle(limit: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while !done() {
        if start.elapsed() > limit {
            return false;
        }
        sched::sched_yield();
        std::thread::sleep(Duration::from_micros(200));
    }
    true
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

fn mutex_counter(config: &ScenarioConfig, ops: &mut OpCounts) -> Result<(), HarnessError> {
    for kind in [PTHREAD_MUTEX_NORMAL, PTHREAD_MUTEX_RECURSIVE, PTHREAD_MUTEX_ERRORCHECK] {
        let mutex = Arc::new(PthreadMutex::new(Some(&PthreadMutexAttr::with_kind(kind))).op("pthread_mutex_init")?);
        let counter = Arc::new(AtomicU64::new(0));
        let iterations = config.iterations;
        {
            let (mutex, counter) = (Arc::clone(&mutex), Arc::clone(&counter));
            run_workers(config.threads, move |_| {
                for _ in 0..iterations {
                    mutex.lock()?;
                    // Split read-modify-write: only exclusion keeps it exact.
                    let seen = counter.load(Ordering::Relaxed);
                    counter.store(seen + 1, Ordering::Relaxed);
                    mutex.unlock()?;
                }
                Ok(())
            })?;
        }
        let expected = config.threads as u64 * iterations;
        let got = counter.load(Ordering::Relaxed);
        check(Scenario::MutexCounter, got == expected, || {
            format!("kind {kind}: counter {got}, expected {expected}")
        })?;
        mutex.destroy().op("pthread_mutex_destroy")?;
        ops.add("lock", expected);
        ops.add("unlock", expected);
    }
    Ok(())
}

struct Rounds {
    mutex: PthreadMutex,
    arrived_cond: PthreadCond,
    advance: PthreadCond,
    generation: AtomicU64,
    arrived: AtomicU64,
}

fn cond_broadcast(config: &ScenarioConfig, ops: &mut OpCounts) -> Result<(), HarnessError> {
    let rounds = config.iterations.min(2_000);
    let shared = Arc::new(Rounds {
        mutex: PthreadMutex::new(None).op("pthread_mutex_init")?,
        arrived_cond: PthreadCond::new(None).op("pthread_cond_init")?,
        advance: PthreadCond::new(None).op("pthread_cond_init")?,
        generation: AtomicU64::new(0),
        arrived: AtomicU64::new(0),
    });
    let threads = config.threads as u64;

    let workers = {
        let shared = Arc::clone(&shared);
        Workers::start(config.threads, move |_| {
            let s = &*shared;
            for _ in 0..rounds {
                s.mutex.lock()?;
                let generation = s.generation.load(Ordering::Relaxed);
                s.arrived.fetch_add(1, Ordering::Relaxed);
                s.arrived_cond.signal()?;
                while s.generation.load(Ordering::Relaxed) == generation {
                    s.advance.wait(&s.mutex)?;
                }
                s.mutex.unlock()?;
            }
            Ok(())
        })
    };

    let s = &*shared;
    for round in 1..=rounds {
        s.mutex.lock().op("pthread_mutex_lock")?;
        while s.arrived.load(Ordering::Relaxed) < threads * round {
            s.arrived_cond.wait(&s.mutex).op("pthread_cond_wait")?;
        }
        s.generation.fetch_add(1, Ordering::Relaxed);
        s.advance.broadcast().op("pthread_cond_broadcast")?;
        s.mutex.unlock().op("pthread_mutex_unlock")?;
    }
    workers.join()?;

    check(Scenario::CondBroadcast, s.advance.waiters() == 0, || {
        format!("{} waiters left on the cond", s.advance.waiters())
    })?;
    s.advance.destroy().op("pthread_cond_destroy")?;
    s.arrived_cond.destroy().op("pthread_cond_destroy")?;
    ops.add("broadcast", rounds);
    ops.add("wait_released", rounds * threads);
    Ok(())
}

fn rwlock_mix(config: &ScenarioConfig, ops: &mut OpCounts) -> Result<(), HarnessError> {
    let rwlock = Arc::new(PthreadRwlock::new(None).op("pthread_rwlock_init")?);
    // Odd only while a writer is inside.
    let value = Arc::new(AtomicU64::new(0));
    let torn = Arc::new(AtomicU64::new(0));
    let writes = Arc::new(AtomicU64::new(0));
    let reads = Arc::new(AtomicU64::new(0));
    let iterations = config.iterations;
    {
        let (rwlock, value, torn, writes, reads) = (
            Arc::clone(&rwlock),
            Arc::clone(&value),
            Arc::clone(&torn),
            Arc::clone(&writes),
            Arc::clone(&reads),
        );
        run_workers(config.threads, move |index| {
            for i in 0..iterations {
                if (i + index as u64) % 8 == 0 {
                    rwlock.write_lock()?;
                    value.fetch_add(1, Ordering::Relaxed);
                    if rwlock.holders() != -1 {
                        torn.fetch_add(1, Ordering::Relaxed);
                    }
                    value.fetch_add(1, Ordering::Relaxed);
                    writes.fetch_add(1, Ordering::Relaxed);
                } else {
                    rwlock.read_lock()?;
                    if value.load(Ordering::Relaxed) % 2 != 0 {
                        torn.fetch_add(1, Ordering::Relaxed);
                    }
                    reads.fetch_add(1, Ordering::Relaxed);
                }
                rwlock.unlock()?;
            }
            Ok(())
        })?;
    }
    let torn = torn.load(Ordering::Relaxed);
    check(Scenario::RwlockMix, torn == 0, || format!("{torn} torn observations"))?;
    let writes = writes.load(Ordering::Relaxed);
    let final_value = value.load(Ordering::Relaxed);
    check(Scenario::RwlockMix, final_value == writes * 2, || {
        format!("value {final_value} after {writes} writes")
    })?;
    rwlock.destroy().op("pthread_rwlock_destroy")?;
    ops.add("write_lock", writes);
    ops.add("read_lock", reads.load(Ordering::Relaxed));
    Ok(())
}

fn barrier_cycles(config: &ScenarioConfig, ops: &mut OpCounts) -> Result<(), HarnessError> {
    let barrier = Arc::new(PthreadBarrier::new(None, config.threads_u32()?).op("pthread_barrier_init")?);
    let serials = Arc::new(AtomicU64::new(0));
    let cycles = config.iterations;
    {
        let (barrier, serials) = (Arc::clone(&barrier), Arc::clone(&serials));
        run_workers(config.threads, move |_| {
            for _ in 0..cycles {
                if barrier.wait()?.is_serial() {
                    serials.fetch_add(1, Ordering::Relaxed);
                }
            }
            Ok(())
        })?;
    }
    let serials = serials.load(Ordering::Relaxed);
    check(Scenario::BarrierCycles, serials == cycles, || {
        format!("{serials} serial returns over {cycles} cycles")
    })?;
    barrier.destroy().op("pthread_barrier_destroy")?;
    ops.add("barrier_wait", cycles * config.threads as u64);
    ops.add("serial", serials);
    Ok(())
}

fn once_race(config: &ScenarioConfig, ops: &mut OpCounts) -> Result<(), HarnessError> {
    let rounds = config.iterations.min(500);
    let runs = Arc::new(AtomicU64::new(0));
    for _ in 0..rounds {
        let once = Arc::new(PthreadOnce::new());
        let before = runs.load(Ordering::Relaxed);
        let (once_w, runs_w) = (Arc::clone(&once), Arc::clone(&runs));
        run_workers(config.threads, move |_| {
            once_w.call(|| {
                runs_w.fetch_add(1, Ordering::Relaxed);
            })
        })?;
        let ran = runs.load(Ordering::Relaxed) - before;
        check(Scenario::OnceRace, ran == 1 && once.is_done(), || {
            format!("routine ran {ran} times")
        })?;
    }
    ops.add("once_call", rounds * config.threads as u64);
    ops.add("routine_run", runs.load(Ordering::Relaxed));
    Ok(())
}

fn sem_pipeline(config: &ScenarioConfig, ops: &mut OpCounts) -> Result<(), HarnessError> {
    let sem = Arc::new(Sem::new(false, 0).op("sem_init")?);
    let consumed = Arc::new(AtomicU64::new(0));
    let producers = config.threads / 2;
    let consumers = config.threads - producers;
    let total = producers as u64 * config.iterations;
    // Spread the units over the consumers; the first takes the remainder.
    let share = total / consumers as u64;
    let extra = total % consumers as u64;
    let iterations = config.iterations;
    {
        let (sem, consumed) = (Arc::clone(&sem), Arc::clone(&consumed));
        run_workers(config.threads, move |index| {
            if index < producers {
                for _ in 0..iterations {
                    sem.post()?;
                }
            } else {
                let quota = share + if index == producers { extra } else { 0 };
                for _ in 0..quota {
                    sem.wait()?;
                    consumed.fetch_add(1, Ordering::Relaxed);
                }
            }
            Ok(())
        })?;
    }
    let consumed = consumed.load(Ordering::Relaxed);
    let left = sem.value().op("sem_getvalue")?;
    check(Scenario::SemPipeline, consumed == total && left == 0, || {
        format!("consumed {consumed} of {total}, {left} left")
    })?;
    sem.destroy().op("sem_destroy")?;
    ops.add("post", total);
    ops.add("wait", consumed);
    Ok(())
}

fn thread_churn(config: &ScenarioConfig, ops: &mut OpCounts) -> Result<(), HarnessError> {
    let batches = config.iterations.min(1_000);
    let mut retired: Vec<Pthread> = Vec::new();
    let mut reused_slots = 0u64;
    for batch in 0..batches {
        let mut handles = Vec::with_capacity(config.threads);
        for index in 0..config.threads {
            let value = usize::try_from(batch).unwrap_or(0).wrapping_add(index);
            handles.push((thread::spawn(None, move || value).op("pthread_create")?, value));
        }
        for (handle, expected) in handles {
            let value = thread::join(handle).op("pthread_join")?;
            check(Scenario::ThreadChurn, value == expected, || {
                format!("joined {value}, expected {expected}")
            })?;
            if retired.iter().any(|old| old.slot() == handle.slot()) {
                reused_slots += 1;
            }
            retired.push(handle);
        }
        if retired.len() > 4 * config.threads {
            retired.drain(..config.threads);
        }
    }
    for stale in &retired {
        check(
            Scenario::ThreadChurn,
            thread::join(*stale) == Err(Error::NoSuchThread),
            || format!("stale handle {stale:?} still joinable"),
        )?;
    }
    ops.add("create", batches * config.threads as u64);
    ops.add("join", batches * config.threads as u64);
    ops.add("slot_reuse", reused_slots);
    Ok(())
}

fn cancel_cleanup(config: &ScenarioConfig, ops: &mut OpCounts) -> Result<(), HarnessError> {
    let rounds = config.iterations.min(200);
    let limit = Duration::from_secs(10);
    let mut cleanups = 0u64;
    for _ in 0..rounds {
        let shared = Arc::new((
            PthreadMutex::new(None).op("pthread_mutex_init")?,
            PthreadCond::new(None).op("pthread_cond_init")?,
        ));
        let cleaned = Arc::new(AtomicBool::new(false));
        let victim = {
            let (shared, cleaned) = (Arc::clone(&shared), Arc::clone(&cleaned));
            thread::spawn(None, move || {
                let (mutex, cond) = &*shared;
                if mutex.lock().is_err() {
                    return 1;
                }
                let held = Arc::clone(&shared);
                cleanup::push(move || {
                    let _ = held.0.unlock();
                    cleaned.store(true, Ordering::SeqCst);
                });
                loop {
                    pthread_cond_wait(cond, mutex);
                }
            })
            .op("pthread_create")?
        };

        let (mutex, cond) = &*shared;
        check(Scenario::CancelCleanup, settle(limit, || cond.waiters() == 1), || {
            "victim never reached the cond wait".into()
        })?;
        cancel::cancel(victim).op("pthread_cancel")?;
        let value = thread::join(victim).op("pthread_join")?;
        check(Scenario::CancelCleanup, value == PTHREAD_CANCELED, || {
            format!("victim exited with {value:#x}")
        })?;
        check(Scenario::CancelCleanup, cleaned.load(Ordering::SeqCst), || {
            "cleanup handler did not run".into()
        })?;
        mutex.try_lock().op("pthread_mutex_trylock")?;
        mutex.unlock().op("pthread_mutex_unlock")?;
        cond.destroy().op("pthread_cond_destroy")?;
        mutex.destroy().op("pthread_mutex_destroy")?;
        cleanups += 1;
    }
    ops.add("cancel", rounds);
    ops.add("cleanup_run", cleanups);
    Ok(())
}
