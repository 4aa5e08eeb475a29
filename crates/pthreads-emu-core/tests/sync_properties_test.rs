//! Cross-thread properties of the synchronisation primitives.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use pthreads_emu_core::error::Error;
use pthreads_emu_core::kernel;
use pthreads_emu_core::pthread::{
    PTHREAD_MUTEX_ERRORCHECK, PTHREAD_MUTEX_NORMAL, PTHREAD_MUTEX_RECURSIVE, Phase, PthreadBarrier,
    PthreadCond, PthreadMutex, PthreadMutexAttr, PthreadRwlock, PthreadSpinlock, pthread_mutex_lock,
    pthread_mutex_unlock,
};
use pthreads_emu_core::semaphore::Sem;

fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..2_000 {
        if done() {
            return;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    panic!("condition not reached within 2s");
}

#[test]
fn every_mutex_kind_is_mutually_exclusive() {
    for kind in [PTHREAD_MUTEX_NORMAL, PTHREAD_MUTEX_RECURSIVE, PTHREAD_MUTEX_ERRORCHECK] {
        let mutex = Arc::new(PthreadMutex::new(Some(&PthreadMutexAttr::with_kind(kind))).unwrap());
        let inside = Arc::new(AtomicI32::new(0));
        let total = Arc::new(AtomicU32::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let (mutex, inside, total) = (Arc::clone(&mutex), Arc::clone(&inside), Arc::clone(&total));
                std::thread::spawn(move || {
                    for _ in 0..2_000 {
                        assert_eq!(pthread_mutex_lock(&mutex), 0);
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0, "two holders at once");
                        total.fetch_add(1, Ordering::Relaxed);
                        inside.fetch_sub(1, Ordering::SeqCst);
                        assert_eq!(pthread_mutex_unlock(&mutex), 0);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(total.load(Ordering::Relaxed), 8_000);
        assert!(!mutex.is_locked());
        mutex.destroy().unwrap();
    }
}

#[test]
fn recursive_mutex_needs_matching_unlocks() {
    let mutex = Arc::new(PthreadMutex::new(Some(&PthreadMutexAttr::with_kind(PTHREAD_MUTEX_RECURSIVE))).unwrap());
    for _ in 0..5 {
        mutex.lock().unwrap();
    }
    for _ in 0..4 {
        mutex.unlock().unwrap();
        assert!(mutex.is_locked());
    }
    let other = Arc::clone(&mutex);
    let busy = std::thread::spawn(move || other.try_lock()).join().unwrap();
    assert_eq!(busy, Err(Error::Busy));

    mutex.unlock().unwrap();
    assert!(!mutex.is_locked());
    assert_eq!(mutex.unlock(), Err(Error::NotPermitted));
}

#[test]
fn errorcheck_mutex_reports_relock_and_foreign_unlock() {
    let mutex = Arc::new(PthreadMutex::new(Some(&PthreadMutexAttr::with_kind(PTHREAD_MUTEX_ERRORCHECK))).unwrap());
    mutex.lock().unwrap();
    assert_eq!(mutex.lock(), Err(Error::Deadlock));

    let other = Arc::clone(&mutex);
    let foreign = std::thread::spawn(move || other.unlock()).join().unwrap();
    assert_eq!(foreign, Err(Error::NotPermitted));
    mutex.unlock().unwrap();
}

#[test]
fn static_mutex_destroyed_unused_creates_no_kernel_objects() {
    let before = kernel::created_by_current_thread();
    let mutex = PthreadMutex::static_initializer(PTHREAD_MUTEX_NORMAL);
    assert_eq!(mutex.phase(), Phase::Static);
    mutex.destroy().unwrap();
    assert_eq!(mutex.phase(), Phase::Destroyed);
    assert_eq!(kernel::created_by_current_thread(), before);
    assert_eq!(mutex.lock(), Err(Error::Invalid));
}

#[test]
fn static_mutex_first_use_races_to_a_single_initialisation() {
    let mutex = Arc::new(PthreadMutex::static_initializer(PTHREAD_MUTEX_NORMAL));
    let counter = Arc::new(AtomicU32::new(0));
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let (mutex, counter) = (Arc::clone(&mutex), Arc::clone(&counter));
            std::thread::spawn(move || {
                for _ in 0..500 {
                    mutex.lock().unwrap();
                    let seen = counter.load(Ordering::Relaxed);
                    counter.store(seen + 1, Ordering::Relaxed);
                    mutex.unlock().unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(counter.load(Ordering::Relaxed), 4_000);
    assert_eq!(mutex.phase(), Phase::Ready);
}

#[test]
fn broadcast_wakes_every_waiter() {
    const WAITERS: u32 = 6;
    let shared = Arc::new((PthreadMutex::new(None).unwrap(), PthreadCond::new(None).unwrap()));
    let go = Arc::new(AtomicBool::new(false));
    let woken = Arc::new(AtomicU32::new(0));

    let workers: Vec<_> = (0..WAITERS)
        .map(|_| {
            let (shared, go, woken) = (Arc::clone(&shared), Arc::clone(&go), Arc::clone(&woken));
            std::thread::spawn(move || {
                let (mutex, cond) = &*shared;
                mutex.lock().unwrap();
                while !go.load(Ordering::Relaxed) {
                    cond.wait(mutex).unwrap();
                }
                woken.fetch_add(1, Ordering::SeqCst);
                mutex.unlock().unwrap();
            })
        })
        .collect();

    wait_until(|| shared.1.waiters() == WAITERS);
    let (mutex, cond) = &*shared;
    mutex.lock().unwrap();
    go.store(true, Ordering::Relaxed);
    cond.broadcast().unwrap();
    mutex.unlock().unwrap();

    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(woken.load(Ordering::SeqCst), WAITERS);
    assert_eq!(cond.waiters(), 0);
    cond.destroy().unwrap();
}

#[test]
fn signal_releases_one_waiter_at_a_time() {
    let shared = Arc::new((PthreadMutex::new(None).unwrap(), PthreadCond::new(None).unwrap()));
    let tokens = Arc::new(AtomicU32::new(0));
    let consumed = Arc::new(AtomicU32::new(0));

    let workers: Vec<_> = (0..3)
        .map(|_| {
            let (shared, tokens, consumed) = (Arc::clone(&shared), Arc::clone(&tokens), Arc::clone(&consumed));
            std::thread::spawn(move || {
                let (mutex, cond) = &*shared;
                mutex.lock().unwrap();
                while tokens.load(Ordering::Relaxed) == 0 {
                    cond.wait(mutex).unwrap();
                }
                tokens.fetch_sub(1, Ordering::Relaxed);
                consumed.fetch_add(1, Ordering::SeqCst);
                mutex.unlock().unwrap();
            })
        })
        .collect();

    wait_until(|| shared.1.waiters() == 3);
    let (mutex, cond) = &*shared;
    for round in 1..=3 {
        mutex.lock().unwrap();
        tokens.fetch_add(1, Ordering::Relaxed);
        cond.signal().unwrap();
        mutex.unlock().unwrap();
        wait_until(|| consumed.load(Ordering::SeqCst) == round);
    }
    for worker in workers {
        worker.join().unwrap();
    }
}

#[test]
fn timed_wait_past_deadline_times_out_holding_the_mutex() {
    let mutex = PthreadMutex::new(Some(&PthreadMutexAttr::with_kind(PTHREAD_MUTEX_ERRORCHECK))).unwrap();
    let cond = PthreadCond::new(None).unwrap();
    mutex.lock().unwrap();
    let past = SystemTime::now() - Duration::from_secs(1);
    assert_eq!(cond.timed_wait(&mutex, past), Err(Error::TimedOut));
    // Still owned by us: errorcheck reports the relock.
    assert_eq!(mutex.lock(), Err(Error::Deadlock));
    mutex.unlock().unwrap();
    assert_eq!(cond.waiters(), 0);
    cond.destroy().unwrap();
}

#[test]
fn queued_writer_holds_back_new_readers() {
    let rwlock = Arc::new(PthreadRwlock::new(None).unwrap());
    rwlock.read_lock().unwrap();

    let writer_in = Arc::new(AtomicBool::new(false));
    let writer = {
        let (rwlock, writer_in) = (Arc::clone(&rwlock), Arc::clone(&writer_in));
        std::thread::spawn(move || {
            rwlock.write_lock().unwrap();
            writer_in.store(true, Ordering::SeqCst);
            rwlock.unlock().unwrap();
        })
    };

    // Until the writer queues, readers still get in.
    wait_until(|| match rwlock.try_read_lock() {
        Ok(()) => {
            rwlock.unlock().unwrap();
            false
        }
        Err(err) => {
            assert_eq!(err, Error::Busy);
            true
        }
    });
    assert!(!writer_in.load(Ordering::SeqCst));

    rwlock.unlock().unwrap();
    writer.join().unwrap();
    assert!(writer_in.load(Ordering::SeqCst));
    assert_eq!(rwlock.holders(), 0);
    rwlock.destroy().unwrap();
}

#[test]
fn readers_wait_out_a_held_write_lock_then_all_enter() {
    const READERS: usize = 5;
    let rwlock = Arc::new(PthreadRwlock::new(None).unwrap());
    rwlock.write_lock().unwrap();

    let acquired = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let (rwlock, acquired, release) =
                (Arc::clone(&rwlock), Arc::clone(&acquired), Arc::clone(&release));
            std::thread::spawn(move || {
                rwlock.read_lock().unwrap();
                acquired.fetch_add(1, Ordering::SeqCst);
                while !release.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(1));
                }
                rwlock.unlock().unwrap();
            })
        })
        .collect();

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(acquired.load(Ordering::SeqCst), 0, "reader got past the writer");
    assert_eq!(rwlock.holders(), -1);

    rwlock.unlock().unwrap();
    wait_until(|| acquired.load(Ordering::SeqCst) == READERS);
    assert_eq!(rwlock.holders(), READERS as i32);

    release.store(true, Ordering::SeqCst);
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(rwlock.holders(), 0);
    rwlock.destroy().unwrap();
}

#[test]
fn rwlock_admits_concurrent_readers() {
    let rwlock = Arc::new(PthreadRwlock::new(None).unwrap());
    let barrier = Arc::new(PthreadBarrier::new(None, 3).unwrap());
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let (rwlock, barrier) = (Arc::clone(&rwlock), Arc::clone(&barrier));
            std::thread::spawn(move || {
                rwlock.read_lock().unwrap();
                // All three meet here only if they hold the lock together.
                barrier.wait().unwrap();
                rwlock.unlock().unwrap();
            })
        })
        .collect();
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(rwlock.holders(), 0);
}

#[test]
fn barrier_cycles_elect_one_serial_thread_each() {
    const THREADS: usize = 4;
    const CYCLES: usize = 10_000;
    let barrier = Arc::new(PthreadBarrier::new(None, THREADS as u32).unwrap());
    let serials = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let (barrier, serials) = (Arc::clone(&barrier), Arc::clone(&serials));
            std::thread::spawn(move || {
                for _ in 0..CYCLES {
                    if barrier.wait().unwrap().is_serial() {
                        serials.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(serials.load(Ordering::Relaxed), CYCLES);
    barrier.destroy().unwrap();
}

#[test]
fn barrier_of_one_never_blocks() {
    let barrier = PthreadBarrier::new(None, 1).unwrap();
    for _ in 0..3 {
        assert!(barrier.wait().unwrap().is_serial());
    }
    barrier.destroy().unwrap();
}

#[test]
fn spinlock_protects_a_counter() {
    let lock = Arc::new(PthreadSpinlock::new(0).unwrap());
    let counter = Arc::new(AtomicU32::new(0));
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let (lock, counter) = (Arc::clone(&lock), Arc::clone(&counter));
            std::thread::spawn(move || {
                for _ in 0..1_000 {
                    lock.lock().unwrap();
                    let seen = counter.load(Ordering::Relaxed);
                    counter.store(seen + 1, Ordering::Relaxed);
                    lock.unlock().unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(counter.load(Ordering::Relaxed), 4_000);
    lock.destroy().unwrap();
}

#[test]
fn semaphore_hands_out_posted_units() {
    let sem = Arc::new(Sem::new(false, 0).unwrap());
    let taken = Arc::new(AtomicU32::new(0));
    let workers: Vec<_> = (0..3)
        .map(|_| {
            let (sem, taken) = (Arc::clone(&sem), Arc::clone(&taken));
            std::thread::spawn(move || {
                sem.wait().unwrap();
                taken.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();
    wait_until(|| sem.value() == Ok(-3));
    sem.post_multiple(3).unwrap();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(taken.load(Ordering::SeqCst), 3);
    assert_eq!(sem.value(), Ok(0));
    sem.destroy().unwrap();
}
