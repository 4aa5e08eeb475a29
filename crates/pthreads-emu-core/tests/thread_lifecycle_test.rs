//! Thread identity, join, cancellation and exit across real threads.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use pthreads_emu_core::error::Error;
use pthreads_emu_core::errno;
use pthreads_emu_core::pthread::{
    PTHREAD_CANCELED, PthreadAttr, PthreadBarrier, PthreadCond, PthreadKey, PthreadMutex,
    PthreadRwlock, cleanup, pthread_barrier_wait, pthread_cancel, pthread_cond_wait,
    pthread_create, pthread_equal, pthread_join, pthread_key_create, pthread_rwlock_wrlock,
    pthread_setspecific, thread, tls,
};

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
fn stale_handle_never_equals_the_next_occupant() {
    let first = thread::spawn(None, || 0).unwrap();
    assert_eq!(thread::join(first), Ok(0));

    let mut reused = None;
    for _ in 0..10_000 {
        let next = thread::spawn(None, || 0).unwrap();
        assert_eq!(thread::join(next), Ok(0));
        if next.slot() == first.slot() {
            reused = Some(next);
            break;
        }
    }
    let reused = reused.expect("slot was never reused");
    assert_ne!(reused.reuse(), first.reuse());
    assert_eq!(pthread_equal(first, reused), 0);
    assert_eq!(thread::join(first), Err(Error::NoSuchThread));
    assert_eq!(thread::kill(first, 0), Err(Error::NoSuchThread));
}

fn start_returning_arg(arg: usize) -> usize {
    arg * 2
}

#[test]
fn posix_create_and_join_round_trip_the_exit_value() {
    let mut handle = thread::Pthread::default();
    assert_eq!(pthread_create(&mut handle, None, start_returning_arg, 21), 0);
    let mut value = 0usize;
    assert_eq!(pthread_join(handle, Some(&mut value)), 0);
    assert_eq!(value, 42);
    assert_eq!(pthread_join(handle, None), errno::ESRCH);
}

#[test]
fn cancel_during_cond_wait_runs_cleanup_that_releases_the_mutex() {
    let shared = Arc::new((PthreadMutex::new(None).unwrap(), PthreadCond::new(None).unwrap()));
    let cleaned = Arc::new(AtomicBool::new(false));

    let child = {
        let (shared, cleaned) = (Arc::clone(&shared), Arc::clone(&cleaned));
        thread::spawn(None, move || {
            let (mutex, cond) = &*shared;
            mutex.lock().unwrap();
            let unlock = Arc::clone(&shared);
            let flag = Arc::clone(&cleaned);
            cleanup::push(move || {
                unlock.0.unlock().unwrap();
                flag.store(true, Ordering::SeqCst);
            });
            loop {
                pthread_cond_wait(cond, mutex);
            }
        })
        .unwrap()
    };

    wait_until(|| shared.1.waiters() == 1);
    assert_eq!(pthread_cancel(child), 0);
    assert_eq!(thread::join(child), Ok(PTHREAD_CANCELED));
    assert!(cleaned.load(Ordering::SeqCst));

    let (mutex, cond) = &*shared;
    mutex.try_lock().unwrap();
    mutex.unlock().unwrap();
    assert_eq!(cond.waiters(), 0);
}

#[test]
fn canceled_writer_stops_holding_back_readers() {
    let rwlock = Arc::new(PthreadRwlock::new(None).unwrap());
    rwlock.read_lock().unwrap();

    let writer = {
        let rwlock = Arc::clone(&rwlock);
        thread::spawn(None, move || pthread_rwlock_wrlock(&rwlock) as usize).unwrap()
    };

    // A queued writer turns new readers away.
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

    assert_eq!(pthread_cancel(writer), 0);
    assert_eq!(thread::join(writer), Ok(PTHREAD_CANCELED));

    assert_eq!(rwlock.try_read_lock(), Ok(()));
    assert_eq!(rwlock.holders(), 2);
    rwlock.unlock().unwrap();
    rwlock.unlock().unwrap();
    assert_eq!(rwlock.try_write_lock(), Ok(()));
    rwlock.unlock().unwrap();
    rwlock.destroy().unwrap();
}

#[test]
fn canceled_barrier_arrival_is_withdrawn_from_its_cycle() {
    let barrier = Arc::new(PthreadBarrier::new(None, 3).unwrap());

    let early = {
        let barrier = Arc::clone(&barrier);
        thread::spawn(None, move || pthread_barrier_wait(&barrier) as usize).unwrap()
    };
    wait_until(|| barrier.waiting() == 1);
    assert_eq!(pthread_cancel(early), 0);
    assert_eq!(thread::join(early), Ok(PTHREAD_CANCELED));
    assert_eq!(barrier.waiting(), 0);

    let arrivals: Vec<_> = (0..3)
        .map(|_| {
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || barrier.wait().unwrap().is_serial())
        })
        .collect();
    let serial = arrivals
        .into_iter()
        .map(|arrival| arrival.join().unwrap())
        .filter(|&is_serial| is_serial)
        .count();
    assert_eq!(serial, 1);
    assert_eq!(barrier.waiting(), 0);
    barrier.destroy().unwrap();
}

#[test]
fn cancel_before_the_first_cancellation_point_is_deferred() {
    let release = Arc::new(AtomicBool::new(false));
    let reached = Arc::new(AtomicBool::new(false));
    let child = {
        let (release, reached) = (Arc::clone(&release), Arc::clone(&reached));
        thread::spawn(None, move || {
            while !release.load(Ordering::SeqCst) {
                std::thread::yield_now();
            }
            reached.store(true, Ordering::SeqCst);
            pthreads_emu_core::pthread::pthread_testcancel();
            7
        })
        .unwrap()
    };
    assert_eq!(pthread_cancel(child), 0);
    release.store(true, Ordering::SeqCst);
    assert_eq!(thread::join(child), Ok(PTHREAD_CANCELED));
    assert!(reached.load(Ordering::SeqCst));
}

static DESTROYED_WITH: AtomicUsize = AtomicUsize::new(0);

fn record_destructor(value: usize) {
    DESTROYED_WITH.store(value, Ordering::SeqCst);
}

#[test]
fn exit_runs_thread_specific_destructors() {
    let mut key = PthreadKey::default();
    assert_eq!(pthread_key_create(&mut key, Some(record_destructor)), 0);

    let child = thread::spawn(None, move || {
        assert_eq!(pthread_setspecific(key, 0xBEEF), 0);
        thread::exit(99)
    })
    .unwrap();
    assert_eq!(thread::join(child), Ok(99));
    assert_eq!(DESTROYED_WITH.load(Ordering::SeqCst), 0xBEEF);
    tls::key_delete(key).unwrap();
}

#[test]
fn concurrent_joiners_all_observe_the_exit() {
    let release = Arc::new(AtomicBool::new(false));
    let target = {
        let release = Arc::clone(&release);
        thread::spawn(None, move || {
            while !release.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
            5
        })
        .unwrap()
    };

    let joiners: Vec<_> = (0..3)
        .map(|_| std::thread::spawn(move || thread::join(target)))
        .collect();
    std::thread::sleep(Duration::from_millis(100));
    release.store(true, Ordering::SeqCst);

    let results: Vec<_> = joiners.into_iter().map(|j| j.join().unwrap()).collect();
    assert!(results.contains(&Ok(5)), "{results:?}");
    // A joiner that arrived after the block was reclaimed sees a stale handle.
    assert!(
        results.iter().all(|r| *r == Ok(5) || *r == Err(Error::NoSuchThread)),
        "{results:?}"
    );
    assert_eq!(thread::kill(target, 0), Err(Error::NoSuchThread));
}

#[test]
fn detached_thread_is_reclaimed_on_exit() {
    let child = thread::spawn(Some(&PthreadAttr::detached()), || 3).unwrap();
    wait_until(|| thread::kill(child, 0) == Err(Error::NoSuchThread));
    assert_eq!(thread::join(child), Err(Error::NoSuchThread));
    assert_eq!(thread::detach(child), Err(Error::NoSuchThread));
}

#[test]
fn joining_a_detached_thread_is_invalid() {
    let release = Arc::new(AtomicBool::new(false));
    let child = {
        let release = Arc::clone(&release);
        thread::spawn(Some(&PthreadAttr::detached()), move || {
            while !release.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
            0
        })
        .unwrap()
    };
    assert_eq!(thread::join(child), Err(Error::Invalid));
    assert_eq!(thread::detach(child), Err(Error::Invalid));
    release.store(true, Ordering::SeqCst);
}

#[test]
fn self_join_is_a_deadlock() {
    let child = thread::spawn(None, || match thread::join(thread::current()) {
        Err(Error::Deadlock) => 1,
        _ => 0,
    })
    .unwrap();
    assert_eq!(thread::join(child), Ok(1));
}

#[test]
fn panicking_start_routine_still_releases_joiners() {
    let child = thread::spawn(None, || -> usize { panic!("start routine failed") }).unwrap();
    assert_eq!(thread::join(child), Ok(PTHREAD_CANCELED));
}
