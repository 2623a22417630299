//! Thread lifecycle and cancellation across the blocking primitives.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use frankenpthread_core::SyncError;
use frankenpthread_core::pthread::cancel::{
    self, PTHREAD_CANCEL_ASYNCHRONOUS, PTHREAD_CANCEL_DISABLE, PTHREAD_CANCEL_ENABLE, pop_cleanup,
    push_cleanup,
};
use frankenpthread_core::pthread::thread::{self, ThreadLifecycle};
use frankenpthread_core::pthread::{
    CondAttr, MutexAttr, PTHREAD_CANCELED, PthreadCond, PthreadKey, PthreadMutex, PthreadOnce,
    PthreadRwLock, RwLockAttr, Semaphore, ThreadAttr,
};

static TEST_GUARD: Mutex<()> = Mutex::new(());

fn spawn(f: impl FnOnce() -> usize + Send + 'static) -> frankenpthread_core::Pthread {
    thread::create(&ThreadAttr::default(), f).unwrap()
}

fn join_within(t: frankenpthread_core::Pthread) -> frankenpthread_core::SyncResult<usize> {
    thread::timed_join(t, Instant::now() + Duration::from_secs(10))
}

fn wait_until(mut ready: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !ready() {
        assert!(Instant::now() < deadline, "condition never became true");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn cancel_in_cond_wait_runs_cleanup_with_mutex_held() {
    let _guard = TEST_GUARD.lock().unwrap();
    let m = Arc::new(PthreadMutex::new(&MutexAttr::new()).unwrap());
    let cv = Arc::new(PthreadCond::new(&CondAttr::new()).unwrap());
    let (tm, tcv) = (Arc::clone(&m), Arc::clone(&cv));
    let t = spawn(move || {
        tm.lock().unwrap();
        let unlock = Arc::clone(&tm);
        push_cleanup(move || {
            unlock.unlock().unwrap();
        })
        .unwrap();
        loop {
            let _ = tcv.wait(&tm);
        }
    });
    wait_until(|| cv.waiting().unwrap() == 1);
    thread::cancel(t).unwrap();
    assert_eq!(thread::join(t), Ok(PTHREAD_CANCELED));
    // The cleanup handler released the reacquired mutex.
    m.try_lock().unwrap();
    m.unlock().unwrap();
    assert_eq!(cv.waiting().unwrap(), 0);
    cv.destroy().unwrap();
    m.destroy().unwrap();
}

#[test]
fn cancel_in_semaphore_wait() {
    let _guard = TEST_GUARD.lock().unwrap();
    let sem = Arc::new(Semaphore::new(0, 0).unwrap());
    let remote = Arc::clone(&sem);
    let t = spawn(move || {
        let _ = remote.wait();
        1
    });
    wait_until(|| {
        thread::lookup(t).lifecycle() == Some(ThreadLifecycle::Running)
            && sem.value().unwrap() == 0
    });
    std::thread::sleep(Duration::from_millis(10));
    thread::cancel(t).unwrap();
    assert_eq!(thread::join(t), Ok(PTHREAD_CANCELED));
    // No unit was consumed by the canceled waiter.
    sem.post().unwrap();
    assert_eq!(sem.value().unwrap(), 1);
}

#[test]
fn contended_mutex_lock_is_a_cancellation_point() {
    let _guard = TEST_GUARD.lock().unwrap();
    let m = Arc::new(PthreadMutex::new(&MutexAttr::new()).unwrap());
    m.lock().unwrap();
    let remote = Arc::clone(&m);
    let t = spawn(move || {
        let _ = remote.lock();
        1
    });
    std::thread::sleep(Duration::from_millis(20));
    thread::cancel(t).unwrap();
    assert_eq!(thread::join(t), Ok(PTHREAD_CANCELED));
    m.unlock().unwrap();
    // The withdrawn waiter left the counter consistent.
    m.try_lock().unwrap();
    m.unlock().unwrap();
    m.destroy().unwrap();
}

#[test]
fn disabled_cancellation_is_deferred_until_enabled() {
    let _guard = TEST_GUARD.lock().unwrap();
    let reached = Arc::new(AtomicUsize::new(0));
    let progress = Arc::clone(&reached);
    let gate = Arc::new(Semaphore::new(0, 0).unwrap());
    let remote_gate = Arc::clone(&gate);
    let t = spawn(move || {
        cancel::set_cancel_state(PTHREAD_CANCEL_DISABLE).unwrap();
        progress.store(1, Ordering::SeqCst);
        remote_gate.wait().unwrap();
        cancel::test_cancel().unwrap();
        progress.store(2, Ordering::SeqCst);
        cancel::set_cancel_state(PTHREAD_CANCEL_ENABLE).unwrap();
        let _ = cancel::test_cancel();
        progress.store(3, Ordering::SeqCst);
        0
    });
    wait_until(|| reached.load(Ordering::SeqCst) == 1);
    thread::cancel(t).unwrap();
    gate.post().unwrap();
    assert_eq!(thread::join(t), Ok(PTHREAD_CANCELED));
    assert_eq!(reached.load(Ordering::SeqCst), 2);
}

#[test]
fn cleanup_pop_without_execute_discards_handler() {
    let _guard = TEST_GUARD.lock().unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ran);
    let t = spawn(move || {
        let first = Arc::clone(&counter);
        push_cleanup(move || {
            first.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        let second = Arc::clone(&counter);
        push_cleanup(move || {
            second.fetch_add(10, Ordering::SeqCst);
        })
        .unwrap();
        assert!(pop_cleanup(false));
        0
    });
    assert_eq!(thread::join(t), Ok(0));
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

static DESTROYED: AtomicUsize = AtomicUsize::new(0);

fn record_destroy(value: usize) {
    DESTROYED.fetch_add(value, Ordering::SeqCst);
}

#[test]
fn key_destructors_run_at_thread_exit() {
    let _guard = TEST_GUARD.lock().unwrap();
    let key = PthreadKey::create(Some(record_destroy)).unwrap();
    let before = DESTROYED.load(Ordering::SeqCst);
    let t = spawn(move || {
        key.set(5).unwrap();
        assert_eq!(key.get(), Some(5));
        0
    });
    thread::join(t).unwrap();
    let canceled = spawn(move || {
        key.set(7).unwrap();
        loop {
            let _ = cancel::test_cancel();
            std::thread::yield_now();
        }
    });
    thread::cancel(canceled).unwrap();
    assert_eq!(thread::join(canceled), Ok(PTHREAD_CANCELED));
    assert_eq!(DESTROYED.load(Ordering::SeqCst) - before, 12);
    assert_eq!(key.get(), None);
    key.delete().unwrap();
}

#[test]
fn canceled_once_initializer_is_retried() {
    let _guard = TEST_GUARD.lock().unwrap();
    static ONCE: PthreadOnce = PthreadOnce::INIT;
    static RUNS: AtomicUsize = AtomicUsize::new(0);
    let t = spawn(|| {
        ONCE.call(|| {
            RUNS.fetch_add(1, Ordering::SeqCst);
            let me = thread::self_id();
            let _ = thread::cancel(me);
            let _ = cancel::test_cancel();
        })
        .unwrap();
        0
    });
    assert_eq!(thread::join(t), Ok(PTHREAD_CANCELED));
    assert!(!ONCE.is_completed());
    ONCE.call(|| {
        RUNS.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    assert!(ONCE.is_completed());
    assert_eq!(RUNS.load(Ordering::SeqCst), 2);
}

#[test]
fn suspend_all_and_resume_all() {
    let _guard = TEST_GUARD.lock().unwrap();
    let ticks = Arc::new(AtomicUsize::new(0));
    let stop = Arc::new(AtomicUsize::new(0));
    let workers: Vec<_> = (0..3)
        .map(|_| {
            let (ticks, stop) = (Arc::clone(&ticks), Arc::clone(&stop));
            spawn(move || {
                while stop.load(Ordering::SeqCst) == 0 {
                    cancel::test_cancel().unwrap();
                    ticks.fetch_add(1, Ordering::SeqCst);
                    std::thread::yield_now();
                }
                0
            })
        })
        .collect();
    wait_until(|| ticks.load(Ordering::SeqCst) > 0);
    assert!(thread::suspend_all_except_self() >= workers.len());
    wait_until(|| {
        workers
            .iter()
            .all(|&w| thread::lookup(w).lifecycle() == Some(ThreadLifecycle::Suspended))
    });
    let frozen = ticks.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(ticks.load(Ordering::SeqCst), frozen);
    stop.store(1, Ordering::SeqCst);
    thread::resume_all();
    for w in workers {
        assert_eq!(thread::join(w), Ok(0));
    }
}

#[test]
fn canceled_waiting_writer_admits_queued_readers() {
    let _guard = TEST_GUARD.lock().unwrap();
    let rw = Arc::new(PthreadRwLock::new(&RwLockAttr::new()).unwrap());
    rw.read_lock().unwrap();

    let remote = Arc::clone(&rw);
    let writer = spawn(move || {
        let _ = remote.write_lock();
        1
    });
    wait_until(|| rw.waiting_writers().unwrap() == 1);

    // Queues behind the writer even though only reads are held.
    let remote = Arc::clone(&rw);
    let reader = spawn(move || {
        remote.read_lock().unwrap();
        remote.unlock().unwrap();
        7
    });
    wait_until(|| rw.waiting_readers().unwrap() == 1);

    thread::cancel(writer).unwrap();
    assert_eq!(join_within(writer), Ok(PTHREAD_CANCELED));
    assert_eq!(join_within(reader), Ok(7));
    assert_eq!(rw.waiting_writers().unwrap(), 0);
    assert_eq!(rw.waiting_readers().unwrap(), 0);

    rw.unlock().unwrap();
    rw.try_write_lock().unwrap();
    rw.unlock().unwrap();
    rw.destroy().unwrap();
}

#[test]
fn canceled_reader_cleanup_can_use_the_rwlock() {
    let _guard = TEST_GUARD.lock().unwrap();
    let rw = Arc::new(PthreadRwLock::new(&RwLockAttr::new()).unwrap());
    rw.write_lock().unwrap();

    let busy_in_cleanup = Arc::new(AtomicUsize::new(0));
    let (remote, seen) = (Arc::clone(&rw), Arc::clone(&busy_in_cleanup));
    let reader = spawn(move || {
        let in_cleanup = Arc::clone(&remote);
        push_cleanup(move || {
            if in_cleanup.try_read_lock() == Err(SyncError::Busy) {
                seen.store(1, Ordering::SeqCst);
            }
        })
        .unwrap();
        let _ = remote.read_lock();
        0
    });
    wait_until(|| rw.waiting_readers().unwrap() == 1);

    thread::cancel(reader).unwrap();
    assert_eq!(join_within(reader), Ok(PTHREAD_CANCELED));
    assert_eq!(busy_in_cleanup.load(Ordering::SeqCst), 1);
    assert_eq!(rw.waiting_readers().unwrap(), 0);

    rw.unlock().unwrap();
    rw.try_read_lock().unwrap();
    rw.unlock().unwrap();
    rw.destroy().unwrap();
}

#[test]
fn asynchronous_self_cancel_exits_at_once() {
    let _guard = TEST_GUARD.lock().unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ran);
    let t = spawn(move || {
        let handler = Arc::clone(&counter);
        push_cleanup(move || {
            handler.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        // Deferred: the request waits for a cancellation point.
        thread::cancel(thread::self_id()).unwrap();
        counter.fetch_add(10, Ordering::SeqCst);
        cancel::set_cancel_type(PTHREAD_CANCEL_ASYNCHRONOUS).unwrap();
        let _ = thread::cancel(thread::self_id());
        counter.fetch_add(100, Ordering::SeqCst);
        0
    });
    assert_eq!(thread::join(t), Ok(PTHREAD_CANCELED));
    assert_eq!(ran.load(Ordering::SeqCst), 11);
}

#[test]
fn panicking_thread_runs_cleanup_and_key_destructors() {
    let _guard = TEST_GUARD.lock().unwrap();
    let key = PthreadKey::create(Some(record_destroy)).unwrap();
    let before = DESTROYED.load(Ordering::SeqCst);
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ran);
    let t = spawn(move || {
        push_cleanup(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        key.set(4).unwrap();
        panic!("worker failed");
    });
    assert_eq!(join_within(t), Ok(PTHREAD_CANCELED));
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert_eq!(DESTROYED.load(Ordering::SeqCst) - before, 4);
    key.delete().unwrap();
}
