//! Conformance scenarios.
//!
//! Each scenario exercises one observable property of the primitives across
//! real threads and reports pass/fail with a short detail object.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{Value, json};

use frankenpthread_core::pthread::cancel::push_cleanup;
use frankenpthread_core::pthread::fork;
use frankenpthread_core::pthread::mutex::MutexOwner;
use frankenpthread_core::pthread::semaphore::OpenFlags;
use frankenpthread_core::pthread::thread;
use frankenpthread_core::pthread::{
    CondAttr, MutexAttr, MutexType, PTHREAD_CANCELED, PthreadCond, PthreadMutex, PthreadRwLock,
    RwLockAttr, Semaphore, ThreadAttr,
};
use frankenpthread_core::{StateViolation, SyncError};

/// Why a scenario failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errno: Option<i32>,
}

impl From<SyncError> for Failure {
    fn from(err: SyncError) -> Self {
        Self {
            message: err.to_string(),
            errno: Some(err.errno()),
        }
    }
}

fn check(cond: bool, message: impl Into<String>) -> Result<(), Failure> {
    if cond {
        Ok(())
    } else {
        Err(Failure {
            message: message.into(),
            errno: None,
        })
    }
}

fn expect_err<T: std::fmt::Debug>(
    got: Result<T, SyncError>,
    want: SyncError,
    what: &str,
) -> Result<(), Failure> {
    match got {
        Err(err) if err == want => Ok(()),
        other => Err(Failure {
            message: format!("{what}: expected {want:?}, got {other:?}"),
            errno: None,
        }),
    }
}

fn join_host<T>(handle: std::thread::JoinHandle<T>) -> Result<T, Failure> {
    handle.join().map_err(|_| Failure {
        message: "worker thread panicked".to_string(),
        errno: None,
    })
}

pub type ScenarioFn = fn() -> Result<Value, Failure>;

/// A named conformance scenario.
#[derive(Clone, Copy)]
pub struct Scenario {
    pub name: &'static str,
    pub primitive: &'static str,
    /// The property checked, in one line.
    pub property: &'static str,
    pub run: ScenarioFn,
}

pub const SCENARIOS: &[Scenario] = &[
    Scenario {
        name: "mutex_mutual_exclusion",
        primitive: "mutex",
        property: "at most one holder at a time for every mutex type",
        run: mutex_mutual_exclusion,
    },
    Scenario {
        name: "recursive_unlock_balance",
        primitive: "mutex",
        property: "N locks need N unlocks; non-owner unlock changes nothing",
        run: recursive_unlock_balance,
    },
    Scenario {
        name: "errorcheck_trylock_handoff",
        primitive: "mutex",
        property: "B's trylock is Busy while A holds; B owns after A unlocks",
        run: errorcheck_trylock_handoff,
    },
    Scenario {
        name: "cond_no_lost_wakeup",
        primitive: "cond",
        property: "a signal after waiter registration always wakes it",
        run: cond_no_lost_wakeup,
    },
    Scenario {
        name: "cond_broadcast_two_waiters",
        primitive: "cond",
        property: "both waiters observe a broadcast update exactly once",
        run: cond_broadcast_two_waiters,
    },
    Scenario {
        name: "timeout_purity",
        primitive: "all",
        property: "an expired deadline leaves observable state unchanged",
        run: timeout_purity,
    },
    Scenario {
        name: "rwlock_writer_admission",
        primitive: "rwlock",
        property: "a waiting writer is admitted within bounded reader acquisitions",
        run: rwlock_writer_admission,
    },
    Scenario {
        name: "semaphore_conservation",
        primitive: "semaphore",
        property: "value equals initial plus posts minus completed waits",
        run: semaphore_conservation,
    },
    Scenario {
        name: "named_semaphore_identity",
        primitive: "semaphore",
        property: "exclusive create, reopen by identity, unlink then close",
        run: named_semaphore_identity,
    },
    Scenario {
        name: "thread_cancel_cleanup",
        primitive: "thread",
        property: "a canceled waiter runs cleanup handlers and exits canceled",
        run: thread_cancel_cleanup,
    },
    Scenario {
        name: "fork_prepare_parent",
        primitive: "fork",
        property: "prepare then parent leaves every primitive usable",
        run: fork_prepare_parent,
    },
];

/// Look up a scenario by name.
#[must_use]
pub fn find(name: &str) -> Option<&'static Scenario> {
    SCENARIOS.iter().find(|s| s.name == name)
}

// ---------------------------------------------------------------------------
// Mutex
// ---------------------------------------------------------------------------

fn mutex_mutual_exclusion() -> Result<Value, Failure> {
    const THREADS: usize = 4;
    const ROUNDS: usize = 500;
    let mut per_type = serde_json::Map::new();
    for kind in [MutexType::Normal, MutexType::Recursive, MutexType::ErrorCheck] {
        let m = Arc::new(PthreadMutex::new(&MutexAttr::with_type(kind))?);
        let inside = Arc::new(AtomicU32::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                let (m, inside, overlaps) =
                    (Arc::clone(&m), Arc::clone(&inside), Arc::clone(&overlaps));
                std::thread::spawn(move || -> Result<(), SyncError> {
                    for _ in 0..ROUNDS {
                        m.lock()?;
                        if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        inside.fetch_sub(1, Ordering::SeqCst);
                        m.unlock()?;
                    }
                    Ok(())
                })
            })
            .collect();
        for w in workers {
            join_host(w)??;
        }
        let overlaps = overlaps.load(Ordering::SeqCst);
        check(overlaps == 0, format!("{kind:?}: {overlaps} overlapping holders"))?;
        m.destroy()?;
        per_type.insert(format!("{kind:?}"), json!(THREADS * ROUNDS));
    }
    Ok(Value::Object(per_type))
}

fn recursive_unlock_balance() -> Result<Value, Failure> {
    const DEPTH: u32 = 5;
    let m = Arc::new(PthreadMutex::new(&MutexAttr::with_type(MutexType::Recursive))?);
    for _ in 0..DEPTH {
        m.lock()?;
    }
    let remote = Arc::clone(&m);
    let foreign = join_host(std::thread::spawn(move || remote.unlock()))?;
    expect_err(
        foreign,
        SyncError::WrongState(StateViolation::NotOwner),
        "non-owner unlock",
    )?;
    for i in 1..DEPTH {
        m.unlock()?;
        check(
            matches!(m.owner()?, MutexOwner::Thread(_)),
            format!("released after {i} of {DEPTH} unlocks"),
        )?;
    }
    m.unlock()?;
    check(m.owner()? == MutexOwner::Unlocked, "still held after final unlock")?;
    m.destroy()?;
    Ok(json!({ "depth": DEPTH }))
}

fn errorcheck_trylock_handoff() -> Result<Value, Failure> {
    let m = Arc::new(PthreadMutex::new(&MutexAttr::with_type(MutexType::ErrorCheck))?);
    m.lock()?;
    let tried = Arc::new(AtomicBool::new(false));
    let (remote, flag) = (Arc::clone(&m), Arc::clone(&tried));
    let b = std::thread::spawn(move || -> Result<bool, SyncError> {
        let busy = remote.try_lock() == Err(SyncError::Busy);
        flag.store(true, Ordering::SeqCst);
        remote.lock()?;
        let owned = remote.owner()? == MutexOwner::Thread(thread::self_id());
        remote.unlock()?;
        Ok(busy && owned)
    });
    while !tried.load(Ordering::SeqCst) {
        std::thread::yield_now();
    }
    m.unlock()?;
    check(join_host(b)??, "B saw no Busy, or did not own after A unlocked")?;
    m.destroy()?;
    Ok(json!({}))
}

// ---------------------------------------------------------------------------
// Condition variables
// ---------------------------------------------------------------------------

struct Monitor {
    m: PthreadMutex,
    cv: PthreadCond,
    flag: AtomicU32,
}

impl Monitor {
    fn new() -> Result<Arc<Self>, SyncError> {
        Ok(Arc::new(Self {
            m: PthreadMutex::new(&MutexAttr::new())?,
            cv: PthreadCond::new(&CondAttr::new())?,
            flag: AtomicU32::new(0),
        }))
    }

    fn destroy(&self) -> Result<(), SyncError> {
        self.cv.destroy()?;
        self.m.destroy()
    }
}

fn cond_no_lost_wakeup() -> Result<Value, Failure> {
    const ROUNDS: u32 = 50;
    let mon = Monitor::new()?;
    for _ in 0..ROUNDS {
        mon.flag.store(0, Ordering::SeqCst);
        let remote = Arc::clone(&mon);
        let waiter = std::thread::spawn(move || -> Result<(), SyncError> {
            remote.m.lock()?;
            remote.flag.store(1, Ordering::SeqCst);
            let r = remote
                .cv
                .timed_wait(&remote.m, Instant::now() + Duration::from_secs(5));
            remote.m.unlock()?;
            r
        });
        // Registration happens before the waiter releases the mutex, so once
        // we hold it with the flag set the waiter is registered.
        loop {
            mon.m.lock()?;
            if mon.flag.load(Ordering::SeqCst) == 1 {
                break;
            }
            mon.m.unlock()?;
            std::thread::yield_now();
        }
        mon.cv.signal()?;
        mon.m.unlock()?;
        join_host(waiter)??;
    }
    mon.destroy()?;
    Ok(json!({ "rounds": ROUNDS }))
}

fn cond_broadcast_two_waiters() -> Result<Value, Failure> {
    let mon = Monitor::new()?;
    let seen = Arc::new(AtomicU32::new(0));
    let waiters: Vec<_> = (0..2)
        .map(|_| {
            let (mon, seen) = (Arc::clone(&mon), Arc::clone(&seen));
            std::thread::spawn(move || -> Result<(), SyncError> {
                mon.m.lock()?;
                while mon.flag.load(Ordering::SeqCst) == 0 {
                    mon.cv.wait(&mon.m)?;
                }
                seen.fetch_add(mon.flag.load(Ordering::SeqCst), Ordering::SeqCst);
                mon.m.unlock()
            })
        })
        .collect();
    while mon.cv.waiting()? < 2 {
        std::thread::yield_now();
    }
    mon.m.lock()?;
    mon.flag.store(7, Ordering::SeqCst);
    mon.cv.broadcast()?;
    mon.m.unlock()?;
    for w in waiters {
        join_host(w)??;
    }
    let total = seen.load(Ordering::SeqCst);
    check(total == 14, format!("waiters observed {total}, expected 14"))?;
    mon.destroy()?;
    Ok(json!({ "observed": total }))
}

// ---------------------------------------------------------------------------
// Timeouts
// ---------------------------------------------------------------------------

fn soon() -> Instant {
    Instant::now() + Duration::from_millis(15)
}

fn timeout_purity() -> Result<Value, Failure> {
    // Mutex: a timed-out locker leaves no trace in the waiter count.
    let m = Arc::new(PthreadMutex::new(&MutexAttr::new())?);
    m.lock()?;
    let remote = Arc::clone(&m);
    let timed = join_host(std::thread::spawn(move || remote.timed_lock(soon())))?;
    expect_err(timed, SyncError::Timeout, "mutex timed_lock")?;
    m.unlock()?;
    m.try_lock()?;
    m.unlock()?;

    // Condition variable: the waiter leaves and holds the mutex again.
    let cv = PthreadCond::new(&CondAttr::new())?;
    m.lock()?;
    expect_err(cv.timed_wait(&m, soon()), SyncError::Timeout, "cond timed_wait")?;
    check(cv.waiting()? == 0, "cond waiter left registered")?;
    m.unlock()?;

    // Semaphore: value unchanged.
    let sem = Semaphore::new(0, 0)?;
    expect_err(sem.timed_wait(soon()), SyncError::Timeout, "sem timed_wait")?;
    check(sem.value()? == 0, "semaphore value changed")?;

    // Rwlock: a timed-out writer does not keep readers out.
    let rw = Arc::new(PthreadRwLock::new(&RwLockAttr::new())?);
    rw.read_lock()?;
    let remote = Arc::clone(&rw);
    let timed = join_host(std::thread::spawn(move || remote.timed_write_lock(soon())))?;
    expect_err(timed, SyncError::Timeout, "rwlock timed_write_lock")?;
    let remote = Arc::clone(&rw);
    join_host(std::thread::spawn(move || -> Result<(), SyncError> {
        remote.try_read_lock()?;
        remote.unlock()
    }))??;
    rw.unlock()?;

    // Join: the target stays joinable.
    let gate = Arc::new(Semaphore::new(0, 0)?);
    let remote = Arc::clone(&gate);
    let t = thread::create(&ThreadAttr::default(), move || {
        let _ = remote.wait();
        3
    })?;
    expect_err(thread::timed_join(t, soon()), SyncError::Timeout, "timed_join")?;
    gate.post()?;
    check(thread::join(t)? == 3, "join after timeout returned wrong value")?;

    cv.destroy()?;
    m.destroy()?;
    sem.destroy()?;
    rw.destroy()?;
    Ok(json!({ "checked": ["mutex", "cond", "semaphore", "rwlock", "join"] }))
}

// ---------------------------------------------------------------------------
// Rwlock
// ---------------------------------------------------------------------------

fn rwlock_writer_admission() -> Result<Value, Failure> {
    const READERS: usize = 4;
    const BOUND: usize = 64;
    let lock = Arc::new(PthreadRwLock::new(&RwLockAttr::new())?);
    let acquisitions = Arc::new(AtomicUsize::new(0));
    let stop = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let (lock, acquisitions, stop) =
                (Arc::clone(&lock), Arc::clone(&acquisitions), Arc::clone(&stop));
            std::thread::spawn(move || -> Result<(), SyncError> {
                while !stop.load(Ordering::SeqCst) {
                    lock.read_lock()?;
                    acquisitions.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_micros(200));
                    lock.unlock()?;
                }
                Ok(())
            })
        })
        .collect();
    while acquisitions.load(Ordering::SeqCst) < READERS {
        std::thread::yield_now();
    }
    let requested_at = acquisitions.load(Ordering::SeqCst);
    let admitted = lock.timed_write_lock(Instant::now() + Duration::from_secs(5));
    let admitted_at = acquisitions.load(Ordering::SeqCst);
    let admitted = admitted.map(|()| lock.unlock());
    stop.store(true, Ordering::SeqCst);
    for r in readers {
        join_host(r)??;
    }
    admitted??;
    let during = admitted_at - requested_at;
    check(
        during <= BOUND,
        format!("{during} reader acquisitions while the writer waited (bound {BOUND})"),
    )?;
    lock.destroy()?;
    Ok(json!({ "readers": READERS, "acquisitions_while_waiting": during, "bound": BOUND }))
}

// ---------------------------------------------------------------------------
// Semaphores
// ---------------------------------------------------------------------------

fn semaphore_conservation() -> Result<Value, Failure> {
    const INITIAL: u32 = 5;
    const POSTS: u32 = 64;
    const WAITS: u32 = 20;
    let sem = Arc::new(Semaphore::new(0, INITIAL)?);
    let workers: Vec<_> = (0..4)
        .map(|i| {
            let sem = Arc::clone(&sem);
            std::thread::spawn(move || -> Result<(), SyncError> {
                for _ in 0..POSTS / 4 {
                    sem.post()?;
                }
                for _ in 0..WAITS / 4 {
                    if i % 2 == 0 {
                        sem.wait()?;
                    } else {
                        sem.timed_wait(Instant::now() + Duration::from_secs(5))?;
                    }
                }
                Ok(())
            })
        })
        .collect();
    for w in workers {
        join_host(w)??;
    }
    let value = sem.value()?;
    let expected = (INITIAL + POSTS - WAITS) as i32;
    check(value == expected, format!("value {value}, expected {expected}"))?;
    sem.destroy()?;
    Ok(json!({ "initial": INITIAL, "posts": POSTS, "waits": WAITS, "value": value }))
}

fn named_semaphore_identity() -> Result<Value, Failure> {
    let name = format!("/harness-{}", std::process::id());
    let first = Semaphore::open(&name, OpenFlags::CREATE_EXCLUSIVE, 0o600, 1)?;
    expect_err(
        Semaphore::open(&name, OpenFlags::CREATE_EXCLUSIVE, 0o600, 1).map(|_| ()),
        SyncError::Exists,
        "exclusive create of existing name",
    )?;
    let identity = first.identity();
    let again = Semaphore::open_identity(identity)?;
    again.post()?;
    check(first.value()? == 2, "reopened semaphore is a different instance")?;
    Semaphore::unlink(&name)?;
    expect_err(
        Semaphore::open(&name, OpenFlags::OPEN, 0, 0).map(|_| ()),
        SyncError::NotFound,
        "open after unlink",
    )?;
    // Still usable by existing openers until closed.
    first.try_wait()?;
    again.close()?;
    first.close()?;
    Ok(json!({ "hash": identity.hash, "luid": identity.luid }))
}

// ---------------------------------------------------------------------------
// Threads and fork
// ---------------------------------------------------------------------------

fn thread_cancel_cleanup() -> Result<Value, Failure> {
    let cleaned = Arc::new(AtomicUsize::new(0));
    let sem = Arc::new(Semaphore::new(0, 0)?);
    let (remote_sem, remote_cleaned) = (Arc::clone(&sem), Arc::clone(&cleaned));
    let t = thread::create(&ThreadAttr::default(), move || {
        for order in 1..=2 {
            let cleaned = Arc::clone(&remote_cleaned);
            // Records the LIFO order as digits: 2 then 1 gives 21.
            let _ = push_cleanup(move || {
                let prev = cleaned.load(Ordering::SeqCst);
                cleaned.store(prev * 10 + order, Ordering::SeqCst);
            });
        }
        let _ = remote_sem.wait();
        0
    })?;
    while sem.waiters()? == 0 {
        std::thread::yield_now();
    }
    thread::cancel(t)?;
    let value = thread::join(t)?;
    check(value == PTHREAD_CANCELED, format!("exit value {value:#x}"))?;
    let order = cleaned.load(Ordering::SeqCst);
    check(order == 21, format!("cleanup order {order}, expected 21"))?;
    sem.destroy()?;
    Ok(json!({ "cleanup_order": order }))
}

fn fork_prepare_parent() -> Result<Value, Failure> {
    let m = PthreadMutex::new(&MutexAttr::new())?;
    let sem = Semaphore::new(0, 1)?;
    let generation = fork::fork_generation();
    let snapshot = fork::prepare();
    fork::parent(snapshot);
    m.lock()?;
    m.unlock()?;
    sem.try_wait()?;
    check(
        fork::fork_generation() == generation,
        "parent side advanced the fork generation",
    )?;
    m.destroy()?;
    sem.destroy()?;
    Ok(json!({ "generation": generation }))
}
