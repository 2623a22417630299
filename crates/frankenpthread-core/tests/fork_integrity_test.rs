//! Real process duplication. Lives in its own binary so no other test thread
//! holds library state while the child is created.

#![cfg(unix)]
#![allow(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use frankenpthread_core::pthread::fork::{self, ForkOutcome, ForkReport};
use frankenpthread_core::pthread::semaphore::OpenFlags;
use frankenpthread_core::pthread::thread;
use frankenpthread_core::pthread::{
    CondAttr, MutexAttr, ObjectKind, PthreadCond, PthreadMutex, Semaphore, SyncObject, ThreadAttr,
    live_objects, register_atfork,
};

static CHILD_CALLBACKS: AtomicUsize = AtomicUsize::new(0);

fn handle_ids() -> HashMap<u64, u64> {
    live_objects()
        .into_iter()
        .filter_map(|object| match object {
            SyncObject::Mutex(r) => Some((r.header().id(), r.handle_id())),
            SyncObject::Cond(r) => Some((r.header().id(), r.handle_id())),
            SyncObject::Semaphore(r) => Some((r.header().id(), r.handle_id())),
            _ => None,
        })
        .collect()
}

struct Fixture {
    held: PthreadMutex,
    cond: PthreadCond,
    sem: Arc<Semaphore>,
}

/// Runs in the child. Returns a distinct code per failed check.
fn check_child(report: &ForkReport, fixture: &Fixture, before: &HashMap<u64, u64>) -> i32 {
    if CHILD_CALLBACKS.load(Ordering::SeqCst) != 1 {
        return 10;
    }
    if report.discarded(ObjectKind::Thread) == 0 || report.generation != fork::fork_generation() {
        return 11;
    }
    // Every surviving instance has a fresh handle and nobody waiting.
    for object in live_objects() {
        let (id, handle, waiters) = match &object {
            SyncObject::Mutex(r) => (r.header().id(), r.handle_id(), r.waiters() as usize),
            SyncObject::Cond(r) => (r.header().id(), r.handle_id(), r.waiting() as usize),
            SyncObject::Semaphore(r) => (r.header().id(), r.handle_id(), r.waiters()),
            _ => continue,
        };
        if waiters != 0 {
            return 12;
        }
        if before.get(&id) == Some(&handle) {
            return 13;
        }
    }
    // The forking thread still owns what it held.
    if fixture.held.unlock().is_err() || fixture.held.try_lock().is_err() {
        return 14;
    }
    let _ = fixture.held.unlock();
    // Semaphore value survives; the blocked waiter does not.
    if fixture.sem.value() != Ok(0) {
        return 15;
    }
    if fixture.cond.signal().is_err() || fixture.cond.waiting() != Ok(0) {
        return 16;
    }
    match Semaphore::open("/fork-integrity", OpenFlags::OPEN, 0, 0) {
        Ok(named) if named.value() == Ok(3) => {
            let _ = named.close();
        }
        _ => return 17,
    }
    // New threads work in the child.
    let Ok(t) = thread::create(&ThreadAttr::default(), || 41) else {
        return 18;
    };
    if thread::join(t) != Ok(41) {
        return 19;
    }
    0
}

#[test]
fn fork_child_repairs_every_primitive() {
    register_atfork(
        None,
        None,
        Some(Arc::new(|| {
            CHILD_CALLBACKS.fetch_add(1, Ordering::SeqCst);
        })),
    );

    let fixture = Fixture {
        held: PthreadMutex::new(&MutexAttr::new()).unwrap(),
        cond: PthreadCond::new(&CondAttr::new()).unwrap(),
        sem: Arc::new(Semaphore::new(0, 0).unwrap()),
    };
    fixture.held.lock().unwrap();
    let named = Semaphore::open("/fork-integrity", OpenFlags::CREATE, 0o600, 3).unwrap();

    let sem = Arc::clone(&fixture.sem);
    let blocked = thread::create(&ThreadAttr::default(), move || {
        sem.wait().unwrap();
        9
    })
    .unwrap();
    while fixture.sem.waiters().unwrap() == 0 {
        std::thread::yield_now();
    }

    let before = handle_ids();
    match fork::fork().unwrap() {
        ForkOutcome::Child(report) => {
            let code = check_child(&report, &fixture, &before);
            // SAFETY: terminates the child without running the parent's
            // test harness teardown.
            unsafe { libc::_exit(code) };
        }
        ForkOutcome::Parent { child_pid } => {
            let mut status = 0;
            // SAFETY: `child_pid` is our child and `status` is a valid out
            // pointer.
            let waited = unsafe { libc::waitpid(child_pid, &mut status, 0) };
            assert_eq!(waited, child_pid);
            assert!(libc::WIFEXITED(status));
            assert_eq!(libc::WEXITSTATUS(status), 0, "child check failed");

            // The parent is untouched: the waiter is still blocked.
            assert_eq!(CHILD_CALLBACKS.load(Ordering::SeqCst), 0);
            fixture.sem.post().unwrap();
            assert_eq!(thread::join(blocked), Ok(9));
            fixture.held.unlock().unwrap();
            named.close().unwrap();
            Semaphore::unlink("/fork-integrity").unwrap();
        }
    }
}
