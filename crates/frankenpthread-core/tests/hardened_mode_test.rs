//! Ownership checks under hardened mode. Runs in its own binary because the
//! mode is process-wide.

use std::sync::{Arc, Mutex};

use frankenpthread_core::config::{SyncMode, set_sync_mode, sync_mode};
use frankenpthread_core::pthread::{CondAttr, MutexAttr, PthreadCond, PthreadMutex};
use frankenpthread_core::{StateViolation, SyncError};

static TEST_GUARD: Mutex<()> = Mutex::new(());

#[test]
fn hardened_mode_checks_default_mutex_ownership() {
    let _guard = TEST_GUARD.lock().unwrap();
    let previous = set_sync_mode(SyncMode::Hardened);
    assert_eq!(sync_mode(), SyncMode::Hardened);

    let m = Arc::new(PthreadMutex::new(&MutexAttr::new()).unwrap());
    m.lock().unwrap();
    let remote = Arc::clone(&m);
    let foreign_unlock = std::thread::spawn(move || remote.unlock()).join().unwrap();
    assert_eq!(
        foreign_unlock,
        Err(SyncError::WrongState(StateViolation::NotOwner))
    );

    // A condition wait needs the mutex held by the waiter.
    let cv = Arc::new(PthreadCond::new(&CondAttr::new()).unwrap());
    let (rm, rcv) = (Arc::clone(&m), Arc::clone(&cv));
    let foreign_wait = std::thread::spawn(move || rcv.wait(&rm)).join().unwrap();
    assert_eq!(
        foreign_wait,
        Err(SyncError::WrongState(StateViolation::NotOwner))
    );
    assert_eq!(cv.waiting().unwrap(), 0);

    m.unlock().unwrap();
    cv.destroy().unwrap();
    m.destroy().unwrap();

    set_sync_mode(previous);
}

#[test]
fn strict_mode_lets_any_thread_release_a_default_mutex() {
    let _guard = TEST_GUARD.lock().unwrap();
    let previous = set_sync_mode(SyncMode::Strict);
    let m = Arc::new(PthreadMutex::new(&MutexAttr::new()).unwrap());
    m.lock().unwrap();
    let remote = Arc::clone(&m);
    assert_eq!(std::thread::spawn(move || remote.unlock()).join().unwrap(), Ok(()));
    m.try_lock().unwrap();
    m.unlock().unwrap();
    m.destroy().unwrap();
    set_sync_mode(previous);
}
