//! Minimal mutual exclusion for library internals.
//!
//! An atomic counter plus an auto-reset event. The first locker takes the
//! counter from 0 to 1 and proceeds; later lockers wait on the event, and
//! each unlock that leaves the counter non-zero hands the event to exactly
//! one of them. There is no owner: the unlock may come from a different
//! thread than the lock, which the condition-variable protocol relies on.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::SyncResult;
use crate::host::WaitHandle;

pub(crate) struct InternalMutex {
    lock_counter: AtomicU32,
    event: WaitHandle,
}

impl InternalMutex {
    pub(crate) fn new() -> SyncResult<Self> {
        Ok(Self {
            lock_counter: AtomicU32::new(0),
            event: WaitHandle::auto_event()?,
        })
    }

    pub(crate) fn lock(&self) {
        if self.lock_counter.fetch_add(1, Ordering::AcqRel) != 0 {
            self.event.wait(None);
        }
    }

    pub(crate) fn try_lock(&self) -> bool {
        self.lock_counter
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub(crate) fn unlock(&self) {
        if self.lock_counter.fetch_sub(1, Ordering::AcqRel) != 1 {
            self.event.set();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_locked(&self) -> bool {
        self.lock_counter.load(Ordering::Acquire) != 0
    }

    /// Fork child: back to unlocked with a fresh event.
    pub(crate) fn reset_after_fork(&self) -> bool {
        self.lock_counter.store(0, Ordering::Release);
        self.event.rebuild_after_fork(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn try_lock_fails_while_held() {
        let m = InternalMutex::new().unwrap();
        assert!(m.try_lock());
        assert!(!m.try_lock());
        m.unlock();
        assert!(m.try_lock());
        m.unlock();
        assert!(!m.is_locked());
    }

    #[test]
    fn excludes_concurrent_increments() {
        let m = Arc::new(InternalMutex::new().unwrap());
        let shared = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = Arc::clone(&m);
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        m.lock();
                        // Non-atomic read-modify-write under the lock.
                        let v = shared.load(Ordering::Relaxed);
                        shared.store(v + 1, Ordering::Relaxed);
                        m.unlock();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(shared.load(Ordering::Relaxed), 4000);
    }

    #[test]
    fn unlock_from_another_thread_releases_waiter() {
        let m = Arc::new(InternalMutex::new().unwrap());
        m.lock();
        let remote = Arc::clone(&m);
        let unlocker = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(20));
            remote.unlock();
        });
        m.lock();
        m.unlock();
        unlocker.join().unwrap();
    }

    #[test]
    fn reset_after_fork_unlocks() {
        let m = InternalMutex::new().unwrap();
        m.lock();
        assert!(m.reset_after_fork());
        assert!(m.try_lock());
    }
}
