//! One-time initialization.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::SyncResult;

use super::mutex::PthreadMutex;

/// Runs an initializer exactly once across all threads.
///
/// Callers racing the first call block until it finishes. If the initializer
/// unwinds (a panic, or cancellation of the calling thread), the lock is
/// released and a later call runs it again.
pub struct PthreadOnce {
    done: AtomicBool,
    mutex: PthreadMutex,
}

/// Releases the once lock, including on unwind.
struct Unlock<'a>(&'a PthreadMutex);

impl Drop for Unlock<'_> {
    fn drop(&mut self) {
        let _ = self.0.unlock();
    }
}

impl PthreadOnce {
    #[allow(clippy::declare_interior_mutable_const)]
    pub const INIT: Self = Self {
        done: AtomicBool::new(false),
        mutex: PthreadMutex::INITIALIZER,
    };

    pub fn call(&self, init: impl FnOnce()) -> SyncResult<()> {
        if self.done.load(Ordering::Acquire) {
            return Ok(());
        }
        self.mutex.lock()?;
        let _unlock = Unlock(&self.mutex);
        if !self.done.load(Ordering::Acquire) {
            init();
            self.done.store(true, Ordering::Release);
        }
        Ok(())
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}
