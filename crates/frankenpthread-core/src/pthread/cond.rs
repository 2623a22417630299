//! Condition variables.
//!
//! Waiters block on a counting semaphore. Two internal mutexes split the
//! protocol: `mtx_in` admits new waiters, `mtx_out` serializes signalers with
//! waiters leaving. A signal moves up to `waiting - pending` waiters into the
//! pending set and releases that many units. The first signal of a release
//! cycle also takes `mtx_in` and the last released waiter drops it, so a
//! thread that starts waiting after a signal cannot consume a unit meant for
//! a thread that was already waiting.
//!
//! A waiter registers (under `mtx_in`) before it releases the caller's mutex,
//! so a signal issued under that mutex after the waiter entered always finds
//! it counted.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use crate::error::{SyncError, SyncResult};
use crate::host::WaitHandle;
use crate::metrics::{SyncMetrics, global_metrics};

use super::attr::CondAttr;
use super::cancel::{CancelAction, WaitOutcome, cancelable_wait, honor_cancel};
use super::internal_mutex::InternalMutex;
use super::mutex::{MutexRecord, PthreadMutex};
use super::object::{ObjectHeader, ObjectKind, ObjectSlot, STATIC_DEFAULT, SyncRecord, Validity};
use super::registry::{Registry, RegistryKey};

pub struct CondRecord {
    header: ObjectHeader,
    waiting: AtomicU32,
    pending: AtomicU32,
    mtx_in: InternalMutex,
    mtx_out: InternalMutex,
    sem: WaitHandle,
    /// Object id of the mutex the current waiters use; 0 when idle.
    bound_mutex: AtomicU64,
}

static CONDS: OnceLock<Registry<CondRecord>> = OnceLock::new();

pub(crate) fn conds() -> &'static Registry<CondRecord> {
    CONDS.get_or_init(|| Registry::new(ObjectKind::Cond))
}

impl CondRecord {
    fn build() -> SyncResult<Self> {
        Ok(Self {
            header: ObjectHeader::new(ObjectKind::Cond),
            waiting: AtomicU32::new(0),
            pending: AtomicU32::new(0),
            mtx_in: InternalMutex::new()?,
            mtx_out: InternalMutex::new()?,
            sem: WaitHandle::semaphore(0, u32::MAX)?,
            bound_mutex: AtomicU64::new(0),
        })
    }

    /// Unregistered condition variable owned by another primitive.
    pub(crate) fn private() -> SyncResult<Self> {
        Self::build()
    }

    fn create() -> SyncResult<Arc<Self>> {
        let (key, record) = conds().insert_with(|_| Ok(Arc::new(Self::build()?)))?;
        record.header.set_registry_key(key.to_raw());
        Ok(record)
    }

    #[must_use]
    pub fn header(&self) -> &ObjectHeader {
        &self.header
    }

    /// Threads registered as waiting.
    #[must_use]
    pub fn waiting(&self) -> u32 {
        self.waiting.load(Ordering::Acquire)
    }

    /// Waiters released but not yet returned.
    #[must_use]
    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn handle_id(&self) -> u64 {
        self.sem.handle_id()
    }

    /// Release `mutex`, wait for a signal or `deadline`, reacquire `mutex`.
    pub(crate) fn wait(&self, mutex: &MutexRecord, deadline: Option<Instant>) -> SyncResult<()> {
        match self.wait_or_canceled(mutex, deadline)? {
            WaitOutcome::Canceled => Err(honor_cancel()),
            _ => Ok(()),
        }
    }

    /// [`wait`](Self::wait) that reports a cancellation request as
    /// [`WaitOutcome::Canceled`] instead of acting on it. `mutex` is held
    /// again either way.
    pub(crate) fn wait_or_canceled(
        &self,
        mutex: &MutexRecord,
        deadline: Option<Instant>,
    ) -> SyncResult<WaitOutcome> {
        self.header.ensure_live()?;
        mutex.check_wait_owner()?;
        let mutex_id = mutex.header().id();

        self.mtx_in.lock();
        if self.waiting.load(Ordering::Acquire) == 0 {
            self.bound_mutex.store(mutex_id, Ordering::Release);
        } else if self.bound_mutex.load(Ordering::Acquire) != mutex_id {
            self.mtx_in.unlock();
            return Err(SyncError::InvalidArgument(
                "condition variable used with two mutexes",
            ));
        }
        self.waiting.fetch_add(1, Ordering::AcqRel);
        self.mtx_in.unlock();

        SyncMetrics::inc(&global_metrics().cond_waits);
        mutex.enter_cond_wait();

        let outcome = cancelable_wait(&self.sem, deadline, CancelAction::NoCancelSelf);

        self.mtx_out.lock();
        // A release may have landed after the timeout or cancellation.
        let signaled = outcome == WaitOutcome::Signaled || self.sem.try_acquire();
        self.waiting.fetch_sub(1, Ordering::AcqRel);
        if signaled && self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.mtx_in.unlock();
        }
        self.mtx_out.unlock();

        mutex.leave_cond_wait()?;

        match outcome {
            _ if signaled => Ok(WaitOutcome::Signaled),
            WaitOutcome::Canceled => Ok(WaitOutcome::Canceled),
            _ => {
                SyncMetrics::inc(&global_metrics().timeouts);
                Err(SyncError::Timeout)
            }
        }
    }

    /// Release one waiter, or every waiter with `all`.
    pub(crate) fn unblock(&self, all: bool) -> SyncResult<()> {
        self.header.ensure_live()?;
        self.mtx_out.lock();
        let mut pending = self.pending.load(Ordering::Acquire);
        let mut releaseable = self.waiting.load(Ordering::Acquire).saturating_sub(pending);
        let mut result = Ok(());
        if releaseable > 0 {
            if pending == 0 {
                // Close the entrance for this release cycle.
                self.mtx_in.lock();
                pending = self.pending.load(Ordering::Acquire);
                releaseable = self.waiting.load(Ordering::Acquire).saturating_sub(pending);
            }
            let released = if all { releaseable } else { 1 };
            self.pending.fetch_add(released, Ordering::AcqRel);
            result = self.sem.release(released);
            if result.is_err() {
                if self.pending.fetch_sub(released, Ordering::AcqRel) == released {
                    self.mtx_in.unlock();
                }
            } else {
                SyncMetrics::add(&global_metrics().cond_releases, u64::from(released));
            }
        }
        self.mtx_out.unlock();
        result
    }

    fn teardown(&self) -> SyncResult<()> {
        self.header.ensure_live()?;
        if self.waiting.load(Ordering::Acquire) > 0 {
            return Err(SyncError::Busy);
        }
        if !self.header.mark_destroyed() {
            return Err(SyncError::InvalidObject(ObjectKind::Cond));
        }
        if let Some(key) = RegistryKey::from_raw(self.header.registry_key()) {
            conds().remove(key);
        }
        Ok(())
    }

    /// Fork child: no waiters, fresh semaphore, both entrances open.
    pub(crate) fn fixup_after_fork(&self) -> bool {
        if !self.sem.rebuild_after_fork(false)
            || !self.mtx_in.reset_after_fork()
            || !self.mtx_out.reset_after_fork()
        {
            return false;
        }
        self.waiting.store(0, Ordering::Release);
        self.pending.store(0, Ordering::Release);
        self.bound_mutex.store(0, Ordering::Release);
        true
    }
}

impl SyncRecord for CondRecord {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn materialize(_flavor: u8) -> SyncResult<Arc<Self>> {
        Self::create()
    }
}

/// A POSIX condition variable.
pub struct PthreadCond {
    slot: ObjectSlot<CondRecord>,
}

impl PthreadCond {
    #[allow(clippy::declare_interior_mutable_const)]
    pub const INITIALIZER: Self = Self {
        slot: ObjectSlot::new_static(ObjectKind::Cond, STATIC_DEFAULT),
    };

    /// Attributes only admit process-private, which is all this supports.
    pub fn new(_attr: &CondAttr) -> SyncResult<Self> {
        Ok(Self {
            slot: ObjectSlot::new_live(ObjectKind::Cond, CondRecord::create()?),
        })
    }

    pub fn init(&self, _attr: &CondAttr) -> SyncResult<()> {
        self.slot.install(CondRecord::create)
    }

    /// Atomically release `mutex` and wait for a signal. A cancellation
    /// point; `mutex` is held again on every return.
    pub fn wait(&self, mutex: &PthreadMutex) -> SyncResult<()> {
        let record = self.slot.resolve()?;
        record.wait(&*mutex.record()?, None)
    }

    /// [`wait`](Self::wait) until an absolute deadline.
    pub fn timed_wait(&self, mutex: &PthreadMutex, deadline: Instant) -> SyncResult<()> {
        let record = self.slot.resolve()?;
        record.wait(&*mutex.record()?, Some(deadline))
    }

    pub fn signal(&self) -> SyncResult<()> {
        self.slot.resolve()?.unblock(false)
    }

    pub fn broadcast(&self) -> SyncResult<()> {
        self.slot.resolve()?.unblock(true)
    }

    pub fn destroy(&self) -> SyncResult<()> {
        self.slot.retire(|record| record.teardown())
    }

    #[must_use]
    pub fn validity(&self) -> Validity {
        self.slot.validity()
    }

    pub fn waiting(&self) -> SyncResult<u32> {
        Ok(self.slot.resolve()?.waiting())
    }
}
