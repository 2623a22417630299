//! POSIX mutex operations.
//!
//! Implements pthread mutex constants, attribute support checks, and the
//! mutex itself.
//!
//! ## Lock protocol
//!
//! `lock_counter` counts the holder plus every thread that has announced
//! itself as a waiter. An uncontended lock is one atomic increment from 0;
//! an uncontended unlock is one compare-exchange back to 0. When the counter
//! shows waiters, unlock hands the lock over through an auto-reset event,
//! waking exactly one waiter.
//!
//! A waiter that gives up (deadline or cancellation) must take itself back
//! out of the count. That withdrawal and the contended unlock path serialize
//! on a small internal mutex: if a hand-off already landed for the leaving
//! waiter it keeps the lock instead, so no hand-off is ever stranded.
//!
//! Spinlocks share this record with a different lock discipline: the counter
//! is a plain flag and contention spins with a yield.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use crate::config::sync_mode;
use crate::error::{StateViolation, SyncError, SyncResult};
use crate::host::WaitHandle;
use crate::metrics::{SyncMetrics, global_metrics};

use super::attr::{MutexAttr, PTHREAD_PROCESS_SHARED};
use super::cancel::{CancelAction, WaitOutcome, cancelable_wait, honor_cancel};
use super::internal_mutex::InternalMutex;
use super::object::{
    ObjectHeader, ObjectKind, ObjectSlot, STATIC_DEFAULT, STATIC_ERRORCHECK, STATIC_RECURSIVE,
    SyncRecord, Validity,
};
use super::registry::{Registry, RegistryKey};
use super::thread::{Pthread, current_owner_id};

// ---------------------------------------------------------------------------
// Mutex type constants
// ---------------------------------------------------------------------------

/// Normal (default) mutex: no error checking, no recursive locking.
pub const PTHREAD_MUTEX_NORMAL: i32 = 0;
/// Recursive mutex: the owning thread can re-lock without deadlock.
pub const PTHREAD_MUTEX_RECURSIVE: i32 = 1;
/// Error-checking mutex: relock by the owner reports a deadlock.
pub const PTHREAD_MUTEX_ERRORCHECK: i32 = 2;
/// Default mutex type (alias for NORMAL).
pub const PTHREAD_MUTEX_DEFAULT: i32 = PTHREAD_MUTEX_NORMAL;

/// Typed form of the `PTHREAD_MUTEX_*` constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MutexType {
    #[default]
    Normal,
    Recursive,
    ErrorCheck,
}

impl MutexType {
    pub fn from_raw(raw: i32) -> SyncResult<Self> {
        match raw {
            PTHREAD_MUTEX_NORMAL => Ok(Self::Normal),
            PTHREAD_MUTEX_RECURSIVE => Ok(Self::Recursive),
            PTHREAD_MUTEX_ERRORCHECK => Ok(Self::ErrorCheck),
            _ => Err(SyncError::InvalidArgument("mutex type")),
        }
    }

    #[must_use]
    pub const fn as_raw(self) -> i32 {
        match self {
            Self::Normal => PTHREAD_MUTEX_NORMAL,
            Self::Recursive => PTHREAD_MUTEX_RECURSIVE,
            Self::ErrorCheck => PTHREAD_MUTEX_ERRORCHECK,
        }
    }

    const fn from_static_flavor(flavor: u8) -> Self {
        match flavor {
            STATIC_RECURSIVE => Self::Recursive,
            STATIC_ERRORCHECK => Self::ErrorCheck,
            _ => Self::Normal,
        }
    }
}

// ---------------------------------------------------------------------------
// Attribute support
// ---------------------------------------------------------------------------

/// Attribute features checked at initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MutexAttributeContract {
    /// `PTHREAD_PROCESS_SHARED`.
    pub process_shared: bool,
    /// Robust mutex mode.
    pub robust: bool,
    /// Priority inheritance protocol.
    pub priority_inherit: bool,
    /// Priority protection protocol.
    pub priority_protect: bool,
}

/// Returns true when the attribute profile can be honored in-process.
#[must_use]
pub const fn mutex_attr_is_supported(attrs: MutexAttributeContract) -> bool {
    !(attrs.process_shared || attrs.robust || attrs.priority_inherit || attrs.priority_protect)
}

pub const fn mutex_attr_support_error(attrs: MutexAttributeContract) -> SyncResult<()> {
    if mutex_attr_is_supported(attrs) {
        Ok(())
    } else {
        Err(SyncError::InvalidArgument("unsupported mutex attributes"))
    }
}

// ---------------------------------------------------------------------------
// Owner encoding
// ---------------------------------------------------------------------------

pub(crate) const OWNER_UNLOCKED: u64 = 0;
pub(crate) const OWNER_NEW: u64 = u64::MAX;
pub(crate) const OWNER_DESTROYED: u64 = u64::MAX - 1;
/// Owner id used when the locking thread has no identity (thread teardown).
pub(crate) const OWNER_ANONYMOUS: u64 = u64::MAX - 2;

/// Who holds a mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexOwner {
    /// Never locked since initialization.
    New,
    Unlocked,
    Destroyed,
    /// Held by a thread with no identity.
    Anonymous,
    Thread(Pthread),
}

impl MutexOwner {
    fn decode(raw: u64) -> Self {
        match raw {
            OWNER_UNLOCKED => Self::Unlocked,
            OWNER_NEW => Self::New,
            OWNER_DESTROYED => Self::Destroyed,
            OWNER_ANONYMOUS => Self::Anonymous,
            id => Self::Thread(Pthread::from_raw(id)),
        }
    }
}

const fn is_held(raw: u64) -> bool {
    !matches!(raw, OWNER_UNLOCKED | OWNER_NEW | OWNER_DESTROYED)
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Discipline {
    Blocking,
    Spin,
}

/// Backing record of a mutex or spinlock.
pub struct MutexRecord {
    header: ObjectHeader,
    discipline: Discipline,
    kind: AtomicI32,
    shared: bool,
    lock_counter: AtomicU32,
    owner: AtomicU64,
    recursion: AtomicU32,
    condwaits: AtomicU32,
    event: WaitHandle,
    handoff: InternalMutex,
}

static MUTEXES: OnceLock<Registry<MutexRecord>> = OnceLock::new();

/// Registry of every mutex and spinlock.
pub(crate) fn mutexes() -> &'static Registry<MutexRecord> {
    MUTEXES.get_or_init(|| Registry::new(ObjectKind::Mutex))
}

impl MutexRecord {
    fn build(discipline: Discipline, kind: MutexType, shared: bool) -> SyncResult<Self> {
        let object_kind = match discipline {
            Discipline::Blocking => ObjectKind::Mutex,
            Discipline::Spin => ObjectKind::Spinlock,
        };
        Ok(Self {
            header: ObjectHeader::new(object_kind),
            discipline,
            kind: AtomicI32::new(kind.as_raw()),
            shared,
            lock_counter: AtomicU32::new(0),
            owner: AtomicU64::new(OWNER_NEW),
            recursion: AtomicU32::new(0),
            condwaits: AtomicU32::new(0),
            event: WaitHandle::auto_event()?,
            handoff: InternalMutex::new()?,
        })
    }

    /// Unregistered normal mutex owned by another primitive.
    pub(crate) fn private() -> SyncResult<Arc<Self>> {
        Ok(Arc::new(Self::build(Discipline::Blocking, MutexType::Normal, false)?))
    }

    fn create(discipline: Discipline, kind: MutexType, shared: bool) -> SyncResult<Arc<Self>> {
        let (key, record) = mutexes().insert_with(|_| Ok(Arc::new(Self::build(discipline, kind, shared)?)))?;
        record.header.set_registry_key(key.to_raw());
        Ok(record)
    }

    #[must_use]
    pub fn header(&self) -> &ObjectHeader {
        &self.header
    }

    #[must_use]
    pub fn mutex_type(&self) -> MutexType {
        MutexType::from_raw(self.kind.load(Ordering::Acquire)).unwrap_or_default()
    }

    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    #[must_use]
    pub fn owner(&self) -> MutexOwner {
        MutexOwner::decode(self.owner.load(Ordering::Acquire))
    }

    /// Current recursion depth; zero when not held.
    #[must_use]
    pub fn recursion(&self) -> u32 {
        self.recursion.load(Ordering::Acquire)
    }

    /// Condition waits currently parked against this mutex.
    #[must_use]
    pub fn condwaits(&self) -> u32 {
        self.condwaits.load(Ordering::Acquire)
    }

    /// Native event identity, for fork diagnostics.
    #[must_use]
    pub fn handle_id(&self) -> u64 {
        self.event.handle_id()
    }

    #[must_use]
    pub fn waiters(&self) -> u32 {
        self.lock_counter.load(Ordering::Acquire).saturating_sub(1)
    }

    fn set_owner(&self, me: u64) {
        self.owner.store(me, Ordering::Release);
        self.recursion.store(1, Ordering::Release);
    }

    fn relock_by_owner(&self, kind: MutexType, trying: bool) -> SyncResult<()> {
        match kind {
            MutexType::Recursive => {
                let depth = self.recursion.load(Ordering::Acquire);
                if depth == u32::MAX {
                    return Err(SyncError::ResourceExhausted("mutex recursion count"));
                }
                self.recursion.store(depth + 1, Ordering::Release);
                Ok(())
            }
            _ if trying => Err(SyncError::Busy),
            _ => Err(SyncError::Deadlock),
        }
    }

    /// Acquire. A contended acquisition blocks until `deadline`; with
    /// `cancelable` it is also a cancellation point.
    pub(crate) fn lock_with(&self, deadline: Option<Instant>, cancelable: bool) -> SyncResult<()> {
        self.header.ensure_live()?;
        let me = current_owner_id();
        if self.discipline == Discipline::Spin {
            return self.spin_lock(me);
        }
        let kind = self.mutex_type();
        if kind != MutexType::Normal && self.owner.load(Ordering::Acquire) == me {
            return self.relock_by_owner(kind, false);
        }
        if self.lock_counter.fetch_add(1, Ordering::AcqRel) != 0 {
            SyncMetrics::inc(&global_metrics().contended_locks);
            let action = if cancelable {
                CancelAction::NoCancelSelf
            } else {
                CancelAction::NoCancel
            };
            match cancelable_wait(&self.event, deadline, action) {
                WaitOutcome::Signaled => {}
                WaitOutcome::TimedOut => {
                    if !self.withdraw() {
                        SyncMetrics::inc(&global_metrics().timeouts);
                        return Err(SyncError::Timeout);
                    }
                }
                // A hand-off that raced the cancellation wins; the request
                // stays pending for the next cancellation point.
                WaitOutcome::Canceled => {
                    if !self.withdraw() {
                        return Err(honor_cancel());
                    }
                }
            }
        }
        self.set_owner(me);
        Ok(())
    }

    /// Leave the waiter count. Returns true if a hand-off had already
    /// arrived, in which case the caller holds the lock.
    fn withdraw(&self) -> bool {
        self.handoff.lock();
        let handed_over = self.event.try_acquire();
        if !handed_over {
            self.lock_counter.fetch_sub(1, Ordering::AcqRel);
        }
        self.handoff.unlock();
        handed_over
    }

    fn release(&self) {
        if self
            .lock_counter
            .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.handoff.lock();
        loop {
            let count = self.lock_counter.load(Ordering::Acquire);
            if count == 1 {
                if self
                    .lock_counter
                    .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    break;
                }
                continue;
            }
            // Waiters only withdraw under `handoff`, so at least one remains.
            self.lock_counter.fetch_sub(1, Ordering::AcqRel);
            self.event.set();
            break;
        }
        self.handoff.unlock();
    }

    pub(crate) fn try_lock(&self) -> SyncResult<()> {
        self.header.ensure_live()?;
        let me = current_owner_id();
        if self.discipline == Discipline::Blocking {
            let kind = self.mutex_type();
            if kind != MutexType::Normal && self.owner.load(Ordering::Acquire) == me {
                return self.relock_by_owner(kind, true);
            }
        }
        if self
            .lock_counter
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return Err(SyncError::Busy);
        }
        self.set_owner(me);
        Ok(())
    }

    pub(crate) fn unlock(&self) -> SyncResult<()> {
        self.header.ensure_live()?;
        let me = current_owner_id();
        let owner = self.owner.load(Ordering::Acquire);
        if !is_held(owner) {
            return Err(SyncError::WrongState(StateViolation::NotOwner));
        }
        if self.discipline == Discipline::Spin {
            if owner != me {
                return Err(SyncError::WrongState(StateViolation::NotOwner));
            }
            self.recursion.store(0, Ordering::Release);
            self.owner.store(OWNER_UNLOCKED, Ordering::Release);
            self.lock_counter.store(0, Ordering::Release);
            return Ok(());
        }
        let kind = self.mutex_type();
        let checked = kind != MutexType::Normal || sync_mode().checks_ownership();
        if checked && owner != me {
            return Err(SyncError::WrongState(StateViolation::NotOwner));
        }
        if kind == MutexType::Recursive {
            let depth = self.recursion.load(Ordering::Acquire);
            if depth > 1 {
                self.recursion.store(depth - 1, Ordering::Release);
                return Ok(());
            }
        }
        self.release_held();
        Ok(())
    }

    fn release_held(&self) {
        self.recursion.store(0, Ordering::Release);
        self.owner.store(OWNER_UNLOCKED, Ordering::Release);
        self.release();
    }

    /// Whether the caller may release this mutex into a condition wait.
    pub(crate) fn check_wait_owner(&self) -> SyncResult<()> {
        self.header.ensure_live()?;
        let owner = self.owner.load(Ordering::Acquire);
        if !is_held(owner) {
            return Err(SyncError::WrongState(StateViolation::NotOwner));
        }
        if self.mutex_type() == MutexType::Normal && !sync_mode().checks_ownership() {
            return Ok(());
        }
        if owner == current_owner_id() && self.recursion.load(Ordering::Acquire) == 1 {
            Ok(())
        } else {
            Err(SyncError::WrongState(StateViolation::NotOwner))
        }
    }

    /// Release for a condition wait after [`check_wait_owner`](Self::check_wait_owner).
    pub(crate) fn enter_cond_wait(&self) {
        self.condwaits.fetch_add(1, Ordering::AcqRel);
        self.release_held();
    }

    /// Reacquire after a condition wait. Not a cancellation point.
    pub(crate) fn leave_cond_wait(&self) -> SyncResult<()> {
        let relocked = self.lock_with(None, false);
        self.condwaits.fetch_sub(1, Ordering::AcqRel);
        if let Err(err) = &relocked {
            log::warn!(
                "mutex {} not reacquired after condition wait: {err}",
                self.header.id()
            );
        }
        relocked
    }

    fn spin_lock(&self, me: u64) -> SyncResult<()> {
        loop {
            if self.lock_counter.swap(1, Ordering::AcqRel) == 0 {
                self.set_owner(me);
                return Ok(());
            }
            if self.owner.load(Ordering::Acquire) == me {
                return Err(SyncError::Deadlock);
            }
            std::thread::yield_now();
        }
    }

    fn set_type(&self, kind: MutexType) -> SyncResult<()> {
        self.header.ensure_live()?;
        if is_held(self.owner.load(Ordering::Acquire)) {
            return Err(SyncError::WrongState(StateViolation::Locked));
        }
        self.kind.store(kind.as_raw(), Ordering::Release);
        Ok(())
    }

    /// Destroy if nobody holds or waits on the mutex.
    pub(crate) fn teardown(&self) -> SyncResult<()> {
        self.header.ensure_live()?;
        if self.condwaits.load(Ordering::Acquire) > 0 {
            return Err(SyncError::Busy);
        }
        if self
            .lock_counter
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return Err(SyncError::Busy);
        }
        if !self.header.mark_destroyed() {
            self.lock_counter.store(0, Ordering::Release);
            return Err(SyncError::InvalidObject(self.header.kind()));
        }
        self.owner.store(OWNER_DESTROYED, Ordering::Release);
        if let Some(key) = RegistryKey::from_raw(self.header.registry_key()) {
            mutexes().remove(key);
        }
        Ok(())
    }

    /// Fork child: fresh event, no waiters. A lock held by the forking thread
    /// stays held; locks held by threads that no longer exist are released.
    pub(crate) fn fixup_after_fork(&self, me: u64) -> bool {
        if !self.event.rebuild_after_fork(false) || !self.handoff.reset_after_fork() {
            return false;
        }
        let owner = self.owner.load(Ordering::Acquire);
        if is_held(owner) && owner == me {
            self.lock_counter.store(1, Ordering::Release);
        } else {
            if is_held(owner) {
                self.owner.store(OWNER_UNLOCKED, Ordering::Release);
            }
            self.recursion.store(0, Ordering::Release);
            self.lock_counter.store(0, Ordering::Release);
        }
        self.condwaits.store(0, Ordering::Release);
        true
    }
}

impl SyncRecord for MutexRecord {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn materialize(flavor: u8) -> SyncResult<Arc<Self>> {
        Self::create(
            Discipline::Blocking,
            MutexType::from_static_flavor(flavor),
            false,
        )
    }
}

fn create_from_attr(attr: &MutexAttr) -> SyncResult<Arc<MutexRecord>> {
    mutex_attr_support_error(attr.contract())?;
    MutexRecord::create(
        Discipline::Blocking,
        attr.mutex_type(),
        attr.pshared() == PTHREAD_PROCESS_SHARED,
    )
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// A POSIX mutex.
///
/// ```
/// use frankenpthread_core::PthreadMutex;
///
/// static LOCK: PthreadMutex = PthreadMutex::INITIALIZER;
/// LOCK.lock().unwrap();
/// LOCK.unlock().unwrap();
/// ```
pub struct PthreadMutex {
    slot: ObjectSlot<MutexRecord>,
}

impl PthreadMutex {
    #[allow(clippy::declare_interior_mutable_const)]
    pub const INITIALIZER: Self = Self::with_static(STATIC_DEFAULT);
    #[allow(clippy::declare_interior_mutable_const)]
    pub const RECURSIVE_INITIALIZER: Self = Self::with_static(STATIC_RECURSIVE);
    #[allow(clippy::declare_interior_mutable_const)]
    pub const ERRORCHECK_INITIALIZER: Self = Self::with_static(STATIC_ERRORCHECK);

    const fn with_static(flavor: u8) -> Self {
        Self {
            slot: ObjectSlot::new_static(ObjectKind::Mutex, flavor),
        }
    }

    pub fn new(attr: &MutexAttr) -> SyncResult<Self> {
        Ok(Self {
            slot: ObjectSlot::new_live(ObjectKind::Mutex, create_from_attr(attr)?),
        })
    }

    /// Initialize a handle that is a static initializer or destroyed.
    pub fn init(&self, attr: &MutexAttr) -> SyncResult<()> {
        self.slot.install(|| create_from_attr(attr))
    }

    pub fn lock(&self) -> SyncResult<()> {
        self.slot.resolve()?.lock_with(None, true)
    }

    pub fn try_lock(&self) -> SyncResult<()> {
        self.slot.try_resolve()?.try_lock()
    }

    pub fn timed_lock(&self, deadline: Instant) -> SyncResult<()> {
        self.slot.resolve()?.lock_with(Some(deadline), true)
    }

    pub fn unlock(&self) -> SyncResult<()> {
        self.slot.resolve()?.unlock()
    }

    pub fn destroy(&self) -> SyncResult<()> {
        self.slot.retire(|record| record.teardown())
    }

    /// Change the lock type of an unheld mutex.
    pub fn set_type(&self, kind: MutexType) -> SyncResult<()> {
        self.slot.resolve()?.set_type(kind)
    }

    pub fn mutex_type(&self) -> SyncResult<MutexType> {
        Ok(self.slot.resolve()?.mutex_type())
    }

    pub fn owner(&self) -> SyncResult<MutexOwner> {
        Ok(self.slot.resolve()?.owner())
    }

    #[must_use]
    pub fn validity(&self) -> Validity {
        self.slot.validity()
    }

    pub(crate) fn record(&self) -> SyncResult<Arc<MutexRecord>> {
        self.slot.resolve()
    }
}

/// A POSIX spinlock. Contended acquisition spins with a yield.
pub struct PthreadSpinlock {
    slot: ObjectSlot<MutexRecord>,
}

impl PthreadSpinlock {
    pub fn new(pshared: i32) -> SyncResult<Self> {
        Ok(Self {
            slot: ObjectSlot::new_live(ObjectKind::Spinlock, create_spin(pshared)?),
        })
    }

    pub fn init(&self, pshared: i32) -> SyncResult<()> {
        self.slot.install(|| create_spin(pshared))
    }

    pub fn lock(&self) -> SyncResult<()> {
        self.slot.resolve()?.lock_with(None, false)
    }

    pub fn try_lock(&self) -> SyncResult<()> {
        self.slot.resolve()?.try_lock()
    }

    pub fn unlock(&self) -> SyncResult<()> {
        self.slot.resolve()?.unlock()
    }

    pub fn destroy(&self) -> SyncResult<()> {
        self.slot.retire(|record| record.teardown())
    }

    #[must_use]
    pub fn validity(&self) -> Validity {
        self.slot.validity()
    }
}

fn create_spin(pshared: i32) -> SyncResult<Arc<MutexRecord>> {
    let mut attr = MutexAttr::new();
    attr.set_pshared(pshared)?;
    MutexRecord::create(Discipline::Spin, MutexType::Normal, attr.pshared() == PTHREAD_PROCESS_SHARED)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
