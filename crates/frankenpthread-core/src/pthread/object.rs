//! Object validity tagging.
//!
//! Every primitive handle carries a tag saying what lifecycle state it is in:
//! a static initializer not yet materialized, a live record, or destroyed.
//! Every entry point resolves its handle through [`ObjectSlot`], which turns a
//! static initializer into a real record exactly once no matter how many
//! threads race on first use.
//!
//! Records carry an [`ObjectHeader`] with their kind, a process-unique id,
//! and their own validity so that a record discarded in a fork child is
//! rejected even through a handle that still points at it.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;

use crate::error::{SyncError, SyncResult};

use super::cond::CondRecord;
use super::mutex::MutexRecord;
use super::rwlock::RwLockRecord;
use super::semaphore::SemaphoreRecord;
use super::thread::ThreadRef;
use super::tls::KeyRecord;

/// Primitive kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Mutex,
    Spinlock,
    Cond,
    RwLock,
    Semaphore,
    Thread,
    Key,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Mutex => "mutex",
            Self::Spinlock => "spinlock",
            Self::Cond => "condition variable",
            Self::RwLock => "read-write lock",
            Self::Semaphore => "semaphore",
            Self::Thread => "thread",
            Self::Key => "thread-specific data key",
        })
    }
}

/// Lifecycle state of a handle or record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Validity {
    /// Declared with a static initializer; materialized on first use.
    StaticUninitialized,
    Initialized,
    /// Terminal for the record. The handle may be initialized again.
    Destroyed,
}

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

const RECORD_LIVE: u8 = 1;
const RECORD_DESTROYED: u8 = 2;

/// Common prefix of every backing record.
#[derive(Debug)]
pub struct ObjectHeader {
    kind: ObjectKind,
    id: u64,
    state: AtomicU8,
    registry_key: AtomicU64,
}

impl ObjectHeader {
    pub(crate) fn new(kind: ObjectKind) -> Self {
        Self {
            kind,
            id: NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(RECORD_LIVE),
            registry_key: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// Process-unique object id; never reused.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state.load(Ordering::Acquire) == RECORD_LIVE
    }

    #[must_use]
    pub fn validity(&self) -> Validity {
        if self.is_live() {
            Validity::Initialized
        } else {
            Validity::Destroyed
        }
    }

    /// Move to Destroyed. Only one caller wins.
    pub(crate) fn mark_destroyed(&self) -> bool {
        self.state
            .compare_exchange(
                RECORD_LIVE,
                RECORD_DESTROYED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn set_registry_key(&self, raw: u64) {
        self.registry_key.store(raw, Ordering::Release);
    }

    pub(crate) fn registry_key(&self) -> u64 {
        self.registry_key.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_live(&self) -> SyncResult<()> {
        if self.is_live() {
            Ok(())
        } else {
            Err(SyncError::InvalidObject(self.kind))
        }
    }
}

/// Backing record of a handle kind.
pub(crate) trait SyncRecord: Send + Sync + Sized + 'static {
    fn header(&self) -> &ObjectHeader;

    /// Build the record a static initializer of `flavor` stands for.
    fn materialize(flavor: u8) -> SyncResult<Arc<Self>>;
}

// Handle tags. Values 1..=STATIC_MAX name a static-initializer flavor.
pub(crate) const STATIC_DEFAULT: u8 = 1;
pub(crate) const STATIC_RECURSIVE: u8 = 2;
pub(crate) const STATIC_ERRORCHECK: u8 = 3;
const STATIC_MAX: u8 = 3;
const TAG_INITIALIZING: u8 = 0x40;
const TAG_LIVE: u8 = 0x41;
const TAG_DESTROYED: u8 = 0x42;

/// Handle storage: a tag plus the record it resolves to once live.
pub(crate) struct ObjectSlot<R> {
    kind: ObjectKind,
    tag: AtomicU8,
    record: RwLock<Option<Arc<R>>>,
}

impl<R: SyncRecord> ObjectSlot<R> {
    pub(crate) const fn new_static(kind: ObjectKind, flavor: u8) -> Self {
        Self {
            kind,
            tag: AtomicU8::new(flavor),
            record: parking_lot::const_rwlock(None),
        }
    }

    pub(crate) fn new_live(kind: ObjectKind, record: Arc<R>) -> Self {
        Self {
            kind,
            tag: AtomicU8::new(TAG_LIVE),
            record: RwLock::new(Some(record)),
        }
    }

    pub(crate) fn validity(&self) -> Validity {
        match self.tag.load(Ordering::Acquire) {
            TAG_LIVE => self
                .record
                .read()
                .as_ref()
                .map_or(Validity::Destroyed, |r| r.header().validity()),
            TAG_DESTROYED => Validity::Destroyed,
            // Initializing counts as uninitialized until the winner publishes.
            _ => Validity::StaticUninitialized,
        }
    }

    /// Resolve to the live record, materializing a static initializer.
    /// Waits out a concurrent materialization.
    pub(crate) fn resolve(&self) -> SyncResult<Arc<R>> {
        self.resolve_inner(true)
    }

    /// As [`resolve`](Self::resolve), but reports `Unsupported` instead of
    /// waiting when another thread is mid-materialization.
    pub(crate) fn try_resolve(&self) -> SyncResult<Arc<R>> {
        self.resolve_inner(false)
    }

    fn resolve_inner(&self, wait: bool) -> SyncResult<Arc<R>> {
        loop {
            match self.tag.load(Ordering::Acquire) {
                TAG_LIVE => {
                    let guard = self.record.read();
                    return match guard.as_ref() {
                        Some(record) if record.header().is_live() => Ok(Arc::clone(record)),
                        _ => Err(SyncError::InvalidObject(self.kind)),
                    };
                }
                TAG_DESTROYED => return Err(SyncError::InvalidObject(self.kind)),
                TAG_INITIALIZING => {
                    if !wait {
                        return Err(SyncError::Unsupported("static initializer still resolving"));
                    }
                    std::thread::yield_now();
                }
                flavor @ 1..=STATIC_MAX => {
                    if self
                        .tag
                        .compare_exchange(
                            flavor,
                            TAG_INITIALIZING,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_err()
                    {
                        continue;
                    }
                    return match R::materialize(flavor) {
                        Ok(record) => {
                            *self.record.write() = Some(Arc::clone(&record));
                            self.tag.store(TAG_LIVE, Ordering::Release);
                            Ok(record)
                        }
                        Err(err) => {
                            self.tag.store(flavor, Ordering::Release);
                            Err(err)
                        }
                    };
                }
                _ => return Err(SyncError::InvalidObject(self.kind)),
            }
        }
    }

    /// Explicit initialization. Fails if the handle is already live.
    pub(crate) fn install(&self, make: impl FnOnce() -> SyncResult<Arc<R>>) -> SyncResult<()> {
        let current = self.tag.load(Ordering::Acquire);
        match current {
            TAG_LIVE => {
                // A record discarded in a fork child leaves the tag live.
                let stale = self
                    .record
                    .read()
                    .as_ref()
                    .is_none_or(|r| !r.header().is_live());
                if !stale {
                    return Err(SyncError::WrongState(
                        crate::error::StateViolation::AlreadyInitialized,
                    ));
                }
            }
            TAG_INITIALIZING => return Err(SyncError::Busy),
            _ => {}
        }
        if self
            .tag
            .compare_exchange(current, TAG_INITIALIZING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SyncError::Busy);
        }
        match make() {
            Ok(record) => {
                *self.record.write() = Some(record);
                self.tag.store(TAG_LIVE, Ordering::Release);
                Ok(())
            }
            Err(err) => {
                self.tag.store(current, Ordering::Release);
                Err(err)
            }
        }
    }

    /// Destroy. `teardown` runs the record's own busy checks and marks it.
    /// A never-used static initializer is retired without materializing.
    pub(crate) fn retire(
        &self,
        teardown: impl FnOnce(&Arc<R>) -> SyncResult<()>,
    ) -> SyncResult<()> {
        let tag = self.tag.load(Ordering::Acquire);
        if (1..=STATIC_MAX).contains(&tag) {
            return self
                .tag
                .compare_exchange(tag, TAG_DESTROYED, Ordering::AcqRel, Ordering::Acquire)
                .map(|_| ())
                .map_err(|_| SyncError::Busy);
        }
        let record = self.resolve()?;
        teardown(&record)?;
        *self.record.write() = None;
        self.tag.store(TAG_DESTROYED, Ordering::Release);
        Ok(())
    }
}

/// A live instance of any primitive kind.
#[derive(Clone)]
pub enum SyncObject {
    Mutex(Arc<MutexRecord>),
    Cond(Arc<CondRecord>),
    RwLock(Arc<RwLockRecord>),
    Semaphore(Arc<SemaphoreRecord>),
    Thread(ThreadRef),
    Key(Arc<KeyRecord>),
}

impl SyncObject {
    #[must_use]
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Mutex(r) => r.header().kind(),
            Self::Cond(_) => ObjectKind::Cond,
            Self::RwLock(_) => ObjectKind::RwLock,
            Self::Semaphore(_) => ObjectKind::Semaphore,
            Self::Thread(_) => ObjectKind::Thread,
            Self::Key(_) => ObjectKind::Key,
        }
    }

    #[must_use]
    pub fn validity(&self) -> Validity {
        match self {
            Self::Mutex(r) => r.header().validity(),
            Self::Cond(r) => r.header().validity(),
            Self::RwLock(r) => r.header().validity(),
            Self::Semaphore(r) => r.header().validity(),
            Self::Thread(t) => t.validity(),
            Self::Key(r) => r.header().validity(),
        }
    }
}

/// Every instance currently registered, across all kinds.
#[must_use]
pub fn live_objects() -> Vec<SyncObject> {
    let mut out = Vec::new();
    super::mutex::mutexes().for_each(|_, r| out.push(SyncObject::Mutex(Arc::clone(r))));
    super::cond::conds().for_each(|_, r| out.push(SyncObject::Cond(Arc::clone(r))));
    super::rwlock::rwlocks().for_each(|_, r| out.push(SyncObject::RwLock(Arc::clone(r))));
    super::semaphore::semaphores()
        .for_each(|_, r| out.push(SyncObject::Semaphore(Arc::clone(r))));
    super::thread::threads()
        .for_each(|_, r| out.push(SyncObject::Thread(ThreadRef::Live(Arc::clone(r)))));
    super::tls::keys().for_each(|_, r| out.push(SyncObject::Key(Arc::clone(r))));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    static MATERIALIZED: AtomicUsize = AtomicUsize::new(0);

    #[derive(Debug)]
    struct Probe {
        header: ObjectHeader,
        flavor: u8,
    }

    impl SyncRecord for Probe {
        fn header(&self) -> &ObjectHeader {
            &self.header
        }

        fn materialize(flavor: u8) -> SyncResult<Arc<Self>> {
            // Only the race test uses the recursive flavor.
            if flavor == STATIC_RECURSIVE {
                MATERIALIZED.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            Ok(Arc::new(Self {
                header: ObjectHeader::new(ObjectKind::Mutex),
                flavor,
            }))
        }
    }

    #[test]
    fn static_initializer_materializes_exactly_once() {
        static SLOT: ObjectSlot<Probe> = ObjectSlot::new_static(ObjectKind::Mutex, STATIC_RECURSIVE);
        assert_eq!(SLOT.validity(), Validity::StaticUninitialized);
        let before = MATERIALIZED.load(Ordering::SeqCst);
        let ids: Vec<u64> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| SLOT.resolve().unwrap().header().id()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(MATERIALIZED.load(Ordering::SeqCst) - before, 1);
        assert_eq!(SLOT.resolve().unwrap().flavor, STATIC_RECURSIVE);
        assert_eq!(SLOT.validity(), Validity::Initialized);
    }

    #[test]
    fn destroyed_slot_rejects_use_and_allows_reinit() {
        let record = Arc::new(Probe {
            header: ObjectHeader::new(ObjectKind::Mutex),
            flavor: 0,
        });
        let slot = ObjectSlot::new_live(ObjectKind::Mutex, record);
        assert_eq!(
            slot.install(|| Probe::materialize(STATIC_DEFAULT)).unwrap_err(),
            SyncError::WrongState(crate::error::StateViolation::AlreadyInitialized)
        );
        slot.retire(|r| {
            r.header().mark_destroyed();
            Ok(())
        })
        .unwrap();
        assert_eq!(slot.validity(), Validity::Destroyed);
        assert_eq!(
            slot.resolve().unwrap_err(),
            SyncError::InvalidObject(ObjectKind::Mutex)
        );
        slot.install(|| Probe::materialize(STATIC_DEFAULT)).unwrap();
        assert_eq!(slot.validity(), Validity::Initialized);
    }

    #[test]
    fn unused_static_retires_without_materializing() {
        let slot: ObjectSlot<Probe> = ObjectSlot::new_static(ObjectKind::Mutex, STATIC_DEFAULT);
        slot.retire(|_| panic!("must not materialize")).unwrap();
        assert_eq!(slot.validity(), Validity::Destroyed);
    }

    #[test]
    fn header_destroy_has_one_winner() {
        let header = ObjectHeader::new(ObjectKind::Cond);
        assert!(header.mark_destroyed());
        assert!(!header.mark_destroyed());
        assert_eq!(
            header.ensure_live(),
            Err(SyncError::InvalidObject(ObjectKind::Cond))
        );
    }

    #[test]
    fn object_ids_are_unique() {
        let a = ObjectHeader::new(ObjectKind::Mutex);
        let b = ObjectHeader::new(ObjectKind::Mutex);
        assert_ne!(a.id(), b.id());
    }
}
