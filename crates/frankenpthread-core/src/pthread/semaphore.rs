//! Counting semaphores, unnamed and named.
//!
//! The value is a host semaphore handle, so a post banks a unit when nobody
//! waits and releases exactly one waiter otherwise.
//!
//! Named semaphores live in a process-wide namespace keyed by a hash of the
//! name. Each carries an identity of that hash plus a unique id assigned at
//! creation, which distinguishes a semaphore from a later one created under
//! the same name after an unlink. A named semaphore is destroyed once it is
//! both unlinked and closed by every opener.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use serde::Serialize;

use crate::error::{SyncError, SyncResult};
use crate::host::WaitHandle;
use crate::metrics::{SyncMetrics, global_metrics};

use super::attr::{PTHREAD_PROCESS_PRIVATE, PTHREAD_PROCESS_SHARED};
use super::cancel::{CancelAction, WaitOutcome, cancelable_wait};
use super::object::{ObjectHeader, ObjectKind, ObjectSlot, SyncRecord, Validity};
use super::registry::{ForkLatch, Registry, RegistryKey};

pub const SEM_VALUE_MAX: u32 = i32::MAX as u32;
/// Longest accepted name, leading slash included.
pub const SEM_NAME_MAX: usize = 255;

/// Stable identity of a named semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct NamedIdentity {
    /// First eight bytes of the BLAKE3 hash of the name.
    pub hash: u64,
    /// Unique per creation within this process.
    pub luid: u64,
}

static NEXT_LUID: AtomicU64 = AtomicU64::new(1);

fn name_hash(name: &str) -> u64 {
    let digest = blake3::hash(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

fn check_name(name: &str) -> SyncResult<()> {
    if name.len() < 2 || !name.starts_with('/') || name.len() > SEM_NAME_MAX {
        return Err(SyncError::InvalidArgument("semaphore name"));
    }
    if name[1..].contains('/') {
        return Err(SyncError::InvalidArgument("semaphore name"));
    }
    Ok(())
}

fn shared_flag(pshared: i32) -> SyncResult<bool> {
    match pshared {
        PTHREAD_PROCESS_PRIVATE => Ok(false),
        PTHREAD_PROCESS_SHARED => Ok(true),
        _ => Err(SyncError::InvalidArgument("pshared")),
    }
}

struct NamedEntry {
    name: String,
    identity: NamedIdentity,
    mode: u32,
    open_count: AtomicU32,
    unlinked: AtomicBool,
}

pub struct SemaphoreRecord {
    header: ObjectHeader,
    shared: bool,
    value: WaitHandle,
    named: Option<NamedEntry>,
}

static SEMAPHORES: OnceLock<Registry<SemaphoreRecord>> = OnceLock::new();

pub(crate) fn semaphores() -> &'static Registry<SemaphoreRecord> {
    SEMAPHORES.get_or_init(|| Registry::new(ObjectKind::Semaphore))
}

type Namespace = BTreeMap<u64, Vec<Arc<SemaphoreRecord>>>;

static NAMESPACE: ForkLatch<Namespace> = ForkLatch::new(BTreeMap::new());

pub(crate) fn namespace_latch() -> &'static ForkLatch<Namespace> {
    &NAMESPACE
}

impl SemaphoreRecord {
    fn create(value: u32, shared: bool, named: Option<NamedEntry>) -> SyncResult<Arc<Self>> {
        if value > SEM_VALUE_MAX {
            return Err(SyncError::InvalidArgument("semaphore value above SEM_VALUE_MAX"));
        }
        let (key, record) = semaphores().insert_with(|_| {
            Ok(Arc::new(Self {
                header: ObjectHeader::new(ObjectKind::Semaphore),
                shared,
                value: WaitHandle::semaphore(value, SEM_VALUE_MAX)?,
                named,
            }))
        })?;
        record.header.set_registry_key(key.to_raw());
        Ok(record)
    }

    #[must_use]
    pub fn header(&self) -> &ObjectHeader {
        &self.header
    }

    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    #[must_use]
    pub fn identity(&self) -> Option<NamedIdentity> {
        self.named.as_ref().map(|n| n.identity)
    }

    #[must_use]
    pub fn handle_id(&self) -> u64 {
        self.value.handle_id()
    }

    fn post(&self) -> SyncResult<()> {
        self.header.ensure_live()?;
        self.value.release(1)
    }

    fn wait(&self, deadline: Option<Instant>) -> SyncResult<()> {
        self.header.ensure_live()?;
        match cancelable_wait(&self.value, deadline, CancelAction::CancelSelf) {
            WaitOutcome::Signaled => Ok(()),
            WaitOutcome::TimedOut => {
                SyncMetrics::inc(&global_metrics().timeouts);
                Err(SyncError::Timeout)
            }
            WaitOutcome::Canceled => Err(SyncError::Interrupted),
        }
    }

    fn try_wait(&self) -> SyncResult<()> {
        self.header.ensure_live()?;
        if self.value.try_acquire() {
            Ok(())
        } else {
            Err(SyncError::WouldBlock)
        }
    }

    fn get_value(&self) -> SyncResult<i32> {
        self.header.ensure_live()?;
        // Bounded by SEM_VALUE_MAX.
        Ok(i32::try_from(self.value.count()).unwrap_or(i32::MAX))
    }

    /// Threads currently blocked in `wait`.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.value.waiter_count()
    }

    fn teardown(&self) -> SyncResult<()> {
        self.header.ensure_live()?;
        if self.value.waiter_count() > 0 {
            return Err(SyncError::Busy);
        }
        if !self.header.mark_destroyed() {
            return Err(SyncError::InvalidObject(ObjectKind::Semaphore));
        }
        if let Some(key) = RegistryKey::from_raw(self.header.registry_key()) {
            semaphores().remove(key);
        }
        Ok(())
    }

    /// Fork child: fresh handle, same value.
    pub(crate) fn fixup_after_fork(&self) -> bool {
        self.value.rebuild_after_fork(true)
    }
}

impl SyncRecord for SemaphoreRecord {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    /// Semaphores have no static initializer.
    fn materialize(_flavor: u8) -> SyncResult<Arc<Self>> {
        Err(SyncError::InvalidObject(ObjectKind::Semaphore))
    }
}

/// An unnamed POSIX semaphore.
pub struct Semaphore {
    slot: ObjectSlot<SemaphoreRecord>,
}

impl Semaphore {
    /// Process-shared semaphores are accepted; this crate has no second
    /// process to share with, so the flag is recorded only.
    pub fn new(pshared: i32, value: u32) -> SyncResult<Self> {
        Ok(Self {
            slot: ObjectSlot::new_live(
                ObjectKind::Semaphore,
                SemaphoreRecord::create(value, shared_flag(pshared)?, None)?,
            ),
        })
    }

    /// Reinitialize a destroyed semaphore.
    pub fn init(&self, pshared: i32, value: u32) -> SyncResult<()> {
        let shared = shared_flag(pshared)?;
        self.slot
            .install(|| SemaphoreRecord::create(value, shared, None))
    }

    pub fn post(&self) -> SyncResult<()> {
        self.slot.resolve()?.post()
    }

    /// Decrement, blocking while the value is zero. A cancellation point.
    pub fn wait(&self) -> SyncResult<()> {
        self.slot.resolve()?.wait(None)
    }

    pub fn timed_wait(&self, deadline: Instant) -> SyncResult<()> {
        self.slot.resolve()?.wait(Some(deadline))
    }

    pub fn try_wait(&self) -> SyncResult<()> {
        self.slot.resolve()?.try_wait()
    }

    pub fn value(&self) -> SyncResult<i32> {
        self.slot.resolve()?.get_value()
    }

    /// Threads currently blocked in `wait`.
    pub fn waiters(&self) -> SyncResult<usize> {
        Ok(self.slot.resolve()?.waiters())
    }

    pub fn destroy(&self) -> SyncResult<()> {
        self.slot.retire(|record| record.teardown())
    }

    #[must_use]
    pub fn validity(&self) -> Validity {
        self.slot.validity()
    }

    /// Open or create a named semaphore.
    ///
    /// `value` and `mode` apply only when the call creates it.
    pub fn open(name: &str, flags: OpenFlags, mode: u32, value: u32) -> SyncResult<NamedSemaphore> {
        check_name(name)?;
        let hash = name_hash(name);
        let mut ns = NAMESPACE.lock();
        let existing = ns
            .get(&hash)
            .and_then(|bucket| bucket.iter().find(|r| r.entry_name() == Some(name)).cloned());
        if let Some(record) = existing {
            if flags.create && flags.exclusive {
                return Err(SyncError::Exists);
            }
            record.add_opener();
            return Ok(NamedSemaphore { record });
        }
        if !flags.create {
            return Err(SyncError::NotFound);
        }
        let record = SemaphoreRecord::create(
            value,
            true,
            Some(NamedEntry {
                name: name.to_owned(),
                identity: NamedIdentity {
                    hash,
                    luid: NEXT_LUID.fetch_add(1, Ordering::Relaxed),
                },
                mode,
                open_count: AtomicU32::new(1),
                unlinked: AtomicBool::new(false),
            }),
        )?;
        ns.entry(hash).or_default().push(Arc::clone(&record));
        log::debug!("created named semaphore {name}");
        Ok(NamedSemaphore { record })
    }

    /// Reopen the exact semaphore `identity` names, if it is still linked.
    pub fn open_identity(identity: NamedIdentity) -> SyncResult<NamedSemaphore> {
        let ns = NAMESPACE.lock();
        let record = ns
            .get(&identity.hash)
            .and_then(|bucket| {
                bucket
                    .iter()
                    .find(|r| r.identity() == Some(identity))
                    .cloned()
            })
            .ok_or(SyncError::NotFound)?;
        record.add_opener();
        Ok(NamedSemaphore { record })
    }

    /// Remove `name` from the namespace. Openers keep their semaphore.
    pub fn unlink(name: &str) -> SyncResult<()> {
        check_name(name)?;
        let hash = name_hash(name);
        let mut ns = NAMESPACE.lock();
        let bucket = ns.get_mut(&hash).ok_or(SyncError::NotFound)?;
        let pos = bucket
            .iter()
            .position(|r| r.entry_name() == Some(name))
            .ok_or(SyncError::NotFound)?;
        let record = bucket.swap_remove(pos);
        if bucket.is_empty() {
            ns.remove(&hash);
        }
        if let Some(entry) = &record.named {
            entry.unlinked.store(true, Ordering::Release);
            if entry.open_count.load(Ordering::Acquire) == 0 {
                record.release_named();
            }
        }
        Ok(())
    }
}

impl SemaphoreRecord {
    fn entry_name(&self) -> Option<&str> {
        self.named.as_ref().map(|n| n.name.as_str())
    }

    fn add_opener(&self) {
        if let Some(entry) = &self.named {
            entry.open_count.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn release_named(&self) {
        if self.header.mark_destroyed() {
            if let Some(key) = RegistryKey::from_raw(self.header.registry_key()) {
                semaphores().remove(key);
            }
            log::debug!("destroyed named semaphore {:?}", self.entry_name());
        }
    }
}

/// `O_CREAT` / `O_EXCL` for [`Semaphore::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags {
    pub create: bool,
    pub exclusive: bool,
}

impl OpenFlags {
    pub const OPEN: Self = Self {
        create: false,
        exclusive: false,
    };
    pub const CREATE: Self = Self {
        create: true,
        exclusive: false,
    };
    pub const CREATE_EXCLUSIVE: Self = Self {
        create: true,
        exclusive: true,
    };
}

/// One opener's reference to a named semaphore.
pub struct NamedSemaphore {
    record: Arc<SemaphoreRecord>,
}

impl NamedSemaphore {
    pub fn post(&self) -> SyncResult<()> {
        self.record.post()
    }

    pub fn wait(&self) -> SyncResult<()> {
        self.record.wait(None)
    }

    pub fn timed_wait(&self, deadline: Instant) -> SyncResult<()> {
        self.record.wait(Some(deadline))
    }

    pub fn try_wait(&self) -> SyncResult<()> {
        self.record.try_wait()
    }

    pub fn value(&self) -> SyncResult<i32> {
        self.record.get_value()
    }

    /// Identity for [`Semaphore::open_identity`].
    #[must_use]
    pub fn identity(&self) -> NamedIdentity {
        // Every NamedSemaphore wraps a named record.
        self.record.identity().unwrap_or(NamedIdentity { hash: 0, luid: 0 })
    }

    /// Permission bits given at creation.
    #[must_use]
    pub fn mode(&self) -> u32 {
        self.record.named.as_ref().map_or(0, |n| n.mode)
    }

    /// Drop this opener's reference.
    pub fn close(self) -> SyncResult<()> {
        self.record.header.ensure_live()?;
        let Some(entry) = &self.record.named else {
            return Err(SyncError::InvalidObject(ObjectKind::Semaphore));
        };
        let _ns = NAMESPACE.lock();
        if entry.open_count.fetch_sub(1, Ordering::AcqRel) == 1
            && entry.unlinked.load(Ordering::Acquire)
        {
            self.record.release_named();
        }
        Ok(())
    }
}
