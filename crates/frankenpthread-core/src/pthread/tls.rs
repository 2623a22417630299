//! Thread-specific data keys.
//!
//! Keys live in their own registry. Values are per-thread and stored by the
//! key's packed id, so a value set under a deleted key is never visible
//! through a later key that reuses the slot.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crate::error::{SyncError, SyncResult};

use super::object::{ObjectHeader, ObjectKind};
use super::registry::{Registry, RegistryKey};

pub const PTHREAD_KEYS_MAX: usize = 1024;
pub const PTHREAD_DESTRUCTOR_ITERATIONS: usize = 4;

/// Called at thread exit with the thread's non-zero value for the key.
pub type KeyDestructor = fn(usize);

pub struct KeyRecord {
    header: ObjectHeader,
    destructor: Option<KeyDestructor>,
}

impl KeyRecord {
    #[must_use]
    pub fn header(&self) -> &ObjectHeader {
        &self.header
    }
}

static KEYS: OnceLock<Registry<KeyRecord>> = OnceLock::new();

pub(crate) fn keys() -> &'static Registry<KeyRecord> {
    KEYS.get_or_init(|| Registry::new(ObjectKind::Key))
}

/// Live keys plus creations in flight.
static KEY_SLOTS: AtomicUsize = AtomicUsize::new(0);

fn reserve_slot(slots: &AtomicUsize, max: usize) -> SyncResult<()> {
    slots
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
        .map(|_| ())
        .map_err(|_| SyncError::ResourceExhausted("thread-specific data keys"))
}

thread_local! {
    static VALUES: RefCell<HashMap<u64, usize>> = RefCell::new(HashMap::new());
}

/// A thread-specific data key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PthreadKey(u64);

impl PthreadKey {
    pub fn create(destructor: Option<KeyDestructor>) -> SyncResult<Self> {
        reserve_slot(&KEY_SLOTS, PTHREAD_KEYS_MAX)?;
        let inserted = keys().insert_with(|_| {
            Ok(Arc::new(KeyRecord {
                header: ObjectHeader::new(ObjectKind::Key),
                destructor,
            }))
        });
        let (key, record) = match inserted {
            Ok(entry) => entry,
            Err(err) => {
                KEY_SLOTS.fetch_sub(1, Ordering::AcqRel);
                return Err(err);
            }
        };
        record.header.set_registry_key(key.to_raw());
        Ok(Self(key.to_raw()))
    }

    fn record(self) -> SyncResult<Arc<KeyRecord>> {
        RegistryKey::from_raw(self.0)
            .and_then(|key| keys().get(key))
            .filter(|record| record.header.is_live())
            .ok_or(SyncError::InvalidObject(ObjectKind::Key))
    }

    /// Delete the key. Destructors are not run for values still set.
    pub fn delete(self) -> SyncResult<()> {
        let record = self.record()?;
        if !record.header.mark_destroyed() {
            return Err(SyncError::InvalidObject(ObjectKind::Key));
        }
        if let Some(key) = RegistryKey::from_raw(self.0) {
            keys().remove(key);
        }
        KEY_SLOTS.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    /// The calling thread's value, or `None` if unset or the key is dead.
    #[must_use]
    pub fn get(self) -> Option<usize> {
        self.record().ok()?;
        VALUES
            .try_with(|values| values.borrow().get(&self.0).copied())
            .ok()
            .flatten()
    }

    /// Set the calling thread's value. Zero clears it.
    pub fn set(self, value: usize) -> SyncResult<()> {
        self.record()?;
        VALUES
            .try_with(|values| {
                let mut values = values.borrow_mut();
                if value == 0 {
                    values.remove(&self.0);
                } else {
                    values.insert(self.0, value);
                }
            })
            .map_err(|_| SyncError::ResourceExhausted("thread-specific storage torn down"))
    }

    #[must_use]
    pub fn as_raw(self) -> u64 {
        self.0
    }
}

/// Run destructors for the calling thread's values, repeating while
/// destructors set new values, at most `PTHREAD_DESTRUCTOR_ITERATIONS` times.
pub(crate) fn run_destructors() {
    for _ in 0..PTHREAD_DESTRUCTOR_ITERATIONS {
        let pending: Vec<(KeyDestructor, usize)> = VALUES
            .try_with(|values| {
                let taken: Vec<(u64, usize)> = values.borrow_mut().drain().collect();
                taken
                    .into_iter()
                    .filter_map(|(raw, value)| {
                        let destructor = PthreadKey(raw).record().ok()?.destructor?;
                        Some((destructor, value))
                    })
                    .collect()
            })
            .unwrap_or_default();
        if pending.is_empty() {
            return;
        }
        for (destructor, value) in pending {
            destructor(value);
        }
    }
    let _ = VALUES.try_with(|values| values.borrow_mut().clear());
}
