//! Per-kind instance registries.
//!
//! One generational arena per primitive kind. Every slot has a generation
//! counter; a [`RegistryKey`] names a slot at one generation, so a key that
//! outlives its record can never resolve to a later occupant.
//!
//! Insertion only touches the arena lock for a constant-time slot claim; it
//! never waits on the registry's [`InternalMutex`]. Removal and enumeration
//! serialize on that internal mutex. Enumeration snapshots the occupied slots
//! and walks the snapshot, so callbacks may insert freely.
//!
//! Around `fork` the forking thread holds both locks (prepare), then releases
//! them in the parent or rebuilds the arena in the child, keeping survivors at
//! their old index and generation so outstanding keys stay valid.

#![allow(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard};

use super::internal_mutex::InternalMutex;
use super::object::ObjectKind;
use crate::error::{SyncResult, fatal};

/// Handle to a registry slot at one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistryKey {
    index: u32,
    generation: u32,
}

impl RegistryKey {
    /// Packed form. Never zero: generations start at 1.
    #[must_use]
    pub const fn to_raw(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    #[must_use]
    pub const fn from_raw(raw: u64) -> Option<Self> {
        let generation = (raw >> 32) as u32;
        if generation == 0 {
            return None;
        }
        Some(Self {
            index: raw as u32,
            generation,
        })
    }

    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

/// Largest generation handed out. Higher packed values are reserved for
/// owner sentinels.
const MAX_GENERATION: u32 = u32::MAX - 16;

fn next_generation(g: u32) -> u32 {
    if g >= MAX_GENERATION { 1 } else { g + 1 }
}

enum Entry<T> {
    Vacant,
    /// Claimed by an insertion that is still building its value.
    Reserved,
    Occupied(Arc<T>),
}

struct Slot<T> {
    generation: u32,
    entry: Entry<T>,
}

struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Arena<T> {
    const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    fn reserve(&mut self) -> RegistryKey {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: Entry::Vacant,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.generation = next_generation(slot.generation);
        slot.entry = Entry::Reserved;
        RegistryKey {
            index,
            generation: slot.generation,
        }
    }

    fn slot_mut(&mut self, key: RegistryKey) -> Option<&mut Slot<T>> {
        self.slots
            .get_mut(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
    }

    fn vacate(&mut self, index: u32) {
        self.slots[index as usize].entry = Entry::Vacant;
        self.free.push(index);
    }
}

/// A mutex that can stay locked across `fork` without a guard on the stack.
pub(crate) struct ForkLatch<T> {
    inner: Mutex<T>,
    held: AtomicBool,
}

impl<T> ForkLatch<T> {
    pub(crate) const fn new(value: T) -> Self {
        Self {
            inner: parking_lot::const_mutex(value),
            held: AtomicBool::new(false),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }

    /// Lock and keep the lock past the end of this call.
    pub(crate) fn hold_for_fork(&self) {
        std::mem::forget(self.inner.lock());
        self.held.store(true, Ordering::Release);
    }

    /// Undo [`hold_for_fork`](Self::hold_for_fork). No-op if not held.
    pub(crate) fn release_after_fork(&self) {
        if self.held.swap(false, Ordering::AcqRel) {
            // SAFETY: `held` was set by `hold_for_fork`, which leaked a guard
            // of this mutex. The swap above lets exactly one caller consume
            // that leaked guard, and in a fork child the forking thread is the
            // only thread left, so no other owner exists.
            unsafe { self.inner.force_unlock() };
        }
    }
}

/// Outcome of rebuilding one registry in a fork child.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildCounts {
    pub kept: usize,
    pub discarded: usize,
}

/// Process-wide collection of one primitive kind.
pub(crate) struct Registry<T> {
    kind: ObjectKind,
    guard: InternalMutex,
    arena: ForkLatch<Arena<T>>,
}

impl<T: Send + Sync + 'static> Registry<T> {
    /// Failure to create the guard leaves no way to track instances.
    pub(crate) fn new(kind: ObjectKind) -> Self {
        let guard = InternalMutex::new()
            .unwrap_or_else(|err| fatal("creating registry guard", &err));
        Self {
            kind,
            guard,
            arena: ForkLatch::new(Arena::new()),
        }
    }

    pub(crate) fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// Register a value built from its own key.
    ///
    /// The slot is claimed first and filled after `build` returns, so `build`
    /// may itself use registries. A failed build frees the slot.
    pub(crate) fn insert_with(
        &self,
        build: impl FnOnce(RegistryKey) -> SyncResult<Arc<T>>,
    ) -> SyncResult<(RegistryKey, Arc<T>)> {
        let key = self.arena.lock().reserve();
        match build(key) {
            Ok(value) => {
                let mut arena = self.arena.lock();
                if let Some(slot) = arena.slot_mut(key) {
                    slot.entry = Entry::Occupied(Arc::clone(&value));
                    arena.live += 1;
                }
                Ok((key, value))
            }
            Err(err) => {
                let mut arena = self.arena.lock();
                if arena.slot_mut(key).is_some() {
                    arena.vacate(key.index);
                }
                Err(err)
            }
        }
    }

    pub(crate) fn get(&self, key: RegistryKey) -> Option<Arc<T>> {
        let mut arena = self.arena.lock();
        match &arena.slot_mut(key)?.entry {
            Entry::Occupied(value) => Some(Arc::clone(value)),
            _ => None,
        }
    }

    /// True if `key` named a value that has since been removed and its slot
    /// not yet reused.
    pub(crate) fn is_retired(&self, key: RegistryKey) -> bool {
        let mut arena = self.arena.lock();
        arena
            .slot_mut(key)
            .is_some_and(|slot| matches!(slot.entry, Entry::Vacant))
    }

    pub(crate) fn remove(&self, key: RegistryKey) -> Option<Arc<T>> {
        self.guard.lock();
        let removed = {
            let mut arena = self.arena.lock();
            let taken = match arena.slot_mut(key) {
                Some(slot) => match std::mem::replace(&mut slot.entry, Entry::Vacant) {
                    Entry::Occupied(value) => Some(value),
                    other => {
                        slot.entry = other;
                        None
                    }
                },
                None => None,
            };
            if taken.is_some() {
                arena.free.push(key.index);
                arena.live -= 1;
            }
            taken
        };
        self.guard.unlock();
        removed
    }

    /// Visit every registered value.
    pub(crate) fn for_each(&self, mut f: impl FnMut(RegistryKey, &Arc<T>)) {
        self.guard.lock();
        let snapshot: Vec<(RegistryKey, Arc<T>)> = {
            let arena = self.arena.lock();
            arena
                .slots
                .iter()
                .enumerate()
                .filter_map(|(index, slot)| match &slot.entry {
                    Entry::Occupied(value) => Some((
                        RegistryKey {
                            index: index as u32,
                            generation: slot.generation,
                        },
                        Arc::clone(value),
                    )),
                    _ => None,
                })
                .collect()
        };
        for (key, value) in &snapshot {
            f(*key, value);
        }
        self.guard.unlock();
    }

    pub(crate) fn len(&self) -> usize {
        self.arena.lock().live
    }

    pub(crate) fn prepare_fork(&self) {
        self.guard.lock();
        self.arena.hold_for_fork();
    }

    pub(crate) fn parent_after_fork(&self) {
        self.arena.release_after_fork();
        self.guard.unlock();
    }

    /// Fork child: rebuild the arena from the survivors `keep` accepts.
    ///
    /// Survivors keep their index and generation. Discarded entries and
    /// in-flight reservations become vacant at a new generation.
    pub(crate) fn child_after_fork(&self, mut keep: impl FnMut(&Arc<T>) -> bool) -> RebuildCounts {
        self.arena.release_after_fork();
        let mut counts = RebuildCounts::default();
        {
            let mut arena = self.arena.lock();
            let old = std::mem::replace(&mut *arena, Arena::new());
            for (index, slot) in old.slots.into_iter().enumerate() {
                let survivor = match slot.entry {
                    Entry::Occupied(value) => {
                        if keep(&value) {
                            counts.kept += 1;
                            Some(value)
                        } else {
                            counts.discarded += 1;
                            None
                        }
                    }
                    Entry::Reserved | Entry::Vacant => None,
                };
                match survivor {
                    Some(value) => {
                        arena.slots.push(Slot {
                            generation: slot.generation,
                            entry: Entry::Occupied(value),
                        });
                        arena.live += 1;
                    }
                    None => {
                        arena.slots.push(Slot {
                            generation: next_generation(slot.generation),
                            entry: Entry::Vacant,
                        });
                        arena.free.push(index as u32);
                    }
                }
            }
        }
        if !self.guard.reset_after_fork() {
            fatal(
                "rebuilding registry guard after fork",
                &crate::error::SyncError::ResourceExhausted("registry guard"),
            );
        }
        counts
    }
}
