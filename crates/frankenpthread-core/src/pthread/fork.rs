//! Process duplication.
//!
//! [`prepare`] runs the registered prepare callbacks, then takes every
//! registry's locks so the duplicated address space sees each registry in a
//! consistent state. After duplication the parent calls [`parent`] to drop
//! those locks; the child calls [`child`], which rebuilds every registry.
//! Each surviving instance gets fresh host handles and zero waiters; an
//! instance that cannot be repaired (or a thread other than the forking one)
//! is marked destroyed and dropped from its registry.
//!
//! On unix, [`fork`] wires the three phases around `libc::fork`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::SyncResult;
use crate::metrics::{SyncMetrics, global_metrics};

use super::cond::conds;
use super::mutex::mutexes;
use super::object::{ObjectHeader, ObjectKind};
use super::registry::{RebuildCounts, Registry};
use super::rwlock::rwlocks;
use super::semaphore::{namespace_latch, semaphores};
use super::thread::{current_owner_id, threads};
use super::tls::keys;

pub type AtforkCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct AtforkLists {
    prepare: Vec<AtforkCallback>,
    parent: Vec<AtforkCallback>,
    child: Vec<AtforkCallback>,
}

static ATFORK: Mutex<AtforkLists> = parking_lot::const_mutex(AtforkLists {
    prepare: Vec::new(),
    parent: Vec::new(),
    child: Vec::new(),
});

static FORK_GENERATION: AtomicU64 = AtomicU64::new(0);

/// Register fork callbacks. Prepare callbacks run in reverse registration
/// order; parent and child callbacks in registration order.
pub fn register_atfork(
    prepare: Option<AtforkCallback>,
    parent: Option<AtforkCallback>,
    child: Option<AtforkCallback>,
) {
    let mut lists = ATFORK.lock();
    if let Some(cb) = prepare {
        lists.prepare.insert(0, cb);
    }
    if let Some(cb) = parent {
        lists.parent.push(cb);
    }
    if let Some(cb) = child {
        lists.child.push(cb);
    }
}

fn run(select: impl FnOnce(&AtforkLists) -> Vec<AtforkCallback>) {
    // Callbacks run unlocked so they may register more.
    let callbacks = select(&ATFORK.lock());
    for cb in callbacks {
        cb();
    }
}

/// Number of fork children this process descends from.
#[must_use]
pub fn fork_generation() -> u64 {
    FORK_GENERATION.load(Ordering::Acquire)
}

/// Proof that [`prepare`] ran; consumed by [`parent`] or [`child`].
#[must_use]
pub struct ForkSnapshot {
    forking_thread: u64,
}

/// Repair counts for one primitive kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KindRepair {
    pub kind: ObjectKind,
    pub kept: usize,
    pub discarded: usize,
}

/// What the child kept and dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForkReport {
    pub generation: u64,
    pub kinds: Vec<KindRepair>,
}

impl ForkReport {
    #[must_use]
    pub fn kept(&self, kind: ObjectKind) -> usize {
        self.kinds.iter().filter(|k| k.kind == kind).map(|k| k.kept).sum()
    }

    #[must_use]
    pub fn discarded(&self, kind: ObjectKind) -> usize {
        self.kinds
            .iter()
            .filter(|k| k.kind == kind)
            .map(|k| k.discarded)
            .sum()
    }
}

// Lock order. The namespace is taken before any registry because opening a
// named semaphore inserts into the semaphore registry under it.
fn hold_all() {
    namespace_latch().hold_for_fork();
    keys().prepare_fork();
    threads().prepare_fork();
    mutexes().prepare_fork();
    conds().prepare_fork();
    rwlocks().prepare_fork();
    semaphores().prepare_fork();
}

/// Run prepare callbacks and lock every registry.
pub fn prepare() -> ForkSnapshot {
    run(|lists| lists.prepare.clone());
    // Adopt the caller now; adoption needs the thread registry unlocked.
    let forking_thread = current_owner_id();
    hold_all();
    log::debug!("fork prepared by thread {forking_thread:#x}");
    ForkSnapshot { forking_thread }
}

/// Parent side: unlock everything [`prepare`] locked, then run parent
/// callbacks.
pub fn parent(snapshot: ForkSnapshot) {
    let _ = snapshot.forking_thread;
    semaphores().parent_after_fork();
    rwlocks().parent_after_fork();
    conds().parent_after_fork();
    mutexes().parent_after_fork();
    threads().parent_after_fork();
    keys().parent_after_fork();
    namespace_latch().release_after_fork();
    run(|lists| lists.parent.clone());
}

fn rebuild<T: Send + Sync + 'static>(
    registry: &Registry<T>,
    header: impl Fn(&T) -> &ObjectHeader,
    mut fixup: impl FnMut(&T) -> bool,
    expected_loss: bool,
) -> KindRepair {
    let RebuildCounts { kept, discarded } = registry.child_after_fork(|record| {
        if fixup(&**record) {
            return true;
        }
        let header = header(&**record);
        header.mark_destroyed();
        if expected_loss {
            log::debug!("fork child: dropped {} #{}", header.kind(), header.id());
        } else {
            log::warn!(
                "fork child: {} #{} was mid-operation and is discarded",
                header.kind(),
                header.id()
            );
        }
        false
    });
    SyncMetrics::add(&global_metrics().fork_repairs, kept as u64);
    SyncMetrics::add(&global_metrics().fork_discards, discarded as u64);
    KindRepair {
        kind: registry.kind(),
        kept,
        discarded,
    }
}

/// Child side: rebuild every registry, then run child callbacks.
pub fn child(snapshot: ForkSnapshot) -> ForkReport {
    let me = snapshot.forking_thread;
    let generation = FORK_GENERATION.fetch_add(1, Ordering::AcqRel) + 1;
    namespace_latch().release_after_fork();
    let kinds = vec![
        rebuild(keys(), |r| r.header(), |_| true, false),
        rebuild(threads(), |r| r.header(), |r| r.fixup_after_fork(me), true),
        rebuild(mutexes(), |r| r.header(), |r| r.fixup_after_fork(me), false),
        rebuild(conds(), |r| r.header(), |r| r.fixup_after_fork(), false),
        rebuild(rwlocks(), |r| r.header(), |r| r.fixup_after_fork(me), false),
        rebuild(semaphores(), |r| r.header(), |r| r.fixup_after_fork(), false),
    ];
    // Named entries whose records were discarded are unreachable.
    namespace_latch().lock().retain(|_, bucket| {
        bucket.retain(|r| r.header().is_live());
        !bucket.is_empty()
    });
    log::debug!("fork child generation {generation} rebuilt");
    run(|lists| lists.child.clone());
    ForkReport { generation, kinds }
}

/// Result of [`fork`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForkOutcome {
    Parent { child_pid: i32 },
    Child(ForkReport),
}

/// Duplicate the process, repairing every primitive in the child.
#[cfg(unix)]
#[allow(unsafe_code)]
pub fn fork() -> SyncResult<ForkOutcome> {
    let snapshot = prepare();
    // SAFETY: every registry lock is held by this thread, so no registry is
    // mid-update in the child. Host wait objects that another thread had
    // locked are detected by `rebuild_after_fork` and their owners discarded.
    let pid = unsafe { libc::fork() };
    match pid {
        -1 => {
            parent(snapshot);
            Err(crate::error::SyncError::ResourceExhausted("fork"))
        }
        0 => Ok(ForkOutcome::Child(child(snapshot))),
        child_pid => {
            parent(snapshot);
            Ok(ForkOutcome::Parent { child_pid })
        }
    }
}

#[cfg(not(unix))]
pub fn fork() -> SyncResult<ForkOutcome> {
    Err(crate::error::SyncError::Unsupported("fork on this platform"))
}
