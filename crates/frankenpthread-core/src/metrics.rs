//! Atomic counters for synchronization observability.
//!
//! All counters use relaxed ordering; they are diagnostic, not synchronization.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Global synchronization counters.
pub struct SyncMetrics {
    /// Mutex acquisitions that had to block.
    pub contended_locks: AtomicU64,
    /// Blocking operations that returned `Timeout`.
    pub timeouts: AtomicU64,
    /// Condition-variable waits entered.
    pub cond_waits: AtomicU64,
    /// Waiters released by signal/broadcast.
    pub cond_releases: AtomicU64,
    /// Cancellation requests acted upon.
    pub cancellations: AtomicU64,
    /// Host wait objects created.
    pub handles_created: AtomicU64,
    /// Threads created through this library.
    pub threads_created: AtomicU64,
    /// Instances rebuilt in a fork child.
    pub fork_repairs: AtomicU64,
    /// Instances dropped in a fork child.
    pub fork_discards: AtomicU64,
}

impl SyncMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            contended_locks: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            cond_waits: AtomicU64::new(0),
            cond_releases: AtomicU64::new(0),
            cancellations: AtomicU64::new(0),
            handles_created: AtomicU64::new(0),
            threads_created: AtomicU64::new(0),
            fork_repairs: AtomicU64::new(0),
            fork_discards: AtomicU64::new(0),
        }
    }

    /// Increment a counter by 1.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment a counter by `n`.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Read a counter value.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            contended_locks: Self::get(&self.contended_locks),
            timeouts: Self::get(&self.timeouts),
            cond_waits: Self::get(&self.cond_waits),
            cond_releases: Self::get(&self.cond_releases),
            cancellations: Self::get(&self.cancellations),
            handles_created: Self::get(&self.handles_created),
            threads_created: Self::get(&self.threads_created),
            fork_repairs: Self::get(&self.fork_repairs),
            fork_discards: Self::get(&self.fork_discards),
        }
    }
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of all counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub contended_locks: u64,
    pub timeouts: u64,
    pub cond_waits: u64,
    pub cond_releases: u64,
    pub cancellations: u64,
    pub handles_created: u64,
    pub threads_created: u64,
    pub fork_repairs: u64,
    pub fork_discards: u64,
}

static GLOBAL_METRICS: SyncMetrics = SyncMetrics::new();

/// Access the global metrics singleton.
#[must_use]
pub fn global_metrics() -> &'static SyncMetrics {
    &GLOBAL_METRICS
}
