//! Host wait objects.
//!
//! The primitives in this crate are written against a small kernel-object
//! model: auto-reset events, manual-reset events and counting semaphores, plus
//! a "wait for any of these" call with an absolute deadline. This module
//! provides that model in safe Rust on top of `parking_lot`.
//!
//! A blocked thread parks on its own per-thread [`Parker`]. Before parking it
//! registers that parker with every handle it waits on and re-checks each
//! handle, so a release landing between the first check and the park is
//! never lost. Releases wake every registered parker; woken waiters race to
//! acquire and losers park again.
//!
//! Each handle carries a host identity ([`WaitHandle::handle_id`]). Rebuilding
//! a handle in a fork child assigns a fresh identity and forgets every waiter
//! that belonged to the parent's threads.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::config;
use crate::error::{SyncError, SyncResult};
use crate::metrics::{SyncMetrics, global_metrics};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);
static LIVE_HANDLES: AtomicUsize = AtomicUsize::new(0);

/// Number of host wait objects currently alive.
#[must_use]
pub fn live_handles() -> usize {
    LIVE_HANDLES.load(Ordering::Relaxed)
}

/// Claim one unit of the handle budget, failing once `max` are live.
fn reserve_handle(live: &AtomicUsize, max: usize) -> SyncResult<()> {
    live.fetch_update(Ordering::AcqRel, Ordering::Relaxed, |n| {
        (n < max).then_some(n + 1)
    })
    .map(|_| ())
    .map_err(|_| SyncError::ResourceExhausted("host wait handles"))
}

// ---------------------------------------------------------------------------
// Parker
// ---------------------------------------------------------------------------

/// Per-thread blocking point.
struct Parker {
    notified: Mutex<bool>,
    cond: Condvar,
}

impl Parker {
    fn new() -> Self {
        Self {
            notified: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn prepare(&self) {
        *self.notified.lock() = false;
    }

    fn unpark(&self) {
        let mut notified = self.notified.lock();
        *notified = true;
        self.cond.notify_one();
    }

    /// Returns false if the deadline passed without a notification.
    fn park(&self, deadline: Option<Instant>) -> bool {
        let mut notified = self.notified.lock();
        while !*notified {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut notified, deadline).timed_out() {
                        return *notified;
                    }
                }
                None => self.cond.wait(&mut notified),
            }
        }
        true
    }
}

thread_local! {
    static PARKER: Arc<Parker> = Arc::new(Parker::new());
}

fn current_parker() -> Arc<Parker> {
    // During thread-local teardown the cached parker may already be gone.
    PARKER
        .try_with(Arc::clone)
        .unwrap_or_else(|_| Arc::new(Parker::new()))
}

// ---------------------------------------------------------------------------
// Wait handles
// ---------------------------------------------------------------------------

/// Semantics of a wait handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// Signaled state is consumed by the one waiter it releases.
    AutoEvent,
    /// Stays signaled, releasing every waiter, until reset.
    ManualEvent,
    /// Counting semaphore; each acquisition consumes one unit.
    Semaphore { max: u32 },
}

struct HandleState {
    kind: HandleKind,
    /// Semaphore value, or 0/1 for events.
    count: u32,
    waiters: Vec<Arc<Parker>>,
}

impl HandleState {
    fn try_acquire(&mut self) -> bool {
        match self.kind {
            HandleKind::ManualEvent => self.count > 0,
            HandleKind::AutoEvent | HandleKind::Semaphore { .. } => {
                if self.count > 0 {
                    self.count -= 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn wake_all(&self) {
        for parker in &self.waiters {
            parker.unpark();
        }
    }
}

struct HandleInner {
    id: AtomicU64,
    state: Mutex<HandleState>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        LIVE_HANDLES.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Shared reference to a host wait object. Clones refer to the same object.
#[derive(Clone)]
pub struct WaitHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for WaitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("WaitHandle")
            .field("id", &self.handle_id())
            .field("kind", &state.kind)
            .field("count", &state.count)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

impl WaitHandle {
    fn create(kind: HandleKind, count: u32) -> SyncResult<Self> {
        reserve_handle(&LIVE_HANDLES, config::runtime().max_native_handles)?;
        SyncMetrics::inc(&global_metrics().handles_created);
        Ok(Self {
            inner: Arc::new(HandleInner {
                id: AtomicU64::new(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed)),
                state: Mutex::new(HandleState {
                    kind,
                    count,
                    waiters: Vec::new(),
                }),
            }),
        })
    }

    /// Unsignaled auto-reset event.
    pub fn auto_event() -> SyncResult<Self> {
        Self::create(HandleKind::AutoEvent, 0)
    }

    pub fn manual_event(signaled: bool) -> SyncResult<Self> {
        Self::create(HandleKind::ManualEvent, u32::from(signaled))
    }

    pub fn semaphore(initial: u32, max: u32) -> SyncResult<Self> {
        if initial > max {
            return Err(SyncError::InvalidArgument("semaphore value above maximum"));
        }
        Self::create(HandleKind::Semaphore { max }, initial)
    }

    /// Host identity. Changes when the handle is rebuilt after fork.
    #[must_use]
    pub fn handle_id(&self) -> u64 {
        self.inner.id.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn kind(&self) -> HandleKind {
        self.inner.state.lock().kind
    }

    /// Signal an event. On a semaphore this releases one unit, saturating.
    pub fn set(&self) {
        let mut state = self.inner.state.lock();
        match state.kind {
            HandleKind::AutoEvent | HandleKind::ManualEvent => state.count = 1,
            HandleKind::Semaphore { max } => state.count = state.count.saturating_add(1).min(max),
        }
        state.wake_all();
    }

    /// Return an event to the unsignaled state.
    pub fn reset(&self) {
        self.inner.state.lock().count = 0;
    }

    /// Release `n` semaphore units. Fails without side effect past the maximum.
    pub fn release(&self, n: u32) -> SyncResult<()> {
        let mut state = self.inner.state.lock();
        let HandleKind::Semaphore { max } = state.kind else {
            return Err(SyncError::InvalidArgument("release on an event handle"));
        };
        match state.count.checked_add(n) {
            Some(next) if next <= max => state.count = next,
            _ => return Err(SyncError::Overflow),
        }
        state.wake_all();
        Ok(())
    }

    /// Current semaphore value, or 1/0 for a signaled/unsignaled event.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.inner.state.lock().count
    }

    /// Number of threads currently registered as blocked on this handle.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }

    /// Zero-timeout wait.
    pub fn try_acquire(&self) -> bool {
        self.inner.state.lock().try_acquire()
    }

    /// Block until acquired or the deadline passes. Returns false on timeout.
    pub fn wait(&self, deadline: Option<Instant>) -> bool {
        wait_any(&[self], deadline).is_some()
    }

    fn register(&self, parker: &Arc<Parker>) {
        self.inner.state.lock().waiters.push(Arc::clone(parker));
    }

    fn unregister(&self, parker: &Arc<Parker>) {
        let mut state = self.inner.state.lock();
        if let Some(pos) = state.waiters.iter().position(|p| Arc::ptr_eq(p, parker)) {
            state.waiters.swap_remove(pos);
        }
    }

    /// Give the handle a fresh host identity in a fork child.
    ///
    /// Waiters registered by the parent's threads are dropped. With
    /// `retain_state` false the count is cleared as well. Returns false if the
    /// handle's state lock was held across the fork, in which case the handle
    /// is unusable and its owner must be discarded.
    pub(crate) fn rebuild_after_fork(&self, retain_state: bool) -> bool {
        let Some(mut state) = self.inner.state.try_lock() else {
            return false;
        };
        state.waiters.clear();
        if !retain_state {
            state.count = 0;
        }
        self.inner
            .id
            .store(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed), Ordering::Release);
        true
    }
}

fn try_any(handles: &[&WaitHandle]) -> Option<usize> {
    handles.iter().position(|h| h.try_acquire())
}

/// Wait until one of `handles` can be acquired, acquiring it.
///
/// Handles are tried in order, so an earlier handle wins when several are
/// ready. Returns the index acquired, or `None` once `deadline` passes.
pub fn wait_any(handles: &[&WaitHandle], deadline: Option<Instant>) -> Option<usize> {
    if let Some(idx) = try_any(handles) {
        return Some(idx);
    }
    let parker = current_parker();
    loop {
        parker.prepare();
        for handle in handles {
            handle.register(&parker);
        }
        let ready = try_any(handles);
        let woke = ready.is_some() || parker.park(deadline);
        for handle in handles {
            handle.unregister(&parker);
        }
        if ready.is_some() {
            return ready;
        }
        if let Some(idx) = try_any(handles) {
            return Some(idx);
        }
        if !woke {
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn auto_event_releases_one_waiter() {
        let ev = WaitHandle::auto_event().unwrap();
        assert!(!ev.try_acquire());
        ev.set();
        assert!(ev.try_acquire());
        assert!(!ev.try_acquire());
    }

    #[test]
    fn manual_event_stays_signaled_until_reset() {
        let ev = WaitHandle::manual_event(false).unwrap();
        ev.set();
        assert!(ev.try_acquire());
        assert!(ev.try_acquire());
        ev.reset();
        assert!(!ev.try_acquire());
    }

    #[test]
    fn semaphore_counts_and_refuses_overflow() {
        let sem = WaitHandle::semaphore(1, 2).unwrap();
        sem.release(1).unwrap();
        assert_eq!(sem.count(), 2);
        assert_eq!(sem.release(1), Err(SyncError::Overflow));
        assert_eq!(sem.count(), 2);
        assert!(sem.try_acquire());
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
    }

    #[test]
    fn semaphore_initial_above_max_is_rejected() {
        assert!(matches!(
            WaitHandle::semaphore(3, 2),
            Err(SyncError::InvalidArgument(_))
        ));
    }

    #[test]
    fn wait_times_out_at_deadline() {
        let ev = WaitHandle::auto_event().unwrap();
        let start = Instant::now();
        assert!(!ev.wait(Some(start + Duration::from_millis(30))));
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(ev.waiter_count(), 0);
    }

    #[test]
    fn release_from_other_thread_wakes_waiter() {
        let sem = WaitHandle::semaphore(0, 10).unwrap();
        let remote = sem.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.release(1).unwrap();
        });
        assert!(sem.wait(Some(Instant::now() + Duration::from_secs(5))));
        t.join().unwrap();
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn wait_any_prefers_earlier_handle() {
        let a = WaitHandle::manual_event(true).unwrap();
        let b = WaitHandle::manual_event(true).unwrap();
        assert_eq!(wait_any(&[&a, &b], None), Some(0));
        a.reset();
        assert_eq!(wait_any(&[&a, &b], None), Some(1));
    }

    #[test]
    fn rebuild_assigns_fresh_identity_and_optionally_clears() {
        let sem = WaitHandle::semaphore(3, 10).unwrap();
        let before = sem.handle_id();
        assert!(sem.rebuild_after_fork(true));
        assert_ne!(sem.handle_id(), before);
        assert_eq!(sem.count(), 3);
        assert!(sem.rebuild_after_fork(false));
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn budget_refuses_past_maximum() {
        let live = AtomicUsize::new(0);
        reserve_handle(&live, 2).unwrap();
        reserve_handle(&live, 2).unwrap();
        assert!(matches!(
            reserve_handle(&live, 2),
            Err(SyncError::ResourceExhausted(_))
        ));
        assert_eq!(live.load(Ordering::Relaxed), 2);
    }
}
