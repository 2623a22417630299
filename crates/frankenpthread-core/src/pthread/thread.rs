//! Thread lifecycle: create, join, detach, exit, cancel, suspend.
//!
//! Threads map one-to-one onto host threads. Each has a [`ThreadRecord`] in
//! the thread registry; its [`Pthread`] id is the packed registry key, so an
//! id can never resolve to a later thread that reused the slot.
//!
//! Threads this crate did not create (the main thread, threads spawned
//! directly with `std::thread`) get a *foreign* record on first use. Foreign
//! records are never joinable and are removed when the host thread's
//! thread-locals are torn down.
//!
//! ```text
//! Created -> Running <-> Suspended
//!               |
//!            Exiting -> Joined | Detached
//! ```

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

use crate::config;
use crate::error::{StateViolation, SyncError, SyncResult};
use crate::host::{WaitHandle, wait_any};
use crate::metrics::{SyncMetrics, global_metrics};

use super::attr::{SchedParam, ThreadAttr};
use super::cancel::{
    CancelAction, PTHREAD_CANCEL_ASYNCHRONOUS, PTHREAD_CANCEL_DEFERRED, PTHREAD_CANCEL_DISABLE,
    PTHREAD_CANCEL_ENABLE, WaitOutcome, cancelable_wait, honor_cancel,
};
use super::mutex::OWNER_ANONYMOUS;
use super::object::{ObjectHeader, ObjectKind, Validity};
use super::registry::{Registry, RegistryKey};
use super::tls;

/// Exit value of a canceled thread.
pub const PTHREAD_CANCELED: usize = usize::MAX;

/// Thread id. [`Pthread::NULL`] names no thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
pub struct Pthread(u64);

impl Pthread {
    pub const NULL: Self = Self(0);

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadLifecycle {
    Created,
    Running,
    Suspended,
    Exiting,
    Joined,
    Detached,
}

impl ThreadLifecycle {
    const fn has_exited(self) -> bool {
        matches!(self, Self::Exiting | Self::Joined | Self::Detached)
    }
}

pub type CleanupHandler = Box<dyn FnOnce() + Send>;

struct ThreadState {
    lifecycle: ThreadLifecycle,
    joinable: bool,
    detached: bool,
    joiner: Option<Pthread>,
    retval: Option<usize>,
    cleanup: Vec<CleanupHandler>,
}

/// Unwind payload carrying the exit value out of [`exit`].
struct ThreadExit {
    value: usize,
}

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);
static CONCURRENCY: AtomicI32 = AtomicI32::new(0);

/// Backing record of a thread.
pub struct ThreadRecord {
    header: ObjectHeader,
    id: Pthread,
    foreign: bool,
    sequence: u64,
    attr: Mutex<ThreadAttr>,
    state: Mutex<ThreadState>,
    cancel_state: AtomicI32,
    cancel_type: AtomicI32,
    canceled: AtomicBool,
    cancel_event: WaitHandle,
    exit_event: WaitHandle,
    suspend_requested: AtomicBool,
    resume_event: WaitHandle,
}

static THREADS: OnceLock<Registry<ThreadRecord>> = OnceLock::new();

pub(crate) fn threads() -> &'static Registry<ThreadRecord> {
    THREADS.get_or_init(|| Registry::new(ObjectKind::Thread))
}

impl ThreadRecord {
    fn build(key: RegistryKey, attr: ThreadAttr, foreign: bool) -> SyncResult<Self> {
        let header = ObjectHeader::new(ObjectKind::Thread);
        header.set_registry_key(key.to_raw());
        Ok(Self {
            header,
            id: Pthread(key.to_raw()),
            foreign,
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            attr: Mutex::new(attr),
            state: Mutex::new(ThreadState {
                lifecycle: if foreign {
                    ThreadLifecycle::Running
                } else {
                    ThreadLifecycle::Created
                },
                joinable: !foreign && attr.is_joinable(),
                detached: foreign || !attr.is_joinable(),
                joiner: None,
                retval: None,
                cleanup: Vec::new(),
            }),
            cancel_state: AtomicI32::new(PTHREAD_CANCEL_ENABLE),
            cancel_type: AtomicI32::new(PTHREAD_CANCEL_DEFERRED),
            canceled: AtomicBool::new(false),
            cancel_event: WaitHandle::manual_event(false)?,
            exit_event: WaitHandle::manual_event(false)?,
            suspend_requested: AtomicBool::new(false),
            resume_event: WaitHandle::auto_event()?,
        })
    }

    #[must_use]
    pub fn header(&self) -> &ObjectHeader {
        &self.header
    }

    #[must_use]
    pub fn id(&self) -> Pthread {
        self.id
    }

    /// Not created by this crate.
    #[must_use]
    pub fn is_foreign(&self) -> bool {
        self.foreign
    }

    /// Process-wide creation order.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    #[must_use]
    pub fn attr(&self) -> ThreadAttr {
        *self.attr.lock()
    }

    #[must_use]
    pub fn lifecycle(&self) -> ThreadLifecycle {
        self.state.lock().lifecycle
    }

    pub(crate) fn cancel_enabled(&self) -> bool {
        self.cancel_state.load(Ordering::Acquire) == PTHREAD_CANCEL_ENABLE
    }

    pub(crate) fn cancel_pending(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    pub(crate) fn cancel_event(&self) -> &WaitHandle {
        &self.cancel_event
    }

    pub(crate) fn clear_cancel(&self) {
        self.canceled.store(false, Ordering::Release);
        self.cancel_event.reset();
    }

    pub(crate) fn swap_cancel_state(&self, state: i32) -> i32 {
        self.cancel_state.swap(state, Ordering::AcqRel)
    }

    pub(crate) fn swap_cancel_type(&self, kind: i32) -> i32 {
        self.cancel_type.swap(kind, Ordering::AcqRel)
    }

    pub(crate) fn push_cleanup(&self, handler: CleanupHandler) {
        self.state.lock().cleanup.push(handler);
    }

    pub(crate) fn pop_cleanup(&self) -> Option<CleanupHandler> {
        self.state.lock().cleanup.pop()
    }

    fn run_cleanup(&self) {
        while let Some(handler) = self.pop_cleanup() {
            handler();
        }
    }

    fn set_lifecycle_if(&self, from: ThreadLifecycle, to: ThreadLifecycle) {
        let mut state = self.state.lock();
        if state.lifecycle == from {
            state.lifecycle = to;
        }
    }

    /// Park while a suspension is requested. A deliverable cancellation
    /// ends the suspension early.
    pub(crate) fn honor_suspension(&self) {
        if !self.suspend_requested.load(Ordering::Acquire) {
            return;
        }
        self.set_lifecycle_if(ThreadLifecycle::Running, ThreadLifecycle::Suspended);
        log::debug!("thread {:?} suspended", self.id);
        while self.suspend_requested.load(Ordering::Acquire) {
            if self.cancel_enabled() {
                if self.cancel_pending() {
                    break;
                }
                wait_any(&[&self.resume_event, &self.cancel_event], None);
            } else {
                self.resume_event.wait(None);
            }
        }
        self.set_lifecycle_if(ThreadLifecycle::Suspended, ThreadLifecycle::Running);
    }

    /// Publish the exit value and wake the joiner. Idempotent.
    fn finish(&self, value: usize) {
        let detached = {
            let mut state = self.state.lock();
            if state.lifecycle.has_exited() {
                return;
            }
            state.retval = Some(value);
            state.lifecycle = ThreadLifecycle::Exiting;
            if state.detached {
                state.lifecycle = ThreadLifecycle::Detached;
            }
            state.detached
        };
        self.exit_event.set();
        log::debug!("thread {:?} exited with {value:#x}", self.id);
        if detached {
            self.retire();
        }
    }

    fn retire(&self) {
        if let Some(key) = RegistryKey::from_raw(self.header.registry_key()) {
            threads().remove(key);
        }
        self.header.mark_destroyed();
    }

    fn claim_join(&self, me: Pthread) -> SyncResult<()> {
        if self.foreign {
            return Err(SyncError::WrongState(StateViolation::NotJoinable));
        }
        let mut state = self.state.lock();
        if state.detached {
            return Err(SyncError::WrongState(StateViolation::AlreadyDetached));
        }
        if state.joiner.is_some() {
            return Err(SyncError::WrongState(StateViolation::JoinInProgress));
        }
        if !state.joinable {
            return Err(SyncError::WrongState(StateViolation::NotJoinable));
        }
        state.joiner = Some(me);
        state.joinable = false;
        Ok(())
    }

    fn release_join(&self) {
        let mut state = self.state.lock();
        state.joiner = None;
        state.joinable = true;
    }

    fn reap(&self) -> usize {
        let value = {
            let mut state = self.state.lock();
            state.lifecycle = ThreadLifecycle::Joined;
            state.retval.unwrap_or(PTHREAD_CANCELED)
        };
        self.retire();
        value
    }

    /// Fork child: only the forking thread survives.
    pub(crate) fn fixup_after_fork(&self, me: u64) -> bool {
        if self.id.0 != me {
            return false;
        }
        let Some(mut state) = self.state.try_lock() else {
            return false;
        };
        state.joiner = None;
        drop(state);
        self.suspend_requested.store(false, Ordering::Release);
        self.cancel_event.rebuild_after_fork(true)
            && self.exit_event.rebuild_after_fork(false)
            && self.resume_event.rebuild_after_fork(false)
    }
}

/// A thread, or no thread.
#[derive(Clone)]
pub enum ThreadRef {
    Null,
    Live(Arc<ThreadRecord>),
}

impl ThreadRef {
    #[must_use]
    pub fn id(&self) -> Pthread {
        match self {
            Self::Null => Pthread::NULL,
            Self::Live(record) => record.id,
        }
    }

    /// `Destroyed` for the null thread.
    #[must_use]
    pub fn validity(&self) -> Validity {
        match self {
            Self::Null => Validity::Destroyed,
            Self::Live(record) => record.header.validity(),
        }
    }

    #[must_use]
    pub fn lifecycle(&self) -> Option<ThreadLifecycle> {
        match self {
            Self::Null => None,
            Self::Live(record) => Some(record.lifecycle()),
        }
    }

    #[must_use]
    pub fn record(&self) -> Option<&Arc<ThreadRecord>> {
        match self {
            Self::Null => None,
            Self::Live(record) => Some(record),
        }
    }
}

// ---------------------------------------------------------------------------
// Current thread
// ---------------------------------------------------------------------------

struct CurrentThread(RefCell<Option<Arc<ThreadRecord>>>);

impl Drop for CurrentThread {
    fn drop(&mut self) {
        if let Some(record) = self.0.get_mut().take()
            && record.foreign
        {
            record.finish(0);
        }
    }
}

thread_local! {
    static CURRENT: CurrentThread = const { CurrentThread(RefCell::new(None)) };
}

fn adopt_foreign() -> SyncResult<Arc<ThreadRecord>> {
    let (_, record) = threads()
        .insert_with(|key| Ok(Arc::new(ThreadRecord::build(key, ThreadAttr::default(), true)?)))?;
    log::debug!("adopted foreign thread as {:?}", record.id);
    Ok(record)
}

/// The calling thread's record, adopting it on first use. `None` once the
/// thread's thread-locals are gone.
pub(crate) fn current_record() -> Option<Arc<ThreadRecord>> {
    CURRENT
        .try_with(|slot| {
            let existing = slot.0.borrow().clone();
            if existing.is_some() {
                return existing;
            }
            match adopt_foreign() {
                Ok(record) => {
                    *slot.0.borrow_mut() = Some(Arc::clone(&record));
                    Some(record)
                }
                Err(err) => {
                    log::debug!("cannot adopt foreign thread: {err}");
                    None
                }
            }
        })
        .ok()
        .flatten()
}

/// Owner id stored in mutexes for the calling thread.
pub(crate) fn current_owner_id() -> u64 {
    current_record().map_or(OWNER_ANONYMOUS, |r| r.id.0)
}

fn install_current(record: Arc<ThreadRecord>) {
    // A fresh host thread; its thread-locals exist.
    let _ = CURRENT.try_with(|slot| *slot.0.borrow_mut() = Some(record));
}

#[must_use]
pub fn current() -> ThreadRef {
    current_record().map_or(ThreadRef::Null, ThreadRef::Live)
}

#[must_use]
pub fn self_id() -> Pthread {
    current().id()
}

#[must_use]
pub fn equal(a: Pthread, b: Pthread) -> bool {
    a == b
}

#[must_use]
pub fn lookup(thread: Pthread) -> ThreadRef {
    locate(thread).map_or(ThreadRef::Null, ThreadRef::Live)
}

fn locate(thread: Pthread) -> SyncResult<Arc<ThreadRecord>> {
    RegistryKey::from_raw(thread.0)
        .and_then(|key| threads().get(key))
        .filter(|record| record.header.is_live())
        .ok_or(SyncError::NoSuchThread)
}

/// As [`locate`], but a thread that was joined or reaped after detaching
/// (and whose id is not yet reused) is a state error.
fn locate_joinable(thread: Pthread) -> SyncResult<Arc<ThreadRecord>> {
    locate(thread).map_err(|err| {
        let retired = RegistryKey::from_raw(thread.0).is_some_and(|key| threads().is_retired(key));
        if retired {
            SyncError::WrongState(StateViolation::NotJoinable)
        } else {
            err
        }
    })
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Start a thread running `start`. Its return value is the exit value.
pub fn create<F>(attr: &ThreadAttr, start: F) -> SyncResult<Pthread>
where
    F: FnOnce() -> usize + Send + 'static,
{
    let (key, record) =
        threads().insert_with(|key| Ok(Arc::new(ThreadRecord::build(key, *attr, false)?)))?;
    let stack_size = attr
        .stack_size()
        .unwrap_or(config::runtime().default_stack_size);
    let runner = Arc::clone(&record);
    let spawned = std::thread::Builder::new()
        .name(format!("pthread-{:x}", key.to_raw()))
        .stack_size(stack_size)
        .spawn(move || trampoline(runner, start));
    if let Err(err) = spawned {
        log::debug!("host thread creation failed: {err}");
        record.retire();
        return Err(SyncError::ResourceExhausted("host thread"));
    }
    SyncMetrics::inc(&global_metrics().threads_created);
    Ok(record.id)
}

fn trampoline<F>(record: Arc<ThreadRecord>, start: F)
where
    F: FnOnce() -> usize,
{
    install_current(Arc::clone(&record));
    record.set_lifecycle_if(ThreadLifecycle::Created, ThreadLifecycle::Running);
    let value = match panic::catch_unwind(AssertUnwindSafe(start)) {
        Ok(value) => {
            record.run_cleanup();
            tls::run_destructors();
            value
        }
        Err(payload) => match payload.downcast::<ThreadExit>() {
            Ok(exit) => exit.value,
            Err(payload) => {
                log::error!("thread {:?} panicked", record.id);
                record.swap_cancel_state(PTHREAD_CANCEL_DISABLE);
                // Joiners must be released even if a handler unwinds too.
                let unwound = panic::catch_unwind(AssertUnwindSafe(|| {
                    record.run_cleanup();
                    tls::run_destructors();
                }));
                if unwound.is_err() {
                    log::error!("thread {:?}: cleanup after panic did not finish", record.id);
                }
                record.finish(PTHREAD_CANCELED);
                panic::resume_unwind(payload);
            }
        },
    };
    record.finish(value);
}

/// Terminate the calling thread with `value`.
///
/// Cleanup handlers run in LIFO order, then key destructors. On a foreign
/// thread the value is published and the host thread unwinds with an opaque
/// payload.
pub fn exit(value: usize) -> ! {
    let me = current_record();
    if let Some(me) = &me {
        me.swap_cancel_state(PTHREAD_CANCEL_DISABLE);
        me.run_cleanup();
    }
    tls::run_destructors();
    if let Some(me) = me.filter(|r| r.foreign) {
        me.finish(value);
    }
    panic::resume_unwind(Box::new(ThreadExit { value }))
}

/// Wait for `thread` to exit and return its exit value.
pub fn join(thread: Pthread) -> SyncResult<usize> {
    join_until(thread, None)
}

/// [`join`] with an absolute deadline. A timeout leaves the thread joinable.
pub fn timed_join(thread: Pthread, deadline: Instant) -> SyncResult<usize> {
    join_until(thread, Some(deadline))
}

fn join_until(thread: Pthread, deadline: Option<Instant>) -> SyncResult<usize> {
    let me = self_id();
    if thread == me {
        return Err(SyncError::Deadlock);
    }
    let record = locate_joinable(thread)?;
    record.claim_join(me)?;
    match cancelable_wait(&record.exit_event, deadline, CancelAction::NoCancelSelf) {
        WaitOutcome::Signaled => Ok(record.reap()),
        WaitOutcome::TimedOut => {
            record.release_join();
            Err(SyncError::Timeout)
        }
        WaitOutcome::Canceled => {
            record.release_join();
            Err(honor_cancel())
        }
    }
}

/// Mark `thread` detached; its record is reclaimed when it exits.
pub fn detach(thread: Pthread) -> SyncResult<()> {
    let record = locate_joinable(thread)?;
    let exited = {
        let mut state = record.state.lock();
        if state.joiner.is_some() {
            return Err(SyncError::WrongState(StateViolation::JoinInProgress));
        }
        if state.detached {
            return Err(SyncError::WrongState(StateViolation::AlreadyDetached));
        }
        state.detached = true;
        state.joinable = false;
        if state.lifecycle == ThreadLifecycle::Exiting {
            state.lifecycle = ThreadLifecycle::Detached;
            true
        } else {
            false
        }
    };
    if exited {
        record.retire();
    }
    Ok(())
}

/// Request cancellation of `thread`.
///
/// The request is acted on at the target's next cancellation point while
/// its cancel state is enabled. A thread canceling itself with asynchronous
/// type acts immediately.
pub fn cancel(thread: Pthread) -> SyncResult<()> {
    let record = locate(thread)?;
    if record.lifecycle().has_exited() {
        return Ok(());
    }
    record.canceled.store(true, Ordering::Release);
    record.cancel_event.set();
    log::debug!("cancel requested for {thread:?}");
    let asynchronous = record.cancel_type.load(Ordering::Acquire) == PTHREAD_CANCEL_ASYNCHRONOUS;
    if thread == self_id() && asynchronous && record.cancel_enabled() {
        return Err(honor_cancel());
    }
    Ok(())
}

/// Suspend `thread`. A thread suspending itself parks immediately; any other
/// thread parks at its next cancellation point.
pub fn suspend(thread: Pthread) -> SyncResult<()> {
    let record = locate(thread)?;
    if record.lifecycle().has_exited() {
        return Ok(());
    }
    record.suspend_requested.store(true, Ordering::Release);
    if thread == self_id() {
        record.honor_suspension();
    }
    Ok(())
}

pub fn resume(thread: Pthread) -> SyncResult<()> {
    let record = locate(thread)?;
    if record.suspend_requested.swap(false, Ordering::AcqRel) {
        record.resume_event.set();
    }
    Ok(())
}

/// Request suspension of every other thread created by this crate.
/// Returns how many were asked.
pub fn suspend_all_except_self() -> usize {
    let me = self_id();
    let mut count = 0;
    threads().for_each(|_, record| {
        if record.id != me && !record.foreign && !record.lifecycle().has_exited() {
            record.suspend_requested.store(true, Ordering::Release);
            count += 1;
        }
    });
    count
}

pub fn resume_all() {
    threads().for_each(|_, record| {
        if record.suspend_requested.swap(false, Ordering::AcqRel) {
            record.resume_event.set();
        }
    });
}

/// Threads currently registered, foreign ones included.
#[must_use]
pub fn thread_count() -> usize {
    threads().len()
}

#[must_use]
pub fn concurrency() -> i32 {
    CONCURRENCY.load(Ordering::Relaxed)
}

/// Record a concurrency hint. Threads are one-to-one, so it has no effect.
pub fn set_concurrency(level: i32) -> SyncResult<()> {
    if level < 0 {
        return Err(SyncError::InvalidArgument("concurrency level"));
    }
    CONCURRENCY.store(level, Ordering::Relaxed);
    Ok(())
}

pub fn sched_param(thread: Pthread) -> SyncResult<(i32, SchedParam)> {
    let attr = locate(thread)?.attr();
    Ok((attr.sched_policy(), attr.sched_param()))
}

pub fn set_sched_param(thread: Pthread, policy: i32, param: SchedParam) -> SyncResult<()> {
    let record = locate(thread)?;
    let mut attr = record.attr.lock();
    let mut next = *attr;
    next.set_sched_policy(policy)?;
    next.set_sched_param(param)?;
    *attr = next;
    Ok(())
}

/// Creation-order sequence number of `thread`.
pub fn sequence_number(thread: Pthread) -> SyncResult<u64> {
    Ok(locate(thread)?.sequence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pthread::attr::{PTHREAD_CREATE_DETACHED, SCHED_RR};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn spawn(f: impl FnOnce() -> usize + Send + 'static) -> Pthread {
        create(&ThreadAttr::default(), f).unwrap()
    }

    #[test]
    fn join_returns_value_and_reaps() {
        let t = spawn(|| 7);
        assert_eq!(join(t), Ok(7));
        // Either retired or, if the slot was reused meanwhile, gone.
        assert!(join(t).is_err());
        assert!(matches!(lookup(t), ThreadRef::Null));
    }

    #[test]
    fn join_self_is_deadlock() {
        assert_eq!(join(self_id()), Err(SyncError::Deadlock));
    }

    #[test]
    fn exit_runs_cleanup_lifo_and_sets_value() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&order);
        let t = spawn(move || {
            for i in 0..3 {
                let seen = Arc::clone(&seen);
                crate::pthread::cancel::push_cleanup(move || seen.lock().push(i)).unwrap();
            }
            exit(99)
        });
        assert_eq!(join(t), Ok(99));
        assert_eq!(*order.lock(), vec![2, 1, 0]);
    }

    #[test]
    fn detached_thread_cannot_be_joined() {
        let gate = WaitHandle::manual_event(false).unwrap();
        let release = gate.clone();
        let t = spawn(move || {
            release.wait(None);
            0
        });
        detach(t).unwrap();
        assert_eq!(
            detach(t),
            Err(SyncError::WrongState(StateViolation::AlreadyDetached))
        );
        assert_eq!(
            join(t),
            Err(SyncError::WrongState(StateViolation::AlreadyDetached))
        );
        gate.set();
    }

    #[test]
    fn created_detached_reaps_itself() {
        let mut attr = ThreadAttr::default();
        attr.set_detach_state(PTHREAD_CREATE_DETACHED).unwrap();
        let done = WaitHandle::manual_event(false).unwrap();
        let signal = done.clone();
        let t = create(&attr, move || {
            signal.set();
            0
        })
        .unwrap();
        assert!(done.wait(Some(Instant::now() + Duration::from_secs(5))));
        let deadline = Instant::now() + Duration::from_secs(5);
        while !matches!(lookup(t), ThreadRef::Null) && Instant::now() < deadline {
            std::thread::yield_now();
        }
        assert!(matches!(lookup(t), ThreadRef::Null));
    }

    #[test]
    fn cancel_interrupts_blocked_wait() {
        let never = WaitHandle::auto_event().unwrap();
        let started = WaitHandle::manual_event(false).unwrap();
        let ready = started.clone();
        let t = spawn(move || {
            ready.set();
            cancelable_wait(&never, None, CancelAction::CancelSelf);
            0
        });
        started.wait(None);
        cancel(t).unwrap();
        assert_eq!(join(t), Ok(PTHREAD_CANCELED));
    }

    #[test]
    fn timed_join_times_out_then_joins() {
        let gate = WaitHandle::manual_event(false).unwrap();
        let release = gate.clone();
        let t = spawn(move || {
            release.wait(None);
            5
        });
        assert_eq!(
            timed_join(t, Instant::now() + Duration::from_millis(20)),
            Err(SyncError::Timeout)
        );
        gate.set();
        assert_eq!(join(t), Ok(5));
    }

    #[test]
    fn suspend_parks_at_next_cancellation_point() {
        let progress = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let (counter, halt) = (Arc::clone(&progress), Arc::clone(&stop));
        let t = spawn(move || {
            while !halt.load(Ordering::SeqCst) {
                crate::pthread::cancel::test_cancel().unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                std::thread::yield_now();
            }
            0
        });
        suspend(t).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        let parked_at = progress.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(progress.load(Ordering::SeqCst), parked_at);
        assert_eq!(lookup(t).lifecycle(), Some(ThreadLifecycle::Suspended));
        stop.store(true, Ordering::SeqCst);
        resume(t).unwrap();
        assert_eq!(join(t), Ok(0));
    }

    #[test]
    fn foreign_thread_is_adopted_and_not_joinable() {
        let (id, seq) = std::thread::spawn(|| {
            let me = current();
            let record = me.record().unwrap();
            assert!(record.is_foreign());
            (me.id(), record.sequence())
        })
        .join()
        .unwrap();
        assert!(!id.is_null());
        assert!(seq > 0);
        // Torn down with the host thread.
        assert!(matches!(lookup(id), ThreadRef::Null));
        assert!(join(id).is_err());
    }

    #[test]
    fn sched_param_validated() {
        let me = self_id();
        set_sched_param(me, SCHED_RR, SchedParam { priority: 10 }).unwrap();
        assert_eq!(sched_param(me).unwrap().1.priority, 10);
        assert!(set_sched_param(me, 42, SchedParam::default()).is_err());
        assert_eq!(sched_param(me).unwrap().0, SCHED_RR);
    }

    #[test]
    fn concurrency_hint_round_trips() {
        assert!(set_concurrency(-1).is_err());
        set_concurrency(4).unwrap();
        assert_eq!(concurrency(), 4);
        set_concurrency(0).unwrap();
    }

    #[test]
    fn equal_compares_ids() {
        assert!(equal(self_id(), self_id()));
        assert!(!equal(self_id(), Pthread::NULL));
    }
}
