//! Reader-writer locks with writer preference.
//!
//! State lives behind a private mutex with two private condition variables,
//! one per side. New readers queue behind a waiting writer unless they
//! already hold a read, which bounds writer starvation to the reads already
//! granted. Each reading thread has a node counting its recursive reads.

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use parking_lot::Mutex;

use crate::error::{StateViolation, SyncError, SyncResult};

use super::attr::RwLockAttr;
use super::cancel::{WaitOutcome, honor_cancel};
use super::cond::CondRecord;
use super::mutex::MutexRecord;
use super::object::{ObjectHeader, ObjectKind, ObjectSlot, STATIC_DEFAULT, SyncRecord, Validity};
use super::registry::{Registry, RegistryKey};
use super::thread::{Pthread, current_owner_id};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReaderNode {
    thread: u64,
    count: u32,
}

#[derive(Debug, Default)]
struct RwState {
    waiting_readers: u32,
    waiting_writers: u32,
    writer: Option<u64>,
    readers: Vec<ReaderNode>,
}

impl RwState {
    fn reader_mut(&mut self, thread: u64) -> Option<&mut ReaderNode> {
        self.readers.iter_mut().find(|node| node.thread == thread)
    }
}

pub struct RwLockRecord {
    header: ObjectHeader,
    mtx: Arc<MutexRecord>,
    cond_readers: CondRecord,
    cond_writers: CondRecord,
    state: Mutex<RwState>,
}

static RWLOCKS: OnceLock<Registry<RwLockRecord>> = OnceLock::new();

pub(crate) fn rwlocks() -> &'static Registry<RwLockRecord> {
    RWLOCKS.get_or_init(|| Registry::new(ObjectKind::RwLock))
}

/// Holds the guarding mutex; unlocks on drop, including unwinds out of a
/// canceled wait.
struct Held<'a>(&'a MutexRecord);

impl<'a> Held<'a> {
    fn lock(mtx: &'a MutexRecord) -> SyncResult<Self> {
        mtx.lock_with(None, false)?;
        Ok(Self(mtx))
    }
}

impl Drop for Held<'_> {
    fn drop(&mut self) {
        let _ = self.0.unlock();
    }
}

#[derive(Clone, Copy)]
enum Side {
    Readers,
    Writers,
}

/// Counts the caller as a waiter on one side for the guard's lifetime.
struct Waiting<'a> {
    state: &'a Mutex<RwState>,
    side: Side,
}

impl<'a> Waiting<'a> {
    fn enter(state: &'a Mutex<RwState>, side: Side) -> Self {
        let mut st = state.lock();
        match side {
            Side::Readers => st.waiting_readers += 1,
            Side::Writers => st.waiting_writers += 1,
        }
        Self { state, side }
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        let mut st = self.state.lock();
        match self.side {
            Side::Readers => st.waiting_readers -= 1,
            Side::Writers => st.waiting_writers -= 1,
        }
    }
}

impl RwLockRecord {
    fn build() -> SyncResult<Self> {
        Ok(Self {
            header: ObjectHeader::new(ObjectKind::RwLock),
            mtx: MutexRecord::private()?,
            cond_readers: CondRecord::private()?,
            cond_writers: CondRecord::private()?,
            state: Mutex::new(RwState::default()),
        })
    }

    fn create() -> SyncResult<Arc<Self>> {
        let (key, record) = rwlocks().insert_with(|_| Ok(Arc::new(Self::build()?)))?;
        record.header.set_registry_key(key.to_raw());
        Ok(record)
    }

    #[must_use]
    pub fn header(&self) -> &ObjectHeader {
        &self.header
    }

    #[must_use]
    pub fn writer(&self) -> Option<Pthread> {
        self.state.lock().writer.map(Pthread::from_raw)
    }

    /// Total read holds across all reading threads.
    #[must_use]
    pub fn reader_count(&self) -> u32 {
        self.state.lock().readers.iter().map(|n| n.count).sum()
    }

    #[must_use]
    pub fn waiting_writers(&self) -> u32 {
        self.state.lock().waiting_writers
    }

    #[must_use]
    pub fn waiting_readers(&self) -> u32 {
        self.state.lock().waiting_readers
    }

    fn read_lock(&self, deadline: Option<Instant>) -> SyncResult<()> {
        self.header.ensure_live()?;
        let me = current_owner_id();
        {
            let _held = Held::lock(&self.mtx)?;
            loop {
                {
                    let mut st = self.state.lock();
                    if let Some(node) = st.reader_mut(me) {
                        node.count = node
                            .count
                            .checked_add(1)
                            .ok_or(SyncError::ResourceExhausted("read lock recursion count"))?;
                        return Ok(());
                    }
                    if st.writer == Some(me) {
                        return Err(SyncError::Deadlock);
                    }
                    if st.writer.is_none() && st.waiting_writers == 0 {
                        st.readers.push(ReaderNode { thread: me, count: 1 });
                        return Ok(());
                    }
                }
                let _waiting = Waiting::enter(&self.state, Side::Readers);
                if self.cond_readers.wait_or_canceled(&self.mtx, deadline)?
                    == WaitOutcome::Canceled
                {
                    break;
                }
            }
        }
        // Cleanup handlers run with the internal mutex released and the
        // waiter uncounted.
        Err(honor_cancel())
    }

    fn try_read_lock(&self) -> SyncResult<()> {
        self.header.ensure_live()?;
        let me = current_owner_id();
        let _held = Held::lock(&self.mtx)?;
        let mut st = self.state.lock();
        if let Some(node) = st.reader_mut(me) {
            node.count = node
                .count
                .checked_add(1)
                .ok_or(SyncError::ResourceExhausted("read lock recursion count"))?;
            return Ok(());
        }
        if st.writer.is_some() || st.waiting_writers > 0 {
            return Err(SyncError::Busy);
        }
        st.readers.push(ReaderNode { thread: me, count: 1 });
        Ok(())
    }

    fn write_lock(&self, deadline: Option<Instant>) -> SyncResult<()> {
        self.header.ensure_live()?;
        let me = current_owner_id();
        {
            let _held = Held::lock(&self.mtx)?;
            loop {
                {
                    let mut st = self.state.lock();
                    if st.writer == Some(me) || st.reader_mut(me).is_some() {
                        return Err(SyncError::Deadlock);
                    }
                    if st.writer.is_none() && st.readers.is_empty() {
                        st.writer = Some(me);
                        return Ok(());
                    }
                }
                let waited = {
                    let _waiting = Waiting::enter(&self.state, Side::Writers);
                    self.cond_writers.wait_or_canceled(&self.mtx, deadline)
                };
                match waited {
                    Ok(WaitOutcome::Canceled) => {
                        self.admit_readers_if_unblocked()?;
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        self.admit_readers_if_unblocked()?;
                        return Err(err);
                    }
                }
            }
        }
        Err(honor_cancel())
    }

    /// A writer that gave up (deadline or cancellation) may have been the
    /// only thing holding readers back.
    fn admit_readers_if_unblocked(&self) -> SyncResult<()> {
        let wake = {
            let st = self.state.lock();
            st.writer.is_none() && st.waiting_writers == 0 && st.waiting_readers > 0
        };
        if wake {
            self.cond_readers.unblock(true)?;
        }
        Ok(())
    }

    fn try_write_lock(&self) -> SyncResult<()> {
        self.header.ensure_live()?;
        let me = current_owner_id();
        let _held = Held::lock(&self.mtx)?;
        let mut st = self.state.lock();
        if st.writer.is_some() || !st.readers.is_empty() {
            return Err(SyncError::Busy);
        }
        st.writer = Some(me);
        Ok(())
    }

    fn unlock(&self) -> SyncResult<()> {
        self.header.ensure_live()?;
        let me = current_owner_id();
        let _held = Held::lock(&self.mtx)?;
        let (wake_writer, wake_readers) = {
            let mut st = self.state.lock();
            if let Some(writer) = st.writer {
                if writer != me {
                    return Err(SyncError::WrongState(StateViolation::NotOwner));
                }
                st.writer = None;
            } else {
                let pos = st
                    .readers
                    .iter()
                    .position(|node| node.thread == me)
                    .ok_or(SyncError::WrongState(StateViolation::NotOwner))?;
                st.readers[pos].count -= 1;
                if st.readers[pos].count == 0 {
                    st.readers.swap_remove(pos);
                }
            }
            if st.waiting_writers > 0 {
                (st.readers.is_empty(), false)
            } else {
                (false, st.waiting_readers > 0)
            }
        };
        if wake_writer {
            self.cond_writers.unblock(false)?;
        } else if wake_readers {
            self.cond_readers.unblock(true)?;
        }
        Ok(())
    }

    fn teardown(&self) -> SyncResult<()> {
        self.header.ensure_live()?;
        {
            let _held = Held::lock(&self.mtx)?;
            let st = self.state.lock();
            if st.writer.is_some()
                || !st.readers.is_empty()
                || st.waiting_readers > 0
                || st.waiting_writers > 0
            {
                return Err(SyncError::Busy);
            }
            if !self.header.mark_destroyed() {
                return Err(SyncError::InvalidObject(ObjectKind::RwLock));
            }
        }
        if let Some(key) = RegistryKey::from_raw(self.header.registry_key()) {
            rwlocks().remove(key);
        }
        Ok(())
    }

    /// Fork child: waiters are gone; only the forking thread's holds remain.
    pub(crate) fn fixup_after_fork(&self, me: u64) -> bool {
        let Some(mut st) = self.state.try_lock() else {
            return false;
        };
        st.waiting_readers = 0;
        st.waiting_writers = 0;
        if st.writer != Some(me) {
            st.writer = None;
        }
        st.readers.retain(|node| node.thread == me);
        drop(st);
        self.mtx.fixup_after_fork(me)
            && self.cond_readers.fixup_after_fork()
            && self.cond_writers.fixup_after_fork()
    }
}

impl SyncRecord for RwLockRecord {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn materialize(_flavor: u8) -> SyncResult<Arc<Self>> {
        Self::create()
    }
}

/// A POSIX reader-writer lock.
pub struct PthreadRwLock {
    slot: ObjectSlot<RwLockRecord>,
}

impl PthreadRwLock {
    #[allow(clippy::declare_interior_mutable_const)]
    pub const INITIALIZER: Self = Self {
        slot: ObjectSlot::new_static(ObjectKind::RwLock, STATIC_DEFAULT),
    };

    pub fn new(_attr: &RwLockAttr) -> SyncResult<Self> {
        Ok(Self {
            slot: ObjectSlot::new_live(ObjectKind::RwLock, RwLockRecord::create()?),
        })
    }

    pub fn init(&self, _attr: &RwLockAttr) -> SyncResult<()> {
        self.slot.install(RwLockRecord::create)
    }

    pub fn read_lock(&self) -> SyncResult<()> {
        self.slot.resolve()?.read_lock(None)
    }

    pub fn timed_read_lock(&self, deadline: Instant) -> SyncResult<()> {
        self.slot.resolve()?.read_lock(Some(deadline))
    }

    pub fn try_read_lock(&self) -> SyncResult<()> {
        self.slot.try_resolve()?.try_read_lock()
    }

    pub fn write_lock(&self) -> SyncResult<()> {
        self.slot.resolve()?.write_lock(None)
    }

    pub fn timed_write_lock(&self, deadline: Instant) -> SyncResult<()> {
        self.slot.resolve()?.write_lock(Some(deadline))
    }

    pub fn try_write_lock(&self) -> SyncResult<()> {
        self.slot.try_resolve()?.try_write_lock()
    }

    /// Release the caller's write hold, or one of its read holds.
    pub fn unlock(&self) -> SyncResult<()> {
        self.slot.resolve()?.unlock()
    }

    pub fn destroy(&self) -> SyncResult<()> {
        self.slot.retire(|record| record.teardown())
    }

    /// Threads blocked in `write_lock`.
    pub fn waiting_writers(&self) -> SyncResult<u32> {
        Ok(self.slot.resolve()?.waiting_writers())
    }

    /// Threads blocked in `read_lock`.
    pub fn waiting_readers(&self) -> SyncResult<u32> {
        Ok(self.slot.resolve()?.waiting_readers())
    }

    #[must_use]
    pub fn validity(&self) -> Validity {
        self.slot.validity()
    }

    pub(crate) fn record(&self) -> SyncResult<Arc<RwLockRecord>> {
        self.slot.resolve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn rwlock() -> Arc<PthreadRwLock> {
        Arc::new(PthreadRwLock::new(&RwLockAttr::new()).unwrap())
    }

    #[test]
    fn recursive_reads_need_matching_unlocks() {
        let l = rwlock();
        l.read_lock().unwrap();
        l.read_lock().unwrap();
        l.try_read_lock().unwrap();
        let rec = l.record().unwrap();
        assert_eq!(rec.reader_count(), 3);
        assert_eq!(l.try_write_lock(), Err(SyncError::Busy));
        for _ in 0..3 {
            l.unlock().unwrap();
        }
        assert_eq!(rec.reader_count(), 0);
        assert_eq!(l.unlock(), Err(SyncError::WrongState(StateViolation::NotOwner)));
    }

    #[test]
    fn writer_relock_and_upgrade_are_deadlocks() {
        let l = rwlock();
        l.write_lock().unwrap();
        assert_eq!(l.write_lock(), Err(SyncError::Deadlock));
        assert_eq!(l.read_lock(), Err(SyncError::Deadlock));
        assert_eq!(l.try_read_lock(), Err(SyncError::Busy));
        l.unlock().unwrap();
        l.read_lock().unwrap();
        assert_eq!(l.write_lock(), Err(SyncError::Deadlock));
        l.unlock().unwrap();
    }

    #[test]
    fn unlock_by_non_owner_is_refused() {
        let l = rwlock();
        l.write_lock().unwrap();
        let remote = Arc::clone(&l);
        let r = std::thread::spawn(move || remote.unlock()).join().unwrap();
        assert_eq!(r, Err(SyncError::WrongState(StateViolation::NotOwner)));
        l.unlock().unwrap();
    }

    #[test]
    fn waiting_writer_blocks_new_readers() {
        let l = rwlock();
        l.read_lock().unwrap();
        let writer_lock = Arc::clone(&l);
        let writer = std::thread::spawn(move || {
            writer_lock.write_lock().unwrap();
            writer_lock.unlock().unwrap();
        });
        let rec = l.record().unwrap();
        while rec.waiting_writers() == 0 {
            std::thread::yield_now();
        }
        let reader_lock = Arc::clone(&l);
        let r = std::thread::spawn(move || reader_lock.try_read_lock())
            .join()
            .unwrap();
        assert_eq!(r, Err(SyncError::Busy));
        // The holder's own recursive read is still admitted.
        l.read_lock().unwrap();
        l.unlock().unwrap();
        l.unlock().unwrap();
        writer.join().unwrap();
        assert_eq!(rec.writer(), None);
    }

    #[test]
    fn timed_write_lock_times_out_and_readers_resume() {
        let l = rwlock();
        l.read_lock().unwrap();
        let remote = Arc::clone(&l);
        let r = std::thread::spawn(move || {
            remote.timed_write_lock(Instant::now() + Duration::from_millis(20))
        })
        .join()
        .unwrap();
        assert_eq!(r, Err(SyncError::Timeout));
        assert_eq!(l.record().unwrap().waiting_writers(), 0);
        let remote = Arc::clone(&l);
        std::thread::spawn(move || {
            remote.try_read_lock().unwrap();
            remote.unlock().unwrap();
        })
        .join()
        .unwrap();
        l.unlock().unwrap();
    }

    #[test]
    fn destroy_refused_while_held() {
        let l = rwlock();
        l.read_lock().unwrap();
        assert_eq!(l.destroy(), Err(SyncError::Busy));
        l.unlock().unwrap();
        l.destroy().unwrap();
        assert_eq!(
            l.read_lock(),
            Err(SyncError::InvalidObject(ObjectKind::RwLock))
        );
    }

    #[test]
    fn static_initializer_materializes() {
        static LOCK: PthreadRwLock = PthreadRwLock::INITIALIZER;
        LOCK.write_lock().unwrap();
        assert_eq!(LOCK.validity(), Validity::Initialized);
        LOCK.unlock().unwrap();
    }
}
