//! POSIX threads.
//!
//! Thread lifecycle, cancellation, thread-local keys, mutexes, spinlocks,
//! condition variables, reader-writer locks, semaphores, one-time
//! initialization, and fork repair.

pub mod attr;
pub mod cancel;
pub mod cond;
pub mod fork;
pub(crate) mod internal_mutex;
pub mod mutex;
pub mod object;
pub mod once;
pub(crate) mod registry;
pub mod rwlock;
pub mod semaphore;
pub mod thread;
pub mod tls;

pub use attr::{CondAttr, MutexAttr, RwLockAttr, SchedParam, ThreadAttr};
pub use cancel::{
    PTHREAD_CANCEL_ASYNCHRONOUS, PTHREAD_CANCEL_DEFERRED, PTHREAD_CANCEL_DISABLE,
    PTHREAD_CANCEL_ENABLE,
};
pub use cond::PthreadCond;
pub use fork::{ForkOutcome, ForkReport, register_atfork};
pub use mutex::{
    MutexType, PTHREAD_MUTEX_DEFAULT, PTHREAD_MUTEX_ERRORCHECK, PTHREAD_MUTEX_NORMAL,
    PTHREAD_MUTEX_RECURSIVE, PthreadMutex, PthreadSpinlock,
};
pub use object::{ObjectKind, SyncObject, Validity, live_objects};
pub use once::PthreadOnce;
pub use registry::{RebuildCounts, RegistryKey};
pub use rwlock::PthreadRwLock;
pub use semaphore::{NamedSemaphore, OpenFlags, SEM_VALUE_MAX, Semaphore};
pub use thread::{PTHREAD_CANCELED, Pthread, ThreadLifecycle, ThreadRef};
pub use tls::PthreadKey;
