//! # frankenpthread-core
//!
//! POSIX threads and synchronization primitives built on host wait objects.
//!
//! This crate provides pthread-style mutexes, condition variables, reader-writer
//! locks, semaphores, thread lifecycle and cancellation, and process-duplication
//! (fork) repair of every live object. The host layer ([`host`]) models kernel
//! wait objects (auto/manual events and counting semaphores); every primitive is
//! expressed in terms of those objects plus atomics.
//!
//! Unsafe code is denied at the crate level. The two modules that need it
//! (the fork latch in the registry, and the `fork` call itself) opt in locally.

#![deny(unsafe_code)]

pub mod config;
pub mod errno;
pub mod error;
pub mod host;
pub mod metrics;
pub mod pthread;

pub use error::{StateViolation, SyncError, SyncResult};
pub use pthread::{
    Pthread, PthreadCond, PthreadKey, PthreadMutex, PthreadOnce, PthreadRwLock, PthreadSpinlock,
    Semaphore, PTHREAD_CANCELED,
};
