//! Error taxonomy for the threading primitives.
//!
//! Every public operation returns [`SyncResult`]. [`SyncError::errno`] gives
//! the POSIX error number a C-facing wrapper would hand back.

use thiserror::Error;

use crate::errno;
use crate::pthread::object::ObjectKind;

/// Which lifecycle or ownership rule an operation broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateViolation {
    /// Unlock (or condition wait) by a thread that does not own the lock.
    NotOwner,
    /// Initialization of an object that is already live.
    AlreadyInitialized,
    /// Join of a thread that was never joinable (foreign threads).
    NotJoinable,
    /// Join or detach of a thread that is already detached.
    AlreadyDetached,
    /// Join or detach of a thread another thread is already joining.
    JoinInProgress,
    /// Lock-type change on a held mutex.
    Locked,
}

impl StateViolation {
    #[must_use]
    pub const fn errno(self) -> i32 {
        match self {
            Self::NotOwner => errno::EPERM,
            Self::AlreadyInitialized | Self::Locked => errno::EBUSY,
            Self::NotJoinable | Self::AlreadyDetached | Self::JoinInProgress => errno::EINVAL,
        }
    }
}

/// Errors reported by synchronization and thread operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("invalid {0} object")]
    InvalidObject(ObjectKind),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("operation not permitted in current state: {0:?}")]
    WrongState(StateViolation),
    #[error("object is busy")]
    Busy,
    #[error("operation would block")]
    WouldBlock,
    #[error("operation would deadlock")]
    Deadlock,
    #[error("deadline expired")]
    Timeout,
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),
    #[error("value would overflow")]
    Overflow,
    #[error("interrupted by cancellation")]
    Interrupted,
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("no such thread")]
    NoSuchThread,
    #[error("object already exists")]
    Exists,
    #[error("object not found")]
    NotFound,
}

impl SyncError {
    /// POSIX errno for this error.
    #[must_use]
    pub const fn errno(&self) -> i32 {
        match self {
            Self::InvalidObject(_) | Self::InvalidArgument(_) => errno::EINVAL,
            Self::WrongState(violation) => violation.errno(),
            Self::Busy => errno::EBUSY,
            Self::WouldBlock | Self::ResourceExhausted(_) => errno::EAGAIN,
            Self::Deadlock => errno::EDEADLK,
            Self::Timeout => errno::ETIMEDOUT,
            Self::Overflow => errno::EOVERFLOW,
            Self::Interrupted => errno::EINTR,
            Self::Unsupported(_) => errno::ENOTSUP,
            Self::NoSuchThread => errno::ESRCH,
            Self::Exists => errno::EEXIST,
            Self::NotFound => errno::ENOENT,
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Collapse a result into the 0-or-errno convention of the C interface.
#[must_use]
pub fn to_errno<T>(result: &SyncResult<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(err) => err.errno(),
    }
}

/// Log and abort. Reserved for failures with no recovery path.
pub(crate) fn fatal(what: &str, err: &SyncError) -> ! {
    log::error!("frankenpthread: fatal: {what}: {err}");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_matches_posix() {
        assert_eq!(
            SyncError::InvalidObject(ObjectKind::Mutex).errno(),
            errno::EINVAL
        );
        assert_eq!(
            SyncError::WrongState(StateViolation::NotOwner).errno(),
            errno::EPERM
        );
        assert_eq!(
            SyncError::WrongState(StateViolation::AlreadyInitialized).errno(),
            errno::EBUSY
        );
        assert_eq!(
            SyncError::WrongState(StateViolation::AlreadyDetached).errno(),
            errno::EINVAL
        );
        assert_eq!(SyncError::Timeout.errno(), errno::ETIMEDOUT);
        assert_eq!(SyncError::Deadlock.errno(), errno::EDEADLK);
        assert_eq!(SyncError::NoSuchThread.errno(), errno::ESRCH);
        assert_eq!(SyncError::WouldBlock.errno(), errno::EAGAIN);
    }

    #[test]
    fn to_errno_is_zero_on_success() {
        assert_eq!(to_errno(&Ok::<(), SyncError>(())), 0);
        assert_eq!(to_errno::<()>(&Err(SyncError::Busy)), errno::EBUSY);
    }

    #[test]
    fn display_names_object_kind() {
        let msg = SyncError::InvalidObject(ObjectKind::Cond).to_string();
        assert!(msg.contains("condition variable"), "{msg}");
    }
}
