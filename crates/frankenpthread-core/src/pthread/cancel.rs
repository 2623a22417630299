//! Cancellation state, cancellation-aware waits and cleanup handlers.
//!
//! Every blocking operation waits through [`cancelable_wait`], which races the
//! primary handle against the calling thread's cancellation event. Deferred
//! and asynchronous cancellation are both delivered there and at
//! [`test_cancel`]; a thread running pure computation is not interrupted.
//!
//! Honoring a cancellation on a thread created by this crate runs its cleanup
//! handlers and unwinds it with [`PTHREAD_CANCELED`](super::PTHREAD_CANCELED).
//! Threads the crate did not create cannot be unwound on its behalf, so they
//! see [`SyncError::Interrupted`] instead.

use std::time::Instant;

use crate::error::{SyncError, SyncResult};
use crate::host::{WaitHandle, wait_any};
use crate::metrics::{SyncMetrics, global_metrics};

use super::thread::{self, PTHREAD_CANCELED, current_record};

pub const PTHREAD_CANCEL_ENABLE: i32 = 0;
pub const PTHREAD_CANCEL_DISABLE: i32 = 1;
pub const PTHREAD_CANCEL_DEFERRED: i32 = 0;
pub const PTHREAD_CANCEL_ASYNCHRONOUS: i32 = 1;

/// What a wait does when it observes a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelAction {
    /// Honor it from inside the wait.
    CancelSelf,
    /// Report [`WaitOutcome::Canceled`] so the caller can undo its
    /// registration before honoring it.
    NoCancelSelf,
    /// Not a cancellation point.
    NoCancel,
}

/// Why a cancelable wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Signaled,
    TimedOut,
    /// Under `CancelSelf` this is only seen by threads the crate did not
    /// create.
    Canceled,
}

/// Wait on `handle` until it is acquired, `deadline` passes, or the calling
/// thread is canceled. A pending suspension is honored first.
pub fn cancelable_wait(
    handle: &WaitHandle,
    deadline: Option<Instant>,
    action: CancelAction,
) -> WaitOutcome {
    let me = current_record();
    if let Some(me) = &me {
        me.honor_suspension();
    }
    let canceler = me
        .as_ref()
        .filter(|r| action != CancelAction::NoCancel && r.cancel_enabled());
    let outcome = match canceler {
        None => {
            if handle.wait(deadline) {
                WaitOutcome::Signaled
            } else {
                WaitOutcome::TimedOut
            }
        }
        Some(r) if r.cancel_pending() => WaitOutcome::Canceled,
        Some(r) => match wait_any(&[handle, r.cancel_event()], deadline) {
            Some(0) => WaitOutcome::Signaled,
            Some(_) => WaitOutcome::Canceled,
            None => WaitOutcome::TimedOut,
        },
    };
    if outcome == WaitOutcome::Canceled && action == CancelAction::CancelSelf {
        // Returns only on a foreign thread.
        let _ = honor_cancel();
    }
    outcome
}

/// Act on a delivered cancellation.
///
/// On a created thread this does not return: cleanup handlers and key
/// destructors run and the thread exits with `PTHREAD_CANCELED`. On a foreign
/// thread the request is consumed and `Interrupted` is returned for the
/// caller to propagate.
pub(crate) fn honor_cancel() -> SyncError {
    SyncMetrics::inc(&global_metrics().cancellations);
    match current_record() {
        Some(me) if !me.is_foreign() => thread::exit(PTHREAD_CANCELED),
        Some(me) => {
            log::debug!("cancellation delivered to foreign thread {:?}", me.id());
            me.clear_cancel();
            SyncError::Interrupted
        }
        None => SyncError::Interrupted,
    }
}

/// Set the calling thread's cancel state, returning the previous one.
pub fn set_cancel_state(state: i32) -> SyncResult<i32> {
    if !matches!(state, PTHREAD_CANCEL_ENABLE | PTHREAD_CANCEL_DISABLE) {
        return Err(SyncError::InvalidArgument("cancel state"));
    }
    let me = current_record().ok_or(SyncError::NoSuchThread)?;
    Ok(me.swap_cancel_state(state))
}

/// Set the calling thread's cancel type, returning the previous one.
pub fn set_cancel_type(kind: i32) -> SyncResult<i32> {
    if !matches!(kind, PTHREAD_CANCEL_DEFERRED | PTHREAD_CANCEL_ASYNCHRONOUS) {
        return Err(SyncError::InvalidArgument("cancel type"));
    }
    let me = current_record().ok_or(SyncError::NoSuchThread)?;
    Ok(me.swap_cancel_type(kind))
}

/// Cancellation point with no wait attached.
pub fn test_cancel() -> SyncResult<()> {
    let Some(me) = current_record() else {
        return Ok(());
    };
    me.honor_suspension();
    if me.cancel_enabled() && me.cancel_pending() {
        return Err(honor_cancel());
    }
    Ok(())
}

/// Push a cleanup handler onto the calling thread's stack.
pub fn push_cleanup(handler: impl FnOnce() + Send + 'static) -> SyncResult<()> {
    let me = current_record().ok_or(SyncError::NoSuchThread)?;
    me.push_cleanup(Box::new(handler));
    Ok(())
}

/// Pop the most recent cleanup handler, running it if `execute`.
/// Returns whether a handler was popped.
pub fn pop_cleanup(execute: bool) -> bool {
    let Some(handler) = current_record().and_then(|me| me.pop_cleanup()) else {
        return false;
    };
    if execute {
        handler();
    }
    true
}
