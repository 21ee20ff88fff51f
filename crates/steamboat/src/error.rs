// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Boxed error type used as the failure currency of user tasks.
///
/// Tasks submitted to an executor or a cabin return `Result<T, BoxError>`;
/// the pipeline wraps the boxed cause into [`CallError::App`] while keeping
/// it reachable through [`source()`][std::error::Error::source].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Shared cause stored inside [`CallError`] so failures stay cheap to clone.
type SharedCause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// The failure taxonomy of the crate.
///
/// Every terminal failure observed through a [`CallFuture`][crate::CallFuture]
/// is one of these tagged kinds, which is what the
/// [`SteamBoat`][crate::SteamBoat] router dispatches degradation callbacks on.
/// The type is `Clone` because a single failure may be observed by several
/// waiters and callbacks; causes are therefore stored behind `Arc`.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CallError {
    /// The executor refused admission for the task. The cause is whatever
    /// failure the rejection handler produced.
    SubmitTask(SharedCause),

    /// The named cabin's window is half open and the admission draw denied
    /// the call.
    WindowHalfOpen(Arc<str>),

    /// The named cabin's window is closed; the call was short-circuited.
    WindowClosed(Arc<str>),

    /// The cabin's deadline supervisor cancelled the task after the
    /// configured timeout elapsed.
    TimeoutReached(Duration),

    /// The named executor or cabin is shutting down or already shut down.
    ShutDown(Arc<str>),

    /// The user task returned an error (or panicked).
    App(SharedCause),

    /// The task was cancelled before it started executing.
    Cancelled,

    /// A blocking wait on a future expired before the future completed.
    /// The future itself is left untouched.
    WaitTimeout(Duration),

    /// An internal invariant was violated. Seeing this kind is a bug.
    Internal(&'static str),
}

impl CallError {
    /// Wraps a rejection cause produced by an executor's reject handler.
    pub fn submit_task(cause: BoxError) -> Self {
        Self::SubmitTask(Arc::from(cause))
    }

    /// Wraps a failure returned by a user task.
    pub fn app(cause: BoxError) -> Self {
        Self::App(Arc::from(cause))
    }

    /// Builds a [`CallError::ShutDown`] for the named executor or cabin.
    pub fn shut_down(scope: &str) -> Self {
        Self::ShutDown(Arc::from(scope))
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SubmitTask(cause) => write!(f, "executor rejected the task: {cause}"),
            Self::WindowHalfOpen(cabin) => write!(f, "window of cabin {cabin} is half open"),
            Self::WindowClosed(cabin) => write!(f, "window of cabin {cabin} is closed"),
            Self::TimeoutReached(timeout) => {
                write!(f, "task did not complete within {timeout:?}")
            }
            Self::ShutDown(scope) => write!(f, "{scope} is shut down"),
            Self::App(cause) => write!(f, "task failed: {cause}"),
            Self::Cancelled => write!(f, "task was cancelled before execution"),
            Self::WaitTimeout(waited) => {
                write!(f, "wait expired after {waited:?} before the task completed")
            }
            Self::Internal(message) => write!(f, "internal invariant violated: {message}"),
        }
    }
}

impl PartialEq for CallError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::SubmitTask(a), Self::SubmitTask(b)) => a.to_string() == b.to_string(),
            (Self::WindowHalfOpen(a), Self::WindowHalfOpen(b)) => a == b,
            (Self::WindowClosed(a), Self::WindowClosed(b)) => a == b,
            (Self::TimeoutReached(a), Self::TimeoutReached(b)) => a == b,
            (Self::ShutDown(a), Self::ShutDown(b)) => a == b,
            (Self::App(a), Self::App(b)) => a.to_string() == b.to_string(),
            (Self::Cancelled, Self::Cancelled) => true,
            (Self::WaitTimeout(a), Self::WaitTimeout(b)) => a == b,
            (Self::Internal(a), Self::Internal(b)) => a == b,
            _ => false,
        }
    }
}

impl std::error::Error for CallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SubmitTask(cause) | Self::App(cause) => Some(cause.as_ref()),
            _ => None,
        }
    }
}

/// Errors raised by the transition protocol of a
/// [`CallFuture`][crate::CallFuture].
///
/// These are consumed internally by the worker/supervisor arbitration and
/// almost never surface to callers of the high level API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    /// A terminal transition was attempted on a future that already reached
    /// a terminal state.
    #[error("future already reached a terminal state")]
    AlreadyTerminal,

    /// The future is not in a state that permits the requested transition.
    #[error("future is not pending")]
    InvalidState,
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn assert_types() {
        static_assertions::assert_impl_all!(CallError: Send, Sync, Clone);
        static_assertions::assert_impl_all!(StateError: Send, Sync, Copy);
    }

    #[test]
    fn app_error_preserves_cause() {
        let error = CallError::app("downstream unavailable".into());

        assert_eq!(error.to_string(), "task failed: downstream unavailable");
        assert_eq!(error.source().expect("cause").to_string(), "downstream unavailable");
    }

    #[test]
    fn submit_task_preserves_cause() {
        let error = CallError::submit_task(Box::new(std::io::Error::other("queue full")));

        assert_eq!(error.to_string(), "executor rejected the task: queue full");
        assert!(error.source().is_some());
    }

    #[test]
    fn display_names_the_cabin() {
        assert_eq!(
            CallError::WindowClosed(Arc::from("payments")).to_string(),
            "window of cabin payments is closed"
        );
        assert_eq!(
            CallError::WindowHalfOpen(Arc::from("payments")).to_string(),
            "window of cabin payments is half open"
        );
        assert_eq!(CallError::shut_down("pool-1").to_string(), "pool-1 is shut down");
    }

    #[test]
    fn cloned_error_shares_the_cause() {
        let error = CallError::app("boom".into());
        let clone = error.clone();

        match (&error, &clone) {
            (CallError::App(a), CallError::App(b)) => assert!(Arc::ptr_eq(a, b)),
            _ => unreachable!(),
        }
    }
}
