// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;

use crate::error::{BoxError, CallError};

/// A task as the router shares it with degradation callbacks: re-invocable,
/// cheap to clone, safe to call from any thread.
pub type SharedCall<T> = Arc<dyn Fn() -> Result<T, BoxError> + Send + Sync>;

/// User-supplied fallback behavior invoked by the
/// [`SteamBoat`][crate::SteamBoat] router when a call fails.
///
/// Exactly one method is invoked per failed call, matched on the failure's
/// tagged kind; see the router documentation for the dispatch table. Every
/// method receives the original task so the fallback may retry it, consult
/// its arguments or ignore it and produce a substitute value.
///
/// Degradation callbacks run through the same cabin as the failed call, so
/// they are themselves circuit-broken. A failure inside a degradation
/// callback becomes the final failure of the outer call; it never triggers
/// another degradation.
pub trait Degradation<T>: Send + Sync {
    /// The executor refused admission for the call.
    fn on_submit_task_error(&self, cause: &CallError, task: &SharedCall<T>) -> Result<T, BoxError>;

    /// The cabin's window was half open and the admission draw denied the
    /// call.
    fn on_window_half_open(&self, task: &SharedCall<T>) -> Result<T, BoxError>;

    /// The cabin's window was closed; the call was short-circuited.
    fn on_window_closed(&self, task: &SharedCall<T>) -> Result<T, BoxError>;

    /// The call timed out under the cabin's deadline supervisor.
    fn on_timeout_reached(&self, task: &SharedCall<T>) -> Result<T, BoxError>;

    /// The call failed in any other way (typically a task failure).
    fn on_exception(&self, error: &CallError, task: &SharedCall<T>) -> Result<T, BoxError>;
}
