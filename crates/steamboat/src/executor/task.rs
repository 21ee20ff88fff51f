// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::clock::Clock;
use crate::error::{BoxError, CallError};
use crate::future::{CallFuture, FutureControl, TimeEvent};

/// Immutable bundle of a task and the future that will carry its outcome,
/// as stored in an executor's queue.
///
/// The item is deliberately opaque: a reject handler may re-enqueue it (for
/// example through [`TaskQueue::put`][super::TaskQueue::put]) or drop it,
/// nothing else.
pub struct TaskItem {
    call: Box<dyn ErasedCall>,
}

impl fmt::Debug for TaskItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskItem").field("id", &self.call.control().id()).finish_non_exhaustive()
    }
}

impl TaskItem {
    pub(crate) fn new<T, F>(f: F, future: Arc<CallFuture<T>>) -> Self
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, BoxError> + Send + 'static,
    {
        Self {
            call: Box::new(Call { f, future }),
        }
    }

    /// Records the moment the item was accepted into a queue.
    pub(crate) fn stamp_submitted(&self, at: Instant) {
        self.call.control().stamp(TimeEvent::SubmittedToQueue, at);
    }

    /// Fails the item's future because the named executor is shutting down.
    pub(crate) fn fail_shut_down(&self, scope: &str) {
        self.call.control().fail(CallError::shut_down(scope));
    }

    /// Runs the task on the calling thread, stamping timestamps and
    /// completing the future. Consumes the item.
    pub(crate) fn run(self, clock: &Clock) {
        self.call.run(clock);
    }
}

trait ErasedCall: Send {
    fn control(&self) -> &dyn FutureControl;
    fn run(self: Box<Self>, clock: &Clock);
}

struct Call<T, F> {
    f: F,
    future: Arc<CallFuture<T>>,
}

impl<T, F> ErasedCall for Call<T, F>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, BoxError> + Send + 'static,
{
    fn control(&self) -> &dyn FutureControl {
        self.future.as_ref()
    }

    fn run(self: Box<Self>, clock: &Clock) {
        let this = *self;
        let future = this.future;

        future.stamp(TimeEvent::ConsumedFromQueue, clock.now());
        match future.start_or_cancel() {
            Ok(true) => {}
            // The deadline supervisor (or a shutdown) already took the
            // future; the losing side simply discards the work.
            Ok(false) | Err(_) => {
                debug!(id = future.id(), "skipping task whose future was already taken");
                return;
            }
        }

        let result = catch_unwind(AssertUnwindSafe(this.f));
        future.stamp(TimeEvent::ExecutedCompletion, clock.now());
        let _ = match result {
            Ok(Ok(value)) => future.set_result(value),
            Ok(Err(error)) => future.set_failure(CallError::app(error)),
            Err(payload) => future.set_failure(CallError::app(panic_message(payload.as_ref()).into())),
        };
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("task panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("task panicked: {message}")
    } else {
        "task panicked".to_string()
    }
}
