// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Task execution with admission control.
//!
//! An [`Executor`] accepts type-erased [`TaskItem`]s and promises that each
//! accepted item's future eventually reaches a terminal state. The bundled
//! implementation is the [`ThreadPoolExecutor`], a bounded worker pool; the
//! typed entry point is [`ExecutorExt::submit`], which builds the
//! [`CallFuture`] for a closure and hands the erased item to the executor.
//!
//! Admission is decided in three steps: a shutting-down executor pre-fails
//! the future, a queue with room accepts the item, and a full queue defers
//! to the executor's reject handler on the submitter's thread. The handler
//! either raises a failure (a caller-visible rejection, which a cabin
//! translates into a window rejection) or places the item itself, for
//! example with the queue's blocking [`put`][TaskQueue::put].
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//!
//! use steamboat::executor::{
//!     ExecutorExt, QueueFull, ThreadPoolExecutor, ThreadPoolOptions, reject_with,
//! };
//! use steamboat::{Clock, Executor};
//!
//! let pool = ThreadPoolExecutor::new(
//!     ThreadPoolOptions::new(2, 8).name("remote-calls"),
//!     reject_with(|queue| QueueFull { capacity: queue.capacity() }),
//!     Clock::new(),
//! );
//!
//! let future = pool.submit(|| Ok::<_, steamboat::BoxError>(2 + 2)).expect("admitted");
//! assert_eq!(future.result(Duration::from_secs(5)), Ok(4));
//!
//! pool.shutdown(Some(Duration::from_secs(1)));
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::error::{BoxError, CallError};
use crate::future::CallFuture;

mod queue;
mod task;
mod thread_pool;

pub use queue::{QueueClosed, QueueFull, TaskQueue};
pub use task::TaskItem;
pub use thread_pool::{ThreadPoolExecutor, ThreadPoolOptions};

/// Decision of an executor about one submitted item.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// The item was accepted and will be picked up by a worker.
    Queued,
    /// The executor is shutting down or shut down; the item was not
    /// accepted and its future should be pre-failed.
    ShuttingDown,
    /// The reject handler raised a caller-visible rejection.
    Rejected(BoxError),
}

/// Something that executes submitted tasks.
///
/// This is a capability, not a type hierarchy: a cabin only needs the three
/// operations below and talks to the executor through `Arc<dyn Executor>`.
/// Executors are shared between cabins and shut down independently of them.
pub trait Executor: Send + Sync {
    /// Decides admission for one type-erased task item.
    ///
    /// Implementations must not invoke user callbacks while holding locks
    /// that `submit_item` itself needs.
    fn submit_item(&self, item: TaskItem) -> SubmitOutcome;

    /// Stops the executor: wakes the workers, waits up to `wait` for them
    /// to exit and fails every still-queued item with
    /// [`ShutDown`][CallError::ShutDown]. Idempotent.
    fn shutdown(&self, wait: Option<Duration>);

    /// The executor's name, used in failures and log events.
    fn name(&self) -> &str;
}

/// Typed convenience surface over [`Executor`].
pub trait ExecutorExt: Executor {
    /// Submits a closure and returns the future carrying its outcome.
    ///
    /// During shutdown the returned future is pre-failed with
    /// [`ShutDown`][CallError::ShutDown].
    ///
    /// # Errors
    ///
    /// The failure raised by the reject handler when the executor refused
    /// admission.
    fn submit<T, F>(&self, f: F) -> Result<Arc<CallFuture<T>>, BoxError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, BoxError> + Send + 'static,
    {
        let future = Arc::new(CallFuture::new());
        let item = TaskItem::new(f, Arc::clone(&future));
        match self.submit_item(item) {
            SubmitOutcome::Queued => Ok(future),
            SubmitOutcome::ShuttingDown => {
                let _ = future.set_failure(CallError::shut_down(self.name()));
                Ok(future)
            }
            SubmitOutcome::Rejected(cause) => Err(cause),
        }
    }
}

impl<E: Executor + ?Sized> ExecutorExt for E {}

/// Type of the rejection callback an executor runs when its queue is full.
///
/// The handler runs on the submitter's thread with no executor lock held.
/// Returning an error signals a caller-visible rejection; returning `Ok`
/// means the handler placed the item (or arranged for its future to be
/// completed some other way).
pub type RejectHandler = Box<dyn Fn(&TaskQueue, TaskItem) -> Result<(), BoxError> + Send + Sync>;

/// Builds a [`RejectHandler`] that drops the item and raises the failure
/// produced by `failure`.
///
/// ```
/// use steamboat::executor::{QueueFull, reject_with};
///
/// let handler = reject_with(|queue| QueueFull { capacity: queue.capacity() });
/// # let _handler = handler;
/// ```
pub fn reject_with<E, F>(failure: F) -> RejectHandler
where
    E: Into<BoxError>,
    F: Fn(&TaskQueue) -> E + Send + Sync + 'static,
{
    Box::new(move |queue, item| {
        drop(item);
        Err(failure(queue).into())
    })
}
