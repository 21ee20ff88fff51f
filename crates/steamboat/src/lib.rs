// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Reliability sidecar for remote or expensive calls made by a single
//! process.
//!
//! Steamboat combines three mechanisms into one facility:
//!
//! - a bounded worker pool ([`executor`]) that runs submitted tasks with
//!   admission control,
//! - a circuit-breaker window ([`window`]) observing success, failure,
//!   timeout and rejection statistics to shed load from a failing
//!   downstream,
//! - a supervisor ([`SteamBoat`]) routing tasks to named breakers
//!   ([`Cabin`]s) and invoking user-supplied [`Degradation`] callbacks when
//!   a call is short-circuited, timed out, rejected or fails.
//!
//! Results travel through [`CallFuture`]s: single-assignment slots with
//! done-callbacks and a start-or-cancel arbiter that decides races between
//! the worker executing a task and the cabin's deadline supervisor.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use steamboat::executor::{QueueFull, ThreadPoolExecutor, ThreadPoolOptions, reject_with};
//! use steamboat::{BoxError, CabinBuilder, Clock, Executor, SteamBoat};
//!
//! // One worker pool, shared by every cabin.
//! let executor = Arc::new(ThreadPoolExecutor::new(
//!     ThreadPoolOptions::new(3, 6).name("remote-calls"),
//!     reject_with(|queue| QueueFull { capacity: queue.capacity() }),
//!     Clock::new(),
//! ));
//!
//! // A breaker for one logical downstream.
//! let cabin = CabinBuilder::new()
//!     .name("inventory")
//!     .executor(Arc::clone(&executor) as Arc<dyn Executor>)
//!     .timeout(Duration::from_millis(500))
//!     .open_length(Duration::from_secs(10))
//!     .closed_length(Duration::from_secs(2))
//!     .half_open_length(Duration::from_secs(3))
//!     .failure_ratio_threshold(0.8)
//!     .failure_count_threshold(5)
//!     .half_failure_count_threshold(2)
//!     .build()
//!     .expect("valid configuration");
//!
//! // Route calls by name; degradation handlers are optional.
//! let router: SteamBoat<String> = SteamBoat::new();
//! router.add_cabin(cabin.clone(), None, false).expect("fresh name");
//!
//! let future = router
//!     .submit("inventory", || Ok::<_, BoxError>("stock level".to_string()))
//!     .expect("known cabin");
//! println!("{:?}", future.result(Duration::from_secs(5)));
//!
//! cabin.shutdown(Some(Duration::from_secs(1)));
//! executor.shutdown(Some(Duration::from_secs(1)));
//! ```
//!
//! # Concurrency model
//!
//! One OS thread per pool worker, one supervisor thread per cabin, caller
//! threads perform submission. Timeouts are enforced by the supervisor, not
//! the executor: a task that already started executing is never preempted.
//! Its caller-visible future fails with
//! [`TimeoutReached`][CallError::TimeoutReached] and the eventual result is
//! discarded, but the task occupies its worker until it returns. This is an
//! acknowledged limitation of the design.
//!
//! No lock is held while user code (tasks, done-callbacks, reject handlers,
//! degradation methods) runs.

pub mod cabin;
mod clock;
mod constants;
mod degradation;
mod error;
pub mod executor;
mod future;
mod rnd;
mod slow_call;
mod steamboat;
pub mod window;

pub use cabin::{Cabin, CabinBuildError, CabinBuilder};
pub use clock::Clock;
#[cfg(any(test, feature = "test-util"))]
pub use clock::ClockControl;
pub use degradation::{Degradation, SharedCall};
pub use error::{BoxError, CallError, StateError};
pub use executor::{Executor, ExecutorExt};
pub use future::{CallFuture, CallOutcome, Phase, TimeEvent, TimeInfo};
pub use slow_call::{SlowCallGuard, SlowCallRecorder};
pub use steamboat::{SteamBoat, SteamBoatError};
