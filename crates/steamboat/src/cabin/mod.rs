// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Named circuit breaker wrapping a shared executor.
//!
//! A [`Cabin`] gates calls through its [`Window`], submits admitted tasks
//! to an [`Executor`] and enforces a per-task deadline with a dedicated
//! supervisor thread. The cabin owns its window and supervisor; it does
//! **not** own the executor, which is shared between cabins and shut down
//! independently.
//!
//! Call flow for an admitted task: the window classifies the call, the
//! executor queues it, the cabin assigns `now + timeout` as the deadline
//! and parks the call in a min-heap ordered by `(deadline, id)`. Whichever
//! of worker and supervisor claims the cabin-side future first completes
//! the call; the loser backs off through the
//! [`start_or_cancel`][crate::CallFuture::start_or_cancel] arbiter.
//!
//! The timeout does not preempt a task that already started executing: the
//! supervisor completes the caller-visible future with
//! [`TimeoutReached`][CallError::TimeoutReached] and the worker's eventual
//! result is discarded, but the task keeps occupying its worker until it
//! returns. Cancellation only stops tasks still waiting in the queue.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use steamboat::executor::{QueueFull, ThreadPoolExecutor, ThreadPoolOptions, reject_with};
//! use steamboat::{CabinBuilder, Clock};
//!
//! let executor = Arc::new(ThreadPoolExecutor::new(
//!     ThreadPoolOptions::new(3, 6),
//!     reject_with(|queue| QueueFull { capacity: queue.capacity() }),
//!     Clock::new(),
//! ));
//!
//! let cabin = CabinBuilder::new()
//!     .name("inventory")
//!     .executor(executor)
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
//! let future = cabin.execute(|| Ok::<_, steamboat::BoxError>("stock level"));
//! println!("{:?}", future.result(Duration::from_secs(5)));
//! cabin.shutdown(Some(Duration::from_secs(1)));
//! ```

use std::collections::BinaryHeap;
use std::fmt;
use std::mem;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info};

use crate::clock::Clock;
use crate::constants::ERR_POISONED_LOCK;
use crate::error::{BoxError, CallError};
use crate::executor::{Executor, ExecutorExt};
use crate::future::{CallFuture, FutureControl, Phase, TimeEvent};
use crate::rnd::Rnd;
use crate::window::{TaskOutcome, Window, WindowOptions, WindowStatus};

mod flight;
mod supervisor;

use flight::Flight;

/// Configuration failure reported by [`CabinBuilder::build`].
#[derive(Debug, thiserror::Error)]
pub enum CabinBuildError {
    /// A required option was not provided.
    #[error("missing required option {0}")]
    MissingOption(&'static str),
    /// `half_open_probability` lies outside `[0, 1]`.
    #[error("half_open_probability must lie within [0, 1], got {0}")]
    InvalidProbability(f64),
    /// `failure_ratio_threshold` lies outside `[0, 1]`.
    #[error("failure_ratio_threshold must lie within [0, 1], got {0}")]
    InvalidRatio(f64),
}

pub(crate) struct CabinState {
    pending: BinaryHeap<Flight>,
    completed: usize,
    shutdown: bool,
    supervisor_exited: bool,
}

pub(crate) struct CabinCore {
    pub(crate) name: Arc<str>,
    executor: Arc<dyn Executor>,
    pub(crate) timeout: Duration,
    pub(crate) window: Window,
    half_open_probability: f64,
    rnd: Rnd,
    pub(crate) clock: Clock,
    pub(crate) state: Mutex<CabinState>,
    pub(crate) signal: Condvar,
}

/// A named circuit breaker wrapping an [`Executor`] for one logical
/// downstream.
///
/// `Cabin` is a cheap handle: cloning shares the underlying breaker. See
/// the [module documentation][self] for the call flow and an example;
/// construction goes through [`CabinBuilder`].
#[derive(Clone)]
pub struct Cabin {
    core: Arc<CabinCore>,
}

impl fmt::Debug for Cabin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cabin")
            .field("name", &self.core.name)
            .field("timeout", &self.core.timeout)
            .finish_non_exhaustive()
    }
}

impl Cabin {
    /// The cabin's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// The cabin's window, for observation.
    #[must_use]
    pub fn window(&self) -> &Window {
        &self.core.window
    }

    /// Gates `f` through the window and runs it on the executor under this
    /// cabin's timeout.
    ///
    /// The returned future always reaches a terminal state: short-circuited
    /// calls come back pre-failed with
    /// [`WindowClosed`][CallError::WindowClosed],
    /// [`WindowHalfOpen`][CallError::WindowHalfOpen],
    /// [`SubmitTask`][CallError::SubmitTask] or
    /// [`ShutDown`][CallError::ShutDown]; admitted calls complete with the
    /// task's outcome or [`TimeoutReached`][CallError::TimeoutReached].
    pub fn execute<T, F>(&self, f: F) -> Arc<CallFuture<T>>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Result<T, BoxError> + Send + 'static,
    {
        let core = &self.core;
        let cabin_future = Arc::new(CallFuture::new());

        if core.is_shut_down() {
            let _ = cabin_future.set_failure(CallError::shut_down(&core.name));
            return cabin_future;
        }

        let now = core.clock.now();
        match core.window.status_at(now) {
            // A clock anomaly was already logged by the window; the call
            // proceeds unclassified.
            None => {}
            Some(WindowStatus::Open) => {}
            Some(WindowStatus::Closed) => {
                let _ = cabin_future.set_failure(CallError::WindowClosed(Arc::clone(&core.name)));
                return cabin_future;
            }
            Some(WindowStatus::HalfOpen) => {
                if !core.admit_half_open() {
                    let _ =
                        cabin_future.set_failure(CallError::WindowHalfOpen(Arc::clone(&core.name)));
                    return cabin_future;
                }
            }
        }
        cabin_future.stamp(TimeEvent::EnteredCabin, now);

        let executor_future = match core.executor.submit(f) {
            Ok(future) => future,
            Err(cause) => {
                core.window.record(now, TaskOutcome::Rejection);
                let _ = cabin_future.set_failure(CallError::submit_task(cause));
                return cabin_future;
            }
        };

        let deadline = now + core.timeout;
        executor_future.set_deadline(deadline);
        {
            let mut state = core.state.lock().expect(ERR_POISONED_LOCK);
            if state.shutdown {
                // Shutdown won the race after the executor accepted the
                // task. The executor future continues its own lifecycle;
                // its done-callback below will find this future taken.
                drop(state);
                if let Ok(true) = cabin_future.start_or_cancel() {
                    let _ = cabin_future.set_failure(CallError::shut_down(&core.name));
                }
                return cabin_future;
            }
            let flight = Flight {
                deadline,
                id: executor_future.id(),
                executor_future: Arc::clone(&executor_future) as Arc<dyn FutureControl>,
                cabin_future: Arc::clone(&cabin_future) as Arc<dyn FutureControl>,
            };
            let id = flight.id;
            state.pending.push(flight);
            if state.pending.peek().map(|top| top.id) == Some(id) {
                core.signal.notify_all();
            }
        }

        let callback_core = Arc::clone(core);
        let callback_future = Arc::clone(&cabin_future);
        executor_future
            .add_done_callback(move |finished| callback_core.on_executor_done(finished, &callback_future));

        cabin_future
    }

    /// Stops the cabin: fails every supervised pending task with
    /// [`ShutDown`][CallError::ShutDown] and waits up to `wait` for the
    /// supervisor thread to exit. Idempotent.
    pub fn shutdown(&self, wait: Option<Duration>) {
        let core = &self.core;
        let flights = {
            let mut state = core.state.lock().expect(ERR_POISONED_LOCK);
            let flights = if state.shutdown {
                Vec::new()
            } else {
                state.shutdown = true;
                info!(cabin = %core.name, "cabin shutting down");
                mem::take(&mut state.pending).into_vec()
            };
            core.signal.notify_all();
            flights
        };

        // Claim each pending executor future so workers discard the task,
        // then fail it; the regular done-callback completes the cabin side
        // without touching the window.
        for flight in flights {
            if let Ok(true) = flight.executor_future.claim() {
                flight.executor_future.fail(CallError::shut_down(&core.name));
            }
        }

        let mut state = core.state.lock().expect(ERR_POISONED_LOCK);
        match wait {
            None => {
                while !state.supervisor_exited {
                    state = core.signal.wait(state).expect(ERR_POISONED_LOCK);
                }
            }
            Some(wait) => {
                let deadline = Instant::now() + wait;
                while !state.supervisor_exited {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    let (guard, _) = core
                        .signal
                        .wait_timeout(state, deadline - now)
                        .expect(ERR_POISONED_LOCK);
                    state = guard;
                }
            }
        }
    }
}

impl CabinCore {
    fn is_shut_down(&self) -> bool {
        self.state.lock().expect(ERR_POISONED_LOCK).shutdown
    }

    fn admit_half_open(&self) -> bool {
        if self.half_open_probability <= 0.0 {
            false
        } else if self.half_open_probability >= 1.0 {
            true
        } else {
            self.rnd.next_f64() <= self.half_open_probability
        }
    }

    /// Done-callback registered on every executor future: classifies the
    /// finished task into the window and completes the cabin future, unless
    /// the supervisor (or shutdown) already owns the call.
    fn on_executor_done<T: Clone + Send + 'static>(
        &self,
        finished: &CallFuture<T>,
        cabin_future: &Arc<CallFuture<T>>,
    ) {
        match cabin_future.start_or_cancel() {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                self.bump_completed();
                return;
            }
        }

        let now = self.clock.now();
        cabin_future.merge_time_info(&finished.time_info());
        cabin_future.stamp(TimeEvent::LeftCabin, now);

        if finished.phase() == Phase::Cancelled {
            // Cancellation is consumed by the deadline supervisor before
            // the cabin future can be claimed here.
            let _ = cabin_future
                .set_failure(CallError::Internal("cancelled task reached the cabin callback"));
            error!(cabin = %self.name, id = finished.id(), "cancelled task reached the cabin callback");
        } else {
            match finished.cloned_outcome() {
                Some(Ok(value)) => {
                    self.window.record(now, TaskOutcome::Success);
                    let _ = cabin_future.set_result(value);
                }
                Some(Err(error)) => {
                    // Executor shutdown is not a task failure; it leaves
                    // the window untouched.
                    if !matches!(error, CallError::ShutDown(_)) {
                        self.window.record(now, TaskOutcome::Failure);
                    }
                    let _ = cabin_future.set_failure(error);
                }
                None => {
                    let _ = cabin_future
                        .set_failure(CallError::Internal("terminal future without an outcome"));
                }
            }
        }

        self.bump_completed();
    }

    /// Counts one finished executor future and pokes the supervisor once
    /// half the heap is settled, amortizing compaction.
    fn bump_completed(&self) {
        let mut state = self.state.lock().expect(ERR_POISONED_LOCK);
        state.completed += 1;
        if state.completed as f64 / (state.pending.len() as f64 + 0.001) >= 0.5 {
            self.signal.notify_all();
        }
    }
}

/// Builder for [`Cabin`]s.
///
/// Required options: `name`, `executor`, `timeout`, the three window epoch
/// lengths and the `failure_ratio_threshold`, `failure_count_threshold` and
/// `half_failure_count_threshold` trip thresholds. Recovery thresholds and
/// the half-open probability (default 0.5) are optional.
pub struct CabinBuilder {
    name: Option<String>,
    executor: Option<Arc<dyn Executor>>,
    timeout: Option<Duration>,
    open_length: Option<Duration>,
    closed_length: Option<Duration>,
    half_open_length: Option<Duration>,
    failure_ratio_threshold: Option<f64>,
    failure_count_threshold: Option<u64>,
    half_failure_count_threshold: Option<u64>,
    recovery_ratio_threshold: Option<f64>,
    recovery_count_threshold: Option<u64>,
    half_open_probability: f64,
    clock: Clock,
    rnd: Rnd,
}

impl fmt::Debug for CabinBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CabinBuilder")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Default for CabinBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CabinBuilder {
    /// Creates a builder with every required option unset.
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: None,
            executor: None,
            timeout: None,
            open_length: None,
            closed_length: None,
            half_open_length: None,
            failure_ratio_threshold: None,
            failure_count_threshold: None,
            half_failure_count_threshold: None,
            recovery_ratio_threshold: None,
            recovery_count_threshold: None,
            half_open_probability: 0.5,
            clock: Clock::new(),
            rnd: Rnd::default(),
        }
    }

    /// Names the cabin. Required.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The executor admitted tasks run on. Required; the cabin shares it
    /// with other cabins and never shuts it down.
    #[must_use]
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Per-task deadline enforced by the supervisor. Required.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Length of the window's `Open` epochs. Required.
    #[must_use]
    pub fn open_length(mut self, length: Duration) -> Self {
        self.open_length = Some(length);
        self
    }

    /// Length of the window's `Closed` epochs. Required.
    #[must_use]
    pub fn closed_length(mut self, length: Duration) -> Self {
        self.closed_length = Some(length);
        self
    }

    /// Length of the window's `HalfOpen` epochs. Required.
    #[must_use]
    pub fn half_open_length(mut self, length: Duration) -> Self {
        self.half_open_length = Some(length);
        self
    }

    /// Failure ratio at which the window trips. Required.
    #[must_use]
    pub fn failure_ratio_threshold(mut self, ratio: f64) -> Self {
        self.failure_ratio_threshold = Some(ratio);
        self
    }

    /// Failure count gate for tripping an `Open` window. Required.
    #[must_use]
    pub fn failure_count_threshold(mut self, count: u64) -> Self {
        self.failure_count_threshold = Some(count);
        self
    }

    /// Failure count gate for tripping a `HalfOpen` window. Required.
    #[must_use]
    pub fn half_failure_count_threshold(mut self, count: u64) -> Self {
        self.half_failure_count_threshold = Some(count);
        self
    }

    /// Success ratio required for recovery. Optional; without it the
    /// window never recovers early out of `HalfOpen`.
    #[must_use]
    pub fn recovery_ratio_threshold(mut self, ratio: f64) -> Self {
        self.recovery_ratio_threshold = Some(ratio);
        self
    }

    /// Success count gate for recovery. Optional.
    #[must_use]
    pub fn recovery_count_threshold(mut self, count: u64) -> Self {
        self.recovery_count_threshold = Some(count);
        self
    }

    /// Probability of admitting a call while the window is half open.
    /// Defaults to 0.5; 0 denies all, 1 admits all.
    #[must_use]
    pub fn half_open_probability(mut self, probability: f64) -> Self {
        self.half_open_probability = probability;
        self
    }

    /// Substitutes the clock, mainly for tests.
    #[must_use]
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    #[cfg(test)]
    #[must_use]
    pub(crate) fn rnd(mut self, rnd: Rnd) -> Self {
        self.rnd = rnd;
        self
    }

    /// Validates the configuration, creates the cabin and starts its
    /// supervisor thread.
    ///
    /// # Errors
    ///
    /// [`CabinBuildError`] when a required option is missing or a value is
    /// out of range.
    pub fn build(self) -> Result<Cabin, CabinBuildError> {
        let name = self.name.ok_or(CabinBuildError::MissingOption("name"))?;
        let executor = self.executor.ok_or(CabinBuildError::MissingOption("executor"))?;
        let timeout = self.timeout.ok_or(CabinBuildError::MissingOption("timeout"))?;
        let open_length = self.open_length.ok_or(CabinBuildError::MissingOption("open_length"))?;
        let closed_length = self
            .closed_length
            .ok_or(CabinBuildError::MissingOption("closed_length"))?;
        let half_open_length = self
            .half_open_length
            .ok_or(CabinBuildError::MissingOption("half_open_length"))?;
        let failure_ratio_threshold = self
            .failure_ratio_threshold
            .ok_or(CabinBuildError::MissingOption("failure_ratio_threshold"))?;
        let failure_count_threshold = self
            .failure_count_threshold
            .ok_or(CabinBuildError::MissingOption("failure_count_threshold"))?;
        let half_failure_count_threshold = self
            .half_failure_count_threshold
            .ok_or(CabinBuildError::MissingOption("half_failure_count_threshold"))?;

        if !(0.0..=1.0).contains(&self.half_open_probability) {
            return Err(CabinBuildError::InvalidProbability(self.half_open_probability));
        }
        if !(0.0..=1.0).contains(&failure_ratio_threshold) {
            return Err(CabinBuildError::InvalidRatio(failure_ratio_threshold));
        }

        let options = WindowOptions {
            open_length,
            closed_length,
            half_open_length,
            failure_ratio_threshold,
            failure_count_threshold: Some(failure_count_threshold),
            half_failure_count_threshold: Some(half_failure_count_threshold),
            recovery_ratio_threshold: self.recovery_ratio_threshold,
            recovery_count_threshold: self.recovery_count_threshold,
        };
        let core = Arc::new(CabinCore {
            name: Arc::from(name.as_str()),
            executor,
            timeout,
            window: Window::new(self.clock.now(), WindowStatus::Open, options),
            half_open_probability: self.half_open_probability,
            rnd: self.rnd,
            clock: self.clock,
            state: Mutex::new(CabinState {
                pending: BinaryHeap::new(),
                completed: 0,
                shutdown: false,
                supervisor_exited: false,
            }),
            signal: Condvar::new(),
        });

        let supervisor_core = Arc::clone(&core);
        thread::Builder::new()
            .name(format!("{name}:supervisor"))
            .spawn(move || supervisor::run(&supervisor_core))
            .expect("failed to spawn cabin supervisor thread");

        Ok(Cabin { core })
    }
}
