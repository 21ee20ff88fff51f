// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::constants::ERR_POISONED_LOCK;
use crate::error::{CallError, StateError};

/// The terminal value of a call: the task's output or its tagged failure.
pub type CallOutcome<T> = Result<T, CallError>;

/// Process-wide monotonic identifier source for futures.
///
/// The identifier breaks ties between equal deadlines in the cabin's
/// supervision heap, so insertion order is preserved there.
static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Lifecycle phase of a [`CallFuture`].
///
/// A future starts `Pending`, moves to `Running` once a worker (or the
/// deadline supervisor) claims it, and ends in exactly one of the three
/// terminal phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Created but not yet claimed by anyone.
    Pending,
    /// Claimed through [`CallFuture::start_or_cancel`]; completion belongs
    /// to the claimant.
    Running,
    /// Completed with a value.
    Resolved,
    /// Completed with a failure.
    Failed,
    /// Cancelled before anyone started it.
    Cancelled,
}

impl Phase {
    /// Whether the phase is one of the three terminal phases.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Failed | Self::Cancelled)
    }
}

/// Named event timestamps recorded while a call travels through the system.
///
/// For any single future the stamped values are non-decreasing in field
/// order: a task is submitted to the queue, consumed by a worker, finishes
/// executing and finally leaves the cabin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeInfo {
    /// When the executor accepted the task into its queue.
    pub submitted_to_queue_at: Option<Instant>,
    /// When a worker dequeued the task.
    pub consumed_from_queue_at: Option<Instant>,
    /// When the user function returned (or raised).
    pub executed_completion_at: Option<Instant>,
    /// When the cabin admitted the call.
    pub entered_cabin_at: Option<Instant>,
    /// When the cabin completed the call.
    pub left_cabin_at: Option<Instant>,
}

impl TimeInfo {
    /// Copies every stamp present in `other` into `self`.
    pub fn merge(&mut self, other: &Self) {
        if other.submitted_to_queue_at.is_some() {
            self.submitted_to_queue_at = other.submitted_to_queue_at;
        }
        if other.consumed_from_queue_at.is_some() {
            self.consumed_from_queue_at = other.consumed_from_queue_at;
        }
        if other.executed_completion_at.is_some() {
            self.executed_completion_at = other.executed_completion_at;
        }
        if other.entered_cabin_at.is_some() {
            self.entered_cabin_at = other.entered_cabin_at;
        }
        if other.left_cabin_at.is_some() {
            self.left_cabin_at = other.left_cabin_at;
        }
    }
}

/// Event selector for [`CallFuture::stamp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeEvent {
    /// The executor accepted the task into its queue.
    SubmittedToQueue,
    /// A worker dequeued the task.
    ConsumedFromQueue,
    /// The user function returned (or raised).
    ExecutedCompletion,
    /// The cabin admitted the call.
    EnteredCabin,
    /// The cabin completed the call.
    LeftCabin,
}

type DoneCallback<T> = Box<dyn FnOnce(&CallFuture<T>) + Send>;

struct Inner<T> {
    phase: Phase,
    outcome: Option<CallOutcome<T>>,
    callbacks: Vec<DoneCallback<T>>,
    time_info: TimeInfo,
    deadline: Option<Instant>,
}

/// Single-assignment result slot with done-callbacks and a start-or-cancel
/// arbiter.
///
/// A `CallFuture` is the hand-off point between the submitting caller, the
/// worker that executes the task and the cabin's deadline supervisor.
/// Exactly one terminal transition wins; later attempts fail with
/// [`StateError::AlreadyTerminal`]. Done-callbacks run exactly once, after
/// the terminal transition, in registration order, on the thread that
/// performed the transition. Waiters block on a condition variable and may
/// bound their wait.
///
/// The worker/supervisor race is arbitrated by
/// [`start_or_cancel`][Self::start_or_cancel]: whoever moves the future from
/// `Pending` to `Running` owns its completion. Losing that race is a normal
/// outcome, not an error.
pub struct CallFuture<T> {
    id: u64,
    inner: Mutex<Inner<T>>,
    completed: Condvar,
}

impl<T> Default for CallFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for CallFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallFuture")
            .field("id", &self.id)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl<T> CallFuture<T> {
    /// Creates a pending future with a fresh process-wide identifier.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(Inner {
                phase: Phase::Pending,
                outcome: None,
                callbacks: Vec::new(),
                time_info: TimeInfo::default(),
                deadline: None,
            }),
            completed: Condvar::new(),
        }
    }

    /// The process-wide monotonic identifier of this future.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.inner.lock().expect(ERR_POISONED_LOCK).phase
    }

    /// The absolute deadline assigned by the cabin, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.lock().expect(ERR_POISONED_LOCK).deadline
    }

    /// Assigns the absolute deadline used by the cabin's supervision heap.
    pub fn set_deadline(&self, deadline: Instant) {
        self.inner.lock().expect(ERR_POISONED_LOCK).deadline = Some(deadline);
    }

    /// A copy of the recorded event timestamps.
    pub fn time_info(&self) -> TimeInfo {
        self.inner.lock().expect(ERR_POISONED_LOCK).time_info
    }

    /// Records `at` for `event`.
    pub fn stamp(&self, event: TimeEvent, at: Instant) {
        let mut inner = self.inner.lock().expect(ERR_POISONED_LOCK);
        let info = &mut inner.time_info;
        match event {
            TimeEvent::SubmittedToQueue => info.submitted_to_queue_at = Some(at),
            TimeEvent::ConsumedFromQueue => info.consumed_from_queue_at = Some(at),
            TimeEvent::ExecutedCompletion => info.executed_completion_at = Some(at),
            TimeEvent::EnteredCabin => info.entered_cabin_at = Some(at),
            TimeEvent::LeftCabin => info.left_cabin_at = Some(at),
        }
    }

    /// Copies every stamp present in `other` into this future's record.
    pub fn merge_time_info(&self, other: &TimeInfo) {
        self.inner.lock().expect(ERR_POISONED_LOCK).time_info.merge(other);
    }

    /// Completes the future with a value.
    ///
    /// # Errors
    ///
    /// [`StateError::AlreadyTerminal`] when another terminal transition won.
    pub fn set_result(&self, value: T) -> Result<(), StateError> {
        self.complete(Ok(value))
    }

    /// Completes the future with a failure.
    ///
    /// # Errors
    ///
    /// [`StateError::AlreadyTerminal`] when another terminal transition won.
    pub fn set_failure(&self, error: CallError) -> Result<(), StateError> {
        self.complete(Err(error))
    }

    /// Cancels a still pending future.
    ///
    /// # Errors
    ///
    /// [`StateError::InvalidState`] when the task already started running,
    /// [`StateError::AlreadyTerminal`] when the future already completed.
    pub fn cancel(&self) -> Result<(), StateError> {
        let callbacks = {
            let mut inner = self.inner.lock().expect(ERR_POISONED_LOCK);
            match inner.phase {
                Phase::Pending => {
                    inner.phase = Phase::Cancelled;
                    self.completed.notify_all();
                    mem::take(&mut inner.callbacks)
                }
                Phase::Running => return Err(StateError::InvalidState),
                _ => return Err(StateError::AlreadyTerminal),
            }
        };
        for callback in callbacks {
            callback(self);
        }
        Ok(())
    }

    /// The executor/supervisor arbiter.
    ///
    /// Returns `Ok(true)` if the call atomically moved the future from
    /// `Pending` to `Running`, transferring ownership of its completion to
    /// the caller. Returns `Ok(false)` if the future was already cancelled;
    /// that is the normal "lost the race" path and means someone else took
    /// care of the future.
    ///
    /// # Errors
    ///
    /// [`StateError::InvalidState`] when the future is already running or
    /// terminal; callers must treat this as "someone else handles it" and do
    /// nothing.
    pub fn start_or_cancel(&self) -> Result<bool, StateError> {
        let mut inner = self.inner.lock().expect(ERR_POISONED_LOCK);
        match inner.phase {
            Phase::Pending => {
                inner.phase = Phase::Running;
                Ok(true)
            }
            Phase::Cancelled => Ok(false),
            _ => Err(StateError::InvalidState),
        }
    }

    /// Registers a callback invoked exactly once after the terminal
    /// transition.
    ///
    /// Callbacks registered before completion run in registration order on
    /// the thread performing the transition. If the future is already
    /// terminal, `callback` runs immediately on the calling thread.
    pub fn add_done_callback<F>(&self, callback: F)
    where
        F: FnOnce(&Self) + Send + 'static,
    {
        {
            let mut inner = self.inner.lock().expect(ERR_POISONED_LOCK);
            if !inner.phase.is_terminal() {
                inner.callbacks.push(Box::new(callback));
                return;
            }
        }
        callback(self);
    }

    fn complete(&self, outcome: CallOutcome<T>) -> Result<(), StateError> {
        let callbacks = {
            let mut inner = self.inner.lock().expect(ERR_POISONED_LOCK);
            match inner.phase {
                Phase::Pending | Phase::Running => {
                    inner.phase = if outcome.is_ok() { Phase::Resolved } else { Phase::Failed };
                    inner.outcome = Some(outcome);
                    self.completed.notify_all();
                    mem::take(&mut inner.callbacks)
                }
                _ => return Err(StateError::AlreadyTerminal),
            }
        };
        for callback in callbacks {
            callback(self);
        }
        Ok(())
    }

    /// Blocks until the future is terminal or `timeout` expires.
    ///
    /// Returns whether the future is terminal.
    pub fn wait(&self, timeout: impl Into<Option<Duration>>) -> bool {
        let timeout = timeout.into();
        let mut inner = self.inner.lock().expect(ERR_POISONED_LOCK);
        match timeout {
            None => {
                while !inner.phase.is_terminal() {
                    inner = self.completed.wait(inner).expect(ERR_POISONED_LOCK);
                }
                true
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !inner.phase.is_terminal() {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, _) = self
                        .completed
                        .wait_timeout(inner, deadline - now)
                        .expect(ERR_POISONED_LOCK);
                    inner = guard;
                }
                true
            }
        }
    }
}

impl<T: Clone> CallFuture<T> {
    /// Non-blocking snapshot of the terminal outcome, if any.
    pub fn cloned_outcome(&self) -> Option<CallOutcome<T>> {
        let inner = self.inner.lock().expect(ERR_POISONED_LOCK);
        match inner.phase {
            Phase::Cancelled => Some(Err(CallError::Cancelled)),
            _ => inner.outcome.clone(),
        }
    }

    /// Blocks until the future is terminal and returns the value.
    ///
    /// # Errors
    ///
    /// The task's failure, [`CallError::Cancelled`] for a cancelled future,
    /// or [`CallError::WaitTimeout`] when `timeout` expires first (the
    /// future is left untouched in that case).
    pub fn result(&self, timeout: impl Into<Option<Duration>>) -> Result<T, CallError> {
        let timeout = timeout.into();
        if !self.wait(timeout) {
            return Err(CallError::WaitTimeout(timeout.unwrap_or_default()));
        }
        match self.cloned_outcome() {
            Some(outcome) => outcome,
            None => Err(CallError::Internal("terminal future without an outcome")),
        }
    }

    /// Blocks until the future is terminal and returns its failure, or
    /// `None` when the task resolved with a value.
    ///
    /// # Errors
    ///
    /// [`CallError::WaitTimeout`] when `timeout` expires before completion.
    pub fn failure(
        &self,
        timeout: impl Into<Option<Duration>>,
    ) -> Result<Option<CallError>, CallError> {
        let timeout = timeout.into();
        if !self.wait(timeout) {
            return Err(CallError::WaitTimeout(timeout.unwrap_or_default()));
        }
        match self.cloned_outcome() {
            Some(Ok(_)) => Ok(None),
            Some(Err(error)) => Ok(Some(error)),
            None => Err(CallError::Internal("terminal future without an outcome")),
        }
    }
}

/// Object-safe view of a future used by the cabin's supervision heap.
///
/// The heap must hold futures of different output types, so the supervisor
/// and the shutdown path talk to them through this trait instead of the
/// generic surface. Completion attempts ignore lost races by design.
pub(crate) trait FutureControl: Send + Sync {
    fn id(&self) -> u64;
    fn is_terminal(&self) -> bool;
    /// [`CallFuture::start_or_cancel`] without the typed surface.
    fn claim(&self) -> Result<bool, StateError>;
    /// Best-effort cancellation of a still pending future.
    fn cancel_if_pending(&self);
    /// Best-effort failure; a lost race is ignored.
    fn fail(&self, error: CallError);
    fn stamp(&self, event: TimeEvent, at: Instant);
    fn time_info(&self) -> TimeInfo;
    fn merge_time_info(&self, other: &TimeInfo);
}

impl<T: Send + 'static> FutureControl for CallFuture<T> {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_terminal(&self) -> bool {
        self.phase().is_terminal()
    }

    fn claim(&self) -> Result<bool, StateError> {
        self.start_or_cancel()
    }

    fn cancel_if_pending(&self) {
        let _ = self.cancel();
    }

    fn fail(&self, error: CallError) {
        let _ = self.set_failure(error);
    }

    fn stamp(&self, event: TimeEvent, at: Instant) {
        Self::stamp(self, event, at);
    }

    fn time_info(&self) -> TimeInfo {
        Self::time_info(self)
    }

    fn merge_time_info(&self, other: &TimeInfo) {
        Self::merge_time_info(self, other);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    #[test]
    fn assert_types() {
        static_assertions::assert_impl_all!(CallFuture<String>: Send, Sync);
    }

    #[test]
    fn identifiers_are_unique_and_increasing() {
        let a = CallFuture::<()>::new();
        let b = CallFuture::<()>::new();

        assert!(b.id() > a.id());
    }

    #[test]
    fn set_result_wins_exactly_once() {
        let future = CallFuture::new();

        future.set_result(1).expect("first transition");

        assert_eq!(future.set_result(2), Err(StateError::AlreadyTerminal));
        assert_eq!(future.set_failure(CallError::Cancelled), Err(StateError::AlreadyTerminal));
        assert_eq!(future.cancel(), Err(StateError::AlreadyTerminal));
        assert_eq!(future.result(None), Ok(1));
    }

    #[test]
    fn set_failure_is_observed_by_waiters() {
        let future: CallFuture<()> = CallFuture::new();

        future.set_failure(CallError::shut_down("pool")).expect("transition");

        assert!(matches!(future.failure(None), Ok(Some(CallError::ShutDown(_)))));
        assert!(matches!(future.result(None), Err(CallError::ShutDown(_))));
    }

    #[test]
    fn start_or_cancel_claims_a_pending_future() {
        let future: CallFuture<()> = CallFuture::new();

        assert_eq!(future.start_or_cancel(), Ok(true));
        assert_eq!(future.phase(), Phase::Running);
        assert_eq!(future.start_or_cancel(), Err(StateError::InvalidState));
    }

    #[test]
    fn start_or_cancel_reports_a_cancelled_future() {
        let future: CallFuture<()> = CallFuture::new();

        future.cancel().expect("cancel");

        assert_eq!(future.start_or_cancel(), Ok(false));
        assert_eq!(future.phase(), Phase::Cancelled);
    }

    #[test]
    fn cancel_fails_once_running() {
        let future: CallFuture<()> = CallFuture::new();

        assert_eq!(future.start_or_cancel(), Ok(true));
        assert_eq!(future.cancel(), Err(StateError::InvalidState));
    }

    #[test]
    fn cancelled_future_reports_cancelled_outcome() {
        let future: CallFuture<u32> = CallFuture::new();
        future.cancel().expect("cancel");

        assert!(matches!(future.result(None), Err(CallError::Cancelled)));
        assert!(matches!(future.failure(None), Ok(Some(CallError::Cancelled))));
    }

    #[test]
    fn callbacks_run_in_registration_order() {
        let future = CallFuture::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            future.add_done_callback(move |_| order.lock().unwrap().push(tag));
        }
        future.set_result(()).expect("transition");

        assert_eq!(order.lock().unwrap().as_slice(), &["first", "second", "third"]);
    }

    #[test]
    fn callback_added_after_completion_runs_immediately() {
        let future = CallFuture::new();
        future.set_result(7).expect("transition");

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        future.add_done_callback(move |f| {
            assert_eq!(f.result(None), Ok(7));
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callbacks_fire_on_cancel() {
        let future: CallFuture<()> = CallFuture::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_clone = Arc::clone(&fired);
        future.add_done_callback(move |f| {
            assert_eq!(f.phase(), Phase::Cancelled);
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        future.cancel().expect("cancel");

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn result_wait_times_out_without_altering_state() {
        let future: CallFuture<()> = CallFuture::new();

        let result = future.result(Duration::from_millis(20));

        assert!(matches!(result, Err(CallError::WaitTimeout(_))));
        assert_eq!(future.phase(), Phase::Pending);
    }

    #[test]
    fn waiter_is_woken_by_completion_on_another_thread() {
        let future = Arc::new(CallFuture::new());

        let completer = {
            let future = Arc::clone(&future);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                future.set_result("done").expect("transition");
            })
        };

        assert_eq!(future.result(Duration::from_secs(5)), Ok("done"));
        completer.join().expect("join");
    }

    #[test]
    fn time_info_merge_keeps_existing_stamps() {
        let future: CallFuture<()> = CallFuture::new();
        let base = Instant::now();

        future.stamp(TimeEvent::EnteredCabin, base);

        let other = TimeInfo {
            submitted_to_queue_at: Some(base + Duration::from_millis(1)),
            ..TimeInfo::default()
        };
        future.merge_time_info(&other);

        let info = future.time_info();
        assert_eq!(info.entered_cabin_at, Some(base));
        assert_eq!(info.submitted_to_queue_at, Some(base + Duration::from_millis(1)));
        assert_eq!(info.left_cabin_at, None);
    }

    #[test]
    fn deadline_round_trips() {
        let future: CallFuture<()> = CallFuture::new();
        assert_eq!(future.deadline(), None);

        let deadline = Instant::now() + Duration::from_secs(1);
        future.set_deadline(deadline);
        assert_eq!(future.deadline(), Some(deadline));
    }

    #[test]
    fn concurrent_completers_produce_one_winner() {
        for _ in 0..50 {
            let future = Arc::new(CallFuture::new());
            let wins = Arc::new(AtomicUsize::new(0));

            let handles: Vec<_> = (0..4)
                .map(|value| {
                    let future = Arc::clone(&future);
                    let wins = Arc::clone(&wins);
                    thread::spawn(move || {
                        if future.set_result(value).is_ok() {
                            wins.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().expect("join");
            }

            assert_eq!(wins.load(Ordering::SeqCst), 1);
            assert_eq!(future.phase(), Phase::Resolved);
        }
    }
}
