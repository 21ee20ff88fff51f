// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::cabin::Cabin;
use crate::constants::ERR_POISONED_LOCK;
use crate::degradation::{Degradation, SharedCall};
use crate::error::{BoxError, CallError};
use crate::future::CallFuture;

/// Registry failures reported by the router.
#[derive(Debug, thiserror::Error)]
pub enum SteamBoatError {
    /// A cabin with the same name was already registered.
    #[error("cabin {0} already exists")]
    DuplicateCabin(String),
    /// No cabin with that name is registered and no default cabin is set.
    #[error("cabin {0} does not exist and no default cabin is set")]
    UnknownCabin(String),
}

struct Route<T> {
    cabin: Cabin,
    degradation: Option<Arc<dyn Degradation<T>>>,
}

impl<T> Clone for Route<T> {
    fn clone(&self) -> Self {
        Self {
            cabin: self.cabin.clone(),
            degradation: self.degradation.clone(),
        }
    }
}

/// Registry and dispatcher over named [`Cabin`]s.
///
/// `SteamBoat` routes submitted tasks to cabins by name and, when a call
/// fails, invokes at most one method of the route's [`Degradation`] handler
/// matched on the failure kind:
///
/// | Failure | Degradation method |
/// |---|---|
/// | [`SubmitTask`][CallError::SubmitTask] | `on_submit_task_error` |
/// | [`WindowHalfOpen`][CallError::WindowHalfOpen] | `on_window_half_open` |
/// | [`WindowClosed`][CallError::WindowClosed] | `on_window_closed` |
/// | [`TimeoutReached`][CallError::TimeoutReached] | `on_timeout_reached` |
/// | any other | `on_exception` |
///
/// The degradation call is submitted **through the same cabin**, so
/// fallback work is itself circuit-broken; its result or failure becomes
/// the outer future's terminal value and never triggers another
/// degradation. Routes without a degradation handler propagate the original
/// failure unchanged.
///
/// The router is generic over the task output type `T`; cabins and
/// executors can still be shared with routers of other output types.
pub struct SteamBoat<T> {
    routes: Mutex<HashMap<String, Route<T>>>,
    default_route: Mutex<Option<Route<T>>>,
}

impl<T> std::fmt::Debug for SteamBoat<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let routes = self.routes.lock().expect(ERR_POISONED_LOCK);
        f.debug_struct("SteamBoat").field("cabins", &routes.len()).finish_non_exhaustive()
    }
}

impl<T> Default for SteamBoat<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SteamBoat<T> {
    /// An empty router.
    #[must_use]
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            default_route: Mutex::new(None),
        }
    }
}

impl<T: Clone + Send + 'static> SteamBoat<T> {
    /// Registers a cabin under its own name, optionally with a degradation
    /// handler.
    ///
    /// # Errors
    ///
    /// [`SteamBoatError::DuplicateCabin`] when the name is taken, unless
    /// `ignore_if_exists` keeps the existing registration.
    pub fn add_cabin(
        &self,
        cabin: Cabin,
        degradation: Option<Arc<dyn Degradation<T>>>,
        ignore_if_exists: bool,
    ) -> Result<&Self, SteamBoatError> {
        let mut routes = self.routes.lock().expect(ERR_POISONED_LOCK);
        let name = cabin.name().to_string();
        if routes.contains_key(&name) {
            if ignore_if_exists {
                return Ok(self);
            }
            return Err(SteamBoatError::DuplicateCabin(name));
        }
        routes.insert(name, Route { cabin, degradation });
        Ok(self)
    }

    /// Sets the cabin used for names without a registration of their own.
    pub fn set_default_cabin(
        &self,
        cabin: Cabin,
        degradation: Option<Arc<dyn Degradation<T>>>,
    ) -> &Self {
        let mut default_route = self.default_route.lock().expect(ERR_POISONED_LOCK);
        *default_route = Some(Route { cabin, degradation });
        self
    }

    /// Submits `task` through the named cabin and returns the outer future.
    ///
    /// # Errors
    ///
    /// [`SteamBoatError::UnknownCabin`] when neither a cabin of that name
    /// nor a default cabin exists.
    pub fn submit<F>(&self, name: &str, task: F) -> Result<Arc<CallFuture<T>>, SteamBoatError>
    where
        F: Fn() -> Result<T, BoxError> + Send + Sync + 'static,
    {
        self.submit_shared(name, Arc::new(task))
    }

    /// [`submit`][Self::submit] for an already shared task.
    pub fn submit_shared(
        &self,
        name: &str,
        task: SharedCall<T>,
    ) -> Result<Arc<CallFuture<T>>, SteamBoatError> {
        let route = {
            let routes = self.routes.lock().expect(ERR_POISONED_LOCK);
            routes.get(name).cloned()
        };
        let route = match route {
            Some(route) => route,
            None => {
                let default_route = self.default_route.lock().expect(ERR_POISONED_LOCK);
                default_route
                    .clone()
                    .ok_or_else(|| SteamBoatError::UnknownCabin(name.to_string()))?
            }
        };

        let outer = Arc::new(CallFuture::new());
        let inner = {
            let task = Arc::clone(&task);
            route.cabin.execute(move || task())
        };

        let callback_outer = Arc::clone(&outer);
        inner.add_done_callback(move |finished| {
            dispatch(finished, &callback_outer, &route, &task);
        });

        Ok(outer)
    }

    /// Returns a closure that submits `task` through the named cabin on
    /// every invocation: the decorator form of [`submit`][Self::submit].
    pub fn push_into_cabin<F>(
        self: &Arc<Self>,
        name: impl Into<String>,
        task: F,
    ) -> impl Fn() -> Result<Arc<CallFuture<T>>, SteamBoatError>
    where
        F: Fn() -> Result<T, BoxError> + Send + Sync + 'static,
    {
        let router = Arc::clone(self);
        let name = name.into();
        let task: SharedCall<T> = Arc::new(task);
        move || router.submit_shared(&name, Arc::clone(&task))
    }
}

/// Completes the outer future from a finished cabin future, dispatching at
/// most one degradation method for failures.
fn dispatch<T: Clone + Send + 'static>(
    finished: &CallFuture<T>,
    outer: &Arc<CallFuture<T>>,
    route: &Route<T>,
    task: &SharedCall<T>,
) {
    outer.merge_time_info(&finished.time_info());

    let failure = match finished.cloned_outcome() {
        Some(Ok(value)) => {
            let _ = outer.set_result(value);
            return;
        }
        Some(Err(failure)) => failure,
        None => CallError::Internal("terminal future without an outcome"),
    };

    let Some(degradation) = route.degradation.clone() else {
        let _ = outer.set_failure(failure);
        return;
    };

    // Degradation runs through the same cabin, so it is circuit-broken
    // like any other call; its outcome terminates the outer future with no
    // second round of degradation.
    let task = Arc::clone(task);
    let fallback: Box<dyn FnOnce() -> Result<T, BoxError> + Send> = match failure {
        CallError::SubmitTask(_) => {
            Box::new(move || degradation.on_submit_task_error(&failure, &task))
        }
        CallError::WindowHalfOpen(_) => Box::new(move || degradation.on_window_half_open(&task)),
        CallError::WindowClosed(_) => Box::new(move || degradation.on_window_closed(&task)),
        CallError::TimeoutReached(_) => Box::new(move || degradation.on_timeout_reached(&task)),
        other => Box::new(move || degradation.on_exception(&other, &task)),
    };

    let degraded = route.cabin.execute(move || fallback());
    let callback_outer = Arc::clone(outer);
    degraded.add_done_callback(move |finished| {
        match finished.cloned_outcome() {
            Some(Ok(value)) => {
                let _ = callback_outer.set_result(value);
            }
            Some(Err(failure)) => {
                let _ = callback_outer.set_failure(failure);
            }
            None => {
                let _ = callback_outer
                    .set_failure(CallError::Internal("terminal future without an outcome"));
            }
        };
    });
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::cabin::CabinBuilder;
    use crate::clock::Clock;
    use crate::executor::{Executor, SubmitOutcome, TaskItem};
    use crate::rnd::Rnd;

    /// Executor double that runs tasks inline on the submitting thread and
    /// can be told to reject the first N submissions.
    struct InlineExecutor {
        clock: Clock,
        reject_first: AtomicUsize,
        submissions: AtomicUsize,
    }

    impl InlineExecutor {
        fn new() -> Arc<Self> {
            Self::rejecting(0)
        }

        fn rejecting(reject_first: usize) -> Arc<Self> {
            Arc::new(Self {
                clock: Clock::new(),
                reject_first: AtomicUsize::new(reject_first),
                submissions: AtomicUsize::new(0),
            })
        }
    }

    impl Executor for InlineExecutor {
        fn submit_item(&self, item: TaskItem) -> SubmitOutcome {
            self.submissions.fetch_add(1, Ordering::SeqCst);
            if self
                .reject_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok()
            {
                drop(item);
                return SubmitOutcome::Rejected("inline executor is saturated".into());
            }
            item.run(&self.clock);
            SubmitOutcome::Queued
        }

        fn shutdown(&self, _wait: Option<Duration>) {}

        fn name(&self) -> &str {
            "inline"
        }
    }

    #[derive(Default)]
    struct RecordingDegradation {
        submit_task_errors: AtomicUsize,
        half_opens: AtomicUsize,
        closeds: AtomicUsize,
        timeouts: AtomicUsize,
        exceptions: AtomicUsize,
    }

    impl Degradation<String> for RecordingDegradation {
        fn on_submit_task_error(
            &self,
            _cause: &CallError,
            _task: &SharedCall<String>,
        ) -> Result<String, BoxError> {
            self.submit_task_errors.fetch_add(1, Ordering::SeqCst);
            Ok("degraded: submit".to_string())
        }

        fn on_window_half_open(&self, _task: &SharedCall<String>) -> Result<String, BoxError> {
            self.half_opens.fetch_add(1, Ordering::SeqCst);
            Ok("degraded: half open".to_string())
        }

        fn on_window_closed(&self, _task: &SharedCall<String>) -> Result<String, BoxError> {
            self.closeds.fetch_add(1, Ordering::SeqCst);
            Ok("degraded: closed".to_string())
        }

        fn on_timeout_reached(&self, _task: &SharedCall<String>) -> Result<String, BoxError> {
            self.timeouts.fetch_add(1, Ordering::SeqCst);
            Ok("degraded: timeout".to_string())
        }

        fn on_exception(
            &self,
            _error: &CallError,
            _task: &SharedCall<String>,
        ) -> Result<String, BoxError> {
            self.exceptions.fetch_add(1, Ordering::SeqCst);
            Ok("degraded: exception".to_string())
        }
    }

    fn cabin_on(executor: &Arc<InlineExecutor>, name: &str) -> CabinBuilder {
        CabinBuilder::new()
            .name(name)
            .executor(Arc::clone(executor) as Arc<dyn Executor>)
            .timeout(Duration::from_secs(30))
            .open_length(Duration::from_secs(60))
            .closed_length(Duration::from_millis(30))
            .half_open_length(Duration::from_secs(60))
            .failure_ratio_threshold(0.8)
            .failure_count_threshold(2)
            .half_failure_count_threshold(2)
    }

    #[test]
    fn submit_routes_to_the_named_cabin() {
        let executor = InlineExecutor::new();
        let cabin = cabin_on(&executor, "alpha").build().expect("build");
        let router: SteamBoat<String> = SteamBoat::new();
        router.add_cabin(cabin.clone(), None, false).expect("register");

        let future = router
            .submit("alpha", || Ok("hello".to_string()))
            .expect("known cabin");

        assert_eq!(future.result(Duration::from_secs(5)), Ok("hello".to_string()));
        cabin.shutdown(Some(Duration::from_secs(1)));
    }

    #[test]
    fn unknown_cabin_without_default_is_an_error() {
        let router: SteamBoat<String> = SteamBoat::new();
        let result = router.submit("ghost", || Ok(String::new()));
        assert!(matches!(result, Err(SteamBoatError::UnknownCabin(_))));
    }

    #[test]
    fn unknown_cabin_falls_back_to_the_default() {
        let executor = InlineExecutor::new();
        let cabin = cabin_on(&executor, "fallback").build().expect("build");
        let router: SteamBoat<String> = SteamBoat::new();
        router.set_default_cabin(cabin.clone(), None);

        let future = router.submit("anything", || Ok("ok".to_string())).expect("default");

        assert_eq!(future.result(Duration::from_secs(5)), Ok("ok".to_string()));
        cabin.shutdown(Some(Duration::from_secs(1)));
    }

    #[test]
    fn duplicate_names_are_rejected_unless_ignored() {
        let executor = InlineExecutor::new();
        let cabin = cabin_on(&executor, "dup").build().expect("build");
        let router: SteamBoat<String> = SteamBoat::new();

        router.add_cabin(cabin.clone(), None, false).expect("first");
        assert!(matches!(
            router.add_cabin(cabin.clone(), None, false),
            Err(SteamBoatError::DuplicateCabin(_))
        ));
        router.add_cabin(cabin.clone(), None, true).expect("ignored");

        cabin.shutdown(Some(Duration::from_secs(1)));
    }

    #[test]
    fn failures_without_degradation_propagate_unchanged() {
        let executor = InlineExecutor::new();
        let cabin = cabin_on(&executor, "plain").build().expect("build");
        let router: SteamBoat<String> = SteamBoat::new();
        router.add_cabin(cabin.clone(), None, false).expect("register");

        let future = router
            .submit("plain", || Err("downstream exploded".into()))
            .expect("known cabin");

        assert!(matches!(
            future.failure(Duration::from_secs(5)),
            Ok(Some(CallError::App(_)))
        ));
        cabin.shutdown(Some(Duration::from_secs(1)));
    }

    #[test]
    fn task_failures_dispatch_on_exception() {
        let executor = InlineExecutor::new();
        let cabin = cabin_on(&executor, "exceptional").build().expect("build");
        let degradation = Arc::new(RecordingDegradation::default());
        let router: SteamBoat<String> = SteamBoat::new();
        router
            .add_cabin(cabin.clone(), Some(Arc::clone(&degradation) as _), false)
            .expect("register");

        let future = router
            .submit("exceptional", || Err("downstream exploded".into()))
            .expect("known cabin");

        assert_eq!(
            future.result(Duration::from_secs(5)),
            Ok("degraded: exception".to_string())
        );
        assert_eq!(degradation.exceptions.load(Ordering::SeqCst), 1);
        assert_eq!(degradation.closeds.load(Ordering::SeqCst), 0);
        cabin.shutdown(Some(Duration::from_secs(1)));
    }

    #[test]
    fn rejected_submission_dispatches_on_submit_task_error() {
        let executor = InlineExecutor::rejecting(1);
        let cabin = cabin_on(&executor, "rejected").build().expect("build");
        let degradation = Arc::new(RecordingDegradation::default());
        let router: SteamBoat<String> = SteamBoat::new();
        router
            .add_cabin(cabin.clone(), Some(Arc::clone(&degradation) as _), false)
            .expect("register");

        let future = router
            .submit("rejected", || Ok("never".to_string()))
            .expect("known cabin");

        // The first submission was rejected; the degradation ran on the
        // recovered executor.
        assert_eq!(
            future.result(Duration::from_secs(5)),
            Ok("degraded: submit".to_string())
        );
        assert_eq!(degradation.submit_task_errors.load(Ordering::SeqCst), 1);
        assert_eq!(executor.submissions.load(Ordering::SeqCst), 2);
        cabin.shutdown(Some(Duration::from_secs(1)));
    }

    #[test]
    fn closed_window_short_circuits_the_degradation_too() {
        let executor = InlineExecutor::new();
        let cabin = cabin_on(&executor, "closed")
            .closed_length(Duration::from_secs(60))
            .build()
            .expect("build");
        let degradation = Arc::new(RecordingDegradation::default());
        let router: SteamBoat<String> = SteamBoat::new();
        router
            .add_cabin(cabin.clone(), Some(Arc::clone(&degradation) as _), false)
            .expect("register");

        // Two inline failures trip the window.
        for _ in 0..2 {
            let tripping = cabin.execute(|| -> Result<String, BoxError> { Err("boom".into()) });
            assert!(tripping.wait(Duration::from_secs(5)));
        }

        let future = router
            .submit("closed", || Ok("never".to_string()))
            .expect("known cabin");

        // Degradation goes through the same cabin, so the closed window
        // rejects it as well and no handler runs.
        assert!(matches!(
            future.failure(Duration::from_secs(5)),
            Ok(Some(CallError::WindowClosed(_)))
        ));
        assert_eq!(degradation.closeds.load(Ordering::SeqCst), 0);
        cabin.shutdown(Some(Duration::from_secs(1)));
    }

    #[test]
    fn half_open_denial_dispatches_and_readmits_by_draw() {
        let executor = InlineExecutor::new();
        // First draw denies the original call, second admits the
        // degradation call.
        let draws = AtomicUsize::new(0);
        let rnd = Rnd::new_function(move || {
            if draws.fetch_add(1, Ordering::SeqCst) == 0 { 0.9 } else { 0.1 }
        });
        let cabin = cabin_on(&executor, "half-open").rnd(rnd).build().expect("build");
        let degradation = Arc::new(RecordingDegradation::default());
        let router: SteamBoat<String> = SteamBoat::new();
        router
            .add_cabin(cabin.clone(), Some(Arc::clone(&degradation) as _), false)
            .expect("register");

        for _ in 0..2 {
            let tripping = cabin.execute(|| -> Result<String, BoxError> { Err("boom".into()) });
            assert!(tripping.wait(Duration::from_secs(5)));
        }
        // Let the closed epoch (30ms) lapse into half-open.
        thread::sleep(Duration::from_millis(60));

        let future = router
            .submit("half-open", || Ok("never".to_string()))
            .expect("known cabin");

        assert_eq!(
            future.result(Duration::from_secs(5)),
            Ok("degraded: half open".to_string())
        );
        assert_eq!(degradation.half_opens.load(Ordering::SeqCst), 1);
        cabin.shutdown(Some(Duration::from_secs(1)));
    }

    #[test]
    fn degradation_failure_becomes_the_outer_failure() {
        struct FailingDegradation;
        impl Degradation<String> for FailingDegradation {
            fn on_submit_task_error(
                &self,
                _cause: &CallError,
                _task: &SharedCall<String>,
            ) -> Result<String, BoxError> {
                Err("unused".into())
            }
            fn on_window_half_open(&self, _task: &SharedCall<String>) -> Result<String, BoxError> {
                Err("unused".into())
            }
            fn on_window_closed(&self, _task: &SharedCall<String>) -> Result<String, BoxError> {
                Err("unused".into())
            }
            fn on_timeout_reached(&self, _task: &SharedCall<String>) -> Result<String, BoxError> {
                Err("unused".into())
            }
            fn on_exception(
                &self,
                _error: &CallError,
                _task: &SharedCall<String>,
            ) -> Result<String, BoxError> {
                Err("fallback also failed".into())
            }
        }

        let executor = InlineExecutor::new();
        let cabin = cabin_on(&executor, "double-failure").build().expect("build");
        let router: SteamBoat<String> = SteamBoat::new();
        router
            .add_cabin(cabin.clone(), Some(Arc::new(FailingDegradation)), false)
            .expect("register");

        let future = router
            .submit("double-failure", || Err("original".into()))
            .expect("known cabin");

        // The degradation's failure terminates the call; no second round.
        match future.failure(Duration::from_secs(5)) {
            Ok(Some(CallError::App(cause))) => {
                assert!(cause.to_string().contains("fallback also failed"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        cabin.shutdown(Some(Duration::from_secs(1)));
    }

    #[test]
    fn degradation_receives_the_original_task() {
        struct RetryingDegradation;
        impl Degradation<String> for RetryingDegradation {
            fn on_submit_task_error(
                &self,
                _cause: &CallError,
                task: &SharedCall<String>,
            ) -> Result<String, BoxError> {
                task()
            }
            fn on_window_half_open(&self, task: &SharedCall<String>) -> Result<String, BoxError> {
                task()
            }
            fn on_window_closed(&self, task: &SharedCall<String>) -> Result<String, BoxError> {
                task()
            }
            fn on_timeout_reached(&self, task: &SharedCall<String>) -> Result<String, BoxError> {
                task()
            }
            fn on_exception(
                &self,
                _error: &CallError,
                task: &SharedCall<String>,
            ) -> Result<String, BoxError> {
                task()
            }
        }

        let executor = InlineExecutor::new();
        let cabin = cabin_on(&executor, "retry").build().expect("build");
        let router: SteamBoat<String> = SteamBoat::new();
        router
            .add_cabin(cabin.clone(), Some(Arc::new(RetryingDegradation)), false)
            .expect("register");

        // The task fails once, then succeeds when the degradation retries.
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = Arc::clone(&attempts);
        let future = router
            .submit("retry", move || {
                if attempts_clone.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err("first attempt fails".into())
                } else {
                    Ok("second attempt".to_string())
                }
            })
            .expect("known cabin");

        assert_eq!(
            future.result(Duration::from_secs(5)),
            Ok("second attempt".to_string())
        );
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        cabin.shutdown(Some(Duration::from_secs(1)));
    }

    #[test]
    fn push_into_cabin_builds_a_reusable_submitter() {
        let executor = InlineExecutor::new();
        let cabin = cabin_on(&executor, "bound").build().expect("build");
        let router: Arc<SteamBoat<String>> = Arc::new(SteamBoat::new());
        router.add_cabin(cabin.clone(), None, false).expect("register");

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let bound = router.push_into_cabin("bound", move || {
            let call = calls_clone.fetch_add(1, Ordering::SeqCst);
            Ok(format!("call {call}"))
        });

        let first = bound().expect("submit");
        let second = bound().expect("submit");

        assert_eq!(first.result(Duration::from_secs(5)), Ok("call 0".to_string()));
        assert_eq!(second.result(Duration::from_secs(5)), Ok("call 1".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        cabin.shutdown(Some(Duration::from_secs(1)));
    }
}
