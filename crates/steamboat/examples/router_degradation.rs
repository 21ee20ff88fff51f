// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Full walkthrough: a flaky downstream behind a cabin, with a degradation
//! handler serving cached answers whenever the breaker steps in.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use steamboat::executor::{QueueFull, ThreadPoolExecutor, ThreadPoolOptions, reject_with};
use steamboat::{
    BoxError, CabinBuilder, CallError, Clock, Degradation, Executor, SharedCall, SteamBoat,
};

struct CachedAnswers;

impl Degradation<String> for CachedAnswers {
    fn on_submit_task_error(
        &self,
        cause: &CallError,
        _task: &SharedCall<String>,
    ) -> Result<String, BoxError> {
        Ok(format!("cached answer (executor said: {cause})"))
    }

    fn on_window_half_open(&self, _task: &SharedCall<String>) -> Result<String, BoxError> {
        Ok("cached answer (probing the downstream)".to_string())
    }

    fn on_window_closed(&self, _task: &SharedCall<String>) -> Result<String, BoxError> {
        Ok("cached answer (downstream considered broken)".to_string())
    }

    fn on_timeout_reached(&self, _task: &SharedCall<String>) -> Result<String, BoxError> {
        Ok("cached answer (downstream too slow)".to_string())
    }

    fn on_exception(
        &self,
        error: &CallError,
        _task: &SharedCall<String>,
    ) -> Result<String, BoxError> {
        Ok(format!("cached answer (downstream said: {error})"))
    }
}

fn main() {
    tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).init();

    let executor = Arc::new(ThreadPoolExecutor::new(
        ThreadPoolOptions::new(3, 6).name("router-pool"),
        reject_with(|queue| QueueFull { capacity: queue.capacity() }),
        Clock::new(),
    ));

    let cabin = CabinBuilder::new()
        .name("flaky-downstream")
        .executor(Arc::clone(&executor) as _)
        .timeout(Duration::from_millis(200))
        .open_length(Duration::from_secs(10))
        .closed_length(Duration::from_secs(2))
        .half_open_length(Duration::from_secs(3))
        .failure_ratio_threshold(0.8)
        .failure_count_threshold(3)
        .half_failure_count_threshold(2)
        .recovery_ratio_threshold(0.9)
        .recovery_count_threshold(2)
        .build()
        .expect("valid cabin configuration");

    let router: Arc<SteamBoat<String>> = Arc::new(SteamBoat::new());
    router
        .add_cabin(cabin.clone(), Some(Arc::new(CachedAnswers)), false)
        .expect("fresh cabin name");

    // A downstream that fails its first calls, then recovers.
    let calls = Arc::new(AtomicUsize::new(0));
    let flaky = {
        let calls = Arc::clone(&calls);
        move || -> Result<String, BoxError> {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            if call < 4 {
                Err(format!("call {call}: connection reset").into())
            } else {
                Ok(format!("call {call}: fresh answer"))
            }
        }
    };
    let bound = router.push_into_cabin("flaky-downstream", flaky);

    for round in 0..10 {
        let answer = bound()
            .expect("cabin is registered")
            .result(Duration::from_secs(5));
        println!("round {round}: {answer:?}");
        thread::sleep(Duration::from_millis(100));
    }

    println!("window counters: {:?}", cabin.window().counters());

    cabin.shutdown(Some(Duration::from_secs(1)));
    executor.shutdown(Some(Duration::from_secs(1)));
}
