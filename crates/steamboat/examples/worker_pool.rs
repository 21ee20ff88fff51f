// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bare worker-pool round-trip: submit a batch of tasks, watch rejections,
//! shut the pool down.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use steamboat::executor::{
    ExecutorExt, QueueFull, ThreadPoolExecutor, ThreadPoolOptions, reject_with,
};
use steamboat::{BoxError, Clock, Executor};

fn main() {
    tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).init();

    let pool = Arc::new(ThreadPoolExecutor::new(
        ThreadPoolOptions::new(3, 6).name("example-pool"),
        reject_with(|queue| QueueFull { capacity: queue.capacity() }),
        Clock::new(),
    ));

    let futures: Vec<_> = (0..12)
        .map(|index| {
            pool.submit(move || -> Result<String, BoxError> {
                thread::sleep(Duration::from_millis(50));
                Ok(format!("task {index} done"))
            })
        })
        .collect();

    for (index, submitted) in futures.into_iter().enumerate() {
        match submitted {
            Ok(future) => match future.result(Duration::from_secs(5)) {
                Ok(message) => println!("{message}"),
                Err(error) => println!("task {index} failed: {error}"),
            },
            Err(rejection) => println!("task {index} rejected: {rejection}"),
        }
    }

    pool.shutdown(Some(Duration::from_secs(1)));
}
