// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::clock::Clock;
use crate::constants::ERR_POISONED_LOCK;
use crate::executor::{Executor, RejectHandler, SubmitOutcome, TaskItem, TaskQueue};

/// Configuration of a [`ThreadPoolExecutor`].
#[derive(Debug, Clone)]
pub struct ThreadPoolOptions {
    /// Number of worker threads.
    pub core_pool_size: usize,
    /// Capacity of the bounded task queue.
    pub queue_capacity: usize,
    /// Pool name, used as the worker thread name prefix. A random name is
    /// generated when absent.
    pub name: Option<String>,
}

impl ThreadPoolOptions {
    /// Options for a pool with `core_pool_size` workers and a queue bounded
    /// at `queue_capacity`.
    #[must_use]
    pub fn new(core_pool_size: usize, queue_capacity: usize) -> Self {
        Self {
            core_pool_size,
            queue_capacity,
            name: None,
        }
    }

    /// Names the pool (and thereby its worker threads).
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

struct PoolState {
    shutting_down: bool,
    shut_down: bool,
    live_workers: usize,
}

struct PoolShared {
    name: Arc<str>,
    queue: TaskQueue,
    reject_handler: RejectHandler,
    clock: Clock,
    state: Mutex<PoolState>,
    workers_wait: Condvar,
    all_workers_stopped: Condvar,
}

/// Bounded worker pool executing submitted tasks with admission control.
///
/// Submission is non-blocking: when the queue is full the configured reject
/// handler runs on the submitter's thread (with no pool lock held) and
/// decides between raising a caller-visible rejection and placing the item
/// elsewhere, typically via the queue's blocking
/// [`put`][TaskQueue::put]. While the pool shuts down, submissions return
/// futures pre-failed with [`ShutDown`][crate::CallError::ShutDown].
///
/// The pool does not stop on its own; call
/// [`shutdown`][Executor::shutdown] to release the workers and fail any
/// still-queued tasks.
pub struct ThreadPoolExecutor {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for ThreadPoolExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPoolExecutor")
            .field("name", &self.shared.name)
            .field("queue", &self.shared.queue)
            .finish_non_exhaustive()
    }
}

impl ThreadPoolExecutor {
    /// Creates the pool and starts its worker threads.
    #[must_use]
    pub fn new(options: ThreadPoolOptions, reject_handler: RejectHandler, clock: Clock) -> Self {
        let name: Arc<str> = match options.name {
            Some(name) => Arc::from(name),
            None => Arc::from(format!("thread-pool-{:08x}", fastrand::u32(..))),
        };

        let shared = Arc::new(PoolShared {
            name: Arc::clone(&name),
            queue: TaskQueue::new(options.queue_capacity, clock.clone()),
            reject_handler,
            clock,
            state: Mutex::new(PoolState {
                shutting_down: false,
                shut_down: false,
                live_workers: options.core_pool_size,
            }),
            workers_wait: Condvar::new(),
            all_workers_stopped: Condvar::new(),
        });

        for index in 0..options.core_pool_size {
            let shared_clone = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("{name}:{index}"))
                .spawn(move || worker_loop(&shared_clone, index))
                .expect("failed to spawn worker thread");
        }

        Self { shared }
    }

    /// The pool's bounded queue, mainly of interest to reject handlers.
    #[must_use]
    pub fn queue(&self) -> &TaskQueue {
        &self.shared.queue
    }
}

impl Executor for ThreadPoolExecutor {
    fn submit_item(&self, item: TaskItem) -> SubmitOutcome {
        let shared = &self.shared;
        let rejected = {
            let state = shared.state.lock().expect(ERR_POISONED_LOCK);
            if state.shutting_down || state.shut_down {
                return SubmitOutcome::ShuttingDown;
            }
            match shared.queue.offer(item) {
                Ok(()) => {
                    shared.workers_wait.notify_one();
                    return SubmitOutcome::Queued;
                }
                Err(item) => item,
            }
            // The state lock drops here, before the reject handler runs.
        };

        match (shared.reject_handler)(&shared.queue, rejected) {
            Ok(()) => {
                shared.workers_wait.notify_one();
                SubmitOutcome::Queued
            }
            Err(cause) => SubmitOutcome::Rejected(cause),
        }
    }

    fn shutdown(&self, wait: Option<Duration>) {
        let shared = &self.shared;
        {
            let mut state = shared.state.lock().expect(ERR_POISONED_LOCK);
            if state.shutting_down || state.shut_down {
                return;
            }
            state.shutting_down = true;
            shared.workers_wait.notify_all();
            info!(pool = %shared.name, "executor shutting down");

            match wait {
                None => {
                    while state.live_workers > 0 {
                        state = shared.all_workers_stopped.wait(state).expect(ERR_POISONED_LOCK);
                    }
                }
                Some(wait) => {
                    let deadline = Instant::now() + wait;
                    while state.live_workers > 0 {
                        let now = Instant::now();
                        if now >= deadline {
                            break;
                        }
                        let (guard, _) = shared
                            .all_workers_stopped
                            .wait_timeout(state, deadline - now)
                            .expect(ERR_POISONED_LOCK);
                        state = guard;
                    }
                }
            }
        }

        let drained = shared.queue.close_and_drain();
        let drained_count = drained.len();
        for item in drained {
            item.fail_shut_down(&shared.name);
        }

        let mut state = shared.state.lock().expect(ERR_POISONED_LOCK);
        state.shutting_down = false;
        state.shut_down = true;
        drop(state);
        info!(pool = %shared.name, drained = drained_count, "executor shut down");
    }

    fn name(&self) -> &str {
        &self.shared.name
    }
}

fn worker_loop(shared: &PoolShared, index: usize) {
    debug!(pool = %shared.name, index, "worker started");

    let mut state = shared.state.lock().expect(ERR_POISONED_LOCK);
    loop {
        if state.shutting_down || state.shut_down {
            break;
        }
        match shared.queue.poll() {
            Some(item) => {
                drop(state);
                item.run(&shared.clock);
                state = shared.state.lock().expect(ERR_POISONED_LOCK);
            }
            // Re-polling happens under the same lock submitters signal
            // with, so a wake-up between poll and wait cannot be lost.
            None => {
                state = shared.workers_wait.wait(state).expect(ERR_POISONED_LOCK);
            }
        }
    }

    state.live_workers -= 1;
    let last = state.live_workers == 0;
    if last {
        shared.all_workers_stopped.notify_all();
    }
    drop(state);

    debug!(pool = %shared.name, index, "worker stopped");
    if last {
        info!(pool = %shared.name, "all workers stopped");
    }
}
