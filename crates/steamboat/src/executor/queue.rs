// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::clock::Clock;
use crate::constants::ERR_POISONED_LOCK;
use crate::executor::TaskItem;

/// Failure a reject handler can raise to signal a caller-visible rejection.
#[derive(Debug, thiserror::Error)]
#[error("task queue is full (capacity {capacity})")]
pub struct QueueFull {
    /// The queue's fixed capacity.
    pub capacity: usize,
}

/// Failure returned by [`TaskQueue::put`] once the owning executor closed
/// the queue during shutdown.
#[derive(Debug, thiserror::Error)]
#[error("task queue is closed")]
pub struct QueueClosed;

struct QueueState {
    items: VecDeque<TaskItem>,
    closed: bool,
}

/// Bounded FIFO queue of [`TaskItem`]s owned by an executor.
///
/// The executor itself only offers non-blockingly; the blocking
/// [`put`][Self::put] exists for reject handlers that prefer to wait for
/// room instead of rejecting. Accepted items are stamped with
/// `submitted_to_queue_at` on insertion.
pub struct TaskQueue {
    state: Mutex<QueueState>,
    not_full: Condvar,
    capacity: usize,
    clock: Clock,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl TaskQueue {
    pub(crate) fn new(capacity: usize, clock: Clock) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_full: Condvar::new(),
            capacity,
            clock,
        }
    }

    /// The queue's fixed capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().expect(ERR_POISONED_LOCK).items.len()
    }

    /// Whether the queue currently holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Non-blocking insert; hands the item back when the queue is full or
    /// closed.
    pub(crate) fn offer(&self, item: TaskItem) -> Result<(), TaskItem> {
        let mut state = self.state.lock().expect(ERR_POISONED_LOCK);
        if state.closed || state.items.len() >= self.capacity {
            return Err(item);
        }
        item.stamp_submitted(self.clock.now());
        state.items.push_back(item);
        Ok(())
    }

    /// Blocking insert: waits until the queue has room.
    ///
    /// # Errors
    ///
    /// [`QueueClosed`] once the owning executor closed the queue; the item
    /// is dropped in that case.
    pub fn put(&self, item: TaskItem) -> Result<(), QueueClosed> {
        let mut state = self.state.lock().expect(ERR_POISONED_LOCK);
        loop {
            if state.closed {
                return Err(QueueClosed);
            }
            if state.items.len() < self.capacity {
                item.stamp_submitted(self.clock.now());
                state.items.push_back(item);
                return Ok(());
            }
            state = self.not_full.wait(state).expect(ERR_POISONED_LOCK);
        }
    }

    /// Non-blocking removal from the front.
    pub(crate) fn poll(&self) -> Option<TaskItem> {
        let mut state = self.state.lock().expect(ERR_POISONED_LOCK);
        let item = state.items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Closes the queue against further inserts and removes every queued
    /// item, atomically.
    pub(crate) fn close_and_drain(&self) -> Vec<TaskItem> {
        let mut state = self.state.lock().expect(ERR_POISONED_LOCK);
        state.closed = true;
        self.not_full.notify_all();
        state.items.drain(..).collect()
    }
}
