// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Instant;
#[cfg(any(test, feature = "test-util"))]
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

#[cfg(any(test, feature = "test-util"))]
use crate::constants::ERR_POISONED_LOCK;

/// Provides the crate's view of machine time.
///
/// Working with time is notoriously difficult to test. Components that need
/// the current time (cabins, executors, the slow-call recorder) take a clock
/// at construction instead of reading the system clock directly, so tests can
/// substitute a manually driven clock without sleeping. In production the
/// clock is a zero-cost wrapper over [`Instant::now`].
///
/// Cloning a clock is inexpensive and clones stay linked: a manually driven
/// clock shares its flow of time with all of its clones.
///
/// The manual variant is only available with the `test-util` feature (or in
/// this crate's own tests); see [`ClockControl`].
#[derive(Clone, Debug, Default)]
pub struct Clock(Kind);

#[derive(Clone, Debug, Default)]
enum Kind {
    #[default]
    System,
    #[cfg(any(test, feature = "test-util"))]
    Manual(Arc<ManualState>),
}

impl Clock {
    /// Creates a clock backed by the system's monotonic clock.
    #[must_use]
    pub fn new() -> Self {
        Self(Kind::System)
    }

    /// Returns the current instant according to this clock.
    #[must_use]
    pub fn now(&self) -> Instant {
        match &self.0 {
            Kind::System => Instant::now(),
            #[cfg(any(test, feature = "test-util"))]
            Kind::Manual(state) => state.base + *state.offset.lock().expect(ERR_POISONED_LOCK),
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
#[derive(Debug)]
struct ManualState {
    base: Instant,
    offset: Mutex<Duration>,
}

/// Manually driven time source for tests.
///
/// All clocks created through [`to_clock`][Self::to_clock] observe the same
/// flow of time; [`advance`][Self::advance] moves them forward together.
/// Time never advances on its own.
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Clone)]
pub struct ClockControl {
    state: Arc<ManualState>,
}

#[cfg(any(test, feature = "test-util"))]
impl ClockControl {
    /// Creates a control whose clocks start at the current instant and only
    /// move when [`advance`][Self::advance] is called.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(ManualState {
                base: Instant::now(),
                offset: Mutex::new(Duration::ZERO),
            }),
        }
    }

    /// Returns a clock driven by this control.
    #[must_use]
    pub fn to_clock(&self) -> Clock {
        Clock(Kind::Manual(Arc::clone(&self.state)))
    }

    /// Moves the linked clocks forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        let mut offset = self.state.offset.lock().expect(ERR_POISONED_LOCK);
        *offset += duration;
    }
}

#[cfg(any(test, feature = "test-util"))]
impl Default for ClockControl {
    fn default() -> Self {
        Self::new()
    }
}
