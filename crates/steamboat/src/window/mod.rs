// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Time-bucketed three-state classifier driving a cabin's admission policy.
//!
//! A [`Window`] partitions time into variable-length epochs, each carrying
//! one of three statuses and four counters (success, failure, timeout,
//! rejection). The status decides admission; the counters decide
//! transitions.
//!
//! Note that the status names describe the **window**, not the breaker
//! contact of the electrical metaphor: an `Open` window lets calls through
//! and a `Closed` window blocks them.
//!
//! ```text
//! ┌────────┐   failure thresholds reached    ┌──────────┐
//! │  Open  │ ───────────────────────────────▶│  Closed  │
//! └────────┘                                 └──────────┘
//!      ▲                                           │
//!      │ recovery thresholds     ┌───────────┐     │ closed_length
//!      │ reached                 │ Half-Open │◀────┘ elapsed
//!      └─────────────────────────└───────────┘
//! ```
//!
//! Epochs advance lazily: every read or update carries an observed position
//! and the window rolls forward as needed before answering. An `Open` or
//! `HalfOpen` epoch whose end has passed starts a fresh `Open` epoch at the
//! observed position; a `Closed` epoch whose end has passed enters
//! `HalfOpen` at the old end position and re-evaluates from there. Counters
//! reset on every transition.
//!
//! Positions before the start of the current epoch are clock anomalies:
//! they are logged and the operation becomes a no-op.

use std::sync::Mutex;
use std::time::Instant;

use tracing::{debug, error};

use crate::constants::ERR_POISONED_LOCK;

mod options;
pub use options::WindowOptions;

/// Status of a [`Window`] epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowStatus {
    /// Normal operation, all calls admitted.
    Open,
    /// Probing, calls admitted with the cabin's half-open probability.
    HalfOpen,
    /// Broken, no calls admitted.
    Closed,
}

/// Classification of one finished (or refused) task, as recorded into the
/// window's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The user function returned a value.
    Success,
    /// The user function returned an error or panicked.
    Failure,
    /// The deadline supervisor cancelled the task.
    Timeout,
    /// The executor refused admission.
    Rejection,
}

/// Snapshot of a window epoch's counters.
///
/// Rejections are tracked but excluded from the ratio denominator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowCounters {
    /// Tasks that resolved with a value.
    pub success: u64,
    /// Tasks that failed in the user function.
    pub failure: u64,
    /// Tasks cancelled by the deadline supervisor.
    pub timeout: u64,
    /// Tasks refused admission by the executor.
    pub rejection: u64,
}

impl WindowCounters {
    /// The ratio denominator: successes, failures and timeouts.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.success + self.failure + self.timeout
    }

    fn record(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Success => self.success += 1,
            TaskOutcome::Failure => self.failure += 1,
            TaskOutcome::Timeout => self.timeout += 1,
            TaskOutcome::Rejection => self.rejection += 1,
        }
    }

    /// Failure and success ratios over [`total`][Self::total], both zero
    /// when the denominator is zero. Counts stay far below 2^52, so the
    /// float conversion is exact.
    fn ratios(&self) -> (f64, f64) {
        let total = self.total();
        if total == 0 {
            return (0.0, 0.0);
        }
        let total = total as f64;
        (self.failure as f64 / total, self.success as f64 / total)
    }
}

#[derive(Debug)]
struct State {
    status: WindowStatus,
    start_position: Instant,
    counters: WindowCounters,
}

impl State {
    fn enter(&mut self, status: WindowStatus, position: Instant) {
        self.status = status;
        self.start_position = position;
        self.counters = WindowCounters::default();
    }
}

/// The timed three-state classifier inside a cabin.
///
/// All reads and writes go through one mutex; no user code runs while it is
/// held. Positions are supplied by the caller so the decision core stays
/// free of clock reads and easy to test.
#[derive(Debug)]
pub struct Window {
    state: Mutex<State>,
    options: WindowOptions,
}

impl Window {
    /// Creates a window whose first epoch has the given status and starts
    /// at `start_position`.
    #[must_use]
    pub fn new(start_position: Instant, status: WindowStatus, options: WindowOptions) -> Self {
        Self {
            state: Mutex::new(State {
                status,
                start_position,
                counters: WindowCounters::default(),
            }),
            options,
        }
    }

    /// Advances the window to `position` and returns the status there, or
    /// `None` when `position` lies before the current epoch (a clock
    /// anomaly, which is logged).
    pub fn status_at(&self, position: Instant) -> Option<WindowStatus> {
        let mut state = self.state.lock().expect(ERR_POISONED_LOCK);
        self.advance(&mut state, position)
    }

    /// Records one task outcome observed at `position` into the current
    /// epoch and applies the transition rules.
    ///
    /// Updates carried by a clock anomaly are dropped, and so are updates
    /// arriving while the window is `Closed` (the window is inhibiting and
    /// the counts would be meaningless).
    pub fn record(&self, position: Instant, outcome: TaskOutcome) {
        let mut state = self.state.lock().expect(ERR_POISONED_LOCK);
        let Some(status) = self.advance(&mut state, position) else {
            return;
        };
        if status == WindowStatus::Closed {
            return;
        }

        state.counters.record(outcome);

        let counters = state.counters;
        let (failure_ratio, success_ratio) = counters.ratios();

        let options = &self.options;
        match status {
            WindowStatus::Open => {
                if failure_ratio >= options.failure_ratio_threshold
                    && options.failure_count_threshold.map_or(true, |c| counters.failure >= c)
                {
                    state.enter(WindowStatus::Closed, position);
                    debug!(
                        failures = counters.failure,
                        failure_ratio, "window tripped, inhibiting calls"
                    );
                }
            }
            WindowStatus::HalfOpen => {
                if failure_ratio >= options.failure_ratio_threshold
                    && options
                        .half_failure_count_threshold
                        .map_or(true, |c| counters.failure >= c)
                {
                    state.enter(WindowStatus::Closed, position);
                    debug!(
                        failures = counters.failure,
                        failure_ratio, "half-open probe failed, window closed again"
                    );
                } else if let Some(recovery_ratio) = options.recovery_ratio_threshold {
                    if success_ratio >= recovery_ratio
                        && options.recovery_count_threshold.map_or(true, |c| counters.success >= c)
                    {
                        state.enter(WindowStatus::Open, position);
                        debug!(
                            successes = counters.success,
                            success_ratio, "window recovered, admitting all calls"
                        );
                    }
                }
            }
            WindowStatus::Closed => {}
        }
    }

    /// A snapshot of the current epoch's counters.
    pub fn counters(&self) -> WindowCounters {
        self.state.lock().expect(ERR_POISONED_LOCK).counters
    }

    fn advance(&self, state: &mut State, position: Instant) -> Option<WindowStatus> {
        loop {
            if position < state.start_position {
                error!(
                    lag = ?state.start_position.duration_since(position),
                    "observed position lies before the current window epoch"
                );
                return None;
            }

            let length = match state.status {
                WindowStatus::Open => self.options.open_length,
                WindowStatus::HalfOpen => self.options.half_open_length,
                WindowStatus::Closed => self.options.closed_length,
            };
            let end_position = state.start_position + length;
            if position < end_position {
                return Some(state.status);
            }

            match state.status {
                // A spent observation epoch simply starts over at the
                // observed position.
                WindowStatus::Open | WindowStatus::HalfOpen => {
                    state.enter(WindowStatus::Open, position);
                    return Some(WindowStatus::Open);
                }
                // A spent inhibition epoch starts probing where it ended,
                // then re-evaluates the observed position from there.
                WindowStatus::Closed => {
                    state.enter(WindowStatus::HalfOpen, end_position);
                }
            }
        }
    }
}
