// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::borrow::Cow;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::clock::Clock;

/// Records calls that take longer than a configured threshold.
///
/// The recorder emits a `tracing` warning for every observed call whose
/// elapsed time reaches the threshold, either around a closure
/// ([`observe`][Self::observe]) or over an explicit region guarded by
/// [`start`][Self::start].
///
/// ```
/// use std::time::Duration;
///
/// use steamboat::SlowCallRecorder;
///
/// let recorder = SlowCallRecorder::new(Duration::from_millis(200));
///
/// // Warns if the lookup takes 200ms or longer.
/// let value = recorder.observe("inventory lookup", || 42);
/// assert_eq!(value, 42);
///
/// let guard = recorder.start("reconcile");
/// // ... slow region ...
/// drop(guard);
/// ```
#[derive(Debug, Clone)]
pub struct SlowCallRecorder {
    threshold: Duration,
    clock: Clock,
}

impl SlowCallRecorder {
    /// A recorder warning about calls at or above `threshold`.
    #[must_use]
    pub fn new(threshold: Duration) -> Self {
        Self::with_clock(threshold, Clock::new())
    }

    /// A recorder measuring through the provided clock.
    #[must_use]
    pub fn with_clock(threshold: Duration, clock: Clock) -> Self {
        Self { threshold, clock }
    }

    /// Starts measuring a region; the returned guard logs on drop if the
    /// region was slow.
    #[must_use]
    pub fn start(&self, label: impl Into<Cow<'static, str>>) -> SlowCallGuard {
        SlowCallGuard {
            label: label.into(),
            threshold: self.threshold,
            clock: self.clock.clone(),
            started_at: self.clock.now(),
        }
    }

    /// Runs `f`, logging if it was slow.
    pub fn observe<R>(&self, label: impl Into<Cow<'static, str>>, f: impl FnOnce() -> R) -> R {
        let guard = self.start(label);
        let result = f();
        drop(guard);
        result
    }
}

/// Guard measuring one region for a [`SlowCallRecorder`].
#[derive(Debug)]
pub struct SlowCallGuard {
    label: Cow<'static, str>,
    threshold: Duration,
    clock: Clock,
    started_at: Instant,
}

impl Drop for SlowCallGuard {
    fn drop(&mut self) {
        let elapsed = self.clock.now().saturating_duration_since(self.started_at);
        if elapsed >= self.threshold {
            warn!(
                label = %self.label,
                elapsed_ms = elapsed.as_millis(),
                threshold_ms = self.threshold.as_millis(),
                "slow call"
            );
        }
    }
}
