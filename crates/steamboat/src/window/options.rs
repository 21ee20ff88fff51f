// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

/// Epoch lengths and transition thresholds of a [`Window`][super::Window].
///
/// The three lengths bound the epochs of the corresponding statuses. The
/// thresholds drive the transitions evaluated on every recorded outcome:
///
/// - In `Open`, the window trips to `Closed` when the failure ratio reaches
///   `failure_ratio_threshold` and, if set, the failure count reaches
///   `failure_count_threshold`.
/// - In `HalfOpen`, the same trip rule applies against
///   `half_failure_count_threshold`; otherwise the window recovers to `Open`
///   when `recovery_ratio_threshold` is set, the success ratio reaches it
///   and, if set, the success count reaches `recovery_count_threshold`.
#[derive(Debug, Clone)]
pub struct WindowOptions {
    /// Length of an `Open` epoch.
    pub open_length: Duration,
    /// Length of a `Closed` epoch.
    pub closed_length: Duration,
    /// Length of a `HalfOpen` epoch.
    pub half_open_length: Duration,
    /// Failure ratio at which the window trips.
    pub failure_ratio_threshold: f64,
    /// Minimum failures before an `Open` window may trip; `None` disables
    /// the count gate.
    pub failure_count_threshold: Option<u64>,
    /// Minimum failures before a `HalfOpen` window may trip back.
    pub half_failure_count_threshold: Option<u64>,
    /// Success ratio required for recovery; `None` disables recovery.
    pub recovery_ratio_threshold: Option<f64>,
    /// Minimum successes before a `HalfOpen` window may recover; `None`
    /// disables the count gate.
    pub recovery_count_threshold: Option<u64>,
}
