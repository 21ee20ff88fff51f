// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::future::FutureControl;

/// One in-flight call as seen by the cabin's deadline supervisor.
///
/// Holds type-erased handles to both sides of the call so the supervision
/// heap does not need to know task output types. Ordered by `(deadline,
/// id)` with the reversal that turns [`std::collections::BinaryHeap`] into
/// a min-heap: the peeked entry is the one expiring first.
pub(super) struct Flight {
    pub deadline: Instant,
    pub id: u64,
    pub executor_future: Arc<dyn FutureControl>,
    pub cabin_future: Arc<dyn FutureControl>,
}

impl Flight {
    /// Whether the executor side already reached a terminal state, in which
    /// case the entry only awaits compaction.
    pub fn is_settled(&self) -> bool {
        self.executor_future.is_terminal()
    }
}

impl fmt::Debug for Flight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flight")
            .field("deadline", &self.deadline)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Flight {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for Flight {}

impl PartialOrd for Flight {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Flight {
    fn cmp(&self, other: &Self) -> Ordering {
        other.deadline.cmp(&self.deadline).then_with(|| other.id.cmp(&self.id))
    }
}
