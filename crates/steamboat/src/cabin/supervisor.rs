// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::mem;
use std::sync::Arc;

use tracing::{debug, info};

use crate::cabin::CabinCore;
use crate::cabin::flight::Flight;
use crate::constants::ERR_POISONED_LOCK;

/// Deadline supervisor loop, run on the dedicated thread owned by a cabin.
///
/// The supervisor sleeps on the cabin's condition until the earliest
/// deadline in the supervision heap, expires overdue flights and compacts
/// settled entries out of the heap on every pass. Expiry work runs with the
/// condition released: completing a future invokes user callbacks and must
/// not happen under any lock.
pub(super) fn run(core: &Arc<CabinCore>) {
    debug!(cabin = %core.name, "deadline supervisor started");

    let mut state = core.state.lock().expect(ERR_POISONED_LOCK);
    loop {
        if state.shutdown {
            break;
        }

        // Compaction: drop every settled flight and restart the completed
        // counter that triggered it.
        let pending = mem::take(&mut state.pending);
        state.pending = pending.into_iter().filter(|flight| !flight.is_settled()).collect();
        state.completed = 0;

        if state.pending.is_empty() {
            state = core.signal.wait(state).expect(ERR_POISONED_LOCK);
            continue;
        }

        let now = core.clock.now();
        let deadline = match state.pending.peek() {
            Some(top) => top.deadline,
            None => continue,
        };
        if deadline <= now {
            let Some(flight) = state.pending.pop() else {
                continue;
            };
            drop(state);
            expire(core, &flight);
            state = core.state.lock().expect(ERR_POISONED_LOCK);
        } else {
            let (guard, _) = core
                .signal
                .wait_timeout(state, deadline - now)
                .expect(ERR_POISONED_LOCK);
            state = guard;
        }
    }

    state.supervisor_exited = true;
    core.signal.notify_all();
    drop(state);
    info!(cabin = %core.name, "deadline supervisor exited");
}

/// Times out one overdue flight.
///
/// The cabin future is claimed first; winning the claim makes this thread
/// the sole owner of the call's completion, so the executor future can be
/// cancelled (stopping a not-yet-started task) and the timeout recorded
/// without racing the worker. Losing the claim means the call completed in
/// the meantime and there is nothing to do.
fn expire(core: &Arc<CabinCore>, flight: &Flight) {
    match flight.cabin_future.claim() {
        Ok(true) => {}
        Ok(false) | Err(_) => return,
    }

    flight.executor_future.cancel_if_pending();

    let now = core.clock.now();
    core.window.record(now, crate::window::TaskOutcome::Timeout);

    flight.cabin_future.merge_time_info(&flight.executor_future.time_info());
    flight
        .cabin_future
        .stamp(crate::future::TimeEvent::LeftCabin, now);
    flight
        .cabin_future
        .fail(crate::error::CallError::TimeoutReached(core.timeout));

    debug!(cabin = %core.name, id = flight.id, timeout = ?core.timeout, "task deadline reached");
}
