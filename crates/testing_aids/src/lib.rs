// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Helpers for tests that exercise threads, queues and timeouts.

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// If something (whatever) does not happen in a test within this time, the
/// test will fail.
///
/// We are conservative here and allow much time - this is only to break out
/// of infinite loops, not for any situations that are actually expected.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Executes a thread-safe function on a background thread and abandons it
/// if it does not complete before [`TEST_TIMEOUT`].
///
/// There are multiple ways for the called function to fail: it may not
/// finish in the allowed time span, or it may panic so the result is never
/// sent. In both cases the channel gets closed and the receive signals an
/// error, which surfaces here as `None`.
#[must_use]
pub fn execute_or_abandon<F, R>(f: F) -> Option<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let (sender, receiver) = mpsc::channel();

    thread::spawn(move || {
        let result = f();
        // An abandoned test closes the receiver; sending then fails, which
        // is exactly what we want.
        drop(sender.send(result));
    });

    receiver.recv_timeout(TEST_TIMEOUT).ok()
}

/// Polls `condition` until it holds or `timeout` elapses, returning whether
/// it held.
///
/// Use this instead of bare sleeps when asserting on state another thread
/// is about to reach.
#[must_use]
pub fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[test]
    fn execute_or_abandon_returns_the_result() {
        assert_eq!(execute_or_abandon(|| 2 + 2), Some(4));
    }

    #[test]
    fn execute_or_abandon_swallows_panics() {
        assert_eq!(execute_or_abandon(|| -> u32 { panic!("lost") }), None);
    }

    #[test]
    fn eventually_observes_a_delayed_condition() {
        let flag = Arc::new(AtomicBool::new(false));

        let setter = {
            let flag = Arc::clone(&flag);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                flag.store(true, Ordering::SeqCst);
            })
        };

        assert!(eventually(Duration::from_secs(5), || flag.load(Ordering::SeqCst)));
        setter.join().expect("join");
    }

    #[test]
    fn eventually_gives_up_after_the_timeout() {
        assert!(!eventually(Duration::from_millis(50), || false));
    }
}
