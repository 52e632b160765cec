//! Bounded register polling.
//!
//! Every busy-wait in the driver goes through [`poll_until`]: a predicate that is retried at a
//! fixed interval until it yields a value or a deadline measured on a monotonic [`Clock`] passes.

use std::time::{Duration, Instant};

use retry::{delay::Fixed, retry, OperationResult};

use crate::{Error, Result};

/// Source of monotonic time for deadlines
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The wall clock: `Instant::now()`
#[derive(Debug, Default, Copy, Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Retry `condition` every `interval` until it returns `Some`, or fail with
/// [`Error::Timeout`] naming `what` once `timeout` has elapsed on `clock`.
///
/// The condition is always evaluated at least once, so an already-satisfied condition succeeds
/// even with a zero timeout.
pub fn poll_until<T, F>(
    clock: &dyn Clock,
    timeout: Duration,
    interval: Duration,
    what: &'static str,
    mut condition: F,
) -> Result<T>
where
    F: FnMut() -> Option<T>,
{
    let deadline = clock.now() + timeout;
    let delays = Fixed::from(interval).take_while(|_| clock.now() < deadline);

    retry(delays, || match condition() {
        Some(value) => OperationResult::Ok(value),
        None => OperationResult::Retry(()),
    })
    .map_err(|_| {
        log::error!("Timeout while waiting for {what}");
        Error::Timeout(what)
    })
}

#[cfg(test)]
use std::sync::atomic::{AtomicU32, Ordering};

/// A clock that jumps forward by a fixed step every time it is read
#[cfg(test)]
struct SteppingClock {
    base: Instant,
    ticks: AtomicU32,
    step: Duration,
}

#[cfg(test)]
impl Clock for SteppingClock {
    fn now(&self) -> Instant {
        let ticks = self.ticks.fetch_add(1, Ordering::Relaxed);
        self.base + self.step * ticks
    }
}

#[test]
fn test_poll_succeeds_after_retries() {
    let mut calls = 0;
    let result = poll_until(
        &SystemClock,
        Duration::from_secs(1),
        Duration::from_micros(1),
        "the third call",
        || {
            calls += 1;
            (calls == 3).then_some(calls)
        },
    );
    assert_eq!(result.unwrap(), 3);
}

#[test]
fn test_poll_times_out_on_clock() {
    let clock = SteppingClock {
        base: Instant::now(),
        ticks: AtomicU32::new(0),
        step: Duration::from_millis(300),
    };
    let mut calls = 0u32;
    let result: Result<()> = poll_until(
        &clock,
        Duration::from_secs(1),
        Duration::from_micros(1),
        "nothing",
        || {
            calls += 1;
            None
        },
    );
    assert!(matches!(result, Err(Error::Timeout("nothing"))));
    // 300ms steps against a 1s budget leave room for only a handful of attempts
    assert!(calls <= 5);
}

#[test]
fn test_poll_zero_timeout_checks_once() {
    let result = poll_until(
        &SystemClock,
        Duration::ZERO,
        Duration::from_millis(10),
        "ready",
        || Some(()),
    );
    assert!(result.is_ok());
}
