//! Interval/timeout polling.
//!
//! `poll` re-evaluates a predicate at a fixed interval; `poll_with_backoff`
//! stretches the interval geometrically up to a cap. Both give up with
//! [`WaitError::Timeout`] once the deadline passes. The predicate is always
//! evaluated at least once.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::WaitError;

/// Geometric backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub factor: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, factor: u32) -> Self {
        Backoff {
            initial,
            max,
            factor: factor.max(1),
        }
    }

    /// Delay following `current`.
    pub fn next(&self, current: Duration) -> Duration {
        current
            .checked_mul(self.factor)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(Duration::from_millis(100), Duration::from_secs(5), 2)
    }
}

/// Poll `predicate` every `interval` until it yields `Some`, or `timeout` elapses.
pub async fn poll<T, F, Fut>(interval: Duration, timeout: Duration, predicate: F) -> Result<T, WaitError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    poll_with_backoff(Backoff::new(interval, interval, 1), timeout, predicate).await
}

/// Poll `predicate` with a growing delay between attempts.
pub async fn poll_with_backoff<T, F, Fut>(
    backoff: Backoff,
    timeout: Duration,
    mut predicate: F,
) -> Result<T, WaitError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + timeout;
    let mut delay = backoff.initial;
    loop {
        if let Some(value) = predicate().await {
            return Ok(value);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(WaitError::Timeout(timeout));
        }
        tokio::time::sleep(delay.min(deadline - now)).await;
        delay = backoff.next(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_poll_succeeds_after_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let result = poll(Duration::from_secs(1), Duration::from_secs(10), move || {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                (n == 3).then_some(n)
            }
        })
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_times_out() {
        let started = Instant::now();
        let result: Result<(), _> =
            poll(Duration::from_secs(1), Duration::from_secs(5), || async { None }).await;
        assert_eq!(result, Err(WaitError::Timeout(Duration::from_secs(5))));
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_predicate_runs_once_with_zero_timeout() {
        let result = poll(Duration::from_secs(1), Duration::ZERO, || async { Some("ready") }).await;
        assert_eq!(result, Ok("ready"));
    }

    #[test]
    fn test_backoff_growth_is_capped() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350), 2);
        let d1 = backoff.next(backoff.initial);
        let d2 = backoff.next(d1);
        assert_eq!(d1, Duration::from_millis(200));
        assert_eq!(d2, Duration::from_millis(350));
        assert_eq!(backoff.next(Duration::MAX), Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_attempt_count() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(4), 2);
        // Attempts at t=0,1,3,7 then deadline at 10 -> one more at 10.
        let result: Result<(), _> = poll_with_backoff(backoff, Duration::from_secs(10), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                None
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
    }
}
