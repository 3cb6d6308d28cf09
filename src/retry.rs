//! Bounded retry with exponential backoff.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Backoff {
    /// Total number of attempts, including the first one.
    pub(crate) attempts: u32,
    /// Sleep before the second attempt; doubled after every retry.
    pub(crate) initial_delay: Duration,
}

impl Backoff {
    pub(crate) fn new(attempts: u32, initial_delay: Duration) -> Self {
        Self {
            attempts,
            initial_delay,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(10))
    }
}

/// Runs `op` until it succeeds, fails with an error `is_retryable` rejects, or
/// the attempt budget is spent. `op` receives the 1-based attempt number.
///
/// A budget of zero still makes one attempt.
pub(crate) async fn retry_if<T, E, Op, Fut, P>(
    backoff: Backoff,
    mut op: Op,
    is_retryable: P,
) -> Result<T, E>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let attempts = backoff.attempts.max(1);
    let mut delay = backoff.initial_delay;
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts && is_retryable(&err) => {
                warn!(
                    attempt,
                    attempts,
                    delay_secs = delay.as_secs_f64(),
                    error = %err,
                    "Transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn doubles_delay_between_attempts() {
        let started = Instant::now();
        let mut seen = Vec::new();
        let result: Result<u32, String> = retry_if(
            Backoff::default(),
            |attempt| {
                seen.push(started.elapsed().as_secs());
                async move {
                    if attempt < 4 {
                        Err("busy".to_owned())
                    } else {
                        Ok(attempt)
                    }
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result, Ok(4));
        assert_eq!(seen, vec![0, 10, 30, 70]);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_non_retryable_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry_if(
            Backoff::default(),
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("bad request".to_owned()) }
            },
            |err| err.contains("busy"),
        )
        .await;

        assert_eq!(result, Err("bad request".to_owned()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_budget_still_attempts_once() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry_if(
            Backoff::new(0, Duration::from_secs(1)),
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("busy".to_owned()) }
            },
            |_| true,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
