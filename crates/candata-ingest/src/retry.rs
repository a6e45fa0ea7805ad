//! Exponential-backoff retry around fallible async operations
//!
//! The delay after failed attempt `n` is `min(base_delay * 2^(n-1), max_delay)`.
//! A server-supplied delay (`Retry-After`) replaces the computed one but is
//! still capped at `max_delay`. Only errors accepted by the caller's
//! `retry_on` predicate are retried; anything else is returned after the
//! first attempt.
//!
//! ```rust,ignore
//! let policy = RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(30));
//! let body = with_retry(&policy, "fetch_series", || async {
//!     client.get(url).send().await?.error_for_status()?.text().await.map_err(Into::into)
//! })
//! .await?;
//! ```

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

use crate::error::IngestError;

/// Default total attempts
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the second attempt
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default ceiling for any single delay
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Errors that may carry a server-supplied retry delay
pub trait RetryHint {
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl RetryHint for IngestError {
    fn retry_after(&self) -> Option<Duration> {
        IngestError::retry_after(self)
    }
}

/// Outcome of a retried operation that did not succeed
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The error was not retryable and was returned on first occurrence
    #[error("{0}")]
    Permanent(E),

    /// Every attempt failed with a retryable error
    #[error("retry exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Permanent(e) => e,
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

/// Bounded exponential backoff parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Attempts actually made; zero is treated as one
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay after failed attempt `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let backoff = 2u32
            .checked_pow(exponent)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(self.max_delay);
        backoff.min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent
    pub async fn run<T, E, F, Fut, P>(
        &self,
        operation: &str,
        retry_on: P,
        mut op: F,
    ) -> std::result::Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        P: Fn(&E) -> bool,
        E: RetryHint + Display,
    {
        let max_attempts = self.attempts();
        let mut attempt = 1;

        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !retry_on(&err) {
                error!(operation, attempt, error = %err, "call failed with non-retryable error");
                return Err(RetryError::Permanent(err));
            }

            if attempt >= max_attempts {
                error!(operation, max_attempts, error = %err, "retry exhausted");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }

            let delay = err
                .retry_after()
                .map(|hinted| hinted.min(self.max_delay))
                .unwrap_or_else(|| self.delay_for(attempt));

            warn!(
                operation,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retry attempt"
            );

            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Retry an ingestion call on transient errors only
///
/// Terminal errors (401/403, malformed requests, out-of-memory) come back
/// unchanged; an exhausted budget becomes [`IngestError::RetryExhausted`].
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    op: F,
) -> std::result::Result<T, IngestError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, IngestError>>,
{
    policy
        .run(operation, IngestError::is_transient, op)
        .await
        .map_err(|err| match err {
            RetryError::Permanent(e) => e,
            RetryError::Exhausted { attempts, last } => IngestError::RetryExhausted {
                attempts,
                source: Box::new(last),
            },
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    fn server_error() -> IngestError {
        IngestError::Http {
            status: 503,
            url: "http://upstream".into(),
        }
    }

    #[test]
    fn test_delay_schedule_is_capped() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1), Duration::from_secs(30));
        let delays: Vec<u64> = (1..=7).map(|n| policy.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);

        // Overflowing exponents fall back to the cap
        assert_eq!(policy.delay_for(200), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1));

        let value = with_retry(&policy, "flaky", || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(server_error())
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_fails_fast() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();

        let err = with_retry(&policy, "auth", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<(), _>(IngestError::Unauthorized {
                    status: 401,
                    url: "http://api".into(),
                })
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, IngestError::Unauthorized { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_k_calls_and_delays_capped() {
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let policy = RetryPolicy::new(6, Duration::from_secs(1), Duration::from_secs(5));

        let err = with_retry(&policy, "down", || {
            stamps.lock().unwrap().push(Instant::now());
            async { Err::<(), _>(server_error()) }
        })
        .await
        .unwrap_err();

        match err {
            IngestError::RetryExhausted { attempts, source } => {
                assert_eq!(attempts, 6);
                assert!(matches!(*source, IngestError::Http { status: 503, .. }));
            },
            other => panic!("unexpected error: {other:?}"),
        }

        let stamps = stamps.lock().unwrap();
        assert_eq!(stamps.len(), 6);
        let gaps: Vec<Duration> = stamps.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![1, 2, 4, 5, 5]
                .into_iter()
                .map(Duration::from_secs)
                .collect::<Vec<_>>()
        );
        assert!(gaps.iter().all(|gap| *gap <= policy.max_delay));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_is_honored_and_capped() {
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_secs(20));

        let _ = with_retry(&policy, "throttled", || {
            let n = {
                let mut stamps = stamps.lock().unwrap();
                stamps.push(Instant::now());
                stamps.len()
            };
            async move {
                let hint = if n == 1 { 5 } else { 600 };
                Err::<(), _>(IngestError::RateLimited {
                    retry_after: Some(Duration::from_secs(hint)),
                })
            }
        })
        .await;

        let stamps = stamps.lock().unwrap();
        assert_eq!(stamps[1] - stamps[0], Duration::from_secs(5));
        assert_eq!(stamps[2] - stamps[1], Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_predicate_and_zero_attempts() {
        #[derive(Debug)]
        struct Flaky;
        impl Display for Flaky {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("flaky")
            }
        }
        impl RetryHint for Flaky {}

        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(0, Duration::from_millis(1), Duration::from_millis(1));
        let result = policy
            .run("zero", |_: &Flaky| true, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Flaky) }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
