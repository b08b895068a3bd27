//! Bounded exponential-backoff retry for transient backend failures.
//!
//! Every backend operation runs through [`with_retry`] with its own
//! [`RetryPolicy`]. Only [`BackendError::is_transient`] failures are
//! retried; once the attempt ceiling is reached the last error is
//! wrapped in [`BackendError::RetriesExhausted`].

use std::future::Future;
use std::time::Duration;

use crate::backend::BackendError;

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// One policy per backend operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryPolicies {
    /// Image upload and prompt submission.
    pub submit: RetryPolicy,
    pub poll: RetryPolicy,
    /// Result lookup and output download.
    pub fetch: RetryPolicy,
}

impl RetryPolicies {
    pub fn uniform(policy: RetryPolicy) -> Self {
        Self {
            submit: policy.clone(),
            poll: policy.clone(),
            fetch: policy,
        }
    }
}

/// Calculate the next backoff delay from the current delay and policy.
///
/// The result is clamped to [`RetryPolicy::max_delay`].
pub fn next_delay(current: Duration, policy: &RetryPolicy) -> Duration {
    let next_ms = (current.as_millis() as f64 * policy.multiplier) as u64;
    Duration::from_millis(next_ms).min(policy.max_delay)
}

/// Run `op` until it succeeds, fails permanently, or exhausts the policy.
pub async fn with_retry<T, F, Fut>(
    operation: &'static str,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut delay = policy.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_transient() {
            return Err(err);
        }

        if attempt >= max_attempts {
            tracing::warn!(operation, attempts = attempt, error = %err, "Retry ceiling reached");
            return Err(BackendError::RetriesExhausted {
                operation,
                attempts: attempt,
                last: Box::new(err),
            });
        }

        tracing::warn!(
            operation,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Transient backend failure, retrying",
        );
        tokio::time::sleep(delay).await;
        delay = next_delay(delay, policy);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn next_delay_doubles() {
        let policy = RetryPolicy::default();
        let d = next_delay(Duration::from_secs(1), &policy);
        assert_eq!(d, Duration::from_secs(2));
    }

    #[test]
    fn next_delay_clamps_at_max() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        let d = next_delay(Duration::from_secs(8), &policy);
        assert_eq!(d, Duration::from_secs(10));
    }

    #[test]
    fn custom_multiplier() {
        let policy = RetryPolicy {
            multiplier: 3.0,
            max_delay: Duration::from_secs(60),
            ..Default::default()
        };
        let d = next_delay(Duration::from_secs(2), &policy);
        assert_eq!(d, Duration::from_secs(6));
    }

    #[test]
    fn full_backoff_sequence() {
        let policy = RetryPolicy::default();
        let mut delay = policy.initial_delay;
        let expected = [1, 2, 4, 8, 16, 30, 30, 30];

        for &expected_secs in &expected {
            assert_eq!(delay.as_secs(), expected_secs);
            delay = next_delay(delay, &policy);
        }
    }

    // -- with_retry --

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_success() {
        let calls = &AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result = with_retry("poll", &RetryPolicy::default(), || async move {
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => Err(BackendError::Unavailable("connection refused".into())),
                _ => Ok("done"),
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Slept 1s then 2s.
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_is_never_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = with_retry("submit", &RetryPolicy::default(), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(BackendError::Rejected("invalid prompt".into()))
        })
        .await;

        assert_matches!(result, Err(BackendError::Rejected(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_wraps_last_error() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };
        let result: Result<(), _> = with_retry("submit", &policy, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(BackendError::Unavailable("503".into()))
        })
        .await;

        assert_matches!(
            result,
            Err(BackendError::RetriesExhausted { operation: "submit", attempts: 3, last })
                if matches!(*last, BackendError::Unavailable(_))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_still_tries_once() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 0,
            ..Default::default()
        };
        let result: Result<(), _> = with_retry("poll", &policy, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(BackendError::Unavailable("down".into()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
