//! Retry with exponential backoff.
//!
//! Wraps the `backon` crate for the plain case and carries a manual loop for
//! the cancellable case the fan-out writer needs: must-succeed writes retry
//! with backoff, but only until the caller's `CancellationToken` fires.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use plaza_types::config::RetryPolicy;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::counters::CounterError;
use crate::edges::EdgeError;
use crate::engine::BackendError;
use crate::records::RecordError;
use crate::repair::WriteError;

/// Classifies errors for the retry loops.
pub trait RetryableError: fmt::Display {
    /// Whether retrying the same operation can succeed.
    fn is_retryable(&self) -> bool;
}

impl RetryableError for BackendError {
    fn is_retryable(&self) -> bool {
        self.is_retryable()
    }
}

impl RetryableError for RecordError {
    fn is_retryable(&self) -> bool {
        self.is_retryable()
    }
}

impl RetryableError for CounterError {
    fn is_retryable(&self) -> bool {
        self.is_retryable()
    }
}

impl RetryableError for WriteError {
    fn is_retryable(&self) -> bool {
        self.is_retryable()
    }
}

impl RetryableError for EdgeError {
    fn is_retryable(&self) -> bool {
        matches!(self, EdgeError::Backend { source } if source.is_retryable())
    }
}

/// Terminal outcome of a retried operation.
#[derive(Debug)]
pub enum RetryFailure<E> {
    /// The error was not retryable; returned as-is after one attempt.
    Rejected(E),
    /// Every permitted attempt failed with a retryable error.
    Exhausted {
        /// Attempts made, counting the first.
        attempts: u32,
        /// Error from the final attempt.
        last: E,
    },
    /// The cancellation token fired before an attempt succeeded.
    Cancelled,
}

impl<E: fmt::Display> fmt::Display for RetryFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(err) => write!(f, "rejected: {err}"),
            Self::Exhausted { attempts, last } => {
                write!(f, "exhausted after {attempts} attempts: {last}")
            },
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

impl<E: fmt::Display + fmt::Debug> std::error::Error for RetryFailure<E> {}

/// Executes an async operation with exponential backoff per `policy`.
///
/// Non-retryable errors return immediately; retryable ones back off
/// `initial_backoff * multiplier^(attempt-1)` with ±`jitter`, capped at
/// `max_backoff`, until `max_attempts` total attempts have been made.
pub async fn with_retry<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation: F,
) -> Result<T, RetryFailure<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError,
{
    // backon's max_times counts retries, not total attempts.
    let max_retries = policy.max_attempts.saturating_sub(1) as usize;
    let jitter_factor = policy.jitter;

    let backoff = ExponentialBuilder::new()
        .with_min_delay(policy.initial_backoff)
        .with_max_delay(policy.max_backoff)
        .with_factor(policy.multiplier as f32)
        .with_max_times(max_retries);

    let attempt_count = std::sync::atomic::AtomicU32::new(0);

    operation
        .retry(backoff)
        .sleep(tokio::time::sleep)
        .when(|e: &E| e.is_retryable())
        .notify(|err: &E, dur: Duration| {
            let attempt = attempt_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            let jittered = apply_jitter(dur, jitter_factor);
            tracing::debug!(
                attempt = attempt,
                backoff_ms = jittered.as_millis() as u64,
                error = %err,
                "retrying after backoff"
            );
        })
        .await
        .map_err(|e| {
            if e.is_retryable() {
                let attempts = attempt_count.load(std::sync::atomic::Ordering::SeqCst) + 1;
                RetryFailure::Exhausted { attempts, last: e }
            } else {
                RetryFailure::Rejected(e)
            }
        })
}

/// Like [`with_retry`], but races every attempt and every backoff sleep
/// against `token`.
///
/// A token already cancelled at call time returns [`RetryFailure::Cancelled`]
/// without running the operation; cancellation mid-attempt drops the in-flight
/// future.
pub async fn with_retry_cancellable<F, Fut, T, E>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryFailure<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError,
{
    if token.is_cancelled() {
        return Err(RetryFailure::Cancelled);
    }

    let mut attempt: u32 = 0;
    let mut backoff = policy.initial_backoff;

    loop {
        attempt += 1;

        let result = tokio::select! {
            biased;
            () = token.cancelled() => {
                return Err(RetryFailure::Cancelled);
            }
            result = operation() => result,
        };

        match result {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_retryable() {
                    return Err(RetryFailure::Rejected(err));
                }
                if attempt >= policy.max_attempts {
                    return Err(RetryFailure::Exhausted { attempts: attempt, last: err });
                }

                let jittered = apply_jitter(backoff, policy.jitter);
                tracing::debug!(
                    attempt = attempt,
                    backoff_ms = jittered.as_millis() as u64,
                    error = %err,
                    "retrying after backoff (cancellable)"
                );

                tokio::select! {
                    biased;
                    () = token.cancelled() => {
                        return Err(RetryFailure::Cancelled);
                    }
                    () = tokio::time::sleep(jittered) => {}
                }

                backoff = std::cmp::min(
                    Duration::from_nanos(
                        (backoff.as_nanos() as f64 * policy.multiplier) as u64,
                    ),
                    policy.max_backoff,
                );
            },
        }
    }
}

/// Applies ±`factor` randomness to a duration.
///
/// Spreads out simultaneous retriers so a recovering backend is not hit by
/// a synchronized burst.
fn apply_jitter(dur: Duration, factor: f64) -> Duration {
    if factor <= 0.0 {
        return dur;
    }

    let factor = factor.clamp(0.0, 1.0);
    let mut rng = rand::rng();

    let base_nanos = dur.as_nanos() as f64;
    let min_nanos = base_nanos * (1.0 - factor);
    let max_nanos = base_nanos * (1.0 + factor);

    let jittered_nanos = rng.random_range(min_nanos..=max_nanos);
    Duration::from_nanos(jittered_nanos as u64)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use super::*;
    use crate::tables::TableId;

    fn test_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    fn unavailable() -> BackendError {
        BackendError::Unavailable { table: TableId::Posts, message: "down".to_string() }
    }

    fn wrong_kind() -> BackendError {
        BackendError::WrongTableKind { table: TableId::Posts, message: "bad".to_string() }
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result = with_retry(&test_policy(), || {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BackendError>("done")
            }
        })
        .await;

        assert_eq!(result.expect("ok"), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result = with_retry(&test_policy(), || {
            let calls = Arc::clone(&calls_clone);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(unavailable())
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.expect("ok"), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_exhausts_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result: Result<(), _> = with_retry(&test_policy(), || {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(unavailable())
            }
        })
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, RetryFailure::Exhausted { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_returns_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result: Result<(), _> = with_retry(&test_policy(), || {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(wrong_kind())
            }
        })
        .await;

        assert!(matches!(result.unwrap_err(), RetryFailure::Rejected(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellable_pre_cancelled_token() {
        let token = CancellationToken::new();
        token.cancel();

        let result = with_retry_cancellable(&test_policy(), &token, || async {
            Ok::<_, BackendError>("unreachable")
        })
        .await;

        assert!(matches!(result.unwrap_err(), RetryFailure::Cancelled));
    }

    #[tokio::test]
    async fn test_cancellable_cancelled_during_backoff() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(10),
            multiplier: 1.0,
            jitter: 0.0,
        };
        let token = CancellationToken::new();
        let token_clone = token.clone();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token_clone.cancel();
        });

        let start = std::time::Instant::now();
        let result: Result<(), _> = with_retry_cancellable(&policy, &token, || {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(unavailable())
            }
        })
        .await;

        assert!(matches!(result.unwrap_err(), RetryFailure::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_cancellable_retries_until_success() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result = with_retry_cancellable(&test_policy(), &token, || {
            let calls = Arc::clone(&calls_clone);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(unavailable())
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.expect("ok"), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_apply_jitter_zero_factor_is_identity() {
        let dur = Duration::from_millis(100);
        assert_eq!(apply_jitter(dur, 0.0), dur);
    }

    #[test]
    fn test_apply_jitter_within_bounds() {
        let dur = Duration::from_millis(1000);
        for _ in 0..100 {
            let jittered_ms = apply_jitter(dur, 0.25).as_millis();
            assert!((750..=1250).contains(&jittered_ms), "{jittered_ms}ms out of bounds");
        }
    }
}
