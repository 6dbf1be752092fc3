//! # Retry Engine
//!
//! Bounded exponential backoff with jitter, applied to one provider at a
//! time. Fallback across providers is the router's concern; this module
//! only decides whether and when to re-attempt the *same* provider.
//!
//! Delay schedule for attempt `n` (0-indexed):
//!
//! - `rate_limit_exceeded`: `max(retry_after_ms, 60_000)` — the provider
//!   told us when to come back, and we never come back sooner than a
//!   minute.
//! - everything else retryable: `base_delay_ms * 2^n`, scaled by a uniform
//!   ±30% jitter to avoid thundering-herd retries.
//!
//! Every delay is capped by the enclosing request deadline: if waiting
//! would overshoot it, the engine gives up and returns the last error.

use crate::error::{ErrorCode, ErrorDetails};
use crate::models::RetryConfig;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Minimum wait after a rate-limit rejection, even when the provider
/// advertises a shorter `retry_after`.
pub const RATE_LIMIT_FLOOR_MS: u64 = 60_000;

/// Result of a retried operation plus how many attempts it took.
pub struct RetryOutcome<T> {
    pub result: Result<T, ErrorDetails>,
    pub attempts: u32,
}

/// Delay before re-attempting after `error` on 0-indexed attempt `attempt`.
pub fn backoff_delay(config: &RetryConfig, attempt: u32, error: &ErrorDetails) -> Duration {
    if error.code == ErrorCode::RateLimitExceeded {
        let hinted = error.retry_after_ms.unwrap_or(0);
        return Duration::from_millis(hinted.max(RATE_LIMIT_FLOOR_MS));
    }
    let exponent = attempt.min(20); // beyond 2^20 the deadline cap decides anyway
    let base = config.base_delay_ms.saturating_mul(1u64 << exponent) as f64;
    let jitter = rand::thread_rng().gen_range(0.7..=1.3);
    Duration::from_millis((base * jitter) as u64)
}

/// Run `operation` with the configured retry schedule.
///
/// The operation receives the 0-indexed attempt number. `on_retry` fires
/// before each backoff sleep with the upcoming attempt count and delay so
/// the caller can emit telemetry. Cancellation during a backoff sleep
/// resolves to a `timeout` error.
pub async fn run_with_retry<T, F, Fut, OnRetry>(
    config: &RetryConfig,
    deadline: Instant,
    cancel: &CancellationToken,
    mut on_retry: OnRetry,
    mut operation: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ErrorDetails>>,
    OnRetry: FnMut(u32, Duration),
{
    let mut attempts: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return RetryOutcome {
                result: Err(cancelled_error()),
                attempts,
            };
        }

        let result = operation(attempts).await;
        attempts += 1;

        let error = match result {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts,
                }
            }
            Err(error) => error,
        };

        let give_up = !error.retryable
            || (error.code.retry_once_only() && attempts >= 2)
            || attempts > config.max_retries;
        if give_up {
            return RetryOutcome {
                result: Err(error),
                attempts,
            };
        }

        let delay = backoff_delay(config, attempts - 1, &error);
        if Instant::now() + delay > deadline {
            tracing::debug!(
                attempts,
                ?delay,
                "backoff would overshoot the request deadline, giving up"
            );
            return RetryOutcome {
                result: Err(error),
                attempts,
            };
        }

        on_retry(attempts, delay);
        tokio::select! {
            _ = cancel.cancelled() => {
                return RetryOutcome {
                    result: Err(cancelled_error()),
                    attempts,
                };
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn cancelled_error() -> ErrorDetails {
    ErrorDetails::new(ErrorCode::Timeout, "request cancelled before completion")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn config(max_retries: u32, base_delay_ms: u64) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay_ms,
        }
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(3600)
    }

    #[test]
    fn rate_limit_delay_honors_the_floor_and_the_hint() {
        let cfg = config(3, 1000);
        let short_hint = ErrorDetails::new(ErrorCode::RateLimitExceeded, "slow").with_retry_after(5_000);
        assert_eq!(
            backoff_delay(&cfg, 0, &short_hint),
            Duration::from_millis(60_000)
        );

        let long_hint =
            ErrorDetails::new(ErrorCode::RateLimitExceeded, "slow").with_retry_after(120_000);
        assert_eq!(
            backoff_delay(&cfg, 0, &long_hint),
            Duration::from_millis(120_000)
        );
    }

    #[test]
    fn exponential_delay_stays_within_jitter_bounds() {
        let cfg = config(3, 1000);
        let err = ErrorDetails::new(ErrorCode::ProviderError, "boom");
        for attempt in 0..4u32 {
            let expected = 1000u64 * (1 << attempt);
            let low = Duration::from_millis((expected as f64 * 0.7) as u64);
            let high = Duration::from_millis((expected as f64 * 1.3) as u64 + 1);
            for _ in 0..20 {
                let delay = backoff_delay(&cfg, attempt, &err);
                assert!(delay >= low && delay <= high, "attempt {attempt}: {delay:?}");
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_errors_return_after_one_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let outcome = run_with_retry::<(), _, _, _>(
            &config(3, 10),
            far_deadline(),
            &CancellationToken::new(),
            |_, _| {},
            move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ErrorDetails::new(ErrorCode::AuthenticationFailed, "denied"))
                }
            },
        )
        .await;
        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(outcome.result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_errors_exhaust_the_schedule() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let outcome = run_with_retry::<(), _, _, _>(
            &config(3, 10),
            far_deadline(),
            &CancellationToken::new(),
            |_, _| {},
            move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ErrorDetails::new(ErrorCode::ProviderError, "boom"))
                }
            },
        )
        .await;
        // Initial attempt plus three retries.
        assert_eq!(outcome.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_errors_retry_at_most_once() {
        let outcome = run_with_retry::<(), _, _, _>(
            &config(5, 10),
            far_deadline(),
            &CancellationToken::new(),
            |_, _| {},
            |_| async { Err(ErrorDetails::new(ErrorCode::UnknownError, "???")) },
        )
        .await;
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_midway_through_the_schedule() {
        let outcome = run_with_retry(
            &config(3, 10),
            far_deadline(),
            &CancellationToken::new(),
            |_, _| {},
            |attempt| async move {
                if attempt < 2 {
                    Err(ErrorDetails::new(ErrorCode::Timeout, "slow"))
                } else {
                    Ok(attempt)
                }
            },
        )
        .await;
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.result.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_caps_the_backoff() {
        // Base delay of 10s but only ~1s of budget: the first failure is
        // also the last.
        let outcome = run_with_retry::<(), _, _, _>(
            &config(3, 10_000),
            Instant::now() + Duration::from_secs(1),
            &CancellationToken::new(),
            |_, _| {},
            |_| async { Err(ErrorDetails::new(ErrorCode::ProviderError, "boom")) },
        )
        .await;
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_resolves_to_timeout() {
        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_with_retry::<(), _, _, _>(
                    &config(3, 60_000),
                    Instant::now() + Duration::from_secs(3600),
                    &cancel,
                    |_, _| {},
                    |_| async { Err(ErrorDetails::new(ErrorCode::ProviderError, "boom")) },
                )
                .await
            })
        };
        tokio::time::advance(Duration::from_millis(100)).await;
        cancel.cancel();
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.result.unwrap_err().code, ErrorCode::Timeout);
    }
}
