//! # Per-Provider Rate Limiting
//!
//! Token-bucket limiter keyed by provider name and sized from each
//! provider's declared requests-per-minute limit. The bucket starts full
//! (allowing bursts up to the per-minute allowance) and refills
//! continuously at `rpm / 60` tokens per second.
//!
//! Two entry points:
//! - [`TokenBucket::try_acquire`] never waits;
//! - [`TokenBucket::acquire`] waits up to the caller's budget and otherwise
//!   reports the refill delay, which the router converts into a synthetic
//!   `rate_limit_exceeded` carrying `retry_after_ms`.

use dashmap::DashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Outcome of a failed or aborted acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    /// The refill needed more time than the caller could spend; the payload
    /// is the computed wait in milliseconds.
    Exhausted { retry_after_ms: u64 },
    /// The ambient cancellation signal fired while waiting.
    Cancelled,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A single provider's token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Bucket sized from a requests-per-minute allowance.
    pub fn per_minute(rpm: u32) -> Self {
        let capacity = rpm.max(1) as f64;
        Self {
            capacity,
            refill_per_sec: capacity / 60.0,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take a token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait until the next token would be available.
    fn time_to_next_token(&self) -> Duration {
        let mut state = self.state.lock().unwrap();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - state.tokens) / self.refill_per_sec)
        }
    }

    /// Take a token, waiting at most `budget`. The wait also aborts when
    /// `cancel` fires.
    pub async fn acquire(
        &self,
        budget: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), AcquireError> {
        let deadline = Instant::now() + budget;
        loop {
            if self.try_acquire() {
                return Ok(());
            }
            let wait = self.time_to_next_token();
            if Instant::now() + wait > deadline {
                return Err(AcquireError::Exhausted {
                    retry_after_ms: wait.as_millis() as u64,
                });
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(AcquireError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
    }
}

/// Lazily-built bucket registry, one bucket per provider.
#[derive(Default)]
pub struct RateLimiter {
    buckets: DashMap<String, Arc<TokenBucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bucket for `provider`, created on first use from its declared
    /// per-minute limit. A limit of zero means unlimited (no bucket).
    pub fn bucket(&self, provider: &str, rpm: u32) -> Option<Arc<TokenBucket>> {
        if rpm == 0 {
            return None;
        }
        Some(
            self.buckets
                .entry(provider.to_string())
                .or_insert_with(|| Arc::new(TokenBucket::per_minute(rpm)))
                .clone(),
        )
    }
}
