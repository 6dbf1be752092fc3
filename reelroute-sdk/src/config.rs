//! # Router Configuration
//!
//! One configuration struct consumed at router construction. Every knob has
//! a production-safe default so `RouterConfig::default()` yields a working
//! router; tests and embedders override the handful of fields they care
//! about.
//!
//! Durations accept human-readable strings (`"60s"`, `"250ms"`) through
//! [`crate::common::duration_serde`].

use crate::models::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the router orders candidate providers for an `"auto"` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Descending `priority`, deterministic name tie-break.
    Priority,
    /// Rotate a per-router cursor over the name-sorted registry.
    RoundRobin,
    /// Sample without replacement proportional to `weight`.
    Weighted,
    /// Ascending in-flight request count.
    LeastLoaded,
    /// Ascending rolling-average latency; providers with no data sort last.
    LatencyBased,
}

/// Circuit breaker tuning, shared by every per-provider breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Consecutive retryable failures before the circuit opens.
    pub threshold: u32,
    /// How long an open circuit waits before admitting a probe.
    #[serde(with = "crate::common::duration_serde")]
    pub open_timeout: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            threshold: 5,
            open_timeout: Duration::from_secs(60),
        }
    }
}

/// Eviction policy for the hot in-memory cache tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EvictionPolicy {
    Lru,
    Lfu,
    Ttl,
}

/// Cache tier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    pub l1_max_entries: usize,
    pub l1_policy: EvictionPolicy,
    #[serde(with = "crate::common::duration_serde")]
    pub default_ttl: Duration,
    /// Whether a warm tier is attached. The router treats the warm tier as
    /// best-effort either way; this flag only controls whether writes are
    /// forwarded to it.
    pub l2_enabled: bool,
    #[serde(with = "crate::common::duration_serde")]
    pub l2_ttl: Duration,
    /// Parameter keys excluded from cache-key derivation.
    pub non_cacheable_params: Vec<String>,
    /// Negatively cache `rate_limit_exceeded` for five minutes per provider.
    pub negative_throttle: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            l1_max_entries: 1000,
            l1_policy: EvictionPolicy::Lru,
            default_ttl: Duration::from_secs(3600),
            l2_enabled: false,
            l2_ttl: Duration::from_secs(86_400),
            non_cacheable_params: vec![
                "metadata".to_string(),
                "callback_url".to_string(),
                "request_id".to_string(),
                "created_at".to_string(),
            ],
            negative_throttle: false,
        }
    }
}

/// Top-level router configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub strategy: SelectionStrategy,
    /// Applied when a request does not carry its own `timeout_ms`.
    #[serde(with = "crate::common::duration_serde")]
    pub default_timeout: Duration,
    pub default_retry: RetryConfig,
    pub breaker: BreakerSettings,
    pub cache: CacheSettings,
    /// Coalesce concurrent identical cache misses into one provider call.
    pub singleflight: bool,
    /// Sample window for the rolling latency average.
    pub latency_window: usize,
    /// Drop a provider's cached entries when its breaker opens. Off by
    /// default: cached content stays valid even if the provider is degraded.
    pub invalidate_on_open: bool,
    /// In strict mode, executing against an unregistered fixed provider is a
    /// programming error instead of a failed response.
    pub strict: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::Priority,
            default_timeout: Duration::from_secs(60),
            default_retry: RetryConfig::default(),
            breaker: BreakerSettings::default(),
            cache: CacheSettings::default(),
            singleflight: true,
            latency_window: 100,
            invalidate_on_open: false,
            strict: false,
        }
    }
}
