//! # Error Taxonomy
//!
//! Every failure that crosses a component boundary in this crate is expressed
//! as an [`ErrorDetails`] value carrying a code from the closed [`ErrorCode`]
//! set. Providers speak their own dialects of HTTP statuses and error bodies;
//! adapters translate those into this taxonomy so the router, retry engine
//! and circuit breaker only ever reason over the closed set.
//!
//! The classification drives three independent decisions:
//!
//! - **Retry**: `retryable()` errors may be retried against the same provider
//!   within the request budget.
//! - **Fallback**: non-retryable errors abort the whole routed call — they
//!   indicate a caller mistake that no other provider can fix.
//! - **Breaker accounting**: only `counts_for_breaker()` errors mark a
//!   provider as unhealthy. Rate limiting and caller errors never trip it.
//!
//! [`RouterError`] is reserved for programming errors (misconfiguration,
//! unknown provider in strict mode). User-visible failures are always
//! returned as a failed response, never as a `RouterError`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of error codes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed or unsupported request; the caller must change the request.
    InvalidRequest,
    /// API key rejected or missing.
    AuthenticationFailed,
    /// Account balance or quota exhausted.
    InsufficientCredits,
    /// Prompt or reference media rejected by the provider's safety system.
    ContentPolicyViolation,
    /// Model identifier unknown to the provider.
    InvalidModel,
    /// Provider throttled the request; retry after the advertised delay.
    RateLimitExceeded,
    /// Provider-side failure (5xx or malformed success payload).
    ProviderError,
    /// The call exceeded its deadline.
    Timeout,
    /// Transport-level failure before an HTTP status was received.
    NetworkError,
    /// Unclassifiable failure; retried at most once.
    UnknownError,
}

impl ErrorCode {
    /// Whether the retry engine may re-attempt the same provider.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::RateLimitExceeded
                | ErrorCode::ProviderError
                | ErrorCode::Timeout
                | ErrorCode::NetworkError
                | ErrorCode::UnknownError
        )
    }

    /// Ambiguous errors get a single retry, not the full schedule.
    pub fn retry_once_only(&self) -> bool {
        matches!(self, ErrorCode::UnknownError)
    }

    /// Whether a failure with this code increments the provider's
    /// consecutive-failure counter. Caller errors and throttling do not:
    /// they say nothing about provider health.
    pub fn counts_for_breaker(&self) -> bool {
        matches!(
            self,
            ErrorCode::ProviderError | ErrorCode::Timeout | ErrorCode::NetworkError
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::AuthenticationFailed => "authentication_failed",
            ErrorCode::InsufficientCredits => "insufficient_credits",
            ErrorCode::ContentPolicyViolation => "content_policy_violation",
            ErrorCode::InvalidModel => "invalid_model",
            ErrorCode::RateLimitExceeded => "rate_limit_exceeded",
            ErrorCode::ProviderError => "provider_error",
            ErrorCode::Timeout => "timeout",
            ErrorCode::NetworkError => "network_error",
            ErrorCode::UnknownError => "unknown_error",
        }
    }
}

/// Structured error payload attached to failed responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub details: serde_json::Map<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorDetails {
    /// Create an error with `retryable` derived from the code.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            provider: None,
            retryable: code.retryable(),
            retry_after_ms: None,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            details: serde_json::Map::new(),
            timestamp: Utc::now(),
        }
    }

    /// Shorthand for validation failures; records the offending field under
    /// `details.field`.
    pub fn invalid_field(field: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message).with_detail("field", field)
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_retry_after(mut self, retry_after_ms: u64) -> Self {
        self.retry_after_ms = Some(retry_after_ms);
        self
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// Programming errors that abort a call instead of producing a failed
/// response. These indicate bugs in the embedding application, not provider
/// or caller-input trouble.
#[derive(Error, Debug)]
pub enum RouterError {
    /// Strict mode only: the named provider was never registered.
    #[error("provider not registered: {name}")]
    UnknownProvider { name: String },

    /// `execute` was called on a router with no registered providers.
    #[error("no providers registered")]
    EmptyRegistry,

    /// Invalid configuration detected at construction time.
    #[error("invalid configuration: {message}")]
    Configuration { message: String },
}
