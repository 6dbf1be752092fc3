//! # Unified Data Model
//!
//! Provider-agnostic request and response envelopes. These are the only
//! shapes that cross the orchestration boundary: callers build a
//! [`UnifiedRequest`] (directly or through the schema layer in
//! [`crate::contract`]), the router returns a [`UnifiedResponse`], and
//! adapters translate between these and each provider's native payloads.
//!
//! Requests and responses are plain values. They carry no shared state, can
//! be cloned freely, and are safe to move across tasks.
//!
//! ## Example
//!
//! ```rust
//! use reelroute_sdk::models::{MediaType, UnifiedRequest};
//!
//! let request = UnifiedRequest::new("veo", "veo-3", "a fox running through snow")
//!     .with_parameter("width", 1280)
//!     .with_parameter("height", 720)
//!     .with_parameter("duration_s", 8);
//! assert_eq!(request.media_type, MediaType::Video);
//! ```

use crate::error::ErrorDetails;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Wire-contract versions understood by the schema layer.
///
/// Internal processing always operates on the newest version; the contract
/// layer migrates older envelopes up on entry and back down on exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchemaVersion {
    #[serde(rename = "1.0")]
    V1_0,
    #[serde(rename = "1.1")]
    V1_1,
    #[serde(rename = "2.0")]
    V2_0,
}

impl SchemaVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaVersion::V1_0 => "1.0",
            SchemaVersion::V1_1 => "1.1",
            SchemaVersion::V2_0 => "2.0",
        }
    }
}

impl Default for SchemaVersion {
    fn default() -> Self {
        SchemaVersion::V2_0
    }
}

/// Kind of artifact a request produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
    Audio,
    Text,
}

/// Per-request retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
        }
    }
}

/// Provider name used by callers that want automatic selection.
pub const AUTO_PROVIDER: &str = "auto";

/// One attempt against one provider for one artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedRequest {
    #[serde(default)]
    pub schema_version: SchemaVersion,
    pub request_id: String,
    /// Provider name, or [`AUTO_PROVIDER`] for strategy-driven selection.
    pub provider: String,
    /// Provider-qualified model identifier, e.g. `"veo-3"`.
    pub model: String,
    pub prompt: String,
    pub media_type: MediaType,
    /// Opaque scalar configuration (width, height, duration, fps, seed, ...).
    /// Unknown keys are preserved and passed through to the adapter.
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Quality/safety/advanced tuning lifted out of `parameters` by the 2.0
    /// schema. Merged over `parameters` when adapters build native payloads
    /// and included in cache-key derivation.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub generation_config: Map<String, Value>,
    /// Caller-supplied annotations; never used for routing, propagated into
    /// the response.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Hard ceiling for the full routed call including retries and fallbacks.
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry_config: RetryConfig,
    /// When present the router may acknowledge asynchronous provider jobs
    /// with a `processing` response instead of waiting for completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl UnifiedRequest {
    /// Build a request with sensible defaults: fresh id, video media type,
    /// 60 second budget, default retry schedule.
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            schema_version: SchemaVersion::V2_0,
            request_id: uuid::Uuid::new_v4().to_string(),
            provider: provider.into(),
            model: model.into(),
            prompt: prompt.into(),
            media_type: MediaType::Video,
            parameters: Map::new(),
            generation_config: Map::new(),
            metadata: Map::new(),
            timeout_ms: 60_000,
            retry_config: RetryConfig::default(),
            callback_url: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_parameter(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_media_type(mut self, media_type: MediaType) -> Self {
        self.media_type = media_type;
        self
    }

    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    /// Whether the caller asked for automatic provider selection.
    pub fn is_auto(&self) -> bool {
        self.provider == AUTO_PROVIDER
    }

    /// Structural invariants that hold regardless of schema version.
    pub fn check_invariants(&self) -> Result<(), ErrorDetails> {
        if self.prompt.trim().is_empty() {
            return Err(ErrorDetails::invalid_field(
                "prompt",
                "prompt must not be empty",
            ));
        }
        if self.model.trim().is_empty() {
            return Err(ErrorDetails::invalid_field(
                "model",
                "model must not be empty",
            ));
        }
        if self.timeout_ms == 0 {
            return Err(ErrorDetails::invalid_field(
                "timeout_ms",
                "timeout_ms must be greater than zero",
            ));
        }
        if self.retry_config.base_delay_ms == 0 {
            return Err(ErrorDetails::invalid_field(
                "retry_config.base_delay_ms",
                "base_delay_ms must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Effective generation parameters: `generation_config` merged over
    /// `parameters`. Adapters read this view when building native payloads.
    pub fn effective_parameters(&self) -> Map<String, Value> {
        let mut merged = self.parameters.clone();
        for (k, v) in &self.generation_config {
            merged.insert(k.clone(), v.clone());
        }
        merged
    }
}

/// Terminal state of one routed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Failed,
    Processing,
    PartialSuccess,
}

/// Routing observables attached to every response, plus the caller metadata
/// propagated from the request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub degraded: bool,
    pub cached: bool,
    pub attempts: u32,
    pub fallback_used: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Result of one routed call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedResponse {
    pub request_id: String,
    #[serde(default)]
    pub schema_version: SchemaVersion,
    pub provider: String,
    pub model: String,
    pub status: ResponseStatus,
    /// Present iff `status == success` (and for `processing`/`partial_success`
    /// where output exists); e.g. `{urls: [...], revised_prompt, duration_s}`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Map<String, Value>>,
    /// Present iff `status == failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
    pub metadata: ResponseMeta,
    /// Wall-clock time of the routed call in milliseconds.
    pub processing_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

impl UnifiedResponse {
    pub fn success(request: &UnifiedRequest, provider: &str, result: Map<String, Value>) -> Self {
        Self {
            request_id: request.request_id.clone(),
            schema_version: request.schema_version,
            provider: provider.to_string(),
            model: request.model.clone(),
            status: ResponseStatus::Success,
            result: Some(result),
            error: None,
            metadata: ResponseMeta {
                extra: request.metadata.clone(),
                ..ResponseMeta::default()
            },
            processing_time_ms: 0,
            tokens_used: None,
            cost: None,
        }
    }

    pub fn failure(request: &UnifiedRequest, provider: &str, error: ErrorDetails) -> Self {
        Self {
            request_id: request.request_id.clone(),
            schema_version: request.schema_version,
            provider: provider.to_string(),
            model: request.model.clone(),
            status: ResponseStatus::Failed,
            result: None,
            error: Some(error),
            metadata: ResponseMeta {
                extra: request.metadata.clone(),
                ..ResponseMeta::default()
            },
            processing_time_ms: 0,
            tokens_used: None,
            cost: None,
        }
    }

    /// Acknowledgement for an asynchronous provider job; only returned when
    /// the request carried a `callback_url`.
    pub fn processing(request: &UnifiedRequest, provider: &str, job: Map<String, Value>) -> Self {
        Self {
            status: ResponseStatus::Processing,
            result: Some(job),
            ..Self::success(request, provider, Map::new())
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    /// First output URL, when one exists.
    pub fn first_url(&self) -> Option<&str> {
        self.result
            .as_ref()
            .and_then(|r| r.get("urls"))
            .and_then(|u| u.as_array())
            .and_then(|a| a.first())
            .and_then(|v| v.as_str())
    }
}

/// One atomic generation unit within a multi-shot intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shot {
    pub shot_id: String,
    pub scene_id: String,
    /// Opaque reference to the source image (resolved by the analyzer).
    pub image_ref: String,
    pub intent_text: String,
    /// Providers to generate variants with, in declared order.
    pub target_providers: Vec<String>,
    /// Caller-pinned controls; win over everything else.
    #[serde(default)]
    pub locked_controls: Map<String, Value>,
    /// Controls derived from analysis; win over compiler defaults.
    #[serde(default)]
    pub derived_controls: Map<String, Value>,
}

/// Cross-shot consistency requirements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyPolicy {
    /// Minimum acceptable pairwise score in `[0, 1]`.
    pub threshold: f32,
    /// Whether a violating shot gets a single regeneration attempt.
    #[serde(default)]
    pub regenerate: bool,
}

/// Ordered multi-shot generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentRequest {
    pub shots: Vec<Shot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consistency: Option<ConsistencyPolicy>,
    /// Maximum shots generated in parallel.
    #[serde(default = "default_shot_concurrency")]
    pub concurrency: usize,
    /// Budget applied to each routed call assembled from a shot.
    #[serde(default = "default_shot_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_shot_concurrency() -> usize {
    3
}

fn default_shot_timeout_ms() -> u64 {
    60_000
}
