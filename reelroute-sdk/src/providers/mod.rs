//! # Provider Adapters
//!
//! One adapter per video-generation provider. Adapters are the only
//! components that know provider-specific URLs, field spellings and error
//! payloads; everything above them reasons over [`UnifiedRequest`],
//! [`UnifiedResponse`] and the closed error-code set.
//!
//! An adapter is a stateless value. It never retries, never reads the
//! cache, and never touches router-owned provider state — it only
//! translates:
//!
//! - `to_native` turns a unified request into one provider-native HTTP call;
//! - `from_native` turns the raw HTTP result back into a unified response,
//!   mapping provider error payloads into the closed error taxonomy;
//! - `classify_transport_error` covers failures below the HTTP layer.
//!
//! Adapters also publish a static [`ProviderCapabilities`] descriptor the
//! router uses to reject requests a provider cannot serve before any
//! network traffic happens.

use crate::error::{ErrorCode, ErrorDetails};
use crate::models::{MediaType, UnifiedRequest, UnifiedResponse};
use crate::transport::{NativeRequest, Transport, TransportError, TransportResponse};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[cfg(feature = "kling")]
pub mod kling;
#[cfg(feature = "luma")]
pub mod luma;
#[cfg(feature = "runway")]
pub mod runway;
#[cfg(feature = "sora")]
pub mod sora;
#[cfg(feature = "veo")]
pub mod veo;

/// Feature switches a provider declares.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CapabilityFlags {
    pub text_to_video: bool,
    pub image_to_video: bool,
    pub audio_sync: bool,
    pub keyframe_control: bool,
    pub character_consistency: bool,
}

/// Static descriptor used for pre-flight request rejection and rate-limit
/// sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    pub max_width: u32,
    pub max_height: u32,
    /// Output container formats, lowercase (`"mp4"`, `"webm"`, ...).
    pub formats: Vec<String>,
    pub max_duration_s: u32,
    pub supports_batch: bool,
    pub supports_streaming: bool,
    /// Declared requests-per-minute allowance; zero means unlimited.
    pub rate_limit_per_minute: u32,
    pub features: CapabilityFlags,
    /// Models this adapter will accept.
    pub models: Vec<String>,
    pub media_types: Vec<MediaType>,
}

impl ProviderCapabilities {
    /// Reject known-bad requests before any network call. Returns the
    /// rejection to surface, or `None` when the provider can serve the
    /// request.
    pub fn validate(&self, request: &UnifiedRequest) -> Option<ErrorDetails> {
        if !self.models.iter().any(|m| m == &request.model) {
            return Some(
                ErrorDetails::new(
                    ErrorCode::InvalidModel,
                    format!("model '{}' is not available", request.model),
                )
                .with_detail("field", "model"),
            );
        }
        if !self.media_types.contains(&request.media_type) {
            return Some(ErrorDetails::invalid_field(
                "media_type",
                "media type not supported by this provider",
            ));
        }

        let params = request.effective_parameters();
        if let Some(width) = params.get("width").and_then(|v| v.as_u64()) {
            if width > self.max_width as u64 {
                return Some(ErrorDetails::invalid_field(
                    "width",
                    format!("width exceeds provider maximum of {}", self.max_width),
                ));
            }
        }
        if let Some(height) = params.get("height").and_then(|v| v.as_u64()) {
            if height > self.max_height as u64 {
                return Some(ErrorDetails::invalid_field(
                    "height",
                    format!("height exceeds provider maximum of {}", self.max_height),
                ));
            }
        }
        if let Some(duration) = params.get("duration_s").and_then(|v| v.as_u64()) {
            if duration > self.max_duration_s as u64 {
                return Some(ErrorDetails::invalid_field(
                    "duration_s",
                    format!(
                        "duration exceeds provider maximum of {}s",
                        self.max_duration_s
                    ),
                ));
            }
        }
        if let Some(format) = params.get("format").and_then(|v| v.as_str()) {
            if !self.formats.iter().any(|f| f == format) {
                return Some(ErrorDetails::invalid_field(
                    "format",
                    format!("output format '{format}' not supported"),
                ));
            }
        }
        None
    }
}

/// Construction-time adapter configuration. Immutable afterwards.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub api_key: String,
    /// Override the provider's default endpoint (tests, proxies, regions).
    pub base_url: Option<String>,
    /// Caller model names mapped to provider model names.
    pub model_mapping: HashMap<String, String>,
    pub extra_headers: Vec<(String, String)>,
}

impl AdapterConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
            model_mapping: HashMap::new(),
            extra_headers: Vec::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_model_mapping(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.model_mapping.insert(from.into(), to.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }

    /// Provider model name for a caller model name.
    pub fn map_model(&self, model: &str) -> String {
        self.model_mapping
            .get(model)
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }
}

/// Bidirectional translator between the unified contract and one provider's
/// native API.
#[async_trait::async_trait]
pub trait ProviderAdapter: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    fn capabilities(&self) -> ProviderCapabilities;

    /// Pre-flight rejection of requests this provider cannot serve.
    fn validate(&self, request: &UnifiedRequest) -> Option<ErrorDetails> {
        self.capabilities().validate(request)
    }

    /// Build the provider-native HTTP call for `request`.
    fn to_native(&self, request: &UnifiedRequest) -> Result<NativeRequest, ErrorDetails>;

    /// Normalize the provider's raw HTTP result. HTTP-level errors are
    /// mapped here; the returned response is `failed` with a classified
    /// error, `processing` for acknowledged asynchronous jobs, or
    /// `success`.
    fn from_native(&self, response: &TransportResponse, request: &UnifiedRequest)
        -> UnifiedResponse;

    /// Map failures below the HTTP layer into the closed error set.
    fn classify_transport_error(&self, error: &TransportError) -> ErrorDetails {
        classify_transport(self.name(), error)
    }

    /// Lightweight availability probe, used by the breaker's half-open
    /// recovery check and operational tooling.
    async fn health_check(&self, transport: &dyn Transport) -> bool;
}

/// Shared transport-error classification.
pub fn classify_transport(provider: &str, error: &TransportError) -> ErrorDetails {
    match error {
        TransportError::Timeout | TransportError::Cancelled => {
            ErrorDetails::new(ErrorCode::Timeout, "request timed out").with_provider(provider)
        }
        TransportError::Network { message } => {
            ErrorDetails::new(ErrorCode::NetworkError, message.clone()).with_provider(provider)
        }
    }
}

/// Parse a `Retry-After` header (whole seconds form) into milliseconds.
pub fn retry_after_ms(response: &TransportResponse) -> Option<u64> {
    response
        .header("retry-after")
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|secs| secs * 1000)
}

/// Instantiate a bundled adapter by provider name.
pub fn create_adapter(
    name: &str,
    config: AdapterConfig,
) -> Result<Arc<dyn ProviderAdapter>, crate::error::RouterError> {
    match name {
        #[cfg(feature = "sora")]
        "sora" => Ok(Arc::new(sora::SoraAdapter::new(config))),
        #[cfg(feature = "veo")]
        "veo" => Ok(Arc::new(veo::VeoAdapter::new(config))),
        #[cfg(feature = "runway")]
        "runway" => Ok(Arc::new(runway::RunwayAdapter::new(config))),
        #[cfg(feature = "kling")]
        "kling" => Ok(Arc::new(kling::KlingAdapter::new(config))),
        #[cfg(feature = "luma")]
        "luma" => Ok(Arc::new(luma::LumaAdapter::new(config))),
        other => Err(crate::error::RouterError::UnknownProvider {
            name: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> ProviderCapabilities {
        ProviderCapabilities {
            max_width: 1920,
            max_height: 1080,
            formats: vec!["mp4".to_string()],
            max_duration_s: 10,
            supports_batch: false,
            supports_streaming: false,
            rate_limit_per_minute: 60,
            features: CapabilityFlags {
                text_to_video: true,
                ..CapabilityFlags::default()
            },
            models: vec!["m-1".to_string()],
            media_types: vec![MediaType::Video],
        }
    }

    #[test]
    fn validate_rejects_unknown_model() {
        let request = UnifiedRequest::new("p", "m-2", "hello");
        let err = caps().validate(&request).unwrap();
        assert_eq!(err.code, ErrorCode::InvalidModel);
    }

    #[test]
    fn validate_rejects_oversized_output() {
        let request = UnifiedRequest::new("p", "m-1", "hello").with_parameter("width", 4096);
        let err = caps().validate(&request).unwrap();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
        assert_eq!(err.details["field"], "width");

        let request = UnifiedRequest::new("p", "m-1", "hello").with_parameter("duration_s", 30);
        let err = caps().validate(&request).unwrap();
        assert_eq!(err.details["field"], "duration_s");
    }

    #[test]
    fn validate_accepts_a_servable_request() {
        let request = UnifiedRequest::new("p", "m-1", "hello")
            .with_parameter("width", 1280)
            .with_parameter("format", "mp4");
        assert!(caps().validate(&request).is_none());
    }

    #[test]
    fn transport_classification_is_retryable() {
        let err = classify_transport("p", &TransportError::Timeout);
        assert_eq!(err.code, ErrorCode::Timeout);
        assert!(err.retryable);

        let err = classify_transport(
            "p",
            &TransportError::Network {
                message: "connection refused".to_string(),
            },
        );
        assert_eq!(err.code, ErrorCode::NetworkError);
        assert!(err.retryable);
    }

    #[test]
    fn retry_after_parses_whole_seconds() {
        let response = TransportResponse {
            status: 429,
            headers: vec![("Retry-After".to_string(), "30".to_string())],
            body: Vec::new(),
        };
        assert_eq!(retry_after_ms(&response), Some(30_000));
    }
}
