//! Shared mock adapter and scripted transport for integration tests.

#![allow(dead_code)]

use reelroute_sdk::error::{ErrorCode, ErrorDetails};
use reelroute_sdk::models::{MediaType, UnifiedRequest, UnifiedResponse};
use reelroute_sdk::providers::{
    retry_after_ms, AdapterConfig, CapabilityFlags, ProviderAdapter, ProviderCapabilities,
};
use reelroute_sdk::transport::{
    NativeRequest, Transport, TransportError, TransportResponse,
};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What the scripted transport does for one provider.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Reply with `status`/`body` after `delay`.
    Respond {
        status: u16,
        body: Value,
        delay: Duration,
        retry_after: Option<u64>,
    },
    /// Never answer; the transport times out at the given budget.
    Hang,
    /// Fail below the HTTP layer.
    NetworkError,
}

/// Transport whose behavior is scripted per provider (the provider name is
/// the `mock://` host of the adapter's native URL).
#[derive(Default)]
pub struct ScriptedTransport {
    behaviors: Mutex<HashMap<String, MockBehavior>>,
    calls: Mutex<HashMap<String, Arc<AtomicU32>>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, provider: &str, behavior: MockBehavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(provider.to_string(), behavior);
    }

    /// Script a success reply carrying one output URL.
    pub fn succeed(&self, provider: &str, url: &str) {
        self.set(
            provider,
            MockBehavior::Respond {
                status: 200,
                body: json!({ "urls": [url] }),
                delay: Duration::ZERO,
                retry_after: None,
            },
        );
    }

    /// Success after a delay; used for latency and coalescing tests.
    pub fn succeed_after(&self, provider: &str, url: &str, delay: Duration) {
        self.set(
            provider,
            MockBehavior::Respond {
                status: 200,
                body: json!({ "urls": [url] }),
                delay,
                retry_after: None,
            },
        );
    }

    /// Success whose payload still uses the legacy scalar URL field.
    pub fn succeed_scalar(&self, provider: &str, url: &str) {
        self.set(
            provider,
            MockBehavior::Respond {
                status: 200,
                body: json!({ "output_url": url }),
                delay: Duration::ZERO,
                retry_after: None,
            },
        );
    }

    /// Script an error reply with the given unified error code.
    pub fn fail(&self, provider: &str, status: u16, code: &str) {
        self.set(
            provider,
            MockBehavior::Respond {
                status,
                body: json!({ "code": code, "message": format!("scripted {code}") }),
                delay: Duration::ZERO,
                retry_after: None,
            },
        );
    }

    pub fn fail_rate_limited(&self, provider: &str, retry_after_ms: u64) {
        self.set(
            provider,
            MockBehavior::Respond {
                status: 429,
                body: json!({ "code": "rate_limit_exceeded", "message": "throttled" }),
                delay: Duration::ZERO,
                retry_after: Some(retry_after_ms),
            },
        );
    }

    pub fn hang(&self, provider: &str) {
        self.set(provider, MockBehavior::Hang);
    }

    pub fn calls(&self, provider: &str) -> u32 {
        self.calls
            .lock()
            .unwrap()
            .get(provider)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn counter(&self, provider: &str) -> Arc<AtomicU32> {
        Arc::clone(
            self.calls
                .lock()
                .unwrap()
                .entry(provider.to_string())
                .or_default(),
        )
    }
}

fn provider_of(url: &str) -> String {
    url.strip_prefix("mock://")
        .and_then(|rest| rest.split('/').next())
        .unwrap_or("unknown")
        .to_string()
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        request: NativeRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<TransportResponse, TransportError> {
        let provider = provider_of(&request.url);
        // Health probes do not count as generation calls.
        if !request.url.ends_with("/health") {
            self.counter(&provider).fetch_add(1, Ordering::SeqCst);
        }
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&provider)
            .cloned()
            .unwrap_or(MockBehavior::NetworkError);

        match behavior {
            MockBehavior::Respond {
                status,
                body,
                delay,
                retry_after,
            } => {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                    _ = tokio::time::sleep(timeout) => return Err(TransportError::Timeout),
                    _ = tokio::time::sleep(delay) => {}
                }
                let mut headers = Vec::new();
                if let Some(ms) = retry_after {
                    headers.push(("Retry-After".to_string(), (ms / 1000).to_string()));
                }
                Ok(TransportResponse {
                    status,
                    headers,
                    body: serde_json::to_vec(&body).unwrap(),
                })
            }
            MockBehavior::Hang => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(TransportError::Cancelled),
                    _ = tokio::time::sleep(timeout) => Err(TransportError::Timeout),
                }
            }
            MockBehavior::NetworkError => Err(TransportError::Network {
                message: "scripted connection failure".to_string(),
            }),
        }
    }
}

/// Permissive adapter speaking a trivial `mock://` dialect.
#[derive(Debug)]
pub struct MockAdapter {
    name: String,
    rpm: u32,
}

impl MockAdapter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rpm: 0,
        }
    }

    pub fn with_rpm(name: &str, rpm: u32) -> Self {
        Self {
            name: name.to_string(),
            rpm,
        }
    }
}

fn code_from_str(code: &str) -> ErrorCode {
    match code {
        "invalid_request" => ErrorCode::InvalidRequest,
        "authentication_failed" => ErrorCode::AuthenticationFailed,
        "insufficient_credits" => ErrorCode::InsufficientCredits,
        "content_policy_violation" => ErrorCode::ContentPolicyViolation,
        "invalid_model" => ErrorCode::InvalidModel,
        "rate_limit_exceeded" => ErrorCode::RateLimitExceeded,
        "timeout" => ErrorCode::Timeout,
        "network_error" => ErrorCode::NetworkError,
        "provider_error" => ErrorCode::ProviderError,
        _ => ErrorCode::UnknownError,
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            max_width: 4096,
            max_height: 4096,
            formats: vec!["mp4".to_string()],
            max_duration_s: 600,
            supports_batch: true,
            supports_streaming: false,
            rate_limit_per_minute: self.rpm,
            features: CapabilityFlags {
                text_to_video: true,
                image_to_video: true,
                ..CapabilityFlags::default()
            },
            models: Vec::new(),
            media_types: vec![MediaType::Video, MediaType::Image],
        }
    }

    // Accepts any model; capability gating is exercised by the bundled
    // adapters' own tests.
    fn validate(&self, _request: &UnifiedRequest) -> Option<ErrorDetails> {
        None
    }

    fn to_native(&self, request: &UnifiedRequest) -> Result<NativeRequest, ErrorDetails> {
        Ok(NativeRequest::post(
            format!("mock://{}/generate", self.name),
            json!({
                "model": request.model,
                "prompt": request.prompt,
                "parameters": Value::Object(request.effective_parameters()),
            }),
        ))
    }

    fn from_native(
        &self,
        response: &TransportResponse,
        request: &UnifiedRequest,
    ) -> UnifiedResponse {
        let body = response.json().unwrap_or(Value::Null);
        match response.status {
            200 => {
                let mut result = Map::new();
                if let Some(urls) = body.get("urls") {
                    result.insert("urls".to_string(), urls.clone());
                }
                if let Some(scalar) = body.get("output_url") {
                    result.insert("output_url".to_string(), scalar.clone());
                }
                UnifiedResponse::success(request, &self.name, result)
            }
            202 => {
                let mut job = Map::new();
                job.insert("job_id".to_string(), body["id"].clone());
                UnifiedResponse::processing(request, &self.name, job)
            }
            _ => {
                let code = code_from_str(body["code"].as_str().unwrap_or("unknown"));
                let mut error = ErrorDetails::new(
                    code,
                    body["message"].as_str().unwrap_or("scripted failure"),
                )
                .with_provider(&self.name);
                if let Some(ms) = retry_after_ms(response) {
                    error = error.with_retry_after(ms);
                }
                UnifiedResponse::failure(request, &self.name, error)
            }
        }
    }

    async fn health_check(&self, transport: &dyn Transport) -> bool {
        transport
            .send(
                NativeRequest::get(format!("mock://{}/health", self.name)),
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .map(|r| r.status == 200)
            .unwrap_or(false)
    }
}

/// Ignore the unused mention when a test file only needs part of this
/// module.
pub fn adapter_config() -> AdapterConfig {
    AdapterConfig::new("test-key")
}

/// Opt a test into log output (`RUST_LOG=debug cargo test -- --nocapture`).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
