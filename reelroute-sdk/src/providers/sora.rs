//! Sora adapter (OpenAI video API dialect).

use crate::error::{ErrorCode, ErrorDetails};
use crate::models::{MediaType, UnifiedRequest, UnifiedResponse};
use crate::providers::{
    retry_after_ms, AdapterConfig, CapabilityFlags, ProviderAdapter, ProviderCapabilities,
};
use crate::transport::{NativeRequest, Transport, TransportResponse};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// Parameters consumed by the payload builder; everything else passes
/// through verbatim.
const MAPPED_PARAMS: &[&str] = &["width", "height", "duration_s", "seed", "format"];

#[derive(Debug)]
pub struct SoraAdapter {
    config: AdapterConfig,
}

impl SoraAdapter {
    pub fn new(config: AdapterConfig) -> Self {
        Self { config }
    }

    fn base_url(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    fn authorize(&self, request: NativeRequest) -> NativeRequest {
        let mut request =
            request.with_header("Authorization", format!("Bearer {}", self.config.api_key));
        for (name, value) in &self.config.extra_headers {
            request = request.with_header(name, value.clone());
        }
        request
    }

    fn classify_status(&self, response: &TransportResponse) -> ErrorDetails {
        let body = response.json().unwrap_or(Value::Null);
        let message = body["error"]["message"]
            .as_str()
            .unwrap_or("unknown api error")
            .to_string();
        let api_code = body["error"]["code"].as_str().unwrap_or_default();

        let details = match response.status {
            400 if api_code.contains("content_policy") => {
                ErrorDetails::new(ErrorCode::ContentPolicyViolation, message)
            }
            400 => ErrorDetails::new(ErrorCode::InvalidRequest, message),
            401 | 403 => ErrorDetails::new(ErrorCode::AuthenticationFailed, message),
            402 => ErrorDetails::new(ErrorCode::InsufficientCredits, message),
            404 => ErrorDetails::new(ErrorCode::InvalidModel, message),
            429 if api_code == "insufficient_quota" => {
                ErrorDetails::new(ErrorCode::InsufficientCredits, message)
            }
            429 => {
                let mut err = ErrorDetails::new(ErrorCode::RateLimitExceeded, message);
                if let Some(ms) = retry_after_ms(response) {
                    err = err.with_retry_after(ms);
                }
                err
            }
            500..=599 => ErrorDetails::new(ErrorCode::ProviderError, message),
            _ => ErrorDetails::new(ErrorCode::UnknownError, message),
        };
        details
            .with_provider(self.name())
            .with_detail("http_status", response.status)
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for SoraAdapter {
    fn name(&self) -> &str {
        "sora"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            max_width: 1920,
            max_height: 1080,
            formats: vec!["mp4".to_string()],
            max_duration_s: 20,
            supports_batch: false,
            supports_streaming: false,
            rate_limit_per_minute: 60,
            features: CapabilityFlags {
                text_to_video: true,
                image_to_video: true,
                audio_sync: true,
                keyframe_control: false,
                character_consistency: false,
            },
            models: vec!["sora-2".to_string(), "sora-2-pro".to_string()],
            media_types: vec![MediaType::Video],
        }
    }

    fn to_native(&self, request: &UnifiedRequest) -> Result<NativeRequest, ErrorDetails> {
        let params = request.effective_parameters();
        let mut body = json!({
            "model": self.config.map_model(&request.model),
            "prompt": request.prompt,
            "n": 1,
        });

        let width = params.get("width").and_then(Value::as_u64);
        let height = params.get("height").and_then(Value::as_u64);
        if let (Some(w), Some(h)) = (width, height) {
            body["size"] = Value::from(format!("{w}x{h}"));
        }
        if let Some(duration) = params.get("duration_s") {
            body["seconds"] = duration.clone();
        }
        if let Some(seed) = params.get("seed") {
            body["seed"] = seed.clone();
        }
        if let Some(callback) = &request.callback_url {
            body["webhook_url"] = Value::from(callback.clone());
        }
        for (key, value) in &params {
            if !MAPPED_PARAMS.contains(&key.as_str()) {
                body[key.as_str()] = value.clone();
            }
        }

        Ok(self.authorize(NativeRequest::post(
            format!("{}/v1/video/generations", self.base_url()),
            body,
        )))
    }

    fn from_native(
        &self,
        response: &TransportResponse,
        request: &UnifiedRequest,
    ) -> UnifiedResponse {
        if !(200..300).contains(&response.status) {
            return UnifiedResponse::failure(request, self.name(), self.classify_status(response));
        }

        let Some(body) = response.json() else {
            return UnifiedResponse::failure(
                request,
                self.name(),
                ErrorDetails::new(ErrorCode::ProviderError, "unparseable response body")
                    .with_provider(self.name()),
            );
        };

        match body["status"].as_str() {
            Some("queued") | Some("in_progress") => {
                let mut job = Map::new();
                job.insert("job_id".to_string(), body["id"].clone());
                job.insert("provider_status".to_string(), body["status"].clone());
                UnifiedResponse::processing(request, self.name(), job)
            }
            _ => {
                let urls: Vec<Value> = body["data"]
                    .as_array()
                    .map(|items| items.iter().filter_map(|i| i.get("url").cloned()).collect())
                    .unwrap_or_default();
                if urls.is_empty() {
                    return UnifiedResponse::failure(
                        request,
                        self.name(),
                        ErrorDetails::new(ErrorCode::ProviderError, "response carried no outputs")
                            .with_provider(self.name()),
                    );
                }
                let mut result = Map::new();
                result.insert("urls".to_string(), Value::Array(urls));
                if let Some(revised) = body["data"][0]["revised_prompt"].as_str() {
                    result.insert("revised_prompt".to_string(), Value::from(revised));
                }
                if let Some(seconds) = body["seconds"].as_u64() {
                    result.insert("duration_s".to_string(), Value::from(seconds));
                }
                UnifiedResponse::success(request, self.name(), result)
            }
        }
    }

    async fn health_check(&self, transport: &dyn Transport) -> bool {
        let probe = self.authorize(NativeRequest::get(format!("{}/v1/models", self.base_url())));
        transport
            .send(probe, Duration::from_secs(5), &CancellationToken::new())
            .await
            .map(|r| (200..300).contains(&r.status))
            .unwrap_or(false)
    }
}
