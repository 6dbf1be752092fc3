//! Veo adapter (Google Generative Language dialect): camelCase payloads,
//! gRPC-style status strings in error bodies, long-running operations for
//! pending jobs.

use crate::error::{ErrorCode, ErrorDetails};
use crate::models::{MediaType, UnifiedRequest, UnifiedResponse};
use crate::providers::{
    retry_after_ms, AdapterConfig, CapabilityFlags, ProviderAdapter, ProviderCapabilities,
};
use crate::transport::{NativeRequest, Transport, TransportResponse};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

#[derive(Debug)]
pub struct VeoAdapter {
    config: AdapterConfig,
}

impl VeoAdapter {
    pub fn new(config: AdapterConfig) -> Self {
        Self { config }
    }

    fn base_url(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    fn authorize(&self, request: NativeRequest) -> NativeRequest {
        let mut request = request.with_header("x-goog-api-key", self.config.api_key.clone());
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
        let grpc_status = body["error"]["status"].as_str().unwrap_or_default();

        let details = match grpc_status {
            "RESOURCE_EXHAUSTED" => {
                let mut err = ErrorDetails::new(ErrorCode::RateLimitExceeded, message);
                if let Some(ms) = retry_after_ms(response) {
                    err = err.with_retry_after(ms);
                }
                err
            }
            "UNAUTHENTICATED" | "PERMISSION_DENIED" => {
                ErrorDetails::new(ErrorCode::AuthenticationFailed, message)
            }
            "NOT_FOUND" => ErrorDetails::new(ErrorCode::InvalidModel, message),
            "INVALID_ARGUMENT" => ErrorDetails::new(ErrorCode::InvalidRequest, message),
            "FAILED_PRECONDITION" if message.to_lowercase().contains("safety") => {
                ErrorDetails::new(ErrorCode::ContentPolicyViolation, message)
            }
            _ => match response.status {
                401 | 403 => ErrorDetails::new(ErrorCode::AuthenticationFailed, message),
                404 => ErrorDetails::new(ErrorCode::InvalidModel, message),
                429 => ErrorDetails::new(ErrorCode::RateLimitExceeded, message),
                500..=599 => ErrorDetails::new(ErrorCode::ProviderError, message),
                _ => ErrorDetails::new(ErrorCode::UnknownError, message),
            },
        };
        details
            .with_provider(self.name())
            .with_detail("http_status", response.status)
            .with_detail("grpc_status", grpc_status)
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for VeoAdapter {
    fn name(&self) -> &str {
        "veo"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            max_width: 3840,
            max_height: 2160,
            formats: vec!["mp4".to_string(), "webm".to_string()],
            max_duration_s: 8,
            supports_batch: true,
            supports_streaming: false,
            rate_limit_per_minute: 30,
            features: CapabilityFlags {
                text_to_video: true,
                image_to_video: true,
                audio_sync: true,
                keyframe_control: false,
                character_consistency: false,
            },
            models: vec![
                "veo-3".to_string(),
                "veo-3-fast".to_string(),
                "veo-2".to_string(),
            ],
            media_types: vec![MediaType::Video, MediaType::Image],
        }
    }

    fn to_native(&self, request: &UnifiedRequest) -> Result<NativeRequest, ErrorDetails> {
        let params = request.effective_parameters();
        let mut generation_config = json!({});
        if let (Some(w), Some(h)) = (
            params.get("width").and_then(Value::as_u64),
            params.get("height").and_then(Value::as_u64),
        ) {
            generation_config["aspectRatio"] = Value::from(reduce_ratio(w, h));
        }
        if let Some(duration) = params.get("duration_s") {
            generation_config["durationSeconds"] = duration.clone();
        }
        if let Some(fps) = params.get("fps") {
            generation_config["frameRate"] = fps.clone();
        }
        if let Some(negative) = params.get("negative_prompt") {
            generation_config["negativePrompt"] = negative.clone();
        }
        if let Some(seed) = params.get("seed") {
            generation_config["seed"] = seed.clone();
        }

        let body = json!({
            "prompt": { "text": request.prompt },
            "videoGenerationConfig": generation_config,
        });
        let model = self.config.map_model(&request.model);
        Ok(self.authorize(NativeRequest::post(
            format!("{}/v1beta/models/{model}:generateVideo", self.base_url()),
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

        // Long-running operation that has not resolved yet.
        if let Some(operation) = body.get("name").and_then(Value::as_str) {
            if !body["done"].as_bool().unwrap_or(true) {
                let mut job = Map::new();
                job.insert("job_id".to_string(), Value::from(operation));
                job.insert("provider_status".to_string(), Value::from("running"));
                return UnifiedResponse::processing(request, self.name(), job);
            }
        }

        let videos = body
            .pointer("/response/generatedVideos")
            .or_else(|| body.get("generatedVideos"))
            .and_then(Value::as_array);
        let urls: Vec<Value> = videos
            .map(|items| items.iter().filter_map(|v| v.get("uri").cloned()).collect())
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
        UnifiedResponse::success(request, self.name(), result)
    }

    async fn health_check(&self, transport: &dyn Transport) -> bool {
        let probe = self.authorize(NativeRequest::get(format!(
            "{}/v1beta/models",
            self.base_url()
        )));
        transport
            .send(probe, Duration::from_secs(5), &CancellationToken::new())
            .await
            .map(|r| (200..300).contains(&r.status))
            .unwrap_or(false)
    }
}

/// `1280x720` becomes `16:9`.
fn reduce_ratio(width: u64, height: u64) -> String {
    fn gcd(a: u64, b: u64) -> u64 {
        if b == 0 {
            a
        } else {
            gcd(b, a % b)
        }
    }
    let d = gcd(width.max(1), height.max(1));
    format!("{}:{}", width.max(1) / d, height.max(1) / d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResponseStatus;

    fn adapter() -> VeoAdapter {
        VeoAdapter::new(AdapterConfig::new("key-123"))
    }

    fn request() -> UnifiedRequest {
        UnifiedRequest::new("veo", "veo-3", "a fox in the snow")
            .with_parameter("width", 1280)
            .with_parameter("height", 720)
            .with_parameter("duration_s", 8)
    }

    fn http(status: u16, body: Value) -> TransportResponse {
        TransportResponse {
            status,
            headers: Vec::new(),
            body: serde_json::to_vec(&body).unwrap(),
        }
    }

    #[test]
    fn to_native_uses_camel_case_and_aspect_ratio() {
        let native = adapter().to_native(&request()).unwrap();
        assert!(native.url.ends_with("/v1beta/models/veo-3:generateVideo"));
        assert_eq!(native.body["prompt"]["text"], "a fox in the snow");
        assert_eq!(native.body["videoGenerationConfig"]["aspectRatio"], "16:9");
        assert_eq!(native.body["videoGenerationConfig"]["durationSeconds"], 8);
        assert!(native.headers.iter().any(|(k, _)| k == "x-goog-api-key"));
    }

    #[test]
    fn resolved_operation_maps_to_success() {
        let response = adapter().from_native(
            &http(
                200,
                json!({
                    "name": "operations/abc",
                    "done": true,
                    "response": { "generatedVideos": [{ "uri": "https://g/v.mp4" }] }
                }),
            ),
            &request(),
        );
        assert_eq!(response.status, ResponseStatus::Success);
        assert_eq!(response.first_url(), Some("https://g/v.mp4"));
    }

    #[test]
    fn pending_operation_maps_to_processing() {
        let response = adapter().from_native(
            &http(200, json!({ "name": "operations/abc", "done": false })),
            &request(),
        );
        assert_eq!(response.status, ResponseStatus::Processing);
    }

    #[test]
    fn grpc_status_drives_classification() {
        let unified = adapter().from_native(
            &http(
                429,
                json!({ "error": { "message": "quota", "status": "RESOURCE_EXHAUSTED" } }),
            ),
            &request(),
        );
        assert_eq!(unified.error.unwrap().code, ErrorCode::RateLimitExceeded);

        let unified = adapter().from_native(
            &http(
                400,
                json!({ "error": { "message": "blocked by safety settings", "status": "FAILED_PRECONDITION" } }),
            ),
            &request(),
        );
        assert_eq!(
            unified.error.unwrap().code,
            ErrorCode::ContentPolicyViolation
        );
    }
}
