//! Luma Dream Machine adapter: lowercase state names, assets object
//! instead of an output array, `{detail}` error bodies.

use crate::error::{ErrorCode, ErrorDetails};
use crate::models::{MediaType, UnifiedRequest, UnifiedResponse};
use crate::providers::{
    retry_after_ms, AdapterConfig, CapabilityFlags, ProviderAdapter, ProviderCapabilities,
};
use crate::transport::{NativeRequest, Transport, TransportResponse};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_BASE_URL: &str = "https://api.lumalabs.ai";

#[derive(Debug)]
pub struct LumaAdapter {
    config: AdapterConfig,
}

impl LumaAdapter {
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
        let message = body["detail"]
            .as_str()
            .unwrap_or("unknown api error")
            .to_string();
        let details = match response.status {
            400 if message.to_lowercase().contains("moderation") => {
                ErrorDetails::new(ErrorCode::ContentPolicyViolation, message)
            }
            400 | 422 => ErrorDetails::new(ErrorCode::InvalidRequest, message),
            401 | 403 => ErrorDetails::new(ErrorCode::AuthenticationFailed, message),
            402 => ErrorDetails::new(ErrorCode::InsufficientCredits, message),
            404 => ErrorDetails::new(ErrorCode::InvalidModel, message),
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
impl ProviderAdapter for LumaAdapter {
    fn name(&self) -> &str {
        "luma"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            max_width: 1920,
            max_height: 1080,
            formats: vec!["mp4".to_string()],
            max_duration_s: 9,
            supports_batch: false,
            supports_streaming: false,
            rate_limit_per_minute: 50,
            features: CapabilityFlags {
                text_to_video: true,
                image_to_video: true,
                audio_sync: false,
                keyframe_control: true,
                character_consistency: true,
            },
            models: vec![
                "ray-2".to_string(),
                "ray-flash-2".to_string(),
                "ray-1-6".to_string(),
            ],
            media_types: vec![MediaType::Video, MediaType::Image],
        }
    }

    fn to_native(&self, request: &UnifiedRequest) -> Result<NativeRequest, ErrorDetails> {
        let params = request.effective_parameters();
        let mut body = json!({
            "model": self.config.map_model(&request.model),
            "prompt": request.prompt,
        });
        if let Some(height) = params.get("height").and_then(Value::as_u64) {
            body["resolution"] = Value::from(format!("{height}p"));
        }
        if let Some(duration) = params.get("duration_s").and_then(Value::as_u64) {
            body["duration"] = Value::from(format!("{duration}s"));
        }
        if let (Some(w), Some(h)) = (
            params.get("width").and_then(Value::as_u64),
            params.get("height").and_then(Value::as_u64),
        ) {
            body["aspect_ratio"] = Value::from(if w >= h { "16:9" } else { "9:16" });
        }
        if let Some(image) = params.get("image_ref") {
            body["keyframes"] = json!({ "frame0": { "type": "image", "url": image } });
        }
        if let Some(callback) = &request.callback_url {
            body["callback_url"] = Value::from(callback.clone());
        }

        Ok(self.authorize(NativeRequest::post(
            format!("{}/dream-machine/v1/generations", self.base_url()),
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

        match body["state"].as_str() {
            Some("completed") => {
                let Some(video) = body["assets"]["video"].as_str() else {
                    return UnifiedResponse::failure(
                        request,
                        self.name(),
                        ErrorDetails::new(
                            ErrorCode::ProviderError,
                            "generation completed without a video asset",
                        )
                        .with_provider(self.name()),
                    );
                };
                let mut result = Map::new();
                result.insert("urls".to_string(), json!([video]));
                if let Some(thumb) = body["assets"]["image"].as_str() {
                    result.insert("thumbnail_url".to_string(), Value::from(thumb));
                }
                UnifiedResponse::success(request, self.name(), result)
            }
            Some("failed") => UnifiedResponse::failure(
                request,
                self.name(),
                ErrorDetails::new(
                    ErrorCode::ProviderError,
                    body["failure_reason"].as_str().unwrap_or("generation failed"),
                )
                .with_provider(self.name()),
            ),
            Some("queued") | Some("dreaming") => {
                let mut job = Map::new();
                job.insert("job_id".to_string(), body["id"].clone());
                job.insert("provider_status".to_string(), body["state"].clone());
                UnifiedResponse::processing(request, self.name(), job)
            }
            _ => UnifiedResponse::failure(
                request,
                self.name(),
                ErrorDetails::new(ErrorCode::UnknownError, "unrecognized generation state")
                    .with_provider(self.name()),
            ),
        }
    }

    async fn health_check(&self, transport: &dyn Transport) -> bool {
        let probe = self.authorize(NativeRequest::get(format!(
            "{}/dream-machine/v1/credits",
            self.base_url()
        )));
        transport
            .send(probe, Duration::from_secs(5), &CancellationToken::new())
            .await
            .map(|r| (200..300).contains(&r.status))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResponseStatus;

    fn adapter() -> LumaAdapter {
        LumaAdapter::new(AdapterConfig::new("lm-test"))
    }

    fn request() -> UnifiedRequest {
        UnifiedRequest::new("luma", "ray-2", "a fox in the snow")
            .with_parameter("width", 1280)
            .with_parameter("height", 720)
            .with_parameter("duration_s", 5)
    }

    fn http(status: u16, body: Value) -> TransportResponse {
        TransportResponse {
            status,
            headers: Vec::new(),
            body: serde_json::to_vec(&body).unwrap(),
        }
    }

    #[test]
    fn to_native_formats_resolution_and_duration() {
        let native = adapter().to_native(&request()).unwrap();
        assert!(native.url.ends_with("/dream-machine/v1/generations"));
        assert_eq!(native.body["resolution"], "720p");
        assert_eq!(native.body["duration"], "5s");
        assert_eq!(native.body["aspect_ratio"], "16:9");
    }

    #[test]
    fn completed_generation_reads_the_assets_object() {
        let unified = adapter().from_native(
            &http(
                200,
                json!({
                    "id": "g1",
                    "state": "completed",
                    "assets": { "video": "https://l/v.mp4", "image": "https://l/t.jpg" }
                }),
            ),
            &request(),
        );
        assert_eq!(unified.status, ResponseStatus::Success);
        assert_eq!(unified.first_url(), Some("https://l/v.mp4"));
        assert_eq!(
            unified.result.as_ref().unwrap()["thumbnail_url"],
            "https://l/t.jpg"
        );
    }

    #[test]
    fn moderation_detail_maps_to_content_policy() {
        let unified = adapter().from_native(
            &http(400, json!({ "detail": "prompt failed moderation checks" })),
            &request(),
        );
        assert_eq!(
            unified.error.unwrap().code,
            ErrorCode::ContentPolicyViolation
        );
    }
}
