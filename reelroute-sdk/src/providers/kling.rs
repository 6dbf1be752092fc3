//! Kling adapter: every reply is wrapped in a `{code, message, data}`
//! envelope where business errors ride on HTTP 200, so classification
//! reads the envelope code before the HTTP status.

use crate::error::{ErrorCode, ErrorDetails};
use crate::models::{MediaType, UnifiedRequest, UnifiedResponse};
use crate::providers::{
    retry_after_ms, AdapterConfig, CapabilityFlags, ProviderAdapter, ProviderCapabilities,
};
use crate::transport::{NativeRequest, Transport, TransportResponse};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_BASE_URL: &str = "https://api.klingai.com";

#[derive(Debug)]
pub struct KlingAdapter {
    config: AdapterConfig,
}

impl KlingAdapter {
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

    fn classify_envelope(&self, code: i64, message: &str, response: &TransportResponse) -> ErrorDetails {
        let message = message.to_string();
        let details = match code {
            1002 | 1004 => ErrorDetails::new(ErrorCode::AuthenticationFailed, message),
            1102 => ErrorDetails::new(ErrorCode::InsufficientCredits, message),
            1301 | 1303 => ErrorDetails::new(ErrorCode::ContentPolicyViolation, message),
            1302 => {
                let mut err = ErrorDetails::new(ErrorCode::RateLimitExceeded, message);
                if let Some(ms) = retry_after_ms(response) {
                    err = err.with_retry_after(ms);
                }
                err
            }
            1201 => ErrorDetails::new(ErrorCode::InvalidRequest, message),
            1203 => ErrorDetails::new(ErrorCode::InvalidModel, message),
            _ => match response.status {
                401 | 403 => ErrorDetails::new(ErrorCode::AuthenticationFailed, message),
                429 => ErrorDetails::new(ErrorCode::RateLimitExceeded, message),
                500..=599 => ErrorDetails::new(ErrorCode::ProviderError, message),
                _ => ErrorDetails::new(ErrorCode::UnknownError, message),
            },
        };
        details
            .with_provider(self.name())
            .with_detail("envelope_code", code)
            .with_detail("http_status", response.status)
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for KlingAdapter {
    fn name(&self) -> &str {
        "kling"
    }

    fn capabilities(&self) -> ProviderCapabilities {
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
                image_to_video: true,
                audio_sync: false,
                keyframe_control: true,
                character_consistency: true,
            },
            models: vec![
                "kling-v1".to_string(),
                "kling-v1-5".to_string(),
                "kling-v2".to_string(),
            ],
            media_types: vec![MediaType::Video],
        }
    }

    fn to_native(&self, request: &UnifiedRequest) -> Result<NativeRequest, ErrorDetails> {
        let params = request.effective_parameters();
        let mut body = json!({
            "model_name": self.config.map_model(&request.model),
            "prompt": request.prompt,
        });
        if let (Some(w), Some(h)) = (
            params.get("width").and_then(Value::as_u64),
            params.get("height").and_then(Value::as_u64),
        ) {
            body["aspect_ratio"] = Value::from(if w >= h { "16:9" } else { "9:16" });
        }
        if let Some(duration) = params.get("duration_s").and_then(Value::as_u64) {
            // Kling only accepts coarse duration buckets.
            body["duration"] = Value::from(if duration <= 5 { "5" } else { "10" });
        }
        if let Some(guidance) = params.get("guidance_scale") {
            body["cfg_scale"] = guidance.clone();
        }
        if let Some(negative) = params.get("negative_prompt") {
            body["negative_prompt"] = negative.clone();
        }
        if let Some(callback) = &request.callback_url {
            body["callback_url"] = Value::from(callback.clone());
        }

        Ok(self.authorize(NativeRequest::post(
            format!("{}/v1/videos/text2video", self.base_url()),
            body,
        )))
    }

    fn from_native(
        &self,
        response: &TransportResponse,
        request: &UnifiedRequest,
    ) -> UnifiedResponse {
        let Some(body) = response.json() else {
            return UnifiedResponse::failure(
                request,
                self.name(),
                ErrorDetails::new(ErrorCode::ProviderError, "unparseable response body")
                    .with_provider(self.name()),
            );
        };

        let code = body["code"].as_i64().unwrap_or(-1);
        let message = body["message"].as_str().unwrap_or("unknown api error");
        if !(200..300).contains(&response.status) || code != 0 {
            return UnifiedResponse::failure(
                request,
                self.name(),
                self.classify_envelope(code, message, response),
            );
        }

        let data = &body["data"];
        match data["task_status"].as_str() {
            Some("succeed") => {
                let urls: Vec<Value> = data["task_result"]["videos"]
                    .as_array()
                    .map(|items| items.iter().filter_map(|v| v.get("url").cloned()).collect())
                    .unwrap_or_default();
                if urls.is_empty() {
                    return UnifiedResponse::failure(
                        request,
                        self.name(),
                        ErrorDetails::new(ErrorCode::ProviderError, "task succeeded without output")
                            .with_provider(self.name()),
                    );
                }
                let mut result = Map::new();
                result.insert("urls".to_string(), Value::Array(urls));
                if let Some(duration) = data["task_result"]["videos"][0]["duration"].as_str() {
                    result.insert("duration_s".to_string(), Value::from(duration));
                }
                UnifiedResponse::success(request, self.name(), result)
            }
            Some("failed") => UnifiedResponse::failure(
                request,
                self.name(),
                ErrorDetails::new(
                    ErrorCode::ProviderError,
                    data["task_status_msg"].as_str().unwrap_or("task failed"),
                )
                .with_provider(self.name()),
            ),
            Some("submitted") | Some("processing") => {
                let mut job = Map::new();
                job.insert("job_id".to_string(), data["task_id"].clone());
                job.insert("provider_status".to_string(), data["task_status"].clone());
                UnifiedResponse::processing(request, self.name(), job)
            }
            _ => UnifiedResponse::failure(
                request,
                self.name(),
                ErrorDetails::new(ErrorCode::UnknownError, "unrecognized task status")
                    .with_provider(self.name()),
            ),
        }
    }

    async fn health_check(&self, transport: &dyn Transport) -> bool {
        let probe = self.authorize(NativeRequest::get(format!(
            "{}/v1/account/costs",
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

    fn adapter() -> KlingAdapter {
        KlingAdapter::new(AdapterConfig::new("kl-test"))
    }

    fn request() -> UnifiedRequest {
        UnifiedRequest::new("kling", "kling-v2", "a fox in the snow")
            .with_parameter("width", 1920)
            .with_parameter("height", 1080)
            .with_parameter("duration_s", 7)
    }

    fn http(status: u16, body: Value) -> TransportResponse {
        TransportResponse {
            status,
            headers: Vec::new(),
            body: serde_json::to_vec(&body).unwrap(),
        }
    }

    #[test]
    fn duration_snaps_to_the_nearest_bucket() {
        let native = adapter().to_native(&request()).unwrap();
        assert_eq!(native.body["duration"], "10");
        assert_eq!(native.body["aspect_ratio"], "16:9");
        assert_eq!(native.body["model_name"], "kling-v2");
    }

    #[test]
    fn business_error_on_http_200_is_classified() {
        let unified = adapter().from_native(
            &http(200, json!({ "code": 1102, "message": "account in arrears" })),
            &request(),
        );
        let error = unified.error.unwrap();
        assert_eq!(error.code, ErrorCode::InsufficientCredits);
        assert_eq!(error.details["envelope_code"], 1102);
    }

    #[test]
    fn succeeded_task_yields_urls() {
        let unified = adapter().from_native(
            &http(
                200,
                json!({
                    "code": 0,
                    "message": "ok",
                    "data": {
                        "task_id": "task-9",
                        "task_status": "succeed",
                        "task_result": { "videos": [{ "url": "https://k/v.mp4", "duration": "10" }] }
                    }
                }),
            ),
            &request(),
        );
        assert_eq!(unified.status, ResponseStatus::Success);
        assert_eq!(unified.first_url(), Some("https://k/v.mp4"));
    }

    #[test]
    fn submitted_task_maps_to_processing() {
        let unified = adapter().from_native(
            &http(
                200,
                json!({
                    "code": 0,
                    "message": "ok",
                    "data": { "task_id": "task-10", "task_status": "submitted" }
                }),
            ),
            &request(),
        );
        assert_eq!(unified.status, ResponseStatus::Processing);
    }
}
