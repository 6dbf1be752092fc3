//! Runway adapter: versioned task API, uppercase task states, failure codes
//! embedded in otherwise-successful task payloads.

use crate::error::{ErrorCode, ErrorDetails};
use crate::models::{MediaType, UnifiedRequest, UnifiedResponse};
use crate::providers::{
    retry_after_ms, AdapterConfig, CapabilityFlags, ProviderAdapter, ProviderCapabilities,
};
use crate::transport::{NativeRequest, Transport, TransportResponse};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_BASE_URL: &str = "https://api.dev.runwayml.com";
const API_VERSION: &str = "2024-11-06";

#[derive(Debug)]
pub struct RunwayAdapter {
    config: AdapterConfig,
}

impl RunwayAdapter {
    pub fn new(config: AdapterConfig) -> Self {
        Self { config }
    }

    fn base_url(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    fn authorize(&self, request: NativeRequest) -> NativeRequest {
        let mut request = request
            .with_header("Authorization", format!("Bearer {}", self.config.api_key))
            .with_header("X-Runway-Version", API_VERSION);
        for (name, value) in &self.config.extra_headers {
            request = request.with_header(name, value.clone());
        }
        request
    }

    fn classify_status(&self, response: &TransportResponse) -> ErrorDetails {
        let body = response.json().unwrap_or(Value::Null);
        let message = body["error"]
            .as_str()
            .unwrap_or("unknown api error")
            .to_string();
        let details = match response.status {
            400 => ErrorDetails::new(ErrorCode::InvalidRequest, message),
            401 => ErrorDetails::new(ErrorCode::AuthenticationFailed, message),
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

    /// Tasks can fail inside a 200 payload; the failure code decides
    /// whether retrying makes sense.
    fn classify_task_failure(&self, body: &Value) -> ErrorDetails {
        let message = body["failure"]
            .as_str()
            .unwrap_or("task failed")
            .to_string();
        let failure_code = body["failureCode"].as_str().unwrap_or_default();
        let details = if failure_code.starts_with("SAFETY") {
            ErrorDetails::new(ErrorCode::ContentPolicyViolation, message)
        } else if failure_code.starts_with("INPUT") {
            ErrorDetails::new(ErrorCode::InvalidRequest, message)
        } else {
            ErrorDetails::new(ErrorCode::ProviderError, message)
        };
        details
            .with_provider(self.name())
            .with_detail("failure_code", failure_code)
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for RunwayAdapter {
    fn name(&self) -> &str {
        "runway"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            max_width: 1280,
            max_height: 768,
            formats: vec!["mp4".to_string()],
            max_duration_s: 10,
            supports_batch: false,
            supports_streaming: false,
            rate_limit_per_minute: 120,
            features: CapabilityFlags {
                text_to_video: true,
                image_to_video: true,
                audio_sync: false,
                keyframe_control: true,
                character_consistency: false,
            },
            models: vec!["gen3a_turbo".to_string(), "gen4_turbo".to_string()],
            media_types: vec![MediaType::Video],
        }
    }

    fn to_native(&self, request: &UnifiedRequest) -> Result<NativeRequest, ErrorDetails> {
        let params = request.effective_parameters();
        let mut body = json!({
            "taskType": self.config.map_model(&request.model),
            "promptText": request.prompt,
        });
        if let (Some(w), Some(h)) = (
            params.get("width").and_then(Value::as_u64),
            params.get("height").and_then(Value::as_u64),
        ) {
            body["ratio"] = Value::from(format!("{w}:{h}"));
        }
        if let Some(duration) = params.get("duration_s") {
            body["duration"] = duration.clone();
        }
        if let Some(image) = params.get("image_ref") {
            body["promptImage"] = image.clone();
        }
        if let Some(seed) = params.get("seed") {
            body["seed"] = seed.clone();
        }
        if let Some(callback) = &request.callback_url {
            body["webhookUrl"] = Value::from(callback.clone());
        }

        Ok(self.authorize(NativeRequest::post(
            format!("{}/v1/tasks", self.base_url()),
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
            Some("SUCCEEDED") => {
                let urls: Vec<Value> = body["output"]
                    .as_array()
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|v| v.is_string())
                    .collect();
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
                UnifiedResponse::success(request, self.name(), result)
            }
            Some("FAILED") => {
                UnifiedResponse::failure(request, self.name(), self.classify_task_failure(&body))
            }
            Some("PENDING") | Some("RUNNING") | Some("THROTTLED") => {
                let mut job = Map::new();
                job.insert("job_id".to_string(), body["id"].clone());
                job.insert("provider_status".to_string(), body["status"].clone());
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
            "{}/v1/organization",
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

    fn adapter() -> RunwayAdapter {
        RunwayAdapter::new(AdapterConfig::new("rw-test"))
    }

    fn request() -> UnifiedRequest {
        UnifiedRequest::new("runway", "gen4_turbo", "a fox in the snow")
            .with_parameter("duration_s", 10)
    }

    fn http(status: u16, body: Value) -> TransportResponse {
        TransportResponse {
            status,
            headers: Vec::new(),
            body: serde_json::to_vec(&body).unwrap(),
        }
    }

    #[test]
    fn to_native_pins_the_api_version() {
        let native = adapter().to_native(&request()).unwrap();
        assert!(native.url.ends_with("/v1/tasks"));
        assert_eq!(native.body["taskType"], "gen4_turbo");
        assert!(native
            .headers
            .iter()
            .any(|(k, v)| k == "X-Runway-Version" && v == API_VERSION));
    }

    #[test]
    fn safety_failure_inside_succeeded_http_is_content_policy() {
        let unified = adapter().from_native(
            &http(
                200,
                json!({
                    "id": "t1",
                    "status": "FAILED",
                    "failure": "input text was flagged",
                    "failureCode": "SAFETY.INPUT_TEXT"
                }),
            ),
            &request(),
        );
        assert_eq!(unified.status, ResponseStatus::Failed);
        let error = unified.error.unwrap();
        assert_eq!(error.code, ErrorCode::ContentPolicyViolation);
        assert!(!error.retryable);
    }

    #[test]
    fn running_task_maps_to_processing() {
        let unified = adapter().from_native(
            &http(200, json!({ "id": "t2", "status": "RUNNING" })),
            &request(),
        );
        assert_eq!(unified.status, ResponseStatus::Processing);
    }
}
