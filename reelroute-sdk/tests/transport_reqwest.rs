//! The bundled reqwest transport against a real local HTTP server,
//! driving a bundled adapter end to end.

use reelroute_sdk::config::RouterConfig;
use reelroute_sdk::error::ErrorCode;
use reelroute_sdk::models::{ResponseStatus, RetryConfig, UnifiedRequest};
use reelroute_sdk::providers::{create_adapter, AdapterConfig};
use reelroute_sdk::router::GenerationRouter;
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn sora_generation_round_trips_through_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/video/generations"))
        .and(header("Authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "gen_http_1",
            "status": "completed",
            "seconds": 8,
            "data": [{ "url": "https://cdn/sora.mp4" }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let router = GenerationRouter::builder(RouterConfig::default())
        .build()
        .unwrap();
    let adapter = create_adapter(
        "sora",
        AdapterConfig::new("sk-test").with_base_url(server.uri()),
    )
    .unwrap();
    router.register("sora", adapter, 10, 1.0, true);

    let request = UnifiedRequest::new("sora", "sora-2", "a fox in the snow")
        .with_parameter("width", 1280)
        .with_parameter("height", 720)
        .with_parameter("duration_s", 8);
    let response = router.execute(request).await.unwrap();

    assert_eq!(response.status, ResponseStatus::Success);
    assert_eq!(response.first_url(), Some("https://cdn/sora.mp4"));
    assert_eq!(response.metadata.attempts, 1);
}

#[tokio::test]
async fn authentication_failures_do_not_retry_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/video/generations"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": { "message": "invalid api key", "type": "invalid_request_error" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let router = GenerationRouter::builder(RouterConfig::default())
        .build()
        .unwrap();
    let adapter = create_adapter(
        "sora",
        AdapterConfig::new("sk-bad").with_base_url(server.uri()),
    )
    .unwrap();
    router.register("sora", adapter, 10, 1.0, true);

    let request = UnifiedRequest::new("sora", "sora-2", "a fox in the snow").with_retry_config(
        RetryConfig {
            max_retries: 3,
            base_delay_ms: 10,
        },
    );
    let response = router.execute(request).await.unwrap();

    assert_eq!(response.status, ResponseStatus::Failed);
    assert_eq!(
        response.error.as_ref().unwrap().code,
        ErrorCode::AuthenticationFailed
    );
    assert_eq!(response.metadata.attempts, 1);
}

#[tokio::test]
async fn kling_envelope_errors_surface_through_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/videos/text2video"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 1301,
            "message": "prompt rejected by risk control"
        })))
        .mount(&server)
        .await;

    let router = GenerationRouter::builder(RouterConfig::default())
        .build()
        .unwrap();
    let adapter = create_adapter(
        "kling",
        AdapterConfig::new("kl-test").with_base_url(server.uri()),
    )
    .unwrap();
    router.register("kling", adapter, 10, 1.0, true);

    let request = UnifiedRequest::new("kling", "kling-v2", "a questionable prompt");
    let response = router.execute(request).await.unwrap();

    assert_eq!(response.status, ResponseStatus::Failed);
    let error = response.error.unwrap();
    assert_eq!(error.code, ErrorCode::ContentPolicyViolation);
    assert!(!error.retryable);
}
