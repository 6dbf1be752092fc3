//! # Reelroute SDK
//!
//! Provider-agnostic orchestration core for AI video generation. One
//! unified request/response contract in front of many third-party
//! generation providers (Sora, Veo, Runway, Kling, Luma, ...), with the
//! operational machinery real multi-provider workloads need:
//!
//! - **Unified contract**: a single envelope crossing the boundary, with
//!   schema versioning and automatic migration between contract versions.
//! - **Routing**: strategy-driven provider selection (priority,
//!   round-robin, weighted, least-loaded, latency-based) with an automatic
//!   fallback cascade.
//! - **Circuit breakers**: per-provider failure isolation with half-open
//!   recovery probes.
//! - **Rate limiting**: per-provider token buckets sized from each
//!   provider's declared allowance.
//! - **Retries**: bounded exponential backoff with jitter, honoring
//!   provider `retry_after` hints and the request deadline.
//! - **Multi-tier caching**: content-addressed response cache (hot
//!   in-memory tier plus an optional shared warm tier) with singleflight
//!   coalescing of concurrent identical misses.
//! - **Multi-shot pipeline**: parallel shot generation with cross-shot
//!   consistency validation.
//!
//! ## Quick start
//!
//! ```rust
//! use reelroute_sdk::{
//!     config::RouterConfig,
//!     models::UnifiedRequest,
//!     providers::{create_adapter, AdapterConfig},
//!     router::GenerationRouter,
//! };
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let router = GenerationRouter::builder(RouterConfig::default()).build()?;
//! router.register(
//!     "veo",
//!     create_adapter("veo", AdapterConfig::new("your-api-key"))?,
//!     10,
//!     1.0,
//!     true,
//! );
//!
//! let request = UnifiedRequest::new("auto", "veo-3", "a fox running through fresh snow")
//!     .with_parameter("width", 1280)
//!     .with_parameter("height", 720)
//!     .with_parameter("duration_s", 8);
//!
//! let response = router.execute(request).await?;
//! println!("status: {:?}, url: {:?}", response.status, response.first_url());
//! # Ok(())
//! # }
//! ```
//!
//! ## Multi-shot generation
//!
//! ```rust
//! use reelroute_sdk::models::{ConsistencyPolicy, IntentRequest, Shot};
//! use reelroute_sdk::pipeline::ShotPipeline;
//!
//! # async fn demo(pipeline: ShotPipeline, shots: Vec<Shot>) -> Result<(), Box<dyn std::error::Error>> {
//! let intent = IntentRequest {
//!     shots,
//!     consistency: Some(ConsistencyPolicy { threshold: 0.8, regenerate: false }),
//!     concurrency: 3,
//!     timeout_ms: 120_000,
//! };
//! let result = pipeline.run(intent).await?;
//! for shot in &result.shots {
//!     println!("{}: {} variants", shot.shot_id, shot.variants.len());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Design notes
//!
//! Requests and responses are plain values; the router owns every piece of
//! mutable state (provider registry, breakers, cache, limiter buckets), so
//! each test or embedder constructs a fully isolated router. Adapters are
//! stateless translators and the HTTP transport is injected, which keeps
//! the whole orchestration path runnable against scripted transports.

pub mod cache;
pub mod circuit_breaker;
pub mod common;
pub mod config;
pub mod contract;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod providers;
pub mod rate_limit;
pub mod retry;
pub mod router;
pub mod routing;
pub mod singleflight;
pub mod telemetry;
pub mod transport;

pub use circuit_breaker::{Admission, CircuitBreaker, CircuitState};
pub use config::{RouterConfig, SelectionStrategy};
pub use error::{ErrorCode, ErrorDetails, RouterError};
pub use models::{
    IntentRequest, MediaType, ResponseStatus, RetryConfig, SchemaVersion, Shot, UnifiedRequest,
    UnifiedResponse,
};
pub use pipeline::{PipelineResponse, ShotPipeline};
pub use providers::{create_adapter, AdapterConfig, ProviderAdapter, ProviderCapabilities};
pub use router::GenerationRouter;
pub use telemetry::{TelemetryEvent, TelemetryHook};
pub use transport::{Transport, TransportError, TransportResponse};

/// Result type for operations that can fail with a programming error.
pub type Result<T> = std::result::Result<T, RouterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builder_round_trips_through_json() {
        let request = UnifiedRequest::new("auto", "veo-3", "hello")
            .with_parameter("width", 1280)
            .with_metadata("trace", "t-1");
        let json = serde_json::to_value(&request).unwrap();
        let back: UnifiedRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back.model, "veo-3");
        assert_eq!(back.parameters["width"], 1280);
        assert_eq!(back.metadata["trace"], "t-1");
    }

    #[test]
    fn adapter_factory_rejects_unknown_names() {
        let err = create_adapter("pika", AdapterConfig::new("k")).unwrap_err();
        assert!(matches!(err, RouterError::UnknownProvider { .. }));
    }

    #[test]
    fn bundled_adapters_resolve_by_name() {
        for name in ["sora", "veo", "runway", "kling", "luma"] {
            let adapter = create_adapter(name, AdapterConfig::new("k")).unwrap();
            assert_eq!(adapter.name(), name);
            assert!(!adapter.capabilities().models.is_empty());
        }
    }
}
