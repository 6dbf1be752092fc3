//! # Telemetry Hooks
//!
//! Structured events emitted at fixed points of the routed call. The core
//! ships no metrics backend; embedders install a [`TelemetryHook`] and
//! forward events wherever they like. The default hook is a no-op, and
//! [`TracingTelemetry`] mirrors events onto `tracing` for local debugging.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};

/// Fixed event names. Using constants keeps dashboards stable across
/// refactors.
pub mod events {
    pub const REQUEST_RECEIVED: &str = "request_received";
    pub const CACHE_HIT: &str = "cache_hit";
    pub const CACHE_MISS: &str = "cache_miss";
    pub const PROVIDER_SELECTED: &str = "provider_selected";
    pub const ATTEMPT_STARTED: &str = "attempt_started";
    pub const ATTEMPT_FAILED: &str = "attempt_failed";
    pub const ATTEMPT_SUCCEEDED: &str = "attempt_succeeded";
    pub const RETRY_SCHEDULED: &str = "retry_scheduled";
    pub const BREAKER_OPENED: &str = "breaker_opened";
    pub const BREAKER_CLOSED: &str = "breaker_closed";
    pub const FALLBACK_ENGAGED: &str = "fallback_engaged";
    pub const REQUEST_COMPLETED: &str = "request_completed";
}

/// One structured event.
#[derive(Debug, Clone)]
pub struct TelemetryEvent {
    pub name: &'static str,
    pub request_id: String,
    pub provider: Option<String>,
    pub elapsed_ms: Option<u64>,
    pub attributes: Map<String, JsonValue>,
    pub at: DateTime<Utc>,
}

impl TelemetryEvent {
    pub fn new(name: &'static str, request_id: impl Into<String>) -> Self {
        Self {
            name,
            request_id: request_id.into(),
            provider: None,
            elapsed_ms: None,
            attributes: Map::new(),
            at: Utc::now(),
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_elapsed_ms(mut self, elapsed_ms: u64) -> Self {
        self.elapsed_ms = Some(elapsed_ms);
        self
    }

    pub fn with_attr(mut self, key: &str, value: impl Into<JsonValue>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }
}

/// Observer installed at router construction.
pub trait TelemetryHook: Send + Sync {
    fn on_event(&self, event: &TelemetryEvent);
}

/// Default hook: discards everything.
#[derive(Debug, Default)]
pub struct NoopTelemetry;

impl TelemetryHook for NoopTelemetry {
    fn on_event(&self, _event: &TelemetryEvent) {}
}

/// Mirrors events onto `tracing` at debug level.
#[derive(Debug, Default)]
pub struct TracingTelemetry;

impl TelemetryHook for TracingTelemetry {
    fn on_event(&self, event: &TelemetryEvent) {
        tracing::debug!(
            event = event.name,
            request_id = %event.request_id,
            provider = event.provider.as_deref(),
            elapsed_ms = event.elapsed_ms,
            attributes = %JsonValue::Object(event.attributes.clone()),
            "telemetry"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Collects events for assertions.
    #[derive(Default)]
    pub struct RecordingTelemetry {
        pub events: Mutex<Vec<TelemetryEvent>>,
    }

    impl TelemetryHook for RecordingTelemetry {
        fn on_event(&self, event: &TelemetryEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn builder_collects_fields() {
        let event = TelemetryEvent::new(events::ATTEMPT_FAILED, "req-1")
            .with_provider("veo")
            .with_elapsed_ms(120)
            .with_attr("code", "provider_error");
        assert_eq!(event.name, "attempt_failed");
        assert_eq!(event.provider.as_deref(), Some("veo"));
        assert_eq!(event.attributes["code"], "provider_error");
    }

    #[test]
    fn hooks_receive_events_through_the_trait_object() {
        let hook: Arc<dyn TelemetryHook> = Arc::new(RecordingTelemetry::default());
        hook.on_event(&TelemetryEvent::new(events::REQUEST_RECEIVED, "req-2"));
        // NoopTelemetry must accept anything silently.
        NoopTelemetry.on_event(&TelemetryEvent::new(events::REQUEST_COMPLETED, "req-2"));
    }
}
