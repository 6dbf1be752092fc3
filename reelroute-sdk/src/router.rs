//! # Generation Router
//!
//! The orchestration heart of the SDK: takes one [`UnifiedRequest`] and
//! produces one [`UnifiedResponse`] by driving the cache, circuit breakers,
//! rate limiters, retry engine and provider fallback in a fixed order:
//!
//! 1. **Cache lookup** — per candidate (once up front for a fixed-provider
//!    request).
//! 2. **Candidate selection** — the configured strategy orders every
//!    enabled provider whose capabilities can serve the request; a fixed
//!    provider goes first with the rest as fallbacks.
//! 3. **Per candidate** — coalesce identical concurrent misses
//!    (singleflight), check the breaker, take a rate-limit token, translate
//!    through the adapter, run the transport call with bounded retries.
//! 4. **Fallback** — retryable failures move on to the next candidate;
//!    non-retryable failures surface immediately because another provider
//!    cannot fix a bad request.
//!
//! The router owns all mutable provider state. Adapters stay stateless and
//! the cache is private to the router, so every test can build its own
//! fully isolated router.
//!
//! `execute` is safe to call from any number of tasks concurrently. The
//! caller's `timeout_ms` bounds the whole call including retries and
//! fallbacks, and an optional cancellation token aborts promptly at every
//! suspension point.

use crate::cache::{CacheSnapshot, CacheStore, TieredCache};
use crate::circuit_breaker::{Admission, CircuitBreaker, CircuitState};
use crate::config::RouterConfig;
use crate::contract;
use crate::error::{ErrorCode, ErrorDetails, RouterError};
use crate::models::{ResponseStatus, SchemaVersion, UnifiedRequest, UnifiedResponse};
use crate::providers::ProviderAdapter;
use crate::rate_limit::{AcquireError, RateLimiter};
use crate::retry::run_with_retry;
use crate::routing::{order_candidates, CandidateInfo, ProviderSnapshot, ProviderState};
use crate::singleflight::{await_leader, FlightRole, Singleflight};
use crate::telemetry::{events, NoopTelemetry, TelemetryEvent, TelemetryHook};
use crate::transport::{ReqwestTransport, Transport};
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct ProviderEntry {
    adapter: Arc<dyn ProviderAdapter>,
    state: Mutex<ProviderState>,
    breaker: CircuitBreaker,
}

/// Outcome of one candidate's full attempt cycle.
enum CandidateOutcome {
    /// A response the caller can use (success or processing ack).
    Completed(UnifiedResponse, u32),
    /// Candidate failed after exhausting its retries.
    Failed(ErrorDetails, u32),
    /// Candidate never got to attempt (breaker open, throttled); costs no
    /// attempts.
    Skipped(ErrorDetails),
    /// The ambient cancellation fired; stop the whole call.
    Cancelled(ErrorDetails),
}

/// Builder for [`GenerationRouter`].
pub struct RouterBuilder {
    config: RouterConfig,
    warm: Option<Arc<dyn CacheStore>>,
    telemetry: Arc<dyn TelemetryHook>,
    transport: Option<Arc<dyn Transport>>,
}

impl RouterBuilder {
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetryHook>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Attach a warm cache tier (also requires `cache.l2_enabled`).
    pub fn with_warm_tier(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.warm = Some(store);
        self
    }

    pub fn build(self) -> Result<GenerationRouter, RouterError> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new().map_err(|e| RouterError::Configuration {
                message: e.to_string(),
            })?),
        };
        Ok(GenerationRouter {
            cache: TieredCache::new(self.config.cache.clone(), self.warm),
            limiter: RateLimiter::new(),
            flights: Singleflight::new(),
            cursor: AtomicUsize::new(0),
            providers: DashMap::new(),
            telemetry: self.telemetry,
            transport,
            config: self.config,
        })
    }
}

/// Provider-agnostic request router. See the module docs for the protocol.
pub struct GenerationRouter {
    config: RouterConfig,
    providers: DashMap<String, Arc<ProviderEntry>>,
    cache: TieredCache,
    limiter: RateLimiter,
    flights: Singleflight<UnifiedResponse>,
    cursor: AtomicUsize,
    telemetry: Arc<dyn TelemetryHook>,
    transport: Arc<dyn Transport>,
}

impl GenerationRouter {
    pub fn builder(config: RouterConfig) -> RouterBuilder {
        RouterBuilder {
            config,
            warm: None,
            telemetry: Arc::new(NoopTelemetry),
            transport: None,
        }
    }

    /// Register (or replace) a provider at runtime.
    pub fn register(
        &self,
        name: &str,
        adapter: Arc<dyn ProviderAdapter>,
        priority: i32,
        weight: f64,
        enabled: bool,
    ) {
        let entry = ProviderEntry {
            adapter,
            state: Mutex::new(ProviderState::new(
                priority,
                weight,
                enabled,
                self.config.latency_window,
            )),
            breaker: CircuitBreaker::new(name, self.config.breaker.clone()),
        };
        self.providers.insert(name.to_string(), Arc::new(entry));
        tracing::info!(provider = name, priority, weight, enabled, "provider registered");
    }

    pub fn deregister(&self, name: &str) -> bool {
        let removed = self.providers.remove(name).is_some();
        if removed {
            tracing::info!(provider = name, "provider deregistered");
        }
        removed
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        match self.providers.get(name) {
            Some(entry) => {
                entry.state.lock().unwrap().enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Merged state + breaker view per provider.
    pub fn provider_states(&self) -> HashMap<String, ProviderSnapshot> {
        self.providers
            .iter()
            .map(|entry| {
                let state = entry.value().state.lock().unwrap();
                (
                    entry.key().clone(),
                    ProviderSnapshot {
                        priority: state.priority,
                        weight: state.weight,
                        enabled: state.enabled,
                        concurrency: state.concurrency,
                        rolling_latency_ms: state.rolling_latency_ms(),
                        breaker: entry.value().breaker.snapshot(),
                        last_health_ok_at: state.last_health_ok_at,
                    },
                )
            })
            .collect()
    }

    pub fn cache_stats(&self) -> CacheSnapshot {
        self.cache.stats().snapshot()
    }

    /// Probe one provider's health endpoint through the injected transport
    /// and stamp `last_health_ok_at` on success. Unknown providers report
    /// unhealthy.
    pub async fn health_check(&self, name: &str) -> bool {
        let Some(entry) = self.providers.get(name).map(|e| Arc::clone(e.value())) else {
            return false;
        };
        let healthy = entry.adapter.health_check(self.transport.as_ref()).await;
        if healthy {
            entry.state.lock().unwrap().last_health_ok_at = Some(Utc::now());
        }
        healthy
    }

    /// Drop a provider's cached responses.
    pub async fn invalidate_provider_cache(&self, provider: &str) {
        self.cache.invalidate(&format!("{provider}:")).await;
    }

    /// Route one request with a fresh cancellation scope.
    pub async fn execute(&self, request: UnifiedRequest) -> Result<UnifiedResponse, RouterError> {
        self.execute_with_cancellation(request, CancellationToken::new())
            .await
    }

    /// Route a raw JSON envelope declared at `version`, shaping the reply
    /// for the same caller.
    pub async fn execute_envelope(
        &self,
        raw: Value,
        version: SchemaVersion,
    ) -> Result<Value, RouterError> {
        let request = match contract::parse(raw.clone(), version) {
            Ok(request) => request,
            Err(error) => {
                let request_id = raw
                    .get("request_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let response = UnifiedResponse {
                    request_id,
                    schema_version: version,
                    provider: String::new(),
                    model: raw
                        .get("model")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    status: ResponseStatus::Failed,
                    result: None,
                    error: Some(error),
                    metadata: Default::default(),
                    processing_time_ms: 0,
                    tokens_used: None,
                    cost: None,
                };
                return Ok(contract::serialize(&response, version));
            }
        };
        let response = self.execute(request).await?;
        Ok(contract::serialize(&response, version))
    }

    /// Route one request under the caller's cancellation token.
    pub async fn execute_with_cancellation(
        &self,
        mut request: UnifiedRequest,
        cancel: CancellationToken,
    ) -> Result<UnifiedResponse, RouterError> {
        if self.providers.is_empty() {
            return Err(RouterError::EmptyRegistry);
        }
        if request.timeout_ms == 0 {
            request.timeout_ms = self.config.default_timeout.as_millis() as u64;
        }

        let started = Instant::now();
        let deadline = started + Duration::from_millis(request.timeout_ms);
        self.emit(TelemetryEvent::new(events::REQUEST_RECEIVED, &request.request_id));

        if let Err(error) = request.check_invariants() {
            let provider = request.provider.clone();
            return Ok(self.finish(
                UnifiedResponse::failure(&request, &provider, error),
                started,
                0,
                false,
            ));
        }

        let ordered = match self.ordered_candidates(&request)? {
            Ok(ordered) => ordered,
            Err(response) => return Ok(self.finish(response, started, 0, false)),
        };

        // The declared primary: the named provider for a fixed-provider
        // request, otherwise whichever candidate the strategy ranked first.
        // A breaker-degraded fixed provider is re-queued at the back of
        // `ordered`, so list position cannot stand in for primacy.
        let primary = if request.is_auto() {
            ordered.first().cloned().unwrap_or_default()
        } else {
            request.provider.clone()
        };

        let mut total_attempts: u32 = 0;
        let mut last_error: Option<ErrorDetails> = None;

        for (index, name) in ordered.iter().enumerate() {
            if cancel.is_cancelled() || Instant::now() >= deadline {
                last_error = Some(deadline_error(&request, cancel.is_cancelled()));
                break;
            }
            // Providers can deregister mid-call; stale names just skip.
            let Some(entry) = self.providers.get(name).map(|e| Arc::clone(e.value())) else {
                continue;
            };

            if let Some(throttle) = self.cache.throttled(name) {
                tracing::debug!(provider = %name, "skipping negatively cached throttled provider");
                last_error = Some(throttle);
                continue;
            }

            let key = self.cache.key_for(&request, name);
            if let Some(hit) = self.cache.get(&key).await {
                self.emit(
                    TelemetryEvent::new(events::CACHE_HIT, &request.request_id)
                        .with_provider(name.clone()),
                );
                return Ok(self.finish_cached(hit, &request, started));
            }
            self.emit(
                TelemetryEvent::new(events::CACHE_MISS, &request.request_id)
                    .with_provider(name.clone()),
            );

            let guard = if self.config.singleflight {
                match self.flights.join(&key) {
                    FlightRole::Leader(guard) => Some(guard),
                    FlightRole::Follower(rx) => {
                        self.cache.stats().record_coalesced_waiter();
                        let shared = tokio::select! {
                            _ = cancel.cancelled() => None,
                            _ = tokio::time::sleep_until(deadline) => None,
                            value = await_leader(rx) => value,
                        };
                        match shared {
                            Some(shared) => {
                                return Ok(self.finish_shared(shared, &request, started));
                            }
                            None if cancel.is_cancelled() || Instant::now() >= deadline => {
                                last_error = Some(deadline_error(&request, cancel.is_cancelled()));
                                break;
                            }
                            // Leader gave up without a value: do the work
                            // ourselves, without re-joining.
                            None => None,
                        }
                    }
                }
            } else {
                None
            };

            self.emit(
                TelemetryEvent::new(events::PROVIDER_SELECTED, &request.request_id)
                    .with_provider(name.clone())
                    .with_attr("rank", index as u64),
            );

            let outcome = self
                .attempt_candidate(&entry, name, &request, deadline, &cancel)
                .await;
            let served_by_fallback = *name != primary;

            match outcome {
                CandidateOutcome::Completed(mut response, attempts) => {
                    total_attempts += attempts;
                    if response.status == ResponseStatus::Success && !cancel.is_cancelled() {
                        self.cache.put(&key, &response, None).await;
                    }
                    response.metadata.cached = false;
                    response.metadata.fallback_used = served_by_fallback;
                    response.metadata.attempts = total_attempts;
                    if let Some(guard) = guard {
                        guard.publish(response.clone());
                    }
                    self.emit(
                        TelemetryEvent::new(events::ATTEMPT_SUCCEEDED, &request.request_id)
                            .with_provider(name.clone())
                            .with_elapsed_ms(started.elapsed().as_millis() as u64),
                    );
                    return Ok(self.finish(response, started, total_attempts, served_by_fallback));
                }
                CandidateOutcome::Failed(error, attempts) => {
                    total_attempts += attempts;
                    self.emit(
                        TelemetryEvent::new(events::ATTEMPT_FAILED, &request.request_id)
                            .with_provider(name.clone())
                            .with_attr("code", error.code.as_str()),
                    );
                    if !error.retryable {
                        // A caller error; no other provider can help.
                        let response = UnifiedResponse::failure(&request, name, error);
                        return Ok(self.finish(
                            response,
                            started,
                            total_attempts,
                            served_by_fallback,
                        ));
                    }
                    last_error = Some(error);
                }
                CandidateOutcome::Skipped(error) => {
                    last_error = Some(error);
                }
                CandidateOutcome::Cancelled(error) => {
                    last_error = Some(error);
                    break;
                }
            }

            if index + 1 < ordered.len() {
                self.emit(
                    TelemetryEvent::new(events::FALLBACK_ENGAGED, &request.request_id)
                        .with_provider(name.clone()),
                );
            }
        }

        let error = last_error.unwrap_or_else(|| {
            ErrorDetails::new(ErrorCode::ProviderError, "no providers available")
        });
        let provider = error
            .provider
            .clone()
            .unwrap_or_else(|| request.provider.clone());
        let mut response = UnifiedResponse::failure(&request, &provider, error);
        response.metadata.degraded = true;
        Ok(self.finish(response, started, total_attempts, true))
    }

    /// Build the ordered candidate list, or an early failure response.
    #[allow(clippy::type_complexity)]
    fn ordered_candidates(
        &self,
        request: &UnifiedRequest,
    ) -> Result<Result<Vec<String>, UnifiedResponse>, RouterError> {
        if !request.is_auto() {
            let Some(entry) = self.providers.get(&request.provider) else {
                if self.config.strict {
                    return Err(RouterError::UnknownProvider {
                        name: request.provider.clone(),
                    });
                }
                let error = ErrorDetails::invalid_field(
                    "provider",
                    format!("provider '{}' is not registered", request.provider),
                );
                let provider = request.provider.clone();
                return Ok(Err(UnifiedResponse::failure(request, &provider, error)));
            };

            if let Some(error) = entry.adapter.validate(request) {
                let provider = request.provider.clone();
                return Ok(Err(UnifiedResponse::failure(request, &provider, error)));
            }

            let primary_usable = {
                let state = entry.state.lock().unwrap();
                state.enabled && entry.breaker.state() != CircuitState::Open
            };
            drop(entry);

            let mut rest = self.eligible_candidates(request);
            rest.retain(|c| c.name != request.provider);
            let mut ordered =
                order_candidates(self.config.strategy, &self.cursor, rest);
            if primary_usable {
                ordered.insert(0, request.provider.clone());
            } else {
                // Degraded primary still gets a spot at the back so an
                // expired breaker window can probe it.
                ordered.push(request.provider.clone());
            }
            return Ok(Ok(ordered));
        }

        let eligible = self.eligible_candidates(request);
        if eligible.is_empty() {
            let error = ErrorDetails::new(
                ErrorCode::ProviderError,
                "no registered provider can serve this request",
            );
            return Ok(Err(UnifiedResponse::failure(request, "auto", error)));
        }
        Ok(Ok(order_candidates(
            self.config.strategy,
            &self.cursor,
            eligible,
        )))
    }

    /// Enabled providers whose capabilities accept the request.
    fn eligible_candidates(&self, request: &UnifiedRequest) -> Vec<CandidateInfo> {
        self.providers
            .iter()
            .filter_map(|entry| {
                let state = entry.value().state.lock().unwrap();
                if !state.enabled {
                    return None;
                }
                if entry.value().adapter.validate(request).is_some() {
                    return None;
                }
                Some(CandidateInfo {
                    name: entry.key().clone(),
                    priority: state.priority,
                    weight: state.weight,
                    concurrency: state.concurrency,
                    rolling_latency_ms: state.rolling_latency_ms(),
                })
            })
            .collect()
    }

    /// Breaker, limiter, transport and retries for one candidate.
    async fn attempt_candidate(
        &self,
        entry: &Arc<ProviderEntry>,
        name: &str,
        request: &UnifiedRequest,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> CandidateOutcome {
        let admission = entry.breaker.admit();
        if admission == Admission::Rejected {
            return CandidateOutcome::Skipped(
                ErrorDetails::new(ErrorCode::ProviderError, "circuit breaker open")
                    .with_provider(name),
            );
        }
        let is_probe = admission == Admission::Probe;

        let capabilities = entry.adapter.capabilities();
        if let Some(bucket) = self.limiter.bucket(name, capabilities.rate_limit_per_minute) {
            let budget = deadline.saturating_duration_since(Instant::now());
            match bucket.acquire(budget, cancel).await {
                Ok(()) => {}
                Err(AcquireError::Cancelled) => {
                    if is_probe {
                        entry.breaker.abort_probe();
                    }
                    return CandidateOutcome::Cancelled(deadline_error(request, true));
                }
                Err(AcquireError::Exhausted { retry_after_ms }) => {
                    if is_probe {
                        entry.breaker.abort_probe();
                    }
                    let error = ErrorDetails::new(
                        ErrorCode::RateLimitExceeded,
                        "rate limit budget exhausted before a token became available",
                    )
                    .with_provider(name)
                    .with_retry_after(retry_after_ms);
                    self.cache.note_throttled(name, &error);
                    return CandidateOutcome::Skipped(error);
                }
            }
        }

        entry.state.lock().unwrap().concurrency += 1;
        let attempt_started = Instant::now();

        let telemetry = Arc::clone(&self.telemetry);
        let request_id = request.request_id.clone();
        let provider = name.to_string();
        let outcome = run_with_retry(
            &request.retry_config,
            deadline,
            cancel,
            |next_attempt, delay| {
                telemetry.on_event(
                    &TelemetryEvent::new(events::RETRY_SCHEDULED, &request_id)
                        .with_provider(provider.clone())
                        .with_attr("next_attempt", next_attempt as u64)
                        .with_attr("delay_ms", delay.as_millis() as u64),
                );
            },
            |attempt| {
                let adapter = Arc::clone(&entry.adapter);
                let transport = Arc::clone(&self.transport);
                let telemetry = Arc::clone(&self.telemetry);
                let cancel = cancel.clone();
                let request = request.clone();
                let provider = name.to_string();
                async move {
                    telemetry.on_event(
                        &TelemetryEvent::new(events::ATTEMPT_STARTED, &request.request_id)
                            .with_provider(provider.clone())
                            .with_attr("attempt", attempt as u64),
                    );
                    let native = adapter.to_native(&request)?;
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(
                            ErrorDetails::new(ErrorCode::Timeout, "request deadline exceeded")
                                .with_provider(provider),
                        );
                    }
                    match transport.send(native, remaining, &cancel).await {
                        Ok(raw) => {
                            let response = adapter.from_native(&raw, &request);
                            if response.status == ResponseStatus::Failed {
                                Err(response.error.unwrap_or_else(|| {
                                    ErrorDetails::new(
                                        ErrorCode::UnknownError,
                                        "provider reported failure without details",
                                    )
                                    .with_provider(provider)
                                }))
                            } else {
                                Ok(response)
                            }
                        }
                        Err(transport_error) => {
                            Err(adapter.classify_transport_error(&transport_error))
                        }
                    }
                }
            },
        )
        .await;

        let latency_ms = attempt_started.elapsed().as_millis() as u64;
        {
            let mut state = entry.state.lock().unwrap();
            state.concurrency = state.concurrency.saturating_sub(1);
            state.record_latency(latency_ms);
        }

        match outcome.result {
            Ok(response) => {
                if entry.breaker.record_success() {
                    self.emit(
                        TelemetryEvent::new(events::BREAKER_CLOSED, &request.request_id)
                            .with_provider(name.to_string()),
                    );
                }
                entry.state.lock().unwrap().last_health_ok_at = Some(Utc::now());
                CandidateOutcome::Completed(response, outcome.attempts)
            }
            Err(error) => {
                if error.code.counts_for_breaker() {
                    if entry.breaker.record_failure() {
                        self.emit(
                            TelemetryEvent::new(events::BREAKER_OPENED, &request.request_id)
                                .with_provider(name.to_string()),
                        );
                        if self.config.invalidate_on_open {
                            self.cache.invalidate(&format!("{name}:")).await;
                        }
                    }
                } else if is_probe {
                    entry.breaker.abort_probe();
                }
                if error.code == ErrorCode::RateLimitExceeded {
                    self.cache.note_throttled(name, &error);
                }
                if cancel.is_cancelled() {
                    CandidateOutcome::Cancelled(error)
                } else {
                    CandidateOutcome::Failed(error, outcome.attempts)
                }
            }
        }
    }

    fn finish(
        &self,
        mut response: UnifiedResponse,
        started: Instant,
        attempts: u32,
        fallback_used: bool,
    ) -> UnifiedResponse {
        response.processing_time_ms = started.elapsed().as_millis() as u64;
        response.metadata.attempts = attempts;
        response.metadata.fallback_used = fallback_used;
        self.emit(
            TelemetryEvent::new(events::REQUEST_COMPLETED, &response.request_id)
                .with_provider(response.provider.clone())
                .with_elapsed_ms(response.processing_time_ms)
                .with_attr("attempts", attempts as u64),
        );
        response
    }

    /// Shape a cache hit for the current caller.
    fn finish_cached(
        &self,
        mut hit: UnifiedResponse,
        request: &UnifiedRequest,
        started: Instant,
    ) -> UnifiedResponse {
        hit.request_id = request.request_id.clone();
        hit.schema_version = request.schema_version;
        hit.metadata.extra = request.metadata.clone();
        hit.metadata.cached = true;
        hit.metadata.fallback_used = false;
        hit.metadata.attempts = 0;
        hit.processing_time_ms = started.elapsed().as_millis() as u64;
        self.emit(
            TelemetryEvent::new(events::REQUEST_COMPLETED, &hit.request_id)
                .with_provider(hit.provider.clone())
                .with_elapsed_ms(hit.processing_time_ms)
                .with_attr("cached", true),
        );
        hit
    }

    /// Shape a singleflight-shared response for a coalesced caller.
    fn finish_shared(
        &self,
        mut shared: UnifiedResponse,
        request: &UnifiedRequest,
        started: Instant,
    ) -> UnifiedResponse {
        shared.request_id = request.request_id.clone();
        shared.schema_version = request.schema_version;
        shared.metadata.extra = request.metadata.clone();
        shared.processing_time_ms = started.elapsed().as_millis() as u64;
        self.emit(
            TelemetryEvent::new(events::REQUEST_COMPLETED, &shared.request_id)
                .with_provider(shared.provider.clone())
                .with_elapsed_ms(shared.processing_time_ms)
                .with_attr("coalesced", true),
        );
        shared
    }

    fn emit(&self, event: TelemetryEvent) {
        self.telemetry.on_event(&event);
    }
}

fn deadline_error(request: &UnifiedRequest, cancelled: bool) -> ErrorDetails {
    let message = if cancelled {
        "request cancelled before completion"
    } else {
        "request deadline exceeded"
    };
    ErrorDetails::new(ErrorCode::Timeout, message).with_detail("timeout_ms", request.timeout_ms)
}
