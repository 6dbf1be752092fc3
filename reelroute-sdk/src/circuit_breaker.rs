//! # Circuit Breaker
//!
//! Per-provider failure isolation. Consecutive retryable failures open the
//! circuit; while open, the router skips the provider instead of burning
//! its budget on a host that is already struggling. After a cooling-off
//! period a single probe is admitted: success closes the circuit, failure
//! re-opens it.
//!
//! The breaker does not observe calls itself — the router feeds it the
//! outcome of each attempt after classification, because only retryable
//! provider-health errors (`provider_error`, `timeout`, `network_error`)
//! may count. Caller errors and rate limiting say nothing about provider
//! health and never trip the circuit.
//!
//! State transitions:
//!
//! ```text
//!          threshold consecutive failures
//! CLOSED ─────────────────────────────────▶ OPEN
//!    ▲                                       │ open_timeout elapsed
//!    │ probe success                         ▼
//!    └────────────────────────────────── HALF_OPEN ──▶ OPEN (probe failure)
//! ```

use crate::config::BreakerSettings;
use serde::Serialize;
use std::sync::Mutex;
use std::time::Instant;

/// Observable breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Decision returned by [`CircuitBreaker::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed; call normally.
    Allowed,
    /// Circuit is testing recovery; this call is the single probe and its
    /// outcome decides the next state.
    Probe,
    /// Circuit open; skip this provider.
    Rejected,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// One breaker per registered provider.
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<BreakerInner>,
}

/// Point-in-time breaker view for state reporting.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Ask whether a call may proceed. An open circuit whose timeout has
    /// elapsed transitions to half-open and admits exactly one probe.
    pub fn admit(&self) -> Admission {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.settings.open_timeout)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    tracing::info!(provider = %self.name, "circuit breaker half-open, admitting probe");
                    Admission::Probe
                } else {
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Admission::Rejected
                } else {
                    inner.probe_in_flight = true;
                    Admission::Probe
                }
            }
        }
    }

    /// Record a successful attempt. Closes a half-open circuit and resets
    /// the failure counter. Returns `true` when this call closed the
    /// circuit.
    pub fn record_success(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
        match inner.state {
            CircuitState::HalfOpen | CircuitState::Open => {
                inner.state = CircuitState::Closed;
                inner.opened_at = None;
                tracing::info!(provider = %self.name, "circuit breaker closed");
                true
            }
            CircuitState::Closed => false,
        }
    }

    /// Record a breaker-counting failure. Returns `true` when this call
    /// opened the circuit.
    pub fn record_failure(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.settings.threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    tracing::warn!(
                        provider = %self.name,
                        failures = inner.consecutive_failures,
                        "circuit breaker opened"
                    );
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
                tracing::warn!(provider = %self.name, "probe failed, circuit breaker re-opened");
                true
            }
            CircuitState::Open => false,
        }
    }

    /// Release a probe slot whose call never completed (cancellation,
    /// rate-limit denial) so the next caller can probe instead.
    pub fn abort_probe(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().unwrap();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
        }
    }

    /// Force the circuit open; test and operational tooling hook.
    pub fn force_open(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
    }

    /// Force the circuit closed and reset all counters.
    pub fn force_closed(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings(threshold: u32, open_timeout: Duration) -> BreakerSettings {
        BreakerSettings {
            threshold,
            open_timeout,
        }
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new("bad", settings(3, Duration::from_secs(60)));
        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.record_failure());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.admit(), Admission::Rejected);
    }

    #[test]
    fn success_resets_the_failure_counter() {
        let breaker = CircuitBreaker::new("flaky", settings(3, Duration::from_secs(60)));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
        // Needs a full fresh run of failures to open.
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn admits_single_probe_after_cooldown() {
        let breaker = CircuitBreaker::new("probe", settings(1, Duration::from_millis(0)));
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        // Zero cooldown: first admit becomes the probe, second is rejected.
        assert_eq!(breaker.admit(), Admission::Probe);
        assert_eq!(breaker.admit(), Admission::Rejected);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.admit(), Admission::Allowed);
    }

    #[test]
    fn failed_probe_reopens() {
        let breaker = CircuitBreaker::new("probe", settings(1, Duration::from_millis(0)));
        breaker.record_failure();
        assert_eq!(breaker.admit(), Admission::Probe);
        assert!(breaker.record_failure());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn aborted_probe_frees_the_slot() {
        let breaker = CircuitBreaker::new("probe", settings(1, Duration::from_millis(0)));
        breaker.record_failure();
        assert_eq!(breaker.admit(), Admission::Probe);
        breaker.abort_probe();
        assert_eq!(breaker.admit(), Admission::Probe);
    }

    #[test]
    fn open_circuit_respects_cooldown() {
        let breaker = CircuitBreaker::new("cold", settings(1, Duration::from_secs(3600)));
        breaker.record_failure();
        assert_eq!(breaker.admit(), Admission::Rejected);
    }
}
