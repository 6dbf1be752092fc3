//! # Candidate Selection
//!
//! Strategy-driven ordering of registered providers. The router builds a
//! snapshot of each eligible provider's mutable state and asks this module
//! for the order in which to attempt them; the first candidate is the
//! primary, the rest are fallbacks.
//!
//! All orderings are deterministic given identical provider state, with
//! provider name as the final tie-break. The one exception is `weighted`,
//! which samples without replacement proportional to each provider's
//! configured weight.

use crate::config::SelectionStrategy;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Mutable, router-owned state for one registered provider.
///
/// Guarded by a per-provider mutex in the registry; the lock is only held
/// for short transitions and never across I/O.
#[derive(Debug, Clone)]
pub struct ProviderState {
    pub priority: i32,
    pub weight: f64,
    pub enabled: bool,
    /// In-flight request count.
    pub concurrency: u32,
    /// Rolling window of recent attempt latencies, newest last.
    latencies: VecDeque<u64>,
    latency_window: usize,
    pub last_health_ok_at: Option<DateTime<Utc>>,
}

impl ProviderState {
    pub fn new(priority: i32, weight: f64, enabled: bool, latency_window: usize) -> Self {
        Self {
            priority,
            weight,
            enabled,
            concurrency: 0,
            latencies: VecDeque::with_capacity(latency_window.min(1024)),
            latency_window: latency_window.max(1),
            last_health_ok_at: None,
        }
    }

    pub fn record_latency(&mut self, latency_ms: u64) {
        if self.latencies.len() == self.latency_window {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency_ms);
    }

    /// Rolling average over the window; `None` until the first sample.
    pub fn rolling_latency_ms(&self) -> Option<f64> {
        if self.latencies.is_empty() {
            return None;
        }
        Some(self.latencies.iter().sum::<u64>() as f64 / self.latencies.len() as f64)
    }
}

/// Read-only selection inputs for one candidate.
#[derive(Debug, Clone)]
pub struct CandidateInfo {
    pub name: String,
    pub priority: i32,
    pub weight: f64,
    pub concurrency: u32,
    pub rolling_latency_ms: Option<f64>,
}

/// Externally visible provider state, merged with its breaker snapshot by
/// the router.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderSnapshot {
    pub priority: i32,
    pub weight: f64,
    pub enabled: bool,
    pub concurrency: u32,
    pub rolling_latency_ms: Option<f64>,
    pub breaker: crate::circuit_breaker::BreakerSnapshot,
    pub last_health_ok_at: Option<DateTime<Utc>>,
}

/// Order `candidates` according to `strategy`. `cursor` advances once per
/// round-robin selection and is ignored by the other strategies.
pub fn order_candidates(
    strategy: SelectionStrategy,
    cursor: &AtomicUsize,
    mut candidates: Vec<CandidateInfo>,
) -> Vec<String> {
    match strategy {
        SelectionStrategy::Priority => {
            candidates.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| a.name.cmp(&b.name))
            });
        }
        SelectionStrategy::RoundRobin => {
            candidates.sort_by(|a, b| a.name.cmp(&b.name));
            if !candidates.is_empty() {
                let offset = cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
                candidates.rotate_left(offset);
            }
        }
        SelectionStrategy::Weighted => {
            candidates = sample_without_replacement(candidates);
        }
        SelectionStrategy::LeastLoaded => {
            candidates.sort_by(|a, b| {
                a.concurrency
                    .cmp(&b.concurrency)
                    .then_with(|| a.name.cmp(&b.name))
            });
        }
        SelectionStrategy::LatencyBased => {
            candidates.sort_by(|a, b| {
                latency_rank(a)
                    .partial_cmp(&latency_rank(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.name.cmp(&b.name))
            });
        }
    }
    candidates.into_iter().map(|c| c.name).collect()
}

/// Providers with no latency data sort after every measured one.
fn latency_rank(candidate: &CandidateInfo) -> f64 {
    candidate.rolling_latency_ms.unwrap_or(f64::INFINITY)
}

/// Draw candidates one by one with probability proportional to weight.
fn sample_without_replacement(mut pool: Vec<CandidateInfo>) -> Vec<CandidateInfo> {
    let mut rng = rand::thread_rng();
    let mut ordered = Vec::with_capacity(pool.len());
    while !pool.is_empty() {
        let total: f64 = pool.iter().map(|c| c.weight.max(0.0)).sum();
        let picked = if total <= f64::EPSILON {
            0
        } else {
            let mut roll: f64 = rng.gen_range(0.0..total);
            let mut index = pool.len() - 1;
            for (i, candidate) in pool.iter().enumerate() {
                let w = candidate.weight.max(0.0);
                if roll < w {
                    index = i;
                    break;
                }
                roll -= w;
            }
            index
        };
        ordered.push(pool.swap_remove(picked));
    }
    ordered
}
