//! Load balancer selector (C6): picks one eligible connection per request.
//!
//! Generalizes the teacher's `LoadBalancer::choose_healthy_node` (round-robin
//! skipping unhealthy nodes) into the full strategy set the spec enumerates,
//! operating over `ResilientConnection`'s richer state and statistics.

use crate::connection::ResilientConnection;
use crate::types::ConnectionState;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectorStrategy {
    RoundRobin,
    LeastConnections,
    LeastResponseTime,
    HealthWeighted,
    Random,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    pub strategy: SelectorStrategy,
    pub degraded_eligible: bool,
    pub max_concurrent_requests_per_upstream: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            strategy: SelectorStrategy::RoundRobin,
            degraded_eligible: true,
            max_concurrent_requests_per_upstream: 32,
        }
    }
}

/// Stateless with respect to the connection set it's handed; the only
/// internal state is the round-robin cursor.
pub struct Selector {
    config: SelectorConfig,
    next_index: AtomicUsize,
}

impl Selector {
    pub fn new(config: SelectorConfig) -> Self {
        Self { config, next_index: AtomicUsize::new(0) }
    }

    fn is_eligible(&self, conn: &ResilientConnection) -> bool {
        let state = conn.state();
        if !state.is_selectable() {
            return false;
        }
        if state == ConnectionState::Degraded && !self.config.degraded_eligible {
            return false;
        }
        conn.stats().in_flight < self.config.max_concurrent_requests_per_upstream as u64
    }

    /// Select a connection for a new unit of work. A caller-provided
    /// `preferred` name is a soft hint: honored when eligible, otherwise
    /// silently ignored in favor of the configured strategy.
    pub fn select(
        &self,
        connections: &[Arc<ResilientConnection>],
        preferred: Option<&str>,
    ) -> Option<Arc<ResilientConnection>> {
        if let Some(name) = preferred {
            if let Some(conn) = connections.iter().find(|c| c.name() == name) {
                if self.is_eligible(conn) {
                    return Some(Arc::clone(conn));
                }
            }
        }

        let eligible: Vec<&Arc<ResilientConnection>> = connections.iter().filter(|c| self.is_eligible(c)).collect();
        if eligible.is_empty() {
            return None;
        }

        let chosen = match self.config.strategy {
            SelectorStrategy::RoundRobin => self.round_robin(&eligible),
            SelectorStrategy::LeastConnections => least_connections(&eligible),
            SelectorStrategy::LeastResponseTime => least_response_time(&eligible),
            SelectorStrategy::HealthWeighted => self.health_weighted(&eligible),
            SelectorStrategy::Random => random_pick(&eligible),
        };
        chosen.map(Arc::clone)
    }

    fn round_robin<'a>(&self, eligible: &[&'a Arc<ResilientConnection>]) -> &'a Arc<ResilientConnection> {
        let len = eligible.len();
        let start = self.next_index.fetch_add(1, Ordering::SeqCst) % len;
        let mut rng = rand::thread_rng();
        for offset in 0..len {
            let idx = (start + offset) % len;
            let candidate = eligible[idx];
            // A connection ramping up under gradual recovery is skipped with
            // probability proportional to how far from fully warm it is.
            if rng.gen_range(0.0..1.0) <= candidate.selection_weight() {
                return candidate;
            }
        }
        eligible[start]
    }

    fn health_weighted<'a>(&self, eligible: &[&'a Arc<ResilientConnection>]) -> &'a Arc<ResilientConnection> {
        let weights: Vec<f64> = eligible
            .iter()
            .map(|c| {
                let failure_rate = c.stats().failure_rate();
                (1.0 - failure_rate).max(0.0) * c.selection_weight()
            })
            .collect();

        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return self.round_robin(eligible);
        }

        let mut roll = rand::thread_rng().gen_range(0.0..total);
        for (candidate, weight) in eligible.iter().zip(weights.iter()) {
            if roll < *weight {
                return candidate;
            }
            roll -= *weight;
        }
        eligible[eligible.len() - 1]
    }
}

fn least_connections<'a>(eligible: &[&'a Arc<ResilientConnection>]) -> &'a Arc<ResilientConnection> {
    eligible
        .iter()
        .min_by(|a, b| {
            let (sa, sb) = (a.stats(), b.stats());
            sa.in_flight
                .cmp(&sb.in_flight)
                .then(sa.avg_latency_ms.partial_cmp(&sb.avg_latency_ms).unwrap_or(std::cmp::Ordering::Equal))
        })
        .expect("eligible is non-empty")
}

fn least_response_time<'a>(eligible: &[&'a Arc<ResilientConnection>]) -> &'a Arc<ResilientConnection> {
    eligible
        .iter()
        .min_by(|a, b| {
            let (sa, sb) = (a.stats(), b.stats());
            sa.avg_latency_ms
                .partial_cmp(&sb.avg_latency_ms)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(sa.in_flight.cmp(&sb.in_flight))
        })
        .expect("eligible is non-empty")
}

fn random_pick<'a>(eligible: &[&'a Arc<ResilientConnection>]) -> &'a Arc<ResilientConnection> {
    let idx = rand::thread_rng().gen_range(0..eligible.len());
    eligible[idx]
}
