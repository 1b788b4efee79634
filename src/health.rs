//! Health prober (C3): periodic liveness checks, strategy-selectable.
//!
//! Generalizes the teacher's `start_health_checker` (a single timer spawning
//! a check per node every 10s) into a per-connection task whose interval
//! shortens while `Degraded` and suspends entirely while `CircuitOpen`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Selectable probe strategy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "strategy", rename_all = "kebab-case")]
pub enum HealthCheckStrategy {
    /// No active probing; the connection's health is inferred only from
    /// live traffic results.
    None,
    /// Calls a well-known lightweight "ping" tool.
    PingTool { tool_name: String },
    /// Lists the upstream's tools as a liveness check.
    ListTools,
    /// Lists the upstream's resources as a liveness check.
    ListResources,
    /// Application-defined probe, identified by name; the embedder supplies
    /// the actual probe logic out of band.
    ApplicationLevel { probe_name: String },
}

/// Configuration for the health prober.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub strategy: HealthCheckStrategy,
    pub interval: Duration,
    pub timeout: Duration,
    pub degraded_interval: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            strategy: HealthCheckStrategy::ListTools,
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(3),
            degraded_interval: Duration::from_secs(3),
        }
    }
}

impl HealthCheckConfig {
    /// The interval to sleep for, given whether the owning connection is
    /// currently degraded. Probing is the caller's responsibility to
    /// suspend entirely while the breaker is open.
    pub fn effective_interval(&self, degraded: bool) -> Duration {
        if degraded {
            self.degraded_interval
        } else {
            self.interval
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degraded_uses_shorter_interval() {
        let cfg = HealthCheckConfig {
            strategy: HealthCheckStrategy::ListTools,
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(2),
            degraded_interval: Duration::from_secs(2),
        };
        assert_eq!(cfg.effective_interval(false), Duration::from_secs(10));
        assert_eq!(cfg.effective_interval(true), Duration::from_secs(2));
    }
}
