//! Typed, `serde`-deserializable configuration (spec §6).
//!
//! The crate is format-agnostic: it deserializes whatever `serde::Deserialize`
//! is handed to it (YAML, JSON, TOML), mirroring the spec's framing that
//! config-file parsing itself is a peripheral, embedder-chosen concern.

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::connection::{ConnectRetryConfig, ConnectionConfig, DegradationThresholds};
use crate::error::FleetError;
use crate::health::{HealthCheckConfig, HealthCheckStrategy};
use crate::recovery::{FailoverStrategy, RecoveryConfig};
use crate::selector::{SelectorConfig, SelectorStrategy};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancingConfig {
    pub strategy: SelectorStrategy,
    pub degraded_eligible: bool,
    pub max_concurrent_requests: usize,
    pub max_concurrent_requests_per_upstream: usize,
    pub default_request_timeout_ms: u64,
}

impl Default for LoadBalancingConfig {
    fn default() -> Self {
        Self {
            strategy: SelectorStrategy::RoundRobin,
            degraded_eligible: true,
            max_concurrent_requests: 256,
            max_concurrent_requests_per_upstream: 32,
            default_request_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailoverConfig {
    pub strategy: FailoverStrategy,
    pub auto_failover: bool,
    pub failback_delay_ms: u64,
    pub pre_recovery_health_check: bool,
    pub gradual_warmup_ms: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            strategy: FailoverStrategy::CircuitBreaker,
            auto_failover: true,
            failback_delay_ms: 5_000,
            pre_recovery_health_check: true,
            gradual_warmup_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerSection {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub cooldown_ms: u64,
    #[serde(default)]
    pub rolling_window: Option<usize>,
    /// Error rate (0.0-1.0) above which a connection is marked `Degraded`
    /// even while the breaker remains closed.
    #[serde(default = "default_degrade_error_rate")]
    pub degrade_error_rate: f64,
    /// Average latency, in milliseconds, above which a connection is marked
    /// `Degraded` even while the breaker remains closed.
    #[serde(default = "default_degrade_latency_ms")]
    pub degrade_latency_ms: f64,
}

fn default_degrade_error_rate() -> f64 {
    0.2
}

fn default_degrade_latency_ms() -> f64 {
    2_000.0
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            cooldown_ms: 30_000,
            rolling_window: None,
            degrade_error_rate: default_degrade_error_rate(),
            degrade_latency_ms: default_degrade_latency_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckSection {
    pub strategy: HealthCheckStrategy,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub degraded_interval_ms: u64,
}

impl Default for HealthCheckSection {
    fn default() -> Self {
        Self {
            strategy: HealthCheckStrategy::ListTools,
            interval_ms: 10_000,
            timeout_ms: 3_000,
            degraded_interval_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverySection {
    pub auto_recovery: bool,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_parallel_recoveries: usize,
    pub stagger_jitter_ms: u64,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            auto_recovery: true,
            base_delay_ms: 500,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            max_parallel_recoveries: 3,
            stagger_jitter_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesConfig {
    pub max_total_upstreams: usize,
    pub max_queue_size: usize,
    pub idle_timeout_ms: u64,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self { max_total_upstreams: 64, max_queue_size: 1_000, idle_timeout_ms: 300_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertThresholds {
    pub error_rate_percent: f64,
    pub response_time_ms: f64,
    pub unhealthy_fraction_percent: f64,
    pub consecutive_failures: u32,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            error_rate_percent: 10.0,
            response_time_ms: 2_000.0,
            unhealthy_fraction_percent: 25.0,
            consecutive_failures: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringConfig {
    pub sweep_interval_ms: u64,
    pub alert_thresholds: AlertThresholds,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self { sweep_interval_ms: 15_000, alert_thresholds: AlertThresholds::default() }
    }
}

/// Top-level fleet configuration, matching spec §6's recognized options.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FleetConfig {
    pub load_balancing: LoadBalancingConfig,
    pub failover: FailoverConfig,
    pub circuit_breaker: CircuitBreakerSection,
    pub health_check: HealthCheckSection,
    pub recovery: RecoverySection,
    pub resources: ResourcesConfig,
    pub monitoring: MonitoringConfig,
}

impl FleetConfig {
    /// Validates cross-field invariants that a plain `Deserialize` can't
    /// express, returning a `ConfigurationError` describing the first
    /// violation found.
    pub fn validate(&self) -> Result<(), FleetError> {
        if self.load_balancing.max_concurrent_requests == 0 {
            return Err(FleetError::configuration("loadBalancing.maxConcurrentRequests must be > 0"));
        }
        if self.load_balancing.max_concurrent_requests_per_upstream == 0 {
            return Err(FleetError::configuration("loadBalancing.maxConcurrentRequestsPerUpstream must be > 0"));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(FleetError::configuration("circuitBreaker.failureThreshold must be > 0"));
        }
        if self.circuit_breaker.success_threshold == 0 {
            return Err(FleetError::configuration("circuitBreaker.successThreshold must be > 0"));
        }
        if self.recovery.max_parallel_recoveries == 0 {
            return Err(FleetError::configuration("recovery.maxParallelRecoveries must be > 0"));
        }
        if self.resources.max_total_upstreams == 0 {
            return Err(FleetError::configuration("resources.maxTotalUpstreams must be > 0"));
        }
        if self.resources.max_queue_size == 0 {
            return Err(FleetError::configuration("resources.maxQueueSize must be > 0"));
        }
        Ok(())
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: self.circuit_breaker.failure_threshold,
                success_threshold: self.circuit_breaker.success_threshold,
                cooldown: ms(self.circuit_breaker.cooldown_ms),
                rolling_window: self.circuit_breaker.rolling_window,
            },
            health_check: HealthCheckConfig {
                strategy: self.health_check.strategy.clone(),
                interval: ms(self.health_check.interval_ms),
                timeout: ms(self.health_check.timeout_ms),
                degraded_interval: ms(self.health_check.degraded_interval_ms),
            },
            connect_retry: ConnectRetryConfig::default(),
            degradation: DegradationThresholds {
                error_rate: self.circuit_breaker.degrade_error_rate,
                latency_ms: self.circuit_breaker.degrade_latency_ms,
            },
            max_concurrent_requests: self.load_balancing.max_concurrent_requests_per_upstream,
            ema_alpha: 0.2,
        }
    }

    pub fn selector_config(&self) -> SelectorConfig {
        SelectorConfig {
            strategy: self.load_balancing.strategy,
            degraded_eligible: self.load_balancing.degraded_eligible,
            max_concurrent_requests_per_upstream: self.load_balancing.max_concurrent_requests_per_upstream,
        }
    }

    pub fn recovery_config(&self) -> RecoveryConfig {
        RecoveryConfig {
            auto_recovery: self.recovery.auto_recovery && self.failover.auto_failover,
            strategy: self.failover.strategy,
            base_delay: ms(self.recovery.base_delay_ms),
            max_delay: ms(self.recovery.max_delay_ms),
            backoff_multiplier: self.recovery.backoff_multiplier,
            max_parallel_recoveries: self.recovery.max_parallel_recoveries,
            stagger_jitter: ms(self.recovery.stagger_jitter_ms),
            failback_delay: ms(self.failover.failback_delay_ms),
            pre_recovery_health_check: self.failover.pre_recovery_health_check,
            gradual_warmup: ms(self.failover.gradual_warmup_ms),
        }
    }

    pub fn default_request_timeout(&self) -> Duration {
        ms(self.load_balancing.default_request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(FleetConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_concurrency_ceiling_is_rejected() {
        let mut config = FleetConfig::default();
        config.load_balancing.max_concurrent_requests = 0;
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::ConfigurationError);
    }

    #[test]
    fn deserializes_from_json() {
        let json = serde_json::json!({
            "loadBalancing": { "strategy": "health-weighted", "degradedEligible": false,
                "maxConcurrentRequests": 100, "maxConcurrentRequestsPerUpstream": 10,
                "defaultRequestTimeoutMs": 5000 },
            "failover": { "strategy": "gradual", "autoFailover": true, "failbackDelayMs": 1000,
                "preRecoveryHealthCheck": true, "gradualWarmupMs": 5000 },
            "circuitBreaker": { "failureThreshold": 3, "successThreshold": 1, "cooldownMs": 1000 },
            "healthCheck": { "strategy": { "strategy": "list-tools" }, "intervalMs": 5000,
                "timeoutMs": 1000, "degradedIntervalMs": 1000 },
            "recovery": { "autoRecovery": true, "baseDelayMs": 100, "maxDelayMs": 1000,
                "backoffMultiplier": 2.0, "maxParallelRecoveries": 2, "staggerJitterMs": 50 },
            "resources": { "maxTotalUpstreams": 5, "maxQueueSize": 50, "idleTimeoutMs": 60000 },
            "monitoring": { "sweepIntervalMs": 1000, "alertThresholds": { "errorRatePercent": 5.0,
                "responseTimeMs": 1000.0, "unhealthyFractionPercent": 50.0, "consecutiveFailures": 2 } }
        });
        let config: FleetConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.resources.max_total_upstreams, 5);
        assert!(config.validate().is_ok());
    }
}
