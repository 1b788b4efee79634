//! Resilient connection (C4): wraps a transport adapter, a circuit breaker,
//! and a health prober behind one per-upstream state machine.
//!
//! Generalizes `upstream.rs`'s `UpstreamNode` (health/cooldown tracking
//! around a single `reqwest::Client`) into the full seven-state machine the
//! spec requires, with a pluggable transport instead of a hardwired HTTP
//! client, and a real circuit breaker instead of inline threshold checks.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::error::{ErrorKind, FleetError};
use crate::events::{Event, EventBus};
use crate::health::{HealthCheckConfig, HealthCheckStrategy};
use crate::stats::{ConnectionStats, StatsSnapshot};
use crate::transport::{build_adapter, UpstreamTransport};
use crate::types::{ConnectionState, UpstreamDescriptor};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Backoff policy for the `connect()` retry budget. Distinct from the
/// fleet-level recovery scheduler (C7), which decides *when* to call
/// `connect()` again once a connection has reached `Failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRetryConfig {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ConnectRetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            max_attempts: 5,
        }
    }
}

/// Thresholds that move a connection from `Connected` into `Degraded`
/// without the breaker having opened yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DegradationThresholds {
    pub error_rate: f64,
    pub latency_ms: f64,
}

impl Default for DegradationThresholds {
    fn default() -> Self {
        Self { error_rate: 0.2, latency_ms: 2_000.0 }
    }
}

struct WarmupRamp {
    started_at: Instant,
    duration: Duration,
}

/// Everything a [`ResilientConnection`] needs besides its descriptor: shared
/// defaults that would otherwise be repeated per upstream.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub health_check: HealthCheckConfig,
    pub connect_retry: ConnectRetryConfig,
    pub degradation: DegradationThresholds,
    pub max_concurrent_requests: usize,
    pub ema_alpha: f64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            health_check: HealthCheckConfig::default(),
            connect_retry: ConnectRetryConfig::default(),
            degradation: DegradationThresholds::default(),
            max_concurrent_requests: 32,
            ema_alpha: 0.2,
        }
    }
}

/// Per-upstream state machine (C4): connect/disconnect, breaker-gated
/// tool/resource calls, health probing, and statistics.
pub struct ResilientConnection {
    pub descriptor: UpstreamDescriptor,
    transport: Box<dyn UpstreamTransport>,
    breaker: CircuitBreaker,
    stats: ConnectionStats,
    config: ConnectionConfig,
    state: Mutex<ConnectionState>,
    warmup: Mutex<Option<WarmupRamp>>,
    permits: Semaphore,
    events: Arc<EventBus>,
    cancel: CancellationToken,
}

impl ResilientConnection {
    pub fn new(descriptor: UpstreamDescriptor, config: ConnectionConfig, events: Arc<EventBus>) -> Self {
        let transport = build_adapter(&descriptor.transport);
        Self::with_transport(descriptor, transport, config, events)
    }

    /// Build a connection around a caller-supplied transport instead of one
    /// derived from the descriptor's [`TransportKind`]. The dispatch, breaker,
    /// and health machinery don't care what's behind the trait object, so
    /// this is the seam a test double plugs into.
    pub fn with_transport(
        descriptor: UpstreamDescriptor,
        transport: Box<dyn UpstreamTransport>,
        config: ConnectionConfig,
        events: Arc<EventBus>,
    ) -> Self {
        let max_concurrent = config.max_concurrent_requests;
        let ema_alpha = config.ema_alpha;
        Self {
            descriptor,
            transport,
            breaker: CircuitBreaker::new(config.circuit_breaker.clone()),
            stats: ConnectionStats::new(ema_alpha),
            config,
            state: Mutex::new(ConnectionState::Disconnected),
            warmup: Mutex::new(None),
            permits: Semaphore::new(max_concurrent),
            events,
            cancel: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Current selection weight in `[0, 1]`: `1.0` once fully warmed up,
    /// ramping linearly from `0.0` while under a gradual-recovery warm-up.
    pub fn selection_weight(&self) -> f64 {
        let mut guard = self.warmup.lock();
        match &*guard {
            Some(ramp) => {
                let elapsed = ramp.started_at.elapsed();
                if elapsed >= ramp.duration {
                    *guard = None;
                    1.0
                } else {
                    (elapsed.as_secs_f64() / ramp.duration.as_secs_f64()).clamp(0.0, 1.0)
                }
            }
            None => 1.0,
        }
    }

    /// Begin a gradual warm-up ramp, called by the recovery scheduler (C7)
    /// after a successful reconnect under `FailoverStrategy::Gradual`.
    pub fn begin_warmup(&self, duration: Duration) {
        *self.warmup.lock() = Some(WarmupRamp { started_at: Instant::now(), duration });
    }

    fn set_state(&self, to: ConnectionState) {
        let from = {
            let mut guard = self.state.lock();
            let from = *guard;
            *guard = to;
            from
        };
        if from == to {
            return;
        }
        match to {
            ConnectionState::Degraded | ConnectionState::CircuitOpen => {
                tracing::warn!(upstream = %self.name(), ?from, ?to, "connection state transition")
            }
            ConnectionState::Failed => {
                tracing::error!(upstream = %self.name(), ?from, ?to, "connection state transition")
            }
            _ => tracing::debug!(upstream = %self.name(), ?from, ?to, "connection state transition"),
        }
        self.events.publish(Event::StateChanged {
            name: self.descriptor.name.clone(),
            from,
            to,
        });
    }

    /// Idempotent: a no-op if the transport reports itself already alive.
    pub async fn connect(&self) -> Result<(), FleetError> {
        if self.transport.is_alive() {
            return Ok(());
        }
        self.set_state(ConnectionState::Connecting);

        let retry = &self.config.connect_retry;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.transport.connect().await {
                Ok(()) => {
                    self.breaker.force_close();
                    self.set_state(ConnectionState::Connected);
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(upstream = %self.name(), attempt, error = %err, "connect attempt failed");
                    if attempt >= retry.max_attempts {
                        self.set_state(ConnectionState::Failed);
                        return Err(FleetError::from_transport(self.name(), err));
                    }
                    let delay = backoff_delay(retry, attempt);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Force the state back to `Failed` without tearing down the
    /// cancellation token `disconnect()` would — used by the recovery
    /// scheduler when a reconnect's post-check fails and another attempt
    /// chain still needs this connection's health task and cancellation
    /// token alive.
    pub(crate) fn mark_failed(&self) {
        self.set_state(ConnectionState::Failed);
    }

    pub async fn disconnect(&self) -> Result<(), FleetError> {
        self.set_state(ConnectionState::ShuttingDown);
        self.cancel.cancel();
        if let Err(err) = self.transport.disconnect().await {
            tracing::warn!(upstream = %self.name(), error = %err, "disconnect reported an error");
        }
        Ok(())
    }

    pub async fn call_tool(&self, name: &str, args: Value, deadline: Instant) -> Result<Value, FleetError> {
        self.run_operation(deadline, |transport| {
            let name = name.to_string();
            Box::pin(async move { transport.call_tool(&name, args).await })
        })
        .await
    }

    pub async fn read_resource(&self, uri: &str, deadline: Instant) -> Result<Value, FleetError> {
        self.run_operation(deadline, |transport| {
            let uri = uri.to_string();
            Box::pin(async move { transport.read_resource(&uri).await })
        })
        .await
    }

    async fn run_operation<'a, F>(&'a self, deadline: Instant, op: F) -> Result<Value, FleetError>
    where
        F: FnOnce(
            &'a dyn UpstreamTransport,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Value, crate::error::TransportError>> + Send + 'a>>,
    {
        let (allowed, _reason) = self.breaker.allow();
        if !allowed {
            if self.state() != ConnectionState::CircuitOpen {
                self.set_state(ConnectionState::CircuitOpen);
            }
            return Err(FleetError::circuit_open(self.name()));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(FleetError::timeout().with_upstream(self.name()));
        }

        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(FleetError::cancelled().with_upstream(self.name())),
            permit = tokio::time::timeout(remaining, self.permits.acquire()) => match permit {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(FleetError::cancelled().with_upstream(self.name())),
                Err(_) => return Err(FleetError::timeout().with_upstream(self.name())),
            },
        };

        self.stats.begin_operation();
        let started = Instant::now();
        let remaining = deadline.saturating_duration_since(Instant::now());

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(OperationError::Cancelled),
            result = tokio::time::timeout(remaining, op(self.transport.as_ref())) => match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(transport_err)) => Err(OperationError::Transport(transport_err)),
                Err(_) => Err(OperationError::DeadlineElapsed),
            },
        };
        drop(permit);

        let elapsed = started.elapsed();
        match outcome {
            Ok(value) => {
                self.stats.record_success(elapsed);
                self.breaker.record_success();
                self.reconcile_state();
                Ok(value)
            }
            Err(OperationError::Cancelled) => {
                self.stats.record_cancelled();
                Err(FleetError::cancelled().with_upstream(self.name()))
            }
            Err(OperationError::DeadlineElapsed) => {
                self.stats.record_failure(elapsed);
                self.breaker.record_failure();
                self.reconcile_state();
                Err(FleetError::timeout().with_upstream(self.name()))
            }
            Err(OperationError::Transport(transport_err)) => {
                self.stats.record_failure(elapsed);
                let fleet_err = FleetError::from_transport(self.name(), transport_err);
                if fleet_err.feeds_breaker() {
                    self.breaker.record_failure();
                }
                if !self.transport.is_alive() {
                    self.set_state(ConnectionState::Failed);
                } else {
                    self.reconcile_state();
                }
                Err(fleet_err)
            }
        }
    }

    /// Re-derive `Connected` / `Degraded` / `CircuitOpen` from current breaker
    /// and statistics state. Never touches `Disconnected`, `Connecting`,
    /// `Failed`, or `ShuttingDown` — those are driven by their own callers.
    fn reconcile_state(&self) {
        let current = self.state();
        if !matches!(
            current,
            ConnectionState::Connected | ConnectionState::Degraded | ConnectionState::CircuitOpen
        ) {
            return;
        }

        let target = if self.breaker.state() == CircuitState::Open {
            ConnectionState::CircuitOpen
        } else if self.is_degraded() {
            ConnectionState::Degraded
        } else {
            ConnectionState::Connected
        };
        self.set_state(target);
    }

    fn is_degraded(&self) -> bool {
        let snapshot = self.stats.snapshot();
        if snapshot.total_operations == 0 {
            return false;
        }
        snapshot.failure_rate() >= self.config.degradation.error_rate
            || snapshot.avg_latency_ms >= self.config.degradation.latency_ms
    }

    /// Synchronous one-shot probe, bypassing the periodic schedule.
    pub async fn force_health_check(&self) -> bool {
        let healthy = self.run_probe().await;
        if healthy {
            self.breaker.record_success();
        } else {
            self.breaker.record_failure();
        }
        self.reconcile_state();
        healthy
    }

    /// While `CircuitOpen`, the selector never routes traffic here, so the
    /// breaker's own cooldown-gated half-open probe would never get a chance
    /// to fire. The health task calls this once cooldown elapses to feed a
    /// probe through the same `allow()` gate a live call would use, so a
    /// `CircuitOpen` connection can still work its way back to `Connected`.
    async fn probe_circuit(&self) {
        let (allowed, _reason) = self.breaker.allow();
        if !allowed {
            return;
        }
        let healthy = self.run_probe().await;
        if healthy {
            self.breaker.record_success();
        } else {
            self.breaker.record_failure();
        }
        self.reconcile_state();
    }

    async fn run_probe(&self) -> bool {
        let timeout = self.config.health_check.timeout;
        let result = match &self.config.health_check.strategy {
            HealthCheckStrategy::None => return true,
            HealthCheckStrategy::PingTool { tool_name } => {
                tokio::time::timeout(timeout, self.transport.call_tool(tool_name, Value::Null)).await
            }
            HealthCheckStrategy::ListTools => {
                tokio::time::timeout(timeout, self.transport.list_tools()).await.map(|r| r.map(|_| Value::Null))
            }
            HealthCheckStrategy::ListResources => {
                tokio::time::timeout(timeout, self.transport.list_resources())
                    .await
                    .map(|r| r.map(|_| Value::Null))
            }
            HealthCheckStrategy::ApplicationLevel { probe_name } => {
                // No out-of-band probe hook is wired up yet; treated as
                // liveness-only until an embedder supplies one.
                tracing::debug!(upstream = %self.name(), probe_name, "application-level probe not wired; falling back to is_alive");
                return self.transport.is_alive();
            }
        };
        matches!(result, Ok(Ok(_)))
    }

    /// Spawn the periodic health-probe task. While `CircuitOpen`, probes
    /// through the breaker's own cooldown gate instead of the usual
    /// force-check path; runs at the shortened interval while `Degraded`.
    pub fn spawn_health_task(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let degraded = self.state() == ConnectionState::Degraded;
                let interval = self.config.health_check.effective_interval(degraded);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                if self.state() == ConnectionState::CircuitOpen {
                    self.probe_circuit().await;
                    continue;
                }
                if matches!(self.state(), ConnectionState::ShuttingDown | ConnectionState::Failed | ConnectionState::Disconnected) {
                    continue;
                }
                self.force_health_check().await;
            }
        })
    }
}

enum OperationError {
    Cancelled,
    DeadlineElapsed,
    Transport(crate::error::TransportError),
}

fn backoff_delay(retry: &ConnectRetryConfig, attempt: u32) -> Duration {
    let exp = retry.multiplier.powi(attempt as i32 - 1);
    let raw_ms = (retry.base_delay.as_millis() as f64 * exp).min(retry.max_delay.as_millis() as f64);
    let jitter = rand::thread_rng().gen_range(0.5..=1.0);
    Duration::from_millis((raw_ms * jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransportKind;

    fn descriptor() -> UpstreamDescriptor {
        UpstreamDescriptor {
            name: "test-upstream".to_string(),
            transport: TransportKind::Tcp { host: "127.0.0.1".to_string(), port: 1 },
            capabilities: None,
        }
    }

    fn connection() -> ResilientConnection {
        ResilientConnection::new(descriptor(), ConnectionConfig::default(), Arc::new(EventBus::new()))
    }

    #[test]
    fn starts_disconnected() {
        let conn = connection();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn fresh_connection_has_full_selection_weight() {
        let conn = connection();
        assert_eq!(conn.selection_weight(), 1.0);
    }

    #[test]
    fn warmup_ramps_from_zero() {
        let conn = connection();
        conn.begin_warmup(Duration::from_secs(60));
        let weight = conn.selection_weight();
        assert!(weight >= 0.0 && weight < 1.0);
    }

    #[tokio::test]
    async fn call_tool_rejected_while_circuit_open() {
        let conn = connection();
        conn.breaker.force_open();
        let deadline = Instant::now() + Duration::from_secs(1);
        let err = conn.call_tool("anything", Value::Null, deadline).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::CircuitOpen);
    }
}
