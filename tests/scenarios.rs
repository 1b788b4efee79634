//! End-to-end scenarios seeded from the fleet's testable-properties section:
//! single-upstream happy path, circuit trip/recovery, health-weighted
//! failover, queue backpressure, deadline timeout, and staggered recovery.

use async_trait::async_trait;
use mcp_fleet_gateway::circuit_breaker::CircuitBreakerConfig;
use mcp_fleet_gateway::config::FleetConfig;
use mcp_fleet_gateway::connection::{ConnectRetryConfig, ConnectionConfig, DegradationThresholds};
use mcp_fleet_gateway::error::TransportError;
use mcp_fleet_gateway::events::EventBus;
use mcp_fleet_gateway::fleet::FleetManager;
use mcp_fleet_gateway::health::{HealthCheckConfig, HealthCheckStrategy};
use mcp_fleet_gateway::recovery::{FailoverStrategy, RecoveryConfig, RecoveryScheduler};
use mcp_fleet_gateway::connection::ResilientConnection;
use mcp_fleet_gateway::selector::SelectorStrategy;
use mcp_fleet_gateway::transport::UpstreamTransport;
use mcp_fleet_gateway::types::{ConnectionState, TransportKind, UpstreamDescriptor};
use mcp_fleet_gateway::ErrorKind;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A stand-in upstream transport: configurable call/connect failure counts
/// and artificial latency, so the fleet's retry/breaker/queue machinery can
/// be driven deterministically without a real subprocess or socket.
struct MockTransport {
    name: String,
    alive: AtomicBool,
    call_attempts: AtomicUsize,
    fail_calls: usize,
    always_fail_calls: bool,
    call_delay: Duration,
    connect_attempts: AtomicUsize,
    fail_connects: usize,
    connect_delay: Duration,
    connect_log: Option<Arc<Mutex<Vec<(String, usize, Instant)>>>>,
}

impl MockTransport {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            alive: AtomicBool::new(false),
            call_attempts: AtomicUsize::new(0),
            fail_calls: 0,
            always_fail_calls: false,
            call_delay: Duration::from_millis(0),
            connect_attempts: AtomicUsize::new(0),
            fail_connects: 0,
            connect_delay: Duration::from_millis(0),
            connect_log: None,
        }
    }

    fn fail_calls(mut self, n: usize) -> Self {
        self.fail_calls = n;
        self
    }

    fn always_fail_calls(mut self) -> Self {
        self.always_fail_calls = true;
        self
    }

    fn call_delay(mut self, d: Duration) -> Self {
        self.call_delay = d;
        self
    }

    fn fail_connects(mut self, n: usize) -> Self {
        self.fail_connects = n;
        self
    }

    fn connect_delay(mut self, d: Duration) -> Self {
        self.connect_delay = d;
        self
    }

    fn connect_log(mut self, log: Arc<Mutex<Vec<(String, usize, Instant)>>>) -> Self {
        self.connect_log = Some(log);
        self
    }
}

#[async_trait]
impl UpstreamTransport for MockTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let attempt = self.connect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(log) = &self.connect_log {
            log.lock().push((self.name.clone(), attempt, Instant::now()));
        }
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if attempt <= self.fail_connects {
            return Err(TransportError::Transport { message: format!("{} connect attempt {attempt} failed", self.name) });
        }
        self.alive.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn call_tool(&self, name: &str, args: Value) -> Result<Value, TransportError> {
        let attempt = self.call_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.call_delay.is_zero() {
            tokio::time::sleep(self.call_delay).await;
        }
        if self.always_fail_calls || attempt <= self.fail_calls {
            return Err(TransportError::Transport { message: format!("{} call {attempt} failed", self.name) });
        }
        if name == "echo" {
            Ok(args.get("msg").cloned().unwrap_or(Value::Null))
        } else {
            Ok(Value::Null)
        }
    }

    async fn read_resource(&self, _uri: &str) -> Result<Value, TransportError> {
        Ok(Value::Null)
    }

    async fn list_tools(&self) -> Result<Vec<String>, TransportError> {
        Ok(Vec::new())
    }

    async fn list_resources(&self) -> Result<Vec<String>, TransportError> {
        Ok(Vec::new())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

fn descriptor(name: &str) -> UpstreamDescriptor {
    UpstreamDescriptor {
        name: name.to_string(),
        transport: TransportKind::Tcp { host: "127.0.0.1".to_string(), port: 1 },
        capabilities: None,
    }
}

fn base_config() -> FleetConfig {
    let mut config = FleetConfig::default();
    config.health_check.strategy = HealthCheckStrategy::None;
    config
}

#[tokio::test]
async fn scenario_a_single_upstream_happy_path() {
    let fleet = FleetManager::new(base_config()).unwrap();
    let transport = MockTransport::new("A");
    fleet.add_upstream_with_transport(descriptor("A"), Box::new(transport)).await.unwrap();

    let result = fleet.call_tool("echo", json!({"msg": "hi"}), None, None).await.unwrap();
    assert_eq!(result, json!("hi"));

    let status = fleet.status().await;
    let a = status.connections.iter().find(|c| c.name == "A").unwrap();
    assert_eq!(a.state, ConnectionState::Connected);
    assert_eq!(a.stats.total_operations, 1);
    assert_eq!(a.stats.successful_operations, 1);
    assert_eq!(a.stats.failed_operations, 0);
}

#[tokio::test]
async fn scenario_b_circuit_trips_and_recovers() {
    let mut config = base_config();
    config.circuit_breaker.failure_threshold = 3;
    config.circuit_breaker.success_threshold = 1;
    config.circuit_breaker.cooldown_ms = 200;
    // Disable the automatic recovery scheduler and health prober so the
    // breaker's own allow()/half-open gate is the only thing under test.
    config.recovery.auto_recovery = false;

    let fleet = FleetManager::new(config).unwrap();
    let transport = MockTransport::new("A").fail_calls(3);
    fleet.add_upstream_with_transport(descriptor("A"), Box::new(transport)).await.unwrap();

    let mut kinds = Vec::new();
    for _ in 0..4 {
        let err = fleet.call_tool("op", Value::Null, None, None).await.unwrap_err();
        kinds.push(err.kind);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(kinds, vec![ErrorKind::Transport, ErrorKind::Transport, ErrorKind::Transport, ErrorKind::CircuitOpen]);

    tokio::time::sleep(Duration::from_millis(250)).await;

    let ok = fleet.call_tool("op", Value::Null, None, None).await;
    assert!(ok.is_ok(), "expected the half-open probe to succeed, got {ok:?}");

    let status = fleet.status().await;
    let a = status.connections.iter().find(|c| c.name == "A").unwrap();
    assert_eq!(a.state, ConnectionState::Connected);
}

#[tokio::test]
async fn scenario_c_failover_isolates_failing_upstream() {
    let mut config = base_config();
    config.load_balancing.strategy = SelectorStrategy::HealthWeighted;
    config.circuit_breaker.failure_threshold = 3;
    config.recovery.auto_recovery = false;

    let fleet = FleetManager::new(config).unwrap();
    fleet
        .add_upstream_with_transport(descriptor("A"), Box::new(MockTransport::new("A").always_fail_calls()))
        .await
        .unwrap();
    fleet
        .add_upstream_with_transport(descriptor("B"), Box::new(MockTransport::new("B")))
        .await
        .unwrap();

    // Drive enough traffic that A's breaker has a chance to trip; outcomes
    // before that point are not asserted since health-weighted selection
    // initially splits traffic between both upstreams.
    for _ in 0..100 {
        let _ = fleet.call_tool("op", Value::Null, None, None).await;
        let status = fleet.status().await;
        let a = status.connections.iter().find(|c| c.name == "A").unwrap();
        if a.state == ConnectionState::CircuitOpen {
            break;
        }
    }

    let status = fleet.status().await;
    let a = status.connections.iter().find(|c| c.name == "A").unwrap();
    assert_eq!(a.state, ConnectionState::CircuitOpen, "A's breaker should have tripped by now");

    // Once A is isolated, every subsequent call must land on B and succeed.
    for _ in 0..10 {
        let result = fleet.call_tool("echo", json!({"msg": "ok"}), None, None).await.unwrap();
        assert_eq!(result, json!("ok"));
    }
}

#[tokio::test]
async fn scenario_d_backpressure_rejects_when_queue_full() {
    let mut config = base_config();
    config.resources.max_queue_size = 2;
    config.load_balancing.max_concurrent_requests = 1;
    config.load_balancing.max_concurrent_requests_per_upstream = 1;

    let fleet = FleetManager::new(config).unwrap();
    let transport = MockTransport::new("slow").call_delay(Duration::from_millis(300));
    fleet.add_upstream_with_transport(descriptor("slow"), Box::new(transport)).await.unwrap();

    let fleet0 = Arc::clone(&fleet);
    let call0 = tokio::spawn(async move { fleet0.call_tool("op", Value::Null, None, None).await });

    // Give the dispatcher a moment to pick call0 up so it occupies the
    // fleet's sole concurrency permit before the next two are submitted.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let fleet1 = Arc::clone(&fleet);
    let call1 = tokio::spawn(async move { fleet1.call_tool("op", Value::Null, None, None).await });
    let fleet2 = Arc::clone(&fleet);
    let call2 = tokio::spawn(async move { fleet2.call_tool("op", Value::Null, None, None).await });

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(fleet.status().await.queue_depth, 2, "both follow-up calls should be queued");

    // The queue is now at capacity; two more submissions must be rejected
    // immediately rather than waiting.
    let rejected1 = fleet.call_tool("op", Value::Null, None, None).await;
    let rejected2 = fleet.call_tool("op", Value::Null, None, None).await;
    assert_eq!(rejected1.unwrap_err().kind, ErrorKind::QueueFull);
    assert_eq!(rejected2.unwrap_err().kind, ErrorKind::QueueFull);

    assert!(call0.await.unwrap().is_ok());
    assert!(call1.await.unwrap().is_ok());
    assert!(call2.await.unwrap().is_ok());
    assert_eq!(fleet.status().await.queue_depth, 0);
}

#[tokio::test]
async fn scenario_e_deadline_timeout() {
    let fleet = FleetManager::new(base_config()).unwrap();
    let transport = MockTransport::new("slow").call_delay(Duration::from_millis(500));
    fleet.add_upstream_with_transport(descriptor("slow"), Box::new(transport)).await.unwrap();

    let started = Instant::now();
    let err = fleet
        .call_tool("op", Value::Null, None, Some(Duration::from_millis(100)))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err.kind, ErrorKind::Timeout);
    assert!(elapsed >= Duration::from_millis(90) && elapsed <= Duration::from_millis(300), "elapsed={elapsed:?}");

    let status = fleet.status().await;
    let slow = status.connections.iter().find(|c| c.name == "slow").unwrap();
    assert_eq!(slow.stats.failed_operations, 1);
}

#[tokio::test]
async fn scenario_f_staggered_recovery_bounds_concurrency() {
    const UPSTREAMS: usize = 10;
    const MAX_PARALLEL: usize = 3;
    let connect_delay = Duration::from_millis(120);
    let log: Arc<Mutex<Vec<(String, usize, Instant)>>> = Arc::new(Mutex::new(Vec::new()));

    let connection_config = ConnectionConfig {
        circuit_breaker: CircuitBreakerConfig::default(),
        health_check: HealthCheckConfig { strategy: HealthCheckStrategy::None, ..HealthCheckConfig::default() },
        connect_retry: ConnectRetryConfig {
            base_delay: Duration::from_millis(5),
            multiplier: 1.0,
            max_delay: Duration::from_millis(5),
            max_attempts: 1,
        },
        degradation: DegradationThresholds::default(),
        max_concurrent_requests: 8,
        ema_alpha: 0.2,
    };

    let recovery = Arc::new(RecoveryScheduler::new(RecoveryConfig {
        auto_recovery: true,
        strategy: FailoverStrategy::CircuitBreaker,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        backoff_multiplier: 1.0,
        max_parallel_recoveries: MAX_PARALLEL,
        stagger_jitter: Duration::from_millis(10),
        failback_delay: Duration::from_millis(0),
        pre_recovery_health_check: false,
        gradual_warmup: Duration::from_millis(0),
    }));

    let mut connections = Vec::new();
    for i in 0..UPSTREAMS {
        let name = format!("u{i}");
        let transport = MockTransport::new(&name)
            .fail_connects(1)
            .connect_delay(connect_delay)
            .connect_log(Arc::clone(&log));
        let conn = Arc::new(ResilientConnection::with_transport(
            descriptor(&name),
            Box::new(transport),
            connection_config.clone(),
            Arc::new(EventBus::new()),
        ));
        // Drives every connection to `Failed` via its own (unbounded)
        // initial connect attempt, before recovery scheduling begins.
        assert!(conn.connect().await.is_err());
        assert_eq!(conn.state(), ConnectionState::Failed);
        connections.push(conn);
    }

    for conn in &connections {
        recovery.on_failed(Arc::clone(conn));
    }

    tokio::time::sleep(Duration::from_secs(3)).await;

    for conn in &connections {
        assert_eq!(conn.state(), ConnectionState::Connected, "{} should have recovered", conn.name());
    }

    // Only the second connect() call per upstream (attempt == 2) is gated by
    // the recovery scheduler's semaphore; the first is each connection's own
    // unbounded initial attempt above.
    let recorded = log.lock().clone();
    let gated: Vec<Instant> = recorded.iter().filter(|(_, attempt, _)| *attempt == 2).map(|(_, _, at)| *at).collect();
    assert_eq!(gated.len(), UPSTREAMS);

    let max_overlap = max_concurrent_intervals(&gated, connect_delay);
    assert!(max_overlap <= MAX_PARALLEL, "observed {max_overlap} concurrent recovery attempts, expected <= {MAX_PARALLEL}");
}

/// Given a set of interval start times sharing the same fixed duration,
/// returns the maximum number of intervals overlapping at any instant.
fn max_concurrent_intervals(starts: &[Instant], duration: Duration) -> usize {
    let mut events: Vec<(Instant, i32)> = Vec::with_capacity(starts.len() * 2);
    for &start in starts {
        events.push((start, 1));
        events.push((start + duration, -1));
    }
    events.sort_by_key(|(t, delta)| (*t, -*delta));
    let mut current = 0i32;
    let mut max = 0i32;
    for (_, delta) in events {
        current += delta;
        max = max.max(current);
    }
    max as usize
}
