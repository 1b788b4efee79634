//! Fleet manager (C8): owns the upstream set, coordinates the queue,
//! selector, and recovery scheduler, and surfaces metrics/alerts.
//!
//! This is the crate's front door, replacing the teacher's `AppState` +
//! `LoadBalancer` pairing in `main.rs`/`load_balancer.rs` with the full
//! queue-gated, circuit-breaker-aware dispatch pipeline the spec describes.

use crate::config::FleetConfig;
use crate::connection::ResilientConnection;
use crate::error::{ErrorKind, FleetError};
use crate::events::{Event, EventBus};
use crate::metrics::{self, AlertLog, FleetMetrics};
use crate::queue::{BoxedOperation, RequestQueue};
use crate::recovery::RecoveryScheduler;
use crate::selector::Selector;
use crate::stats::StatsSnapshot;
use crate::types::{Alert, ConnectionState, UpstreamDescriptor};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const ALERT_LOG_CAPACITY: usize = 256;

pub type Connections = Arc<RwLock<HashMap<String, Arc<ResilientConnection>>>>;

#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub name: String,
    pub state: ConnectionState,
    pub stats: StatsSnapshot,
}

#[derive(Debug, Clone)]
pub struct FleetStatus {
    pub connections: Vec<ConnectionStatus>,
    pub metrics: FleetMetrics,
    pub alerts: Vec<Alert>,
    pub queue_depth: usize,
    pub draining: bool,
}

pub struct FleetManager {
    config: FleetConfig,
    connections: Connections,
    queue: RequestQueue<Value>,
    selector: Arc<Selector>,
    recovery: Arc<RecoveryScheduler>,
    alerts: Arc<AlertLog>,
    events: Arc<EventBus>,
    draining: AtomicBool,
    background_cancel: CancellationToken,
}

impl FleetManager {
    pub fn new(config: FleetConfig) -> Result<Arc<Self>, FleetError> {
        config.validate()?;

        let events = Arc::new(EventBus::new());
        let manager = Arc::new(Self {
            queue: RequestQueue::new(config.resources.max_queue_size, config.load_balancing.max_concurrent_requests),
            selector: Arc::new(Selector::new(config.selector_config())),
            recovery: Arc::new(RecoveryScheduler::new(config.recovery_config())),
            alerts: Arc::new(AlertLog::new(ALERT_LOG_CAPACITY)),
            connections: Arc::new(RwLock::new(HashMap::new())),
            events,
            draining: AtomicBool::new(false),
            background_cancel: CancellationToken::new(),
            config,
        });

        manager.spawn_dispatcher();
        manager.spawn_metrics_sweep();
        manager.spawn_recovery_watcher();
        Ok(manager)
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    fn spawn_dispatcher(self: &Arc<Self>) {
        let queue = self.queue.clone();
        let cancel = self.background_cancel.clone();
        tokio::spawn(async move {
            loop {
                let dispatched = tokio::select! {
                    _ = cancel.cancelled() => return,
                    dispatched = queue.dispatch_next() => dispatched,
                };
                tokio::spawn(async move {
                    let result = match dispatched.request.take_operation() {
                        Some(op) => op().await,
                        None => Err(FleetError::cancelled()),
                    };
                    dispatched.request.complete(result);
                    drop(dispatched.permit);
                });
            }
        });
    }

    fn spawn_metrics_sweep(self: &Arc<Self>) {
        let connections = Arc::clone(&self.connections);
        let alerts = Arc::clone(&self.alerts);
        let events = Arc::clone(&self.events);
        let monitoring = self.config.monitoring.clone();
        let cancel = self.background_cancel.clone();
        let interval = Duration::from_millis(monitoring.sweep_interval_ms);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                let snapshot: Vec<_> = connections.read().await.values().cloned().collect();
                let sweep = metrics::sweep(&snapshot);
                metrics::evaluate_alerts(&sweep, &monitoring, &alerts);
                events.publish(Event::MetricsSwept);
            }
        });
    }

    /// Watches the event bus for `Failed` transitions raised anywhere — not
    /// just the initial `connect()` failure `add_upstream` already handles
    /// inline — and hands each one to the recovery scheduler. A mid-flight
    /// transport failure or a failed health probe both land here too.
    fn spawn_recovery_watcher(self: &Arc<Self>) {
        let mut rx = self.events.subscribe();
        let events = Arc::clone(&self.events);
        let connections = Arc::clone(&self.connections);
        let recovery = Arc::clone(&self.recovery);
        let cancel = self.background_cancel.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = rx.recv() => event,
                };
                let Event::StateChanged { name, to: ConnectionState::Failed, .. } = (match event {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        events.record_lagged(n);
                        continue;
                    }
                }) else {
                    continue;
                };
                if let Some(conn) = connections.read().await.get(&name).cloned() {
                    recovery.on_failed(conn);
                }
            }
        });
    }

    pub async fn add_upstream(&self, descriptor: UpstreamDescriptor) -> Result<(), FleetError> {
        descriptor.transport.validate()?;
        let transport = crate::transport::build_adapter(&descriptor.transport);
        self.add_upstream_with_transport(descriptor, transport).await
    }

    /// Add an upstream driven by a caller-supplied transport instead of one
    /// derived from its descriptor's [`crate::types::TransportKind`]. Exists
    /// so tests can exercise the full queue/selector/recovery pipeline
    /// against a test double without spawning a real process or socket.
    pub async fn add_upstream_with_transport(
        &self,
        descriptor: UpstreamDescriptor,
        transport: Box<dyn crate::transport::UpstreamTransport>,
    ) -> Result<(), FleetError> {
        if self.draining.load(Ordering::SeqCst) {
            return Err(FleetError::new(ErrorKind::ConfigurationError, "fleet is draining; cannot add upstream"));
        }

        let mut guard = self.connections.write().await;
        if guard.contains_key(&descriptor.name) {
            return Err(FleetError::new(
                ErrorKind::ConfigurationError,
                format!("upstream '{}' already exists", descriptor.name),
            ));
        }
        if guard.len() >= self.config.resources.max_total_upstreams {
            return Err(FleetError::limit_exceeded(guard.len(), self.config.resources.max_total_upstreams));
        }

        let name = descriptor.name.clone();
        let connection = Arc::new(ResilientConnection::with_transport(
            descriptor,
            transport,
            self.config.connection_config(),
            Arc::clone(&self.events),
        ));
        guard.insert(name.clone(), Arc::clone(&connection));
        drop(guard);

        connection.clone().spawn_health_task();
        self.events.publish(Event::UpstreamAdded { name: name.clone() });

        if let Err(err) = connection.connect().await {
            tracing::warn!(upstream = %name, error = %err, "initial connect failed; recovery scheduler will retry");
            self.recovery.on_failed(connection);
        }
        Ok(())
    }

    pub async fn remove_upstream(&self, name: &str) -> Result<(), FleetError> {
        let connection = {
            let mut guard = self.connections.write().await;
            guard.remove(name)
        };
        let Some(connection) = connection else {
            return Ok(());
        };
        connection.disconnect().await?;
        self.recovery.forget(name);
        self.events.publish(Event::UpstreamRemoved { name: name.to_string() });
        Ok(())
    }

    pub async fn force_recovery(&self, name: &str) -> Result<bool, FleetError> {
        let connection = {
            let guard = self.connections.read().await;
            guard.get(name).cloned()
        };
        let connection = connection.ok_or_else(FleetError::no_upstream_available)?;
        Ok(self.recovery.force_recovery(connection).await)
    }

    pub async fn call_tool(
        &self,
        tool: &str,
        args: Value,
        preferred_upstream: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<Value, FleetError> {
        self.dispatch(preferred_upstream, timeout, {
            let tool = tool.to_string();
            move |conn, deadline| {
                let tool = tool.clone();
                Box::pin(async move { conn.call_tool(&tool, args, deadline).await })
            }
        })
        .await
    }

    pub async fn read_resource(
        &self,
        uri: &str,
        preferred_upstream: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<Value, FleetError> {
        self.dispatch(preferred_upstream, timeout, {
            let uri = uri.to_string();
            move |conn, deadline| {
                let uri = uri.clone();
                Box::pin(async move { conn.read_resource(&uri, deadline).await })
            }
        })
        .await
    }

    async fn dispatch<F>(&self, preferred: Option<String>, timeout: Option<Duration>, invoke: F) -> Result<Value, FleetError>
    where
        F: Fn(Arc<ResilientConnection>, Instant) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Value, FleetError>> + Send>>
            + Send
            + Sync
            + 'static,
    {
        if self.draining.load(Ordering::SeqCst) {
            return Err(FleetError::new(ErrorKind::Cancelled, "fleet is shutting down"));
        }

        let deadline = Instant::now() + timeout.unwrap_or_else(|| self.config.default_request_timeout());
        let connections = Arc::clone(&self.connections);
        let selector = Arc::clone(&self.selector);
        let invoke = Arc::new(invoke);
        let preferred_for_op = preferred.clone();

        let operation: BoxedOperation<Value> = Box::new(move || {
            Box::pin(async move {
                let list: Vec<_> = connections.read().await.values().cloned().collect();
                let conn = selector
                    .select(&list, preferred_for_op.as_deref())
                    .ok_or_else(FleetError::no_upstream_available)?;
                invoke(conn, deadline).await
            })
        });

        let handle = self.queue.submit(operation, preferred, deadline)?;
        handle.join(deadline).await
    }

    pub async fn status(&self) -> FleetStatus {
        let guard = self.connections.read().await;
        let snapshot: Vec<_> = guard.values().cloned().collect();
        let connections = snapshot
            .iter()
            .map(|c| ConnectionStatus { name: c.name().to_string(), state: c.state(), stats: c.stats() })
            .collect();
        drop(guard);

        FleetStatus {
            connections,
            metrics: metrics::sweep(&snapshot),
            alerts: self.alerts.snapshot(),
            queue_depth: self.queue.depth(),
            draining: self.draining.load(Ordering::SeqCst),
        }
    }

    /// Transitions the fleet into a draining state: new submissions are
    /// rejected, in-flight work is allowed to finish up to a grace period,
    /// then every connection disconnects in parallel. Idempotent.
    pub async fn shutdown(&self) {
        if self.draining.swap(true, Ordering::SeqCst) {
            return;
        }

        tokio::time::sleep(SHUTDOWN_GRACE).await;

        self.background_cancel.cancel();
        self.recovery.shutdown();

        let guard = self.connections.read().await;
        let disconnects = guard.values().map(|c| {
            let c = Arc::clone(c);
            async move {
                if let Err(err) = c.disconnect().await {
                    tracing::warn!(upstream = %c.name(), error = %err, "error during shutdown disconnect");
                }
            }
        });
        futures::future::join_all(disconnects).await;
    }
}
