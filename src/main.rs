//! HTTP frontend for the resilient MCP fleet proxy.
//!
//! Mirrors the teacher `ha_gateway` binary's shape — `tracing-subscriber`
//! init, an `axum::Router` with `/health` and `/status`, `tower_http`
//! tracing middleware — but fronts a [`FleetManager`] instead of a single
//! round-robin Ethereum RPC pool, and speaks the same JSON-RPC envelope
//! (`types::RpcRequest`/`RpcResponse`) the fleet's own network transport
//! adapter uses downstream, so the gateway's wire shape is consistent end
//! to end.
//!
//! MCP wire framing and client-session correlation are out of this binary's
//! scope per the core's design (see `SPEC_FULL.md` §1): it hands off to
//! `FleetManager::call_tool`/`read_resource`, which already speaks MCP to
//! each upstream via `rmcp`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use mcp_fleet_gateway::config::FleetConfig;
use mcp_fleet_gateway::types::{RpcRequest, RpcResponse, TransportKind, UpstreamDescriptor};
use mcp_fleet_gateway::FleetManager;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone)]
struct AppState {
    fleet: Arc<FleetManager>,
}

/// On-disk shape: the typed [`FleetConfig`] plus the upstream descriptors
/// that aren't part of the core's own config surface (spec §6 treats
/// upstream descriptors as "consumed from external config", separately
/// from the tunables in `FleetConfig`).
#[derive(Debug, Deserialize)]
struct GatewayConfig {
    #[serde(default)]
    fleet: FleetConfig,
    #[serde(default)]
    listen_addr: Option<String>,
    #[serde(default = "default_upstreams")]
    upstreams: Vec<UpstreamDescriptor>,
}

fn default_upstreams() -> Vec<UpstreamDescriptor> {
    // Three local MCP servers, the same "three local nodes" shape the
    // teacher's `main.rs` hardcoded for its Ethereum pool.
    vec![
        UpstreamDescriptor {
            name: "upstream-1".to_string(),
            transport: TransportKind::Tcp { host: "127.0.0.1".to_string(), port: 8701 },
            capabilities: None,
        },
        UpstreamDescriptor {
            name: "upstream-2".to_string(),
            transport: TransportKind::Tcp { host: "127.0.0.1".to_string(), port: 8702 },
            capabilities: None,
        },
        UpstreamDescriptor {
            name: "upstream-3".to_string(),
            transport: TransportKind::Tcp { host: "127.0.0.1".to_string(), port: 8703 },
            capabilities: None,
        },
    ]
}

fn load_config() -> GatewayConfig {
    let Some(path) = std::env::args().nth(1) else {
        tracing::info!("no config path given, using built-in defaults");
        return GatewayConfig { fleet: FleetConfig::default(), listen_addr: None, upstreams: default_upstreams() };
    };
    let contents = std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("failed to read config '{path}': {e}"));
    serde_json::from_str(&contents).unwrap_or_else(|e| panic!("failed to parse config '{path}': {e}"))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mcp_fleet_gateway=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting MCP fleet gateway");

    let config = load_config();
    config.fleet.validate().expect("invalid fleet configuration");
    let listen_addr = config.listen_addr.clone().unwrap_or_else(|| "0.0.0.0:8080".to_string());

    let fleet = FleetManager::new(config.fleet).expect("fleet configuration already validated");

    tracing::info!(count = config.upstreams.len(), "adding configured upstreams");
    for descriptor in config.upstreams {
        let name = descriptor.name.clone();
        if let Err(err) = fleet.add_upstream(descriptor).await {
            tracing::error!(upstream = %name, error = %err, "failed to add upstream at startup");
        }
    }

    let state = AppState { fleet: Arc::clone(&fleet) };

    let app = Router::new()
        .route("/rpc", post(handle_rpc_request))
        .route("/health", get(health_check))
        .route("/status", get(status_check))
        .route("/recovery/{upstream}", post(force_recovery))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind to {listen_addr}: {e}"));

    tracing::info!(addr = %listen_addr, "listening");

    let shutdown_fleet = Arc::clone(&fleet);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received, draining fleet");
            shutdown_fleet.shutdown().await;
        })
        .await
        .expect("server failed");
}

/// Accepts a JSON-RPC 2.0 envelope whose `method` is `tools/call` or
/// `resources/read`, matching the MCP method names the fleet's own network
/// transport adapter speaks downstream (`transport::network`).
async fn handle_rpc_request(State(state): State<AppState>, Json(request): Json<RpcRequest>) -> impl IntoResponse {
    tracing::info!(method = %request.method, "received rpc request");

    let outcome = match request.method.as_str() {
        "tools/call" => dispatch_tool_call(&state, &request).await,
        "resources/read" => dispatch_resource_read(&state, &request).await,
        other => Err(RpcResponse::error(request.id.clone(), -32601, format!("unknown method '{other}'"))),
    };

    match outcome {
        Ok(result) => (StatusCode::OK, Json(RpcResponse::success(request.id, result))),
        Err(response) => (StatusCode::SERVICE_UNAVAILABLE, Json(response)),
    }
}

async fn dispatch_tool_call(state: &AppState, request: &RpcRequest) -> Result<serde_json::Value, RpcResponse> {
    let name = request
        .params
        .get("name")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| RpcResponse::error(request.id.clone(), -32602, "missing params.name".to_string()))?;
    let args = request.params.get("arguments").cloned().unwrap_or(serde_json::Value::Null);
    let (upstream, timeout) = request_hints(request);

    state
        .fleet
        .call_tool(name, args, upstream, timeout)
        .await
        .map_err(|e| RpcResponse::error(request.id.clone(), -32603, e.to_string()))
}

async fn dispatch_resource_read(state: &AppState, request: &RpcRequest) -> Result<serde_json::Value, RpcResponse> {
    let uri = request
        .params
        .get("uri")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| RpcResponse::error(request.id.clone(), -32602, "missing params.uri".to_string()))?;
    let (upstream, timeout) = request_hints(request);

    state
        .fleet
        .read_resource(uri, upstream, timeout)
        .await
        .map_err(|e| RpcResponse::error(request.id.clone(), -32603, e.to_string()))
}

fn request_hints(request: &RpcRequest) -> (Option<String>, Option<Duration>) {
    let upstream = request.params.get("upstream").and_then(serde_json::Value::as_str).map(str::to_string);
    let timeout = request
        .params
        .get("timeoutMs")
        .and_then(serde_json::Value::as_u64)
        .map(Duration::from_millis);
    (upstream, timeout)
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn status_check(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.fleet.status().await;
    let connections = status
        .connections
        .iter()
        .map(|c| {
            serde_json::json!({
                "name": c.name,
                "state": c.state.to_string(),
                "totalOperations": c.stats.total_operations,
                "failedOperations": c.stats.failed_operations,
                "inFlight": c.stats.in_flight,
                "avgLatencyMs": c.stats.avg_latency_ms,
            })
        })
        .collect::<Vec<_>>();

    let body = serde_json::json!({
        "draining": status.draining,
        "queueDepth": status.queue_depth,
        "connections": connections,
        "metrics": {
            "totalUpstreams": status.metrics.total_upstreams,
            "healthyUpstreams": status.metrics.healthy_upstreams,
            "unhealthyUpstreams": status.metrics.unhealthy_upstreams,
            "errorRatePercent": status.metrics.error_rate_percent,
            "weightedAvgLatencyMs": status.metrics.weighted_avg_latency_ms,
        },
        "alerts": status.alerts,
    });

    (StatusCode::OK, Json(body))
}

async fn force_recovery(State(state): State<AppState>, Path(upstream): Path<String>) -> impl IntoResponse {
    match state.fleet.force_recovery(&upstream).await {
        Ok(recovered) => (StatusCode::OK, Json(serde_json::json!({ "recovered": recovered }))),
        Err(e) => (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": e.to_string() }))),
    }
}
