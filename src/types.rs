//! Shared data types: upstream descriptors, connection state, alerts.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::SystemTime;

/// A minimal JSON-RPC 2.0 envelope, used by the network transport adapter
/// (`transport::network`) to talk to upstreams that speak MCP over a plain
/// TCP/HTTP JSON-RPC endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    pub id: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params,
            id: serde_json::Value::String(uuid::Uuid::new_v4().to_string()),
        }
    }
}

impl RpcResponse {
    pub fn success(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: serde_json::Value, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(RpcError {
                code,
                message,
                data: None,
            }),
            id,
        }
    }
}

/// How to reach a single upstream: a subprocess speaking MCP over stdio, or
/// a network endpoint speaking MCP over TCP/HTTP or a WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportKind {
    Stdio {
        cmd: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Tcp { host: String, port: u16 },
    Ws { url: String },
}

impl TransportKind {
    /// Rejects malformed endpoints before a connection attempt is ever made,
    /// rather than letting them surface as a confusing first-connect
    /// transport error.
    pub fn validate(&self) -> Result<(), crate::error::FleetError> {
        match self {
            Self::Stdio { cmd, .. } if cmd.trim().is_empty() => {
                Err(crate::error::FleetError::configuration("stdio transport requires a non-empty cmd"))
            }
            Self::Stdio { .. } => Ok(()),
            Self::Tcp { host, .. } if host.trim().is_empty() => {
                Err(crate::error::FleetError::configuration("tcp transport requires a non-empty host"))
            }
            Self::Tcp { .. } => Ok(()),
            Self::Ws { url } => url::Url::parse(url)
                .map_err(|e| crate::error::FleetError::configuration(format!("invalid websocket url '{url}': {e}")))
                .and_then(|parsed| match parsed.scheme() {
                    "ws" | "wss" => Ok(()),
                    other => Err(crate::error::FleetError::configuration(format!(
                        "websocket url '{url}' has unsupported scheme '{other}'"
                    ))),
                }),
        }
    }
}

/// Immutable descriptor for one upstream, as consumed from external config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamDescriptor {
    pub name: String,
    pub transport: TransportKind,
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
}

/// Lifecycle state of a resilient connection (C4).
///
/// Initial state on creation is `Disconnected`; the only terminal state is
/// `ShuttingDown`, after which the connection is removed from the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
    CircuitOpen,
    Failed,
    ShuttingDown,
}

impl ConnectionState {
    /// `true` for states the selector may dispatch new work to.
    ///
    /// `CircuitOpen` and `Failed` never satisfy eligibility; `Degraded` is
    /// conditionally eligible depending on the `degradedEligible` config
    /// toggle, evaluated by the caller, not here.
    pub fn is_selectable(self) -> bool {
        matches!(self, Self::Connected | Self::Degraded)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
            Self::CircuitOpen => "circuit_open",
            Self::Failed => "failed",
            Self::ShuttingDown => "shutting_down",
        };
        f.write_str(s)
    }
}

/// Severity of an operational [`Alert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// An operational alert raised by the periodic metrics sweep or a state
/// transition. Alerts have process lifetime only; they are not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub message: String,
    pub upstream: Option<String>,
    #[serde(skip, default = "SystemTime::now")]
    pub timestamp: SystemTime,
    pub acknowledged: bool,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl Alert {
    pub fn new(severity: AlertSeverity, message: impl Into<String>, upstream: Option<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            upstream,
            timestamp: SystemTime::now(),
            acknowledged: false,
            details: serde_json::Value::Null,
        }
    }

    /// Coalescing key: alerts about the same upstream and the same kind of
    /// message should be merged rather than flooding the log/alert stream.
    pub fn coalesce_key(&self) -> (Option<String>, String) {
        (self.upstream.clone(), self.message_kind())
    }

    fn message_kind(&self) -> String {
        self.message
            .split_whitespace()
            .take(3)
            .collect::<Vec<_>>()
            .join(" ")
    }
}
