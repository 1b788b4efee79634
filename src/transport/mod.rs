//! Upstream transport adapter (C1): the polymorphic capability the
//! resilient connection drives, abstracting over stdio-subprocess,
//! tcp-socket, and websocket upstreams.
//!
//! The core never branches on transport kind (spec §9's dynamic-dispatch
//! design note): `ResilientConnection` holds a `Box<dyn UpstreamTransport>`
//! and calls the same four methods regardless of what is on the other end.

pub mod network;
pub mod stdio;

use crate::error::TransportError;
use crate::types::TransportKind;
use async_trait::async_trait;
use serde_json::Value;

/// Capability exposed by every upstream transport adapter.
///
/// `connect` must be idempotent: calling it again on an already-connected
/// adapter succeeds without side effect. `disconnect` must tolerate being
/// called from any prior state, including never-connected.
///
/// No retry logic lives here — that's the resilient connection's job.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    async fn call_tool(&self, name: &str, args: Value) -> Result<Value, TransportError>;

    async fn read_resource(&self, uri: &str) -> Result<Value, TransportError>;

    /// List the upstream's tools; used by the `ListTools` health strategy
    /// and by recovery pre-checks.
    async fn list_tools(&self) -> Result<Vec<String>, TransportError>;

    /// List the upstream's resources; used by the `ListResources` health
    /// strategy.
    async fn list_resources(&self) -> Result<Vec<String>, TransportError>;

    fn is_alive(&self) -> bool;
}

/// Construct the adapter implied by an upstream's [`TransportKind`].
pub fn build_adapter(transport: &TransportKind) -> Box<dyn UpstreamTransport> {
    match transport {
        TransportKind::Stdio { cmd, args, env } => {
            Box::new(stdio::StdioAdapter::new(cmd.clone(), args.clone(), env.clone()))
        }
        TransportKind::Tcp { host, port } => {
            Box::new(network::NetworkAdapter::new_http(format!("http://{host}:{port}")))
        }
        TransportKind::Ws { url } => Box::new(network::NetworkAdapter::new_ws(url.clone())),
    }
}
