//! Stdio-subprocess transport adapter, backed by `rmcp`'s child-process
//! transport — the same crate and pattern `cortexd-labs-neurond` uses to
//! speak to downstream MCP servers
//! (`federation/transport.rs::connect_stdio`).

use super::UpstreamTransport;
use crate::error::TransportError;
use async_trait::async_trait;
use parking_lot::Mutex;
use rmcp::model::{CallToolRequestParams, ReadResourceRequestParam};
use rmcp::service::RunningService;
use rmcp::RoleClient;
use serde_json::Value;
use std::collections::HashMap;

/// Speaks MCP to a child process over stdio.
///
/// `connect`/`disconnect` are idempotent: connecting an already-running
/// adapter, or disconnecting an already-stopped one, is a no-op.
pub struct StdioAdapter {
    cmd: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    client: Mutex<Option<RunningService<RoleClient, ()>>>,
}

impl StdioAdapter {
    pub fn new(cmd: String, args: Vec<String>, env: HashMap<String, String>) -> Self {
        Self {
            cmd,
            args,
            env,
            client: Mutex::new(None),
        }
    }

    fn take_client(&self) -> Option<RunningService<RoleClient, ()>> {
        self.client.lock().take()
    }
}

#[async_trait]
impl UpstreamTransport for StdioAdapter {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.client.lock().is_some() {
            return Ok(());
        }

        let mut command = tokio::process::Command::new(&self.cmd);
        command.args(&self.args).envs(&self.env);

        let transport = rmcp::transport::TokioChildProcess::new(command).map_err(|e| TransportError::Transport {
            message: format!("failed to spawn '{}': {e}", self.cmd),
        })?;

        let running = rmcp::service::serve_client((), transport)
            .await
            .map_err(|e| TransportError::Transport {
                message: format!("mcp handshake failed for '{}': {e}", self.cmd),
            })?;

        *self.client.lock() = Some(running);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if let Some(running) = self.take_client() {
            let _ = running.cancel().await;
        }
        Ok(())
    }

    async fn call_tool(&self, name: &str, args: Value) -> Result<Value, TransportError> {
        let guard = self.client.lock();
        let client = guard.as_ref().ok_or_else(|| TransportError::Transport {
            message: "not connected".to_string(),
        })?;

        let params = CallToolRequestParams {
            name: name.to_string().into(),
            arguments: args.as_object().cloned(),
            meta: None,
            task: None,
        };

        let peer = client.peer().clone();
        drop(guard);

        let result = peer.call_tool(params).await.map_err(map_rmcp_error)?;
        serde_json::to_value(&result).map_err(|e| TransportError::Protocol {
            message: format!("failed to encode tool result: {e}"),
        })
    }

    async fn read_resource(&self, uri: &str) -> Result<Value, TransportError> {
        let guard = self.client.lock();
        let client = guard.as_ref().ok_or_else(|| TransportError::Transport {
            message: "not connected".to_string(),
        })?;
        let peer = client.peer().clone();
        drop(guard);

        let result = peer
            .read_resource(ReadResourceRequestParam { uri: uri.to_string() })
            .await
            .map_err(map_rmcp_error)?;
        serde_json::to_value(&result).map_err(|e| TransportError::Protocol {
            message: format!("failed to encode resource contents: {e}"),
        })
    }

    async fn list_tools(&self) -> Result<Vec<String>, TransportError> {
        let guard = self.client.lock();
        let client = guard.as_ref().ok_or_else(|| TransportError::Transport {
            message: "not connected".to_string(),
        })?;
        let peer = client.peer().clone();
        drop(guard);

        let tools = peer.list_all_tools().await.map_err(map_rmcp_error)?;
        Ok(tools.into_iter().map(|t| t.name.to_string()).collect())
    }

    async fn list_resources(&self) -> Result<Vec<String>, TransportError> {
        let guard = self.client.lock();
        let client = guard.as_ref().ok_or_else(|| TransportError::Transport {
            message: "not connected".to_string(),
        })?;
        let peer = client.peer().clone();
        drop(guard);

        let resources = peer.list_all_resources().await.map_err(map_rmcp_error)?;
        Ok(resources.into_iter().map(|r| r.uri).collect())
    }

    fn is_alive(&self) -> bool {
        self.client.lock().is_some()
    }
}

fn map_rmcp_error(err: rmcp::ErrorData) -> TransportError {
    use rmcp::model::ErrorCode;
    if err.code == ErrorCode::METHOD_NOT_FOUND || err.code == ErrorCode::INVALID_PARAMS {
        TransportError::Protocol { message: err.message.to_string() }
    } else {
        TransportError::Remote { message: err.message.to_string() }
    }
}
