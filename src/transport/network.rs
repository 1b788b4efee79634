//! Network transport adapter: plain HTTP/TCP JSON-RPC (grounded in the
//! teacher's `upstream.rs` reqwest client) and WebSocket (grounded in
//! `praxiomlabs-mcpkit`'s `mcpkit-transport/src/websocket/client.rs`).

use super::UpstreamTransport;
use crate::error::TransportError;
use crate::types::{RpcRequest, RpcResponse};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

enum Mode {
    Http { base_url: String, client: reqwest::Client },
    Ws { url: String, stream: Mutex<Option<WebSocketStream<MaybeTlsStream<TcpStream>>>> },
}

/// Speaks MCP to a network-reachable upstream, over plain HTTP JSON-RPC or a
/// persistent WebSocket connection.
pub struct NetworkAdapter {
    mode: Mode,
    connected: AtomicBool,
}

impl NetworkAdapter {
    pub fn new_http(base_url: String) -> Self {
        Self {
            mode: Mode::Http {
                base_url,
                client: reqwest::Client::builder()
                    .timeout(REQUEST_TIMEOUT)
                    .build()
                    .expect("reqwest client config is static and valid"),
            },
            connected: AtomicBool::new(false),
        }
    }

    pub fn new_ws(url: String) -> Self {
        Self {
            mode: Mode::Ws { url, stream: Mutex::new(None) },
            connected: AtomicBool::new(false),
        }
    }

    async fn call_http(
        base_url: &str,
        client: &reqwest::Client,
        method: &str,
        params: Value,
    ) -> Result<Value, TransportError> {
        let request = RpcRequest::new(method, params);
        let response = client
            .post(base_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| TransportError::Transport { message: format!("request failed: {e}") })?;

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| TransportError::Protocol { message: format!("malformed response: {e}") })?;

        match (body.result, body.error) {
            (Some(result), _) => Ok(result),
            (None, Some(err)) => Err(TransportError::Remote { message: err.message }),
            (None, None) => Err(TransportError::Protocol {
                message: "response carried neither result nor error".to_string(),
            }),
        }
    }

    async fn call_ws(
        stream: &Mutex<Option<WebSocketStream<MaybeTlsStream<TcpStream>>>>,
        method: &str,
        params: Value,
    ) -> Result<Value, TransportError> {
        let request = RpcRequest::new(method, params);
        let text = serde_json::to_string(&request)
            .map_err(|e| TransportError::Protocol { message: format!("failed to encode request: {e}") })?;

        // The websocket stream is not `Sync`-friendly to hold across an
        // await while locked, so take it out, drive it, and put it back.
        let mut owned = stream.lock().take().ok_or_else(|| TransportError::Transport {
            message: "not connected".to_string(),
        })?;

        let send_result = owned.send(Message::Text(text)).await;
        if let Err(e) = send_result {
            *stream.lock() = Some(owned);
            return Err(TransportError::Transport { message: format!("send failed: {e}") });
        }

        loop {
            match owned.next().await {
                Some(Ok(Message::Text(text))) => {
                    *stream.lock() = Some(owned);
                    let body: RpcResponse = serde_json::from_str(&text).map_err(|e| TransportError::Protocol {
                        message: format!("malformed response: {e}"),
                    })?;
                    return match (body.result, body.error) {
                        (Some(result), _) => Ok(result),
                        (None, Some(err)) => Err(TransportError::Remote { message: err.message }),
                        (None, None) => Err(TransportError::Protocol {
                            message: "response carried neither result nor error".to_string(),
                        }),
                    };
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(TransportError::Transport { message: format!("websocket error: {e}") });
                }
                None => {
                    return Err(TransportError::Transport {
                        message: "websocket closed by peer".to_string(),
                    });
                }
            }
        }
    }
}

#[async_trait]
impl UpstreamTransport for NetworkAdapter {
    async fn connect(&self) -> Result<(), TransportError> {
        match &self.mode {
            Mode::Http { .. } => {
                // Stateless: there's nothing to establish ahead of time.
                self.connected.store(true, Ordering::SeqCst);
                Ok(())
            }
            Mode::Ws { url, stream } => {
                if stream.lock().is_some() {
                    return Ok(());
                }
                let (ws, _response) = tokio_tungstenite::connect_async(url.as_str())
                    .await
                    .map_err(|e| TransportError::Transport { message: format!("websocket connect to '{url}' failed: {e}") })?;
                *stream.lock() = Some(ws);
                self.connected.store(true, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        if let Mode::Ws { stream, .. } = &self.mode {
            if let Some(mut ws) = stream.lock().take() {
                let _ = ws.close(None).await;
            }
        }
        Ok(())
    }

    async fn call_tool(&self, name: &str, args: Value) -> Result<Value, TransportError> {
        let params = serde_json::json!({ "name": name, "arguments": args });
        match &self.mode {
            Mode::Http { base_url, client } => Self::call_http(base_url, client, "tools/call", params).await,
            Mode::Ws { stream, .. } => Self::call_ws(stream, "tools/call", params).await,
        }
    }

    async fn read_resource(&self, uri: &str) -> Result<Value, TransportError> {
        let params = serde_json::json!({ "uri": uri });
        match &self.mode {
            Mode::Http { base_url, client } => Self::call_http(base_url, client, "resources/read", params).await,
            Mode::Ws { stream, .. } => Self::call_ws(stream, "resources/read", params).await,
        }
    }

    async fn list_tools(&self) -> Result<Vec<String>, TransportError> {
        let result = match &self.mode {
            Mode::Http { base_url, client } => {
                Self::call_http(base_url, client, "tools/list", Value::Null).await?
            }
            Mode::Ws { stream, .. } => Self::call_ws(stream, "tools/list", Value::Null).await?,
        };
        extract_name_list(&result, "tools")
    }

    async fn list_resources(&self) -> Result<Vec<String>, TransportError> {
        let result = match &self.mode {
            Mode::Http { base_url, client } => {
                Self::call_http(base_url, client, "resources/list", Value::Null).await?
            }
            Mode::Ws { stream, .. } => Self::call_ws(stream, "resources/list", Value::Null).await?,
        };
        extract_name_list(&result, "resources")
    }

    fn is_alive(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

fn extract_name_list(result: &Value, field: &str) -> Result<Vec<String>, TransportError> {
    let items = result.get(field).and_then(Value::as_array).ok_or_else(|| TransportError::Protocol {
        message: format!("response missing '{field}' array"),
    })?;
    Ok(items
        .iter()
        .filter_map(|item| {
            item.get("name")
                .or_else(|| item.get("uri"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .collect())
}
