use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use super::remote::{DebugSession, DebugSessionProvider, DebugTarget};
use super::DeliveryError;

/// Chrome DevTools Protocol endpoint (`--remote-debugging-port`).
pub struct CdpSessionProvider {
    endpoint: String,
    client: reqwest::Client,
    request_timeout: Duration,
}

impl CdpSessionProvider {
    pub fn new(endpoint: impl Into<String>, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client,
            request_timeout,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn list_url(&self) -> String {
        format!("{}/json/list", self.endpoint)
    }
}

#[async_trait]
impl DebugSessionProvider for CdpSessionProvider {
    async fn list_targets(&self) -> Result<Vec<DebugTarget>, DeliveryError> {
        let url = self.list_url();
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| DeliveryError::SessionUnavailable(format!("{url}: {e}")))?;
        if !response.status().is_success() {
            return Err(DeliveryError::SessionUnavailable(format!(
                "{url} returned {}",
                response.status()
            )));
        }
        response
            .json::<Vec<DebugTarget>>()
            .await
            .map_err(|e| DeliveryError::SessionUnavailable(format!("invalid target list: {e}")))
    }

    async fn open(&self, target: &DebugTarget) -> Result<Box<dyn DebugSession>, DeliveryError> {
        let ws_url = target.websocket_url.as_deref().ok_or_else(|| {
            DeliveryError::SessionUnavailable(format!(
                "target '{}' is already attached to another client",
                target.title
            ))
        })?;

        let (stream, _) = tokio::time::timeout(
            self.request_timeout,
            tokio_tungstenite::connect_async(ws_url),
        )
        .await
        .map_err(|_| DeliveryError::Timeout(self.request_timeout))?
        .map_err(|e| DeliveryError::SessionUnavailable(format!("{ws_url}: {e}")))?;

        debug!("Opened CDP session to {}", target.id);
        Ok(Box::new(CdpSession {
            stream,
            next_id: 1,
            timeout: self.request_timeout,
        }))
    }
}

struct CdpSession {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_id: u64,
    timeout: Duration,
}

impl CdpSession {
    async fn call(&mut self, method: &str, params: Value) -> Result<Value, DeliveryError> {
        let id = self.next_id;
        self.next_id += 1;
        let request = json!({ "id": id, "method": method, "params": params });

        self.stream
            .send(WsMessage::Text(request.to_string()))
            .await
            .map_err(|e| DeliveryError::SessionUnavailable(e.to_string()))?;

        loop {
            let frame = self
                .stream
                .next()
                .await
                .ok_or_else(|| DeliveryError::SessionUnavailable("connection closed".into()))?
                .map_err(|e| DeliveryError::SessionUnavailable(e.to_string()))?;

            let WsMessage::Text(text) = frame else {
                continue;
            };
            let Ok(reply) = serde_json::from_str::<Value>(&text) else {
                continue;
            };
            // Events carry no id; replies to other calls are skipped.
            if reply.get("id").and_then(Value::as_u64) != Some(id) {
                continue;
            }
            if let Some(error) = reply.get("error") {
                return Err(DeliveryError::Script(format!("{method}: {error}")));
            }
            return Ok(reply.get("result").cloned().unwrap_or(Value::Null));
        }
    }
}

/// Extract the value of a `Runtime.evaluate` result, or its exception text.
fn evaluation_value(result: Value) -> Result<Value, DeliveryError> {
    if let Some(details) = result.get("exceptionDetails") {
        let text = details
            .pointer("/exception/description")
            .or_else(|| details.get("text"))
            .and_then(Value::as_str)
            .unwrap_or("uncaught exception");
        return Err(DeliveryError::Script(text.to_string()));
    }
    Ok(result
        .pointer("/result/value")
        .cloned()
        .unwrap_or(Value::Null))
}

#[async_trait]
impl DebugSession for CdpSession {
    async fn evaluate(&mut self, expression: &str) -> Result<Value, DeliveryError> {
        let params = json!({
            "expression": expression,
            "returnByValue": true,
            "awaitPromise": true,
            "userGesture": true,
        });
        let timeout = self.timeout;
        let result = tokio::time::timeout(timeout, self.call("Runtime.evaluate", params))
            .await
            .map_err(|_| DeliveryError::Timeout(timeout))??;
        evaluation_value(result)
    }

    async fn close(&mut self) -> Result<(), DeliveryError> {
        self.stream
            .close(None)
            .await
            .map_err(|e| DeliveryError::SessionUnavailable(e.to_string()))
    }
}
