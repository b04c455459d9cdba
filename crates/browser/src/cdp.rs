//! Low-level Chrome DevTools Protocol (CDP) client over WebSocket.
//!
//! One client per WebSocket endpoint (browser-level or page-level). A reader
//! task routes command responses back to their callers by id; when the socket
//! closes, the client flips to dead and every pending and future command fails
//! with [`CdpError::Disconnected`].

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CdpError {
    #[error("CDP connection lost: {0}")]
    Disconnected(String),

    #[error("CDP protocol error: {0}")]
    Protocol(String),

    #[error("CDP command '{0}' timed out")]
    Timeout(String),

    #[error("CDP endpoint discovery failed: {0}")]
    Discovery(String),
}

impl CdpError {
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected(_) | Self::Discovery(_))
    }
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

pub struct CdpClient {
    ws_url: String,
    ws_tx: mpsc::Sender<String>,
    pending: Pending,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    command_timeout: Duration,
    _reader_handle: tokio::task::JoinHandle<()>,
    _writer_handle: tokio::task::JoinHandle<()>,
}

impl CdpClient {
    /// Connect to a CDP WebSocket endpoint.
    pub async fn connect(ws_url: &str, command_timeout: Duration) -> Result<Self, CdpError> {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::connect_async;
        use tokio_tungstenite::tungstenite::Message;

        let (ws_stream, _) = connect_async(ws_url).await.map_err(|e| {
            CdpError::Disconnected(format!("failed to connect to {}: {}", ws_url, e))
        })?;

        let (mut ws_sink, mut ws_stream_read) = ws_stream.split();
        let (ws_tx, mut ws_rx) = mpsc::channel::<String>(256);

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let pending_clone = pending.clone();

        let alive = Arc::new(AtomicBool::new(true));
        let alive_writer = alive.clone();
        let alive_reader = alive.clone();

        // Writer task: owns the sink, forwards messages from channel
        let writer_handle = tokio::spawn(async move {
            while let Some(msg) = ws_rx.recv().await {
                if let Err(e) = ws_sink.send(Message::Text(msg)).await {
                    error!("CDP WebSocket write error: {}", e);
                    alive_writer.store(false, Ordering::SeqCst);
                    break;
                }
            }
        });

        // Reader task: routes responses; events are not consumed by this daemon
        let reader_handle = tokio::spawn(async move {
            while let Some(msg_result) = ws_stream_read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        let Ok(val) = serde_json::from_str::<Value>(&text) else {
                            continue;
                        };
                        if let Some(id) = val.get("id").and_then(|v| v.as_u64()) {
                            let mut pending = pending_clone.lock().await;
                            if let Some(tx) = pending.remove(&id) {
                                let _ = tx.send(val);
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("CDP WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        warn!("CDP WebSocket read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            alive_reader.store(false, Ordering::SeqCst);
            // Dropping the senders wakes every waiter with a closed channel.
            pending_clone.lock().await.clear();
        });

        Ok(Self {
            ws_url: ws_url.to_string(),
            ws_tx,
            pending,
            next_id: AtomicU64::new(1),
            alive,
            command_timeout,
            _reader_handle: reader_handle,
            _writer_handle: writer_handle,
        })
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Send a CDP command and wait for the response.
    pub async fn send_command(&self, method: &str, params: Value) -> Result<Value, CdpError> {
        self.send_command_with_timeout(method, params, self.command_timeout)
            .await
    }

    pub async fn send_command_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, CdpError> {
        if !self.is_alive() {
            return Err(CdpError::Disconnected(format!(
                "connection to {} is closed",
                self.ws_url
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let msg = json!({
            "id": id,
            "method": method,
            "params": params,
        });

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(id, tx);
        }

        if self.ws_tx.send(msg.to_string()).await.is_err() {
            self.pending.lock().await.remove(&id);
            self.alive.store(false, Ordering::SeqCst);
            return Err(CdpError::Disconnected("writer task stopped".to_string()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => {
                if let Some(error) = response.get("error") {
                    Err(CdpError::Protocol(error.to_string()))
                } else {
                    Ok(response.get("result").cloned().unwrap_or(Value::Null))
                }
            }
            Ok(Err(_)) => Err(CdpError::Disconnected(format!(
                "connection dropped while waiting for '{}'",
                method
            ))),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(CdpError::Timeout(method.to_string()))
            }
        }
    }

    /// Enable a CDP domain (e.g., "Page", "Runtime").
    pub async fn enable_domain(&self, domain: &str) -> Result<(), CdpError> {
        self.send_command(&format!("{}.enable", domain), json!({}))
            .await?;
        Ok(())
    }

    pub async fn navigate(&self, url: &str) -> Result<Value, CdpError> {
        self.send_command("Page.navigate", json!({"url": url})).await
    }

    /// Evaluate JavaScript in the page and return the raw `Runtime.evaluate`
    /// result.
    pub async fn evaluate_js(&self, expression: &str) -> Result<Value, CdpError> {
        self.send_command(
            "Runtime.evaluate",
            json!({
                "expression": expression,
                "returnByValue": true,
                "awaitPromise": true,
            }),
        )
        .await
    }

    /// Evaluate JavaScript and unwrap `result.value`. Script exceptions become
    /// [`CdpError::Protocol`].
    pub async fn evaluate_value(&self, expression: &str) -> Result<Value, CdpError> {
        let result = self.evaluate_js(expression).await?;
        if let Some(details) = result.get("exceptionDetails") {
            let text = details
                .get("exception")
                .and_then(|e| e.get("description"))
                .and_then(|d| d.as_str())
                .or_else(|| details.get("text").and_then(|t| t.as_str()))
                .unwrap_or("script exception");
            return Err(CdpError::Protocol(text.to_string()));
        }
        Ok(result
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Dispatch a key event via Input domain.
    pub async fn dispatch_key_event(
        &self,
        event_type: &str,
        key: &str,
        code: &str,
        text: Option<&str>,
    ) -> Result<(), CdpError> {
        let mut params = json!({
            "type": event_type,
            "key": key,
            "code": code,
        });
        if let Some(text) = text {
            params["text"] = json!(text);
        }
        self.send_command("Input.dispatchKeyEvent", params).await?;
        Ok(())
    }

    /// Insert text at the focused element, bypassing key events.
    pub async fn insert_text(&self, text: &str) -> Result<(), CdpError> {
        self.send_command("Input.insertText", json!({"text": text}))
            .await?;
        Ok(())
    }

    // ─── Tab / Target management ──────────────────────────────────────

    /// Get all browser targets (pages, iframes, workers, etc.).
    pub async fn get_targets(&self) -> Result<Vec<Value>, CdpError> {
        let result = self.send_command("Target.getTargets", json!({})).await?;
        Ok(result
            .get("targetInfos")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default())
    }

    /// Create a new page target (tab) with the given URL.
    pub async fn create_target(&self, url: &str) -> Result<String, CdpError> {
        let result = self
            .send_command("Target.createTarget", json!({"url": url}))
            .await?;
        result
            .get("targetId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| CdpError::Protocol("no targetId returned from createTarget".to_string()))
    }

    pub async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self._reader_handle.abort();
        self._writer_handle.abort();
    }
}

impl Drop for CdpClient {
    fn drop(&mut self) {
        self._reader_handle.abort();
        self._writer_handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    /// Echo-style fake CDP endpoint: answers every command with
    /// `{"id", "result": {"method": ...}}`, and closes the socket when it sees
    /// the `Test.hangUp` method.
    async fn spawn_fake_endpoint() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                let req: Value = serde_json::from_str(&text).unwrap();
                let method = req["method"].as_str().unwrap_or_default().to_string();
                if method == "Test.hangUp" {
                    let _ = ws.close(None).await;
                    break;
                }
                let reply = if method == "Test.fail" {
                    json!({"id": req["id"], "error": {"code": -32000, "message": "boom"}})
                } else {
                    json!({"id": req["id"], "result": {"method": method}})
                };
                ws.send(Message::Text(reply.to_string())).await.unwrap();
            }
        });
        format!("ws://{}", addr)
    }

    #[tokio::test]
    async fn test_command_roundtrip() {
        let url = spawn_fake_endpoint().await;
        let client = CdpClient::connect(&url, Duration::from_secs(5)).await.unwrap();
        assert!(client.is_alive());
        let result = client.send_command("Browser.getVersion", json!({})).await.unwrap();
        assert_eq!(result["method"], "Browser.getVersion");
    }

    #[tokio::test]
    async fn test_protocol_error_is_not_disconnect() {
        let url = spawn_fake_endpoint().await;
        let client = CdpClient::connect(&url, Duration::from_secs(5)).await.unwrap();
        let err = client.send_command("Test.fail", json!({})).await.unwrap_err();
        assert!(matches!(err, CdpError::Protocol(_)));
        assert!(!err.is_disconnect());
        assert!(client.is_alive());
    }

    #[tokio::test]
    async fn test_hang_up_marks_client_dead() {
        let url = spawn_fake_endpoint().await;
        let client = CdpClient::connect(&url, Duration::from_secs(5)).await.unwrap();
        let err = client.send_command("Test.hangUp", json!({})).await.unwrap_err();
        assert!(err.is_disconnect(), "unexpected error: {:?}", err);

        // The reader task flips the flag once the close frame is processed.
        for _ in 0..50 {
            if !client.is_alive() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!client.is_alive());
        let err = client.send_command("Browser.getVersion", json!({})).await.unwrap_err();
        assert!(matches!(err, CdpError::Disconnected(_)));
    }

    #[tokio::test]
    async fn test_connect_refused_is_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = CdpClient::connect(&format!("ws://{}", addr), Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(err.is_disconnect());
    }
}
