//! Transports carrying JSON-RPC to a remote tool server.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::debug;

use krait_core::error::McpError;

use crate::rpc::{
    extract_sse_events, find_rpc_response, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One bidirectional JSON-RPC channel.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError>;
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError>;
    async fn close(&self);
}

/// Opens fresh transports; a reconnect always goes through the factory
/// so stdio servers get a new child process.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(&self) -> Result<Box<dyn Transport>, McpError>;
}

// --- streamable HTTP ---

/// JSON-RPC over POSTs to one endpoint. Responses may arrive as plain
/// JSON or as an SSE body; the server's `Mcp-Session-Id` header is
/// echoed back on every subsequent request.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    headers: HashMap<String, String>,
    session_id: RwLock<Option<String>>,
    next_id: AtomicU64,
}

impl HttpTransport {
    pub fn new(endpoint: &str, headers: HashMap<String, String>) -> Result<Self, McpError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| McpError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            headers,
            session_id: RwLock::new(None),
            next_id: AtomicU64::new(1),
        })
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.read().ok().and_then(|sid| sid.clone())
    }

    fn capture_session_id(&self, response: &reqwest::Response) {
        if let Some(sid) = response
            .headers()
            .get("Mcp-Session-Id")
            .and_then(|v| v.to_str().ok())
        {
            if let Ok(mut slot) = self.session_id.write() {
                *slot = Some(sid.to_string());
            }
        }
    }

    fn post(&self, body: &impl serde::Serialize) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(&self.endpoint)
            .header("Accept", "application/json, text/event-stream")
            .json(body);
        if let Some(sid) = self.session_id() {
            builder = builder.header("Mcp-Session-Id", sid);
        }
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }
        builder
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method: method.to_string(),
            params,
            id,
        };

        let response = self
            .post(&request)
            .send()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        self.capture_session_id(&response);

        let status = response.status();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response
            .text()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(McpError::Transport(format!(
                "HTTP {}: {body}",
                status.as_u16()
            )));
        }

        let json_str = if content_type.contains("text/event-stream") {
            let events = extract_sse_events(&body)?;
            find_rpc_response(&events, id)?
        } else {
            body
        };

        let rpc_response: JsonRpcResponse = serde_json::from_str(&json_str)?;
        rpc_response.into_result()
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let notification = JsonRpcNotification {
            jsonrpc: "2.0",
            method: method.to_string(),
            params,
        };
        let response = self
            .post(&notification)
            .send()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        self.capture_session_id(&response);

        let status = response.status();
        if !status.is_success() {
            return Err(McpError::Transport(format!(
                "notification HTTP {}",
                status.as_u16()
            )));
        }
        Ok(())
    }

    async fn close(&self) {
        if let Ok(mut slot) = self.session_id.write() {
            *slot = None;
        }
    }
}

pub struct HttpFactory {
    pub url: String,
    pub headers: HashMap<String, String>,
}

#[async_trait]
impl TransportFactory for HttpFactory {
    async fn open(&self) -> Result<Box<dyn Transport>, McpError> {
        Ok(Box::new(HttpTransport::new(&self.url, self.headers.clone())?))
    }
}

// --- stdio ---

struct StdioInner {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
}

/// Line-delimited JSON-RPC over a child process's stdio.
pub struct StdioTransport {
    inner: Mutex<StdioInner>,
    next_id: AtomicU64,
}

impl StdioTransport {
    pub async fn spawn(command: &str, args: &[String]) -> Result<Self, McpError> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| McpError::Transport(format!("failed to spawn '{command}': {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Transport("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Transport("child stdout unavailable".into()))?;

        Ok(Self {
            inner: Mutex::new(StdioInner {
                child,
                stdin,
                reader: BufReader::new(stdout),
            }),
            next_id: AtomicU64::new(1),
        })
    }

    async fn write_line(inner: &mut StdioInner, line: &str) -> Result<(), McpError> {
        inner
            .stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| McpError::Transport(format!("write failed: {e}")))?;
        inner
            .stdin
            .write_all(b"\n")
            .await
            .map_err(|e| McpError::Transport(format!("write failed: {e}")))?;
        inner
            .stdin
            .flush()
            .await
            .map_err(|e| McpError::Transport(format!("flush failed: {e}")))?;
        Ok(())
    }

    /// Read lines until a JSON object carrying `id` shows up; server
    /// notifications in between are skipped.
    async fn read_response(inner: &mut StdioInner, id: u64) -> Result<Value, McpError> {
        loop {
            let mut line = String::new();
            let n = inner
                .reader
                .read_line(&mut line)
                .await
                .map_err(|e| McpError::Transport(format!("read failed: {e}")))?;
            if n == 0 {
                return Err(McpError::Transport("server closed its stdout".into()));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(value) if value.get("id").and_then(Value::as_u64) == Some(id) => {
                    return Ok(value)
                }
                Ok(_) => debug!("skipping unmatched server message"),
                Err(e) => debug!(error = %e, "skipping non-JSON line from server"),
            }
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method: method.to_string(),
            params,
            id,
        };
        let line = serde_json::to_string(&request)?;

        let mut inner = self.inner.lock().await;
        Self::write_line(&mut inner, &line).await?;

        let value = tokio::time::timeout(REQUEST_TIMEOUT, Self::read_response(&mut inner, id))
            .await
            .map_err(|_| McpError::Transport(format!("request '{method}' timed out")))??;

        let rpc_response: JsonRpcResponse = serde_json::from_value(value)?;
        rpc_response.into_result()
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let notification = JsonRpcNotification {
            jsonrpc: "2.0",
            method: method.to_string(),
            params,
        };
        let line = serde_json::to_string(&notification)?;
        let mut inner = self.inner.lock().await;
        Self::write_line(&mut inner, &line).await
    }

    async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if let Err(e) = inner.child.start_kill() {
            debug!(error = %e, "stdio server already gone");
        }
    }
}

pub struct StdioFactory {
    pub command: String,
    pub args: Vec<String>,
}

#[async_trait]
impl TransportFactory for StdioFactory {
    async fn open(&self) -> Result<Box<dyn Transport>, McpError> {
        Ok(Box::new(StdioTransport::spawn(&self.command, &self.args).await?))
    }
}
