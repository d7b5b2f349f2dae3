//! Connection manager: per-server state machines and the alias table.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use krait_config::{McpServerConfig, McpTransport};
use krait_core::error::McpError;
use krait_core::tool::{ToolDefinition, ToolResult};

use crate::alias::tool_alias;
use crate::rpc::{CallResult, RemoteToolDef, ToolsListResult, PROTOCOL_VERSION};
use crate::transport::{HttpFactory, StdioFactory, Transport, TransportFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Disconnected,
    Connecting,
    Connected,
}

struct ConnInner {
    state: ConnState,
    transport: Option<Box<dyn Transport>>,
    /// Discovery cache; survives disconnects so aliases keep resolving
    /// while a reconnect is pending.
    tools: Vec<RemoteToolDef>,
}

/// One remote server. The inner mutex serializes connects, calls, and
/// reconnect-retry pairs; servers never block each other.
pub struct ServerConnection {
    name: String,
    factory: Box<dyn TransportFactory>,
    inner: Mutex<ConnInner>,
}

impl ServerConnection {
    pub fn new(name: impl Into<String>, factory: Box<dyn TransportFactory>) -> Self {
        Self {
            name: name.into(),
            factory,
            inner: Mutex::new(ConnInner {
                state: ConnState::Disconnected,
                transport: None,
                tools: Vec::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.state == ConnState::Connected
    }

    /// Cached tool list from the last successful discovery.
    pub async fn tools(&self) -> Vec<RemoteToolDef> {
        self.inner.lock().await.tools.clone()
    }

    pub async fn connect(&self) -> Result<(), McpError> {
        let mut inner = self.inner.lock().await;
        if inner.state == ConnState::Connected {
            return Ok(());
        }
        self.connect_locked(&mut inner).await
    }

    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        Self::teardown_locked(&mut inner).await;
    }

    /// initialize → notifications/initialized → tools/list.
    async fn connect_locked(&self, inner: &mut ConnInner) -> Result<(), McpError> {
        inner.state = ConnState::Connecting;
        let result = self.handshake(inner).await;
        match result {
            Ok(count) => {
                inner.state = ConnState::Connected;
                info!(server = %self.name, tools = count, "remote tool server connected");
                Ok(())
            }
            Err(e) => {
                Self::teardown_locked(inner).await;
                Err(e)
            }
        }
    }

    async fn handshake(&self, inner: &mut ConnInner) -> Result<usize, McpError> {
        let transport = self.factory.open().await?;

        transport
            .request(
                "initialize",
                Some(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "krait",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                })),
            )
            .await?;
        transport.notify("notifications/initialized", None).await?;

        let listed = transport.request("tools/list", None).await?;
        let tools: ToolsListResult = serde_json::from_value(listed)?;

        inner.tools = tools.tools;
        inner.transport = Some(transport);
        Ok(inner.tools.len())
    }

    async fn teardown_locked(inner: &mut ConnInner) {
        if let Some(transport) = inner.transport.take() {
            transport.close().await;
        }
        inner.state = ConnState::Disconnected;
    }

    /// Invoke `tool` with one reconnect-and-retry on failure. Transport
    /// trouble degrades to an error tool result; it never becomes `Err`.
    pub async fn call(&self, tool: &str, arguments: Value) -> ToolResult {
        let mut inner = self.inner.lock().await;

        if inner.state != ConnState::Connected {
            if let Err(e) = self.connect_locked(&mut inner).await {
                warn!(server = %self.name, error = %e, "connect failed during call");
                return ToolResult::err(format!("server '{}' unavailable: {e}", self.name));
            }
        }

        let first = Self::invoke(&self.name, &inner, tool, arguments.clone()).await;
        let first_err = match first {
            Ok(result) => return result,
            Err(e) => e,
        };

        warn!(server = %self.name, tool, error = %first_err, "tool call failed, reconnecting");
        Self::teardown_locked(&mut inner).await;
        if let Err(e) = self.connect_locked(&mut inner).await {
            return ToolResult::err(format!(
                "server '{}' unavailable after reconnect: {e}",
                self.name
            ));
        }

        match Self::invoke(&self.name, &inner, tool, arguments).await {
            Ok(result) => result,
            Err(e) => {
                warn!(server = %self.name, tool, error = %e, "tool call failed after reconnect");
                ToolResult::err(format!("tool '{tool}' on '{}' failed: {e}", self.name))
            }
        }
    }

    async fn invoke(
        name: &str,
        inner: &ConnInner,
        tool: &str,
        arguments: Value,
    ) -> Result<ToolResult, McpError> {
        let transport = inner
            .transport
            .as_ref()
            .ok_or_else(|| McpError::NotConnected(name.to_string()))?;

        // Servers reject null arguments; models send them for no-param tools.
        let arguments = if arguments.is_null() {
            json!({})
        } else {
            arguments
        };
        let value = transport
            .request(
                "tools/call",
                Some(json!({"name": tool, "arguments": arguments})),
            )
            .await?;
        let result: CallResult = serde_json::from_value(value)?;
        let text = result.text();
        Ok(if result.is_error {
            ToolResult::err(text)
        } else {
            ToolResult::ok(text)
        })
    }
}

/// Owns every configured server connection.
pub struct McpManager {
    servers: Vec<Arc<ServerConnection>>,
}

impl McpManager {
    pub fn new(servers: Vec<ServerConnection>) -> Self {
        Self {
            servers: servers.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn from_config(configs: &[McpServerConfig]) -> Self {
        let servers = configs
            .iter()
            .map(|cfg| {
                let factory: Box<dyn TransportFactory> = match cfg.transport {
                    McpTransport::Http => Box::new(HttpFactory {
                        url: cfg.url.clone().unwrap_or_default(),
                        headers: cfg.headers.clone(),
                    }),
                    McpTransport::Stdio => Box::new(StdioFactory {
                        command: cfg.command.clone().unwrap_or_default(),
                        args: cfg.args.clone(),
                    }),
                };
                ServerConnection::new(cfg.name.clone(), factory)
            })
            .collect();
        Self::new(servers)
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Connect every server. Failures are logged and the server left
    /// disconnected; this never returns an error.
    pub async fn connect_all(&self) {
        for server in &self.servers {
            if let Err(e) = server.connect().await {
                warn!(server = %server.name(), error = %e, "failed to connect tool server");
            }
        }
    }

    /// Aliased tool definitions over all connected servers, de-duplicated.
    pub async fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut definitions = Vec::new();
        for server in &self.servers {
            if !server.is_connected().await {
                continue;
            }
            for tool in server.tools().await {
                let alias = tool_alias(server.name(), &tool.name);
                if !seen.insert(alias.clone()) {
                    warn!(alias = %alias, "duplicate tool alias skipped");
                    continue;
                }
                definitions.push(ToolDefinition {
                    name: alias,
                    description: tool.description.clone().unwrap_or_default(),
                    parameters: tool
                        .input_schema
                        .clone()
                        .unwrap_or_else(|| json!({"type": "object"})),
                });
            }
        }
        definitions
    }

    /// Map an alias back to (server, remote tool name). Rebuilt from the
    /// discovery caches on every call.
    pub async fn resolve(&self, alias: &str) -> Option<(Arc<ServerConnection>, String)> {
        for server in &self.servers {
            for tool in server.tools().await {
                if tool_alias(server.name(), &tool.name) == alias {
                    return Some((Arc::clone(server), tool.name));
                }
            }
        }
        None
    }

    /// Call an aliased tool. Unknown aliases and transport failures both
    /// come back as error tool results.
    pub async fn call(&self, alias: &str, arguments: Value) -> ToolResult {
        match self.resolve(alias).await {
            Some((server, tool)) => {
                debug!(alias, server = %server.name(), tool = %tool, "dispatching remote tool");
                server.call(&tool, arguments).await
            }
            None => ToolResult::err(format!("unknown remote tool '{alias}'")),
        }
    }

    /// Best-effort teardown of every connection.
    pub async fn close(&self) {
        for server in &self.servers {
            server.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockTransport {
        tools: Value,
        calls_to_fail: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn request(&self, method: &str, _params: Option<Value>) -> Result<Value, McpError> {
            match method {
                "initialize" => Ok(json!({"protocolVersion": PROTOCOL_VERSION})),
                "tools/list" => Ok(json!({"tools": self.tools})),
                "tools/call" => {
                    let remaining = self.calls_to_fail.load(Ordering::SeqCst);
                    if remaining > 0 {
                        self.calls_to_fail.fetch_sub(1, Ordering::SeqCst);
                        return Err(McpError::Transport("connection reset".into()));
                    }
                    Ok(json!({
                        "content": [{"type": "text", "text": "echoed"}],
                        "isError": false
                    }))
                }
                other => Err(McpError::Protocol(format!("unexpected method {other}"))),
            }
        }

        async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<(), McpError> {
            Ok(())
        }

        async fn close(&self) {}
    }

    struct MockFactory {
        opens: Arc<AtomicUsize>,
        fail_connect: bool,
        tools: Value,
        calls_to_fail: Arc<AtomicUsize>,
    }

    impl MockFactory {
        fn working(tools: Value) -> (Self, Arc<AtomicUsize>, Arc<AtomicUsize>) {
            let opens = Arc::new(AtomicUsize::new(0));
            let calls_to_fail = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    opens: opens.clone(),
                    fail_connect: false,
                    tools,
                    calls_to_fail: calls_to_fail.clone(),
                },
                opens,
                calls_to_fail,
            )
        }
    }

    #[async_trait]
    impl TransportFactory for MockFactory {
        async fn open(&self) -> Result<Box<dyn Transport>, McpError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.fail_connect {
                return Err(McpError::Transport("connection refused".into()));
            }
            Ok(Box::new(MockTransport {
                tools: self.tools.clone(),
                calls_to_fail: self.calls_to_fail.clone(),
            }))
        }
    }

    fn echo_tools() -> Value {
        json!([{"name": "echo", "description": "Echo back", "inputSchema": {"type": "object"}}])
    }

    #[tokio::test]
    async fn connect_all_tolerates_a_dead_server() {
        let (good, _, _) = MockFactory::working(echo_tools());
        let dead = MockFactory {
            opens: Arc::new(AtomicUsize::new(0)),
            fail_connect: true,
            tools: json!([]),
            calls_to_fail: Arc::new(AtomicUsize::new(0)),
        };
        let manager = McpManager::new(vec![
            ServerConnection::new("good", Box::new(good)),
            ServerConnection::new("dead", Box::new(dead)),
        ]);

        manager.connect_all().await;

        let definitions = manager.tool_definitions().await;
        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions[0].name, "good_echo");
    }

    #[tokio::test]
    async fn colliding_aliases_are_deduped() {
        let tools = json!([
            {"name": "read.file", "inputSchema": {"type": "object"}},
            {"name": "read_file", "inputSchema": {"type": "object"}}
        ]);
        let (factory, _, _) = MockFactory::working(tools);
        let manager = McpManager::new(vec![ServerConnection::new("srv", Box::new(factory))]);
        manager.connect_all().await;

        let definitions = manager.tool_definitions().await;
        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions[0].name, "srv_read_file");
    }

    #[tokio::test]
    async fn call_succeeds_after_one_reconnect() {
        let (factory, opens, calls_to_fail) = MockFactory::working(echo_tools());
        let manager = McpManager::new(vec![ServerConnection::new("srv", Box::new(factory))]);
        manager.connect_all().await;
        assert_eq!(opens.load(Ordering::SeqCst), 1);

        calls_to_fail.store(1, Ordering::SeqCst);
        let result = manager.call("srv_echo", json!({"text": "hi"})).await;
        assert!(result.success);
        assert_eq!(result.output, "echoed");
        assert_eq!(opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn call_degrades_to_error_result_after_second_failure() {
        let (factory, opens, calls_to_fail) = MockFactory::working(echo_tools());
        let manager = McpManager::new(vec![ServerConnection::new("srv", Box::new(factory))]);
        manager.connect_all().await;

        calls_to_fail.store(10, Ordering::SeqCst);
        let result = manager.call("srv_echo", json!({})).await;
        assert!(!result.success);
        assert!(result.output.contains("failed"));
        // Initial connect plus exactly one reconnect.
        assert_eq!(opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dropped_connection_reconnects_on_next_call() {
        let (factory, opens, _) = MockFactory::working(echo_tools());
        let manager = McpManager::new(vec![ServerConnection::new("srv", Box::new(factory))]);
        manager.connect_all().await;
        manager.close().await;

        let result = manager.call("srv_echo", json!({})).await;
        assert!(result.success);
        assert_eq!(opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unknown_alias_is_an_error_result() {
        let manager = McpManager::new(vec![]);
        let result = manager.call("nope", json!({})).await;
        assert!(!result.success);
        assert!(result.output.contains("unknown remote tool"));
    }

    #[tokio::test]
    async fn null_arguments_become_an_empty_object() {
        let (factory, _, _) = MockFactory::working(echo_tools());
        let manager = McpManager::new(vec![ServerConnection::new("srv", Box::new(factory))]);
        manager.connect_all().await;
        let result = manager.call("srv_echo", Value::Null).await;
        assert!(result.success);
    }
}
