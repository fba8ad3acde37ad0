//! MCP client — manages one server connection.
//!
//! Handles the MCP handshake (initialize + initialized notification), tool
//! discovery (tools/list), and tool invocation (tools/call). Outgoing
//! requests get a fresh correlation id and a slot in the pending table; a
//! router task matches inbound responses back to their callers by id, so
//! any number of calls may be in flight at once and responses may arrive
//! out of send order.

use crate::config::ServerConfig;
use crate::error::McpError;
use crate::jsonrpc::{JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::transport::{StdioTransport, TransportWriter};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

/// MCP protocol version we support.
const PROTOCOL_VERSION: &str = "2024-11-05";

/// Client name advertised during the handshake.
const CLIENT_NAME: &str = "mcprobe";

/// Information about a tool exposed by an MCP server.
#[derive(Debug, Clone)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Result of calling a tool on an MCP server.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub content: Vec<ToolContent>,
    pub is_error: bool,
}

impl ToolResult {
    /// The text of the first content item, if it is textual.
    pub fn first_text(&self) -> Option<&str> {
        match self.content.first() {
            Some(ToolContent::Text { text }) => Some(text),
            _ => None,
        }
    }
}

/// A content item in a tool result.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ToolContent {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
}

/// Identity reported by the server during the handshake.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Observable connection state.
///
/// The handshaking phase happens inside `connect()` while the client lock is
/// held, so externally a connection is disconnected, ready, or closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Ready,
    Closed,
}

/// Deserialization helpers for MCP protocol messages.
#[derive(Deserialize)]
struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    protocol_version: String,
    #[serde(rename = "serverInfo")]
    server_info: ServerInfo,
}

#[derive(Deserialize)]
struct ToolsListResult {
    tools: Vec<ToolEntry>,
}

#[derive(Deserialize)]
struct ToolEntry {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default = "default_schema", rename = "inputSchema")]
    input_schema: serde_json::Value,
}

fn default_schema() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

#[derive(Deserialize)]
struct ToolCallResult {
    content: Vec<ToolContent>,
    #[serde(default, rename = "isError")]
    is_error: bool,
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<serde_json::Value, JsonRpcError>>>>>;

/// Everything a suspended caller needs to issue a request without holding
/// the client state lock: write handle, pending table, id counter.
#[derive(Clone)]
struct RequestHandle {
    writer: TransportWriter,
    pending: PendingMap,
    next_id: Arc<AtomicU64>,
    alive: Arc<AtomicBool>,
    timeout_ms: u64,
}

impl RequestHandle {
    /// Send a request and suspend until its correlated response arrives,
    /// the connection dies, or the timeout fires.
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);

        let (tx, rx) = oneshot::channel();
        {
            // The alive check shares the pending lock with the router's
            // shutdown path, so an entry can never be registered after the
            // final drain — it either lands in the map and gets drained, or
            // fails fast here.
            let mut pending = self.pending.lock().await;
            if !self.alive.load(Ordering::SeqCst) {
                return Err(McpError::ConnectionClosed);
            }
            pending.insert(id, tx);
        }

        if let Err(e) = self.writer.write(&request).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(Duration::from_millis(self.timeout_ms), rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(err))) => Err(McpError::Rpc {
                code: err.code,
                message: err.message,
                data: err.data,
            }),
            // Sender dropped: the connection was torn down under us.
            Ok(Err(_)) => Err(McpError::ConnectionClosed),
            Err(_) => {
                // Clean up the pending entry on timeout
                self.pending.lock().await.remove(&id);
                Err(McpError::Timeout {
                    method: method.to_string(),
                    timeout_ms: self.timeout_ms,
                })
            }
        }
    }

    /// Send a notification (fire-and-forget, no response expected).
    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let notification = JsonRpcNotification::new(method, params);
        self.writer.write(&notification).await
    }
}

/// One live connection: the transport, the correlation machinery, and what
/// the handshake told us about the server.
struct Connection {
    transport: StdioTransport,
    handle: RequestHandle,
    router: JoinHandle<()>,
    server_info: ServerInfo,
    protocol_version: String,
}

impl Connection {
    /// Resolve every pending request with a closed error and shut the
    /// transport down. Used by `close()` and by failed handshakes, so the
    /// server process never outlives the client on any exit path.
    async fn teardown(mut self) {
        {
            let mut pending = self.handle.pending.lock().await;
            self.handle.alive.store(false, Ordering::SeqCst);
            // Dropping the senders rejects the suspended callers.
            pending.clear();
        }
        self.transport.close().await;
        self.router.abort();
    }
}

enum State {
    Disconnected,
    Ready(Connection),
    Closed,
}

/// Client for a single MCP server connection.
///
/// At most one connection is live at a time; `connect()` while connected
/// fails fast with [`McpError::AlreadyConnected`], and after `close()` the
/// client can connect again.
pub struct McpClient {
    capabilities: serde_json::Value,
    state: Mutex<State>,
}

impl Default for McpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl McpClient {
    /// Create a disconnected client.
    ///
    /// The capability descriptor is fixed here: prompt retrieval, resource
    /// access, and tool listing + invocation.
    pub fn new() -> Self {
        Self {
            capabilities: serde_json::json!({
                "prompts": {},
                "resources": {},
                "tools": {
                    "list": {},
                    "call": {}
                }
            }),
            state: Mutex::new(State::Disconnected),
        }
    }

    /// Spawn the server and perform the MCP handshake.
    ///
    /// On success the connection is ready for `list_tools`/`call_tool`. A
    /// rejected or malformed handshake tears the connection down again; no
    /// partially-initialized state is left behind.
    pub async fn connect(&self, config: &ServerConfig) -> Result<ServerInfo, McpError> {
        let mut state = self.state.lock().await;
        if matches!(*state, State::Ready(_)) {
            return Err(McpError::AlreadyConnected);
        }

        let mut transport = StdioTransport::spawn(&config.command, &config.args, &config.env)?;
        let messages = transport
            .take_messages()
            .ok_or_else(|| McpError::Protocol("transport messages already taken".to_string()))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let router = tokio::spawn(route_messages(
            messages,
            Arc::clone(&pending),
            Arc::clone(&alive),
        ));

        let handle = RequestHandle {
            writer: transport.writer()?,
            pending,
            next_id: Arc::new(AtomicU64::new(1)),
            alive,
            timeout_ms: config.timeout_ms,
        };

        let conn = Connection {
            transport,
            handle,
            router,
            server_info: ServerInfo {
                name: String::new(),
                version: String::new(),
            },
            protocol_version: String::new(),
        };

        match handshake(&conn.handle, &self.capabilities).await {
            Ok(init) => {
                tracing::info!(
                    server = %init.server_info.name,
                    version = %init.server_info.version,
                    protocol = %init.protocol_version,
                    "MCP server initialized"
                );
                let server_info = init.server_info.clone();
                *state = State::Ready(Connection {
                    server_info: init.server_info,
                    protocol_version: init.protocol_version,
                    ..conn
                });
                Ok(server_info)
            }
            Err(e) => {
                conn.teardown().await;
                *state = State::Closed;
                Err(e)
            }
        }
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        let state = self.state.lock().await;
        match &*state {
            State::Disconnected => ConnectionState::Disconnected,
            // An unexpected server exit closes the connection even though
            // close() was never called.
            State::Ready(conn) if !conn.handle.alive.load(Ordering::SeqCst) => {
                ConnectionState::Closed
            }
            State::Ready(_) => ConnectionState::Ready,
            State::Closed => ConnectionState::Closed,
        }
    }

    /// Identity the server reported during the handshake.
    pub async fn server_info(&self) -> Option<ServerInfo> {
        let state = self.state.lock().await;
        match &*state {
            State::Ready(conn) => Some(conn.server_info.clone()),
            _ => None,
        }
    }

    /// Protocol version negotiated during the handshake.
    pub async fn protocol_version(&self) -> Option<String> {
        let state = self.state.lock().await;
        match &*state {
            State::Ready(conn) => Some(conn.protocol_version.clone()),
            _ => None,
        }
    }

    /// Grab a request handle if the connection is ready. The state lock is
    /// released before the caller suspends, so requests interleave freely.
    async fn request_handle(&self) -> Result<RequestHandle, McpError> {
        let state = self.state.lock().await;
        match &*state {
            State::Ready(conn) => Ok(conn.handle.clone()),
            _ => Err(McpError::NotConnected),
        }
    }

    /// List the tools the server currently exposes.
    ///
    /// Queries the server live on every call; no snapshot is cached.
    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>, McpError> {
        let handle = self.request_handle().await?;
        let result = handle.request("tools/list", None).await?;

        let list: ToolsListResult = serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("Failed to parse tools/list response: {e}")))?;

        let tools: Vec<ToolInfo> = list
            .tools
            .into_iter()
            .map(|t| ToolInfo {
                name: t.name,
                description: t.description.unwrap_or_default(),
                input_schema: t.input_schema,
            })
            .collect();

        tracing::debug!(tool_count = tools.len(), "listed MCP tools");
        Ok(tools)
    }

    /// Call a tool on the server.
    ///
    /// Server-side rejections come back as [`McpError::Rpc`], never as an
    /// `Ok` result the caller has to inspect. The reserved invalid-params
    /// code covers unknown tools, schema failures, and policy rejections
    /// alike; only the message distinguishes them.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, McpError> {
        let handle = self.request_handle().await?;

        let params = serde_json::json!({
            "name": tool_name,
            "arguments": arguments,
        });

        let result = handle.request("tools/call", Some(params)).await?;

        let call_result: ToolCallResult = serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("Failed to parse tools/call result: {e}")))?;

        tracing::debug!(tool = %tool_name, is_error = call_result.is_error, "tool call completed");

        Ok(ToolResult {
            content: call_result.content,
            is_error: call_result.is_error,
        })
    }

    /// Probe a tool's descriptive prompt text by calling it with empty
    /// arguments.
    pub async fn get_prompt(&self, tool_name: &str) -> Result<ToolResult, McpError> {
        self.call_tool(tool_name, serde_json::json!({})).await
    }

    /// Tear down the connection.
    ///
    /// Every outstanding request is rejected with
    /// [`McpError::ConnectionClosed`], the server is given a grace period to
    /// exit, then killed. Closing an already-closed or never-connected
    /// client is a no-op.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        let prev = std::mem::replace(&mut *state, State::Closed);
        if let State::Ready(conn) = prev {
            tracing::info!(server = %conn.server_info.name, "closing MCP connection");
            conn.teardown().await;
        }
    }
}

/// Perform the initialize exchange and send the initialized notification.
async fn handshake(
    handle: &RequestHandle,
    capabilities: &serde_json::Value,
) -> Result<InitializeResult, McpError> {
    let params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": capabilities,
        "clientInfo": {
            "name": CLIENT_NAME,
            "version": env!("CARGO_PKG_VERSION")
        }
    });

    let result = handle
        .request("initialize", Some(params))
        .await
        .map_err(|e| match e {
            McpError::Rpc { code, message, .. } => {
                McpError::HandshakeFailed(format!("server rejected initialize (code {code}): {message}"))
            }
            McpError::ConnectionClosed => {
                McpError::HandshakeFailed("server closed the connection during initialize".to_string())
            }
            other => other,
        })?;

    let init: InitializeResult = serde_json::from_value(result).map_err(|e| {
        McpError::HandshakeFailed(format!("malformed initialize response: {e}"))
    })?;

    handle.notify("notifications/initialized", None).await?;

    Ok(init)
}

/// Router task: delivers inbound messages to their pending callers in
/// arrival order. When the channel ends (server exit or transport close),
/// the remaining pending requests are rejected rather than left hanging.
async fn route_messages(
    mut messages: mpsc::Receiver<JsonRpcResponse>,
    pending: PendingMap,
    alive: Arc<AtomicBool>,
) {
    while let Some(resp) = messages.recv().await {
        let Some(id) = resp.id else {
            // Server-initiated notification; nothing correlates to it.
            continue;
        };
        let tx = pending.lock().await.remove(&id);
        match tx {
            Some(tx) => {
                let outcome = match (resp.result, resp.error) {
                    (_, Some(err)) => Err(err),
                    (Some(result), None) => Ok(result),
                    (None, None) => Ok(serde_json::Value::Null),
                };
                let _ = tx.send(outcome);
            }
            None => {
                tracing::warn!(id, "discarding response with no matching request");
            }
        }
    }

    // Flip alive and drain under one lock so no request can register
    // between the two.
    let mut pending = pending.lock().await;
    alive.store(false, Ordering::SeqCst);
    pending.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn operations_fail_fast_when_disconnected() {
        let client = McpClient::new();
        assert_eq!(client.state().await, ConnectionState::Disconnected);

        assert!(matches!(
            client.list_tools().await,
            Err(McpError::NotConnected)
        ));
        assert!(matches!(
            client.call_tool("deepwiki_fetch", serde_json::json!({})).await,
            Err(McpError::NotConnected)
        ));
        assert!(matches!(
            client.get_prompt("deepwiki_fetch").await,
            Err(McpError::NotConnected)
        ));
        assert!(client.server_info().await.is_none());
    }

    #[tokio::test]
    async fn close_without_connect_is_noop() {
        let client = McpClient::new();
        client.close().await;
        client.close().await;
        assert_eq!(client.state().await, ConnectionState::Closed);
        assert!(matches!(
            client.list_tools().await,
            Err(McpError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn connect_nonexistent_command_fails() {
        let client = McpClient::new();
        let config = ServerConfig::new("nonexistent_mcp_server_xyz123", vec![]);
        let result = client.connect(&config).await;
        assert!(matches!(result, Err(McpError::SpawnFailed { .. })));
    }

    #[tokio::test]
    async fn connect_to_immediately_exiting_server_fails_handshake() {
        // `true` exits before answering initialize; the handshake must fail
        // rather than hang, and the client must not be left Ready.
        let client = McpClient::new();
        let config = ServerConfig::new("true", vec![]).with_timeout_ms(5000);
        let result = client.connect(&config).await;
        assert!(matches!(result, Err(McpError::HandshakeFailed(_))));
        assert_eq!(client.state().await, ConnectionState::Closed);
        assert!(matches!(
            client.list_tools().await,
            Err(McpError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn connect_to_unresponsive_server_times_out() {
        // `sleep` never answers; a short timeout keeps the test fast.
        let client = McpClient::new();
        let config = ServerConfig::new("sleep", vec!["10".to_string()]).with_timeout_ms(100);
        let result = client.connect(&config).await;
        assert!(matches!(result, Err(McpError::Timeout { .. })));
        assert_eq!(client.state().await, ConnectionState::Closed);
    }

    #[test]
    fn correlation_ids_are_never_reused() {
        let next_id = AtomicU64::new(1);
        assert_eq!(next_id.fetch_add(1, Ordering::Relaxed), 1);
        assert_eq!(next_id.fetch_add(1, Ordering::Relaxed), 2);
        assert_eq!(next_id.fetch_add(1, Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn router_rejects_pending_on_channel_end() {
        let (messages_tx, messages_rx) = mpsc::channel::<JsonRpcResponse>(4);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert(1, tx);

        let router = tokio::spawn(route_messages(
            messages_rx,
            Arc::clone(&pending),
            Arc::clone(&alive),
        ));

        // Simulate server exit: the transport drops its sender.
        drop(messages_tx);
        router.await.unwrap();

        assert!(!alive.load(Ordering::SeqCst));
        assert!(pending.lock().await.is_empty());
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn router_correlates_out_of_order_responses() {
        let (messages_tx, messages_rx) = mpsc::channel::<JsonRpcResponse>(4);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        pending.lock().await.insert(1, tx1);
        pending.lock().await.insert(2, tx2);

        let router = tokio::spawn(route_messages(
            messages_rx,
            Arc::clone(&pending),
            alive,
        ));

        // Answer id 2 before id 1.
        let resp2: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":2,"result":{"which":2}}"#).unwrap();
        let resp1: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":{"which":1}}"#).unwrap();
        messages_tx.send(resp2).await.unwrap();
        messages_tx.send(resp1).await.unwrap();

        assert_eq!(rx2.await.unwrap().unwrap()["which"], 2);
        assert_eq!(rx1.await.unwrap().unwrap()["which"], 1);

        drop(messages_tx);
        router.await.unwrap();
    }

    #[tokio::test]
    async fn router_discards_unmatched_ids() {
        let (messages_tx, messages_rx) = mpsc::channel::<JsonRpcResponse>(4);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let router = tokio::spawn(route_messages(
            messages_rx,
            Arc::clone(&pending),
            alive,
        ));

        // Nothing pending for id 99; the router must not fall over.
        let stray: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":99,"result":{}}"#).unwrap();
        messages_tx.send(stray).await.unwrap();

        drop(messages_tx);
        router.await.unwrap();
        assert!(pending.lock().await.is_empty());
    }

    #[test]
    fn first_text_extracts_leading_text_item() {
        let result = ToolResult {
            content: vec![ToolContent::Text {
                text: "# navigation-components".to_string(),
            }],
            is_error: false,
        };
        assert_eq!(result.first_text(), Some("# navigation-components"));

        let empty = ToolResult {
            content: vec![],
            is_error: false,
        };
        assert_eq!(empty.first_text(), None);
    }

    #[test]
    fn capabilities_advertise_all_three_feature_groups() {
        let client = McpClient::new();
        assert!(client.capabilities["prompts"].is_object());
        assert!(client.capabilities["resources"].is_object());
        assert!(client.capabilities["tools"]["list"].is_object());
        assert!(client.capabilities["tools"]["call"].is_object());
    }
}
