//! Test harness for driving an MCP server through [`mcprobe_client`].
//!
//! Wraps [`McpClient`] the way an integration test wants to use it: point it
//! at a server entry point once, then connect with per-test argument lists.
//! Mirrors the argument conventions of the server CLI under test — a
//! `server` subcommand prefix and a `--port 0` default for dynamic port
//! allocation.

use mcprobe_client::{McpClient, McpError, ServerConfig, ServerInfo, ToolInfo, ToolResult};

/// Append `--port 0` (dynamic allocation) when no `--port` flag is present.
///
/// Compatibility shim for non-stdio transports the server may also offer;
/// the stdio transport itself ignores it, but the observable argument list
/// must carry it.
pub fn ensure_port_arg(mut args: Vec<String>) -> Vec<String> {
    if !args.iter().any(|a| a == "--port") {
        args.push("--port".to_string());
        args.push("0".to_string());
    }
    args
}

/// A test-scoped MCP client bound to one server entry point.
///
/// Call [`close`](Self::close) exactly once per successful connect so server
/// processes never leak across test cases; the transport's kill-on-drop is
/// the backstop when an assertion panics first.
pub struct TestClient {
    command: String,
    base_args: Vec<String>,
    timeout_ms: u64,
    client: McpClient,
}

impl TestClient {
    /// Harness for the server launched by `command` + `base_args`.
    pub fn new(command: impl Into<String>, base_args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            base_args,
            timeout_ms: 30000,
            client: McpClient::new(),
        }
    }

    /// Override the per-request timeout. Tool calls doing real network work
    /// can take tens of seconds, so keep this generous for live servers.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    fn launch_args(&self, extra_args: Vec<String>) -> Vec<String> {
        let mut args = self.base_args.clone();
        args.extend(extra_args);
        ensure_port_arg(args)
    }

    /// Start the server with the given extra arguments and connect.
    pub async fn connect(&self, extra_args: Vec<String>) -> Result<ServerInfo, McpError> {
        let args = self.launch_args(extra_args);
        tracing::info!(command = %self.command, ?args, "starting MCP server");
        let config = ServerConfig::new(&self.command, args).with_timeout_ms(self.timeout_ms);
        self.client.connect(&config).await
    }

    /// Connect with `server` as the first extra argument, the subcommand
    /// the CLI under test uses to start its MCP server.
    pub async fn connect_server(&self, extra_args: Vec<String>) -> Result<ServerInfo, McpError> {
        let mut args = vec!["server".to_string()];
        args.extend(extra_args);
        self.connect(args).await
    }

    /// List all available tools.
    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>, McpError> {
        self.client.list_tools().await
    }

    /// Call a tool by name with the given arguments.
    pub async fn call_tool(
        &self,
        name: &str,
        args: serde_json::Value,
    ) -> Result<ToolResult, McpError> {
        self.client.call_tool(name, args).await
    }

    /// Probe a tool's prompt text by calling it with no arguments.
    pub async fn get_prompt(&self, name: &str) -> Result<ToolResult, McpError> {
        self.client.get_prompt(name).await
    }

    /// Close the connection to the server.
    pub async fn close(&self) {
        self.client.close().await;
    }

    /// The wrapped client, for assertions on connection state.
    pub fn client(&self) -> &McpClient {
        &self.client
    }
}
