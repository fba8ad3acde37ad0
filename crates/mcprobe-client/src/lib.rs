//! MCP (Model Context Protocol) client for stdio-based tool servers.
//!
//! Spawns the server as a child process and speaks newline-delimited
//! JSON-RPC 2.0 over its stdin/stdout: capability handshake first, then
//! `tools/list` and `tools/call` with responses correlated back to their
//! requests by id. Multiple calls may be in flight on one connection.

pub mod client;
pub mod config;
pub mod error;
pub mod jsonrpc;
pub mod transport;

pub use client::{ConnectionState, McpClient, ServerInfo, ToolContent, ToolInfo, ToolResult};
pub use config::ServerConfig;
pub use error::McpError;
pub use jsonrpc::INVALID_PARAMS;
