//! Launch configuration for MCP server processes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

fn default_timeout() -> u64 {
    30000
}

/// How to launch and talk to one MCP server.
///
/// Tool calls can legitimately run for tens of seconds (network fetches on
/// the server side), so the request timeout defaults generously to 30s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Command to run (e.g., "node", "npx").
    pub command: String,
    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables to set for the server process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Timeout for requests in milliseconds (default: 30000).
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
}

impl ServerConfig {
    /// Config for `command` with the given arguments and default timeout.
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: HashMap::new(),
            timeout_ms: default_timeout(),
        }
    }

    /// Override the request timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Add an environment variable for the server process.
    pub fn with_env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal() {
        let toml_str = r#"
command = "node"
args = ["bin/cli.mjs", "server"]
"#;
        let config: ServerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.command, "node");
        assert_eq!(config.args, vec!["bin/cli.mjs", "server"]);
        assert_eq!(config.timeout_ms, 30000); // default
        assert!(config.env.is_empty());
    }

    #[test]
    fn parse_with_timeout_and_env() {
        let toml_str = r#"
command = "node"
args = ["bin/cli.mjs"]
timeout_ms = 60000
env = { DEBUG = "1" }
"#;
        let config: ServerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.timeout_ms, 60000);
        assert_eq!(config.env["DEBUG"], "1");
    }

    #[test]
    fn builder_defaults() {
        let config = ServerConfig::new("node", vec!["entry.mjs".to_string()])
            .with_env_var("LOG_LEVEL", "debug");
        assert_eq!(config.timeout_ms, 30000);
        assert_eq!(config.env["LOG_LEVEL"], "debug");
    }
}
