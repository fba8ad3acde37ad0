//! Stdio transport for MCP server communication.
//!
//! Spawns the server as a child process and manages async communication over
//! stdin/stdout using newline-delimited JSON-RPC messages. The transport only
//! frames messages; request/response correlation lives in the client layer.

use crate::error::McpError;
use crate::jsonrpc::JsonRpcResponse;
use serde::Serialize;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How long `close()` waits for the server to exit before killing it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Cloneable outbound write handle.
///
/// Lets callers queue frames without borrowing the transport itself. Writes
/// fail with [`McpError::ConnectionClosed`] once the transport is closed.
#[derive(Clone)]
pub struct TransportWriter {
    tx: mpsc::Sender<String>,
}

impl TransportWriter {
    /// Serialize one outbound frame and queue it for writing.
    pub async fn write<T: Serialize>(&self, frame: &T) -> Result<(), McpError> {
        let serialized = serde_json::to_string(frame)?;
        self.tx
            .send(serialized)
            .await
            .map_err(|_| McpError::ConnectionClosed)
    }
}

/// Async stdio transport for a single MCP server process.
///
/// Outbound frames are queued on a channel and written by a background task
/// in send order. Inbound stdout is split into lines, parsed, and delivered
/// through the receiver handed out by [`take_messages`](Self::take_messages);
/// the receiver closing is the signal that the server exited or its stdout
/// otherwise went away.
pub struct StdioTransport {
    write_tx: Option<mpsc::Sender<String>>,
    messages_rx: Option<mpsc::Receiver<JsonRpcResponse>>,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
    child: Option<Child>,
}

impl StdioTransport {
    /// Spawn a server process and start the background reader/writer tasks.
    ///
    /// Returns once the process is spawned and its pipes are captured; the
    /// protocol handshake is the caller's job.
    pub fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self, McpError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: command.to_string(),
            source: e,
        })?;

        let stdin = child.stdin.take().expect("stdin was piped");
        let stdout = child.stdout.take().expect("stdout was piped");

        // Writer task: drains channel and writes newline-delimited frames.
        // Dropping the channel ends the task, which drops stdin and sends
        // EOF to the child.
        let (write_tx, mut write_rx) = mpsc::channel::<String>(64);
        let writer_handle = tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(msg) = write_rx.recv().await {
                if stdin.write_all(msg.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        // Reader task: one complete message per line, in arrival order.
        // Unparseable lines are logged and skipped. EOF drops the sender,
        // closing the message channel.
        let (messages_tx, messages_rx) = mpsc::channel::<JsonRpcResponse>(64);
        let reader_handle = tokio::spawn(async move {
            let reader = BufReader::new(stdout);
            let mut lines = reader.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                let resp: JsonRpcResponse = match serde_json::from_str(&line) {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!("Failed to parse MCP message: {e}: {line}");
                        continue;
                    }
                };
                if messages_tx.send(resp).await.is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            write_tx: Some(write_tx),
            messages_rx: Some(messages_rx),
            reader_handle,
            writer_handle,
            child: Some(child),
        })
    }

    /// Serialize one outbound frame and queue it for writing.
    ///
    /// Frames are written in the order `write` is called. No acknowledgement
    /// is implied; correlation with any response is up to the caller.
    pub async fn write<T: Serialize>(&self, frame: &T) -> Result<(), McpError> {
        let serialized = serde_json::to_string(frame)?;
        let tx = self.write_tx.as_ref().ok_or(McpError::ConnectionClosed)?;
        tx.send(serialized)
            .await
            .map_err(|_| McpError::ConnectionClosed)
    }

    /// A detached write handle sharing this transport's outbound queue.
    pub fn writer(&self) -> Result<TransportWriter, McpError> {
        let tx = self
            .write_tx
            .as_ref()
            .ok_or(McpError::ConnectionClosed)?
            .clone();
        Ok(TransportWriter { tx })
    }

    /// Take the inbound message receiver.
    ///
    /// There is exactly one consumer of inbound frames; this returns `Some`
    /// on the first call and `None` afterwards.
    pub fn take_messages(&mut self) -> Option<mpsc::Receiver<JsonRpcResponse>> {
        self.messages_rx.take()
    }

    /// Whether the server process is still running.
    pub fn is_running(&mut self) -> bool {
        match &mut self.child {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Shut down the transport: close the write side, wait briefly for the
    /// server to exit, then kill it. Closing an already-closed transport is
    /// a no-op.
    pub async fn close(&mut self) {
        // Drop the write channel and abort the writer task; the task owns
        // the child's stdin, so this delivers EOF even while detached
        // writer handles are still alive somewhere.
        drop(self.write_tx.take());
        self.writer_handle.abort();

        let Some(mut child) = self.child.take() else {
            return;
        };

        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!("MCP server exited with {status}");
            }
            Ok(Err(e)) => {
                tracing::warn!("Failed waiting for MCP server exit: {e}");
            }
            Err(_) => {
                tracing::warn!("MCP server did not exit within grace period, killing");
                let _ = child.kill().await;
            }
        }

        self.reader_handle.abort();
    }
}
