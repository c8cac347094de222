//! Tool server connections.
//!
//! A connection owns one child process and its JSON-RPC channel. It is created
//! by a [`Connector`], performs the capability handshake on construction, and
//! caches the advertised tool catalog. The pool only sees the
//! [`ToolConnection`] trait, so tests can substitute in-memory fakes.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;

use super::errors::McpError;
use super::transport::{extract_result, StdioTransport};
use super::types::{error_codes, InitializeResult, McpToolDefinition, ServerConfig, ToolsListResult};
use crate::config::PoolSettings;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Protocol version sent in the `initialize` request.
const PROTOCOL_VERSION: &str = "2024-11-05";

/// Stderr lines kept for failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

// ─── Traits ──────────────────────────────────────────────────────────────────

/// A live channel to one tool server.
#[async_trait]
pub trait ToolConnection: Send + Sync {
    /// Pool key of the server this connection belongs to.
    fn server_key(&self) -> &str;

    /// Tool catalog captured during the handshake.
    fn tools(&self) -> &[McpToolDefinition];

    /// When the connection finished its handshake.
    fn created_at(&self) -> Instant;

    /// Invoke a tool and return its result payload.
    async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError>;

    /// Request the tool catalog again. Used as the liveness probe.
    async fn list_tools(&self) -> Result<Vec<McpToolDefinition>, McpError>;

    /// Terminate the server. Never fails; the process is released regardless.
    async fn close(&self);
}

/// Builds connections for the pool.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        key: &str,
        config: &ServerConfig,
    ) -> Result<Arc<dyn ToolConnection>, McpError>;
}

// ─── Stdio Connector ─────────────────────────────────────────────────────────

/// Spawns tool servers as child processes talking JSON-RPC over stdio.
#[derive(Debug, Clone)]
pub struct StdioConnector {
    handshake_timeout: Duration,
    shutdown_timeout: Duration,
    working_dir: Option<String>,
}

impl StdioConnector {
    pub fn new(settings: &PoolSettings) -> Self {
        Self {
            handshake_timeout: settings.handshake_timeout(),
            shutdown_timeout: settings.shutdown_timeout(),
            working_dir: settings.working_dir.clone(),
        }
    }
}

#[async_trait]
impl Connector for StdioConnector {
    async fn connect(
        &self,
        key: &str,
        config: &ServerConfig,
    ) -> Result<Arc<dyn ToolConnection>, McpError> {
        let connection = spawn_connection(
            key,
            config,
            self.working_dir.as_deref(),
            self.handshake_timeout,
            self.shutdown_timeout,
        )
        .await?;
        Ok(Arc::new(connection))
    }
}

// ─── Stdio Connection ────────────────────────────────────────────────────────

/// A running tool server process with its transport and tool catalog.
pub struct StdioConnection {
    key: String,
    /// `None` once closed.
    process: Mutex<Option<Child>>,
    transport: StdioTransport,
    tools: Vec<McpToolDefinition>,
    created_at: Instant,
    shutdown_timeout: Duration,
}

#[async_trait]
impl ToolConnection for StdioConnection {
    fn server_key(&self) -> &str {
        &self.key
    }

    fn tools(&self) -> &[McpToolDefinition] {
        &self.tools
    }

    fn created_at(&self) -> Instant {
        self.created_at
    }

    async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        let params = serde_json::json!({
            "name": tool_name,
            "arguments": arguments,
        });
        let response = self.transport.request("tools/call", Some(params)).await?;
        let result = extract_result(response)?;

        // MCP reports tool-level failures in-band.
        if result.get("isError").and_then(|v| v.as_bool()) == Some(true) {
            return Err(McpError::ServerError {
                code: error_codes::INTERNAL_ERROR,
                message: content_text(&result)
                    .unwrap_or_else(|| format!("tool '{tool_name}' reported an error")),
                data: Some(result),
            });
        }

        Ok(result)
    }

    async fn list_tools(&self) -> Result<Vec<McpToolDefinition>, McpError> {
        let response = self.transport.request("tools/list", None).await?;
        let result = extract_result(response)?;
        let list: ToolsListResult =
            serde_json::from_value(result).map_err(|e| McpError::TransportError {
                server: self.key.clone(),
                reason: format!("malformed tools/list response: {e}"),
            })?;
        Ok(list.tools)
    }

    async fn close(&self) {
        let Some(mut child) = self.process.lock().await.take() else {
            return;
        };

        // Best-effort: the server may already be gone.
        let _ = self.transport.notify("shutdown", None).await;
        self.transport.close_stdin().await;

        match tokio::time::timeout(self.shutdown_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.key, %status, "server exited");
            }
            _ => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(server = %self.key, error = %e, "failed to kill server");
                }
            }
        }
    }
}

/// Join the text blocks of an MCP `content` array.
fn content_text(result: &serde_json::Value) -> Option<String> {
    let blocks = result.get("content")?.as_array()?;
    let text: Vec<&str> = blocks
        .iter()
        .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
        .collect();
    if text.is_empty() {
        None
    } else {
        Some(text.join("\n"))
    }
}

// ─── Spawning ────────────────────────────────────────────────────────────────

/// Spawn a tool server process and perform the capability handshake.
pub async fn spawn_connection(
    key: &str,
    config: &ServerConfig,
    working_dir: Option<&str>,
    handshake_timeout: Duration,
    shutdown_timeout: Duration,
) -> Result<StdioConnection, McpError> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);

    for (k, v) in &config.env {
        cmd.env(k, v);
    }

    if let Some(dir) = config.cwd.as_deref().or(working_dir) {
        cmd.current_dir(dir);
    }

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    // Dropping the connection without `close()` still reaps the process.
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
        name: key.to_string(),
        reason: format!("{e}"),
    })?;

    let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
        name: key.to_string(),
        reason: "failed to capture stdin".into(),
    })?;

    let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
        name: key.to_string(),
        reason: "failed to capture stdout".into(),
    })?;

    let stderr_tail = Arc::new(StdMutex::new(VecDeque::new()));
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(drain_stderr(key.to_string(), stderr, Arc::clone(&stderr_tail)));
    }

    let transport = StdioTransport::new(key, stdin, stdout);
    let started = Instant::now();

    let tools = match tokio::time::timeout(handshake_timeout, handshake(&transport, key)).await {
        Ok(Ok(tools)) => tools,
        Ok(Err(e)) => {
            let stderr_ctx = stderr_snapshot(&stderr_tail);
            if !stderr_ctx.is_empty() {
                tracing::warn!(server = key, stderr = %stderr_ctx, "server stderr captured on failure");
            }
            let _ = child.kill().await;
            return Err(McpError::InitFailed {
                name: key.to_string(),
                reason: format!("{e}{}", format_stderr_suffix(&stderr_ctx)),
            });
        }
        Err(_) => {
            let stderr_ctx = stderr_snapshot(&stderr_tail);
            if !stderr_ctx.is_empty() {
                tracing::warn!(server = key, stderr = %stderr_ctx, "server stderr captured on timeout");
            }
            let _ = child.kill().await;
            return Err(McpError::HandshakeTimeout {
                name: key.to_string(),
                timeout_ms: handshake_timeout.as_millis() as u64,
            });
        }
    };

    tracing::info!(
        server = key,
        name = config.display_name(key),
        tools = tools.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "tool server connected"
    );

    Ok(StdioConnection {
        key: key.to_string(),
        process: Mutex::new(Some(child)),
        transport,
        tools,
        created_at: Instant::now(),
        shutdown_timeout,
    })
}

/// Perform the MCP handshake and return the tool catalog.
///
/// Servers that do not advertise tools inline in `initialize` are asked
/// with `tools/list`.
async fn handshake(
    transport: &StdioTransport,
    server_name: &str,
) -> Result<Vec<McpToolDefinition>, McpError> {
    let params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {"name": env!("CARGO_PKG_NAME"), "version": env!("CARGO_PKG_VERSION")},
    });
    let response = transport.request("initialize", Some(params)).await?;
    let result = extract_result(response)?;

    let init: InitializeResult =
        serde_json::from_value(result).map_err(|e| McpError::InitFailed {
            name: server_name.to_string(),
            reason: format!("failed to parse initialize response: {e}"),
        })?;

    if let Some(info) = &init.server_info {
        tracing::debug!(
            server = server_name,
            remote_name = info.name.as_deref().unwrap_or("?"),
            remote_version = info.version.as_deref().unwrap_or("?"),
            "initialize acknowledged"
        );
    }

    transport.notify("notifications/initialized", None).await?;

    if !init.tools.is_empty() {
        return Ok(init.tools);
    }

    let response = transport.request("tools/list", None).await?;
    let result = extract_result(response)?;
    let list: ToolsListResult =
        serde_json::from_value(result).map_err(|e| McpError::InitFailed {
            name: server_name.to_string(),
            reason: format!("failed to parse tools/list response: {e}"),
        })?;
    Ok(list.tools)
}

/// Forward server stderr to the log and keep the last few lines.
///
/// Draining also keeps a chatty server from blocking on a full pipe.
async fn drain_stderr(key: String, stderr: ChildStderr, tail: Arc<StdMutex<VecDeque<String>>>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(server = %key, line = %line, "server stderr");
        let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

fn stderr_snapshot(tail: &StdMutex<VecDeque<String>>) -> String {
    let tail = tail.lock().unwrap_or_else(|e| e.into_inner());
    let mut joined = tail.iter().cloned().collect::<Vec<_>>().join("\n");
    if joined.len() > 2000 {
        let mut cut = 2000;
        while !joined.is_char_boundary(cut) {
            cut -= 1;
        }
        joined.truncate(cut);
        joined.push_str("...(truncated)");
    }
    joined
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(command: &str, args: &[&str]) -> ServerConfig {
        ServerConfig {
            name: None,
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: HashMap::new(),
            cwd: None,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_is_spawn_failure() {
        let cfg = config("/nonexistent/toolgather-test-binary", &[]);
        let result = spawn_connection(
            "missing",
            &cfg,
            None,
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(McpError::SpawnFailed { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_silent_server_hits_handshake_timeout() {
        let cfg = config("sh", &["-c", "sleep 5"]);
        let started = Instant::now();
        let result = spawn_connection(
            "silent",
            &cfg,
            None,
            Duration::from_millis(200),
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(McpError::HandshakeTimeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exiting_server_fails_init_with_stderr() {
        let cfg = config("sh", &["-c", "echo boom >&2; exit 1"]);
        let result = spawn_connection(
            "crashy",
            &cfg,
            None,
            Duration::from_secs(2),
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(McpError::InitFailed { .. })));
    }

    #[test]
    fn test_content_text_joins_blocks() {
        let result = serde_json::json!({
            "content": [{"type": "text", "text": "first"}, {"type": "text", "text": "second"}],
            "isError": true
        });
        assert_eq!(content_text(&result).as_deref(), Some("first\nsecond"));
        assert!(content_text(&serde_json::json!({})).is_none());
    }

    #[test]
    fn test_format_stderr_suffix() {
        assert_eq!(format_stderr_suffix(""), "");
        assert_eq!(format_stderr_suffix("oops\n"), " | stderr: oops");
    }
}
