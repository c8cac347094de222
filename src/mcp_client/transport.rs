//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with tool server child processes:
//! - Writing JSON-RPC requests to stdin (one JSON object per line)
//! - A background reader task that owns stdout and routes each response to
//!   the caller waiting on its `id`
//! - Dropping a pending request (timeout, cancellation) deregisters it, so a
//!   late response is read and discarded
//! - Closing stdin on shutdown, since stdio servers exit on EOF

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::types::{error_codes, JsonRpcRequest, JsonRpcResponse};

type PendingMap = Arc<StdMutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    next_id: AtomicU64,
    /// `None` once stdin has been closed.
    writer: Mutex<Option<BoxedWriter>>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    reader_handle: JoinHandle<()>,
}

impl StdioTransport {
    /// Create a transport and start its reader task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new<W, R>(server_name: &str, writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader_handle = tokio::spawn(reader_loop(
            server_name.to_string(),
            BufReader::new(reader),
            Arc::clone(&pending),
            Arc::clone(&closed),
        ));

        Self {
            server_name: server_name.to_string(),
            next_id: AtomicU64::new(1),
            writer: Mutex::new(Some(Box::new(writer))),
            pending,
            closed,
            reader_handle,
        }
    }

    /// Whether the server's stdout has closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send a JSON-RPC request and wait for the matching response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(id, method, params);

        let mut json = serde_json::to_string(&req).map_err(|e| McpError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to serialize request: {e}"),
        })?;
        json.push('\n');

        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id, tx);
        // Removes the entry on every exit path, including cancellation.
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };
        // The reader sets `closed` before clearing the map, so an entry
        // inserted after the final clear is caught here.
        if self.is_closed() {
            return Err(self.closed_error());
        }

        self.write_line(&json).await?;

        rx.await.map_err(|_| self.closed_error())
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });

        let mut json = serde_json::to_string(&notification).map_err(|e| {
            McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to serialize notification: {e}"),
            }
        })?;
        json.push('\n');

        self.write_line(&json).await
    }

    /// Close the server's stdin. Later requests fail with a transport error.
    pub async fn close_stdin(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    async fn write_line(&self, line: &str) -> Result<(), McpError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| McpError::TransportError {
            server: self.server_name.clone(),
            reason: "stdin already closed".into(),
        })?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to write to stdin: {e}"),
            })?;
        writer
            .flush()
            .await
            .map_err(|e| McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to flush stdin: {e}"),
            })
    }

    fn closed_error(&self) -> McpError {
        McpError::TransportError {
            server: self.server_name.clone(),
            reason: "server stdout closed (process may have exited)".into(),
        }
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

/// Deregisters a pending request id when the waiting future goes away.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock_pending(self.pending).remove(&self.id);
    }
}

fn lock_pending(
    pending: &PendingMap,
) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<JsonRpcResponse>>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

// ─── Reader Task ─────────────────────────────────────────────────────────────

/// Read stdout line by line and hand each response to its waiting caller.
///
/// Lines that are not JSON-RPC responses (server log output, notifications)
/// are skipped. On EOF or read error every pending sender is dropped, so
/// waiting callers observe a transport error rather than hanging.
async fn reader_loop<R>(
    server_name: String,
    mut reader: BufReader<R>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
) where
    R: AsyncRead + Send + Unpin,
{
    let mut line_buf = String::new();

    loop {
        line_buf.clear();
        match reader.read_line(&mut line_buf).await {
            Ok(0) => {
                tracing::debug!(server = %server_name, "server stdout closed");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(server = %server_name, error = %e, "failed to read server stdout");
                break;
            }
        }

        let trimmed = line_buf.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<JsonRpcResponse>(trimmed) {
            Ok(resp) => resp,
            Err(_) => {
                tracing::trace!(server = %server_name, line = %trimmed, "skipping non-response line");
                continue;
            }
        };

        let sender = lock_pending(&pending).remove(&response.id);
        match sender {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => {
                tracing::debug!(
                    server = %server_name,
                    id = response.id,
                    "discarding response with no waiting caller"
                );
            }
        }
    }

    closed.store(true, Ordering::Release);
    lock_pending(&pending).clear();
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{duplex, split, AsyncBufReadExt, AsyncWriteExt, BufReader};

    /// Spawn a fake server over an in-memory pipe that echoes each request's
    /// method back as the result. Requests for `hang` are never answered.
    fn echo_transport() -> StdioTransport {
        let (client, server) = duplex(64 * 1024);
        let (client_read, client_write) = split(client);
        let (server_read, mut server_write) = split(server);

        tokio::spawn(async move {
            let mut lines = BufReader::new(server_read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let req: serde_json::Value = serde_json::from_str(&line).unwrap();
                let Some(id) = req.get("id").cloned() else {
                    continue;
                };
                if req["method"] == "hang" {
                    continue;
                }
                let reply = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {"method": req["method"]},
                });
                let mut out = serde_json::to_string(&reply).unwrap();
                out.push('\n');
                server_write.write_all(b"log line from server\n").await.unwrap();
                server_write.write_all(out.as_bytes()).await.unwrap();
            }
        });

        StdioTransport::new("echo", client_write, client_read)
    }

    #[tokio::test]
    async fn test_request_skips_log_lines() {
        let transport = echo_transport();
        let resp = transport.request("tools/list", None).await.unwrap();
        let result = extract_result(resp).unwrap();
        assert_eq!(result["method"], "tools/list");
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_correlated_by_id() {
        let transport = Arc::new(echo_transport());
        let a = {
            let t = Arc::clone(&transport);
            tokio::spawn(async move { t.request("alpha", None).await })
        };
        let b = {
            let t = Arc::clone(&transport);
            tokio::spawn(async move { t.request("beta", None).await })
        };
        let a = extract_result(a.await.unwrap().unwrap()).unwrap();
        let b = extract_result(b.await.unwrap().unwrap()).unwrap();
        assert_eq!(a["method"], "alpha");
        assert_eq!(b["method"], "beta");
    }

    #[tokio::test]
    async fn test_abandoned_request_is_deregistered() {
        let transport = echo_transport();
        let res = tokio::time::timeout(Duration::from_millis(50), transport.request("hang", None))
            .await;
        assert!(res.is_err());
        assert!(lock_pending(&transport.pending).is_empty());

        let resp = transport.request("after", None).await.unwrap();
        assert_eq!(extract_result(resp).unwrap()["method"], "after");
    }

    #[tokio::test]
    async fn test_closed_stdout_fails_pending_request() {
        let (client, server) = duplex(1024);
        let (client_read, client_write) = split(client);
        let transport = StdioTransport::new("dying", client_write, client_read);

        let closer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(server);
        });

        let err = transport.request("tools/list", None).await.unwrap_err();
        closer.await.unwrap();
        assert!(err.is_transport_error());
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_close_stdin_ends_server_and_rejects_requests() {
        let (client, server) = duplex(1024);
        let (client_read, client_write) = split(client);
        let (server_read, _server_write) = split(server);
        let transport = StdioTransport::new("closing", client_write, client_read);

        let server_saw_eof = tokio::spawn(async move {
            let mut lines = BufReader::new(server_read).lines();
            while let Ok(Some(_)) = lines.next_line().await {}
        });

        transport.close_stdin().await;
        tokio::time::timeout(Duration::from_secs(1), server_saw_eof)
            .await
            .unwrap()
            .unwrap();

        let err = transport.request("tools/list", None).await.unwrap_err();
        assert!(err.is_transport_error());
    }

    #[test]
    fn test_extract_result_error() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 1,
            result: None,
            error: Some(super::super::types::JsonRpcError {
                code: -32601,
                message: "Method not found".into(),
                data: None,
            }),
        };
        match extract_result(resp).unwrap_err() {
            McpError::ServerError { code, message, .. } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            other => panic!("expected ServerError, got {other:?}"),
        }
    }

    #[test]
    fn test_extract_result_missing_both() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 1,
            result: None,
            error: None,
        };
        let err = extract_result(resp).unwrap_err();
        assert!(matches!(err, McpError::ServerError { .. }));
    }
}
