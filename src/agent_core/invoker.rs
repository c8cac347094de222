//! Tool Invoker: one tool call against a pooled connection under a timeout.
//!
//! The timeout covers connection acquisition and the call itself. When it
//! fires during acquisition, the caller stops waiting but the pool finishes
//! the probe or rebuild for whoever asks next. When it fires during the call,
//! the in-flight future is dropped: the transport deregisters the request id,
//! so a late response from the server is discarded.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use super::performance::PerformanceTracker;
use super::types::{AttemptOutcome, InvocationAttempt};
use crate::config::RetrySettings;
use crate::mcp_client::{ConnectionPool, McpError, ToolConnection};

/// One failed attempt, as reported by `call_tool_with_retry`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptSummary {
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub duration_ms: u64,
    pub error: String,
}

/// Every retry attempt failed.
#[derive(Debug, Clone, Error)]
#[error("tool '{tool}' failed after {} attempt(s): {last_error}", attempts.len())]
pub struct RetryFailure {
    pub tool: String,
    pub attempts: Vec<AttemptSummary>,
    pub last_error: McpError,
}

/// Executes tool calls and feeds their timings to the tracker.
pub struct ToolInvoker {
    pool: Arc<ConnectionPool>,
    tracker: Arc<PerformanceTracker>,
    retry: RetrySettings,
}

impl ToolInvoker {
    pub fn new(
        pool: Arc<ConnectionPool>,
        tracker: Arc<PerformanceTracker>,
        retry: RetrySettings,
    ) -> Self {
        Self {
            pool,
            tracker,
            retry,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn tracker(&self) -> &Arc<PerformanceTracker> {
        &self.tracker
    }

    pub fn retry_settings(&self) -> &RetrySettings {
        &self.retry
    }

    /// Call `tool_name` on `server_key`, giving up after `timeout`.
    ///
    /// Returns within `timeout` plus scheduling overhead whether or not the
    /// server ever answers.
    pub async fn call_with_timeout(
        &self,
        server_key: &str,
        tool_name: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, McpError> {
        self.attempt(server_key, tool_name, params, timeout).await.1
    }

    /// Call with up to `max_retries + 1` attempts and exponential backoff.
    ///
    /// Connection errors are not retried here; the pool decides when a
    /// rebuild is worth trying again.
    pub async fn call_tool_with_retry(
        &self,
        server_key: &str,
        tool_name: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, RetryFailure> {
        let mut attempts = Vec::new();
        let total = self.retry.max_retries + 1;
        let mut n = 0;

        loop {
            let (record, result) = self
                .attempt(server_key, tool_name, params.clone(), timeout)
                .await;
            let error = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            attempts.push(AttemptSummary {
                attempt: n,
                outcome: record.outcome,
                duration_ms: record.duration_ms(),
                error: error.to_string(),
            });

            let last = n + 1 == total;
            if last || error.is_connection_error() {
                return Err(RetryFailure {
                    tool: tool_name.to_string(),
                    attempts,
                    last_error: error,
                });
            }

            let delay = self.retry.delay_for(n);
            tracing::debug!(
                tool = %tool_name,
                attempt = n,
                delay_ms = delay.as_millis() as u64,
                "retrying after failure"
            );
            tokio::time::sleep(delay).await;
            n += 1;
        }
    }

    async fn attempt(
        &self,
        server_key: &str,
        tool_name: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> (InvocationAttempt, Result<serde_json::Value, McpError>) {
        let started_at = Instant::now();

        let mut used: Option<Arc<dyn ToolConnection>> = None;
        let call = async {
            let conn = self.pool.get_connection(server_key).await?;
            used = Some(Arc::clone(&conn));
            conn.call_tool(tool_name, params.clone()).await
        };
        let result = match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(McpError::Timeout {
                tool: tool_name.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        };

        let record = InvocationAttempt {
            tool_name: tool_name.to_string(),
            params,
            timeout,
            started_at,
            duration: started_at.elapsed(),
            outcome: AttemptOutcome::from_result(&result),
        };
        self.tracker.record_attempt(&record);

        tracing::debug!(
            server = %server_key,
            tool = %tool_name,
            outcome = ?record.outcome,
            elapsed_ms = record.duration_ms(),
            timeout_ms = timeout.as_millis() as u64,
            "tool call finished"
        );

        if let (Err(e), Some(conn)) = (&result, &used) {
            if e.is_transport_error() {
                tracing::warn!(server = %server_key, error = %e, "channel broke mid-call");
                self.pool.evict_if(server_key, conn).await;
            }
        }

        (record, result)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
