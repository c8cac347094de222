//! Connection pool: at most one live connection per server key.
//!
//! `get_connection` hands out a connection only if it was verified alive
//! within the staleness window, or passes a fresh `tools/list` probe. A
//! failed probe evicts the connection and rebuilds it. Each key has its own
//! async lock, so concurrent callers for the same key wait for a single
//! rebuild instead of spawning duplicate processes, while other keys proceed
//! independently.
//!
//! Acquisition runs in its own task. A caller that stops waiting (for example
//! because its call budget expired) abandons the probe or rebuild but never
//! cuts it short, so the next caller picks up the finished connection.
//!
//! Consecutive rebuild failures put the key into a capped exponential
//! backoff; callers inside the window fail fast with `BackoffActive`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use super::connection::{Connector, ToolConnection};
use super::errors::McpError;
use super::types::{McpServersConfig, McpToolDefinition, ServerConfig};
use crate::config::PoolSettings;

// ─── Slot ────────────────────────────────────────────────────────────────────

/// Per-key pool state. Guarded by that key's async lock.
#[derive(Default)]
struct Slot {
    connection: Option<Arc<dyn ToolConnection>>,
    last_verified: Option<Instant>,
    consecutive_failures: u32,
    retry_after: Option<Instant>,
}

// ─── Health ──────────────────────────────────────────────────────────────────

/// Health of one configured server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// One entry of the health report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerHealth {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

// ─── ConnectionPool ──────────────────────────────────────────────────────────

/// Owns every live tool server connection.
pub struct ConnectionPool {
    configs: HashMap<String, ServerConfig>,
    connector: Arc<dyn Connector>,
    settings: PoolSettings,
    slots: StdMutex<HashMap<String, Arc<Mutex<Slot>>>>,
}

impl ConnectionPool {
    pub fn new(
        config: McpServersConfig,
        connector: Arc<dyn Connector>,
        settings: PoolSettings,
    ) -> Self {
        Self {
            configs: config.servers,
            connector,
            settings,
            slots: StdMutex::new(HashMap::new()),
        }
    }

    /// Configuration for a server key, if any.
    pub fn server_config(&self, key: &str) -> Option<&ServerConfig> {
        self.configs.get(key)
    }

    /// Whether a server is configured and enabled.
    pub fn is_enabled(&self, key: &str) -> bool {
        self.server_config(key).is_some_and(|c| c.enabled)
    }

    /// Names of all configured servers, sorted.
    pub fn configured_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }

    fn slot(&self, key: &str) -> Arc<Mutex<Slot>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(slots.entry(key.to_string()).or_default())
    }

    /// Return a verified-alive connection for `key`, rebuilding if needed.
    ///
    /// Dropping the returned future does not cancel a probe or rebuild that
    /// is already under way.
    pub async fn get_connection(&self, key: &str) -> Result<Arc<dyn ToolConnection>, McpError> {
        let config = self.configs.get(key).ok_or(McpError::UnknownServer {
            name: key.to_string(),
        })?;
        if !config.enabled {
            return Err(McpError::ServerDisabled {
                name: key.to_string(),
            });
        }

        let acquire = Acquire {
            key: key.to_string(),
            config: config.clone(),
            connector: Arc::clone(&self.connector),
            settings: self.settings.clone(),
            slot: self.slot(key),
        };
        tokio::spawn(acquire.run())
            .await
            .map_err(|e| McpError::TransportError {
                server: key.to_string(),
                reason: format!("connection task failed: {e}"),
            })?
    }

    /// Evict `conn` if it is still the cached connection for `key`.
    ///
    /// A connection that was already replaced is left alone, so a late error
    /// from an old channel cannot take down its successor. The evicted
    /// process is terminated in the background.
    pub async fn evict_if(&self, key: &str, conn: &Arc<dyn ToolConnection>) -> bool {
        let slot = self.slot(key);
        let evicted = {
            let mut slot = slot.lock().await;
            let current = slot
                .connection
                .as_ref()
                .is_some_and(|c| Arc::ptr_eq(c, conn));
            if current {
                slot.last_verified = None;
                slot.connection.take()
            } else {
                None
            }
        };
        match evicted {
            Some(conn) => {
                tracing::info!(
                    server = conn.server_key(),
                    age_ms = conn.created_at().elapsed().as_millis() as u64,
                    "evicting connection"
                );
                retire(conn);
                true
            }
            None => {
                tracing::debug!(server = key, "connection already replaced, not evicting");
                false
            }
        }
    }

    /// Tool catalog of the live connection for `key`, connecting if needed.
    pub async fn catalog(&self, key: &str) -> Result<Vec<McpToolDefinition>, McpError> {
        let conn = self.get_connection(key).await?;
        Ok(conn.tools().to_vec())
    }

    /// Probe every enabled server and report its health.
    ///
    /// Connects servers that are not yet running. Disabled servers are omitted.
    pub async fn health_check(&self) -> BTreeMap<String, ServerHealth> {
        let keys: Vec<String> = self
            .configured_servers()
            .into_iter()
            .filter(|k| self.is_enabled(k))
            .collect();

        let checks = keys.iter().map(|key| async move {
            let started = Instant::now();
            let outcome = match self.get_connection(key).await {
                Ok(conn) => {
                    match tokio::time::timeout(self.settings.probe_timeout(), conn.list_tools())
                        .await
                    {
                        Ok(Ok(_)) => Ok(()),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(_) => Err(format!(
                            "probe timed out after {}ms",
                            self.settings.probe_timeout_ms
                        )),
                    }
                }
                Err(e) => Err(e.to_string()),
            };
            let elapsed = started.elapsed().as_millis() as u64;
            let health = match outcome {
                Ok(()) => ServerHealth {
                    status: HealthStatus::Healthy,
                    response_time_ms: Some(elapsed),
                    error: None,
                    checked_at: Utc::now(),
                },
                Err(error) => ServerHealth {
                    status: HealthStatus::Unhealthy,
                    response_time_ms: None,
                    error: Some(error),
                    checked_at: Utc::now(),
                },
            };
            (key.clone(), health)
        });

        futures::future::join_all(checks).await.into_iter().collect()
    }

    /// Close every connection.
    pub async fn shutdown_all(&self) {
        let slots: Vec<(String, Arc<Mutex<Slot>>)> = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.drain().collect()
        };
        for (key, slot) in slots {
            let conn = slot.lock().await.connection.take();
            if let Some(conn) = conn {
                tracing::debug!(server = %key, "shutting down");
                conn.close().await;
            }
        }
    }
}

/// Terminate a connection that has left the pool without blocking the caller.
fn retire(conn: Arc<dyn ToolConnection>) {
    tokio::spawn(async move {
        conn.close().await;
    });
}

// ─── Acquisition ─────────────────────────────────────────────────────────────

/// Everything one acquisition needs, owned so it can run as its own task.
struct Acquire {
    key: String,
    config: ServerConfig,
    connector: Arc<dyn Connector>,
    settings: PoolSettings,
    slot: Arc<Mutex<Slot>>,
}

impl Acquire {
    async fn run(self) -> Result<Arc<dyn ToolConnection>, McpError> {
        let slot = Arc::clone(&self.slot);
        let mut slot = slot.lock().await;

        if let Some(conn) = slot.connection.clone() {
            let fresh = slot
                .last_verified
                .is_some_and(|t| t.elapsed() < self.settings.staleness_window());
            if fresh {
                return Ok(conn);
            }

            match tokio::time::timeout(self.settings.probe_timeout(), conn.list_tools()).await {
                Ok(Ok(_)) => {
                    slot.last_verified = Some(Instant::now());
                    return Ok(conn);
                }
                Ok(Err(e)) => {
                    tracing::warn!(server = %self.key, error = %e, "liveness probe failed, evicting");
                }
                Err(_) => {
                    tracing::warn!(
                        server = %self.key,
                        timeout_ms = self.settings.probe_timeout_ms,
                        "liveness probe timed out, evicting"
                    );
                }
            }

            slot.connection = None;
            slot.last_verified = None;
            retire(conn);
        }

        self.rebuild(&mut slot).await
    }

    /// Spawn a replacement connection. Caller holds the slot lock.
    async fn rebuild(&self, slot: &mut Slot) -> Result<Arc<dyn ToolConnection>, McpError> {
        if let Some(retry_after) = slot.retry_after {
            let now = Instant::now();
            if now < retry_after {
                return Err(McpError::BackoffActive {
                    name: self.key.clone(),
                    failures: slot.consecutive_failures,
                    retry_in_ms: (retry_after - now).as_millis() as u64,
                });
            }
        }

        match self.connector.connect(&self.key, &self.config).await {
            Ok(conn) => {
                slot.connection = Some(Arc::clone(&conn));
                slot.last_verified = Some(Instant::now());
                slot.consecutive_failures = 0;
                slot.retry_after = None;
                Ok(conn)
            }
            Err(e) => {
                slot.consecutive_failures += 1;
                let backoff = self.settings.rebuild_backoff(slot.consecutive_failures);
                slot.retry_after = Some(Instant::now() + backoff);
                tracing::warn!(
                    server = %self.key,
                    error = %e,
                    failures = slot.consecutive_failures,
                    backoff_ms = backoff.as_millis() as u64,
                    "connect failed"
                );
                Err(e)
            }
        }
    }
}

// ─── Test Support ────────────────────────────────────────────────────────────


// ─── Tests ───────────────────────────────────────────────────────────────────
