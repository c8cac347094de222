//! Configuration loading.
//!
//! Two files live in the config directory:
//! - `mcp_servers.json`: which tool servers to launch and how
//! - `settings.yaml`: pool, tracker, retry and tool-class tuning
//!
//! Both support `${VAR}` and `${VAR:-default}` interpolation. A missing
//! `settings.yaml` means "use defaults"; a missing `mcp_servers.json` is an error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::mcp_client::McpServersConfig;

/// Environment variable that points directly at the config directory.
pub const CONFIG_DIR_ENV: &str = "TOOLGATHER_CONFIG_DIR";

const SERVERS_FILE: &str = "mcp_servers.json";
const SETTINGS_FILE: &str = "settings.yaml";

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Errors raised while locating or parsing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not find a config directory containing mcp_servers.json")]
    NotFound,

    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },
}

// ─── Settings ────────────────────────────────────────────────────────────────

/// Runtime tuning (mirrors `settings.yaml`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatherSettings {
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub tracker: TrackerSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    /// Per tool class overrides, keyed by result key (`jira`, `confluence`, `googleDrive`).
    #[serde(default)]
    pub classes: HashMap<String, ToolClassOverride>,
}

/// Connection pool tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolSettings {
    /// How long a connection is trusted without a fresh liveness probe.
    #[serde(default = "default_staleness_window_ms")]
    pub staleness_window_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// First delay after a failed rebuild (doubles per consecutive failure).
    #[serde(default = "default_rebuild_backoff_base_ms")]
    pub rebuild_backoff_base_ms: u64,
    #[serde(default = "default_rebuild_backoff_max_ms")]
    pub rebuild_backoff_max_ms: u64,
    /// Working directory for servers without their own `cwd`.
    #[serde(default)]
    pub working_dir: Option<String>,
}

fn default_staleness_window_ms() -> u64 {
    30_000
}
fn default_probe_timeout_ms() -> u64 {
    2_000
}
fn default_handshake_timeout_ms() -> u64 {
    30_000
}
fn default_shutdown_timeout_ms() -> u64 {
    5_000
}
fn default_rebuild_backoff_base_ms() -> u64 {
    1_000
}
fn default_rebuild_backoff_max_ms() -> u64 {
    60_000
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            staleness_window_ms: default_staleness_window_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            rebuild_backoff_base_ms: default_rebuild_backoff_base_ms(),
            rebuild_backoff_max_ms: default_rebuild_backoff_max_ms(),
            working_dir: None,
        }
    }
}

impl PoolSettings {
    pub fn staleness_window(&self) -> Duration {
        Duration::from_millis(self.staleness_window_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Backoff after `failures` consecutive failed rebuilds (`failures >= 1`).
    pub fn rebuild_backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        let delay = self.rebuild_backoff_base_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.rebuild_backoff_max_ms))
    }
}

/// Performance tracker tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackerSettings {
    /// Successful-call durations kept per tool.
    #[serde(default = "default_sample_capacity")]
    pub sample_capacity: usize,
    /// Below this many samples, statistics are reported as unknown.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
}

fn default_sample_capacity() -> usize {
    100
}
fn default_min_samples() -> usize {
    5
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            sample_capacity: default_sample_capacity(),
            min_samples: default_min_samples(),
        }
    }
}

/// Retry and backoff policy for tool calls.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before retry `n` is `base_delay_ms * 2^n`.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    2
}
fn default_base_delay_ms() -> u64 {
    1_000
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl RetrySettings {
    /// Delay to wait after failed attempt `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(1u64 << exp))
    }
}

/// Optional overrides for one tool class. Unset fields keep built-in defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolClassOverride {
    pub enabled: Option<bool>,
    pub server_key: Option<String>,
    pub tool_name: Option<String>,
    pub query_param: Option<String>,
    pub limit_param: Option<String>,
    pub default_limit: Option<u32>,
    pub subresource_param: Option<String>,
    pub base_timeout_ms: Option<u64>,
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config directory.
///
/// Checks `TOOLGATHER_CONFIG_DIR` first, then walks upward from `start`
/// looking for `toolgather/mcp_servers.json`.
pub fn find_config_dir(start: &Path) -> Result<PathBuf, ConfigError> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        let candidate = PathBuf::from(expand_tilde(&dir));
        if candidate.join(SERVERS_FILE).exists() {
            return Ok(candidate);
        }
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join("toolgather");
        if candidate.join(SERVERS_FILE).exists() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(ConfigError::NotFound)
}

/// Load `mcp_servers.json` from the config directory.
pub fn load_servers_config(dir: &Path) -> Result<McpServersConfig, ConfigError> {
    let path = dir.join(SERVERS_FILE);
    let raw = read_interpolated(&path)?;
    serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Load `settings.yaml` from the config directory, or defaults if absent.
pub fn load_settings(dir: &Path) -> Result<GatherSettings, ConfigError> {
    let path = dir.join(SETTINGS_FILE);
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no settings file, using defaults");
        return Ok(GatherSettings::default());
    }

    let raw = read_interpolated(&path)?;
    serde_yaml::from_str(&raw).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

fn read_interpolated(path: &Path) -> Result<String, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok(interpolate_env_vars(&raw))
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var_name, default)) => {
            std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
        }
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__TOOLGATHER_UNSET_VAR__");
        let result = interpolate_env_vars("${__TOOLGATHER_UNSET_VAR__:-/fallback/path}");
        assert_eq!(result, "/fallback/path");
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__TOOLGATHER_TEST_TOKEN__", "secret-123");
        let result = interpolate_env_vars("token=${__TOOLGATHER_TEST_TOKEN__}");
        assert_eq!(result, "token=secret-123");
        std::env::remove_var("__TOOLGATHER_TEST_TOKEN__");
    }

    #[test]
    fn test_interpolate_no_vars() {
        let input = "plain text with $dollar but no braces";
        assert_eq!(interpolate_env_vars(input), input);
    }

    #[test]
    fn test_load_settings_defaults_when_missing() {
        let tmp = TempDir::new().unwrap();
        let settings = load_settings(tmp.path()).unwrap();
        assert_eq!(settings.pool.probe_timeout(), Duration::from_secs(2));
        assert_eq!(settings.tracker.min_samples, 5);
        assert_eq!(settings.retry.max_retries, 2);
    }

    #[test]
    fn test_load_settings_partial_yaml() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(SETTINGS_FILE),
            r#"
pool:
  staleness_window_ms: 10000
retry:
  base_delay_ms: 250
classes:
  jira:
    server_key: jira-server
    default_limit: 25
"#,
        )
        .unwrap();

        let settings = load_settings(tmp.path()).unwrap();
        assert_eq!(settings.pool.staleness_window(), Duration::from_secs(10));
        assert_eq!(settings.pool.probe_timeout_ms, 2_000);
        assert_eq!(settings.retry.delay_for(2), Duration::from_millis(1_000));
        let jira = &settings.classes["jira"];
        assert_eq!(jira.server_key.as_deref(), Some("jira-server"));
        assert_eq!(jira.default_limit, Some(25));
        assert!(jira.tool_name.is_none());
    }

    #[test]
    fn test_load_servers_config_interpolates_env() {
        std::env::set_var("__TOOLGATHER_ATLASSIAN_URL__", "https://example.atlassian.net");
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(SERVERS_FILE),
            r#"{
                "servers": {
                    "atlassian": {
                        "name": "Atlassian",
                        "command": "npx",
                        "args": ["-y", "mcp-atlassian"],
                        "env": {"ATLASSIAN_URL": "${__TOOLGATHER_ATLASSIAN_URL__}"}
                    }
                }
            }"#,
        )
        .unwrap();

        let config = load_servers_config(tmp.path()).unwrap();
        let atlassian = &config.servers["atlassian"];
        assert_eq!(atlassian.env["ATLASSIAN_URL"], "https://example.atlassian.net");
        assert!(atlassian.enabled);
        std::env::remove_var("__TOOLGATHER_ATLASSIAN_URL__");
    }

    #[test]
    fn test_load_servers_config_missing_file() {
        let tmp = TempDir::new().unwrap();
        let err = load_servers_config(tmp.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_find_config_dir_walks_upward() {
        let tmp = TempDir::new().unwrap();
        let config_dir = tmp.path().join("toolgather");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(config_dir.join(SERVERS_FILE), "{}").unwrap();
        let nested = tmp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        std::env::remove_var(CONFIG_DIR_ENV);
        let found = find_config_dir(&nested).unwrap();
        assert_eq!(found, config_dir);
    }

    #[test]
    fn test_rebuild_backoff_is_capped() {
        let pool = PoolSettings {
            rebuild_backoff_base_ms: 1_000,
            rebuild_backoff_max_ms: 5_000,
            ..PoolSettings::default()
        };
        assert_eq!(pool.rebuild_backoff(1), Duration::from_secs(1));
        assert_eq!(pool.rebuild_backoff(2), Duration::from_secs(2));
        assert_eq!(pool.rebuild_backoff(3), Duration::from_secs(4));
        assert_eq!(pool.rebuild_backoff(4), Duration::from_secs(5));
        assert_eq!(pool.rebuild_backoff(40), Duration::from_secs(5));
    }
}
