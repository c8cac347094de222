pub mod agent_core;
pub mod config;
pub mod mcp_client;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use agent_core::{ClassifierError, Orchestrator};
use config::ConfigError;
use mcp_client::{ConnectionPool, StdioConnector};

/// Failure to assemble an orchestrator from the config directory.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Classifier(#[from] ClassifierError),
}

/// Return the platform-standard data directory for toolgather.
///
/// - macOS: `~/Library/Application Support/toolgather/`
/// - Windows: `{FOLDERID_RoamingAppData}\toolgather\`
/// - Linux: `$XDG_DATA_HOME/toolgather/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.toolgather/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("toolgather");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolgather")
}

/// Initialize the tracing subscriber, writing to `toolgather.log` in the data directory.
///
/// On each startup:
/// 1. Rotates existing logs (toolgather.log → .1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh log with a line-flushing writer for crash resilience.
/// 3. Logs a startup banner with the log path for discoverability.
///
/// `json` switches the file format to one JSON object per line.
pub fn init_tracing(json: bool) -> std::io::Result<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = data_dir();
    std::fs::create_dir_all(&log_dir)?;

    let log_path = log_dir.join("toolgather.log");
    rotate_log_file(&log_path, 3);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;
    let writer = FlushingWriter::new(log_file);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("toolgather=info,warn"));

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== toolgather starting ==="
    );

    Ok(log_path)
}

/// Rotate log files: `toolgather.log` → `toolgather.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
///
/// Without explicit flushing, log entries may sit in OS buffers and be lost
/// when a hung tool server forces the process to be killed.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Load `mcp_servers.json` and `settings.yaml` from `config_dir` and wire up
/// a stdio-backed pool and orchestrator.
pub fn build_orchestrator(config_dir: &Path) -> Result<Orchestrator, SetupError> {
    let servers = config::load_servers_config(config_dir)?;
    let settings = config::load_settings(config_dir)?;

    tracing::info!(
        config_dir = %config_dir.display(),
        servers = ?servers.servers.keys().collect::<Vec<_>>(),
        "loaded tool server config"
    );

    let connector = Arc::new(StdioConnector::new(&settings.pool));
    let pool = Arc::new(ConnectionPool::new(servers, connector, settings.pool.clone()));
    Ok(Orchestrator::new(pool, &settings)?)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_rotate_log_file_shifts_and_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("toolgather.log");
        for (name, body) in [
            ("toolgather.log", "current"),
            ("toolgather.log.1", "one"),
            ("toolgather.log.2", "two"),
            ("toolgather.log.3", "three"),
        ] {
            std::fs::write(dir.path().join(name), body).unwrap();
        }

        rotate_log_file(&base, 3);

        assert!(!base.exists());
        let read = |name: &str| std::fs::read_to_string(dir.path().join(name)).unwrap();
        assert_eq!(read("toolgather.log.1"), "current");
        assert_eq!(read("toolgather.log.2"), "one");
        assert_eq!(read("toolgather.log.3"), "two");
    }

    #[test]
    fn test_flushing_writer_persists_each_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = FlushingWriter::new(file);
        writer.write_all(b"first line\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first line\n");
    }

    #[test]
    fn test_build_orchestrator_reads_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("mcp_servers.json"),
            r#"{"servers": {"atlassian": {"command": "atlassian-mcp", "args": []}}}"#,
        )
        .unwrap();

        let orch = build_orchestrator(dir.path()).unwrap();
        assert!(orch.pool().is_enabled("atlassian"));
        assert_eq!(orch.classify("jira sprint status", None).len(), 1);
        assert!(orch.classify("drive files", None).is_empty());
    }

    #[test]
    fn test_build_orchestrator_missing_servers_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = build_orchestrator(dir.path()).err().unwrap();
        assert!(matches!(err, SetupError::Config(ConfigError::Read { .. })));
    }
}
