pub mod config;
pub mod frontend;
pub mod mcp_client;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use mcp_client::McpSession;

/// Return the platform-standard data directory for mcp-bridge.
///
/// Falls back to `~/.mcp-bridge/` only if no data directory can be resolved.
pub(crate) fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-bridge");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-bridge")
}

/// Initialize the tracing subscriber.
///
/// Logs go to stderr because stdout carries responses. With
/// `MCP_BRIDGE_LOG_FILE=1` they go to `<data_dir>/bridge.log` instead, and
/// the logs of the previous [`LOG_BACKUPS`] runs are kept beside it.
///
/// `LOG_FORMAT=json` switches to one JSON object per line.
pub fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .ok()
        .or_else(|| {
            let level = std::env::var("LOG_LEVEL").ok()?;
            EnvFilter::try_new(level.to_lowercase()).ok()
        })
        .unwrap_or_else(|| EnvFilter::new("mcp_bridge=info,warn"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let log_path = if std::env::var("MCP_BRIDGE_LOG_FILE").is_ok_and(|v| v == "1") {
        let log_dir = data_dir();
        std::fs::create_dir_all(&log_dir)?;
        let log_path = log_dir.join("bridge.log");
        shift_backups(&log_path, LOG_BACKUPS);
        Some(log_path)
    } else {
        None
    };

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false);

    match (&log_path, json) {
        (Some(path), json) => {
            let writer = open_log_writer(path)?;
            if json {
                builder.json().with_writer(writer).try_init()
            } else {
                builder.with_ansi(false).with_writer(writer).try_init()
            }
        }
        (None, true) => builder.json().with_writer(std::io::stderr).try_init(),
        (None, false) => builder.with_writer(std::io::stderr).try_init(),
    }
    .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    // Startup banner
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?log_path.as_ref().map(|p| p.display().to_string()),
        pid = std::process::id(),
        "=== mcp-bridge starting ==="
    );
    Ok(())
}

/// Backups kept of earlier runs' log files.
const LOG_BACKUPS: u32 = 3;

/// `bridge.log` + `n` → `bridge.log.n`.
fn backup_path(log: &Path, n: u32) -> PathBuf {
    let mut name = log.as_os_str().to_owned();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

/// Move each log one slot up (`bridge.log` → `.1`, `.1` → `.2`, ...) so the
/// new run starts with an empty file. Whatever sat in slot `keep` is
/// replaced; missing slots are skipped.
fn shift_backups(log: &Path, keep: u32) {
    for slot in (1..=keep).rev() {
        let from = match slot {
            1 => log.to_path_buf(),
            n => backup_path(log, n - 1),
        };
        if from.exists() {
            // Tracing is not installed yet; a failed shift only costs history.
            let _ = std::fs::rename(&from, backup_path(log, slot));
        }
    }
}

/// Open the log file for appending, behind the mutex the fmt layer locks
/// once per event. `File` is unbuffered, so every event is handed to the OS
/// as soon as it is formatted and survives a crash of the bridge.
fn open_log_writer(path: &Path) -> std::io::Result<std::sync::Mutex<std::fs::File>> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    Ok(std::sync::Mutex::new(file))
}

/// Run the bridge: serve stdin until EOF or a stop signal, then shut the
/// server down.
pub async fn run() -> anyhow::Result<()> {
    init_tracing()?;

    let config = config::resolve_config()?;
    tracing::info!(
        server = %config.name,
        command = %config.command,
        args = ?config.args,
        token = ?config.masked_token(),
        call_timeout_ms = config.call_timeout_ms,
        "bridge configured"
    );

    let session = Arc::new(McpSession::new(config));
    let served = frontend::serve(
        Arc::clone(&session),
        tokio::io::stdin(),
        tokio::io::stdout(),
        shutdown_signal(),
    )
    .await;

    session.shutdown().await;
    let served = served?;
    tracing::info!(served, "=== mcp-bridge stopped ===");
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shift_backups_keeps_last_runs() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("bridge.log");
        for run in 0..5 {
            shift_backups(&log, LOG_BACKUPS);
            std::fs::write(&log, format!("run {run}")).unwrap();
        }
        shift_backups(&log, LOG_BACKUPS);

        assert!(!log.exists());
        for (slot, run) in [(1, 4), (2, 3), (3, 2)] {
            let text = std::fs::read_to_string(backup_path(&log, slot)).unwrap();
            assert_eq!(text, format!("run {run}"));
        }
        assert!(!backup_path(&log, 4).exists());
    }

    #[test]
    fn test_shift_backups_skips_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("bridge.log");
        std::fs::write(backup_path(&log, 2), "old").unwrap();

        shift_backups(&log, LOG_BACKUPS);
        assert_eq!(std::fs::read_to_string(backup_path(&log, 3)).unwrap(), "old");
        assert!(!backup_path(&log, 1).exists());
    }

    #[test]
    fn test_log_writer_appends_each_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.log");
        std::fs::write(&path, "earlier line\n").unwrap();

        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(open_log_writer(&path).unwrap())
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(server = "mock", "server spawned");
        });

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("earlier line\n"), "{text}");
        assert!(text.contains("server spawned"), "{text}");
    }
}
