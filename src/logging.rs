//! Logging configuration for the sync bridge.
//!
//! Logs go to stderr by default, or to a file when the bridge runs detached.

use crate::error::{BridgeError, Result};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initializes logging to stderr.
pub fn init_stderr_logging() {
    tracing_subscriber::fmt().with_env_filter(env_filter()).init();
}

/// Initializes logging to `path`, appending across restarts.
pub fn init_file_logging(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| {
            BridgeError::config(format!(
                "Could not create log directory {}: {e}",
                parent.display()
            ))
        })?;
    }

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| {
            BridgeError::config(format!("Could not open log file {}: {e}", path.display()))
        })?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(log_file)
        .with_ansi(false)
        .init();

    Ok(())
}

/// Default log file location.
///
/// Uses the XDG state directory on Linux (`~/.local/state/sync-bridge/sync-bridge.log`),
/// or falls back to the config directory on other platforms.
pub fn default_log_path() -> PathBuf {
    if let Some(state_dir) = dirs::state_dir() {
        return state_dir.join("sync-bridge").join("sync-bridge.log");
    }

    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("sync-bridge").join("sync-bridge.log");
    }

    std::env::temp_dir().join("sync-bridge.log")
}
