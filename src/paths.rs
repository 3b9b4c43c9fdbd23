//! Centralized home-based storage paths for daemon persistence.
//!
//! Everything lives under `~/.fswatchd/` (overridable via `FSWATCHD_BASE`):
//! - `sock` - the listening Unix socket
//! - `state.json` - persisted watches and triggers
//! - `debug.log` - file debug log

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

const FSWATCHD_DIR: &str = ".fswatchd";

/// Returns the daemon base directory, creating it if needed.
pub fn base_dir() -> Result<PathBuf> {
    let base = match std::env::var_os("FSWATCHD_BASE") {
        Some(dir) => PathBuf::from(dir),
        None => dirs::home_dir()
            .context("Could not determine home directory")?
            .join(FSWATCHD_DIR),
    };
    fs::create_dir_all(&base)
        .with_context(|| format!("Failed to create base directory: {}", base.display()))?;
    Ok(base)
}

/// Default path of the listening socket: `<base>/sock`
pub fn default_sockname() -> Result<PathBuf> {
    Ok(base_dir()?.join("sock"))
}

/// Default path of the persisted state file: `<base>/state.json`
pub fn default_statefile() -> Result<PathBuf> {
    Ok(base_dir()?.join("state.json"))
}

/// Path of the file debug log: `<base>/debug.log`
pub fn debug_log_path() -> Result<PathBuf> {
    Ok(base_dir()?.join("debug.log"))
}
