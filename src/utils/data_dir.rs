//! Global data directory for persistent storage.
//!
//! Defaults to `~/.peerdrop/` but can be overridden via `--conf`.
//! Initialized once at startup via `init()`; later calls keep the first value.

use anyhow::{Result, anyhow};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Initialize the global data directory and create it on disk.
pub fn init(custom: Option<&Path>) -> Result<&'static Path> {
    let dir = match custom {
        Some(p) => p.to_path_buf(),
        None => dirs::home_dir()
            .ok_or_else(|| anyhow!("No home directory found"))?
            .join(".peerdrop"),
    };
    std::fs::create_dir_all(&dir)?;
    Ok(DATA_DIR.get_or_init(|| dir).as_path())
}

/// Returns the data directory, falling back to the system temp dir if
/// `init()` was never called (unit tests).
pub fn get() -> &'static Path {
    DATA_DIR
        .get_or_init(|| std::env::temp_dir().join("peerdrop"))
        .as_path()
}
