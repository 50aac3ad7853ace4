//! Centralized path utilities for the orchestrator's data directory.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

/// Default root data directory (~/.codedock, or ./.codedock without a home directory).
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".codedock")
}

/// Layout of everything the orchestrator persists under its data directory.
///
/// ```text
/// <root>/codedock.lock                 held by the owning process
/// <root>/ports.json                    port map
/// <root>/registry.json                 instances + repositories
/// <root>/logs/code-server-<port>.log   per-port editor output
/// <root>/instances/<port>/             per-port editor user data
/// <root>/extensions/                   shared editor extensions
/// ```
#[derive(Debug, Clone)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Ensure all required data directories exist.
    pub fn ensure_data_dirs(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.logs_dir(),
            self.instances_dir(),
            self.extensions_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|e| {
                AppError::io(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join("codedock.lock")
    }

    pub fn ports_path(&self) -> PathBuf {
        self.root.join("ports.json")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.root.join("registry.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.root.join("instances")
    }

    pub fn extensions_dir(&self) -> PathBuf {
        self.root.join("extensions")
    }

    /// Log file the editor bound to `port` writes to.
    pub fn log_path(&self, port: u16) -> PathBuf {
        self.logs_dir().join(log_file_name(port))
    }

    /// User-data directory of the editor bound to `port`.
    pub fn instance_dir(&self, port: u16) -> PathBuf {
        self.instances_dir().join(port.to_string())
    }
}

pub fn log_file_name(port: u16) -> String {
    format!("code-server-{}.log", port)
}

/// Recover the port from a per-port log file name.
pub fn port_from_log_file_name(name: &str) -> Option<u16> {
    name.strip_prefix("code-server-")?
        .strip_suffix(".log")?
        .parse()
        .ok()
}
