//! Per-port artifact cleanup.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::Result;
use crate::paths::{port_from_log_file_name, DataPaths};

/// Remove user-data directories and log files of ports not in `keep`.
/// Returns the removed paths. Entries that fail to delete are logged and skipped.
pub fn sweep_port_artifacts(paths: &DataPaths, keep: &HashSet<u16>) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();

    for entry in top_level_entries(&paths.instances_dir())? {
        let Some(port) = entry
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.parse::<u16>().ok())
        else {
            continue;
        };
        if !entry.is_dir() || keep.contains(&port) {
            continue;
        }
        match std::fs::remove_dir_all(&entry) {
            Ok(()) => removed.push(entry),
            Err(e) => log::warn!("Failed to remove stale user data {:?}: {}", entry, e),
        }
    }

    for entry in top_level_entries(&paths.logs_dir())? {
        let Some(port) = entry
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(port_from_log_file_name)
        else {
            continue;
        };
        if !entry.is_file() || keep.contains(&port) {
            continue;
        }
        match std::fs::remove_file(&entry) {
            Ok(()) => removed.push(entry),
            Err(e) => log::warn!("Failed to remove stale log {:?}: {}", entry, e),
        }
    }

    if !removed.is_empty() {
        log::info!("Removed {} stale per-port artifact(s)", removed.len());
    }
    Ok(removed)
}

fn top_level_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        entries.push(entry?.into_path());
    }
    Ok(entries)
}
