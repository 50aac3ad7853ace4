//! Instance-related type definitions.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::process::OsProcess;

/// Result of a successful start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartOutcome {
    pub repo_id: String,
    pub port: u16,
    pub pid: u32,
    /// Public path under the proxy, e.g. `/code/repoa/`.
    pub path: String,
    pub started_at: DateTime<Utc>,
    /// True when an already running instance was returned unchanged.
    pub reused: bool,
}

/// Result of a stop. Teardown steps that failed are listed in `warnings`;
/// the port and registry entry are released regardless.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopOutcome {
    pub repo_id: String,
    pub port: u16,
    pub pid: u32,
    pub warnings: Vec<String>,
}

/// Status information for one repository's instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceStatus {
    pub repo_id: String,
    pub running: bool,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub path: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub working_directory: Option<PathBuf>,
}

/// Summary of the whole port pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub capacity: usize,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub allocated: usize,
    pub free: usize,
    pub editor_installed: bool,
    pub instances: Vec<InstanceStatus>,
}

/// Answer to a status query, either for one repository or for the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Status {
    Instance(InstanceStatus),
    Pool(PoolStatus),
}

/// A signature-matching OS process, annotated with the repository that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagedProcess {
    #[serde(flatten)]
    pub process: OsProcess,
    pub repo_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KillOutcome {
    pub pid: u32,
    /// Repository whose instance was torn down, if the pid was tracked.
    pub repo_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KillAllReport {
    pub stopped: Vec<String>,
    pub killed_pids: Vec<u32>,
    pub errors: Vec<String>,
}

/// What a reconciliation pass changed. An empty report means state already agreed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Repositories whose recorded process was gone.
    pub stale_instances: Vec<String>,
    pub orphans_killed: Vec<u32>,
    pub released_ports: Vec<u16>,
    pub removed_routes: Vec<String>,
    pub removed_artifacts: Vec<PathBuf>,
    pub reloaded: bool,
    pub errors: Vec<String>,
}

impl ReconcileReport {
    /// True when the pass found nothing to repair.
    pub fn is_clean(&self) -> bool {
        self.stale_instances.is_empty()
            && self.orphans_killed.is_empty()
            && self.released_ports.is_empty()
            && self.removed_routes.is_empty()
            && self.removed_artifacts.is_empty()
            && self.errors.is_empty()
    }
}
