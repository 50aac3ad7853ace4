//! Editor-server process management.

mod control;
mod health;
mod launcher;
mod scan;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;

pub use control::{check_port_available, force_kill, graceful_shutdown, is_process_alive};
pub use launcher::CodeServerLauncher;
pub use scan::{list_matching_processes, matches_signature, parse_bind_port};

/// Number of log lines attached to a spawn failure.
const LOG_TAIL_LINES: usize = 20;

/// Poll interval while waiting for a signalled process to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A live OS process whose command line matches the editor-server signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OsProcess {
    pub pid: u32,
    pub ppid: Option<u32>,
    pub pgid: Option<u32>,
    /// Port parsed from `--bind-addr`, when present.
    pub port: Option<u16>,
    pub command: String,
}

/// Narrow interface over the editor-server processes on this host.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Whether the editor-server binary resolves on this host.
    fn is_installed(&self) -> bool;

    /// Launch an editor bound to `port` serving `working_dir`, and return its pid
    /// once it accepts connections. A process that does not come up in time is
    /// killed before the error is returned.
    async fn start(&self, name: &str, working_dir: &Path, port: u16) -> Result<u32>;

    /// Liveness by pid existence. Never fails.
    fn is_running(&self, pid: u32) -> bool;

    /// Terminate `pid`. A pid that no longer exists counts as stopped.
    async fn stop(&self, name: &str, pid: u32) -> Result<()>;

    /// Every live process matching the editor-server signature.
    fn list_processes(&self) -> Result<Vec<OsProcess>>;
}
