//! In-memory process and proxy doubles for orchestrator tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use crate::error::{AppError, Result};
use crate::instance::Orchestrator;
use crate::paths::DataPaths;
use crate::ports::PortAllocator;
use crate::process::{OsProcess, ProcessControl};
use crate::proxy::{fragment_file_name, ProxyControl, ProxyRoute};
use crate::registry::{InstanceRegistry, Repository};
use crate::validation::route_name;

const FIRST_FAKE_PID: u32 = 10_000;

/// Process table where "editors" are rows in a map.
pub struct FakeProcesses {
    pub fail_start: AtomicBool,
    pub fail_stop: AtomicBool,
    pub installed: AtomicBool,
    table: Mutex<BTreeMap<u32, OsProcess>>,
    next_pid: AtomicUsize,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl Default for FakeProcesses {
    fn default() -> Self {
        Self {
            fail_start: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            installed: AtomicBool::new(true),
            table: Mutex::new(BTreeMap::new()),
            next_pid: AtomicUsize::new(FIRST_FAKE_PID as usize),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }
}

impl FakeProcesses {
    fn next_pid(&self) -> u32 {
        self.next_pid.fetch_add(1, Ordering::SeqCst) as u32
    }

    /// Add a process the orchestrator did not start. `pgid` defaults to its own pid.
    pub fn spawn_foreign(&self, port: Option<u16>, pgid: Option<u32>) -> u32 {
        let pid = self.next_pid();
        let process = OsProcess {
            pid,
            ppid: Some(1),
            pgid: Some(pgid.unwrap_or(pid)),
            port,
            command: "node /usr/lib/code-server/out/node/entry.js".to_string(),
        };
        self.table.lock().unwrap().insert(pid, process);
        pid
    }

    /// Make `pid` vanish without going through `stop`.
    pub fn crash(&self, pid: u32) {
        self.table.lock().unwrap().remove(&pid);
    }

    pub fn live_pids(&self) -> Vec<u32> {
        self.table.lock().unwrap().keys().copied().collect()
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessControl for FakeProcesses {
    fn is_installed(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
    }

    async fn start(&self, name: &str, _working_dir: &Path, port: u16) -> Result<u32> {
        tokio::task::yield_now().await;
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(AppError::spawn_failure(format!("{} did not listen", name)));
        }
        let mut table = self.table.lock().unwrap();
        if table.values().any(|p| p.port == Some(port)) {
            return Err(AppError::spawn_failure(format!(
                "port {} is already bound by another process",
                port
            )));
        }
        let pid = self.next_pid();
        table.insert(
            pid,
            OsProcess {
                pid,
                ppid: Some(1),
                pgid: Some(pid),
                port: Some(port),
                command: format!("code-server --bind-addr 127.0.0.1:{}", port),
            },
        );
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(pid)
    }

    fn is_running(&self, pid: u32) -> bool {
        self.table.lock().unwrap().contains_key(&pid)
    }

    async fn stop(&self, _name: &str, pid: u32) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(AppError::process(format!("pid {} ignored SIGKILL", pid)));
        }
        self.table
            .lock()
            .unwrap()
            .retain(|_, p| p.pid != pid && p.pgid != Some(pid));
        Ok(())
    }

    fn list_processes(&self) -> Result<Vec<OsProcess>> {
        Ok(self.table.lock().unwrap().values().cloned().collect())
    }
}

/// Proxy whose "configuration" is a map of route to port, applied on reload.
#[derive(Default)]
pub struct FakeProxy {
    pub fail_write: AtomicBool,
    pub fail_reload: AtomicBool,
    pub fail_remove: AtomicBool,
    written: Mutex<BTreeMap<String, u16>>,
    active: Mutex<BTreeMap<String, u16>>,
    reloads: AtomicUsize,
}

impl FakeProxy {
    /// Fragment left behind by something other than a running instance.
    pub fn add_stray(&self, route: &str, port: u16) {
        self.written.lock().unwrap().insert(route.to_string(), port);
    }

    /// Route names with a fragment on "disk".
    pub fn routes(&self) -> Vec<String> {
        self.written.lock().unwrap().keys().cloned().collect()
    }

    /// Routes the proxy is serving, as of the last successful reload.
    pub fn active_routes(&self) -> Vec<(String, u16)> {
        self.active
            .lock()
            .unwrap()
            .iter()
            .map(|(route, port)| (route.clone(), *port))
            .collect()
    }

    pub fn reload_count(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProxyControl for FakeProxy {
    fn write_config(&self, repo_id: &str, port: u16, working_dir: &Path) -> Result<ProxyRoute> {
        if self.fail_write.load(Ordering::SeqCst) {
            return Err(AppError::config_write_failure("read-only file system"));
        }
        let route = route_name(repo_id);
        self.written.lock().unwrap().insert(route.clone(), port);
        Ok(ProxyRoute {
            repo_id: repo_id.to_string(),
            file: PathBuf::from("/fake").join(fragment_file_name(&route)),
            route_name: route,
            port,
            working_directory: working_dir.to_path_buf(),
        })
    }

    fn remove_config(&self, repo_id: &str) -> Result<()> {
        self.remove_route(&route_name(repo_id))
    }

    async fn reload(&self) -> Result<()> {
        tokio::task::yield_now().await;
        if self.fail_reload.load(Ordering::SeqCst) {
            return Err(AppError::reload_failure("configuration test failed"));
        }
        let written = self.written.lock().unwrap().clone();
        *self.active.lock().unwrap() = written;
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn list_routes(&self) -> Result<Vec<String>> {
        Ok(self.routes())
    }

    fn remove_route(&self, route: &str) -> Result<()> {
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(AppError::config_write_failure("permission denied"));
        }
        self.written.lock().unwrap().remove(route);
        Ok(())
    }
}

/// Orchestrator over fakes with a pool starting at 9000 and state in a temp dir.
pub fn make_orchestrator(
    capacity: usize,
) -> (Orchestrator, Arc<FakeProcesses>, Arc<FakeProxy>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let paths = DataPaths::new(dir.path());
    paths.ensure_data_dirs().unwrap();
    let ports = PortAllocator::open(paths.ports_path(), 9000, capacity).unwrap();
    let registry = InstanceRegistry::open(paths.registry_path()).unwrap();
    let processes = Arc::new(FakeProcesses::default());
    let proxy = Arc::new(FakeProxy::default());
    let orchestrator = Orchestrator::new(
        "code",
        paths,
        ports,
        registry,
        Arc::clone(&processes) as Arc<dyn ProcessControl>,
        Arc::clone(&proxy) as Arc<dyn ProxyControl>,
    );
    (orchestrator, processes, proxy, dir)
}

pub fn register(orchestrator: &Orchestrator, repo_id: &str) {
    orchestrator
        .register_repository(Repository::new(
            repo_id,
            repo_id,
            PathBuf::from("/srv/repos").join(repo_id),
        ))
        .unwrap();
}
