//! Instance lifecycle management (start/stop/status).

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, RwLock};

use super::types::{InstanceStatus, PoolStatus, StartOutcome, Status, StopOutcome};
use crate::config::Settings;
use crate::error::{AppError, Result};
use crate::lock::DataDirLock;
use crate::paths::DataPaths;
use crate::ports::PortAllocator;
use crate::process::{CodeServerLauncher, ProcessControl};
use crate::proxy::{public_path, NginxProxy, ProxyControl};
use crate::registry::{Instance, InstanceRegistry, Repository};
use crate::validation::{route_name, validate_repo_id};

/// Start steps that completed, undone in reverse when a later step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Provisioned {
    /// The fragment of a dead instance was deleted but the proxy not yet reloaded.
    StaleRouteRemoved,
    Port,
    Process(u32),
    Fragment,
    Reloaded,
}

/// Coordinates the port pool, the editor processes, the proxy and the registry.
///
/// Start and stop of one route are serialized by a per-route lock and
/// share the maintenance lock for reading; reconciliation and bulk kills take
/// the maintenance lock for writing, so they never observe a half-started instance.
pub struct Orchestrator {
    pub(super) namespace: String,
    pub(super) paths: DataPaths,
    pub(super) ports: PortAllocator,
    pub(super) registry: InstanceRegistry,
    pub(super) process: Arc<dyn ProcessControl>,
    pub(super) proxy: Arc<dyn ProxyControl>,
    repo_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    pub(super) maintenance: RwLock<()>,
    _data_lock: Option<DataDirLock>,
}

impl Orchestrator {
    pub fn new(
        namespace: impl Into<String>,
        paths: DataPaths,
        ports: PortAllocator,
        registry: InstanceRegistry,
        process: Arc<dyn ProcessControl>,
        proxy: Arc<dyn ProxyControl>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            paths,
            ports,
            registry,
            process,
            proxy,
            repo_locks: Mutex::new(HashMap::new()),
            maintenance: RwLock::new(()),
            _data_lock: None,
        }
    }

    /// Build the production orchestrator: code-server processes behind nginx,
    /// with state under `settings.data_dir`. The data directory stays locked
    /// for the lifetime of the orchestrator.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let paths = DataPaths::new(&settings.data_dir);
        paths.ensure_data_dirs()?;
        let data_lock = DataDirLock::acquire(&paths)?;
        let ports = PortAllocator::open(
            paths.ports_path(),
            settings.ports.start,
            settings.ports.capacity,
        )?;
        let registry = InstanceRegistry::open(paths.registry_path())?;
        let launcher = CodeServerLauncher::new(settings.editor.clone(), paths.clone())?;
        let proxy = NginxProxy::new(settings.proxy.clone());

        Ok(Self {
            _data_lock: Some(data_lock),
            ..Self::new(
                settings.proxy.namespace.clone(),
                paths,
                ports,
                registry,
                Arc::new(launcher),
                Arc::new(proxy),
            )
        })
    }

    /// Lock shared by every repository id that maps to the same route, so
    /// colliding ids are serialized and the second one sees the first's instance.
    /// Entries nobody holds are pruned on the way in.
    fn repo_lock(&self, repo_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.repo_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(route_name(repo_id)).or_default())
    }

    /// Ensure an editor is serving `repo_id` and reachable through the proxy.
    ///
    /// Idempotent: a live instance is returned as is with `reused` set. On any
    /// failure every step that already completed is undone before the error
    /// is returned.
    pub async fn start(&self, repo_id: &str) -> Result<StartOutcome> {
        validate_repo_id(repo_id)?;
        let _maintenance = self.maintenance.read().await;
        let lock = self.repo_lock(repo_id);
        let _guard = lock.lock().await;

        let repository = self
            .registry
            .get_repository(repo_id)
            .ok_or_else(|| AppError::repository_not_found(repo_id))?;

        let mut done = Vec::new();
        if let Some(existing) = self.registry.get(repo_id) {
            if self.process.is_running(existing.pid) {
                log::info!(
                    "Instance for {} already running (pid: {}, port: {})",
                    repo_id,
                    existing.pid,
                    existing.port
                );
                return Ok(self.outcome(&existing, true));
            }
            log::warn!(
                "Instance for {} (pid {}) is no longer running, clearing it",
                repo_id,
                existing.pid
            );
            self.clear_dangling(repo_id)?;
            done.push(Provisioned::StaleRouteRemoved);
        }

        if let Err(err) = self.ensure_route_free(repo_id) {
            self.roll_back(repo_id, done, &err).await;
            return Err(err);
        }

        let provisioned = self.provision(repo_id, &repository.path, &mut done).await;
        match provisioned {
            Ok(instance) => {
                log::info!(
                    "Started {} on port {} (pid: {}) at {}",
                    repo_id,
                    instance.port,
                    instance.pid,
                    public_path(&self.namespace, repo_id)
                );
                Ok(self.outcome(&instance, false))
            }
            Err(err) => {
                self.roll_back(repo_id, done, &err).await;
                Err(err)
            }
        }
    }

    async fn provision(
        &self,
        repo_id: &str,
        working_dir: &Path,
        done: &mut Vec<Provisioned>,
    ) -> Result<Instance> {
        let port = self.ports.allocate(repo_id)?;
        done.push(Provisioned::Port);

        let pid = self.process.start(repo_id, working_dir, port).await?;
        done.push(Provisioned::Process(pid));

        self.proxy.write_config(repo_id, port, working_dir)?;
        done.push(Provisioned::Fragment);

        self.proxy.reload().await?;
        done.push(Provisioned::Reloaded);

        let instance = Instance {
            repo_id: repo_id.to_string(),
            port,
            pid,
            started_at: Utc::now(),
            working_directory: working_dir.to_path_buf(),
        };
        self.registry.mark_running(instance.clone())?;
        Ok(instance)
    }

    /// Undo completed start steps newest first. The process is stopped before
    /// its port goes back to the pool.
    async fn roll_back(&self, repo_id: &str, done: Vec<Provisioned>, cause: &AppError) {
        log::warn!(
            "Start of {} failed ({}), undoing {} step(s)",
            repo_id,
            cause,
            done.len()
        );
        let route_applied = done.contains(&Provisioned::Reloaded);
        for step in done.into_iter().rev() {
            self.undo(repo_id, step, route_applied).await;
        }
    }

    async fn undo(&self, repo_id: &str, step: Provisioned, route_applied: bool) {
        match step {
            Provisioned::Reloaded => {}
            Provisioned::Fragment => {
                if let Err(e) = self.proxy.remove_config(repo_id) {
                    log::error!("Rollback: failed to remove route for {}: {}", repo_id, e);
                } else if route_applied {
                    self.reload_after_rollback(repo_id).await;
                }
            }
            Provisioned::Process(pid) => {
                if let Err(e) = self.process.stop(repo_id, pid).await {
                    log::error!("Rollback: failed to stop pid {} for {}: {}", pid, repo_id, e);
                }
            }
            Provisioned::Port => {
                if let Err(e) = self.ports.release(repo_id) {
                    log::error!("Rollback: failed to release port of {}: {}", repo_id, e);
                }
            }
            // A reload during the fragment undo already dropped the stale route.
            Provisioned::StaleRouteRemoved => {
                if !route_applied {
                    self.reload_after_rollback(repo_id).await;
                }
            }
        }
    }

    async fn reload_after_rollback(&self, repo_id: &str) {
        if let Err(e) = self.proxy.reload().await {
            log::error!("Rollback: proxy reload for {} failed: {}", repo_id, e);
        }
    }

    /// Forget an instance whose process is gone so it can be started afresh.
    fn clear_dangling(&self, repo_id: &str) -> Result<()> {
        if let Err(e) = self.proxy.remove_config(repo_id) {
            log::warn!("Failed to remove stale route for {}: {}", repo_id, e);
        }
        self.ports.release(repo_id)?;
        self.registry.mark_stopped(repo_id)?;
        Ok(())
    }

    fn ensure_route_free(&self, repo_id: &str) -> Result<()> {
        let route = route_name(repo_id);
        match self
            .registry
            .list_all()
            .into_iter()
            .find(|i| i.repo_id != repo_id && route_name(&i.repo_id) == route)
        {
            Some(owner) => Err(AppError::route_conflict(&route, &owner.repo_id)),
            None => Ok(()),
        }
    }

    fn outcome(&self, instance: &Instance, reused: bool) -> StartOutcome {
        StartOutcome {
            repo_id: instance.repo_id.clone(),
            port: instance.port,
            pid: instance.pid,
            path: public_path(&self.namespace, &instance.repo_id),
            started_at: instance.started_at,
            reused,
        }
    }

    /// Stop the editor for `repo_id` and release everything it held.
    pub async fn stop(&self, repo_id: &str) -> Result<StopOutcome> {
        validate_repo_id(repo_id)?;
        let _maintenance = self.maintenance.read().await;
        let lock = self.repo_lock(repo_id);
        let _guard = lock.lock().await;

        let instance = self
            .registry
            .get(repo_id)
            .ok_or_else(|| AppError::instance_not_found(repo_id))?;
        self.teardown(&instance).await
    }

    /// Best-effort teardown. Process and route failures become warnings; the port
    /// release and registry update always run.
    pub(super) async fn teardown(&self, instance: &Instance) -> Result<StopOutcome> {
        let repo_id = instance.repo_id.as_str();
        let mut warnings = Vec::new();

        if let Err(e) = self.process.stop(repo_id, instance.pid).await {
            log::error!("Failed to stop editor for {}: {}", repo_id, e);
            warnings.push(format!("stop process: {}", e));
        }
        match self.proxy.remove_config(repo_id) {
            Ok(()) => {
                if let Err(e) = self.proxy.reload().await {
                    log::warn!("Proxy reload after removing {} failed: {}", repo_id, e);
                    warnings.push(format!("reload proxy: {}", e));
                }
            }
            Err(e) => {
                log::error!("Failed to remove route for {}: {}", repo_id, e);
                warnings.push(format!("remove route: {}", e));
            }
        }

        let released = self.ports.release(repo_id);
        let marked = self.registry.mark_stopped(repo_id);
        released?;
        marked?;

        log::info!("Stopped {} (port {} released)", repo_id, instance.port);
        Ok(StopOutcome {
            repo_id: repo_id.to_string(),
            port: instance.port,
            pid: instance.pid,
            warnings,
        })
    }

    /// Status of one repository, or of the whole pool when `repo_id` is `None`.
    pub fn status(&self, repo_id: Option<&str>) -> Result<Status> {
        match repo_id {
            Some(repo_id) => self.instance_status(repo_id).map(Status::Instance),
            None => Ok(Status::Pool(self.pool_status())),
        }
    }

    pub fn instance_status(&self, repo_id: &str) -> Result<InstanceStatus> {
        validate_repo_id(repo_id)?;
        if let Some(instance) = self.registry.get(repo_id) {
            return Ok(self.describe(&instance));
        }
        if self.registry.get_repository(repo_id).is_none() {
            return Err(AppError::repository_not_found(repo_id));
        }
        Ok(InstanceStatus {
            repo_id: repo_id.to_string(),
            running: false,
            port: None,
            pid: None,
            path: None,
            started_at: None,
            working_directory: None,
        })
    }

    pub fn list_instances(&self) -> Vec<InstanceStatus> {
        self.registry
            .list_all()
            .iter()
            .map(|instance| self.describe(instance))
            .collect()
    }

    pub fn pool_status(&self) -> PoolStatus {
        let range = self.ports.range();
        let capacity = self.ports.capacity();
        let allocated = self.ports.list_all().len();
        PoolStatus {
            capacity,
            port_range_start: *range.start(),
            port_range_end: *range.end(),
            allocated,
            free: capacity.saturating_sub(allocated),
            editor_installed: self.process.is_installed(),
            instances: self.list_instances(),
        }
    }

    fn describe(&self, instance: &Instance) -> InstanceStatus {
        InstanceStatus {
            repo_id: instance.repo_id.clone(),
            running: self.process.is_running(instance.pid),
            port: Some(instance.port),
            pid: Some(instance.pid),
            path: Some(public_path(&self.namespace, &instance.repo_id)),
            started_at: Some(instance.started_at),
            working_directory: Some(instance.working_directory.clone()),
        }
    }

    /// Register a repository or update its name and path.
    pub fn register_repository(&self, repository: Repository) -> Result<Repository> {
        validate_repo_id(&repository.id)?;
        if !repository.path.is_absolute() {
            return Err(AppError::config(format!(
                "repository path {} must be absolute",
                repository.path.display()
            )));
        }
        let repository = if repository.name.trim().is_empty() {
            Repository {
                name: repository.id.clone(),
                ..repository
            }
        } else {
            repository
        };
        let stored = self.registry.upsert_repository(repository)?;
        log::info!("Registered repository {} at {}", stored.id, stored.path.display());
        Ok(stored)
    }

    /// Remove a repository. Refused while its editor is running.
    pub async fn remove_repository(&self, repo_id: &str) -> Result<Repository> {
        validate_repo_id(repo_id)?;
        let _maintenance = self.maintenance.read().await;
        let lock = self.repo_lock(repo_id);
        let _guard = lock.lock().await;

        if let Some(instance) = self.registry.get(repo_id) {
            if self.process.is_running(instance.pid) {
                return Err(AppError::instance_running(repo_id));
            }
            self.clear_dangling(repo_id)?;
            if let Err(e) = self.proxy.reload().await {
                log::warn!("Proxy reload after clearing {} failed: {}", repo_id, e);
            }
        }
        let removed = self
            .registry
            .remove_repository(repo_id)?
            .ok_or_else(|| AppError::repository_not_found(repo_id))?;
        log::info!("Removed repository {}", repo_id);
        Ok(removed)
    }

    pub fn list_repositories(&self) -> Vec<Repository> {
        self.registry.list_repositories()
    }
}
