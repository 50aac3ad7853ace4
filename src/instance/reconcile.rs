//! Maintenance operations: crash reconciliation and bulk kills.

use std::collections::HashSet;

use super::cleanup::sweep_port_artifacts;
use super::lifecycle::Orchestrator;
use super::types::{KillAllReport, KillOutcome, ManagedProcess, ReconcileReport};
use crate::error::{AppError, Result};
use crate::process::OsProcess;
use crate::registry::Instance;
use crate::validation::route_name;

/// The instance `process` belongs to: its leader, a member of its process group,
/// or, when the group is unknown, the process bound to its port.
fn owning_instance<'a>(process: &OsProcess, instances: &'a [Instance]) -> Option<&'a Instance> {
    instances.iter().find(|instance| {
        process.pid == instance.pid
            || process.pgid == Some(instance.pid)
            || (process.pgid.is_none() && process.port == Some(instance.port))
    })
}

impl Orchestrator {
    /// Bring persisted state, OS processes and proxy fragments back into agreement.
    ///
    /// Never terminates a process owned by a live registry entry. Safe to run at
    /// any time; a second run right after the first reports nothing.
    pub async fn reconcile(&self) -> ReconcileReport {
        let _maintenance = self.maintenance.write().await;
        let mut report = ReconcileReport::default();

        let mut routes_changed = self.clear_stale_instances(&mut report);
        let live = self.registry.list_all();
        self.kill_orphans(&live, &mut report).await;
        self.release_unowned_ports(&live, &mut report);
        routes_changed |= self.remove_stray_routes(&live, &mut report);

        let allocated: HashSet<u16> = self.ports.list_all().into_iter().map(|(_, p)| p).collect();
        match sweep_port_artifacts(&self.paths, &allocated) {
            Ok(removed) => report.removed_artifacts = removed,
            Err(e) => report.errors.push(format!("sweep artifacts: {}", e)),
        }

        if routes_changed {
            match self.proxy.reload().await {
                Ok(()) => report.reloaded = true,
                Err(e) => report.errors.push(format!("reload proxy: {}", e)),
            }
        }

        report.released_ports.sort_unstable();
        report.released_ports.dedup();
        if report.is_clean() {
            log::info!("Reconcile: state is consistent");
        } else {
            log::info!("Reconcile finished: {:?}", report);
        }
        report
    }

    /// Mark instances whose process is gone as stopped. Returns whether any
    /// route fragment was removed.
    fn clear_stale_instances(&self, report: &mut ReconcileReport) -> bool {
        let mut routes_changed = false;

        for instance in self.registry.list_all() {
            if self.process.is_running(instance.pid) {
                continue;
            }
            let repo_id = instance.repo_id.as_str();
            log::warn!(
                "Reconcile: instance {} (pid {}) is gone, marking stopped",
                repo_id,
                instance.pid
            );
            report.stale_instances.push(repo_id.to_string());
            match self.proxy.remove_config(repo_id) {
                Ok(()) => routes_changed = true,
                Err(e) => report.errors.push(format!("remove route of {}: {}", repo_id, e)),
            }
            self.release_into(repo_id, report);
            if let Err(e) = self.registry.mark_stopped(repo_id) {
                report.errors.push(format!("mark {} stopped: {}", repo_id, e));
            }
        }

        for repository in self.registry.list_repositories() {
            let mirrored = repository.vscode_running || repository.port.is_some();
            if mirrored && self.registry.get(&repository.id).is_none() {
                if let Err(e) = self.registry.mark_stopped(&repository.id) {
                    report.errors.push(format!("clear {}: {}", repository.id, e));
                }
            }
        }

        routes_changed
    }

    async fn kill_orphans(&self, live: &[Instance], report: &mut ReconcileReport) {
        let processes = match self.process.list_processes() {
            Ok(processes) => processes,
            Err(e) => {
                report.errors.push(format!("list processes: {}", e));
                return;
            }
        };
        for process in processes {
            if owning_instance(&process, live).is_some() {
                continue;
            }
            log::warn!(
                "Reconcile: killing orphan editor pid {} (port {:?})",
                process.pid,
                process.port
            );
            match self.process.stop("orphan", process.pid).await {
                Ok(()) => report.orphans_killed.push(process.pid),
                Err(e) => report.errors.push(format!("kill pid {}: {}", process.pid, e)),
            }
        }
    }

    fn release_unowned_ports(&self, live: &[Instance], report: &mut ReconcileReport) {
        for (repo_id, port) in self.ports.list_all() {
            if live.iter().any(|instance| instance.repo_id == repo_id) {
                continue;
            }
            log::warn!("Reconcile: port {} held by {} without an instance", port, repo_id);
            self.release_into(&repo_id, report);
        }
    }

    fn release_into(&self, repo_id: &str, report: &mut ReconcileReport) {
        match self.ports.release(repo_id) {
            Ok(Some(port)) => report.released_ports.push(port),
            Ok(None) => {}
            Err(e) => report.errors.push(format!("release port of {}: {}", repo_id, e)),
        }
    }

    /// Delete fragments no live instance owns. Returns whether any was removed.
    fn remove_stray_routes(&self, live: &[Instance], report: &mut ReconcileReport) -> bool {
        let routes = match self.proxy.list_routes() {
            Ok(routes) => routes,
            Err(e) => {
                report.errors.push(format!("list routes: {}", e));
                return false;
            }
        };
        let live_routes: HashSet<String> = live.iter().map(|i| route_name(&i.repo_id)).collect();
        let mut removed_any = false;
        for route in routes.into_iter().filter(|r| !live_routes.contains(r)) {
            log::warn!("Reconcile: removing stray route {}", route);
            match self.proxy.remove_route(&route) {
                Ok(()) => {
                    removed_any = true;
                    report.removed_routes.push(route);
                }
                Err(e) => report.errors.push(format!("remove route {}: {}", route, e)),
            }
        }
        removed_any
    }

    /// Stop every tracked instance, then kill any editor process still alive.
    pub async fn kill_all(&self) -> KillAllReport {
        let _maintenance = self.maintenance.write().await;
        let mut report = KillAllReport::default();

        for instance in self.registry.list_all() {
            match self.teardown(&instance).await {
                Ok(_) => report.stopped.push(instance.repo_id),
                Err(e) => report.errors.push(format!("stop {}: {}", instance.repo_id, e)),
            }
        }

        match self.process.list_processes() {
            Ok(processes) => {
                for process in processes {
                    match self.process.stop("leftover", process.pid).await {
                        Ok(()) => report.killed_pids.push(process.pid),
                        Err(e) => report.errors.push(format!("kill pid {}: {}", process.pid, e)),
                    }
                }
            }
            Err(e) => report.errors.push(format!("list processes: {}", e)),
        }

        log::info!(
            "Kill all: {} instance(s) stopped, {} leftover process(es) killed",
            report.stopped.len(),
            report.killed_pids.len()
        );
        report
    }

    /// Kill one editor process. A tracked pid tears its instance down fully;
    /// a pid that is neither tracked nor an editor process is refused.
    pub async fn kill_by_pid(&self, pid: u32) -> Result<KillOutcome> {
        let _maintenance = self.maintenance.write().await;

        if let Some(instance) = self.registry.list_all().into_iter().find(|i| i.pid == pid) {
            self.teardown(&instance).await?;
            return Ok(KillOutcome {
                pid,
                repo_id: Some(instance.repo_id),
            });
        }

        let live = self.registry.list_all();
        let process = self
            .process
            .list_processes()?
            .into_iter()
            .find(|p| p.pid == pid)
            .ok_or_else(|| AppError::process_not_managed(pid))?;

        if let Some(instance) = owning_instance(&process, &live) {
            log::info!("Killing pid {} of {}", pid, instance.repo_id);
        } else {
            log::info!("Killing untracked editor pid {}", pid);
        }
        self.process.stop("process", pid).await?;
        Ok(KillOutcome { pid, repo_id: None })
    }

    /// Every editor-signature process on the host, with its owning repository.
    pub fn list_os_processes(&self) -> Result<Vec<ManagedProcess>> {
        let live = self.registry.list_all();
        Ok(self
            .process
            .list_processes()?
            .into_iter()
            .map(|process| {
                let repo_id = owning_instance(&process, &live).map(|i| i.repo_id.clone());
                ManagedProcess { process, repo_id }
            })
            .collect())
    }
}
