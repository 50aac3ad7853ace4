//! Persisted instance metadata and the orchestrator-owned repository fields.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::JsonStore;

/// One running editor server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub repo_id: String,
    pub port: u16,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub working_directory: PathBuf,
}

/// Repository record. `vscode_running` and `port` are written only by the
/// orchestrator; the remaining fields belong to whoever registers the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub vscode_running: bool,
    #[serde(default)]
    pub port: Option<u16>,
}

impl Repository {
    pub fn new(id: impl Into<String>, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            path: path.into(),
            vscode_running: false,
            port: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryDocument {
    #[serde(default)]
    pub instances: BTreeMap<String, Instance>,
    #[serde(default)]
    pub repositories: BTreeMap<String, Repository>,
}

/// Pure data access over `registry.json`; no process or network side effects.
pub struct InstanceRegistry {
    store: JsonStore<RegistryDocument>,
}

impl InstanceRegistry {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            store: JsonStore::open(path)?,
        })
    }

    /// Record `instance` as running and mirror its port onto the repository.
    pub fn mark_running(&self, instance: Instance) -> Result<()> {
        self.store.with_mut(move |doc| {
            if let Some(repo) = doc.repositories.get_mut(&instance.repo_id) {
                repo.vscode_running = true;
                repo.port = Some(instance.port);
            }
            log::info!(
                "Registry: {} running (pid: {}, port: {})",
                instance.repo_id,
                instance.pid,
                instance.port
            );
            doc.instances.insert(instance.repo_id.clone(), instance);
            Ok(())
        })
    }

    /// Remove the instance for `repo_id` and clear the mirrored repository fields.
    pub fn mark_stopped(&self, repo_id: &str) -> Result<Option<Instance>> {
        let snapshot = self.store.snapshot();
        let mirrored = snapshot
            .repositories
            .get(repo_id)
            .is_some_and(|r| r.vscode_running || r.port.is_some());
        if !snapshot.instances.contains_key(repo_id) && !mirrored {
            return Ok(None);
        }
        self.store.with_mut(|doc| {
            if let Some(repo) = doc.repositories.get_mut(repo_id) {
                repo.vscode_running = false;
                repo.port = None;
            }
            let removed = doc.instances.remove(repo_id);
            log::info!("Registry: {} stopped", repo_id);
            Ok(removed)
        })
    }

    pub fn get(&self, repo_id: &str) -> Option<Instance> {
        self.store.snapshot().instances.get(repo_id).cloned()
    }

    pub fn list_all(&self) -> Vec<Instance> {
        self.store.snapshot().instances.values().cloned().collect()
    }

    /// Insert or update a repository, keeping the orchestrator-owned fields as they are.
    pub fn upsert_repository(&self, repository: Repository) -> Result<Repository> {
        self.store.with_mut(move |doc| {
            let stored = match doc.repositories.get_mut(&repository.id) {
                Some(existing) => {
                    existing.name = repository.name;
                    existing.path = repository.path;
                    existing.clone()
                }
                None => {
                    let fresh = Repository {
                        vscode_running: false,
                        port: None,
                        ..repository
                    };
                    doc.repositories.insert(fresh.id.clone(), fresh.clone());
                    fresh
                }
            };
            Ok(stored)
        })
    }

    pub fn remove_repository(&self, repo_id: &str) -> Result<Option<Repository>> {
        if !self.store.snapshot().repositories.contains_key(repo_id) {
            return Ok(None);
        }
        self.store
            .with_mut(|doc| Ok(doc.repositories.remove(repo_id)))
    }

    pub fn get_repository(&self, repo_id: &str) -> Option<Repository> {
        self.store.snapshot().repositories.get(repo_id).cloned()
    }

    pub fn list_repositories(&self) -> Vec<Repository> {
        self.store.snapshot().repositories.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_registry() -> (InstanceRegistry, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let registry = InstanceRegistry::open(dir.path().join("registry.json")).unwrap();
        (registry, dir)
    }

    fn instance(repo_id: &str, port: u16, pid: u32) -> Instance {
        Instance {
            repo_id: repo_id.to_string(),
            port,
            pid,
            started_at: Utc::now(),
            working_directory: PathBuf::from("/srv/repos").join(repo_id),
        }
    }

    #[test]
    fn mark_running_mirrors_repository_fields() {
        let (registry, _dir) = make_registry();
        registry
            .upsert_repository(Repository::new("a", "Repo A", "/srv/repos/a"))
            .unwrap();

        registry.mark_running(instance("a", 9000, 4242)).unwrap();

        let repo = registry.get_repository("a").unwrap();
        assert!(repo.vscode_running);
        assert_eq!(repo.port, Some(9000));
        assert_eq!(registry.get("a").unwrap().pid, 4242);
    }

    #[test]
    fn mark_stopped_clears_instance_and_mirror() {
        let (registry, _dir) = make_registry();
        registry
            .upsert_repository(Repository::new("a", "Repo A", "/srv/repos/a"))
            .unwrap();
        registry.mark_running(instance("a", 9000, 4242)).unwrap();

        let removed = registry.mark_stopped("a").unwrap();
        assert_eq!(removed.map(|i| i.pid), Some(4242));
        assert!(registry.get("a").is_none());
        let repo = registry.get_repository("a").unwrap();
        assert!(!repo.vscode_running);
        assert_eq!(repo.port, None);

        assert!(registry.mark_stopped("a").unwrap().is_none());
    }

    #[test]
    fn upsert_keeps_orchestrator_fields() {
        let (registry, _dir) = make_registry();
        registry
            .upsert_repository(Repository::new("a", "Repo A", "/srv/repos/a"))
            .unwrap();
        registry.mark_running(instance("a", 9000, 1)).unwrap();

        let mut renamed = Repository::new("a", "Renamed", "/srv/repos/a2");
        renamed.vscode_running = false;
        let stored = registry.upsert_repository(renamed).unwrap();

        assert_eq!(stored.name, "Renamed");
        assert!(stored.vscode_running);
        assert_eq!(stored.port, Some(9000));
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry.json");
        {
            let registry = InstanceRegistry::open(&path).unwrap();
            registry.mark_running(instance("a", 9000, 11)).unwrap();
            registry.mark_running(instance("b", 9001, 12)).unwrap();
        }
        let registry = InstanceRegistry::open(&path).unwrap();
        let ids: Vec<String> = registry.list_all().into_iter().map(|i| i.repo_id).collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }
}
