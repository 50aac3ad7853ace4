//! Bounded pool of editor ports, persisted as a `repo id -> port` map.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::store::JsonStore;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortMap {
    #[serde(default)]
    pub allocations: BTreeMap<String, u16>,
}

/// Allocates ports from `start..start + capacity`.
///
/// All mutations go through the backing [`JsonStore`], which serializes them and
/// persists the map before returning.
pub struct PortAllocator {
    start: u16,
    capacity: usize,
    store: JsonStore<PortMap>,
}

impl PortAllocator {
    pub fn open(path: impl Into<PathBuf>, start: u16, capacity: usize) -> Result<Self> {
        let store = JsonStore::open(path)?;
        let allocator = Self {
            start,
            capacity,
            store,
        };
        allocator.audit_loaded_map();
        Ok(allocator)
    }

    fn audit_loaded_map(&self) {
        let map = self.store.snapshot();
        let range = self.range();
        let mut seen = BTreeSet::new();
        for (repo_id, port) in &map.allocations {
            if !range.contains(port) {
                log::warn!(
                    "Port {} for {} is outside the configured range {:?}",
                    port,
                    repo_id,
                    range
                );
            }
            if !seen.insert(*port) {
                log::error!("Port {} is allocated more than once (seen again for {})", port, repo_id);
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn range(&self) -> RangeInclusive<u16> {
        let last = u32::from(self.start) + self.capacity.saturating_sub(1) as u32;
        self.start..=u16::try_from(last).unwrap_or(u16::MAX)
    }

    /// Return the port held by `repo_id`, reserving the lowest free one if it has none.
    pub fn allocate(&self, repo_id: &str) -> Result<u16> {
        let capacity = self.capacity;
        let range = self.range();
        self.store.with_mut(|map| {
            if let Some(&port) = map.allocations.get(repo_id) {
                return Ok(port);
            }
            if map.allocations.len() >= capacity {
                return Err(AppError::port_exhausted(capacity));
            }
            let taken: BTreeSet<u16> = map.allocations.values().copied().collect();
            let port = range
                .clone()
                .find(|port| !taken.contains(port))
                .ok_or_else(|| AppError::port_exhausted(capacity))?;
            map.allocations.insert(repo_id.to_string(), port);
            log::info!("Allocated port {} to {}", port, repo_id);
            Ok(port)
        })
    }

    /// Drop the mapping for `repo_id`. Releasing an unknown id is a no-op.
    pub fn release(&self, repo_id: &str) -> Result<Option<u16>> {
        if !self.store.snapshot().allocations.contains_key(repo_id) {
            return Ok(None);
        }
        self.store.with_mut(|map| {
            let released = map.allocations.remove(repo_id);
            if let Some(port) = released {
                log::info!("Released port {} from {}", port, repo_id);
            }
            Ok(released)
        })
    }

    pub fn get(&self, repo_id: &str) -> Option<u16> {
        self.store.snapshot().allocations.get(repo_id).copied()
    }

    pub fn owner_of(&self, port: u16) -> Option<String> {
        self.store
            .snapshot()
            .allocations
            .iter()
            .find(|(_, allocated)| **allocated == port)
            .map(|(repo_id, _)| repo_id.clone())
    }

    pub fn list_all(&self) -> Vec<(String, u16)> {
        self.store
            .snapshot()
            .allocations
            .iter()
            .map(|(repo_id, &port)| (repo_id.clone(), port))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;
    use crate::error::ErrorKind;
    use tempfile::tempdir;

    fn make_allocator(capacity: usize) -> (PortAllocator, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let allocator = PortAllocator::open(dir.path().join("ports.json"), 9000, capacity).unwrap();
        (allocator, dir)
    }

    #[test]
    fn allocates_lowest_free_port() {
        let (allocator, _dir) = make_allocator(4);
        assert_eq!(allocator.allocate("a").unwrap(), 9000);
        assert_eq!(allocator.allocate("b").unwrap(), 9001);
        assert_eq!(allocator.allocate("c").unwrap(), 9002);

        allocator.release("b").unwrap();
        assert_eq!(allocator.allocate("d").unwrap(), 9001);
    }

    #[test]
    fn allocate_is_idempotent() {
        let (allocator, _dir) = make_allocator(4);
        let first = allocator.allocate("a").unwrap();
        let second = allocator.allocate("a").unwrap();
        assert_eq!(first, second);
        assert_eq!(allocator.list_all().len(), 1);
    }

    #[test]
    fn exhaustion_leaves_allocations_untouched() {
        let (allocator, _dir) = make_allocator(2);
        allocator.allocate("a").unwrap();
        allocator.allocate("b").unwrap();

        let err = allocator.allocate("c").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PortExhausted);
        assert_eq!(
            allocator.list_all(),
            vec![("a".to_string(), 9000), ("b".to_string(), 9001)]
        );
        assert_eq!(allocator.get("c"), None);
    }

    #[test]
    fn release_of_unknown_id_is_noop() {
        let (allocator, _dir) = make_allocator(2);
        assert_eq!(allocator.release("ghost").unwrap(), None);
        allocator.allocate("a").unwrap();
        assert_eq!(allocator.release("a").unwrap(), Some(9000));
        assert_eq!(allocator.release("a").unwrap(), None);
    }

    #[test]
    fn allocations_survive_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ports.json");
        {
            let allocator = PortAllocator::open(&path, 9000, 3).unwrap();
            allocator.allocate("a").unwrap();
            allocator.allocate("b").unwrap();
            allocator.release("a").unwrap();
        }
        let allocator = PortAllocator::open(&path, 9000, 3).unwrap();
        assert_eq!(allocator.get("a"), None);
        assert_eq!(allocator.get("b"), Some(9001));
        assert_eq!(allocator.owner_of(9001).as_deref(), Some("b"));
        assert_eq!(allocator.allocate("c").unwrap(), 9000);
    }

    #[test]
    fn concurrent_allocations_are_unique() {
        let (allocator, _dir) = make_allocator(12);
        let allocator = Arc::new(allocator);

        let handles: Vec<_> = (0..12)
            .map(|i| {
                let allocator = Arc::clone(&allocator);
                std::thread::spawn(move || allocator.allocate(&format!("repo-{i}")).unwrap())
            })
            .collect();
        let ports: HashSet<u16> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(ports.len(), 12);
        assert!(ports.iter().all(|p| allocator.range().contains(p)));
        assert_eq!(
            allocator.allocate("one-more").unwrap_err().kind(),
            ErrorKind::PortExhausted
        );
    }
}
