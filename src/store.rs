//! File-backed keyed state with write-through, atomic replace semantics.

use std::fs::{self, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{AppError, Result};

/// A JSON document persisted at `path`.
///
/// Readers get a cheap snapshot. Writers go through [`JsonStore::with_mut`], which
/// serializes mutations, persists the new document and only then publishes it,
/// so a failed write leaves both the file and the in-memory copy untouched.
pub struct JsonStore<T> {
    path: PathBuf,
    write_lock: Mutex<()>,
    cache: RwLock<Arc<T>>,
}

impl<T> JsonStore<T>
where
    T: Serialize + DeserializeOwned + Default + Clone,
{
    /// Open the store, starting from `T::default()` when the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let value = read_document(&path)?;
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
            cache: RwLock::new(Arc::new(value)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Arc<T> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&cache)
    }

    /// Execute a read-modify-write operation while holding the store lock.
    /// The closure's error aborts the write; nothing is persisted in that case.
    pub fn with_mut<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut T) -> Result<R>,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut updated = (*self.snapshot()).clone();
        let result = f(&mut updated)?;
        let content = serde_json::to_vec_pretty(&updated)?;
        write_atomic(&self.path, &content)?;

        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(updated);

        Ok(result)
    }
}

fn read_document<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let content = fs::read(path)
        .map_err(|e| AppError::store(format!("Failed to read {}: {}", path.display(), e)))?;
    if content.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(&content)
        .map_err(|e| AppError::store(format!("Failed to parse {}: {}", path.display(), e)))
}

/// Write `content` to a sibling temp file, fsync it, then rename over `path`.
pub(crate) fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .map_err(|e| AppError::store(format!("Failed to create {}: {}", parent.display(), e)))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| AppError::store(format!("Invalid store path {}", path.display())))?;
    let tmp = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    let written = File::create(&tmp).and_then(|mut file| {
        file.write_all(content)?;
        file.sync_all()
    });
    let result = written.and_then(|()| fs::rename(&tmp, path));

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(AppError::store(format!(
            "Failed to write {}: {}",
            path.display(),
            e
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use tempfile::tempdir;

    type Doc = BTreeMap<String, u16>;

    #[test]
    fn missing_file_opens_empty() {
        let dir = tempdir().unwrap();
        let store: JsonStore<Doc> = JsonStore::open(dir.path().join("doc.json")).unwrap();
        assert!(store.snapshot().is_empty());
        assert!(!store.path().exists());
    }

    #[test]
    fn mutations_are_written_through() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let store: JsonStore<Doc> = JsonStore::open(&path).unwrap();

        store
            .with_mut(|doc| {
                doc.insert("a".to_string(), 9000);
                Ok(())
            })
            .unwrap();

        let reopened: JsonStore<Doc> = JsonStore::open(&path).unwrap();
        assert_eq!(reopened.snapshot().get("a"), Some(&9000));
    }

    #[test]
    fn failed_closure_leaves_state_untouched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let store: JsonStore<Doc> = JsonStore::open(&path).unwrap();
        store
            .with_mut(|doc| {
                doc.insert("a".to_string(), 9000);
                Ok(())
            })
            .unwrap();

        let result: Result<()> = store.with_mut(|doc| {
            doc.insert("b".to_string(), 9001);
            Err(AppError::other("abort"))
        });
        assert!(result.is_err());
        assert!(!store.snapshot().contains_key("b"));

        let reopened: JsonStore<Doc> = JsonStore::open(&path).unwrap();
        assert!(!reopened.snapshot().contains_key("b"));
    }

    #[test]
    fn no_temp_files_left_behind() {
        let dir = tempdir().unwrap();
        let store: JsonStore<Doc> = JsonStore::open(dir.path().join("doc.json")).unwrap();
        for port in 9000..9005 {
            store
                .with_mut(|doc| {
                    doc.insert(port.to_string(), port);
                    Ok(())
                })
                .unwrap();
        }
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["doc.json".to_string()]);
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");
        fs::write(&path, "{ not json").unwrap();
        let err = JsonStore::<Doc>::open(&path).err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::Store);
    }
}
