//! Exclusive ownership of a data directory across processes.

use std::fs::{File, OpenOptions};
use std::io::{Read as _, Seek as _, SeekFrom, Write as _};

use fs2::FileExt;

use crate::error::{AppError, Result};
use crate::paths::DataPaths;

/// Advisory lock on `<data_dir>/codedock.lock`, released when dropped.
///
/// Port and registry documents are cached in memory by their owner, so only
/// one process may mutate a data directory at a time.
#[derive(Debug)]
pub struct DataDirLock {
    file: File,
}

impl DataDirLock {
    /// Take the lock without blocking. Fails with `DataDirBusy` when another
    /// process holds it.
    pub fn acquire(paths: &DataPaths) -> Result<Self> {
        let lock_path = paths.lock_path();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| {
                AppError::io(format!("Failed to open {}: {}", lock_path.display(), e))
            })?;

        if let Err(e) = file.try_lock_exclusive() {
            log::debug!("Lock on {} not acquired: {}", lock_path.display(), e);
            return Err(AppError::data_dir_busy(paths.root(), read_owner(&mut file)));
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        log::debug!("Acquired {}", lock_path.display());
        Ok(Self { file })
    }
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            log::warn!("Failed to release data directory lock: {}", e);
        }
    }
}

fn read_owner(file: &mut File) -> Option<u32> {
    let mut content = String::new();
    file.read_to_string(&mut content).ok()?;
    content.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn second_owner_is_refused_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path());

        let held = DataDirLock::acquire(&paths).unwrap();
        let err = DataDirLock::acquire(&paths).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DataDirBusy);
        assert_eq!(
            err.payload().get("owner_pid").map(String::as_str),
            Some(std::process::id().to_string().as_str())
        );

        drop(held);
        DataDirLock::acquire(&paths).unwrap();
    }
}
