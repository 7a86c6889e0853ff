use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use fs2::FileExt;
use once_cell::sync::Lazy;

use crate::core::errors::{Error, PoisonedLockExt, Result};

/// Per-collection state: the in-process reader/writer latch plus the
/// advisory cross-process file lock.
///
/// Readers never touch `lock_file` — within one process the `latch` already
/// excludes concurrent writers, and a full-file read observes a consistent
/// snapshot because writes land via atomic rename. The advisory lock exists
/// purely to exclude *other processes*.
pub struct CollectionHandle {
    pub latch: RwLock<()>,
    lock_file: File,
}

impl CollectionHandle {
    /// Acquires the advisory exclusive lock, blocking until available.
    pub fn lock_exclusive(&self, collection: &str) -> Result<()> {
        self.lock_file
            .lock_exclusive()
            .map_err(|e| Error::LockFailure {
                collection: collection.to_string(),
                reason: e.to_string(),
            })
    }

    pub fn unlock(&self, collection: &str) -> Result<()> {
        self.lock_file.unlock().map_err(|e| Error::LockFailure {
            collection: collection.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Process-wide registry of open `.lock` file handles, keyed by the
/// canonical lock-file path so two `Database`s pointed at the same data
/// directory (or the same `Database` opening a collection twice) never
/// re-enter the advisory lock from within the same process.
static REGISTRY: Lazy<Mutex<HashMap<PathBuf, Arc<CollectionHandle>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub fn handle_for(lock_path: &Path) -> Result<Arc<CollectionHandle>> {
    let mut registry = REGISTRY.lock().recover_poison();
    if let Some(existing) = registry.get(lock_path) {
        return Ok(Arc::clone(existing));
    }

    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(lock_path)
        .map_err(Error::Io)?;

    let handle = Arc::new(CollectionHandle {
        latch: RwLock::new(()),
        lock_file,
    });
    registry.insert(lock_path.to_path_buf(), Arc::clone(&handle));
    Ok(handle)
}

/// Drops every entry for lock files under `data_dir`, releasing the
/// advisory locks. Called by `StorageEngine::close`.
pub fn release_under(data_dir: &Path) {
    let mut registry = REGISTRY.lock().recover_poison();
    registry.retain(|path, _| !path.starts_with(data_dir));
}
