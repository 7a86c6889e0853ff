use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::core::document::{validate_document_id, Document, DocumentId};
use crate::core::errors::{Error, PoisonedLockExt, Result};

use super::lockfile::{self, CollectionHandle};
use super::record::CollectionFile;

/// What a [`StorageEngine::scan_collection`] visitor returns after each
/// document, mirroring §4.1's "visitor returns continue/stop".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanControl {
    Continue,
    Stop,
}

/// Atomic per-collection file persistence with reader/writer discipline and
/// advisory file locks.
///
/// One `.json` file per collection plus one `.lock` sidecar, laid out
/// directly under `data_dir`. Every mutating call goes through the atomic
/// write protocol in §4.1: writer latch, advisory lock, read-modify-write,
/// write to `.tmp`, fsync, rename.
pub struct StorageEngine {
    data_dir: PathBuf,
}

impl StorageEngine {
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir).map_err(Error::Io)?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn collection_path(&self, collection: &str) -> PathBuf {
        self.data_dir.join(format!("{}.json", collection))
    }

    fn lock_path(&self, collection: &str) -> PathBuf {
        self.data_dir.join(format!("{}.lock", collection))
    }

    fn handle(&self, collection: &str) -> Result<Arc<CollectionHandle>> {
        lockfile::handle_for(&self.lock_path(collection))
    }

    /// Returns the shared per-collection handle without acquiring
    /// anything. Used by the Transaction Manager, which holds the writer
    /// latch and advisory lock itself across an entire commit rather than
    /// per individual operation.
    pub(crate) fn collection_handle(&self, collection: &str) -> Result<Arc<CollectionHandle>> {
        self.handle(collection)
    }

    /// Same as [`Self::write_document`] but assumes the caller already
    /// holds the writer latch and advisory lock for `collection` — used
    /// from within a transaction commit, which acquires both once for the
    /// whole commit rather than once per operation.
    pub(crate) fn write_document_locked(
        &self,
        collection: &str,
        id: &str,
        doc: Document,
    ) -> Result<()> {
        validate_document_id(id)?;
        let mut file = self.read_collection_file(collection)?;
        file.documents.insert(id.to_string(), doc);
        file.recount();
        self.atomic_write(&self.collection_path(collection), &file)
    }

    /// Same as [`Self::delete_document`] but assumes the caller already
    /// holds the writer latch and advisory lock for `collection`.
    pub(crate) fn delete_document_locked(&self, collection: &str, id: &str) -> Result<()> {
        let mut file = self.read_collection_file(collection)?;
        file.documents.remove(id);
        file.recount();
        self.atomic_write(&self.collection_path(collection), &file)
    }

    pub fn create_collection(&self, collection: &str) -> Result<()> {
        let handle = self.handle(collection)?;
        let _writer = handle.latch.write().recover_poison();

        let path = self.collection_path(collection);
        if path.exists() {
            return Err(Error::AlreadyExists {
                name: collection.to_string(),
            });
        }

        handle.lock_exclusive(collection)?;
        let result = self.atomic_write(&path, &CollectionFile::new(collection));
        handle.unlock(collection)?;
        result
    }

    pub fn list_collections(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.data_dir).map_err(Error::Io)? {
            let entry = entry.map_err(Error::Io)?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    #[instrument(skip(self, doc), fields(collection, id))]
    pub fn write_document(&self, collection: &str, id: &str, doc: Document) -> Result<()> {
        validate_document_id(id)?;
        let handle = self.handle(collection)?;
        let _writer = handle.latch.write().recover_poison();

        handle.lock_exclusive(collection)?;
        let result = (|| {
            let mut file = self.read_collection_file(collection)?;
            file.documents.insert(id.to_string(), doc);
            file.recount();
            self.atomic_write(&self.collection_path(collection), &file)
        })();
        handle.unlock(collection)?;
        result
    }

    #[instrument(skip(self), fields(collection, id))]
    pub fn read_document(&self, collection: &str, id: &str) -> Result<Document> {
        let handle = self.handle(collection)?;
        let _reader = handle.latch.read().recover_poison();

        let file = self.read_collection_file(collection)?;
        file.documents
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })
    }

    /// Idempotent delete: deleting a document that does not exist is not an
    /// error, per §4.1.
    #[instrument(skip(self), fields(collection, id))]
    pub fn delete_document(&self, collection: &str, id: &str) -> Result<()> {
        let handle = self.handle(collection)?;
        let _writer = handle.latch.write().recover_poison();

        handle.lock_exclusive(collection)?;
        let result = (|| {
            let mut file = self.read_collection_file(collection)?;
            file.documents.remove(id);
            file.recount();
            self.atomic_write(&self.collection_path(collection), &file)
        })();
        handle.unlock(collection)?;
        result
    }

    /// Invokes `visitor` for every (id, document) pair under the
    /// per-collection reader latch. Ordering is unspecified.
    ///
    /// The visitor runs while the latch is held, so it must be
    /// non-blocking and must not call back into the engine for the same
    /// collection — recursive acquisition of the writer latch from inside
    /// the visitor would deadlock.
    pub fn scan_collection(
        &self,
        collection: &str,
        mut visitor: impl FnMut(&DocumentId, &Document) -> ScanControl,
    ) -> Result<()> {
        let handle = self.handle(collection)?;
        let _reader = handle.latch.read().recover_poison();

        let file = self.read_collection_file(collection)?;
        for (id, doc) in file.documents.iter() {
            if visitor(id, doc) == ScanControl::Stop {
                break;
            }
        }
        Ok(())
    }

    /// Copies out the full (id, document) set, for callers (the Index
    /// Manager's rebuild path) that need to release the reader latch before
    /// doing further work of their own.
    pub fn scan_to_vec(&self, collection: &str) -> Result<Vec<(DocumentId, Document)>> {
        let mut out = Vec::new();
        self.scan_collection(collection, |id, doc| {
            out.push((id.clone(), doc.clone()));
            ScanControl::Continue
        })?;
        Ok(out)
    }

    pub fn document_count(&self, collection: &str) -> Result<usize> {
        let handle = self.handle(collection)?;
        let _reader = handle.latch.read().recover_poison();
        Ok(self.read_collection_file(collection)?.documents.len())
    }

    /// Releases every advisory lock held for this data directory and drops
    /// cached handles. After `close()`, a new `StorageEngine::open` on the
    /// same directory starts from a clean registry entry.
    pub fn close(&self) -> Result<()> {
        lockfile::release_under(&self.data_dir);
        Ok(())
    }

    /// Parses `collection`'s file without taking any latch or lock, for use
    /// during startup before the database accepts concurrent access.
    /// Returns `Error::Corrupt` if the file exists but fails to parse.
    pub(crate) fn validate_collection(&self, collection: &str) -> Result<()> {
        let path = self.collection_path(collection);
        if !path.exists() {
            return Ok(());
        }
        self.parse_collection_file(collection, &path)?;
        Ok(())
    }

    fn read_collection_file(&self, collection: &str) -> Result<CollectionFile> {
        let path = self.collection_path(collection);
        if !path.exists() {
            return Err(Error::NoSuchCollection {
                name: collection.to_string(),
            });
        }
        self.parse_collection_file(collection, &path)
    }

    fn parse_collection_file(&self, collection: &str, path: &Path) -> Result<CollectionFile> {
        let bytes = fs::read(path).map_err(Error::Io)?;
        serde_json::from_slice(&bytes).map_err(|e| {
            warn!(collection, error = %e, "collection file failed to parse");
            Error::Corrupt {
                component: format!("collection '{}'", collection),
                details: e.to_string(),
            }
        })
    }

    /// Steps 3–7 of the atomic write protocol: serialize to `<name>.json.tmp`,
    /// fsync the temp file, rename over the target. Any failure deletes the
    /// temp file and leaves the previous valid file untouched.
    fn atomic_write(&self, path: &Path, file: &CollectionFile) -> Result<()> {
        let tmp_path = path.with_extension("json.tmp");

        let write_result = (|| -> Result<()> {
            let bytes = serde_json::to_vec_pretty(file)
                .map_err(|e| Error::serialization("collection file", e))?;
            let tmp = fs::File::create(&tmp_path).map_err(Error::Io)?;
            {
                use std::io::Write;
                let mut tmp = tmp;
                tmp.write_all(&bytes).map_err(Error::Io)?;
                tmp.sync_all().map_err(Error::Io)?;
            }
            fs::rename(&tmp_path, path).map_err(Error::Io)?;
            Ok(())
        })();

        if write_result.is_err() {
            let _ = fs::remove_file(&tmp_path);
        } else {
            debug!(path = %path.display(), "collection file written atomically");
        }
        write_result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn doc(v: serde_json::Value) -> Document {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn insert_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path()).unwrap();
        engine.create_collection("users").unwrap();

        engine
            .write_document("users", "u1", doc(json!({"name": "Alice"})))
            .unwrap();

        let got = engine.read_document("users", "u1").unwrap();
        assert_eq!(got, doc(json!({"name": "Alice"})));
        engine.close().unwrap();
    }

    #[test]
    fn create_collection_twice_fails() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path()).unwrap();
        engine.create_collection("users").unwrap();
        let err = engine.create_collection("users").unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    #[test]
    fn read_missing_document_is_not_found() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path()).unwrap();
        engine.create_collection("users").unwrap();
        let err = engine.read_document("users", "ghost").unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn delete_missing_document_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path()).unwrap();
        engine.create_collection("users").unwrap();
        engine.delete_document("users", "ghost").unwrap();
    }

    #[test]
    fn write_without_explicit_create_collection_fails() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path()).unwrap();
        let err = engine
            .write_document("users", "u1", doc(json!({"name": "Bob"})))
            .unwrap_err();
        assert!(matches!(err, Error::NoSuchCollection { .. }));
    }

    #[test]
    fn delete_without_explicit_create_collection_fails() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path()).unwrap();
        let err = engine.delete_document("users", "ghost").unwrap_err();
        assert!(matches!(err, Error::NoSuchCollection { .. }));
    }

    #[test]
    fn scan_visits_every_document() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path()).unwrap();
        engine.create_collection("users").unwrap();
        for i in 0..5 {
            engine
                .write_document(
                    "users",
                    &format!("u{}", i),
                    doc(json!({"n": i})),
                )
                .unwrap();
        }

        let mut seen = BTreeMap::new();
        engine
            .scan_collection("users", |id, d| {
                seen.insert(id.clone(), d.clone());
                ScanControl::Continue
            })
            .unwrap();
        assert_eq!(seen.len(), 5);
    }

    #[test]
    fn scan_can_stop_early() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path()).unwrap();
        engine.create_collection("users").unwrap();
        for i in 0..5 {
            engine
                .write_document("users", &format!("u{}", i), doc(json!({"n": i})))
                .unwrap();
        }

        let mut count = 0;
        engine
            .scan_collection("users", |_id, _d| {
                count += 1;
                if count == 2 {
                    ScanControl::Stop
                } else {
                    ScanControl::Continue
                }
            })
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn collection_isolation() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path()).unwrap();
        engine.create_collection("a").unwrap();
        engine.create_collection("b").unwrap();
        engine
            .write_document("a", "x", doc(json!({"v": 1})))
            .unwrap();
        engine
            .write_document("b", "y", doc(json!({"v": 2})))
            .unwrap();

        let before = engine.scan_to_vec("b").unwrap();
        engine
            .write_document("a", "x2", doc(json!({"v": 3})))
            .unwrap();
        let after = engine.scan_to_vec("b").unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn crash_mid_write_leaves_previous_file_intact() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path()).unwrap();
        engine.create_collection("users").unwrap();
        engine
            .write_document("users", "u1", doc(json!({"v": 1})))
            .unwrap();

        // Simulate a crash between fsync-of-temp and rename by leaving a
        // stray, truncated temp file behind; the previous valid file must
        // still be the one readers observe.
        let tmp_path = dir.path().join("users.json.tmp");
        std::fs::write(&tmp_path, b"{not json").unwrap();

        let got = engine.read_document("users", "u1").unwrap();
        assert_eq!(got, doc(json!({"v": 1})));
    }

    #[test]
    fn list_collections_enumerates_disk_state() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path()).unwrap();
        engine.create_collection("users").unwrap();
        engine.create_collection("orders").unwrap();
        let mut names = engine.list_collections().unwrap();
        names.sort();
        assert_eq!(names, vec!["orders".to_string(), "users".to_string()]);
    }
}
