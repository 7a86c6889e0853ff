use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::{info, instrument, warn};

use crate::core::document::{canonical_value, resolve_path, Document, DocumentId};
use crate::core::errors::{Error, PoisonedLockExt, Result};
use crate::core::op::OpKind;
use crate::core::storage::StorageEngine;

use super::secondary::SecondaryIndexFile;

type Postings = HashMap<String, BTreeSet<DocumentId>>;

/// Per-collection index state. Each secondary field carries its own
/// reader/writer latch, independent of the primary index's latch and of
/// every other field's latch.
struct CollectionIndexes {
    primary: RwLock<HashMap<DocumentId, Document>>,
    primary_built: RwLock<bool>,
    secondary: RwLock<HashMap<String, Arc<RwLock<Postings>>>>,
}

impl CollectionIndexes {
    fn new() -> Self {
        Self {
            primary: RwLock::new(HashMap::new()),
            primary_built: RwLock::new(false),
            secondary: RwLock::new(HashMap::new()),
        }
    }
}

/// Maintains per-collection primary (id → document) and secondary
/// (field → value → set-of-ids) indexes in memory, persists secondary
/// indexes to disk, and can reconstruct everything from the Storage Engine.
pub struct IndexManager {
    storage: Arc<StorageEngine>,
    index_dir: PathBuf,
    collections: RwLock<HashMap<String, Arc<CollectionIndexes>>>,
}

impl IndexManager {
    pub fn new(storage: Arc<StorageEngine>, index_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage,
            index_dir: index_dir.into(),
            collections: RwLock::new(HashMap::new()),
        }
    }

    fn entry(&self, collection: &str) -> Arc<CollectionIndexes> {
        if let Some(existing) = self
            .collections
            .read()
            .recover_poison()
            .get(collection)
            .cloned()
        {
            return existing;
        }
        let mut collections = self.collections.write().recover_poison();
        Arc::clone(
            collections
                .entry(collection.to_string())
                .or_insert_with(|| Arc::new(CollectionIndexes::new())),
        )
    }

    fn secondary_index_path(&self, collection: &str, field: &str) -> PathBuf {
        // Dotted field paths ("address.city") are not filesystem-safe, so
        // the path separator is flattened into an underscore in the file
        // name while the original dotted path is kept in the file content.
        let safe_field = field.replace('.', "_");
        self.index_dir
            .join(format!("{}_idx_{}.json", collection, safe_field))
    }

    /// Idempotent: seeds the primary index from a Storage scan only once
    /// per collection (the flag, not emptiness, tracks "once" — an empty
    /// collection has a legitimately empty primary index).
    #[instrument(skip(self), fields(collection))]
    pub fn create_primary_index(&self, collection: &str) -> Result<()> {
        let entry = self.entry(collection);
        if *entry.primary_built.read().recover_poison() {
            return Ok(());
        }
        self.load_primary_from_storage(collection, &entry)
    }

    fn load_primary_from_storage(
        &self,
        collection: &str,
        entry: &Arc<CollectionIndexes>,
    ) -> Result<()> {
        let docs = self.storage.scan_to_vec(collection)?;
        let mut primary = entry.primary.write().recover_poison();
        primary.clear();
        primary.extend(docs);
        *entry.primary_built.write().recover_poison() = true;
        Ok(())
    }

    /// Scans Storage to build the posting map for `field`, then persists it
    /// immediately.
    #[instrument(skip(self), fields(collection, field))]
    pub fn create_secondary_index(&self, collection: &str, field: &str) -> Result<()> {
        let entry = self.entry(collection);
        let postings = self.build_postings_from_storage(collection, field)?;

        entry
            .secondary
            .write()
            .recover_poison()
            .insert(field.to_string(), Arc::new(RwLock::new(postings)));

        self.persist_field(collection, field, &entry)
    }

    fn build_postings_from_storage(&self, collection: &str, field: &str) -> Result<Postings> {
        let docs = self.storage.scan_to_vec(collection)?;
        let mut postings: Postings = HashMap::new();
        for (id, doc) in docs {
            if let Some(value) = resolve_path(&doc, field) {
                postings
                    .entry(canonical_value(value))
                    .or_default()
                    .insert(id);
            }
        }
        Ok(postings)
    }

    pub fn lookup_primary(&self, collection: &str, id: &str) -> Option<Document> {
        let entry = self.entry(collection);
        entry.primary.read().recover_poison().get(id).cloned()
    }

    /// Returns the ids matching `field == value`, sorted ascending — stable
    /// across calls within one process lifetime because postings are kept
    /// in a `BTreeSet`.
    pub fn lookup_secondary(
        &self,
        collection: &str,
        field: &str,
        value: &serde_json::Value,
    ) -> Vec<DocumentId> {
        let entry = self.entry(collection);
        let secondary = entry.secondary.read().recover_poison();
        let Some(tree) = secondary.get(field) else {
            return Vec::new();
        };
        let postings = tree.read().recover_poison();
        postings
            .get(&canonical_value(value))
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Maintains every known index for `collection` in one step, as part of
    /// a commit. The primary index is updated last so that secondary
    /// maintenance always has the pre-image available, either from the
    /// still-current primary entry or, if the primary index hasn't been
    /// warmed for this collection, from Storage directly.
    #[instrument(skip(self, new_doc), fields(collection, id, op = op.as_str()))]
    pub fn update_indexes(
        &self,
        collection: &str,
        id: &str,
        new_doc: Option<&Document>,
        op: OpKind,
    ) -> Result<()> {
        let entry = self.entry(collection);

        let pre_image = {
            let primary = entry.primary.read().recover_poison();
            match primary.get(id).cloned() {
                Some(doc) => Some(doc),
                None => self.storage_pre_image(collection, id)?,
            }
        };

        let mut fields: Vec<String> = entry
            .secondary
            .read()
            .recover_poison()
            .keys()
            .cloned()
            .collect();
        fields.sort();

        for field in &fields {
            let tree = {
                let secondary = entry.secondary.read().recover_poison();
                match secondary.get(field) {
                    Some(t) => Arc::clone(t),
                    None => continue,
                }
            };
            let mut postings = tree.write().recover_poison();

            if let Some(old_doc) = &pre_image {
                if let Some(old_value) = resolve_path(old_doc, field) {
                    let key = canonical_value(old_value);
                    if let Some(ids) = postings.get_mut(&key) {
                        ids.remove(id);
                        if ids.is_empty() {
                            postings.remove(&key);
                        }
                    }
                }
            }

            if let Some(doc) = new_doc {
                if let Some(new_value) = resolve_path(doc, field) {
                    postings
                        .entry(canonical_value(new_value))
                        .or_default()
                        .insert(id.to_string());
                }
            }
        }

        let mut primary = entry.primary.write().recover_poison();
        match new_doc {
            Some(doc) => {
                primary.insert(id.to_string(), doc.clone());
            }
            None => {
                primary.remove(id);
            }
        }

        Ok(())
    }

    fn storage_pre_image(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        match self.storage.read_document(collection, id) {
            Ok(doc) => Ok(Some(doc)),
            Err(Error::NotFound { .. }) | Err(Error::NoSuchCollection { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn persist_field(
        &self,
        collection: &str,
        field: &str,
        entry: &Arc<CollectionIndexes>,
    ) -> Result<()> {
        let secondary = entry.secondary.read().recover_poison();
        let Some(tree) = secondary.get(field) else {
            return Ok(());
        };
        let postings = tree.read().recover_poison();

        let index = postings
            .iter()
            .map(|(value, ids)| (value.clone(), ids.iter().cloned().collect()))
            .collect();

        let file = SecondaryIndexFile {
            collection: collection.to_string(),
            field: field.to_string(),
            index,
        };

        std::fs::create_dir_all(&self.index_dir).map_err(Error::Io)?;
        let path = self.secondary_index_path(collection, field);
        let bytes = serde_json::to_vec_pretty(&file)
            .map_err(|e| Error::serialization("secondary index", e))?;
        std::fs::write(&path, bytes).map_err(Error::Io)
    }

    /// Persists every secondary index currently tracked for `collection`.
    pub fn persist_indexes(&self, collection: &str) -> Result<()> {
        let entry = self.entry(collection);
        let fields: Vec<String> = entry
            .secondary
            .read()
            .recover_poison()
            .keys()
            .cloned()
            .collect();
        for field in fields {
            self.persist_field(collection, &field, &entry)?;
        }
        Ok(())
    }

    /// Loads every `<collection>_idx_<field>.json` file found for
    /// `collection`. A file whose referenced ids are not all present in the
    /// primary index is discarded and that field is rebuilt from Storage
    /// instead.
    #[instrument(skip(self), fields(collection))]
    pub fn load_indexes(&self, collection: &str) -> Result<()> {
        self.create_primary_index(collection)?;
        let entry = self.entry(collection);

        let Ok(read_dir) = std::fs::read_dir(&self.index_dir) else {
            return Ok(());
        };
        let prefix = format!("{}_idx_", collection);

        for entry_res in read_dir {
            let Ok(dir_entry) = entry_res else { continue };
            let path = dir_entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with(&prefix) || !name.ends_with(".json") {
                continue;
            }
            self.load_one_index_file(collection, &path, &entry)?;
        }
        Ok(())
    }

    /// Loads one persisted index file, verifying every referenced id is
    /// still present in the primary index. An integrity mismatch triggers a
    /// rebuild from Storage; a file that fails to parse is dropped instead
    /// of guessed at — the field name lives only in the file's content (the
    /// filename's dots are flattened to underscores and can't be reversed),
    /// so a corrupt file leaves that field unloaded until a caller explicitly
    /// re-runs `create_secondary_index` for it.
    fn load_one_index_file(
        &self,
        collection: &str,
        path: &Path,
        entry: &Arc<CollectionIndexes>,
    ) -> Result<()> {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(_) => return Ok(()),
        };
        let parsed: SecondaryIndexFile = match serde_json::from_slice(&bytes) {
            Ok(f) => f,
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "secondary index file corrupt, dropping — re-create the index explicitly"
                );
                return Ok(());
            }
        };

        let primary = entry.primary.read().recover_poison();
        let all_ids_present = parsed
            .index
            .values()
            .flatten()
            .all(|id| primary.contains_key(id));
        drop(primary);

        if !all_ids_present {
            warn!(
                collection,
                field = parsed.field,
                "secondary index references unknown ids, rebuilding"
            );
            return self.rebuild_field(collection, &parsed.field, entry);
        }

        let postings: Postings = parsed
            .index
            .into_iter()
            .map(|(v, ids)| (v, ids.into_iter().collect()))
            .collect();
        entry
            .secondary
            .write()
            .recover_poison()
            .insert(parsed.field.clone(), Arc::new(RwLock::new(postings)));
        Ok(())
    }

    fn rebuild_field(
        &self,
        collection: &str,
        field: &str,
        entry: &Arc<CollectionIndexes>,
    ) -> Result<()> {
        let postings = self.build_postings_from_storage(collection, field)?;
        entry
            .secondary
            .write()
            .recover_poison()
            .insert(field.to_string(), Arc::new(RwLock::new(postings)));
        self.persist_field(collection, field, entry)
    }

    /// Re-derives every index for `collection` — primary and every
    /// currently tracked secondary field — directly from Storage. Used
    /// after detecting corruption in persisted index files, or on demand.
    #[instrument(skip(self), fields(collection))]
    pub fn rebuild_indexes(&self, collection: &str) -> Result<()> {
        let entry = self.entry(collection);
        self.load_primary_from_storage(collection, &entry)?;

        let fields: Vec<String> = entry
            .secondary
            .read()
            .recover_poison()
            .keys()
            .cloned()
            .collect();
        for field in &fields {
            self.rebuild_field(collection, field, &entry)?;
        }
        info!(collection, fields = fields.len(), "indexes rebuilt");
        Ok(())
    }

    pub fn indexed_fields(&self, collection: &str) -> Vec<String> {
        let entry = self.entry(collection);
        let mut fields: Vec<String> = entry
            .secondary
            .read()
            .recover_poison()
            .keys()
            .cloned()
            .collect();
        fields.sort();
        fields
    }
}
