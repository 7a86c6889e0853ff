use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::constants::COLLECTION_SCHEMA_VERSION;
use crate::core::document::{Document, DocumentId};

/// The on-disk shape of `<collection>.json`.
///
/// `documents` is a `BTreeMap` rather than a `HashMap` so that two
/// processes (or two test runs) that write the same logical content produce
/// byte-identical files — useful for diffing snapshots, and free since
/// lookups go through the in-memory primary index, never through this
/// struct directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionFile {
    pub metadata: CollectionMetadata,
    pub documents: BTreeMap<DocumentId, Document>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionMetadata {
    pub collection: String,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub document_count: usize,
}

impl CollectionFile {
    pub fn new(collection: &str) -> Self {
        Self {
            metadata: CollectionMetadata {
                collection: collection.to_string(),
                version: COLLECTION_SCHEMA_VERSION,
                created_at: Utc::now(),
                document_count: 0,
            },
            documents: BTreeMap::new(),
        }
    }

    /// Recomputes `document_count` from the live document set, as §4.1
    /// requires on every write.
    pub fn recount(&mut self) {
        self.metadata.document_count = self.documents.len();
    }
}
