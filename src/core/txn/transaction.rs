use std::collections::HashMap;

use crate::core::document::{Document, DocumentId};
use crate::core::op::OpKind;

/// One buffered mutation, in the order it was issued.
#[derive(Debug, Clone)]
pub struct Operation {
    pub op: OpKind,
    pub collection: String,
    pub id: DocumentId,
    pub doc: Option<Document>,
}

/// A transaction handle: an id, a buffered ordered sequence of operations,
/// and a last-wins index over that buffer keyed by (collection, id).
///
/// Owned exclusively by the caller that created it via
/// [`super::TransactionManager::begin`]; cross-thread use is undefined, per
/// the single-writer-per-collection model the commit protocol relies on.
pub struct Transaction {
    id: u64,
    buffer: Vec<Operation>,
    last_index: HashMap<(String, DocumentId), usize>,
    committed: bool,
    rolled_back: bool,
}

impl Transaction {
    pub(super) fn new(id: u64) -> Self {
        Self {
            id,
            buffer: Vec::new(),
            last_index: HashMap::new(),
            committed: false,
            rolled_back: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        !self.committed && !self.rolled_back
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    pub(super) fn is_terminal(&self) -> bool {
        self.committed || self.rolled_back
    }

    pub(super) fn mark_committed(&mut self) {
        self.committed = true;
    }

    pub(super) fn mark_rolled_back(&mut self) {
        self.rolled_back = true;
    }

    /// Appends a buffered operation. Insert and Update are idempotent when
    /// re-applied; within one buffer, the last operation for a given
    /// (collection, id) pair wins — `push` records the position of each
    /// new entry and overwrites the index for that key, so stale earlier
    /// entries stay in `buffer` (for audit/ordering in WAL replay) but are
    /// never the one `last_for` resolves to.
    pub(super) fn push(&mut self, op: Operation) {
        let key = (op.collection.clone(), op.id.clone());
        self.last_index.insert(key, self.buffer.len());
        self.buffer.push(op);
    }

    /// Resolves the last buffered operation touching (collection, id), if
    /// any — the basis for read-your-writes.
    pub(super) fn last_for(&self, collection: &str, id: &str) -> Option<&Operation> {
        self.last_index
            .get(&(collection.to_string(), id.to_string()))
            .map(|&idx| &self.buffer[idx])
    }

    pub(super) fn buffer(&self) -> &[Operation] {
        &self.buffer
    }

    /// Distinct collections touched, sorted lexicographically — the
    /// commit protocol's lock-acquisition order.
    pub(super) fn touched_collections_sorted(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .buffer
            .iter()
            .map(|op| op.collection.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}
