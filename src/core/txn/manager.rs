use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{info, instrument};

use crate::core::document::Document;
use crate::core::errors::{Error, PoisonedLockExt, Result};
use crate::core::index::IndexManager;
use crate::core::op::OpKind;
use crate::core::storage::StorageEngine;
use crate::core::wal::Wal;

use super::transaction::{Operation, Transaction};

/// Issues transaction handles, buffers operations, resolves reads against
/// buffer-over-storage, and on commit drives WAL-then-storage-then-index
/// application under the documented lock ordering: collection writer
/// latches (sorted), then the WAL mutex (inside `Wal::append`), then index
/// latches (sorted, inside `IndexManager::update_indexes`), released in
/// reverse.
pub struct TransactionManager {
    storage: Arc<StorageEngine>,
    index: Arc<IndexManager>,
    wal: Arc<Wal>,
    next_tx_id: AtomicU64,
}

impl TransactionManager {
    pub fn new(storage: Arc<StorageEngine>, index: Arc<IndexManager>, wal: Arc<Wal>) -> Self {
        Self {
            storage,
            index,
            wal,
            next_tx_id: AtomicU64::new(1),
        }
    }

    /// Hands out a fresh handle. The transaction id space is independent
    /// of WAL sequence numbers — one counts transactions, the other counts
    /// individual durable operations.
    pub fn begin(&self) -> Transaction {
        let id = self.next_tx_id.fetch_add(1, Ordering::SeqCst);
        Transaction::new(id)
    }

    pub fn insert(&self, txn: &mut Transaction, collection: &str, id: &str, doc: Document) -> Result<()> {
        self.buffer_op(txn, OpKind::Insert, collection, id, Some(doc))
    }

    pub fn update(&self, txn: &mut Transaction, collection: &str, id: &str, doc: Document) -> Result<()> {
        self.buffer_op(txn, OpKind::Update, collection, id, Some(doc))
    }

    pub fn delete(&self, txn: &mut Transaction, collection: &str, id: &str) -> Result<()> {
        self.buffer_op(txn, OpKind::Delete, collection, id, None)
    }

    fn buffer_op(
        &self,
        txn: &mut Transaction,
        op: OpKind,
        collection: &str,
        id: &str,
        doc: Option<Document>,
    ) -> Result<()> {
        if !txn.is_active() {
            return Err(Error::TxNotActive { tx_id: txn.id() });
        }
        txn.push(Operation {
            op,
            collection: collection.to_string(),
            id: id.to_string(),
            doc,
        });
        Ok(())
    }

    /// Resolves against the buffer first (last-wins for that id), falling
    /// back to committed state. A Delete in the buffer produces NotFound
    /// even if storage still has the id — the buffer always shadows
    /// storage for ids it has touched.
    pub fn read(&self, txn: &Transaction, collection: &str, id: &str) -> Result<Document> {
        if let Some(buffered) = txn.last_for(collection, id) {
            return match &buffered.doc {
                Some(doc) => Ok(doc.clone()),
                None => Err(Error::NotFound {
                    collection: collection.to_string(),
                    id: id.to_string(),
                }),
            };
        }
        self.storage.read_document(collection, id)
    }

    /// Runs the six-step commit protocol. On success every buffered
    /// operation is durable in WAL, Storage, and the indexes. A failure
    /// during WAL append (step 2) aborts with no state mutated; a failure
    /// after WAL append is not rolled back — the transaction is already
    /// durable and replay on restart completes it, per the precedence
    /// rule the Write-Ahead Log documents.
    #[instrument(skip(self, txn), fields(tx_id = txn.id()))]
    pub fn commit(&self, txn: &mut Transaction) -> Result<()> {
        if txn.is_terminal() {
            return Err(Error::TxNotActive { tx_id: txn.id() });
        }
        if txn.buffer().is_empty() {
            txn.mark_committed();
            return Ok(());
        }

        let collections = txn.touched_collections_sorted();

        let handles: Vec<_> = collections
            .iter()
            .map(|c| self.storage.collection_handle(c).map(|h| (c.clone(), h)))
            .collect::<Result<_>>()?;

        let mut guards = Vec::with_capacity(handles.len());
        for (_, handle) in &handles {
            guards.push(handle.latch.write().recover_poison());
        }

        for (name, handle) in &handles {
            if let Err(e) = handle.lock_exclusive(name) {
                // Release everything acquired so far, in reverse, before
                // surfacing the failure — no state has mutated yet.
                drop(guards);
                for (name, handle) in handles.iter().rev() {
                    let _ = handle.unlock(name);
                }
                return Err(e);
            }
        }

        let result = self.apply_commit(txn);

        for (name, handle) in handles.iter().rev() {
            let _ = handle.unlock(name);
        }
        drop(guards);

        match result {
            Ok(()) => {
                txn.mark_committed();
                info!(tx_id = txn.id(), ops = txn.buffer().len(), "transaction committed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Steps 2–4 of the commit protocol, run while every writer latch and
    /// advisory lock the transaction touches is held.
    fn apply_commit(&self, txn: &Transaction) -> Result<()> {
        for entry in txn.buffer() {
            self.wal
                .append(entry.op, &entry.collection, &entry.id, entry.doc.clone())
                .map_err(|e| Error::CommitFailed {
                    tx_id: txn.id(),
                    reason: e.to_string(),
                })?;
        }

        for entry in txn.buffer() {
            match entry.op {
                OpKind::Insert | OpKind::Update => {
                    let doc = entry
                        .doc
                        .clone()
                        .expect("insert/update operations always carry a document");
                    self.storage
                        .write_document_locked(&entry.collection, &entry.id, doc)?;
                }
                OpKind::Delete => {
                    self.storage
                        .delete_document_locked(&entry.collection, &entry.id)?;
                }
            }
        }

        for entry in txn.buffer() {
            self.index.update_indexes(
                &entry.collection,
                &entry.id,
                entry.doc.as_ref(),
                entry.op,
            )?;
        }

        Ok(())
    }

    /// Pure buffer discard. Always succeeds; no latches are held in
    /// read-your-writes mode, since writes are never applied before
    /// commit.
    pub fn rollback(&self, txn: &mut Transaction) -> Result<()> {
        if txn.is_terminal() {
            return Err(Error::TxNotActive { tx_id: txn.id() });
        }
        txn.mark_rolled_back();
        Ok(())
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

    fn setup() -> (TempDir, TransactionManager) {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(StorageEngine::open(dir.path().join("data")).unwrap());
        let index = Arc::new(IndexManager::new(
            Arc::clone(&storage),
            dir.path().join("data"),
        ));
        let wal = Arc::new(Wal::open(dir.path().join("wal/wal.log"), true).unwrap());
        (dir, TransactionManager::new(storage, index, wal))
    }

    #[test]
    fn insert_read_round_trip_within_transaction() {
        let (_dir, mgr) = setup();
        mgr.storage.create_collection("users").unwrap();
        let mut txn = mgr.begin();
        mgr.insert(&mut txn, "users", "u1", doc(json!({"name": "Alice"})))
            .unwrap();
        assert_eq!(
            mgr.read(&txn, "users", "u1").unwrap(),
            doc(json!({"name": "Alice"}))
        );
        mgr.commit(&mut txn).unwrap();
    }

    #[test]
    fn rollback_is_invisible_outside_the_transaction() {
        let (_dir, mgr) = setup();
        mgr.storage.create_collection("users").unwrap();
        let mut txn = mgr.begin();
        mgr.insert(&mut txn, "users", "u9", doc(json!({"v": 1})))
            .unwrap();
        assert_eq!(
            mgr.read(&txn, "users", "u9").unwrap(),
            doc(json!({"v": 1}))
        );
        mgr.rollback(&mut txn).unwrap();

        let txn2 = mgr.begin();
        let err = mgr.read(&txn2, "users", "u9").unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn delete_in_buffer_shadows_storage() {
        let (_dir, mgr) = setup();
        mgr.storage.create_collection("users").unwrap();
        let mut seed = mgr.begin();
        mgr.insert(&mut seed, "users", "u1", doc(json!({"v": 1})))
            .unwrap();
        mgr.commit(&mut seed).unwrap();

        let mut txn = mgr.begin();
        mgr.delete(&mut txn, "users", "u1").unwrap();
        let err = mgr.read(&txn, "users", "u1").unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn last_write_wins_within_buffer() {
        let (_dir, mgr) = setup();
        mgr.storage.create_collection("users").unwrap();
        let mut txn = mgr.begin();
        mgr.insert(&mut txn, "users", "u1", doc(json!({"v": 1})))
            .unwrap();
        mgr.update(&mut txn, "users", "u1", doc(json!({"v": 2})))
            .unwrap();
        assert_eq!(mgr.read(&txn, "users", "u1").unwrap(), doc(json!({"v": 2})));
        mgr.commit(&mut txn).unwrap();
    }

    #[test]
    fn commit_persists_to_storage_and_indexes() {
        let (dir, mgr) = setup();
        mgr.storage.create_collection("users").unwrap();
        let mut txn = mgr.begin();
        mgr.insert(&mut txn, "users", "u1", doc(json!({"v": 1})))
            .unwrap();
        mgr.commit(&mut txn).unwrap();

        let storage = StorageEngine::open(dir.path().join("data")).unwrap();
        assert_eq!(storage.read_document("users", "u1").unwrap(), doc(json!({"v": 1})));
    }

    #[test]
    fn cross_collection_commit_applies_both() {
        let (_dir, mgr) = setup();
        mgr.storage.create_collection("a").unwrap();
        mgr.storage.create_collection("b").unwrap();
        let mut txn = mgr.begin();
        mgr.insert(&mut txn, "a", "x", doc(json!({"v": 1}))).unwrap();
        mgr.insert(&mut txn, "b", "y", doc(json!({"v": 2}))).unwrap();
        mgr.commit(&mut txn).unwrap();

        assert_eq!(mgr.storage.read_document("a", "x").unwrap(), doc(json!({"v": 1})));
        assert_eq!(mgr.storage.read_document("b", "y").unwrap(), doc(json!({"v": 2})));
    }

    #[test]
    fn commit_twice_fails() {
        let (_dir, mgr) = setup();
        mgr.storage.create_collection("users").unwrap();
        let mut txn = mgr.begin();
        mgr.insert(&mut txn, "users", "u1", doc(json!({"v": 1})))
            .unwrap();
        mgr.commit(&mut txn).unwrap();
        let err = mgr.commit(&mut txn).unwrap_err();
        assert!(matches!(err, Error::TxNotActive { .. }));
    }

    #[test]
    fn wal_records_every_committed_operation_in_order() {
        let (_dir, mgr) = setup();
        mgr.storage.create_collection("users").unwrap();
        let mut txn = mgr.begin();
        mgr.insert(&mut txn, "users", "u1", doc(json!({"v": 1})))
            .unwrap();
        mgr.update(&mut txn, "users", "u1", doc(json!({"v": 2})))
            .unwrap();
        mgr.commit(&mut txn).unwrap();

        let records = mgr.wal.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[1].seq > records[0].seq);
    }
}
