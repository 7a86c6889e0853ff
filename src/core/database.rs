use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{info, instrument, warn};

use crate::core::config::Config;
use crate::core::document::Document;
use crate::core::errors::{PoisonedLockExt, Result};
use crate::core::index::IndexManager;
use crate::core::op::OpKind;
use crate::core::storage::{ScanControl, StorageEngine};
use crate::core::txn::{Transaction, TransactionManager};
use crate::core::wal::Wal;

/// Wires the four subsystems together and owns startup recovery.
///
/// This is the one entry point callers (an API layer, an embedded host, a
/// test harness) construct directly; everything else is reached through
/// the accessors here or through the transaction handles `begin` returns.
pub struct Database {
    storage: Arc<StorageEngine>,
    index: Arc<IndexManager>,
    wal: Arc<Wal>,
    transactions: TransactionManager,
    config: Config,
    ops_since_checkpoint: AtomicU64,
    last_checkpoint: Mutex<Instant>,
}

impl Database {
    /// Opens (or creates) a database at the directories named in `config`,
    /// replaying the Write-Ahead Log before accepting new work.
    #[instrument(skip(config))]
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;

        let storage = Arc::new(StorageEngine::open(&config.data_dir)?);
        let index = Arc::new(IndexManager::new(
            Arc::clone(&storage),
            config.data_dir.clone(),
        ));
        let wal = Arc::new(Wal::open(
            config.wal_dir.join(crate::core::constants::WAL_FILE_NAME),
            config.sync_writes,
        )?);

        Self::validate_collections(&storage)?;
        Self::replay(&storage, &index, &wal)?;
        Self::load_existing_indexes(&storage, &index)?;

        let transactions =
            TransactionManager::new(Arc::clone(&storage), Arc::clone(&index), Arc::clone(&wal));

        Ok(Self {
            storage,
            index,
            wal,
            transactions,
            config,
            ops_since_checkpoint: AtomicU64::new(0),
            last_checkpoint: Mutex::new(Instant::now()),
        })
    }

    /// Parses every collection file on disk, failing startup fatally with
    /// `Error::Corrupt` if any of them don't parse — a corrupt file is
    /// never discovered lazily on first access.
    #[instrument(skip(storage))]
    fn validate_collections(storage: &Arc<StorageEngine>) -> Result<()> {
        for collection in storage.list_collections()? {
            storage.validate_collection(&collection)?;
        }
        Ok(())
    }

    /// Re-applies every WAL record to Storage and the indexes, then
    /// truncates the log. Idempotent: re-applying a record whose effect is
    /// already on disk is a no-op write of the same state, so replaying
    /// twice in a row (or replaying a record already reflected in a
    /// collection file) leaves Storage unchanged. This is also how the WAL
    /// wins over Storage on disagreement — replay always re-derives
    /// indexes from whatever Storage ends up holding.
    #[instrument(skip(storage, index, wal))]
    fn replay(storage: &Arc<StorageEngine>, index: &Arc<IndexManager>, wal: &Arc<Wal>) -> Result<()> {
        let records = wal.read_all()?;
        if records.is_empty() {
            return Ok(());
        }

        let mut touched = std::collections::BTreeSet::new();
        for record in &records {
            match record.op {
                OpKind::Insert | OpKind::Update => {
                    let doc = record.doc.clone().unwrap_or_default();
                    storage.write_document(&record.coll, &record.id, doc)?;
                }
                OpKind::Delete => {
                    storage.delete_document(&record.coll, &record.id)?;
                }
            }
            touched.insert(record.coll.clone());
        }

        for collection in &touched {
            index.rebuild_indexes(collection)?;
        }

        wal.truncate()?;
        info!(records = records.len(), collections = touched.len(), "WAL replay complete");
        Ok(())
    }

    /// Loads persisted secondary indexes for every collection so a clean
    /// restart (empty WAL, nothing for `replay` to touch) still has its
    /// indexes populated instead of only ever rebuilding them on demand.
    /// Collections `replay` just rebuilt from the WAL are loaded again here
    /// too; `load_indexes` is idempotent and cheap relative to startup.
    #[instrument(skip(storage, index))]
    fn load_existing_indexes(storage: &Arc<StorageEngine>, index: &Arc<IndexManager>) -> Result<()> {
        for collection in storage.list_collections()? {
            index.load_indexes(&collection)?;
        }
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage(&self) -> &StorageEngine {
        &self.storage
    }

    pub fn index(&self) -> &IndexManager {
        &self.index
    }

    pub fn wal(&self) -> &Wal {
        &self.wal
    }

    // -- Storage-adjacent convenience surface -----------------------------

    pub fn create_collection(&self, name: &str) -> Result<()> {
        self.storage.create_collection(name)?;
        self.index.create_primary_index(name)?;
        Ok(())
    }

    pub fn list_collections(&self) -> Result<Vec<String>> {
        self.storage.list_collections()
    }

    pub fn scan_collection(
        &self,
        collection: &str,
        visitor: impl FnMut(&String, &Document) -> ScanControl,
    ) -> Result<()> {
        self.storage.scan_collection(collection, visitor)
    }

    pub fn create_secondary_index(&self, collection: &str, field: &str) -> Result<()> {
        self.index.create_secondary_index(collection, field)
    }

    pub fn lookup_primary(&self, collection: &str, id: &str) -> Option<Document> {
        self.index.lookup_primary(collection, id)
    }

    pub fn lookup_secondary(
        &self,
        collection: &str,
        field: &str,
        value: &serde_json::Value,
    ) -> Vec<String> {
        self.index.lookup_secondary(collection, field, value)
    }

    // -- Transaction surface ------------------------------------------------

    pub fn begin(&self) -> Transaction {
        self.transactions.begin()
    }

    pub fn insert(&self, txn: &mut Transaction, collection: &str, id: &str, doc: Document) -> Result<()> {
        self.transactions.insert(txn, collection, id, doc)
    }

    pub fn update(&self, txn: &mut Transaction, collection: &str, id: &str, doc: Document) -> Result<()> {
        self.transactions.update(txn, collection, id, doc)
    }

    pub fn delete(&self, txn: &mut Transaction, collection: &str, id: &str) -> Result<()> {
        self.transactions.delete(txn, collection, id)
    }

    pub fn read(&self, txn: &Transaction, collection: &str, id: &str) -> Result<Document> {
        self.transactions.read(txn, collection, id)
    }

    /// Commits, then checks the operation-count / elapsed-time checkpoint
    /// thresholds and checkpoints if either is exceeded.
    pub fn commit(&self, txn: &mut Transaction) -> Result<()> {
        let op_count = txn.buffer_len() as u64;
        self.transactions.commit(txn)?;
        self.ops_since_checkpoint
            .fetch_add(op_count, Ordering::SeqCst);
        self.maybe_checkpoint()?;
        Ok(())
    }

    pub fn rollback(&self, txn: &mut Transaction) -> Result<()> {
        self.transactions.rollback(txn)
    }

    fn maybe_checkpoint(&self) -> Result<()> {
        let ops = self.ops_since_checkpoint.load(Ordering::SeqCst);
        let elapsed = self
            .last_checkpoint
            .lock()
            .recover_poison()
            .elapsed();
        if ops >= self.config.checkpoint_ops
            || elapsed >= Duration::from_secs(self.config.checkpoint_interval_s)
        {
            self.checkpoint()?;
        }
        Ok(())
    }

    /// Forces a checkpoint: Storage and the indexes are already durable by
    /// construction after every commit, so this only needs to truncate the
    /// WAL.
    #[instrument(skip(self))]
    pub fn checkpoint(&self) -> Result<()> {
        self.wal.truncate()?;
        self.ops_since_checkpoint.store(0, Ordering::SeqCst);
        *self.last_checkpoint.lock().recover_poison() = Instant::now();
        info!("checkpoint complete, WAL truncated");
        Ok(())
    }

    /// Releases every advisory lock this process holds. After `close()`,
    /// opening a fresh `Database` on the same directory starts clean.
    pub fn close(&self) -> Result<()> {
        self.storage.close()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.storage.close() {
            warn!(error = %e, "failed to release advisory locks on drop");
        }
    }
}
