//! An embedded, concurrent, transactional JSON document store.
//!
//! Four subsystems compose into [`Database`]: the Storage Engine
//! (`core::storage`) persists per-collection document sets atomically; the
//! Index Manager (`core::index`) keeps primary and secondary lookups in
//! memory and on disk; the Transaction Manager (`core::txn`) buffers
//! multi-operation commits with read-committed isolation; the
//! Write-Ahead Log (`core::wal`) makes commits durable and replayable.

pub mod core;

pub use core::config::Config;
pub use core::database::Database;
pub use core::document::{Document, DocumentId};
pub use core::errors::{Error, PoisonedLockExt, Result};
pub use core::index::IndexManager;
pub use core::op::OpKind;
pub use core::storage::{ScanControl, StorageEngine};
pub use core::txn::{Transaction, TransactionManager};
pub use core::wal::Wal;
