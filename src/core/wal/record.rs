use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::document::{Document, DocumentId};
use crate::core::op::OpKind;

/// The on-disk shape of one WAL line: `{"seq":...,"ts":...,"op":...,"coll":...,"id":...,"doc":...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalRecord {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub op: OpKind,
    pub coll: String,
    pub id: DocumentId,
    pub doc: Option<Document>,
}
