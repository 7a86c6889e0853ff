use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::document::DocumentId;

/// The on-disk shape of `<collection>_idx_<field>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecondaryIndexFile {
    pub collection: String,
    pub field: String,
    pub index: BTreeMap<String, Vec<DocumentId>>,
}
