use serde_json::Value;

/// An ordered mapping from string keys to JSON-compatible values.
///
/// `serde_json`'s `preserve_order` feature backs this with an `IndexMap`
/// internally, so round-tripping a document through storage preserves the
/// key order the caller inserted it with.
pub type Document = serde_json::Map<String, Value>;

/// Caller-assigned identifier, unique within a collection.
pub type DocumentId = String;

pub fn validate_document_id(id: &str) -> crate::Result<()> {
    if id.is_empty() {
        return Err(crate::Error::ConfigError {
            reason: "document id must not be empty".to_string(),
        });
    }
    Ok(())
}

/// Resolves a dot-separated field path against a document.
///
/// A missing segment anywhere along the path (including an intermediate
/// segment that isn't an object) produces "no value", never an error — the
/// Index Manager's secondary-index maintenance depends on this: a document
/// that lacks a field simply contributes no posting for it.
pub fn resolve_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = doc.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Renders a JSON value into the stable string used as a secondary-index
/// posting-list key and as the `value-as-string` key in the persisted
/// secondary index file.
///
/// Canonicalization matters only for equality grouping, not for display:
/// `serde_json::to_string` already produces a deterministic byte sequence
/// for any given `Value`, which is exactly the property a `HashMap` key (or
/// a JSON object key) needs.
pub fn canonical_value(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}
