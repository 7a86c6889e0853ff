//! Storage Engine: atomic per-collection file persistence with
//! reader/writer discipline and advisory file locks.
//!
//! One file per collection (`<name>.json`) plus one lock sidecar
//! (`<name>.lock`). Mutations go through a temp-and-rename atomic write so a
//! reader never observes a torn file, and a crash between fsync and rename
//! leaves the previous valid file untouched.

mod engine;
mod lockfile;
mod record;

pub use engine::{ScanControl, StorageEngine};
pub use record::{CollectionFile, CollectionMetadata};
pub(crate) use lockfile::CollectionHandle;
