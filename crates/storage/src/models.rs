//! Storage models.

use std::path::PathBuf;
use time::OffsetDateTime;

/// Object metadata returned by content stores.
///
/// Listing yields these; most callers only care about [`key`](Self::key),
/// see [`ContentStore::list`](crate::ContentStore::list).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Key relative to the store root
    pub key: PathBuf,
    /// Object size in bytes
    pub size: u64,
    /// Last modified timestamp
    pub modified: OffsetDateTime,
}
impl ObjectInfo {
    pub fn new(key: impl Into<PathBuf>, size: u64, modified: OffsetDateTime) -> Self {
        Self { key: key.into(), size, modified }
    }
}
