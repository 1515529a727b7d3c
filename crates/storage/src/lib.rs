//! Content store for staged uploads and published chapter pages.
//!
//! A content store is a flat key → bytes map. Keys look like relative paths
//! (`blobs/{id}.jpg`, `{manga}/{chapter}/{n}.jpg`) but backends are free to
//! treat them as opaque object names. There are no transactional guarantees
//! across keys; every bulk operation tolerates keys that are already gone so
//! callers can safely repeat them.

pub mod backend;
pub mod error;
mod models;
mod path;

pub use crate::backend::ContentStore;
pub use crate::models::ObjectInfo;
pub use crate::path::validate as validate_key;
use std::sync::Arc;

pub type StoreHandle = Arc<dyn ContentStore + Send + Sync>;
