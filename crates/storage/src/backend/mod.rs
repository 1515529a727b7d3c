//! Content store trait and implementations.
//!
//! This module defines the [`ContentStore`] trait, which provides a unified
//! interface over the local filesystem and S3-compatible object stores.

mod local;
#[cfg(feature = "mock")]
mod mock;
#[cfg(feature = "s3")]
mod s3;

pub use self::local::LocalBackend;
#[cfg(feature = "mock")]
pub use self::mock::MockBackend;
#[cfg(feature = "s3")]
pub use self::s3::S3Backend;
use crate::ObjectInfo;
use crate::error::Result;
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use std::path::{Path, PathBuf};
use std::pin::Pin;

pub type ObjectInfoStream<'a> = Pin<Box<dyn Stream<Item = Result<ObjectInfo>> + Send + 'a>>;

/// Unified interface for content stores.
///
/// All operations are asynchronous to efficiently handle network operations
/// and concurrent access. There are no transactions: each call affects one
/// key (or, for the bulk helpers, a list of independent keys).
///
/// # Key Handling
/// All keys are relative to the store root and must be validated using
/// [`validate_key`](crate::validate_key) before use. Implementations enforce
/// this validation.
///
/// # Idempotence
/// [`remove`](Self::remove), [`remove_many`](Self::remove_many) and
/// [`rmtree`](Self::rmtree) succeed when keys are already gone. Deferred
/// cleanup relies on this to be safely re-run after a crash.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use quire_storage::{ContentStore, error::Result};
///
/// async fn publish(store: &dyn ContentStore, blob: &Path, page: &Path) -> Result<()> {
///     if store.exists(blob).await? {
///         store.rename(blob, page).await?;
///     }
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Name of the configured backend, used for logging only.
    fn name(&self) -> &str;

    /// Stream object metadata matching an optional prefix.
    ///
    /// Backends that page their listings (S3) follow the continuation tokens
    /// internally; callers see a single stream. Prefixes are component-based:
    /// `blobs` matches `blobs/a.jpg` but not `blobs-old/a.jpg`. A prefix that
    /// doesn't exist yields an empty stream, not an error.
    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> ObjectInfoStream<'a>;

    /// List all keys matching an optional prefix.
    ///
    /// Default implementation collects [`list_stream()`](Self::list_stream).
    async fn list(&self, prefix: Option<&Path>) -> Result<Vec<PathBuf>> {
        self.list_stream(prefix).map_ok(|info| info.key).try_collect().await
    }

    /// Check if an object exists.
    async fn exists(&self, key: &Path) -> Result<bool>;

    /// Read object contents.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the object
    /// does not exist.
    async fn get(&self, key: &Path) -> Result<Vec<u8>>;

    /// Write object contents, replacing any existing object.
    ///
    /// Implementations create parent "directories" as needed.
    async fn put(&self, key: &Path, data: &[u8]) -> Result<()>;

    /// Delete an object. Deleting a missing object is a no-op.
    async fn remove(&self, key: &Path) -> Result<()>;

    /// Get object metadata without reading contents.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the object
    /// does not exist.
    async fn stat(&self, key: &Path) -> Result<ObjectInfo>;

    /// Copy an object to another key, overwriting the destination.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the source
    /// does not exist.
    async fn copy(&self, from: &Path, to: &Path) -> Result<()> {
        let data = self.get(from).await?;
        self.put(to, &data).await
    }

    /// Move an object to another key, overwriting the destination.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the source
    /// does not exist.
    ///
    /// # Notes
    /// - The default implementation is copy-then-remove. If the remove fails
    ///   the move still counts as successful and a warning is logged; the
    ///   leftover source is an orphan for reconciliation to pick up.
    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.copy(from, to).await?;
        if let Err(e) = self.remove(from).await {
            tracing::warn!(
                store = self.name(),
                from = %from.display(),
                error = ?e,
                "Copied object but could not remove the source"
            );
        }
        Ok(())
    }

    /// Delete many objects. Missing keys (and an empty list) are no-ops.
    async fn remove_many(&self, keys: &[PathBuf]) -> Result<()> {
        for key in keys {
            self.remove(key).await?;
        }
        Ok(())
    }

    /// Delete every object under `prefix`.
    async fn rmtree(&self, prefix: &Path) -> Result<()> {
        let keys = self.list(Some(prefix)).await?;
        self.remove_many(&keys).await
    }
}
