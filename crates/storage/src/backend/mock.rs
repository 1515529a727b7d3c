//! In-memory content store for testing.

use super::ObjectInfoStream;
use crate::error::{ErrorKind, Result};
use crate::path::validate as validate_key;
use crate::{ContentStore, ObjectInfo};
use async_stream::stream;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// In-memory content store for testing.
///
/// Objects are stored in a `HashMap` behind a [`RwLock`], so all trait
/// methods can operate on `&self` without external synchronisation.
///
/// # Examples
///
/// ```
/// use quire_storage::backend::MockBackend;
/// use quire_storage::ContentStore;
/// use std::path::Path;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = MockBackend::with_objects([
///     ("manga/chapter/1.jpg", b"jpeg"),
/// ]);
/// assert!(backend.exists(Path::new("manga/chapter/1.jpg")).await?);
/// # Ok(())
/// # }
/// ```
pub struct MockBackend {
    name: String,
    storage: RwLock<HashMap<PathBuf, (OffsetDateTime, Vec<u8>)>>,
}

impl MockBackend {
    /// Create a mock backend pre-populated with objects.
    ///
    /// Panics if any key fails validation. If test setup is wrong, then the
    /// test should not pass.
    pub fn with_objects(objects: impl IntoIterator<Item = (impl Into<PathBuf>, impl Into<Vec<u8>>)>) -> Self {
        let mut map = HashMap::new();
        let now = OffsetDateTime::now_utc();
        for (key, data) in objects {
            let key = key.into();
            let Ok(validated) = validate_key(&key) else {
                panic!("MockBackend::with_objects: invalid key {}", key.display());
            };
            map.insert(validated, (now, data.into()));
        }
        Self {
            name: "mock".to_string(),
            storage: RwLock::new(map),
        }
    }

    /// Change the name of the mock backend.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Number of stored objects.
    pub async fn len(&self) -> usize {
        self.storage.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.storage.read().await.is_empty()
    }
}
impl Default for MockBackend {
    fn default() -> Self {
        let objects: [(&str, &str); 0] = [];
        Self::with_objects(objects)
    }
}

#[async_trait]
impl ContentStore for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> ObjectInfoStream<'a> {
        let validated_prefix = match prefix.map(validate_key).transpose() {
            Ok(pfx) => pfx,
            Err(e) => return Box::pin(futures::stream::once(async { Err(e) })),
        };

        Box::pin(stream! {
            // Snapshot matching entries under the read lock, then drop it
            // before yielding to avoid holding the lock across yield points.
            let mut entries: Vec<ObjectInfo> = {
                let guard = self.storage.read().await;
                guard
                    .iter()
                    .filter(|(key, _)| match &validated_prefix {
                        Some(pfx) => key.starts_with(pfx),
                        None => true,
                    })
                    .map(|(key, (inserted, data))| ObjectInfo::new(key.clone(), data.len() as u64, *inserted))
                    .collect()
            };
            entries.sort_by(|a, b| a.key.cmp(&b.key));
            for info in entries {
                yield Ok(info);
            }
        })
    }

    async fn exists(&self, key: &Path) -> Result<bool> {
        let key = validate_key(key)?;
        Ok(self.storage.read().await.contains_key(&key))
    }

    async fn get(&self, key: &Path) -> Result<Vec<u8>> {
        let key = validate_key(key)?;
        let (_inserted, data) =
            self.storage.read().await.get(&key).cloned().ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(key)))?;
        Ok(data)
    }

    async fn put(&self, key: &Path, data: &[u8]) -> Result<()> {
        let key = validate_key(key)?;
        self.storage.write().await.insert(key, (OffsetDateTime::now_utc(), data.to_vec()));
        Ok(())
    }

    async fn remove(&self, key: &Path) -> Result<()> {
        let key = validate_key(key)?;
        self.storage.write().await.remove(&key);
        Ok(())
    }

    async fn stat(&self, key: &Path) -> Result<ObjectInfo> {
        let key = validate_key(key)?;
        let guard = self.storage.read().await;
        let (inserted, data) = guard.get(&key).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(key.clone())))?;
        Ok(ObjectInfo::new(key.clone(), data.len() as u64, *inserted))
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from = validate_key(from)?;
        let to = validate_key(to)?;
        let mut guard = self.storage.write().await;
        let data = guard.remove(&from).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(from)))?;
        guard.insert(to, data);
        Ok(())
    }
}
