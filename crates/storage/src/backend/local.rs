//! Local filesystem content store.
//!
//! Objects are stored as files under a configured root directory and
//! accessed via `tokio::fs` for async I/O.

use crate::backend::ObjectInfoStream;
use crate::error::ErrorKind;
use crate::{ContentStore, ObjectInfo, error::Result, path::validate as validate_key};
use async_stream::stream;
use async_trait::async_trait;
use exn::ResultExt;
use std::fs::{Metadata, create_dir_all as sync_create_dir};
use std::path::{Path, PathBuf};
use tokio::fs::{self, DirEntry};

enum WalkEntry {
    File(ObjectInfo),
    Descend(PathBuf),
    Skip,
}

/// Local filesystem content store.
///
/// Stores objects in a directory on the local filesystem. All keys are
/// relative to the configured root directory.
///
/// # Examples
///
/// ```no_run
/// use quire_storage::backend::LocalBackend;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = LocalBackend::new("media", "/srv/quire/media")?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LocalBackend {
    name: String,
    /// Root directory for all objects
    root: PathBuf,
}
impl LocalBackend {
    /// Create a new local filesystem backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is not absolute, or exists but isn't a
    /// directory.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidKey(root));
        }
        if root.exists() {
            if !root.is_dir() {
                exn::bail!(ErrorKind::InvalidKey(root));
            }
        } else {
            // Use non-async here; it'll only happen once on startup and it's
            // not worth the hassle of making the constructor async.
            sync_create_dir(&root).map_err(|e| Self::map_io_error(e, &root))?;
        }
        Ok(Self { name: name.into(), root })
    }

    /// Get the absolute path for a key.
    fn absolute_path(&self, key: impl AsRef<Path>) -> Result<PathBuf> {
        let validated = validate_key(key.as_ref())?;
        Ok(self.root.join(validated))
    }

    /// Convert an absolute path back to a key.
    fn relative_key(&self, absolute: impl AsRef<Path>) -> Result<PathBuf> {
        let absolute = absolute.as_ref();
        let relative = absolute.strip_prefix(&self.root).or_raise(|| {
            ErrorKind::BackendError(format!("path `{:?}` is not within root `{:?}`", absolute, self.root))
        })?;
        validate_key(relative)
    }

    fn object_info(key: &Path, metadata: Metadata) -> Result<ObjectInfo> {
        let modified = metadata.modified().map_err(ErrorKind::Io)?.into();
        Ok(ObjectInfo::new(key, metadata.len(), modified))
    }

    fn map_io_error(e: std::io::Error, key: &Path) -> ErrorKind {
        match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound(key.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied(key.to_path_buf()),
            _ => ErrorKind::Io(e),
        }
    }

    async fn create_parent(&self, absolute: &Path, key: &Path) -> Result<()> {
        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent).await.map_err(|e| Self::map_io_error(e, key))?;
        }
        Ok(())
    }

    // Errors can't be `?`-ed inside the stream loop, so the fallible part of
    // each entry lives here and the loop only has to yield the result.
    async fn process_entry(&self, entry: DirEntry, prefix: Option<&Path>) -> Result<WalkEntry> {
        let path = entry.path();
        let metadata = entry.metadata().await.map_err(|e| Self::map_io_error(e, &path))?;
        let key = self.relative_key(&path)?;
        if metadata.is_dir() {
            // Descend into directories that either lead to the prefix, or are
            // already inside it.
            return Ok(match prefix {
                Some(pfx) if !(pfx.starts_with(&key) || key.starts_with(pfx)) => WalkEntry::Skip,
                _ => WalkEntry::Descend(path),
            });
        }
        if let Some(pfx) = prefix
            && !key.starts_with(pfx)
        {
            return Ok(WalkEntry::Skip);
        }
        if metadata.is_file() {
            return Ok(WalkEntry::File(Self::object_info(&key, metadata)?));
        }
        // Note: silently drop what is most likely a broken symlink.
        Ok(WalkEntry::Skip)
    }
}

#[async_trait]
impl ContentStore for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> ObjectInfoStream<'a> {
        let validated_prefix = match prefix.map(validate_key).transpose() {
            Ok(pfx) => pfx,
            Err(e) => return Box::pin(futures::stream::once(async { Result::Err(e) })),
        };

        // Walk from the parent directory of the prefix. The leaf of the
        // prefix may not exist yet, or may be a file rather than a directory.
        let start_dir = validated_prefix
            .as_ref()
            .map(|prefix| self.root.join(prefix).parent().unwrap_or(&self.root).to_path_buf())
            .unwrap_or_else(|| self.root.clone());
        let mut stack = vec![start_dir];

        Box::pin(stream! {
            'dirs: while let Some(current) = stack.pop() {
                let mut entries = match fs::read_dir(&current).await {
                    Ok(entries) => entries,
                    // Consistent with S3: listing a prefix that doesn't exist
                    // is an empty list, not an error.
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(err) => {
                        yield Err(exn::Exn::from(Self::map_io_error(err, &current)));
                        continue 'dirs;
                    }
                };

                'entries: loop {
                    let entry = match entries.next_entry().await {
                        Ok(Some(entry)) => entry,
                        Ok(None) => break 'entries,
                        Err(e) => { yield Err(exn::Exn::from(Self::map_io_error(e, &current))); continue 'entries; },
                    };
                    match self.process_entry(entry, validated_prefix.as_deref()).await {
                        Ok(WalkEntry::File(f)) => yield Ok(f),
                        Ok(WalkEntry::Descend(d)) => stack.push(d),
                        Ok(WalkEntry::Skip) => {},
                        Err(e) => yield Err(e),
                    };
                }
            }
        })
    }

    async fn exists(&self, key: &Path) -> Result<bool> {
        let abs_path = self.absolute_path(key)?;
        Ok(fs::try_exists(&abs_path).await.map_err(ErrorKind::Io)?)
    }

    async fn get(&self, key: &Path) -> Result<Vec<u8>> {
        let abs_path = self.absolute_path(key)?;
        Ok(fs::read(&abs_path).await.map_err(|e| Self::map_io_error(e, key))?)
    }

    async fn put(&self, key: &Path, data: &[u8]) -> Result<()> {
        let abs_path = self.absolute_path(key)?;
        self.create_parent(&abs_path, key).await?;
        Ok(fs::write(&abs_path, data).await.map_err(|e| Self::map_io_error(e, key))?)
    }

    async fn remove(&self, key: &Path) -> Result<()> {
        let abs_path = self.absolute_path(key)?;
        match fs::remove_file(&abs_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => exn::bail!(Self::map_io_error(e, key)),
        }
    }

    async fn stat(&self, key: &Path) -> Result<ObjectInfo> {
        let abs_path = self.absolute_path(key)?;
        let metadata = fs::metadata(&abs_path).await.map_err(|e| Self::map_io_error(e, key))?;
        if !metadata.is_file() {
            exn::bail!(ErrorKind::NotFound(key.to_path_buf()));
        }
        Self::object_info(key, metadata)
    }

    async fn copy(&self, from: &Path, to: &Path) -> Result<()> {
        let from_path = self.absolute_path(from)?;
        let to_path = self.absolute_path(to)?;
        self.create_parent(&to_path, to).await?;
        fs::copy(&from_path, &to_path).await.map_err(|e| Self::map_io_error(e, from))?;
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from_path = self.absolute_path(from)?;
        let to_path = self.absolute_path(to)?;
        self.create_parent(&to_path, to).await?;
        Ok(fs::rename(&from_path, &to_path).await.map_err(|e| Self::map_io_error(e, from))?)
    }

    async fn rmtree(&self, prefix: &Path) -> Result<()> {
        let abs_path = self.absolute_path(prefix)?;
        match fs::remove_dir_all(&abs_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            // The prefix names a single object rather than a directory.
            Err(_) if abs_path.is_file() => self.remove(prefix).await,
            Err(e) => exn::bail!(Self::map_io_error(e, prefix)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (tempfile::TempDir, LocalBackend) {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new("local", temp_dir.path()).unwrap();
        (temp_dir, backend)
    }

    #[test]
    fn test_new_requires_absolute_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(LocalBackend::new("local", temp_dir.path()).is_ok());
        assert!(LocalBackend::new("local", "relative/path").is_err());
        assert!(LocalBackend::new("local", "./relative").is_err());
    }

    #[test]
    fn test_absolute_path() {
        let (temp_dir, backend) = backend();
        let expected = temp_dir.path().join("blobs/a.jpg");
        assert_eq!(backend.absolute_path(Path::new("blobs/a.jpg")).unwrap(), expected);
        assert!(backend.absolute_path(Path::new("../etc/passwd")).is_err());
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (_temp_dir, backend) = backend();
        backend.put(Path::new("blobs/a.jpg"), b"jpeg").await.unwrap();
        assert_eq!(backend.get(Path::new("blobs/a.jpg")).await.unwrap(), b"jpeg");
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let (_temp_dir, backend) = backend();
        let err = backend.get(Path::new("blobs/missing.jpg")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let (_temp_dir, backend) = backend();
        backend.put(Path::new("blobs/a.jpg"), b"data").await.unwrap();
        backend.remove(Path::new("blobs/a.jpg")).await.unwrap();
        assert!(!backend.exists(Path::new("blobs/a.jpg")).await.unwrap());
        backend.remove(Path::new("blobs/a.jpg")).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_many_tolerates_missing_keys() {
        let (_temp_dir, backend) = backend();
        backend.put(Path::new("blobs/a.jpg"), b"data").await.unwrap();
        let keys = vec![PathBuf::from("blobs/a.jpg"), PathBuf::from("blobs/never.jpg")];
        backend.remove_many(&keys).await.unwrap();
        backend.remove_many(&keys).await.unwrap();
        backend.remove_many(&[]).await.unwrap();
        assert!(backend.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_copy_keeps_source() {
        let (_temp_dir, backend) = backend();
        backend.put(Path::new("m/c/1.jpg"), b"page").await.unwrap();
        backend.copy(Path::new("m/c/1.jpg"), Path::new("blobs/b.jpg")).await.unwrap();
        assert_eq!(backend.get(Path::new("m/c/1.jpg")).await.unwrap(), b"page");
        assert_eq!(backend.get(Path::new("blobs/b.jpg")).await.unwrap(), b"page");
    }

    #[tokio::test]
    async fn test_copy_missing_source() {
        let (_temp_dir, backend) = backend();
        let err = backend.copy(Path::new("m/c/1.jpg"), Path::new("blobs/b.jpg")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_rename_overwrites_and_creates_directories() {
        let (_temp_dir, backend) = backend();
        backend.put(Path::new("blobs/a.jpg"), b"new").await.unwrap();
        backend.put(Path::new("m/c/1.jpg"), b"old").await.unwrap();
        backend.rename(Path::new("blobs/a.jpg"), Path::new("m/c/1.jpg")).await.unwrap();
        backend.put(Path::new("blobs/b.jpg"), b"two").await.unwrap();
        backend.rename(Path::new("blobs/b.jpg"), Path::new("m/c/2.jpg")).await.unwrap();
        assert!(!backend.exists(Path::new("blobs/a.jpg")).await.unwrap());
        assert_eq!(backend.get(Path::new("m/c/1.jpg")).await.unwrap(), b"new");
        assert_eq!(backend.get(Path::new("m/c/2.jpg")).await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_stat() {
        let (_temp_dir, backend) = backend();
        backend.put(Path::new("blobs/a.jpg"), b"12345").await.unwrap();
        let info = backend.stat(Path::new("blobs/a.jpg")).await.unwrap();
        assert_eq!(info.key, PathBuf::from("blobs/a.jpg"));
        assert_eq!(info.size, 5);
    }

    #[tokio::test]
    async fn test_list_with_prefix_is_component_based() {
        let (_temp_dir, backend) = backend();
        backend.put(Path::new("m/c/1.jpg"), b"a").await.unwrap();
        backend.put(Path::new("m/c/2.jpg"), b"b").await.unwrap();
        backend.put(Path::new("m/cx/1.jpg"), b"c").await.unwrap();
        backend.put(Path::new("blobs/a.jpg"), b"d").await.unwrap();
        let mut keys = backend.list(Some(Path::new("m/c"))).await.unwrap();
        keys.sort();
        assert_eq!(keys, vec![PathBuf::from("m/c/1.jpg"), PathBuf::from("m/c/2.jpg")]);
        assert_eq!(backend.list(None).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_list_nonexistent_prefix() {
        let (_temp_dir, backend) = backend();
        assert!(backend.list(Some(Path::new("nothing/here"))).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rmtree() {
        let (_temp_dir, backend) = backend();
        backend.put(Path::new("m/c/1.jpg"), b"a").await.unwrap();
        backend.put(Path::new("m/c/2.jpg"), b"b").await.unwrap();
        backend.put(Path::new("m/other/1.jpg"), b"c").await.unwrap();
        backend.rmtree(Path::new("m/c")).await.unwrap();
        backend.rmtree(Path::new("m/c")).await.unwrap();
        assert_eq!(backend.list(None).await.unwrap(), vec![PathBuf::from("m/other/1.jpg")]);
    }

    #[tokio::test]
    async fn test_key_security() {
        let (_temp_dir, backend) = backend();
        assert!(backend.get(Path::new("../etc/passwd")).await.is_err());
        assert!(backend.put(Path::new("../etc/passwd"), b"data").await.is_err());
        assert!(backend.remove(Path::new("../../file")).await.is_err());
    }
}
