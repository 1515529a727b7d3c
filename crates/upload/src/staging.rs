//! Local scratch space for upload sessions.
//!
//! Every session owns one directory, `{root}/{session_id}`, with two
//! sub-areas:
//!
//! - `zip`: raw archive uploads waiting to be extracted
//! - `files`: extracted or uploaded images waiting to be normalised
//!
//! Nothing in a workspace outlives a single request. Pipelines borrow scratch
//! directories from it as [`TempDir`] guards, which are deleted when dropped,
//! so an error (or a panic unwinding) part way through a batch never leaves
//! files behind. The workspace directory itself is removed when the session
//! is committed or deleted.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use quire_config::StagingConfig;
use std::collections::HashSet;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use tempfile::{Builder, TempDir};
use tokio::fs;
use uuid::Uuid;

const ARCHIVE_AREA: &str = "zip";
const FILES_AREA: &str = "files";

/// Root of every session's scratch workspace.
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}
impl From<&StagingConfig> for StagingArea {
    fn from(config: &StagingConfig) -> Self {
        Self::new(&config.root)
    }
}
impl StagingArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of a session's workspace (whether or not it exists).
    pub fn path(&self, session_id: Uuid) -> PathBuf {
        self.root.join(session_id.to_string())
    }

    /// Create a fresh workspace. Fails if one already exists for the session.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn create(&self, session_id: Uuid) -> Result<Workspace> {
        fs::create_dir_all(&self.root).await.or_raise(|| ErrorKind::Staging)?;
        let workspace = Workspace { id: session_id, root: self.path(session_id) };
        fs::create_dir(&workspace.root).await.or_raise(|| ErrorKind::Staging)?;
        workspace.ensure_areas().await?;
        Ok(workspace)
    }

    /// Open an existing session's workspace, recreating any missing parts.
    ///
    /// Workspaces only hold per-request scratch data, so one lost to a reboot
    /// (or a tmp cleaner) is simply rebuilt.
    pub async fn open(&self, session_id: Uuid) -> Result<Workspace> {
        let workspace = Workspace { id: session_id, root: self.path(session_id) };
        workspace.ensure_areas().await?;
        Ok(workspace)
    }

    /// Remove a session's workspace. Removing a missing workspace is a no-op.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn remove(&self, session_id: Uuid) -> Result<()> {
        match fs::remove_dir_all(self.path(session_id)).await {
            Err(e) if e.kind() != IoErrorKind::NotFound => Err(e).or_raise(|| ErrorKind::Staging),
            _ => Ok(()),
        }
    }

    /// Remove every workspace whose session isn't in `live`, returning the
    /// ids of the removed workspaces.
    ///
    /// Entries that aren't named after a session id are left alone.
    pub async fn sweep(&self, live: &HashSet<Uuid>) -> Result<Vec<Uuid>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e).or_raise(|| ErrorKind::Staging),
        };
        let mut removed = vec![];
        while let Some(entry) = entries.next_entry().await.or_raise(|| ErrorKind::Staging)? {
            let Some(id) = entry.file_name().to_str().and_then(|name| Uuid::parse_str(name).ok()) else {
                continue;
            };
            if live.contains(&id) || !entry.file_type().await.or_raise(|| ErrorKind::Staging)?.is_dir() {
                continue;
            }
            self.remove(id).await?;
            tracing::debug!(session = %id, "Removed orphaned staging workspace");
            removed.push(id);
        }
        Ok(removed)
    }
}

/// A single session's scratch workspace.
#[derive(Debug, Clone)]
pub struct Workspace {
    id: Uuid,
    root: PathBuf,
}
impl Workspace {
    pub fn session_id(&self) -> Uuid {
        self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join(ARCHIVE_AREA)
    }

    pub fn files_dir(&self) -> PathBuf {
        self.root.join(FILES_AREA)
    }

    /// Borrow a scratch directory for raw archive uploads.
    pub fn scratch_archive(&self) -> Result<TempDir> {
        scratch_in(&self.archive_dir())
    }

    /// Borrow a scratch directory for images awaiting normalisation.
    pub fn scratch_files(&self) -> Result<TempDir> {
        scratch_in(&self.files_dir())
    }

    async fn ensure_areas(&self) -> Result<()> {
        fs::create_dir_all(self.archive_dir()).await.or_raise(|| ErrorKind::Staging)?;
        fs::create_dir_all(self.files_dir()).await.or_raise(|| ErrorKind::Staging)
    }
}

fn scratch_in(area: &Path) -> Result<TempDir> {
    Builder::new().prefix("batch-").tempdir_in(area).or_raise(|| ErrorKind::Staging)
}
