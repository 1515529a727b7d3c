//! The upload session engine.
//!
//! Every operation runs its record and staging effects to completion before
//! returning, then hands content work that can wait (moving pages into a
//! chapter, deleting discarded content) to the [`TaskQueue`]. Callers are
//! expected to have authorised the acting user already.

use crate::codec;
use crate::error::{Entity, ErrorKind, Rejection, Result};
use crate::ingest;
use crate::keys::{BLOB_PREFIX, blob_id_from_key, blob_key, page_key};
use crate::models::{Actor, BeginSession, CommitOutcome, CommitSession, ReconcileReport, SessionDetail, Upload};
use crate::pool::BlockingPool;
use crate::slice;
use crate::staging::StagingArea;
use crate::tasks::{QueueOptions, Task, TaskQueue};
use exn::{OptionExt, ResultExt};
use futures::TryStreamExt;
use quire_config::{Config, ImageConfig, StorageConfig};
use quire_records::error::ErrorKind as RecordsErrorKind;
use quire_records::{Blob, Chapter, ChapterWrite, Database, Repository, Session};
use quire_storage::backend::LocalBackend;
#[cfg(feature = "s3")]
use quire_storage::backend::S3Backend;
use quire_storage::{ObjectInfo, StoreHandle};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Staged content younger than this is never treated as orphaned; it may
/// belong to a batch whose records aren't written yet.
pub const RECONCILE_GRACE: Duration = Duration::from_secs(60 * 60);

/// Build the content store described by `config`.
pub async fn open_store(config: &StorageConfig) -> Result<StoreHandle> {
    match config {
        StorageConfig::Local { root } => {
            let backend = LocalBackend::new("local", root).or_raise(|| ErrorKind::Storage)?;
            Ok(Arc::new(backend))
        },
        #[cfg(feature = "s3")]
        StorageConfig::S3 { bucket, prefix, region, endpoint, key_id, key_secret } => {
            let backend = S3Backend::new("s3", bucket, prefix.clone(), region, endpoint.clone(), key_id, key_secret)
                .await
                .or_raise(|| ErrorKind::Storage)?;
            Ok(Arc::new(backend))
        },
        #[cfg(not(feature = "s3"))]
        StorageConfig::S3 { .. } => {
            tracing::error!("S3 storage is configured but this build doesn't include the `s3` feature");
            exn::bail!(ErrorKind::Storage)
        },
    }
}

/// Entry point for every upload session operation. Clones are cheap and
/// share the same store, records, pool and task queue.
#[derive(Clone)]
pub struct UploadEngine {
    store: StoreHandle,
    repo: Repository,
    staging: StagingArea,
    pool: BlockingPool,
    tasks: TaskQueue,
    images: ImageConfig,
    /// Held shared from a commit's record write until its tasks are queued,
    /// and exclusively by reconciliation.
    gate: Arc<RwLock<()>>,
}

impl UploadEngine {
    pub fn new(
        store: StoreHandle,
        repo: Repository,
        staging: StagingArea,
        pool: BlockingPool,
        tasks: TaskQueue,
        images: ImageConfig,
    ) -> Self {
        Self { store, repo, staging, pool, tasks, images, gate: Arc::new(RwLock::new(())) }
    }

    /// Wire up everything from configuration. Must be called from within a
    /// Tokio runtime, since it starts the deferred task workers.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let store = open_store(&config.storage).await?;
        let database = Database::connect(&config.database.path).await.or_raise(|| ErrorKind::Records)?;
        let tasks = TaskQueue::spawn(Arc::clone(&store), QueueOptions::from(&config.workers));
        Ok(Self::new(
            store,
            Repository::from(&database),
            StagingArea::from(&config.staging),
            BlockingPool::new(config.workers.blocking_threads),
            tasks,
            config.images.clone(),
        ))
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    pub fn tasks(&self) -> &TaskQueue {
        &self.tasks
    }

    /// Let queued content work finish, then stop the task workers.
    pub async fn shutdown(&self) {
        self.tasks.shutdown().await;
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Open a session on a manga.
    ///
    /// With a `chapter_id` the session edits that chapter: it starts with one
    /// blob per existing page (`1.jpg`, `2.jpg`, ...), in page order, each a
    /// copy of the page's content.
    #[tracing::instrument(skip(self), fields(user = %actor.user_id))]
    pub async fn begin(&self, actor: Actor, request: BeginSession) -> Result<SessionDetail> {
        let manga = self
            .repo
            .get_manga(request.manga_id)
            .await
            .or_raise(|| ErrorKind::Records)?
            .ok_or_raise(|| ErrorKind::NotFound(Entity::Manga(request.manga_id)))?;
        let chapter = match request.chapter_id {
            Some(id) => {
                let chapter = self
                    .repo
                    .get_chapter(id)
                    .await
                    .or_raise(|| ErrorKind::Records)?
                    .ok_or_raise(|| ErrorKind::NotFound(Entity::Chapter(id)))?;
                if chapter.manga_id != manga.id {
                    exn::bail!(ErrorKind::from(Rejection::ChapterMangaMismatch(id, manga.id)));
                }
                Some(chapter)
            },
            None => None,
        };

        let session = Session::new(actor.user_id, manga.id, request.chapter_id);
        self.repo.insert_session(&session).await.or_raise(|| ErrorKind::Records)?;
        debug!(session = %session.id, edit = session.is_edit(), "Created upload session");

        let seeded = match (self.staging.create(session.id).await, &chapter) {
            (Ok(_), Some(chapter)) => self.seed(&session, chapter).await,
            (Ok(_), None) => Ok(vec![]),
            (Err(e), _) => Err(e),
        };
        match seeded {
            Ok(blobs) => Ok(SessionDetail { session, blobs }),
            Err(e) => {
                self.abandon(session.id).await;
                Err(e)
            },
        }
    }

    async fn seed(&self, session: &Session, chapter: &Chapter) -> Result<Vec<Blob>> {
        let blobs = (1..=chapter.length).map(|n| Blob::new(session.id, format!("{n}.jpg"))).collect::<Vec<_>>();
        let written: Result<()> = async {
            for (blob, number) in blobs.iter().zip(1..) {
                let page = page_key(chapter.manga_id, chapter.id, number);
                self.store.copy(&page, &blob_key(blob.id)).await.or_raise(|| ErrorKind::Storage)?;
            }
            Ok(())
        }
        .await;
        self.register_blobs(&blobs, written).await?;
        debug!(session = %session.id, pages = blobs.len(), "Seeded session from chapter");
        Ok(blobs)
    }

    /// Undo a session that failed to start.
    async fn abandon(&self, session_id: Uuid) {
        self.release_workspace(session_id).await;
        if let Err(e) = self.repo.delete_session(session_id).await {
            warn!(session = %session_id, error = ?e, "Could not remove abandoned session");
        }
    }

    /// A session and its blobs, in insertion order.
    pub async fn session(&self, session_id: Uuid) -> Result<SessionDetail> {
        let session = self.require_session(session_id).await?;
        let blobs = self.repo.list_blobs(session_id).await.or_raise(|| ErrorKind::Records)?;
        Ok(SessionDetail { session, blobs })
    }

    /// Discard a session without committing it.
    #[tracing::instrument(skip(self))]
    pub async fn delete_session(&self, session_id: Uuid) -> Result<()> {
        let blobs = self.repo.list_blobs(session_id).await.or_raise(|| ErrorKind::Records)?;
        if !self.repo.delete_session(session_id).await.or_raise(|| ErrorKind::Records)? {
            exn::bail!(ErrorKind::NotFound(Entity::Session(session_id)));
        }
        self.release_workspace(session_id).await;
        self.purge(blobs.iter().map(|blob| blob.id).collect()).await?;
        info!(blobs = blobs.len(), "Deleted upload session");
        Ok(())
    }

    /// Turn the session into a chapter, pages in `page_order`.
    ///
    /// The chapter record is written (and the session removed) before this
    /// returns; the page content follows shortly after, once the queued
    /// materialisation has run.
    #[tracing::instrument(skip(self, request), fields(pages = request.page_order.len()))]
    pub async fn commit(&self, session_id: Uuid, request: CommitSession) -> Result<CommitOutcome> {
        let CommitSession { chapter: draft, page_order } = request;
        let session = self.require_session(session_id).await?;
        if page_order.is_empty() {
            exn::bail!(ErrorKind::from(Rejection::EmptyPageOrder));
        }
        let ordered = page_order.iter().copied().collect::<HashSet<_>>();
        if ordered.len() != page_order.len() {
            exn::bail!(ErrorKind::from(Rejection::DuplicatePages));
        }
        let staged = self.blob_ids(session_id).await?;
        let foreign = page_order.iter().filter(|id| !staged.contains(id)).copied().collect::<Vec<_>>();
        if !foreign.is_empty() {
            exn::bail!(ErrorKind::from(Rejection::ForeignPages(foreign)));
        }

        let length = u32::try_from(page_order.len()).or_raise(|| ErrorKind::Records)?;
        let write = match session.chapter_id {
            Some(id) => ChapterWrite::Update { id, draft, length },
            None => ChapterWrite::Create(Chapter::new(session.manga_id, Some(session.owner_id), draft, length)),
        };

        let gate = self.gate.read().await;
        let chapter = match self.repo.commit_session(session_id, write).await {
            Ok(chapter) => chapter,
            Err(e) => {
                let kind = match &*e {
                    RecordsErrorKind::NotFound("chapter", id) => ErrorKind::NotFound(Entity::Chapter(*id)),
                    RecordsErrorKind::NotFound(_, id) => ErrorKind::NotFound(Entity::Session(*id)),
                    _ => ErrorKind::Records,
                };
                return Err(e.raise(kind));
            },
        };
        self.release_workspace(session_id).await;

        let edit = session.is_edit();
        let unused = staged.difference(&ordered).copied().collect::<Vec<_>>();
        self.tasks
            .enqueue(Task::Materialize { manga_id: chapter.manga_id, chapter_id: chapter.id, pages: page_order, edit })
            .await?;
        self.purge(unused).await?;
        drop(gate);

        info!(
            chapter = %chapter.id,
            length = chapter.length,
            version = chapter.version,
            edit,
            "Committed upload session"
        );
        Ok(if edit { CommitOutcome::Edited(chapter) } else { CommitOutcome::Created(chapter) })
    }

    // =========================================================================
    // Pages
    // =========================================================================

    /// Ingest uploaded images and archives, appending the resulting pages to
    /// the session in upload order.
    ///
    /// The batch is all-or-nothing: a rejected or failed file leaves the
    /// session as it was.
    #[tracing::instrument(skip(self, uploads), fields(uploads = uploads.len()))]
    pub async fn add_pages(&self, session_id: Uuid, uploads: Vec<Upload>) -> Result<Vec<Blob>> {
        self.require_session(session_id).await?;
        let workspace = self.staging.open(session_id).await?;
        let batch = ingest::prepare(&self.pool, &workspace, uploads, self.images.jpeg_quality).await?;

        let blobs = batch.pages().iter().map(|page| Blob::new(session_id, page.name.clone())).collect::<Vec<_>>();
        let written: Result<()> = async {
            for (blob, page) in blobs.iter().zip(batch.pages()) {
                let data = tokio::fs::read(&page.path).await.or_raise(|| ErrorKind::Staging)?;
                self.store.put(&blob_key(blob.id), &data).await.or_raise(|| ErrorKind::Storage)?;
            }
            Ok(())
        }
        .await;
        self.register_blobs(&blobs, written).await?;
        info!(blobs = blobs.len(), "Added pages to session");
        Ok(blobs)
    }

    /// Remove every page from a session.
    #[tracing::instrument(skip(self))]
    pub async fn delete_all_pages(&self, session_id: Uuid) -> Result<()> {
        self.require_session(session_id).await?;
        let ids = self.blob_ids(session_id).await?.into_iter().collect::<Vec<_>>();
        self.repo.delete_blobs(session_id, &ids).await.or_raise(|| ErrorKind::Records)?;
        debug!(blobs = ids.len(), "Removed all pages from session");
        self.purge(ids).await
    }

    /// Remove one page from a session.
    ///
    /// Any id outside the session's current pages is rejected, whether it
    /// belongs to another session, was already removed, or never existed.
    #[tracing::instrument(skip(self))]
    pub async fn delete_page(&self, session_id: Uuid, blob_id: Uuid) -> Result<()> {
        self.require_session(session_id).await?;
        if !self.repo.delete_blob(session_id, blob_id).await.or_raise(|| ErrorKind::Records)? {
            exn::bail!(ErrorKind::from(Rejection::BlobNotInSession(blob_id)));
        }
        self.purge(vec![blob_id]).await
    }

    /// Join the selected pages top to bottom and cut them into parts no
    /// taller than `part_ratio × width`.
    ///
    /// The parts (`slice_1.jpg`, `slice_2.jpg`, ...) are appended to the
    /// session and the selected pages removed. A page may be selected more
    /// than once. Returns the session's blobs after the change.
    #[tracing::instrument(skip(self, selection), fields(selected = selection.len()))]
    pub async fn slice_pages(&self, session_id: Uuid, selection: Vec<Uuid>) -> Result<Vec<Blob>> {
        self.require_session(session_id).await?;
        if selection.is_empty() {
            exn::bail!(ErrorKind::from(Rejection::EmptySelection));
        }
        let staged = self.blob_ids(session_id).await?;
        let mut consumed = Vec::with_capacity(selection.len());
        let mut foreign = vec![];
        for id in &selection {
            let target = if staged.contains(id) { &mut consumed } else { &mut foreign };
            if !target.contains(id) {
                target.push(*id);
            }
        }
        if !foreign.is_empty() {
            exn::bail!(ErrorKind::from(Rejection::ForeignSelection(foreign)));
        }

        let mut sources = Vec::with_capacity(selection.len());
        for id in &selection {
            sources.push(self.store.get(&blob_key(*id)).await.or_raise(|| ErrorKind::Storage)?);
        }
        let ImageConfig { jpeg_quality: quality, part_ratio: ratio, max_slice_pixels } = self.images.clone();
        let parts = self
            .pool
            .run(move || {
                let images = sources.iter().map(|data| codec::decode_stored(data)).collect::<Result<Vec<_>>>()?;
                let parts = slice::cut(&images, ratio, max_slice_pixels)?;
                parts.iter().map(|part| codec::encode(part, quality)).collect::<Result<Vec<_>>>()
            })
            .await?;

        let blobs = (1..=parts.len()).map(|n| Blob::new(session_id, format!("slice_{n}.jpg"))).collect::<Vec<_>>();
        let written: Result<()> = async {
            for (blob, part) in blobs.iter().zip(&parts) {
                self.store.put(&blob_key(blob.id), part).await.or_raise(|| ErrorKind::Storage)?;
            }
            Ok(())
        }
        .await;
        self.register_blobs(&blobs, written).await?;

        self.repo.delete_blobs(session_id, &consumed).await.or_raise(|| ErrorKind::Records)?;
        debug!(parts = blobs.len(), consumed = consumed.len(), "Sliced pages");
        self.purge(consumed).await?;
        self.repo.list_blobs(session_id).await.or_raise(|| ErrorKind::Records)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Remove staging workspaces and staged content that no session refers
    /// to any more, left behind by crashes or failed cleanups.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.reconcile_with_grace(RECONCILE_GRACE).await
    }

    /// [`reconcile`](Self::reconcile) with a custom grace period for staged
    /// content.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile_with_grace(&self, grace: Duration) -> Result<ReconcileReport> {
        // Committed sessions have no blob records left, but their content is
        // still staged until materialisation runs.
        let _gate = self.gate.write().await;
        self.tasks.wait_idle().await;

        let live = self.repo.list_session_ids().await.or_raise(|| ErrorKind::Records)?;
        let workspaces = self.staging.sweep(&live.into_iter().collect()).await?;

        let cutoff = OffsetDateTime::now_utc() - grace;
        let listed: Vec<ObjectInfo> =
            self.store.list_stream(Some(Path::new(BLOB_PREFIX))).try_collect().await.or_raise(|| ErrorKind::Storage)?;
        let candidates = listed
            .iter()
            .filter(|info| info.modified <= cutoff)
            .filter_map(|info| blob_id_from_key(&info.key))
            .collect::<Vec<_>>();
        let known = self.repo.blob_ids_in(&candidates).await.or_raise(|| ErrorKind::Records)?;
        let blobs = candidates.into_iter().filter(|id| !known.contains(id)).collect::<Vec<_>>();
        let keys = blobs.iter().copied().map(blob_key).collect::<Vec<_>>();
        self.store.remove_many(&keys).await.or_raise(|| ErrorKind::Storage)?;

        info!(workspaces = workspaces.len(), blobs = blobs.len(), "Reconciled staging");
        Ok(ReconcileReport { workspaces, blobs })
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn require_session(&self, session_id: Uuid) -> Result<Session> {
        self.repo
            .get_session(session_id)
            .await
            .or_raise(|| ErrorKind::Records)?
            .ok_or_raise(|| ErrorKind::NotFound(Entity::Session(session_id)))
    }

    async fn blob_ids(&self, session_id: Uuid) -> Result<HashSet<Uuid>> {
        let blobs = self.repo.list_blobs(session_id).await.or_raise(|| ErrorKind::Records)?;
        Ok(blobs.into_iter().map(|blob| blob.id).collect())
    }

    /// Record blobs whose content was just `written`, all at once. If either
    /// step failed, whatever content made it to the store is purged.
    async fn register_blobs(&self, blobs: &[Blob], written: Result<()>) -> Result<()> {
        let result = match written {
            Ok(()) => self.repo.insert_blobs(blobs).await.or_raise(|| ErrorKind::Records),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(blobs = blobs.len(), error = ?e, "Discarding partially stored blobs");
            if let Err(queue_error) = self.purge(blobs.iter().map(|blob| blob.id).collect()).await {
                warn!(error = ?queue_error, "Could not queue purge of discarded blobs");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn purge(&self, blob_ids: Vec<Uuid>) -> Result<()> {
        if blob_ids.is_empty() {
            return Ok(());
        }
        self.tasks.enqueue(Task::Purge { blob_ids }).await
    }

    async fn release_workspace(&self, session_id: Uuid) {
        if let Err(e) = self.staging.remove(session_id).await {
            warn!(session = %session_id, error = ?e, "Could not remove staging workspace");
        }
    }
}
