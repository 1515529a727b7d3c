//! Deferred content operations.
//!
//! Commits and deletions only touch the records (and the local staging
//! workspace) before returning. Moving staged content into place and
//! deleting content nobody references any more happen afterwards, on a
//! bounded queue drained by a fixed set of workers.
//!
//! ```text
//! commit / delete / slice
//!        |
//!        v
//!   TaskQueue::enqueue  (bounded mpsc, waits when full)
//!        |
//!        v
//!   worker 1..N  --> handler --> retry with backoff on retryable failures
//! ```
//!
//! Delivery is at-least-once: a task may run again after a retry (or after a
//! crash, once reconciliation has re-discovered the leftovers), so both
//! handlers are idempotent.

use crate::error::{ErrorKind, Result};
use crate::keys::{blob_key, chapter_prefix, page_key};
use quire_config::WorkerConfig;
use quire_storage::StoreHandle;
use quire_storage::error::Result as StorageResult;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Delay before the first retry; doubled on every further attempt.
pub const BASE_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    /// Move staged blobs into a chapter, `pages[0]` becoming page 1.
    ///
    /// In edit mode, pages beyond the new length are removed afterwards.
    Materialize { manga_id: Uuid, chapter_id: Uuid, pages: Vec<Uuid>, edit: bool },
    /// Permanently delete staged content.
    Purge { blob_ids: Vec<Uuid> },
}
impl Task {
    fn kind(&self) -> &'static str {
        match self {
            Self::Materialize { .. } => "materialize",
            Self::Purge { .. } => "purge",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    pub workers: usize,
    pub capacity: usize,
    pub max_attempts: u32,
    pub backoff: Duration,
}
impl From<&WorkerConfig> for QueueOptions {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            workers: config.deferred_workers,
            capacity: config.queue_capacity,
            max_attempts: config.max_attempts,
            backoff: BASE_BACKOFF,
        }
    }
}
impl Default for QueueOptions {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

/// Handle to the deferred task queue. Clones share the same workers.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

struct Inner {
    sender: mpsc::Sender<Task>,
    pending: watch::Sender<usize>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// State shared by the workers.
struct Worker {
    store: StoreHandle,
    receiver: Mutex<mpsc::Receiver<Task>>,
    pending: watch::Sender<usize>,
    cancel: CancellationToken,
    max_attempts: u32,
    backoff: Duration,
}

impl TaskQueue {
    /// Start the workers. Must be called from within a Tokio runtime.
    pub fn spawn(store: StoreHandle, options: QueueOptions) -> Self {
        let (sender, receiver) = mpsc::channel(options.capacity.max(1));
        let (pending, _) = watch::channel(0usize);
        let cancel = CancellationToken::new();
        let worker = Arc::new(Worker {
            store,
            receiver: Mutex::new(receiver),
            pending: pending.clone(),
            cancel: cancel.clone(),
            max_attempts: options.max_attempts.max(1),
            backoff: options.backoff,
        });
        let workers = (0..options.workers.max(1))
            .map(|id| tokio::spawn(Arc::clone(&worker).run(id)))
            .collect();
        Self {
            inner: Arc::new(Inner { sender, pending, cancel, workers: Mutex::new(workers) }),
        }
    }

    /// Queue a task, waiting for room if the queue is full.
    ///
    /// Fails with [`ErrorKind::Queue`] once the queue has been shut down.
    pub async fn enqueue(&self, task: Task) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            exn::bail!(ErrorKind::Queue);
        }
        debug!(task = task.kind(), "Queueing deferred task");
        self.inner.pending.send_modify(|pending| *pending += 1);
        if self.inner.sender.send(task).await.is_err() {
            self.inner.pending.send_modify(|pending| *pending = pending.saturating_sub(1));
            exn::bail!(ErrorKind::Queue);
        }
        Ok(())
    }

    /// Number of queued or running tasks.
    pub fn pending(&self) -> usize {
        *self.inner.pending.borrow()
    }

    /// Resolves once every task enqueued so far has finished (successfully
    /// or not).
    pub async fn wait_idle(&self) {
        let mut pending = self.inner.pending.subscribe();
        _ = pending.wait_for(|pending| *pending == 0).await;
    }

    /// Drain the queue, then stop the workers. Tasks enqueued afterwards are
    /// refused.
    pub async fn shutdown(&self) {
        self.wait_idle().await;
        self.inner.cancel.cancel();
        let workers = std::mem::take(&mut *self.inner.workers.lock().await);
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = ?e, "Deferred task worker panicked");
            }
        }
    }
}

impl Worker {
    async fn run(self: Arc<Self>, id: usize) {
        debug!(worker = id, "Deferred task worker started");
        loop {
            let task = tokio::select! {
                _ = self.cancel.cancelled() => break,
                task = async { self.receiver.lock().await.recv().await } => match task {
                    Some(task) => task,
                    None => break,
                },
            };
            self.process(task).await;
            self.pending.send_modify(|pending| *pending = pending.saturating_sub(1));
        }
        debug!(worker = id, "Deferred task worker stopped");
    }

    #[tracing::instrument(skip_all, fields(task = task.kind()))]
    async fn process(&self, task: Task) {
        let mut attempt = 1;
        loop {
            let result = match &task {
                Task::Materialize { manga_id, chapter_id, pages, edit } => {
                    materialize(&self.store, *manga_id, *chapter_id, pages, *edit).await
                },
                Task::Purge { blob_ids } => purge(&self.store, blob_ids).await,
            };
            let e = match result {
                Ok(()) => return,
                Err(e) if e.is_retryable() && attempt < self.max_attempts => e,
                Err(e) => {
                    error!(attempt, error = ?e, ?task, "Giving up on deferred task");
                    return;
                },
            };
            let delay = self.backoff.saturating_mul(2u32.saturating_pow(attempt - 1)).min(MAX_BACKOFF);
            warn!(attempt, ?delay, error = ?e, "Deferred task failed, retrying");
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    warn!(?task, "Dropping deferred task on shutdown");
                    return;
                },
                _ = tokio::time::sleep(delay) => {},
            }
            attempt += 1;
        }
    }
}

/// Move each staged blob to its page key, then (when editing) remove pages
/// the chapter no longer has.
///
/// Re-running is harmless: a page whose blob is already gone but whose
/// destination exists was moved by an earlier run.
#[tracing::instrument(skip(store, pages), fields(store = store.name(), pages = pages.len()))]
pub async fn materialize(
    store: &StoreHandle,
    manga_id: Uuid,
    chapter_id: Uuid,
    pages: &[Uuid],
    edit: bool,
) -> StorageResult<()> {
    for (index, blob_id) in pages.iter().enumerate() {
        let (from, to) = (blob_key(*blob_id), page_key(manga_id, chapter_id, index + 1));
        match store.rename(&from, &to).await {
            Ok(()) => {},
            Err(e) if e.is_not_found() => {
                if store.exists(&to).await? {
                    debug!(page = index + 1, blob = %blob_id, "Page already in place");
                } else {
                    warn!(page = index + 1, blob = %blob_id, "Staged content is missing, page will be empty");
                }
            },
            Err(e) => return Err(e),
        }
    }
    if edit {
        let stale = store
            .list(Some(&chapter_prefix(manga_id, chapter_id)))
            .await?
            .into_iter()
            .filter(|key| !is_page_within(key, pages.len()))
            .collect::<Vec<PathBuf>>();
        if !stale.is_empty() {
            debug!(stale = stale.len(), "Removing stale pages");
            store.remove_many(&stale).await?;
        }
    }
    Ok(())
}

/// Whether `key` is one of the pages `1.jpg..=length.jpg`.
fn is_page_within(key: &Path, length: usize) -> bool {
    key.extension().is_some_and(|extension| extension == "jpg")
        && key
            .file_stem()
            .and_then(|stem| stem.to_str())
            .filter(|stem| !stem.starts_with(['0', '+']))
            .and_then(|stem| stem.parse::<usize>().ok())
            .is_some_and(|number| (1..=length).contains(&number))
}

/// Delete staged content. Missing content is not an error.
#[tracing::instrument(skip_all, fields(store = store.name(), blobs = blob_ids.len()))]
pub async fn purge(store: &StoreHandle, blob_ids: &[Uuid]) -> StorageResult<()> {
    let keys = blob_ids.iter().copied().map(blob_key).collect::<Vec<_>>();
    store.remove_many(&keys).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use quire_storage::backend::{MockBackend, ObjectInfoStream};
    use quire_storage::error::ErrorKind as StorageErrorKind;
    use quire_storage::{ContentStore, ObjectInfo};
    use rstest::rstest;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn options() -> QueueOptions {
        QueueOptions { workers: 2, capacity: 8, max_attempts: 3, backoff: Duration::from_millis(1) }
    }

    /// Fails the first `failures` renames with a network error.
    struct Flaky {
        inner: MockBackend,
        failures: AtomicU32,
    }
    #[async_trait]
    impl ContentStore for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }
        fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> ObjectInfoStream<'a> {
            self.inner.list_stream(prefix)
        }
        async fn exists(&self, key: &Path) -> StorageResult<bool> {
            self.inner.exists(key).await
        }
        async fn get(&self, key: &Path) -> StorageResult<Vec<u8>> {
            self.inner.get(key).await
        }
        async fn put(&self, key: &Path, data: &[u8]) -> StorageResult<()> {
            self.inner.put(key, data).await
        }
        async fn remove(&self, key: &Path) -> StorageResult<()> {
            self.inner.remove(key).await
        }
        async fn stat(&self, key: &Path) -> StorageResult<ObjectInfo> {
            self.inner.stat(key).await
        }
        async fn rename(&self, from: &Path, to: &Path) -> StorageResult<()> {
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
                exn::bail!(StorageErrorKind::Network("connection reset".to_string()));
            }
            self.inner.rename(from, to).await
        }
    }

    fn staged(blobs: &[Uuid]) -> MockBackend {
        MockBackend::with_objects(blobs.iter().map(|id| (blob_key(*id), id.as_bytes().to_vec())))
    }

    #[tokio::test]
    async fn test_materialize_numbers_pages_from_one() {
        let (manga, chapter) = (Uuid::new_v4(), Uuid::new_v4());
        let blobs = [Uuid::new_v4(), Uuid::new_v4()];
        let store: StoreHandle = Arc::new(staged(&blobs));
        materialize(&store, manga, chapter, &blobs, false).await.unwrap();
        assert_eq!(store.get(&page_key(manga, chapter, 1)).await.unwrap(), blobs[0].as_bytes());
        assert_eq!(store.get(&page_key(manga, chapter, 2)).await.unwrap(), blobs[1].as_bytes());
        assert!(!store.exists(&blob_key(blobs[0])).await.unwrap());

        // Running it again changes nothing.
        materialize(&store, manga, chapter, &blobs, false).await.unwrap();
        assert_eq!(store.list(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_materialize_edit_prunes_stale_pages() {
        let (manga, chapter) = (Uuid::new_v4(), Uuid::new_v4());
        let blob = Uuid::new_v4();
        let store: StoreHandle = Arc::new(MockBackend::with_objects([
            (page_key(manga, chapter, 1), b"old 1".to_vec()),
            (page_key(manga, chapter, 2), b"old 2".to_vec()),
            (page_key(manga, chapter, 3), b"old 3".to_vec()),
            (blob_key(blob), b"new 1".to_vec()),
        ]));
        materialize(&store, manga, chapter, &[blob], true).await.unwrap();
        assert_eq!(store.list(Some(&chapter_prefix(manga, chapter))).await.unwrap(), vec![page_key(manga, chapter, 1)]);
        assert_eq!(store.get(&page_key(manga, chapter, 1)).await.unwrap(), b"new 1");
    }

    #[rstest]
    #[case("1.jpg", 3, true)]
    #[case("3.jpg", 3, true)]
    #[case("4.jpg", 3, false)]
    #[case("0.jpg", 3, false)]
    #[case("01.jpg", 3, false)]
    #[case("1.png", 3, false)]
    #[case("cover.jpg", 3, false)]
    fn test_is_page_within(#[case] name: &str, #[case] length: usize, #[case] expected: bool) {
        assert_eq!(is_page_within(&Path::new("m/c").join(name), length), expected);
    }

    #[tokio::test]
    async fn test_purge_tolerates_missing_content() {
        let blobs = [Uuid::new_v4(), Uuid::new_v4()];
        let store: StoreHandle = Arc::new(staged(&blobs[..1]));
        purge(&store, &blobs).await.unwrap();
        purge(&store, &blobs).await.unwrap();
        purge(&store, &[]).await.unwrap();
        assert!(store.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queue_retries_transient_failures() {
        let (manga, chapter, blob) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let store: StoreHandle = Arc::new(Flaky { inner: staged(&[blob]), failures: AtomicU32::new(2) });
        let queue = TaskQueue::spawn(Arc::clone(&store), options());
        let task = Task::Materialize { manga_id: manga, chapter_id: chapter, pages: vec![blob], edit: false };
        queue.enqueue(task).await.unwrap();
        queue.wait_idle().await;
        assert!(store.exists(&page_key(manga, chapter, 1)).await.unwrap());
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_queue_gives_up_after_max_attempts() {
        let (manga, chapter, blob) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let store: StoreHandle = Arc::new(Flaky { inner: staged(&[blob]), failures: AtomicU32::new(10) });
        let queue = TaskQueue::spawn(Arc::clone(&store), options());
        let task = Task::Materialize { manga_id: manga, chapter_id: chapter, pages: vec![blob], edit: false };
        queue.enqueue(task).await.unwrap();
        queue.wait_idle().await;
        assert_eq!(queue.pending(), 0);
        assert!(store.exists(&blob_key(blob)).await.unwrap());
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_tasks() {
        let queue = TaskQueue::spawn(Arc::new(MockBackend::default()), options());
        queue.enqueue(Task::Purge { blob_ids: vec![Uuid::new_v4()] }).await.unwrap();
        queue.shutdown().await;
        assert_eq!(queue.pending(), 0);
        let err = queue.enqueue(Task::Purge { blob_ids: vec![] }).await.unwrap_err();
        assert_eq!(*err, ErrorKind::Queue);
    }
}
