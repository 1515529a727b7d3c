//! Upload sessions for manga chapters.
//!
//! An upload session collects pages ("blobs") for one chapter before it is
//! published:
//!
//! 1. [`begin`](UploadEngine::begin) opens a session on a manga, optionally
//!    seeded with an existing chapter's pages (edit mode).
//! 2. [`add_pages`](UploadEngine::add_pages) ingests images and archives of
//!    images. Everything is re-encoded as an RGB JPEG and staged in the
//!    content store under `blobs/{id}.jpg`.
//! 3. [`slice_pages`](UploadEngine::slice_pages) optionally re-paginates long
//!    strip pages.
//! 4. [`commit`](UploadEngine::commit) writes the chapter with the chosen page
//!    order. Staged pages are moved to `{manga}/{chapter}/{n}.jpg` shortly
//!    after, by the deferred [`TaskQueue`].
//!
//! A session can instead be abandoned with
//! [`delete_session`](UploadEngine::delete_session). Either way its staged
//! content is cleaned up in the background.
//!
//! CPU-heavy work (decoding, encoding, archive extraction) runs on a
//! [`BlockingPool`], never on the async workers.
//!
//! # Example
//!
//! ```no_run
//! use quire_config::Config;
//! use quire_records::ChapterDraft;
//! use quire_upload::{Actor, BeginSession, CommitSession, Upload, UploadEngine};
//! use uuid::Uuid;
//!
//! # async fn example(manga_id: Uuid, user_id: Uuid, png: Vec<u8>) -> quire_upload::error::Result<()> {
//! let engine = UploadEngine::from_config(&Config::default()).await?;
//! let session = engine.begin(Actor::new(user_id), BeginSession { manga_id, chapter_id: None }).await?;
//! let blobs = engine.add_pages(session.session.id, vec![Upload::new("1.png", "image/png", png)]).await?;
//! let page_order = blobs.iter().map(|blob| blob.id).collect();
//! let outcome = engine
//!     .commit(session.session.id, CommitSession { chapter: ChapterDraft::new("Chapter 1", 1.0), page_order })
//!     .await?;
//! assert_eq!(outcome.status_code(), 201);
//! # Ok(())
//! # }
//! ```

mod codec;
mod engine;
pub mod error;
pub mod ingest;
pub mod keys;
mod models;
mod pool;
pub mod slice;
mod staging;
pub mod tasks;

pub use crate::engine::{RECONCILE_GRACE, UploadEngine, open_store};
pub use crate::models::{
    Actor, BeginSession, CommitOutcome, CommitSession, ReconcileReport, SessionDetail, Upload,
};
pub use crate::pool::BlockingPool;
pub use crate::staging::{StagingArea, Workspace};
pub use crate::tasks::{QueueOptions, Task, TaskQueue};
