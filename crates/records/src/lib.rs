//! SQLite entity store for upload sessions.
//!
//! Holds the records the upload pipeline coordinates on: manga, chapters,
//! in-progress upload sessions and the blobs staged in them. Blob *content*
//! lives in the content store; a blob row is metadata only.
//!
//! # Relationships
//! - A chapter belongs to one manga.
//! - A session targets one manga, and optionally one chapter (edit mode).
//! - A blob belongs to exactly one session and keeps its insertion position.
//!
//! Foreign keys are enforced but never cascade. Deleting a session removes
//! its blobs first, explicitly, inside the same transaction.

mod db;
pub mod error;
mod models;
mod repo;

pub use crate::db::Database;
pub use crate::models::{Blob, Chapter, ChapterDraft, ChapterWrite, Manga, Session};
pub use crate::repo::Repository;
