//! Upload Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.
//!
//! [`ErrorKind::Invalid`] and [`ErrorKind::NotFound`] are the caller's fault
//! and carry enough detail to tell them what to fix. Every other kind is a
//! service failure whose cause hangs off the error tree as a child (storage,
//! records, archive, ...).

use derive_more::{Display, Error};
use uuid::Uuid;

/// An upload error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for upload operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a request was refused.
///
/// Each condition is its own variant so callers can react to (and report)
/// exactly what was wrong with their input.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The file is neither a supported archive nor an image.
    #[display("unsupported file type: {_0}")]
    UnsupportedFileType(#[error(not(source))] String),
    /// The file claimed to be an image (or came out of an archive) but
    /// couldn't be decoded.
    #[display("not a readable image: {_0}")]
    NotAnImage(#[error(not(source))] String),
    #[display("archive could not be read: {_0}")]
    UnreadableArchive(#[error(not(source))] String),
    #[display("page order is empty")]
    EmptyPageOrder,
    #[display("some pages are identical")]
    DuplicatePages,
    #[display("pages are not part of this session: {_0:?}")]
    ForeignPages(#[error(not(source))] Vec<Uuid>),
    #[display("no pages selected for slicing")]
    EmptySelection,
    #[display("pages selected for slicing are not part of this session: {_0:?}")]
    ForeignSelection(#[error(not(source))] Vec<Uuid>),
    #[display("all the images should have the same width")]
    WidthMismatch,
    /// The stitched strip would exceed the configured pixel budget.
    #[display("selected pages are too large to slice together: {_0} pixels, at most {_1}")]
    SliceTooLarge(#[error(not(source))] u64, u64),
    #[display("chapter {_0} does not belong to manga {_1}")]
    ChapterMangaMismatch(#[error(not(source))] Uuid, Uuid),
    #[display("blob {_0} is not part of this session")]
    BlobNotInSession(#[error(not(source))] Uuid),
}

/// The kind of record that couldn't be found.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    #[display("session {_0}")]
    Session(Uuid),
    #[display("chapter {_0}")]
    Chapter(Uuid),
    #[display("manga {_0}")]
    Manga(Uuid),
}

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request is invalid; don't retry it unchanged.
    #[display("{_0}")]
    Invalid(#[error(not(source))] Rejection),
    #[display("{_0} not found")]
    NotFound(#[error(not(source))] Entity),
    /// A content store operation failed.
    #[display("content store failure")]
    Storage,
    /// A records (database) operation failed.
    #[display("records failure")]
    Records,
    /// The local staging workspace couldn't be created, written or removed.
    #[display("staging workspace failure")]
    Staging,
    /// An archive couldn't be extracted.
    #[display("archive extraction failure")]
    Archive,
    /// Encoding a page (or decoding our own staged page) failed.
    #[display("image processing failure")]
    Image,
    /// A blocking job panicked or was cancelled.
    #[display("blocking worker failure")]
    Worker,
    /// The deferred task queue has shut down.
    #[display("deferred task queue unavailable")]
    Queue,
}
impl From<Rejection> for ErrorKind {
    fn from(rejection: Rejection) -> Self {
        Self::Invalid(rejection)
    }
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage | Self::Records | Self::Staging | Self::Worker)
    }

    /// Returns `true` if the caller sent something that can never succeed.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Invalid(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejections_name_the_offender() {
        let err = ErrorKind::from(Rejection::UnsupportedFileType("notes.txt".to_string()));
        assert_eq!(err.to_string(), "unsupported file type: notes.txt");
        assert!(err.is_rejection());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_found_names_the_entity() {
        let err = ErrorKind::NotFound(Entity::Session(Uuid::nil()));
        assert_eq!(err.to_string(), "session 00000000-0000-0000-0000-000000000000 not found");
    }

    #[test]
    fn test_service_failures_are_retryable() {
        assert!(ErrorKind::Storage.is_retryable());
        assert!(!ErrorKind::Queue.is_retryable());
    }
}
