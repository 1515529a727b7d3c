use quire_records::{Blob, Chapter, ChapterDraft, Session};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The already-authorised user performing an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Uuid,
}
impl Actor {
    pub fn new(user_id: Uuid) -> Self {
        Self { user_id }
    }
}

/// Start a session for a manga. With a `chapter_id` the session edits that
/// chapter, seeded with its current pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct BeginSession {
    pub manga_id: Uuid,
    #[serde(default)]
    pub chapter_id: Option<Uuid>,
}

/// One uploaded file, as received.
#[derive(Debug, Clone)]
pub struct Upload {
    /// Client-supplied name; only its final path component is used.
    pub filename: String,
    /// Declared MIME type.
    pub mime: String,
    pub data: Vec<u8>,
}
impl Upload {
    pub fn new(filename: impl Into<String>, mime: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self { filename: filename.into(), mime: mime.into(), data: data.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CommitSession {
    pub chapter: ChapterDraft,
    /// Blob ids in final page order.
    pub page_order: Vec<Uuid>,
}

/// What a commit did to its chapter.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Created(Chapter),
    Edited(Chapter),
}
impl CommitOutcome {
    /// HTTP-style status: `201` for a new chapter, `200` for an edit.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Created(_) => 201,
            Self::Edited(_) => 200,
        }
    }

    pub fn chapter(&self) -> &Chapter {
        match self {
            Self::Created(chapter) | Self::Edited(chapter) => chapter,
        }
    }

    pub fn into_chapter(self) -> Chapter {
        match self {
            Self::Created(chapter) | Self::Edited(chapter) => chapter,
        }
    }
}

/// A session with its blobs in insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionDetail {
    #[serde(flatten)]
    pub session: Session,
    pub blobs: Vec<Blob>,
}
impl SessionDetail {
    pub fn blob_ids(&self) -> Vec<Uuid> {
        self.blobs.iter().map(|blob| blob.id).collect()
    }
}

/// What a reconciliation sweep removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Staging workspaces whose session no longer exists.
    pub workspaces: Vec<Uuid>,
    /// Staged content with no blob record.
    pub blobs: Vec<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let chapter = Chapter::new(Uuid::new_v4(), None, ChapterDraft::new("One", 1.0), 3);
        assert_eq!(CommitOutcome::Created(chapter.clone()).status_code(), 201);
        let edited = CommitOutcome::Edited(chapter.clone());
        assert_eq!(edited.status_code(), 200);
        assert_eq!(edited.into_chapter(), chapter);
    }

    #[test]
    fn test_commit_request_shape() {
        let id = Uuid::new_v4();
        let request: CommitSession = serde_json::from_value(serde_json::json!({
            "chapter": {"name": "Finale", "number": 12, "webtoon": true},
            "page_order": [id],
        }))
        .unwrap();
        assert_eq!(request.page_order, vec![id]);
        assert_eq!(request.chapter.scan_group, "no group");
        assert!(request.chapter.webtoon);
    }
}
