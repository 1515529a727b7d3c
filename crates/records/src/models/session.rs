use super::{parse_id, parse_time};
use crate::error::Error;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

/// An in-progress upload session.
///
/// A session with a `chapter_id` is in edit mode: it was seeded from that
/// chapter's pages and commits back into it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub manga_id: Uuid,
    pub chapter_id: Option<Uuid>,
    pub created_at: OffsetDateTime,
}
impl Session {
    pub fn new(owner_id: Uuid, manga_id: Uuid, chapter_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            manga_id,
            chapter_id,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn is_edit(&self) -> bool {
        self.chapter_id.is_some()
    }
}

/// A staged page. Content lives in the content store under `blobs/{id}.jpg`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Blob {
    pub id: Uuid,
    pub session_id: Uuid,
    pub name: String,
}
impl Blob {
    pub fn new(session_id: Uuid, name: impl Into<String>) -> Self {
        Self { id: Uuid::new_v4(), session_id, name: name.into() }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct SessionRow {
    pub(crate) id: String,
    pub(crate) owner_id: String,
    pub(crate) manga_id: String,
    pub(crate) chapter_id: Option<String>,
    pub(crate) created_at: i64,
}
impl From<&Session> for SessionRow {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.to_string(),
            owner_id: session.owner_id.to_string(),
            manga_id: session.manga_id.to_string(),
            chapter_id: session.chapter_id.map(|id| id.to_string()),
            created_at: session.created_at.unix_timestamp(),
        }
    }
}
impl TryFrom<SessionRow> for Session {
    type Error = Error;
    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_id(&row.id, "session id")?,
            owner_id: parse_id(&row.owner_id, "session owner")?,
            manga_id: parse_id(&row.manga_id, "session manga")?,
            chapter_id: row.chapter_id.as_deref().map(|id| parse_id(id, "session chapter")).transpose()?,
            created_at: parse_time(row.created_at, "session creation date")?,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct BlobRow {
    pub(crate) id: String,
    pub(crate) session_id: String,
    pub(crate) name: String,
}
impl TryFrom<BlobRow> for Blob {
    type Error = Error;
    fn try_from(row: BlobRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_id(&row.id, "blob id")?,
            session_id: parse_id(&row.session_id, "blob session")?,
            name: row.name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_edit_mode() {
        let session = Session::new(Uuid::new_v4(), Uuid::new_v4(), None);
        assert!(!session.is_edit());
        let session = Session::new(Uuid::new_v4(), Uuid::new_v4(), Some(Uuid::new_v4()));
        assert!(session.is_edit());
    }

    #[test]
    fn test_corrupt_blob_id() {
        let row = BlobRow {
            id: "not-a-uuid".to_string(),
            session_id: Uuid::nil().to_string(),
            name: "1.jpg".to_string(),
        };
        let err = Blob::try_from(row).unwrap_err();
        assert_eq!(*err, ErrorKind::InvalidData("blob id"));
    }
}
