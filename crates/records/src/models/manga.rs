use super::{parse_id, parse_time};
use crate::error::Error;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

/// A manga, the parent of chapters and the target of upload sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Manga {
    pub id: Uuid,
    pub title: String,
    pub owner_id: Uuid,
    pub created_at: OffsetDateTime,
}
impl Manga {
    pub fn new(title: impl Into<String>, owner_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            owner_id,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct MangaRow {
    pub(crate) id: String,
    pub(crate) title: String,
    pub(crate) owner_id: String,
    pub(crate) created_at: i64,
}
impl From<&Manga> for MangaRow {
    fn from(manga: &Manga) -> Self {
        Self {
            id: manga.id.to_string(),
            title: manga.title.clone(),
            owner_id: manga.owner_id.to_string(),
            created_at: manga.created_at.unix_timestamp(),
        }
    }
}
impl TryFrom<MangaRow> for Manga {
    type Error = Error;
    fn try_from(row: MangaRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_id(&row.id, "manga id")?,
            title: row.title,
            owner_id: parse_id(&row.owner_id, "manga owner")?,
            created_at: parse_time(row.created_at, "manga creation date")?,
        })
    }
}
