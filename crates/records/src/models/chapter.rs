use super::{count, parse_id, parse_time};
use crate::error::{Error, ErrorKind};
use exn::ResultExt;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

const DEFAULT_SCAN_GROUP: &str = "no group";

fn default_scan_group() -> String {
    DEFAULT_SCAN_GROUP.to_string()
}

/// Caller-supplied chapter metadata, used both to create and to edit a
/// chapter on commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterDraft {
    pub name: String,
    #[serde(default = "default_scan_group")]
    pub scan_group: String,
    #[serde(default)]
    pub volume: Option<i32>,
    pub number: f64,
    #[serde(default)]
    pub webtoon: bool,
}
impl ChapterDraft {
    pub fn new(name: impl Into<String>, number: f64) -> Self {
        Self {
            name: name.into(),
            scan_group: default_scan_group(),
            volume: None,
            number,
            webtoon: false,
        }
    }
}

/// A published chapter.
///
/// `length` is the number of pages under `{manga_id}/{id}/` in the content
/// store, numbered from 1. `version` starts at 1 and increases on each edit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chapter {
    pub id: Uuid,
    pub manga_id: Uuid,
    pub owner_id: Option<Uuid>,
    pub name: String,
    pub scan_group: String,
    pub volume: Option<i32>,
    pub number: f64,
    pub length: u32,
    pub webtoon: bool,
    pub version: u32,
    pub upload_time: OffsetDateTime,
}
impl Chapter {
    /// A brand new chapter at version 1.
    pub fn new(manga_id: Uuid, owner_id: Option<Uuid>, draft: ChapterDraft, length: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            manga_id,
            owner_id,
            name: draft.name,
            scan_group: draft.scan_group,
            volume: draft.volume,
            number: draft.number,
            length,
            webtoon: draft.webtoon,
            version: 1,
            upload_time: OffsetDateTime::now_utc(),
        }
    }
}

/// How a commit writes its chapter.
#[derive(Debug, Clone, PartialEq)]
pub enum ChapterWrite {
    /// Insert a new chapter.
    Create(Chapter),
    /// Overwrite an existing chapter's metadata and length, bumping its version.
    Update { id: Uuid, draft: ChapterDraft, length: u32 },
}

#[derive(sqlx::FromRow)]
pub(crate) struct ChapterRow {
    pub(crate) id: String,
    pub(crate) manga_id: String,
    pub(crate) owner_id: Option<String>,
    pub(crate) name: String,
    pub(crate) scan_group: String,
    pub(crate) volume: Option<i64>,
    pub(crate) number: f64,
    pub(crate) length: i64,
    pub(crate) webtoon: bool,
    pub(crate) version: i64,
    pub(crate) upload_time: i64,
}
impl From<&Chapter> for ChapterRow {
    fn from(chapter: &Chapter) -> Self {
        Self {
            id: chapter.id.to_string(),
            manga_id: chapter.manga_id.to_string(),
            owner_id: chapter.owner_id.map(|id| id.to_string()),
            name: chapter.name.clone(),
            scan_group: chapter.scan_group.clone(),
            volume: chapter.volume.map(i64::from),
            number: chapter.number,
            length: i64::from(chapter.length),
            webtoon: chapter.webtoon,
            version: i64::from(chapter.version),
            upload_time: chapter.upload_time.unix_timestamp(),
        }
    }
}
impl TryFrom<ChapterRow> for Chapter {
    type Error = Error;
    fn try_from(row: ChapterRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_id(&row.id, "chapter id")?,
            manga_id: parse_id(&row.manga_id, "chapter manga")?,
            owner_id: row.owner_id.as_deref().map(|id| parse_id(id, "chapter owner")).transpose()?,
            name: row.name,
            scan_group: row.scan_group,
            volume: row
                .volume
                .map(i32::try_from)
                .transpose()
                .or_raise(|| ErrorKind::InvalidData("chapter volume"))?,
            number: row.number,
            length: count(row.length, "chapter length")?,
            webtoon: row.webtoon,
            version: count(row.version, "chapter version")?,
            upload_time: parse_time(row.upload_time, "chapter upload time")?,
        })
    }
}
