mod chapter;
mod manga;
mod session;

pub use self::chapter::{Chapter, ChapterDraft, ChapterWrite};
pub(crate) use self::chapter::ChapterRow;
pub use self::manga::Manga;
pub(crate) use self::manga::MangaRow;
pub use self::session::{Blob, Session};
pub(crate) use self::session::{BlobRow, SessionRow};
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use time::OffsetDateTime;
use uuid::Uuid;

pub(crate) fn parse_id(value: &str, what: &'static str) -> Result<Uuid> {
    Uuid::parse_str(value).or_raise(|| ErrorKind::InvalidData(what))
}

pub(crate) fn parse_time(value: i64, what: &'static str) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(value).or_raise(|| ErrorKind::InvalidData(what))
}

pub(crate) fn count(value: i64, what: &'static str) -> Result<u32> {
    u32::try_from(value).or_raise(|| ErrorKind::InvalidData(what))
}
