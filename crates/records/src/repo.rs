//! Repository for sessions, blobs and the chapters they commit into.
//!
//! Sessions and blobs are tightly coupled: a blob can't outlive its session,
//! and a session is only ever removed together with its blobs. Those paths
//! (session deletion and commit) run inside a single transaction.

use crate::Database;
use crate::error::{ErrorKind, Result};
use crate::models::{
    Blob, BlobRow, Chapter, ChapterDraft, ChapterRow, ChapterWrite, Manga, MangaRow, Session, SessionRow, parse_id,
};
use exn::{OptionExt, ResultExt};
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::HashSet;
use uuid::Uuid;

fn json_ids(ids: &[Uuid]) -> Result<String> {
    serde_json::to_string(ids).or_raise(|| ErrorKind::InvalidData("id list"))
}

/// Repository for the upload pipeline's records.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
}
impl From<&Database> for Repository {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }
}
impl Repository {
    /// Create a new repository with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // =========================================================================
    // Manga
    // =========================================================================

    pub async fn insert_manga(&self, manga: &Manga) -> Result<()> {
        let row = MangaRow::from(manga);
        sqlx::query(include_str!("../queries/insert_manga.sql"))
            .bind(row.id)
            .bind(row.title)
            .bind(row.owner_id)
            .bind(row.created_at)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    pub async fn get_manga(&self, id: Uuid) -> Result<Option<Manga>> {
        let row: Option<MangaRow> = sqlx::query_as(include_str!("../queries/get_manga.sql"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(Manga::try_from).transpose()
    }

    // =========================================================================
    // Chapters
    // =========================================================================

    pub async fn insert_chapter(&self, chapter: &Chapter) -> Result<()> {
        let mut conn = self.pool.acquire().await.or_raise(|| ErrorKind::Database)?;
        insert_chapter(&mut conn, chapter).await
    }

    pub async fn get_chapter(&self, id: Uuid) -> Result<Option<Chapter>> {
        let row: Option<ChapterRow> = sqlx::query_as(include_str!("../queries/get_chapter.sql"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(Chapter::try_from).transpose()
    }

    /// Overwrite a chapter's metadata and length, incrementing its version.
    ///
    /// Returns [`ErrorKind::NotFound`] if the chapter doesn't exist.
    pub async fn update_chapter(&self, id: Uuid, draft: &ChapterDraft, length: u32) -> Result<Chapter> {
        let mut conn = self.pool.acquire().await.or_raise(|| ErrorKind::Database)?;
        update_chapter(&mut conn, id, draft, length).await
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    pub async fn insert_session(&self, session: &Session) -> Result<()> {
        let row = SessionRow::from(session);
        sqlx::query(include_str!("../queries/insert_session.sql"))
            .bind(row.id)
            .bind(row.owner_id)
            .bind(row.manga_id)
            .bind(row.chapter_id)
            .bind(row.created_at)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    pub async fn get_session(&self, id: Uuid) -> Result<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as(include_str!("../queries/get_session.sql"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(Session::try_from).transpose()
    }

    /// Ids of every live session, oldest first.
    pub async fn list_session_ids(&self) -> Result<Vec<Uuid>> {
        let ids: Vec<String> = sqlx::query_scalar(include_str!("../queries/list_session_ids.sql"))
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        ids.iter().map(|id| parse_id(id, "session id")).collect()
    }

    /// Delete a session and all of its blob records.
    ///
    /// Returns `false` if the session didn't exist. Blob *content* is not
    /// touched; that's the caller's job.
    pub async fn delete_session(&self, id: Uuid) -> Result<bool> {
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let deleted = delete_session(&mut tx, id).await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(deleted)
    }

    /// Write the session's chapter and delete the session, atomically.
    ///
    /// Either the chapter is created/updated *and* the session (with its blob
    /// records) is gone, or nothing changed.
    #[tracing::instrument(level = "debug", skip(self, write), fields(session = %session_id))]
    pub async fn commit_session(&self, session_id: Uuid, write: ChapterWrite) -> Result<Chapter> {
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let chapter = match write {
            ChapterWrite::Create(chapter) => {
                insert_chapter(&mut tx, &chapter).await?;
                chapter
            },
            ChapterWrite::Update { id, draft, length } => update_chapter(&mut tx, id, &draft, length).await?,
        };
        if !delete_session(&mut tx, session_id).await? {
            // Dropping the transaction rolls the chapter write back.
            exn::bail!(ErrorKind::NotFound("session", session_id));
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(chapter)
    }

    // =========================================================================
    // Blobs
    // =========================================================================

    /// Append a blob to the end of its session.
    pub async fn insert_blob(&self, blob: &Blob) -> Result<()> {
        let mut conn = self.pool.acquire().await.or_raise(|| ErrorKind::Database)?;
        insert_blob(&mut conn, blob).await
    }

    /// Append several blobs, in order, as one transaction.
    pub async fn insert_blobs(&self, blobs: &[Blob]) -> Result<()> {
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        for blob in blobs {
            insert_blob(&mut tx, blob).await?;
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Blobs of a session in insertion order.
    pub async fn list_blobs(&self, session_id: Uuid) -> Result<Vec<Blob>> {
        let rows: Vec<BlobRow> = sqlx::query_as(include_str!("../queries/list_blobs.sql"))
            .bind(session_id.to_string())
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(Blob::try_from).collect()
    }

    pub async fn get_blob(&self, id: Uuid) -> Result<Option<Blob>> {
        let row: Option<BlobRow> = sqlx::query_as(include_str!("../queries/get_blob.sql"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(Blob::try_from).transpose()
    }

    /// Delete one blob record of a session. Returns `false` if it wasn't there.
    pub async fn delete_blob(&self, session_id: Uuid, id: Uuid) -> Result<bool> {
        Ok(self.delete_blobs(session_id, &[id]).await? > 0)
    }

    /// Delete blob records of a session. Ids that don't exist (or belong to
    /// another session) are ignored. Returns the number of records deleted.
    pub async fn delete_blobs(&self, session_id: Uuid, ids: &[Uuid]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(include_str!("../queries/delete_blobs.sql"))
            .bind(session_id.to_string())
            .bind(json_ids(ids)?)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected())
    }

    /// The subset of `ids` that still have a blob record, in any session.
    pub async fn blob_ids_in(&self, ids: &[Uuid]) -> Result<HashSet<Uuid>> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let found: Vec<String> = sqlx::query_scalar(include_str!("../queries/blob_ids_in.sql"))
            .bind(json_ids(ids)?)
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        found.iter().map(|id| parse_id(id, "blob id")).collect()
    }
}

async fn insert_chapter(conn: &mut SqliteConnection, chapter: &Chapter) -> Result<()> {
    let row = ChapterRow::from(chapter);
    sqlx::query(include_str!("../queries/insert_chapter.sql"))
        .bind(row.id)
        .bind(row.manga_id)
        .bind(row.owner_id)
        .bind(row.name)
        .bind(row.scan_group)
        .bind(row.volume)
        .bind(row.number)
        .bind(row.length)
        .bind(row.webtoon)
        .bind(row.version)
        .bind(row.upload_time)
        .execute(conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(())
}

async fn update_chapter(conn: &mut SqliteConnection, id: Uuid, draft: &ChapterDraft, length: u32) -> Result<Chapter> {
    let row: Option<ChapterRow> = sqlx::query_as(include_str!("../queries/update_chapter.sql"))
        .bind(&draft.name)
        .bind(&draft.scan_group)
        .bind(draft.volume.map(i64::from))
        .bind(draft.number)
        .bind(draft.webtoon)
        .bind(i64::from(length))
        .bind(id.to_string())
        .fetch_optional(conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    row.ok_or_raise(|| ErrorKind::NotFound("chapter", id))?.try_into()
}

async fn insert_blob(conn: &mut SqliteConnection, blob: &Blob) -> Result<()> {
    sqlx::query(include_str!("../queries/insert_blob.sql"))
        .bind(blob.id.to_string())
        .bind(blob.session_id.to_string())
        .bind(&blob.name)
        .execute(conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(())
}

/// Blobs first, then the session: foreign keys don't cascade.
async fn delete_session(conn: &mut SqliteConnection, id: Uuid) -> Result<bool> {
    sqlx::query(include_str!("../queries/delete_session_blobs.sql"))
        .bind(id.to_string())
        .execute(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    let result = sqlx::query(include_str!("../queries/delete_session.sql"))
        .bind(id.to_string())
        .execute(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        repo: Repository,
        owner: Uuid,
        manga: Manga,
    }

    async fn fixture() -> Fixture {
        let db = Database::connect_in_memory().await.unwrap();
        let repo = Repository::from(&db);
        let owner = Uuid::new_v4();
        let manga = Manga::new("Yotsuba&!", owner);
        repo.insert_manga(&manga).await.unwrap();
        Fixture { repo, owner, manga }
    }

    async fn session_with_blobs(f: &Fixture, names: &[&str]) -> (Session, Vec<Blob>) {
        let session = Session::new(f.owner, f.manga.id, None);
        f.repo.insert_session(&session).await.unwrap();
        let blobs: Vec<Blob> = names.iter().map(|name| Blob::new(session.id, *name)).collect();
        f.repo.insert_blobs(&blobs).await.unwrap();
        (session, blobs)
    }

    #[tokio::test]
    async fn test_manga_round_trip() {
        let f = fixture().await;
        let manga = f.repo.get_manga(f.manga.id).await.unwrap().unwrap();
        assert_eq!(manga.title, "Yotsuba&!");
        assert_eq!(manga.owner_id, f.owner);
        assert!(f.repo.get_manga(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_blobs_keep_insertion_order() {
        let f = fixture().await;
        let (session, blobs) = session_with_blobs(&f, &["3.jpg", "1.jpg", "2.jpg"]).await;
        let late = Blob::new(session.id, "0.jpg");
        f.repo.insert_blob(&late).await.unwrap();
        let listed = f.repo.list_blobs(session.id).await.unwrap();
        let names: Vec<_> = listed.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["3.jpg", "1.jpg", "2.jpg", "0.jpg"]);
        assert_eq!(listed[0], blobs[0]);
    }

    #[tokio::test]
    async fn test_blob_requires_live_session() {
        let f = fixture().await;
        let err = f.repo.insert_blob(&Blob::new(Uuid::new_v4(), "1.jpg")).await.unwrap_err();
        assert_eq!(*err, ErrorKind::Database);
    }

    #[tokio::test]
    async fn test_delete_blobs_ignores_unknown_ids() {
        let f = fixture().await;
        let (session, blobs) = session_with_blobs(&f, &["1.jpg", "2.jpg"]).await;
        let deleted = f.repo.delete_blobs(session.id, &[blobs[0].id, Uuid::new_v4()]).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(f.repo.delete_blobs(session.id, &[]).await.unwrap(), 0);
        assert!(!f.repo.delete_blob(session.id, blobs[0].id).await.unwrap());
        assert_eq!(f.repo.list_blobs(session.id).await.unwrap(), vec![blobs[1].clone()]);
    }

    #[tokio::test]
    async fn test_delete_blob_scoped_to_session() {
        let f = fixture().await;
        let (_, blobs) = session_with_blobs(&f, &["1.jpg"]).await;
        let (other, _) = session_with_blobs(&f, &[]).await;
        assert!(!f.repo.delete_blob(other.id, blobs[0].id).await.unwrap());
        assert!(f.repo.get_blob(blobs[0].id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_session_removes_blobs() {
        let f = fixture().await;
        let (session, blobs) = session_with_blobs(&f, &["1.jpg", "2.jpg"]).await;
        assert!(f.repo.delete_session(session.id).await.unwrap());
        assert!(f.repo.get_session(session.id).await.unwrap().is_none());
        assert!(f.repo.get_blob(blobs[1].id).await.unwrap().is_none());
        assert!(!f.repo.delete_session(session.id).await.unwrap());
        assert!(f.repo.list_session_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_creates_chapter() {
        let f = fixture().await;
        let (session, _) = session_with_blobs(&f, &["1.jpg", "2.jpg"]).await;
        let chapter = Chapter::new(f.manga.id, Some(f.owner), ChapterDraft::new("Chapter 1", 1.0), 2);
        let committed = f.repo.commit_session(session.id, ChapterWrite::Create(chapter.clone())).await.unwrap();
        assert_eq!(committed.version, 1);
        let stored = f.repo.get_chapter(chapter.id).await.unwrap().unwrap();
        assert_eq!(stored.length, 2);
        assert_eq!(stored.owner_id, Some(f.owner));
        assert!(f.repo.get_session(session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_updates_chapter() {
        let f = fixture().await;
        let chapter = Chapter::new(f.manga.id, Some(f.owner), ChapterDraft::new("Chapter 1", 1.0), 3);
        f.repo.insert_chapter(&chapter).await.unwrap();
        let session = Session::new(f.owner, f.manga.id, Some(chapter.id));
        f.repo.insert_session(&session).await.unwrap();
        let mut draft = ChapterDraft::new("Chapter 1 (fixed)", 1.0);
        draft.webtoon = true;
        let write = ChapterWrite::Update { id: chapter.id, draft, length: 5 };
        let committed = f.repo.commit_session(session.id, write).await.unwrap();
        assert_eq!(committed.id, chapter.id);
        assert_eq!(committed.version, 2);
        assert_eq!(committed.length, 5);
        assert_eq!(committed.name, "Chapter 1 (fixed)");
        assert!(committed.webtoon);
        assert_eq!(committed.owner_id, Some(f.owner));
    }

    #[tokio::test]
    async fn test_commit_missing_session_rolls_back() {
        let f = fixture().await;
        let chapter = Chapter::new(f.manga.id, Some(f.owner), ChapterDraft::new("Ghost", 9.0), 1);
        let missing = Uuid::new_v4();
        let err = f.repo.commit_session(missing, ChapterWrite::Create(chapter.clone())).await.unwrap_err();
        assert_eq!(*err, ErrorKind::NotFound("session", missing));
        assert!(f.repo.get_chapter(chapter.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_missing_chapter() {
        let f = fixture().await;
        let id = Uuid::new_v4();
        let err = f.repo.update_chapter(id, &ChapterDraft::new("Nope", 1.0), 1).await.unwrap_err();
        assert_eq!(*err, ErrorKind::NotFound("chapter", id));
    }

    #[tokio::test]
    async fn test_blob_ids_in() {
        let f = fixture().await;
        let (_, blobs) = session_with_blobs(&f, &["1.jpg", "2.jpg"]).await;
        let stray = Uuid::new_v4();
        let found = f.repo.blob_ids_in(&[blobs[0].id, stray, blobs[1].id]).await.unwrap();
        assert_eq!(found, HashSet::from([blobs[0].id, blobs[1].id]));
        assert!(f.repo.blob_ids_in(&[]).await.unwrap().is_empty());
    }
}
