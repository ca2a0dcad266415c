//! Transactional relational store for upload sessions, chunks, clips and
//! aggregated statistics, backed by SQLite via sqlx.
//!
//! Every multi-row mutation happens inside a single transaction. SQLite has
//! no `SELECT … FOR UPDATE`; wherever row-lock semantics are required the
//! operation is a single conditioned `UPDATE`/`DELETE … RETURNING` statement
//! inside a write transaction, and the affected-row count is observed.

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::instrument;

use qopy_storage::{ClipId, UploadId};

use crate::Error;

/// Sentinel stored in `clips.password_hash` when the client encrypted the
/// content with a user passphrase. The server never sees the passphrase and
/// never stores a derived hash; this value only signals "password required".
pub const PASSWORD_SENTINEL: &str = "client-encrypted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
pub enum SessionStatus {
    Uploading,
    Completed,
    Failed,
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Uploading => "uploading",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, serde::Serialize)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    File,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRow {
    pub upload_id: String,
    pub original_filename: String,
    pub mime_type: String,
    pub filesize: i64,
    pub chunk_size: i64,
    pub total_chunks: i64,
    pub uploaded_chunks: i64,
    pub status: SessionStatus,
    pub has_password: bool,
    pub one_time: bool,
    pub quick_share: bool,
    pub is_text_content: bool,
    pub access_code_hash: Option<String>,
    pub retention: String,
    pub expiration_time: i64,
    pub created_at: i64,
    pub last_activity: i64,
    pub completed_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewSession {
    pub upload_id: UploadId,
    pub original_filename: String,
    pub mime_type: String,
    pub filesize: i64,
    pub chunk_size: i64,
    pub total_chunks: i64,
    pub has_password: bool,
    pub one_time: bool,
    pub quick_share: bool,
    pub is_text_content: bool,
    pub access_code_hash: Option<String>,
    pub retention: String,
    pub expiration_time: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClipRow {
    pub clip_id: String,
    pub content_type: ContentType,
    pub file_path: Option<String>,
    pub original_filename: Option<String>,
    pub mime_type: Option<String>,
    pub filesize: i64,
    pub password_hash: Option<String>,
    pub access_code_hash: Option<String>,
    pub requires_access_code: bool,
    pub one_time: bool,
    pub quick_share: bool,
    pub expiration_time: i64,
    pub is_expired: bool,
    pub access_count: i64,
    pub max_accesses: Option<i64>,
    pub accessed_at: Option<i64>,
    pub created_at: i64,
}

impl ClipRow {
    pub fn has_password(&self) -> bool {
        self.password_hash.as_deref() == Some(PASSWORD_SENTINEL)
    }
}

/// Everything of a clip row except its identifier and `file_path`, which are
/// filled in by reservation and publication respectively.
#[derive(Debug, Clone)]
pub struct NewClip {
    pub content_type: ContentType,
    pub original_filename: Option<String>,
    pub mime_type: Option<String>,
    pub filesize: i64,
    pub password_hash: Option<String>,
    pub access_code_hash: Option<String>,
    pub one_time: bool,
    pub quick_share: bool,
    pub expiration_time: i64,
    pub max_accesses: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct StatisticsRow {
    pub total_sessions: i64,
    pub completed_sessions: i64,
    pub expired_sessions: i64,
    pub expired_clips: i64,
    pub total_accesses: i64,
}

const SESSION_COLUMNS: &str = "upload_id, original_filename, mime_type, filesize, chunk_size, \
     total_chunks, uploaded_chunks, status, has_password, one_time, quick_share, \
     is_text_content, access_code_hash, retention, expiration_time, created_at, \
     last_activity, completed_at";

const CLIP_COLUMNS: &str = "clip_id, content_type, file_path, original_filename, mime_type, \
     filesize, password_hash, access_code_hash, requires_access_code, one_time, quick_share, \
     expiration_time, is_expired, access_count, max_accesses, accessed_at, created_at";

pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    /// Connects to the database named by `database_url`, creating it if
    /// missing, and applies the embedded migrations.
    pub async fn connect(database_url: &str) -> Result<Self, Error> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(16)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    #[instrument(skip_all, err, fields(upload.id=%session.upload_id))]
    pub async fn create_session(&self, session: &NewSession) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO upload_sessions (upload_id, original_filename, mime_type, filesize, \
             chunk_size, total_chunks, status, has_password, one_time, quick_share, \
             is_text_content, access_code_hash, retention, expiration_time, created_at, \
             last_activity) \
             VALUES (?, ?, ?, ?, ?, ?, 'uploading', ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(session.upload_id.to_string())
        .bind(&session.original_filename)
        .bind(&session.mime_type)
        .bind(session.filesize)
        .bind(session.chunk_size)
        .bind(session.total_chunks)
        .bind(session.has_password)
        .bind(session.one_time)
        .bind(session.quick_share)
        .bind(session.is_text_content)
        .bind(&session.access_code_hash)
        .bind(&session.retention)
        .bind(session.expiration_time)
        .bind(session.created_at)
        .bind(session.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_session(&self, upload_id: &UploadId) -> Result<Option<SessionRow>, Error> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM upload_sessions WHERE upload_id = ?"
        ))
        .bind(upload_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Records a persisted chunk. The upsert is idempotent: a re-upload of
    /// the same `(upload_id, chunk_number)` replaces the recorded size and
    /// path without incrementing `uploaded_chunks`. Returns the session's
    /// `(uploaded_chunks, total_chunks)` after the write.
    #[instrument(
        skip(self, storage_path),
        err,
        fields(upload.id=%upload_id, chunk.number=chunk_number)
    )]
    pub async fn record_chunk(
        &self,
        upload_id: &UploadId,
        chunk_number: u32,
        storage_path: &Path,
        chunk_size: u64,
        now: i64,
    ) -> Result<(i64, i64), Error> {
        let id = upload_id.to_string();
        let path = storage_path.to_string_lossy().into_owned();

        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE file_chunks SET chunk_size = ?, storage_path = ?, created_at = ? \
             WHERE upload_id = ? AND chunk_number = ?",
        )
        .bind(chunk_size as i64)
        .bind(&path)
        .bind(now)
        .bind(&id)
        .bind(chunk_number)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            let inserted = sqlx::query(
                "INSERT INTO file_chunks (upload_id, chunk_number, chunk_size, storage_path, \
                 created_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(chunk_number)
            .bind(chunk_size as i64)
            .bind(&path)
            .bind(now)
            .execute(&mut *tx)
            .await;
            match inserted {
                Ok(_) => {
                    sqlx::query(
                        "UPDATE upload_sessions SET uploaded_chunks = uploaded_chunks + 1 \
                         WHERE upload_id = ?",
                    )
                    .bind(&id)
                    .execute(&mut *tx)
                    .await?;
                }
                // Lost the insert race against a concurrent retry of the
                // same chunk: record the overwrite, no counter bump.
                Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                    sqlx::query(
                        "UPDATE file_chunks SET chunk_size = ?, storage_path = ?, \
                         created_at = ? WHERE upload_id = ? AND chunk_number = ?",
                    )
                    .bind(chunk_size as i64)
                    .bind(&path)
                    .bind(now)
                    .bind(&id)
                    .bind(chunk_number)
                    .execute(&mut *tx)
                    .await?;
                }
                // The session was completed or swept while the chunk body
                // was streaming.
                Err(sqlx::Error::Database(e)) if e.is_foreign_key_violation() => {
                    return Err(Error::NotFound)
                }
                Err(e) => return Err(e.into()),
            }
        }

        sqlx::query("UPDATE upload_sessions SET last_activity = ? WHERE upload_id = ?")
            .bind(now)
            .bind(&id)
            .execute(&mut *tx)
            .await?;

        let progress: (i64, i64) = sqlx::query_as(
            "SELECT uploaded_chunks, total_chunks FROM upload_sessions WHERE upload_id = ?",
        )
        .bind(&id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(progress)
    }

    /// Marks a session failed. Only sessions still uploading transition.
    pub async fn mark_failed(&self, upload_id: &UploadId) -> Result<bool, Error> {
        let affected = sqlx::query(
            "UPDATE upload_sessions SET status = 'failed' \
             WHERE upload_id = ? AND status = 'uploading'",
        )
        .bind(upload_id.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    /// Deletes a session row; chunk rows cascade.
    pub async fn delete_session(&self, upload_id: &UploadId) -> Result<(), Error> {
        sqlx::query("DELETE FROM upload_sessions WHERE upload_id = ?")
            .bind(upload_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The conditional insert backing identifier allocation: inserts a clip
    /// row with `file_path` NULL (reserved, invisible to reads). Returns
    /// false when the id is already taken.
    #[instrument(skip(self, clip), err, fields(clip.id=%clip_id))]
    pub async fn reserve_clip(&self, clip_id: &ClipId, clip: &NewClip) -> Result<bool, Error> {
        let result = sqlx::query(
            "INSERT INTO clips (clip_id, content_type, original_filename, mime_type, filesize, \
             password_hash, access_code_hash, requires_access_code, one_time, quick_share, \
             expiration_time, max_accesses, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(clip_id.as_str())
        .bind(clip.content_type)
        .bind(&clip.original_filename)
        .bind(&clip.mime_type)
        .bind(clip.filesize)
        .bind(&clip.password_hash)
        .bind(&clip.access_code_hash)
        .bind(clip.access_code_hash.is_some())
        .bind(clip.one_time)
        .bind(clip.quick_share)
        .bind(clip.expiration_time)
        .bind(clip.max_accesses)
        .bind(clip.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Rolls a reservation back. Only unpublished rows are removed.
    pub async fn discard_reserved(&self, clip_id: &ClipId) -> Result<(), Error> {
        sqlx::query("DELETE FROM clips WHERE clip_id = ? AND file_path IS NULL")
            .bind(clip_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Publishes a completed upload in a single transaction: the session
    /// transitions `uploading → completed` (firing the statistics trigger),
    /// the reserved clip row gains its blob path and final expiration, and
    /// the session row is deleted, cascading its chunk rows.
    #[instrument(skip(self, file_path), err, fields(upload.id=%upload_id, clip.id=%clip_id))]
    pub async fn publish_clip(
        &self,
        upload_id: &UploadId,
        clip_id: &ClipId,
        file_path: &Path,
        completed_at: i64,
        expiration_time: i64,
    ) -> Result<(), Error> {
        let id = upload_id.to_string();
        let mut tx = self.pool.begin().await?;

        let transitioned = sqlx::query(
            "UPDATE upload_sessions SET status = 'completed', completed_at = ? \
             WHERE upload_id = ? AND status = 'uploading'",
        )
        .bind(completed_at)
        .bind(&id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if transitioned == 0 {
            return Err(Error::InvalidState("not uploading"));
        }

        let published = sqlx::query(
            "UPDATE clips SET file_path = ?, expiration_time = ? \
             WHERE clip_id = ? AND file_path IS NULL",
        )
        .bind(file_path.to_string_lossy().into_owned())
        .bind(expiration_time)
        .bind(clip_id.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if published == 0 {
            return Err(Error::InvalidState("clip reservation lost"));
        }

        sqlx::query("DELETE FROM upload_sessions WHERE upload_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Loads a published, unexpired clip.
    pub async fn get_clip(&self, clip_id: &ClipId) -> Result<Option<ClipRow>, Error> {
        let row = sqlx::query_as::<_, ClipRow>(&format!(
            "SELECT {CLIP_COLUMNS} FROM clips \
             WHERE clip_id = ? AND file_path IS NOT NULL AND is_expired = 0"
        ))
        .bind(clip_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Atomically consumes a one-time clip. The `DELETE … RETURNING` is the
    /// linearization point: of any number of concurrent callers exactly one
    /// receives the row.
    #[instrument(skip(self), err, fields(clip.id=%clip_id))]
    pub async fn consume_one_time(
        &self,
        clip_id: &ClipId,
        now: i64,
    ) -> Result<Option<ClipRow>, Error> {
        let row = sqlx::query_as::<_, ClipRow>(&format!(
            "DELETE FROM clips \
             WHERE clip_id = ? AND one_time = 1 AND file_path IS NOT NULL \
             AND is_expired = 0 AND expiration_time > ? \
             RETURNING {CLIP_COLUMNS}"
        ))
        .bind(clip_id.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Bumps access counters for a non-one-time read.
    pub async fn increment_access(&self, clip_id: &ClipId, now: i64) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE clips SET access_count = access_count + 1, accessed_at = ? \
             WHERE clip_id = ?",
        )
        .bind(now)
        .bind(clip_id.as_str())
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE statistics SET total_accesses = total_accesses + 1 WHERE id = 1")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Deletes a clip row unconditionally (sweeper and admin path).
    pub async fn delete_clip(&self, clip_id: &ClipId) -> Result<bool, Error> {
        let affected = sqlx::query("DELETE FROM clips WHERE clip_id = ?")
            .bind(clip_id.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    /// Marks all overdue clips expired and returns them, so the caller can
    /// remove their blobs before deleting the rows. Expired rows are already
    /// invisible to reads.
    pub async fn expire_overdue_clips(&self, now: i64) -> Result<Vec<ClipRow>, Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE clips SET is_expired = 1 WHERE expiration_time < ? AND is_expired = 0")
            .bind(now)
            .execute(&mut *tx)
            .await?;
        let rows = sqlx::query_as::<_, ClipRow>(&format!(
            "SELECT {CLIP_COLUMNS} FROM clips WHERE is_expired = 1"
        ))
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(rows)
    }

    /// Marks overdue uploading sessions expired and returns every session
    /// due for removal (expired or failed).
    pub async fn collect_overdue_sessions(&self, now: i64) -> Result<Vec<SessionRow>, Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE upload_sessions SET status = 'expired' \
             WHERE expiration_time < ? AND status = 'uploading'",
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM upload_sessions \
             WHERE status IN ('expired', 'failed')"
        ))
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(rows)
    }

    /// Reserved clip ids whose completion never finished, older than the
    /// given cutoff.
    pub async fn reserved_clips_older_than(&self, cutoff: i64) -> Result<Vec<String>, Error> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT clip_id FROM clips WHERE file_path IS NULL AND created_at < ?")
                .bind(cutoff)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn live_upload_ids(&self) -> Result<HashSet<String>, Error> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT upload_id FROM upload_sessions")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn live_clip_ids(&self) -> Result<HashSet<String>, Error> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT clip_id FROM clips")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn bump_expired(&self, clips: i64, sessions: i64) -> Result<(), Error> {
        sqlx::query(
            "UPDATE statistics SET expired_clips = expired_clips + ?, \
             expired_sessions = expired_sessions + ? WHERE id = 1",
        )
        .bind(clips)
        .bind(sessions)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn statistics(&self) -> Result<StatisticsRow, Error> {
        let row = sqlx::query_as::<_, StatisticsRow>(
            "SELECT total_sessions, completed_sessions, expired_sessions, expired_clips, \
             total_accesses FROM statistics WHERE id = 1",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    /// Per-day upload counts, most recent first.
    pub async fn daily_uploads(&self, limit: i64) -> Result<Vec<(String, i64)>, Error> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT day, uploads FROM daily_uploads ORDER BY day DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
