//! The per-upload state machine: initiate, receive chunks, complete, abort.
//!
//! A session starts `uploading`, accumulates chunks in any order, and on
//! completion is atomically replaced by a published clip. Chunk receipt is
//! idempotent; completion either fully publishes or leaves the session
//! untouched for retry.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::OsRng;
use tokio::io::AsyncRead;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{instrument, warn};

use qopy_storage::{BlobStore, ChunkStore, ClipId, ClipIdKind, UploadId};

use crate::ident::IdentifierAllocator;
use crate::metadata::{
    ContentType, MetadataStore, NewClip, NewSession, SessionRow, SessionStatus, PASSWORD_SENTINEL,
};
use crate::retention::Retention;
use crate::{now_millis, Error};

/// Upper bound on a session's chunk count, bounding per-session bookkeeping
/// regardless of the chosen chunk size.
const MAX_TOTAL_CHUNKS: u64 = 10_000;

/// Upper bound on a client-chosen chunk size.
pub const MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;

const MAX_FILENAME_LEN: usize = 255;

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub max_file_size: u64,
    pub default_chunk_size: u64,
    pub upload_ttl: Duration,
    pub max_concurrent_uploads: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size: 100 * 1024 * 1024,
            default_chunk_size: 5 * 1024 * 1024,
            upload_ttl: Duration::from_secs(60 * 60),
            max_concurrent_uploads: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitiateUpload {
    pub filename: String,
    pub filesize: u64,
    pub mime_type: String,
    pub chunk_size: Option<u64>,
    pub one_time: bool,
    pub quick_share: bool,
    pub has_password: bool,
    pub is_text_content: bool,
    pub access_code_hash: Option<String>,
    pub retention: Retention,
}

#[derive(Debug)]
pub struct InitiatedSession {
    pub upload_id: UploadId,
    pub total_chunks: u32,
    pub chunk_size: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ChunkProgress {
    pub uploaded: i64,
    pub total: i64,
}

#[derive(Debug)]
pub struct CompletedClip {
    pub clip_id: ClipId,
    pub content_type: ContentType,
}

pub struct UploadSessionManager {
    metadata: Arc<MetadataStore>,
    chunks: Arc<ChunkStore>,
    blobs: Arc<BlobStore>,
    allocator: IdentifierAllocator,
    config: UploadConfig,
    /// Serializes concurrent writes to the same `(upload_id, chunk_number)`.
    /// Held across the filesystem write only, never across database calls.
    chunk_locks: Mutex<HashMap<(String, u32), Arc<tokio::sync::Mutex<()>>>>,
    upload_slots: Arc<Semaphore>,
}

impl UploadSessionManager {
    pub fn new(
        metadata: Arc<MetadataStore>,
        chunks: Arc<ChunkStore>,
        blobs: Arc<BlobStore>,
        config: UploadConfig,
    ) -> Self {
        let upload_slots = Arc::new(Semaphore::new(config.max_concurrent_uploads));
        Self {
            allocator: IdentifierAllocator::new(metadata.clone()),
            metadata,
            chunks,
            blobs,
            config,
            chunk_locks: Mutex::new(HashMap::new()),
            upload_slots,
        }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Takes a slot from the global concurrent-upload cap, or fails with
    /// [Error::Busy]. The service never queues excess uploads.
    pub fn acquire_upload_slot(&self) -> Result<OwnedSemaphorePermit, Error> {
        self.upload_slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| Error::Busy)
    }

    #[instrument(skip_all, err, fields(filesize = request.filesize))]
    pub async fn initiate(&self, request: InitiateUpload) -> Result<InitiatedSession, Error> {
        if request.filesize == 0 {
            return Err(Error::InvalidRequest("filesize must be positive".into()));
        }
        if request.filesize > self.config.max_file_size {
            return Err(Error::FileTooLarge {
                got: request.filesize,
                max: self.config.max_file_size,
            });
        }

        let chunk_size = request.chunk_size.unwrap_or(self.config.default_chunk_size);
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::InvalidRequest(format!(
                "chunk size must be between 1 and {MAX_CHUNK_SIZE} bytes"
            )));
        }
        let total_chunks = request.filesize.div_ceil(chunk_size);
        if total_chunks > MAX_TOTAL_CHUNKS {
            return Err(Error::InvalidRequest(format!(
                "upload would need {total_chunks} chunks, limit is {MAX_TOTAL_CHUNKS}"
            )));
        }

        if let Some(hash) = &request.access_code_hash {
            validate_sha256_hex(hash)?;
        }

        let now = now_millis();
        let upload_id = UploadId::generate(&mut OsRng);
        let session = NewSession {
            upload_id: upload_id.clone(),
            original_filename: sanitize_filename(&request.filename),
            mime_type: request.mime_type,
            filesize: request.filesize as i64,
            chunk_size: chunk_size as i64,
            total_chunks: total_chunks as i64,
            has_password: request.has_password,
            one_time: request.one_time,
            quick_share: request.quick_share,
            is_text_content: request.is_text_content,
            access_code_hash: request.access_code_hash,
            retention: request.retention.as_token().to_string(),
            expiration_time: now + self.config.upload_ttl.as_millis() as i64,
            created_at: now,
        };
        self.metadata.create_session(&session).await?;

        Ok(InitiatedSession {
            upload_id,
            total_chunks: total_chunks as u32,
            chunk_size,
        })
    }

    /// Receives chunk `chunk_number`, streaming the body to the chunk store.
    /// Idempotent: a retry of an already-received chunk overwrites the bytes
    /// on disk without double-counting.
    #[instrument(skip(self, body), err, fields(upload.id=%upload_id, chunk.number=chunk_number))]
    pub async fn receive_chunk<R>(
        &self,
        upload_id: &UploadId,
        chunk_number: u32,
        body: &mut R,
    ) -> Result<ChunkProgress, Error>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let session = self.loaded_uploading_session(upload_id).await?;

        if i64::from(chunk_number) >= session.total_chunks {
            return Err(Error::InvalidRequest(format!(
                "chunk number {chunk_number} out of range 0..{}",
                session.total_chunks
            )));
        }
        let expected = expected_chunk_len(&session, chunk_number);

        let (path, written) = {
            let key = (session.upload_id.clone(), chunk_number);
            let lock = self
                .chunk_locks
                .lock()
                .entry(key.clone())
                .or_default()
                .clone();
            let result = {
                let _guard = lock.lock().await;
                self.chunks
                    .write_chunk(upload_id, chunk_number, body, expected)
                    .await
            };
            let mut locks = self.chunk_locks.lock();
            if let Some(entry) = locks.get(&key) {
                // Only the map and we hold it: nobody is waiting.
                if Arc::strong_count(entry) <= 2 {
                    locks.remove(&key);
                }
            }
            result?
        };

        let (uploaded, total) = self
            .metadata
            .record_chunk(upload_id, chunk_number, &path, written, now_millis())
            .await?;
        Ok(ChunkProgress { uploaded, total })
    }

    /// Assembles the chunks into a blob and publishes the clip. On any
    /// failure the session is left in `uploading` with its chunks intact, so
    /// the client can re-upload a chunk or retry completion.
    #[instrument(skip(self), err, fields(upload.id=%upload_id))]
    pub async fn complete(&self, upload_id: &UploadId) -> Result<CompletedClip, Error> {
        let session = self.loaded_uploading_session(upload_id).await?;
        if session.uploaded_chunks != session.total_chunks {
            return Err(Error::Incomplete {
                uploaded: session.uploaded_chunks,
                total: session.total_chunks,
            });
        }

        let retention = Retention::from_str(&session.retention)?;
        let now = now_millis();
        let content_type = if session.is_text_content {
            ContentType::Text
        } else {
            ContentType::File
        };
        let new_clip = NewClip {
            content_type,
            original_filename: Some(session.original_filename.clone()),
            mime_type: Some(session.mime_type.clone()),
            filesize: session.filesize,
            password_hash: session
                .has_password
                .then(|| PASSWORD_SENTINEL.to_string()),
            access_code_hash: session.access_code_hash.clone(),
            one_time: session.one_time,
            quick_share: session.quick_share,
            expiration_time: now + retention.duration().as_millis() as i64,
            max_accesses: session.one_time.then_some(1),
            created_at: now,
        };
        let kind = if session.quick_share {
            ClipIdKind::Quick
        } else {
            ClipIdKind::Enhanced
        };
        let clip_id = self.allocator.allocate(kind, &new_clip).await?;

        match self.assemble(upload_id, &session, &clip_id).await {
            Ok(()) => Ok(CompletedClip {
                clip_id,
                content_type,
            }),
            Err(e) => {
                // Roll the reservation back; the blob (if any) goes with it.
                if let Err(e) = self.blobs.delete(&clip_id).await {
                    warn!(err=%e, "failed to remove blob after aborted completion");
                }
                if let Err(e) = self.metadata.discard_reserved(&clip_id).await {
                    warn!(err=%e, "failed to discard clip reservation");
                }
                Err(e)
            }
        }
    }

    async fn assemble(
        &self,
        upload_id: &UploadId,
        session: &SessionRow,
        clip_id: &ClipId,
    ) -> Result<(), Error> {
        let mut staged = self.blobs.put(clip_id).await?;
        let written = self
            .chunks
            .concatenate(upload_id, session.total_chunks as u32, &mut staged)
            .await?;
        if written != session.filesize as u64 {
            return Err(Error::SizeMismatch {
                expected: session.filesize as u64,
                got: written,
            });
        }
        let blob_path = staged.commit().await?;

        let completed_at = now_millis();
        let retention = Retention::from_str(&session.retention)?;
        self.metadata
            .publish_clip(
                upload_id,
                clip_id,
                &blob_path,
                completed_at,
                completed_at + retention.duration().as_millis() as i64,
            )
            .await?;

        // Chunk cleanup is best effort; the sweeper repairs leftovers.
        if let Err(e) = self.chunks.delete_session(upload_id).await {
            warn!(err=%e, "failed to remove chunk directory after completion");
        }
        Ok(())
    }

    /// Aborts a session: it transitions to `failed` and its chunks and row
    /// are swept immediately.
    #[instrument(skip(self), err, fields(upload.id=%upload_id))]
    pub async fn abort(&self, upload_id: &UploadId) -> Result<(), Error> {
        if self.metadata.get_session(upload_id).await?.is_none() {
            return Err(Error::NotFound);
        }
        self.metadata.mark_failed(upload_id).await?;
        self.chunks.delete_session(upload_id).await?;
        self.metadata.delete_session(upload_id).await?;
        Ok(())
    }

    async fn loaded_uploading_session(&self, upload_id: &UploadId) -> Result<SessionRow, Error> {
        let session = self
            .metadata
            .get_session(upload_id)
            .await?
            .ok_or(Error::NotFound)?;
        match session.status {
            SessionStatus::Uploading => {}
            other => return Err(Error::InvalidState(other.as_str())),
        }
        if session.expiration_time < now_millis() {
            return Err(Error::SessionExpired);
        }
        Ok(session)
    }
}

/// Length chunk `chunk_number` must carry: the session chunk size for all
/// but the last chunk, the remainder for the last.
fn expected_chunk_len(session: &SessionRow, chunk_number: u32) -> u64 {
    let filesize = session.filesize as u64;
    let chunk_size = session.chunk_size as u64;
    if i64::from(chunk_number) == session.total_chunks - 1 {
        filesize - u64::from(chunk_number) * chunk_size
    } else {
        chunk_size
    }
}

/// Strips path separators, traversal dots, NULs and control characters from
/// a client-declared filename and caps its length. The result is only ever
/// used as a display attribute; on-disk names derive from identifiers.
pub fn sanitize_filename(name: &str) -> String {
    let mut out: String = name
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | '\0') && !c.is_control())
        .collect();
    while out.contains("..") {
        out = out.replace("..", "");
    }
    let out = out.trim().to_string();
    if out.is_empty() || out.chars().all(|c| c == '.') {
        return "unnamed".to_string();
    }
    out.chars().take(MAX_FILENAME_LEN).collect()
}

fn validate_sha256_hex(hash: &str) -> Result<(), Error> {
    if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
        return Err(Error::InvalidRequest(
            "access code hash must be 64 lowercase hex characters".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_traversal() {
        assert_eq!("etcpasswd", sanitize_filename("../../etc/passwd"));
        assert_eq!("a.b.txt", sanitize_filename("a.b.txt"));
        assert_eq!("evil.txt", sanitize_filename("..\\evil.txt"));
        assert_eq!("unnamed", sanitize_filename("././."));
        assert_eq!("unnamed", sanitize_filename(""));
        assert_eq!("no nulls", sanitize_filename("no\0 nu\x07lls"));
    }

    #[test]
    fn sanitize_caps_length() {
        let long = "x".repeat(1000);
        assert_eq!(255, sanitize_filename(&long).chars().count());
    }

    #[test]
    fn access_code_hash_shape() {
        assert!(validate_sha256_hex(&"a".repeat(64)).is_ok());
        assert!(validate_sha256_hex(&"A".repeat(64)).is_err());
        assert!(validate_sha256_hex("abc").is_err());
        assert!(validate_sha256_hex(&"g".repeat(64)).is_err());
    }
}
