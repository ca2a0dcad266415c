//! Post-assembly clip lifecycle: metadata lookup, content retrieval,
//! one-time consumption and access-code gating.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tracing::{instrument, warn};

use qopy_storage::{BlobStore, ClipId};

use crate::guard::{AccessGuard, Bucket};
use crate::metadata::{ClipRow, ContentType, MetadataStore};
use crate::{now_millis, Error};

/// Metadata a client may see before fetching. Reveals no ciphertext.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipInfo {
    pub clip_id: String,
    pub content_type: ContentType,
    pub has_password: bool,
    pub requires_access_code: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub filesize: i64,
    pub expiration_time: i64,
    pub one_time: bool,
}

impl ClipInfo {
    fn from_row(row: &ClipRow) -> Self {
        Self {
            clip_id: row.clip_id.clone(),
            content_type: row.content_type,
            has_password: row.has_password(),
            requires_access_code: row.requires_access_code,
            filename: row.original_filename.clone(),
            mime_type: row.mime_type.clone(),
            filesize: row.filesize,
            expiration_time: row.expiration_time,
            one_time: row.one_time,
        }
    }
}

/// Retrieved clip content. Text payloads are small and returned inline;
/// file payloads stream from the already-opened blob handle, so a one-time
/// blob can be unlinked before the client finishes reading.
pub enum ClipContent {
    Inline(Vec<u8>),
    Stream(tokio::fs::File),
}

pub struct RetrievedClip {
    pub info: ClipInfo,
    pub content: ClipContent,
    /// Whether this call consumed a one-time clip.
    pub consumed: bool,
}

pub struct ClipService {
    metadata: Arc<MetadataStore>,
    blobs: Arc<BlobStore>,
    guard: Arc<AccessGuard>,
}

impl ClipService {
    pub fn new(
        metadata: Arc<MetadataStore>,
        blobs: Arc<BlobStore>,
        guard: Arc<AccessGuard>,
    ) -> Self {
        Self {
            metadata,
            blobs,
            guard,
        }
    }

    /// Metadata-only lookup. 404s on short ids feed the brute-force blocker.
    #[instrument(skip(self, client), err, fields(clip.id=%clip_id))]
    pub async fn get_info(&self, client: &str, clip_id: &ClipId) -> Result<ClipInfo, Error> {
        self.guard.check_blocked(client)?;
        let row = self.load_visible(client, clip_id).await?;
        self.guard.record_lookup_success(client);
        Ok(ClipInfo::from_row(&row))
    }

    /// Fetches clip content, enforcing rate limits, access-code gating and
    /// one-time semantics. For a one-time clip exactly one concurrent caller
    /// gets the content; all others observe [Error::Gone].
    ///
    /// When `expected_type` is given, a clip of the other content type is a
    /// 404. The check runs before consumption, so requesting a one-time clip
    /// through the wrong surface can never destroy it.
    #[instrument(skip(self, client, access_code), err, fields(clip.id=%clip_id))]
    pub async fn get_clip(
        &self,
        client: &str,
        clip_id: &ClipId,
        access_code: Option<&str>,
        expected_type: Option<ContentType>,
    ) -> Result<RetrievedClip, Error> {
        self.guard.check_blocked(client)?;
        self.guard.check_rate(Bucket::Downloads, client)?;

        let row = self.load_visible(client, clip_id).await?;

        if expected_type.is_some_and(|t| t != row.content_type) {
            return Err(Error::NotFound);
        }

        if row.requires_access_code {
            let expected = row
                .access_code_hash
                .as_deref()
                .ok_or(Error::AccessDenied)?;
            let code = access_code.ok_or(Error::AccessDenied)?;
            if !AccessGuard::verify_access_code(code, expected) {
                self.guard.record_access_failure(client);
                return Err(Error::AccessDenied);
            }
        }

        let now = now_millis();
        let consumed = if row.one_time {
            // Linearization point: losing the delete race means another
            // reader already took the content.
            match self.metadata.consume_one_time(clip_id, now).await? {
                Some(_) => true,
                None => return Err(Error::Gone),
            }
        } else {
            if row
                .max_accesses
                .is_some_and(|max| row.access_count >= max)
            {
                return Err(Error::Gone);
            }
            self.metadata.increment_access(clip_id, now).await?;
            false
        };

        let content = match self.open_content(&row, clip_id).await {
            Ok(content) => content,
            Err(e) => {
                if consumed {
                    // The row is gone; make sure the blob goes too.
                    self.discard_blob(clip_id);
                }
                return Err(e);
            }
        };

        if consumed {
            // The open handle keeps streaming after the unlink, and the
            // delete happens whether or not the client sticks around.
            self.discard_blob(clip_id);
        }

        self.guard.record_lookup_success(client);
        Ok(RetrievedClip {
            info: ClipInfo::from_row(&row),
            content,
            consumed,
        })
    }

    async fn open_content(&self, row: &ClipRow, clip_id: &ClipId) -> Result<ClipContent, Error> {
        let file = self.blobs.open(clip_id).await?.ok_or_else(|| {
            warn!(clip.id=%clip_id, "clip row present but blob missing");
            Error::NotFound
        })?;
        match row.content_type {
            ContentType::Text => {
                let mut buf = Vec::with_capacity(row.filesize as usize);
                let mut file = file;
                file.read_to_end(&mut buf).await.map_err(|e| {
                    Error::Storage(qopy_storage::Error::Io(e))
                })?;
                Ok(ClipContent::Inline(buf))
            }
            ContentType::File => Ok(ClipContent::Stream(file)),
        }
    }

    fn discard_blob(&self, clip_id: &ClipId) {
        let blobs = self.blobs.clone();
        let clip_id = clip_id.clone();
        tokio::spawn(async move {
            if let Err(e) = blobs.delete(&clip_id).await {
                warn!(clip.id=%clip_id, err=%e, "failed to delete consumed blob");
            }
        });
    }

    /// Explicit removal (admin path): deletes row and blob.
    #[instrument(skip(self), err, fields(clip.id=%clip_id))]
    pub async fn delete_clip(&self, clip_id: &ClipId) -> Result<(), Error> {
        if !self.metadata.delete_clip(clip_id).await? {
            return Err(Error::NotFound);
        }
        self.blobs.delete(clip_id).await?;
        Ok(())
    }

    /// Loads a published clip, treating both absent and expired rows as 404
    /// and feeding short-id misses to the blocker.
    async fn load_visible(&self, client: &str, clip_id: &ClipId) -> Result<ClipRow, Error> {
        let row = self.metadata.get_clip(clip_id).await?;
        let row = match row {
            Some(row) if row.expiration_time > now_millis() => row,
            _ => {
                self.guard.record_lookup_failure(client, clip_id.is_short());
                return Err(Error::NotFound);
            }
        };
        Ok(row)
    }
}
