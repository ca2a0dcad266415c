//! Temporary store for per-upload chunk files.
//!
//! Chunks live at `{root}/{upload_id}/chunk_{n}` until the session is
//! assembled or swept. Writes stage into a temp file in the session
//! directory, are fsynced together with the directory and only then renamed
//! into place, so a chunk file that exists is always complete.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{instrument, warn};

use crate::paths::{
    canonicalize_under_root, create_dir_restricted, ensure_under_root, sync_dir, tempfile_error,
    OrphanEntry,
};
use crate::{Error, UploadId};

pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    /// Opens (and creates, if missing) the chunk root below `storage_path`.
    pub async fn open(storage_path: &Path) -> Result<Self, Error> {
        let root = storage_path.join("temp");
        create_dir_restricted(&root).await?;
        let root = tokio::fs::canonicalize(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, upload_id: &UploadId) -> Result<PathBuf, Error> {
        ensure_under_root(&self.root, self.root.join(upload_id.to_string()))
    }

    fn chunk_path_in(dir: &Path, chunk_number: u32) -> PathBuf {
        dir.join(format!("chunk_{}", chunk_number))
    }

    pub fn chunk_path(&self, upload_id: &UploadId, chunk_number: u32) -> Result<PathBuf, Error> {
        let dir = self.session_dir(upload_id)?;
        ensure_under_root(&self.root, Self::chunk_path_in(&dir, chunk_number))
    }

    /// Streams a chunk body into place, enforcing that it carries exactly
    /// `expected_len` bytes. On any failure no chunk file is left behind;
    /// re-writing an existing chunk atomically replaces it.
    #[instrument(skip(self, reader), err, fields(upload.id=%upload_id, chunk.number=chunk_number))]
    pub async fn write_chunk<R>(
        &self,
        upload_id: &UploadId,
        chunk_number: u32,
        reader: &mut R,
        expected_len: u64,
    ) -> Result<(PathBuf, u64), Error>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let dir = self.session_dir(upload_id)?;
        create_dir_restricted(&dir).await?;
        let dir = canonicalize_under_root(&self.root, &dir).await?;

        let mut tmp = async_tempfile::TempFile::new_in(dir.clone())
            .await
            .map_err(tempfile_error)?;

        // Read one byte past the expected length so an oversized body is
        // detected without buffering the excess.
        let got = tokio::io::copy(&mut reader.take(expected_len + 1), &mut tmp).await?;
        if got != expected_len {
            // The temp file is removed on drop.
            return Err(Error::WrongChunkSize {
                chunk_number,
                expected: expected_len,
                got,
            });
        }

        tmp.flush().await?;
        tmp.sync_all().await?;

        let dst = ensure_under_root(&self.root, Self::chunk_path_in(&dir, chunk_number))?;
        tokio::fs::rename(tmp.file_path(), &dst).await?;
        sync_dir(&dir).await?;

        Ok((dst, got))
    }

    /// Opens a chunk file for reading, `None` if it does not exist.
    pub async fn read_chunk(
        &self,
        upload_id: &UploadId,
        chunk_number: u32,
    ) -> Result<Option<tokio::fs::File>, Error> {
        let path = self.chunk_path(upload_id, chunk_number)?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Sequentially streams chunks `0..total_chunks` into `writer` in
    /// ascending order, returning the total number of bytes written.
    #[instrument(skip(self, writer), err, fields(upload.id=%upload_id, total_chunks))]
    pub async fn concatenate<W>(
        &self,
        upload_id: &UploadId,
        total_chunks: u32,
        writer: &mut W,
    ) -> Result<u64, Error>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut total = 0u64;
        for chunk_number in 0..total_chunks {
            let mut chunk = self
                .read_chunk(upload_id, chunk_number)
                .await?
                .ok_or(Error::MissingChunk { chunk_number })?;
            total += tokio::io::copy(&mut chunk, writer).await?;
        }
        Ok(total)
    }

    /// Removes the session directory recursively. A missing or partially
    /// populated directory is not an error.
    #[instrument(skip(self), fields(upload.id=%upload_id))]
    pub async fn delete_session(&self, upload_id: &UploadId) -> Result<(), Error> {
        let dir = self.session_dir(upload_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Lists the session directories currently present under the root, for
    /// orphan reconciliation.
    pub async fn list_sessions(&self) -> Result<Vec<OrphanEntry>, Error> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(name) => {
                    warn!(?name, "skipping non-utf8 entry under chunk root");
                    continue;
                }
            };
            let modified = entry.metadata().await?.modified()?;
            entries.push(OrphanEntry {
                name,
                path: entry.path(),
                modified,
            });
        }
        Ok(entries)
    }

    /// Removes an orphaned session directory found by [Self::list_sessions].
    /// The path is re-verified against the root before removal.
    pub async fn remove_orphan(&self, path: &Path) -> Result<(), Error> {
        let path = ensure_under_root(&self.root, path.to_path_buf())?;
        if path == self.root {
            return Err(Error::PathEscape(path));
        }
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
