//! Permanent store for assembled ciphertext blobs.
//!
//! Blobs are staged in a `tmp` directory inside the root and moved
//! **atomically** into `{root}/{cc}/{clip_id}` in a sharding style, where
//! `cc` is the first two characters of the clip id. Content is opaque to the
//! store; bytes are never inspected or rewritten.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::SystemTime;

use pin_project_lite::pin_project;
use tokio::io::AsyncWriteExt;
use tracing::{instrument, warn};

use crate::paths::{
    create_dir_restricted, ensure_under_root, sync_dir, tempfile_error, OrphanEntry,
};
use crate::{ClipId, Error};

const TMP_DIR: &str = "tmp";

pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Opens (and creates, if missing) the blob root below `storage_path`.
    pub async fn open(storage_path: &Path) -> Result<Self, Error> {
        let root = storage_path.join("blobs");
        create_dir_restricted(&root).await?;
        create_dir_restricted(&root.join(TMP_DIR)).await?;
        let root = tokio::fs::canonicalize(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blob_path(&self, clip_id: &ClipId) -> Result<PathBuf, Error> {
        ensure_under_root(
            &self.root,
            self.root.join(clip_id.shard_prefix()).join(clip_id.as_str()),
        )
    }

    /// Starts writing the blob for `clip_id`. Bytes go to a staging file;
    /// nothing is visible under the shard layout until [StagedBlob::commit].
    /// Dropping the writer discards the staged bytes.
    #[instrument(skip(self), fields(clip.id=%clip_id))]
    pub async fn put(&self, clip_id: &ClipId) -> Result<StagedBlob, Error> {
        let dest = self.blob_path(clip_id)?;
        let file = async_tempfile::TempFile::new_in(self.root.join(TMP_DIR))
            .await
            .map_err(tempfile_error)?;
        Ok(StagedBlob { dest, file })
    }

    /// Opens a blob for streaming, `None` if it does not exist.
    #[instrument(skip(self), err, fields(clip.id=%clip_id))]
    pub async fn open(&self, clip_id: &ClipId) -> Result<Option<tokio::fs::File>, Error> {
        let path = self.blob_path(clip_id)?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, clip_id: &ClipId) -> Result<bool, Error> {
        Ok(tokio::fs::try_exists(self.blob_path(clip_id)?).await?)
    }

    /// Unlinks the blob. A missing file is not an error, so deletes may be
    /// retried and may race the sweeper.
    #[instrument(skip(self), fields(clip.id=%clip_id))]
    pub async fn delete(&self, clip_id: &ClipId) -> Result<(), Error> {
        let path = self.blob_path(clip_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Lists all blob files under the shard directories, for orphan
    /// reconciliation.
    pub async fn list_blobs(&self) -> Result<Vec<OrphanEntry>, Error> {
        let mut entries = Vec::new();
        let mut shards = tokio::fs::read_dir(&self.root).await?;
        while let Some(shard) = shards.next_entry().await? {
            if shard.file_name() == TMP_DIR || !shard.metadata().await?.is_dir() {
                continue;
            }
            let mut blobs = tokio::fs::read_dir(shard.path()).await?;
            while let Some(blob) = blobs.next_entry().await? {
                let name = match blob.file_name().into_string() {
                    Ok(name) => name,
                    Err(name) => {
                        warn!(?name, "skipping non-utf8 entry under blob root");
                        continue;
                    }
                };
                let modified = blob.metadata().await?.modified()?;
                entries.push(OrphanEntry {
                    name,
                    path: blob.path(),
                    modified,
                });
            }
        }
        Ok(entries)
    }

    /// Removes an orphaned blob found by [Self::list_blobs]. The path is
    /// re-verified against the root before removal.
    pub async fn remove_orphan(&self, path: &Path) -> Result<(), Error> {
        let path = ensure_under_root(&self.root, path.to_path_buf())?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes staging files older than `older_than`, left behind by crashes
    /// between staging and commit. Returns how many were removed.
    pub async fn sweep_stale_tmp(&self, older_than: SystemTime) -> Result<u64, Error> {
        let mut removed = 0;
        let mut dir = tokio::fs::read_dir(self.root.join(TMP_DIR)).await?;
        while let Some(entry) = dir.next_entry().await? {
            if entry.metadata().await?.modified()? < older_than {
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(removed)
    }
}

pin_project! {
    /// An in-progress blob write. Implements [tokio::io::AsyncWrite]; call
    /// [StagedBlob::commit] to fsync and atomically publish the bytes under
    /// the shard layout.
    pub struct StagedBlob {
        dest: PathBuf,
        #[pin]
        file: async_tempfile::TempFile,
    }
}

impl StagedBlob {
    /// The path the blob will occupy once committed.
    pub fn dest(&self) -> &Path {
        &self.dest
    }

    pub async fn commit(mut self) -> Result<PathBuf, Error> {
        self.file.flush().await?;
        self.file.sync_all().await?;

        // The shard directory name is two charset characters, always a
        // non-root parent.
        let shard = self.dest.parent().expect("blob path has a shard parent");
        create_dir_restricted(shard).await?;
        tokio::fs::rename(self.file.file_path(), &self.dest).await?;
        sync_dir(shard).await?;

        Ok(self.dest)
    }
}

impl tokio::io::AsyncWrite for StagedBlob {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        self.project().file.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        self.project().file.poll_flush(cx)
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        self.project().file.poll_shutdown(cx)
    }
}
