//! Background reconciliation of metadata with on-disk state.
//!
//! Each pass is idempotent and only removes state that is already
//! unreachable or past its deadline, so it is safe to run concurrently with
//! live uploads and downloads.

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{info, instrument, warn};

use qopy_storage::{BlobStore, ChunkStore, ClipId, UploadId};

use crate::metadata::MetadataStore;
use crate::{now_millis, Error};

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval: Duration,
    /// Minimum age before an on-disk entry with no metadata referent is
    /// considered abandoned rather than in-flight.
    pub orphan_grace: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            orphan_grace: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub expired_clips: u64,
    pub expired_sessions: u64,
    pub reclaimed_reservations: u64,
    pub orphaned_chunk_dirs: u64,
    pub orphaned_blobs: u64,
    pub stale_tmp_files: u64,
}

pub struct Sweeper {
    metadata: Arc<MetadataStore>,
    chunks: Arc<ChunkStore>,
    blobs: Arc<BlobStore>,
    config: SweeperConfig,
}

impl Sweeper {
    pub fn new(
        metadata: Arc<MetadataStore>,
        chunks: Arc<ChunkStore>,
        blobs: Arc<BlobStore>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            metadata,
            chunks,
            blobs,
            config,
        }
    }

    /// Spawns the periodic sweep loop.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep_once().await {
                    warn!(err=%e, "sweep pass failed");
                }
            }
        })
    }

    /// One full pass: expired clips, overdue sessions, stale reservations,
    /// orphaned files, statistics.
    #[instrument(skip_all, err)]
    pub async fn sweep_once(&self) -> Result<SweepSummary, Error> {
        let mut summary = SweepSummary::default();
        let now = now_millis();

        // 1. Expired clips: rows become invisible first, then blobs and rows go.
        for row in self.metadata.expire_overdue_clips(now).await? {
            let clip_id = match ClipId::from_str(&row.clip_id) {
                Ok(id) => id,
                Err(e) => {
                    warn!(clip.id=%row.clip_id, err=%e, "unparseable clip id in store");
                    continue;
                }
            };
            self.blobs.delete(&clip_id).await?;
            self.metadata.delete_clip(&clip_id).await?;
            summary.expired_clips += 1;
        }

        // 2. Overdue or failed upload sessions: chunk directories, then rows.
        for row in self.metadata.collect_overdue_sessions(now).await? {
            let upload_id = match UploadId::from_str(&row.upload_id) {
                Ok(id) => id,
                Err(e) => {
                    warn!(upload.id=%row.upload_id, err=%e, "unparseable upload id in store");
                    continue;
                }
            };
            self.chunks.delete_session(&upload_id).await?;
            self.metadata.delete_session(&upload_id).await?;
            summary.expired_sessions += 1;
        }

        // 3. Clip reservations whose completion never finished.
        let reservation_cutoff = now - self.config.orphan_grace.as_millis() as i64;
        for id in self
            .metadata
            .reserved_clips_older_than(reservation_cutoff)
            .await?
        {
            if let Ok(clip_id) = ClipId::from_str(&id) {
                self.blobs.delete(&clip_id).await?;
                self.metadata.delete_clip(&clip_id).await?;
                summary.reclaimed_reservations += 1;
            }
        }

        // 4. On-disk entries with no metadata referent, older than the grace
        // period. Anything younger may belong to an in-flight request.
        let disk_cutoff = SystemTime::now() - self.config.orphan_grace;

        let live_uploads = self.metadata.live_upload_ids().await?;
        for entry in self.chunks.list_sessions().await? {
            if entry.modified < disk_cutoff && !live_uploads.contains(&entry.name) {
                self.chunks.remove_orphan(&entry.path).await?;
                summary.orphaned_chunk_dirs += 1;
            }
        }

        let live_clips = self.metadata.live_clip_ids().await?;
        for entry in self.blobs.list_blobs().await? {
            if entry.modified < disk_cutoff && !live_clips.contains(&entry.name) {
                self.blobs.remove_orphan(&entry.path).await?;
                summary.orphaned_blobs += 1;
            }
        }
        summary.stale_tmp_files = self.blobs.sweep_stale_tmp(disk_cutoff).await?;

        // 5. Statistics deltas.
        if summary.expired_clips > 0 || summary.expired_sessions > 0 {
            self.metadata
                .bump_expired(
                    summary.expired_clips as i64,
                    summary.expired_sessions as i64,
                )
                .await?;
        }

        info!(
            expired_clips = summary.expired_clips,
            expired_sessions = summary.expired_sessions,
            reclaimed_reservations = summary.reclaimed_reservations,
            orphaned_chunk_dirs = summary.orphaned_chunk_dirs,
            orphaned_blobs = summary.orphaned_blobs,
            stale_tmp_files = summary.stale_tmp_files,
            "sweep pass done"
        );
        Ok(summary)
    }
}
