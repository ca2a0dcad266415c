//! Lifecycle scenarios across the session manager, clip service and sweeper,
//! run against a real temp-dir storage root and a file-backed SQLite store.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use qopy_storage::{BlobStore, ChunkStore, ClipId, UploadId};

use crate::clips::{ClipContent, ClipService};
use crate::guard::{AccessGuard, GuardConfig};
use crate::metadata::{ContentType, MetadataStore, SessionStatus};
use crate::retention::Retention;
use crate::session::{InitiateUpload, UploadConfig, UploadSessionManager};
use crate::sweeper::{Sweeper, SweeperConfig};
use crate::{now_millis, Error};

struct Stack {
    // Keeps the storage root alive for the duration of the test.
    _dir: tempfile::TempDir,
    metadata: Arc<MetadataStore>,
    chunks: Arc<ChunkStore>,
    blobs: Arc<BlobStore>,
    manager: UploadSessionManager,
    clips: ClipService,
    sweeper: Sweeper,
}

async fn stack_with(upload: UploadConfig, sweeper: SweeperConfig) -> Stack {
    let dir = tempfile::TempDir::new().expect("must create tempdir");
    let db_path = dir.path().join("qopy.db");
    let metadata = Arc::new(
        MetadataStore::connect(&format!("sqlite://{}", db_path.display()))
            .await
            .expect("must connect"),
    );
    let chunks = Arc::new(ChunkStore::open(dir.path()).await.expect("must open"));
    let blobs = Arc::new(BlobStore::open(dir.path()).await.expect("must open"));
    let guard = Arc::new(AccessGuard::new(GuardConfig::default()));

    let manager = UploadSessionManager::new(
        metadata.clone(),
        chunks.clone(),
        blobs.clone(),
        upload,
    );
    let clips = ClipService::new(metadata.clone(), blobs.clone(), guard.clone());
    let sweeper_task = Sweeper::new(metadata.clone(), chunks.clone(), blobs.clone(), sweeper);

    Stack {
        _dir: dir,
        metadata,
        chunks,
        blobs,
        manager,
        clips,
        sweeper: sweeper_task,
    }
}

async fn stack() -> Stack {
    stack_with(UploadConfig::default(), SweeperConfig::default()).await
}

fn init_request(filesize: u64, chunk_size: Option<u64>) -> InitiateUpload {
    InitiateUpload {
        filename: "notes.txt.enc".to_string(),
        filesize,
        mime_type: "application/octet-stream".to_string(),
        chunk_size,
        one_time: false,
        quick_share: false,
        has_password: false,
        is_text_content: false,
        access_code_hash: None,
        retention: Retention::OneHour,
    }
}

async fn upload_chunk(stack: &Stack, id: &UploadId, n: u32, bytes: &[u8]) {
    stack
        .manager
        .receive_chunk(id, n, &mut std::io::Cursor::new(bytes.to_vec()))
        .await
        .expect("chunk upload must succeed");
}

async fn fetch_bytes(stack: &Stack, clip_id: &ClipId) -> Vec<u8> {
    let retrieved = stack
        .clips
        .get_clip("test-client", clip_id, None, None)
        .await
        .expect("fetch must succeed");
    match retrieved.content {
        ClipContent::Inline(bytes) => bytes,
        ClipContent::Stream(mut file) => {
            let mut buf = Vec::new();
            tokio::io::AsyncReadExt::read_to_end(&mut file, &mut buf)
                .await
                .expect("read must succeed");
            buf
        }
    }
}

/// Ages a published clip so the sweeper sees it as overdue.
async fn age_clip(stack: &Stack, clip_id: &ClipId, new_expiration: i64) {
    sqlx::query("UPDATE clips SET expiration_time = ? WHERE clip_id = ?")
        .bind(new_expiration)
        .bind(clip_id.as_str())
        .execute(stack.metadata.pool())
        .await
        .expect("aging must succeed");
}

#[tokio::test]
async fn small_file_single_chunk_roundtrip() {
    let stack = stack().await;

    let session = stack
        .manager
        .initiate(init_request(10, None))
        .await
        .expect("initiate must succeed");
    assert_eq!(1, session.total_chunks);
    assert_eq!(5 * 1024 * 1024, session.chunk_size);

    upload_chunk(&stack, &session.upload_id, 0, b"0123456789").await;
    let clip_id = stack
        .manager
        .complete(&session.upload_id)
        .await
        .expect("complete must succeed")
        .clip_id;

    // Session and chunk rows are gone, the clip is observable.
    assert!(stack
        .metadata
        .get_session(&session.upload_id)
        .await
        .expect("must not fail")
        .is_none());
    let info = stack
        .clips
        .get_info("test-client", &clip_id)
        .await
        .expect("info must succeed");
    assert_eq!(10, info.filesize);
    assert!(!info.one_time);

    // Not one-time: the same bytes come back on repeated reads.
    assert_eq!(b"0123456789".to_vec(), fetch_bytes(&stack, &clip_id).await);
    assert_eq!(b"0123456789".to_vec(), fetch_bytes(&stack, &clip_id).await);

    // Sweep after expiration removes both the row and the blob.
    age_clip(&stack, &clip_id, now_millis() - 1_000).await;
    let summary = stack.sweeper.sweep_once().await.expect("sweep must succeed");
    assert_eq!(1, summary.expired_clips);
    assert!(matches!(
        stack.clips.get_info("test-client", &clip_id).await,
        Err(Error::NotFound)
    ));
    assert!(!stack.blobs.exists(&clip_id).await.expect("must not fail"));
}

#[tokio::test]
async fn multi_chunk_assembly_out_of_order() {
    let stack = stack().await;

    // Three chunks: 5 + 5 + 2 bytes.
    let session = stack
        .manager
        .initiate(init_request(12, Some(5)))
        .await
        .expect("initiate must succeed");
    assert_eq!(3, session.total_chunks);

    upload_chunk(&stack, &session.upload_id, 2, b"cc").await;
    upload_chunk(&stack, &session.upload_id, 0, b"aaaaa").await;
    upload_chunk(&stack, &session.upload_id, 1, b"bbbbb").await;

    let clip_id = stack
        .manager
        .complete(&session.upload_id)
        .await
        .expect("complete must succeed")
        .clip_id;
    assert_eq!(b"aaaaabbbbbcc".to_vec(), fetch_bytes(&stack, &clip_id).await);
}

#[tokio::test]
async fn chunk_retry_is_idempotent() {
    let stack = stack().await;

    let session = stack
        .manager
        .initiate(init_request(12, Some(5)))
        .await
        .expect("initiate must succeed");

    upload_chunk(&stack, &session.upload_id, 0, b"aaaaa").await;
    upload_chunk(&stack, &session.upload_id, 1, b"AAAAA").await;
    let progress = stack
        .manager
        .receive_chunk(
            &session.upload_id,
            1,
            &mut std::io::Cursor::new(b"BBBBB".to_vec()),
        )
        .await
        .expect("retry must succeed");
    // The retry did not double-count.
    assert_eq!(2, progress.uploaded);
    upload_chunk(&stack, &session.upload_id, 2, b"cc").await;

    let clip_id = stack
        .manager
        .complete(&session.upload_id)
        .await
        .expect("complete must succeed")
        .clip_id;
    // Last writer wins: offset 5..10 carries the retried bytes.
    assert_eq!(b"aaaaaBBBBBcc".to_vec(), fetch_bytes(&stack, &clip_id).await);
}

#[tokio::test]
async fn wrong_chunk_size_rejected_without_state_change() {
    let stack = stack().await;

    let session = stack
        .manager
        .initiate(init_request(12, Some(5)))
        .await
        .expect("initiate must succeed");

    // Chunk 0 is not the last chunk and must carry exactly 5 bytes.
    let err = stack
        .manager
        .receive_chunk(
            &session.upload_id,
            0,
            &mut std::io::Cursor::new(b"abc".to_vec()),
        )
        .await
        .expect_err("short chunk must fail");
    assert!(matches!(err, Error::InvalidChunkSize { .. }));

    let row = stack
        .metadata
        .get_session(&session.upload_id)
        .await
        .expect("must not fail")
        .expect("session must exist");
    assert_eq!(0, row.uploaded_chunks);
    assert!(stack
        .chunks
        .read_chunk(&session.upload_id, 0)
        .await
        .expect("must not fail")
        .is_none());
}

#[tokio::test]
async fn chunk_number_out_of_range() {
    let stack = stack().await;
    let session = stack
        .manager
        .initiate(init_request(10, None))
        .await
        .expect("initiate must succeed");

    let err = stack
        .manager
        .receive_chunk(
            &session.upload_id,
            1,
            &mut std::io::Cursor::new(b"x".to_vec()),
        )
        .await
        .expect_err("chunk 1 of 1 must fail");
    assert!(matches!(err, Error::InvalidRequest(_)));
}

#[tokio::test]
async fn complete_requires_all_chunks() {
    let stack = stack().await;
    let session = stack
        .manager
        .initiate(init_request(12, Some(5)))
        .await
        .expect("initiate must succeed");
    upload_chunk(&stack, &session.upload_id, 0, b"aaaaa").await;

    let err = stack
        .manager
        .complete(&session.upload_id)
        .await
        .expect_err("incomplete session must not publish");
    assert!(matches!(
        err,
        Error::Incomplete {
            uploaded: 1,
            total: 3
        }
    ));

    // No clip was left behind and the session is still usable.
    let row = stack
        .metadata
        .get_session(&session.upload_id)
        .await
        .expect("must not fail")
        .expect("session must exist");
    assert_eq!(SessionStatus::Uploading, row.status);
}

#[tokio::test]
async fn size_mismatch_leaves_session_retryable() {
    let stack = stack().await;
    let session = stack
        .manager
        .initiate(init_request(10, Some(5)))
        .await
        .expect("initiate must succeed");
    upload_chunk(&stack, &session.upload_id, 0, b"aaaaa").await;
    upload_chunk(&stack, &session.upload_id, 1, b"bbbbb").await;

    // Corrupt chunk 1 on disk after it was recorded, so the assembled size
    // no longer matches the declared filesize.
    let path = stack
        .chunks
        .chunk_path(&session.upload_id, 1)
        .expect("path must derive");
    tokio::fs::write(&path, b"bb").await.expect("must write");

    let err = stack
        .manager
        .complete(&session.upload_id)
        .await
        .expect_err("mismatched assembly must fail");
    assert!(matches!(
        err,
        Error::SizeMismatch {
            expected: 10,
            got: 7
        }
    ));

    // The session is still uploading; re-uploading the bad chunk repairs it.
    let row = stack
        .metadata
        .get_session(&session.upload_id)
        .await
        .expect("must not fail")
        .expect("session must exist");
    assert_eq!(SessionStatus::Uploading, row.status);

    upload_chunk(&stack, &session.upload_id, 1, b"bbbbb").await;
    let clip_id = stack
        .manager
        .complete(&session.upload_id)
        .await
        .expect("retried complete must succeed")
        .clip_id;
    assert_eq!(b"aaaaabbbbb".to_vec(), fetch_bytes(&stack, &clip_id).await);
}

#[tokio::test]
async fn one_time_race_has_exactly_one_winner() {
    let stack = stack().await;
    let session = stack
        .manager
        .initiate(InitiateUpload {
            one_time: true,
            ..init_request(4, None)
        })
        .await
        .expect("initiate must succeed");
    upload_chunk(&stack, &session.upload_id, 0, b"once").await;
    let clip_id = stack
        .manager
        .complete(&session.upload_id)
        .await
        .expect("complete must succeed")
        .clip_id;

    let (a, b) = tokio::join!(
        stack.clips.get_clip("client-a", &clip_id, None, None),
        stack.clips.get_clip("client-b", &clip_id, None, None),
    );

    let (winner, loser) = match (a, b) {
        (Ok(win), Err(lose)) => (win, lose),
        (Err(lose), Ok(win)) => (win, lose),
        (Ok(_), Ok(_)) => panic!("both readers observed a one-time clip"),
        (Err(a), Err(b)) => panic!("no reader observed the clip: {a:?} / {b:?}"),
    };
    assert!(winner.consumed);
    match winner.content {
        ClipContent::Stream(mut file) => {
            let mut buf = Vec::new();
            tokio::io::AsyncReadExt::read_to_end(&mut file, &mut buf)
                .await
                .expect("read must succeed");
            assert_eq!(b"once".to_vec(), buf);
        }
        ClipContent::Inline(_) => panic!("file clip must stream"),
    }
    assert!(matches!(loser, Error::Gone));

    // Row and blob are both gone afterwards.
    assert!(matches!(
        stack.clips.get_info("client-c", &clip_id).await,
        Err(Error::NotFound)
    ));
    // The unlink runs on a detached task.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!stack.blobs.exists(&clip_id).await.expect("must not fail"));
}

#[tokio::test]
async fn content_type_mismatch_does_not_consume() {
    let stack = stack().await;
    let session = stack
        .manager
        .initiate(InitiateUpload {
            one_time: true,
            ..init_request(4, None)
        })
        .await
        .expect("initiate must succeed");
    upload_chunk(&stack, &session.upload_id, 0, b"once").await;
    let clip_id = stack
        .manager
        .complete(&session.upload_id)
        .await
        .expect("complete must succeed")
        .clip_id;

    // Asking for the file clip as text is a 404 before any consumption.
    let err = stack
        .clips
        .get_clip("client", &clip_id, None, Some(ContentType::Text))
        .await
        .expect_err("mismatched type must not be served");
    assert!(matches!(err, Error::NotFound));

    // The one-time read is still available.
    let retrieved = stack
        .clips
        .get_clip("client", &clip_id, None, Some(ContentType::File))
        .await
        .expect("matching type must be served");
    assert!(retrieved.consumed);
}

#[tokio::test]
async fn access_code_gates_fetch() {
    let stack = stack().await;
    // SHA-256("sesame")
    let hash = "d0c04f4b1951e4aeaaec8223ed2039e542f3aae805a6fa7f6d794e5afff5d272";
    let session = stack
        .manager
        .initiate(InitiateUpload {
            access_code_hash: Some(hash.to_string()),
            ..init_request(6, None)
        })
        .await
        .expect("initiate must succeed");
    upload_chunk(&stack, &session.upload_id, 0, b"secret").await;
    let clip_id = stack
        .manager
        .complete(&session.upload_id)
        .await
        .expect("complete must succeed")
        .clip_id;

    let info = stack
        .clips
        .get_info("client", &clip_id)
        .await
        .expect("info must succeed");
    assert!(info.requires_access_code);

    assert!(matches!(
        stack.clips.get_clip("client", &clip_id, None, None).await,
        Err(Error::AccessDenied)
    ));
    assert!(matches!(
        stack.clips.get_clip("client", &clip_id, Some("wrong"), None).await,
        Err(Error::AccessDenied)
    ));
    let retrieved = stack
        .clips
        .get_clip("client", &clip_id, Some("sesame"), None)
        .await
        .expect("correct code must succeed");
    assert!(!retrieved.consumed);
}

#[tokio::test]
async fn text_clips_return_inline_payload() {
    let stack = stack().await;
    let session = stack
        .manager
        .initiate(InitiateUpload {
            is_text_content: true,
            ..init_request(9, None)
        })
        .await
        .expect("initiate must succeed");
    upload_chunk(&stack, &session.upload_id, 0, b"inline ct").await;
    let clip_id = stack
        .manager
        .complete(&session.upload_id)
        .await
        .expect("complete must succeed")
        .clip_id;

    let retrieved = stack
        .clips
        .get_clip("client", &clip_id, None, None)
        .await
        .expect("fetch must succeed");
    match retrieved.content {
        ClipContent::Inline(bytes) => assert_eq!(b"inline ct".to_vec(), bytes),
        ClipContent::Stream(_) => panic!("text clip must be inline"),
    }
}

#[tokio::test]
async fn quick_share_allocates_short_id() {
    let stack = stack().await;
    let session = stack
        .manager
        .initiate(InitiateUpload {
            quick_share: true,
            ..init_request(1, None)
        })
        .await
        .expect("initiate must succeed");
    // A one-byte file is a single one-byte chunk.
    upload_chunk(&stack, &session.upload_id, 0, b"x").await;
    let clip_id = stack
        .manager
        .complete(&session.upload_id)
        .await
        .expect("complete must succeed")
        .clip_id;
    assert_eq!(4, clip_id.as_str().len());
    assert!(clip_id.is_short());
}

#[tokio::test]
async fn zero_filesize_rejected() {
    let stack = stack().await;
    assert!(matches!(
        stack.manager.initiate(init_request(0, None)).await,
        Err(Error::InvalidRequest(_))
    ));
}

#[tokio::test]
async fn oversized_file_rejected() {
    let stack = stack_with(
        UploadConfig {
            max_file_size: 1024,
            ..UploadConfig::default()
        },
        SweeperConfig::default(),
    )
    .await;
    assert!(matches!(
        stack.manager.initiate(init_request(2048, None)).await,
        Err(Error::FileTooLarge { .. })
    ));
}

#[tokio::test]
async fn expired_session_rejects_chunks_and_is_swept() {
    let stack = stack_with(
        UploadConfig {
            upload_ttl: Duration::ZERO,
            ..UploadConfig::default()
        },
        SweeperConfig::default(),
    )
    .await;
    let session = stack
        .manager
        .initiate(init_request(10, None))
        .await
        .expect("initiate must succeed");
    tokio::time::sleep(Duration::from_millis(10)).await;

    let err = stack
        .manager
        .receive_chunk(
            &session.upload_id,
            0,
            &mut std::io::Cursor::new(b"0123456789".to_vec()),
        )
        .await
        .expect_err("expired session must reject chunks");
    assert!(matches!(err, Error::SessionExpired));

    let summary = stack.sweeper.sweep_once().await.expect("sweep must succeed");
    assert_eq!(1, summary.expired_sessions);
    assert!(stack
        .metadata
        .get_session(&session.upload_id)
        .await
        .expect("must not fail")
        .is_none());
}

#[tokio::test]
async fn abort_removes_session_and_chunks() {
    let stack = stack().await;
    let session = stack
        .manager
        .initiate(init_request(12, Some(5)))
        .await
        .expect("initiate must succeed");
    upload_chunk(&stack, &session.upload_id, 0, b"aaaaa").await;

    stack
        .manager
        .abort(&session.upload_id)
        .await
        .expect("abort must succeed");
    assert!(stack
        .metadata
        .get_session(&session.upload_id)
        .await
        .expect("must not fail")
        .is_none());
    assert!(stack
        .chunks
        .read_chunk(&session.upload_id, 0)
        .await
        .expect("must not fail")
        .is_none());

    assert!(matches!(
        stack.manager.abort(&session.upload_id).await,
        Err(Error::NotFound)
    ));
}

#[tokio::test]
async fn brute_force_lookups_get_blocked() {
    let stack = stack().await;
    let client = "hostile-client";

    for _ in 0..20 {
        let id = ClipId::generate(qopy_storage::ClipIdKind::Quick, &mut rand::rngs::OsRng);
        assert!(matches!(
            stack.clips.get_info(client, &id).await,
            Err(Error::NotFound)
        ));
    }

    // The 21st lookup is refused before any metadata touch.
    let id = ClipId::generate(qopy_storage::ClipIdKind::Quick, &mut rand::rngs::OsRng);
    assert!(matches!(
        stack.clips.get_info(client, &id).await,
        Err(Error::RateLimited { .. })
    ));
}

#[tokio::test]
async fn reserving_a_taken_id_fails() {
    let stack = stack().await;
    let clip_id = ClipId::from_str("AAAA").expect("valid");
    let clip = crate::metadata::NewClip {
        content_type: ContentType::File,
        original_filename: Some("f".into()),
        mime_type: Some("application/octet-stream".into()),
        filesize: 1,
        password_hash: None,
        access_code_hash: None,
        one_time: false,
        quick_share: true,
        expiration_time: now_millis() + 60_000,
        max_accesses: None,
        created_at: now_millis(),
    };
    assert!(stack
        .metadata
        .reserve_clip(&clip_id, &clip)
        .await
        .expect("first reserve must succeed"));
    assert!(!stack
        .metadata
        .reserve_clip(&clip_id, &clip)
        .await
        .expect("second reserve must report collision"));

    // Reserved rows are invisible to reads.
    assert!(stack
        .metadata
        .get_clip(&clip_id)
        .await
        .expect("must not fail")
        .is_none());
}

#[tokio::test]
async fn orphaned_chunk_dirs_are_swept_after_grace() {
    let stack = stack_with(
        UploadConfig::default(),
        SweeperConfig {
            orphan_grace: Duration::ZERO,
            ..SweeperConfig::default()
        },
    )
    .await;

    // A chunk directory with no session row: simulate a crashed upload.
    let ghost = UploadId::generate(&mut rand::rngs::OsRng);
    stack
        .chunks
        .write_chunk(&ghost, 0, &mut std::io::Cursor::new(b"zz".to_vec()), 2)
        .await
        .expect("write must succeed");

    tokio::time::sleep(Duration::from_millis(10)).await;
    let summary = stack.sweeper.sweep_once().await.expect("sweep must succeed");
    assert_eq!(1, summary.orphaned_chunk_dirs);
    assert!(stack
        .chunks
        .read_chunk(&ghost, 0)
        .await
        .expect("must not fail")
        .is_none());
}

#[tokio::test]
async fn statistics_advance_with_lifecycle() {
    let stack = stack().await;

    let before = stack.metadata.statistics().await.expect("must not fail");
    let session = stack
        .manager
        .initiate(init_request(2, None))
        .await
        .expect("initiate must succeed");
    upload_chunk(&stack, &session.upload_id, 0, b"ab").await;
    let clip_id = stack
        .manager
        .complete(&session.upload_id)
        .await
        .expect("complete must succeed")
        .clip_id;
    fetch_bytes(&stack, &clip_id).await;

    let after = stack.metadata.statistics().await.expect("must not fail");
    assert_eq!(before.total_sessions + 1, after.total_sessions);
    assert_eq!(before.completed_sessions + 1, after.completed_sessions);
    assert_eq!(before.total_accesses + 1, after.total_accesses);

    let daily = stack
        .metadata
        .daily_uploads(7)
        .await
        .expect("must not fail");
    assert_eq!(1, daily.len());
    assert_eq!(1, daily[0].1);
}
