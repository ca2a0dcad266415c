use std::io;
use std::str::FromStr;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use qopy_service::guard::Bucket;
use qopy_service::metadata::ContentType;
use qopy_service::retention::Retention;
use qopy_service::session::InitiateUpload;
use qopy_storage::UploadId;

use crate::{ApiError, AppState, ClientKey};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InitRequest {
    filename: String,
    filesize: u64,
    mime_type: String,
    chunk_size: Option<u64>,
    #[serde(default)]
    one_time: bool,
    #[serde(default)]
    quick_share: bool,
    #[serde(default)]
    has_password: bool,
    #[serde(default)]
    text_content: bool,
    access_code_hash: Option<String>,
    retention: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InitResponse {
    upload_id: String,
    total_chunks: u32,
    chunk_size: u64,
}

#[instrument(skip_all, fields(client=%client.0))]
pub(crate) async fn init(
    State(state): State<AppState>,
    client: ClientKey,
    Json(request): Json<InitRequest>,
) -> Result<Json<InitResponse>, ApiError> {
    state.guard.check_rate(Bucket::Creates, &client.0)?;

    let retention = Retention::from_str(&request.retention)?;
    let session = state
        .sessions
        .initiate(InitiateUpload {
            filename: request.filename,
            filesize: request.filesize,
            mime_type: request.mime_type,
            chunk_size: request.chunk_size,
            one_time: request.one_time,
            quick_share: request.quick_share,
            has_password: request.has_password,
            is_text_content: request.text_content,
            access_code_hash: request.access_code_hash,
            retention,
        })
        .await?;

    Ok(Json(InitResponse {
        upload_id: session.upload_id.to_string(),
        total_chunks: session.total_chunks,
        chunk_size: session.chunk_size,
    }))
}

#[derive(Debug, Serialize)]
pub(crate) struct ChunkResponse {
    uploaded: i64,
    total: i64,
}

#[instrument(skip_all)]
pub(crate) async fn chunk(
    State(state): State<AppState>,
    Path((upload_id, chunk_number)): Path<(String, u32)>,
    request: axum::extract::Request,
) -> Result<Json<ChunkResponse>, ApiError> {
    let upload_id = UploadId::from_str(&upload_id)?;
    let _slot = state.sessions.acquire_upload_slot()?;

    // Stream the raw body to the chunk store without buffering it in full.
    let stream = request.into_body().into_data_stream();
    let mut reader = tokio_util::io::StreamReader::new(stream.map_err(|e| {
        warn!(err=%e, "failed to read chunk body");
        io::Error::new(io::ErrorKind::BrokenPipe, e.to_string())
    }));

    let progress = state
        .sessions
        .receive_chunk(&upload_id, chunk_number, &mut reader)
        .await?;

    Ok(Json(ChunkResponse {
        uploaded: progress.uploaded,
        total: progress.total,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CompleteResponse {
    clip_id: String,
    url: String,
}

#[instrument(skip_all)]
pub(crate) async fn complete(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Result<Json<CompleteResponse>, ApiError> {
    let upload_id = UploadId::from_str(&upload_id)?;
    let _slot = state.sessions.acquire_upload_slot()?;

    let completed = state.sessions.complete(&upload_id).await?;
    let segment = match completed.content_type {
        ContentType::Text => "clip",
        ContentType::File => "file",
    };
    let url = format!(
        "{}/{segment}/{}",
        state.config.base_url.trim_end_matches('/'),
        completed.clip_id
    );

    Ok(Json(CompleteResponse {
        clip_id: completed.clip_id.to_string(),
        url,
    }))
}

#[instrument(skip_all)]
pub(crate) async fn abort(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let upload_id = UploadId::from_str(&upload_id)?;
    state.sessions.abort(&upload_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
