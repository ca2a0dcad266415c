use std::str::FromStr;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::instrument;

use qopy_service::clips::{ClipContent, ClipInfo};
use qopy_service::metadata::ContentType;
use qopy_storage::ClipId;

use crate::{ApiError, AppState, ClientKey};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FetchRequest {
    access_code: Option<String>,
}

/// Metadata-only lookup, shared by `/api/clip/{id}/info` and
/// `/api/file/{id}/info`.
#[instrument(skip_all, fields(client=%client.0))]
pub(crate) async fn info(
    State(state): State<AppState>,
    client: ClientKey,
    Path(clip_id): Path<String>,
) -> Result<Json<ClipInfo>, ApiError> {
    let clip_id = ClipId::from_str(&clip_id)?;
    let info = state.clips.get_info(&client.0, &clip_id).await?;
    Ok(Json(info))
}

/// Fetches the inline ciphertext payload of a text clip. File clips live on
/// the `/api/file` surface; through here they are a 404.
#[instrument(skip_all, fields(client=%client.0))]
pub(crate) async fn fetch(
    State(state): State<AppState>,
    client: ClientKey,
    Path(clip_id): Path<String>,
    body: Option<Json<FetchRequest>>,
) -> Result<Response, ApiError> {
    let clip_id = ClipId::from_str(&clip_id)?;
    let access_code = body.as_ref().and_then(|b| b.0.access_code.as_deref());

    let retrieved = state
        .clips
        .get_clip(&client.0, &clip_id, access_code, Some(ContentType::Text))
        .await?;

    let response = match retrieved.content {
        ClipContent::Inline(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::CACHE_CONTROL, "no-store")
            .body(Body::from(bytes)),
        ClipContent::Stream(file) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::CONTENT_LENGTH, retrieved.info.filesize)
            .header(header::CACHE_CONTROL, "no-store")
            .body(Body::from_stream(ReaderStream::new(file))),
    };
    response.map_err(|_| {
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            "internal error",
        )
    })
}
