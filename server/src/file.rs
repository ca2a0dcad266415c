use std::str::FromStr;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use axum::Json;
use tokio_util::io::ReaderStream;
use tracing::instrument;

use qopy_service::clips::ClipContent;
use qopy_service::metadata::ContentType;
use qopy_service::Error;
use qopy_storage::ClipId;

use crate::clip::FetchRequest;
use crate::{ApiError, AppState, ClientKey};

/// Downloads a file clip as an attachment. Requires the access code when
/// the clip demands one; text clips are a 404 here.
#[instrument(skip_all, fields(client=%client.0))]
pub(crate) async fn download(
    State(state): State<AppState>,
    client: ClientKey,
    Path(clip_id): Path<String>,
    body: Option<Json<FetchRequest>>,
) -> Result<Response, ApiError> {
    let clip_id = ClipId::from_str(&clip_id)?;
    let access_code = body.as_ref().and_then(|b| b.0.access_code.as_deref());

    let retrieved = state
        .clips
        .get_clip(&client.0, &clip_id, access_code, Some(ContentType::File))
        .await?;

    let file = match retrieved.content {
        ClipContent::Stream(file) => file,
        // File clips always stream.
        ClipContent::Inline(_) => return Err(Error::NotFound.into()),
    };

    let filename = retrieved
        .info
        .filename
        .as_deref()
        .unwrap_or("download")
        .replace(['"', '\\'], "_");
    let mime = retrieved
        .info
        .mime_type
        .as_deref()
        .unwrap_or("application/octet-stream")
        .to_string();

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, mime)
        .header(header::CONTENT_LENGTH, retrieved.info.filesize)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        )
        .header(header::CACHE_CONTROL, "no-store")
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|_| {
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                "internal error",
            )
        })
}

/// The unauthenticated download path of early clients. Permanently gone.
pub(crate) async fn legacy_download() -> ApiError {
    ApiError::new(
        StatusCode::GONE,
        "gone",
        "unauthenticated file downloads are no longer served",
    )
    .with_hint("POST to this path instead")
}
