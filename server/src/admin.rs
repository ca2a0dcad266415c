use std::str::FromStr;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::Json;
use serde::Serialize;
use tracing::instrument;

use qopy_service::guard::{constant_time_eq, Bucket};
use qopy_service::metadata::StatisticsRow;
use qopy_storage::ClipId;

use crate::{ApiError, AppState, ClientKey};

/// Verifies the bearer token. With no token configured the admin surface is
/// disabled entirely.
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let expected = state
        .config
        .admin_token
        .as_deref()
        .ok_or_else(ApiError::forbidden)?;
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(ApiError::forbidden)?;
    if !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
        return Err(ApiError::forbidden());
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub(crate) struct StatsResponse {
    statistics: StatisticsRow,
    daily_uploads: Vec<(String, i64)>,
}

#[instrument(skip_all, fields(client=%client.0))]
pub(crate) async fn stats(
    State(state): State<AppState>,
    client: ClientKey,
    headers: HeaderMap,
) -> Result<Json<StatsResponse>, ApiError> {
    state.guard.check_rate(Bucket::Admin, &client.0)?;
    authorize(&state, &headers)?;

    let statistics = state.metadata.statistics().await?;
    let daily_uploads = state.metadata.daily_uploads(30).await?;
    Ok(Json(StatsResponse {
        statistics,
        daily_uploads,
    }))
}

#[instrument(skip_all, fields(client=%client.0))]
pub(crate) async fn delete_clip(
    State(state): State<AppState>,
    client: ClientKey,
    headers: HeaderMap,
    Path(clip_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.guard.check_rate(Bucket::Admin, &client.0)?;
    authorize(&state, &headers)?;

    let clip_id = ClipId::from_str(&clip_id)?;
    state.clips.delete_clip(&clip_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
