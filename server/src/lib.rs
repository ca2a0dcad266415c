//! The HTTP surface of the qopy server: request parsing, validation and
//! response shaping. This crate is the only component touching protocol
//! bytes; all semantics live in `qopy-service`.

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;

use qopy_service::clips::ClipService;
use qopy_service::guard::AccessGuard;
use qopy_service::metadata::MetadataStore;
use qopy_service::session::{UploadSessionManager, MAX_CHUNK_SIZE};

mod admin;
mod clip;
mod error;
mod extract;
mod file;
mod headers;
mod upload;


pub use error::ApiError;
pub use extract::ClientKey;
pub use headers::security_headers;

/// Body cap for the JSON control endpoints.
const JSON_BODY_LIMIT: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<UploadSessionManager>,
    pub clips: Arc<ClipService>,
    pub guard: Arc<AccessGuard>,
    pub metadata: Arc<MetadataStore>,
    pub config: Arc<ServerConfig>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Public base for the clip URLs returned on completion.
    pub base_url: String,
    /// Bearer token guarding the admin endpoints; unset disables them.
    pub admin_token: Option<String>,
    /// Whether to emit HSTS headers (behind a TLS-terminating proxy).
    pub hsts: bool,
}

pub fn gen_router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/upload/init",
            post(upload::init).layer(DefaultBodyLimit::max(JSON_BODY_LIMIT)),
        )
        .route(
            "/api/upload/:upload_id/chunk/:chunk_number",
            // The chunk body is streamed and capped against the session's
            // chunk size; the default extractor limit does not apply.
            post(upload::chunk).layer(DefaultBodyLimit::max(MAX_CHUNK_SIZE as usize + 1024)),
        )
        .route("/api/upload/:upload_id/complete", post(upload::complete))
        .route("/api/upload/:upload_id", delete(upload::abort))
        .route("/api/clip/:clip_id/info", get(clip::info))
        .route(
            "/api/clip/:clip_id",
            post(clip::fetch).layer(DefaultBodyLimit::max(JSON_BODY_LIMIT)),
        )
        .route("/api/file/:clip_id/info", get(clip::info))
        .route(
            "/api/file/:clip_id",
            post(file::download)
                .get(file::legacy_download)
                .layer(DefaultBodyLimit::max(JSON_BODY_LIMIT)),
        )
        .route("/api/admin/stats", get(admin::stats))
        .route("/api/admin/clip/:clip_id", delete(admin::delete_clip))
}
