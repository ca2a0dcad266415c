use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

/// The error envelope every failing endpoint returns. Internals are
/// sanitized before they get here: storage and database failures surface as
/// an opaque 500.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: &'static str,
    message: String,
    hint: Option<&'static str>,
    retry_after: Option<u64>,
}

impl ApiError {
    pub fn new(status: StatusCode, error: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            error,
            message: message.into(),
            hint: None,
            retry_after: None,
        }
    }

    pub fn with_hint(mut self, hint: &'static str) -> Self {
        self.hint = Some(hint);
        self
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", "no such clip or session")
    }

    pub fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", "admin token required")
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<qopy_service::Error> for ApiError {
    fn from(e: qopy_service::Error) -> Self {
        use qopy_service::Error;
        match e {
            Error::InvalidRequest(msg) => {
                Self::new(StatusCode::BAD_REQUEST, "invalid_request", msg)
            }
            Error::InvalidRetention(token) => Self::new(
                StatusCode::BAD_REQUEST,
                "invalid_retention",
                format!("unknown retention {token:?}"),
            )
            .with_hint("valid retentions: 5min, 15min, 30min, 1hr, 6hr, 24hr"),
            Error::InvalidChunkSize { .. } => {
                Self::new(StatusCode::BAD_REQUEST, "invalid_chunk_size", e.to_string())
            }
            Error::FileTooLarge { .. } => Self::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                "file_too_large",
                e.to_string(),
            ),
            Error::NotFound => Self::not_found(),
            Error::InvalidState(state) => Self::new(
                StatusCode::CONFLICT,
                "invalid_state",
                format!("upload session is {state}"),
            ),
            Error::Incomplete { .. } => {
                Self::new(StatusCode::CONFLICT, "upload_incomplete", e.to_string())
            }
            Error::SessionExpired => Self::new(
                StatusCode::GONE,
                "session_expired",
                "upload session expired",
            ),
            Error::SizeMismatch { .. } => Self::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "size_mismatch",
                e.to_string(),
            )
            .with_hint("re-upload the offending chunk and retry completion"),
            Error::Gone => Self::new(StatusCode::GONE, "gone", "content no longer available"),
            Error::AccessDenied => {
                Self::new(StatusCode::UNAUTHORIZED, "access_denied", "access denied")
            }
            Error::RateLimited { retry_after } => Self {
                status: StatusCode::TOO_MANY_REQUESTS,
                error: "rate_limited",
                message: "too many requests".to_string(),
                hint: None,
                retry_after: Some(retry_after.as_secs().max(1)),
            },
            Error::Busy => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "busy",
                "too many uploads in flight",
            ),
            Error::IdExhausted => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "id_exhausted",
                "could not allocate a clip id",
            ),
            Error::Storage(_) | Error::Database(_) | Error::Migrate(_) => {
                error!(err=%e, "internal error");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "internal error",
                )
            }
        }
    }
}

impl From<qopy_storage::IdError> for ApiError {
    fn from(e: qopy_storage::IdError) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_id", e.to_string())
    }
}

#[derive(serde::Serialize)]
struct Envelope<'a> {
    error: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<&'a str>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(Envelope {
            error: self.error,
            message: &self.message,
            hint: self.hint,
        });
        let mut response = (self.status, body).into_response();
        if let Some(secs) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
