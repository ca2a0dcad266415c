use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the domain services. The HTTP layer owns the mapping
/// to status codes; variants here carry kinds, not protocol details.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown retention {0:?}")]
    InvalidRetention(String),

    #[error("chunk {chunk_number} has wrong size: expected {expected}, got {got}")]
    InvalidChunkSize {
        chunk_number: u32,
        expected: u64,
        got: u64,
    },

    #[error("file size {got} exceeds the limit of {max} bytes")]
    FileTooLarge { got: u64, max: u64 },

    #[error("not found")]
    NotFound,

    #[error("upload session is {0}")]
    InvalidState(&'static str),

    #[error("upload incomplete: {uploaded} of {total} chunks received")]
    Incomplete { uploaded: i64, total: i64 },

    #[error("upload session expired")]
    SessionExpired,

    #[error("assembled size {got} does not match declared size {expected}")]
    SizeMismatch { expected: u64, got: u64 },

    #[error("gone")]
    Gone,

    #[error("access denied")]
    AccessDenied,

    #[error("rate limited")]
    RateLimited { retry_after: Duration },

    #[error("too many uploads in flight")]
    Busy,

    #[error("clip id space exhausted")]
    IdExhausted,

    #[error("storage error: {0}")]
    Storage(qopy_storage::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl From<qopy_storage::Error> for Error {
    fn from(e: qopy_storage::Error) -> Self {
        match e {
            // A wrong-size chunk body is a client error, not a storage fault.
            qopy_storage::Error::WrongChunkSize {
                chunk_number,
                expected,
                got,
            } => Error::InvalidChunkSize {
                chunk_number,
                expected,
                got,
            },
            e => Error::Storage(e),
        }
    }
}
