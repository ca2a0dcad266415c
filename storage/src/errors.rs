use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by the filesystem-backed stores.
#[derive(Debug, Error)]
pub enum Error {
    /// A derived path resolved outside the configured store root after
    /// normalization and symlink resolution. Always fatal.
    #[error("path escapes store root: {0:?}")]
    PathEscape(PathBuf),

    /// A chunk body did not match the length the session prescribes for it.
    #[error("chunk {chunk_number} has wrong size: expected {expected}, got {got}")]
    WrongChunkSize {
        chunk_number: u32,
        expected: u64,
        got: u64,
    },

    /// A chunk file recorded for the session is not present on disk.
    #[error("missing chunk {chunk_number}")]
    MissingChunk { chunk_number: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
