//! Path helpers shared by both stores.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use path_clean::PathClean;

use crate::Error;

/// An entry found while walking a store root that may be an orphan: the name
/// it was stored under, its full path and its last modification time.
/// Whether it actually is an orphan is decided by the caller against the
/// metadata store.
#[derive(Debug)]
pub struct OrphanEntry {
    pub name: String,
    pub path: PathBuf,
    pub modified: SystemTime,
}

/// Lexically normalizes `path` and verifies it still lives under `root`.
///
/// `root` must already be canonicalized. Identifiers are validated before
/// they are ever joined, so a failure here means a programming error or a
/// hostile path and is always fatal.
pub(crate) fn ensure_under_root(root: &Path, path: PathBuf) -> Result<PathBuf, Error> {
    let cleaned = path.clean();
    if !cleaned.starts_with(root) {
        return Err(Error::PathEscape(cleaned));
    }
    Ok(cleaned)
}

/// Canonicalizes an existing directory and verifies it resolved under `root`,
/// catching symlinked components that lexical cleaning cannot see.
pub(crate) async fn canonicalize_under_root(root: &Path, dir: &Path) -> Result<PathBuf, Error> {
    let resolved = tokio::fs::canonicalize(dir).await?;
    if !resolved.starts_with(root) {
        return Err(Error::PathEscape(resolved));
    }
    Ok(resolved)
}

/// Creates `dir` (and parents) with permissions restricted to the owner.
pub(crate) async fn create_dir_restricted(dir: &Path) -> io::Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);
    builder.create(dir).await
}

/// Fsyncs a directory so a rename or unlink inside it is durable.
pub(crate) async fn sync_dir(dir: &Path) -> io::Result<()> {
    let f = tokio::fs::File::open(dir).await?;
    f.sync_all().await
}

pub(crate) fn tempfile_error(e: async_tempfile::Error) -> Error {
    match e {
        async_tempfile::Error::Io(io_error) => Error::Io(io_error),
        async_tempfile::Error::InvalidFile => Error::Io(io::Error::new(
            io::ErrorKind::NotFound,
            "invalid or missing file specified",
        )),
        async_tempfile::Error::InvalidDirectory => Error::Io(io::Error::new(
            io::ErrorKind::NotFound,
            "invalid or missing directory specified",
        )),
    }
}
