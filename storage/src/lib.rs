//! Filesystem-backed storage for the qopy server.
//!
//! Two stores share a configured storage root: the [ChunkStore] keeps
//! per-upload chunk files until a session is assembled, and the [BlobStore]
//! holds the assembled ciphertext blobs that back published clips. Both
//! stores only ever join validated identifier types ([UploadId], [ClipId])
//! onto their roots and re-verify every derived path against the root.

mod blob_store;
mod chunk_store;
mod errors;
mod ids;
mod paths;

pub use blob_store::{BlobStore, StagedBlob};
pub use chunk_store::ChunkStore;
pub use errors::Error;
pub use ids::{ClipId, ClipIdKind, IdError, UploadId};
pub use paths::OrphanEntry;
