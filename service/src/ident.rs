use std::sync::Arc;
use std::time::Duration;

use rand::rngs::OsRng;
use tracing::{debug, instrument};

use qopy_storage::{ClipId, ClipIdKind};

use crate::metadata::{MetadataStore, NewClip};
use crate::Error;

const MAX_ATTEMPTS: u32 = 8;
const BACKOFF_BASE: Duration = Duration::from_millis(10);

/// Allocates clip identifiers.
///
/// Candidates are drawn from a cryptographically secure RNG and reserved via
/// a conditional insert into the clips table. The 4-character quick space is
/// small enough that collisions are expected and must be probed, not assumed
/// away: unique-constraint violations retry with exponential backoff, up to
/// [MAX_ATTEMPTS].
pub struct IdentifierAllocator {
    metadata: Arc<MetadataStore>,
}

impl IdentifierAllocator {
    pub fn new(metadata: Arc<MetadataStore>) -> Self {
        Self { metadata }
    }

    /// Reserves a fresh clip id of the given kind, inserting `clip` as the
    /// (unpublished) row. The reservation must be published or discarded by
    /// the caller.
    #[instrument(skip(self, clip), err)]
    pub async fn allocate(&self, kind: ClipIdKind, clip: &NewClip) -> Result<ClipId, Error> {
        for attempt in 0..MAX_ATTEMPTS {
            let candidate = ClipId::generate(kind, &mut OsRng);
            if self.metadata.reserve_clip(&candidate, clip).await? {
                return Ok(candidate);
            }
            debug!(attempt, "clip id collision, retrying");
            tokio::time::sleep(BACKOFF_BASE * 2u32.saturating_pow(attempt)).await;
        }
        Err(Error::IdExhausted)
    }
}
