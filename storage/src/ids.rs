use data_encoding::HEXLOWER;
use rand::{CryptoRng, Rng};
use thiserror::Error;

pub const UPLOAD_ID_LEN: usize = 16;

/// Charset clip identifiers are drawn from.
pub const CLIP_ID_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IdError {
    #[error("invalid upload id: {0:?}")]
    InvalidUploadId(String),
    #[error("invalid clip id: {0:?}")]
    InvalidClipId(String),
}

/// Opaque identifier of an upload session: 16 random bytes, rendered as
/// 32 lowercase hex characters everywhere (URLs, database, directory names).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct UploadId([u8; UPLOAD_ID_LEN]);

impl UploadId {
    pub fn generate<R: Rng + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; UPLOAD_ID_LEN];
        rng.fill(&mut bytes);
        Self(bytes)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0[..]
    }
}

impl std::str::FromStr for UploadId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != UPLOAD_ID_LEN * 2 {
            return Err(IdError::InvalidUploadId(s.to_string()));
        }
        let decoded = HEXLOWER
            .decode(s.as_bytes())
            .map_err(|_| IdError::InvalidUploadId(s.to_string()))?;
        // HEXLOWER already rejects uppercase and non-hex bytes.
        let bytes: [u8; UPLOAD_ID_LEN] = decoded
            .try_into()
            .map_err(|_| IdError::InvalidUploadId(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", HEXLOWER.encode(&self.0))
    }
}

impl std::fmt::Debug for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

/// Shape of a clip identifier: 4-character quick-share ids are optimized for
/// human entry, 10-character enhanced ids for sharing as links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipIdKind {
    Quick,
    Enhanced,
}

impl ClipIdKind {
    pub fn id_len(&self) -> usize {
        match self {
            ClipIdKind::Quick => 4,
            ClipIdKind::Enhanced => 10,
        }
    }
}

/// Identifier of a published clip, 4 or 10 characters from [CLIP_ID_CHARSET].
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ClipId(String);

impl ClipId {
    pub fn generate<R: Rng + CryptoRng>(kind: ClipIdKind, rng: &mut R) -> Self {
        let id = (0..kind.id_len())
            .map(|_| CLIP_ID_CHARSET[rng.gen_range(0..CLIP_ID_CHARSET.len())] as char)
            .collect();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> ClipIdKind {
        match self.0.len() {
            4 => ClipIdKind::Quick,
            _ => ClipIdKind::Enhanced,
        }
    }

    /// First two characters, naming the shard directory of the blob layout.
    pub fn shard_prefix(&self) -> &str {
        &self.0[..2]
    }

    /// Whether the id is short enough to fall under brute-force defense.
    pub fn is_short(&self) -> bool {
        self.0.len() <= 6
    }
}

impl std::str::FromStr for ClipId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !matches!(s.len(), 4 | 10) {
            return Err(IdError::InvalidClipId(s.to_string()));
        }
        if !s.bytes().all(|b| CLIP_ID_CHARSET.contains(&b)) {
            return Err(IdError::InvalidClipId(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl std::fmt::Display for ClipId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for ClipId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}
