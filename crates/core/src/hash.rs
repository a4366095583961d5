//! Content-addressed hashing using SHA-256

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::SyncError;

/// A block digest: SHA-256 (256-bit) of the block's content
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockHash([u8; 32]);

impl BlockHash {
    /// Hash arbitrary bytes
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        Self(digest.into())
    }

    /// Construct from a raw 32-byte digest
    #[must_use]
    pub fn from_raw(raw: [u8; 32]) -> Self {
        Self(raw)
    }

    /// Parse a 64-character lower-case hex digest
    ///
    /// # Errors
    /// Returns an error if the string is not 64 hex characters.
    pub fn from_hex(s: &str) -> Result<Self, SyncError> {
        let bytes = hex::decode(s).map_err(|_| SyncError::Index {
            message: format!("invalid digest: {s:?}"),
        })?;
        let raw: [u8; 32] = bytes.try_into().map_err(|_| SyncError::Index {
            message: format!("digest has wrong length: {s:?}"),
        })?;
        Ok(Self(raw))
    }

    /// Digest of the empty byte sequence (the hash list of a zero-length file)
    #[must_use]
    pub fn of_empty() -> Self {
        Self::from_bytes(&[])
    }

    /// Get raw bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full lower-case hex form, as written to the index file
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "BlockHash({})", hex.get(..16).unwrap_or(&hex))
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "{}", hex.get(..16).unwrap_or(&hex))
    }
}
