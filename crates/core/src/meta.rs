//! File metadata records: name, version, ordered block hash list
//!
//! A deletion is an update like any other: the record stays in the metadata
//! store forever, its hash list replaced by a tombstone.

use serde::{Deserialize, Serialize};

use crate::hash::BlockHash;

/// The literal written in the index file's hash column for a deleted file
pub const TOMBSTONE_MARK: &str = "0";

/// Ordered block digests of a file, or a tombstone for a deleted one.
///
/// The `Blocks` vec is never empty: a zero-length file is represented by a
/// single entry equal to the digest of an empty block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashList {
    /// File deleted; serialized as the single literal `0`
    Tombstone,
    /// Ordered digests; concatenating the named blocks reproduces the file
    Blocks(Vec<BlockHash>),
}

impl HashList {
    /// Build from computed digests. Callers must never pass an empty vec;
    /// an empty file is one empty-block digest.
    #[must_use]
    pub fn from_blocks(hashes: Vec<BlockHash>) -> Self {
        debug_assert!(!hashes.is_empty(), "hash list must never be empty");
        Self::Blocks(hashes)
    }

    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Self::Tombstone)
    }

    /// The digests, or `None` for a tombstone
    #[must_use]
    pub fn blocks(&self) -> Option<&[BlockHash]> {
        match self {
            Self::Tombstone => None,
            Self::Blocks(hashes) => Some(hashes),
        }
    }
}

/// A file's current known state: unique name, version, hash list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Plain relative file name (no path separators)
    pub file_name: String,
    /// Starts at 1 on first accepted creation, +1 per accepted update
    pub version: u64,
    pub hash_list: HashList,
}

impl FileMeta {
    #[must_use]
    pub fn new(file_name: impl Into<String>, version: u64, hash_list: HashList) -> Self {
        Self {
            file_name: file_name.into(),
            version,
            hash_list,
        }
    }

    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.hash_list.is_tombstone()
    }
}

/// True for names the service will synchronize: non-empty plain relative
/// names with no separators, no leading dot, and never the index file.
/// Commas are reserved by the index line format.
#[must_use]
pub fn is_sync_name(name: &str) -> bool {
    !name.is_empty()
        && name != crate::index::INDEX_FILE
        && !name.starts_with('.')
        && !name.contains(['/', '\\', ','])
}

/// Result of proposing an update to the coordinator.
///
/// A rejection is not an error: it carries the authoritative current record
/// so the proposer can adopt the winning state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The proposal won; the record is now at this version
    Accepted { version: u64 },
    /// The expected version was stale; here is the record that won
    Rejected { current: FileMeta },
}
