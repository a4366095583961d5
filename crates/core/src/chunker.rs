//! Fixed-size block chunking
//!
//! Every participant chunks at the same block size, so identical content
//! always yields the identical ordered hash list. A file of size S produces
//! ceil(S / B) blocks, all of size B except possibly the last; an empty file
//! still produces exactly one (empty) block.

use bytes::Bytes;

use crate::hash::BlockHash;

/// A single content-addressed block cut from a file
#[derive(Debug, Clone)]
pub struct Block {
    /// SHA-256 of the block content
    pub hash: BlockHash,
    /// Raw block bytes, at most the chunking block size
    pub data: Bytes,
}

/// Split data into fixed-size blocks.
///
/// The returned vec is never empty: zero-length input yields one empty block.
#[must_use]
pub fn chunk_bytes(data: &[u8], block_size: u32) -> Vec<Block> {
    assert!(block_size > 0, "block size must be positive");

    if data.is_empty() {
        return vec![Block {
            hash: BlockHash::of_empty(),
            data: Bytes::new(),
        }];
    }

    data.chunks(block_size as usize)
        .map(|piece| Block {
            hash: BlockHash::from_bytes(piece),
            data: Bytes::copy_from_slice(piece),
        })
        .collect()
}

/// Compute just the ordered hash list for data at the given block size.
#[must_use]
pub fn hash_list(data: &[u8], block_size: u32) -> Vec<BlockHash> {
    if data.is_empty() {
        return vec![BlockHash::of_empty()];
    }

    data.chunks(block_size as usize)
        .map(BlockHash::from_bytes)
        .collect()
}
