//! In-process coordinator for testing
//!
//! Implements the [`Coordinator`] surface directly against shared store
//! handles, without a network. Several clients holding clones of the same
//! handles behave like several connections to one server.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;

use blocksync_core::error::SyncError;
use blocksync_core::hash::BlockHash;
use blocksync_core::meta::{FileMeta, HashList, UpdateOutcome};
use blocksync_core::store::{BlockStore, MetaStore};
use blocksync_core::Coordinator;

/// Coordinator over in-process stores (no network)
#[derive(Clone)]
pub struct LocalCoordinator {
    blocks: Arc<BlockStore>,
    meta: Arc<MetaStore>,
}

impl LocalCoordinator {
    /// Open (or create) the stores under `data_dir`.
    ///
    /// # Errors
    /// Returns an error if either store cannot be opened.
    pub fn open(data_dir: &Path) -> Result<Self, SyncError> {
        Ok(Self {
            blocks: Arc::new(BlockStore::open(&data_dir.join("blocks"))?),
            meta: Arc::new(MetaStore::open(&data_dir.join("meta"))?),
        })
    }

    /// Wrap already-open store handles
    #[must_use]
    pub fn new(blocks: Arc<BlockStore>, meta: Arc<MetaStore>) -> Self {
        Self { blocks, meta }
    }
}

impl Coordinator for LocalCoordinator {
    fn file_info_map(&mut self) -> Result<HashMap<String, FileMeta>, SyncError> {
        Ok(self
            .meta
            .list()?
            .into_iter()
            .map(|record| (record.file_name.clone(), record))
            .collect())
    }

    fn update_file(
        &mut self,
        file_name: &str,
        expected_version: u64,
        hash_list: &HashList,
    ) -> Result<UpdateOutcome, SyncError> {
        // Same precondition the server enforces: all named blocks first
        if let Some(hashes) = hash_list.blocks() {
            for hash in hashes {
                if !self.blocks.has(hash)? {
                    return Err(SyncError::not_found(format!(
                        "block {hash} named by {file_name}"
                    )));
                }
            }
        }
        self.meta.propose(file_name, expected_version, hash_list)
    }

    fn get_block(&mut self, hash: &BlockHash) -> Result<Bytes, SyncError> {
        self.blocks.get(hash)
    }

    fn put_block(&mut self, data: &[u8]) -> Result<BlockHash, SyncError> {
        self.blocks.put(data)
    }

    fn has_blocks(&mut self, hashes: &[BlockHash]) -> Result<HashSet<BlockHash>, SyncError> {
        Ok(self.blocks.present(hashes)?.into_iter().collect())
    }
}
