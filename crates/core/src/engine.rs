//! Client sync engine: one reconciliation pass per invocation
//!
//! The engine diffs the local directory against the local index, uploads
//! local changes under optimistic concurrency, and downloads server-side
//! changes it is missing. A pass carries no state across invocations other
//! than the index file, and a failure while handling one file never
//! disturbs the handling of the others.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::chunker;
use crate::error::SyncError;
use crate::hash::BlockHash;
use crate::index::LocalIndex;
use crate::meta::{FileMeta, HashList, UpdateOutcome};
use crate::scan::Scanner;

/// The client-facing RPC surface of the coordinator.
///
/// Implemented over TCP by `blocksync-transport` and in-process for tests.
pub trait Coordinator {
    /// Fetch the full file-name -> record map.
    ///
    /// # Errors
    /// Returns an error if the RPC fails.
    fn file_info_map(&mut self) -> Result<HashMap<String, FileMeta>, SyncError>;

    /// Propose an update; a stale expected version yields
    /// `UpdateOutcome::Rejected`, not an error.
    ///
    /// # Errors
    /// Returns an error if the RPC fails or the proposal is malformed.
    fn update_file(
        &mut self,
        file_name: &str,
        expected_version: u64,
        hash_list: &HashList,
    ) -> Result<UpdateOutcome, SyncError>;

    /// Fetch a block by digest.
    ///
    /// # Errors
    /// Returns `NotFound` if the digest is unknown to the server.
    fn get_block(&mut self, hash: &BlockHash) -> Result<Bytes, SyncError>;

    /// Store a block; the server returns the digest it computed.
    ///
    /// # Errors
    /// Returns an error if the RPC fails.
    fn put_block(&mut self, data: &[u8]) -> Result<BlockHash, SyncError>;

    /// Ask which of the given digests the server already holds.
    ///
    /// # Errors
    /// Returns an error if the RPC fails.
    fn has_blocks(&mut self, hashes: &[BlockHash]) -> Result<HashSet<BlockHash>, SyncError>;
}

/// What one pass did, per file
#[derive(Debug, Default)]
pub struct PassSummary {
    /// Files whose local change was accepted by the server
    pub uploaded: usize,
    /// Files rewritten from server content (including lost conflicts)
    pub downloaded: usize,
    /// Local files removed because the server record is a tombstone
    pub removed: usize,
    /// Files already consistent
    pub unchanged: usize,
    /// Files whose handling failed this pass; their local content and index
    /// entries are exactly as they were before
    pub failed: Vec<(String, SyncError)>,
}

impl PassSummary {
    /// True if every file was handled without error
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// How a file was reconciled on the download path
enum Adoption {
    Wrote,
    Removed,
}

/// Reconciles one local directory against the coordinator
pub struct SyncEngine<'a, C: Coordinator> {
    coordinator: &'a mut C,
    base_dir: PathBuf,
    block_size: u32,
}

impl<'a, C: Coordinator> SyncEngine<'a, C> {
    #[must_use]
    pub fn new(coordinator: &'a mut C, base_dir: impl Into<PathBuf>, block_size: u32) -> Self {
        Self {
            coordinator,
            base_dir: base_dir.into(),
            block_size,
        }
    }

    /// Run exactly one reconciliation pass.
    ///
    /// Uploads are attempted before downloads are applied, so a pending
    /// local edit is never clobbered by a download decision computed before
    /// its upload outcome is known. The index file is rewritten once, at the
    /// end of the pass.
    ///
    /// # Errors
    /// Returns an error if the index cannot be loaded or saved, the local
    /// directory cannot be scanned, or the initial metadata fetch fails.
    /// Per-file failures do not abort the pass; they are reported in the
    /// summary.
    pub fn run(&mut self) -> Result<PassSummary, SyncError> {
        let mut index = LocalIndex::load(&self.base_dir)?;

        let local: HashMap<String, Vec<BlockHash>> = Scanner::new(&self.base_dir, self.block_size)
            .scan()?
            .into_iter()
            .map(|file| (file.name, file.hash_list))
            .collect();

        let server = self.coordinator.file_info_map()?;

        let mut names: BTreeSet<String> = local.keys().cloned().collect();
        names.extend(index.file_names().cloned());
        names.extend(server.keys().cloned());

        let mut summary = PassSummary::default();
        let mut pending_downloads = Vec::new();

        for name in &names {
            if locally_changed(local.get(name), index.get(name)) {
                let result = self.upload(name, local.get(name), &mut index, &mut summary);
                if let Err(err) = result {
                    warn!("failed to sync {name}: {err}");
                    summary.failed.push((name.clone(), err));
                }
            } else if let Some(record) = server.get(name) {
                if record.version > index.version_of(name) {
                    pending_downloads.push(record);
                } else {
                    summary.unchanged += 1;
                }
            } else {
                summary.unchanged += 1;
            }
        }

        for record in pending_downloads {
            match self.adopt(record, &mut index) {
                Ok(Adoption::Wrote) => summary.downloaded += 1,
                Ok(Adoption::Removed) => summary.removed += 1,
                Err(err) => {
                    warn!("failed to sync {}: {err}", record.file_name);
                    summary.failed.push((record.file_name.clone(), err));
                }
            }
        }

        index.save(&self.base_dir)?;
        Ok(summary)
    }

    /// Upload path: push blocks the server is missing, then propose the new
    /// record. A rejection means another client won the version race; the
    /// authoritative record is adopted in place of the local edit.
    fn upload(
        &mut self,
        name: &str,
        local_hashes: Option<&Vec<BlockHash>>,
        index: &mut LocalIndex,
        summary: &mut PassSummary,
    ) -> Result<(), SyncError> {
        let expected = index.version_of(name);

        let hash_list = match local_hashes {
            None => {
                debug!("{name}: proposing tombstone over version {expected}");
                HashList::Tombstone
            }
            Some(_) => {
                let path = self.base_dir.join(name);
                let data = std::fs::read(&path)
                    .map_err(|err| SyncError::local_io(path.display().to_string(), err))?;
                let blocks = chunker::chunk_bytes(&data, self.block_size);
                debug!(
                    "{name}: proposing {} block(s) over version {expected}",
                    blocks.len()
                );

                let hashes: Vec<BlockHash> = blocks.iter().map(|b| b.hash).collect();
                self.push_missing_blocks(&blocks)?;
                HashList::from_blocks(hashes)
            }
        };

        match self
            .coordinator
            .update_file(name, expected, &hash_list)?
        {
            UpdateOutcome::Accepted { version } => {
                index.upsert(FileMeta::new(name, version, hash_list));
                if local_hashes.is_none() {
                    summary.removed += 1;
                } else {
                    summary.uploaded += 1;
                }
                Ok(())
            }
            UpdateOutcome::Rejected { current } => {
                debug!(
                    "{name}: proposal over version {expected} lost to version {}",
                    current.version
                );
                match self.adopt(&current, index)? {
                    Adoption::Wrote => summary.downloaded += 1,
                    Adoption::Removed => summary.removed += 1,
                }
                Ok(())
            }
        }
    }

    /// Upload every block of the file that the server does not already hold.
    /// Each stored digest is checked against the one computed locally.
    fn push_missing_blocks(&mut self, blocks: &[chunker::Block]) -> Result<(), SyncError> {
        let unique: Vec<BlockHash> = {
            let mut seen = HashSet::new();
            blocks
                .iter()
                .map(|b| b.hash)
                .filter(|hash| seen.insert(*hash))
                .collect()
        };

        let present = self.coordinator.has_blocks(&unique)?;

        let mut pushed = HashSet::new();
        for block in blocks {
            if present.contains(&block.hash) || !pushed.insert(block.hash) {
                continue;
            }
            let stored = self.coordinator.put_block(&block.data)?;
            if stored != block.hash {
                return Err(SyncError::HashMismatch {
                    expected: block.hash.to_hex(),
                    actual: stored.to_hex(),
                });
            }
        }
        Ok(())
    }

    /// Download path: make the local file and index entry match a server
    /// record. Blocks still reconstructible from the current local content
    /// are reused instead of fetched.
    fn adopt(&mut self, record: &FileMeta, index: &mut LocalIndex) -> Result<Adoption, SyncError> {
        // Server-fed names never escape the base directory
        if !crate::meta::is_sync_name(&record.file_name) {
            return Err(SyncError::Protocol {
                message: format!("refusing server record name {:?}", record.file_name),
            });
        }
        let path = self.base_dir.join(&record.file_name);

        let adoption = match record.hash_list.blocks() {
            None => {
                remove_if_present(&path)?;
                Adoption::Removed
            }
            Some(hashes) => {
                let held = local_blocks(&path, self.block_size);

                let mut content = Vec::new();
                for hash in hashes {
                    let data = match held.get(hash) {
                        Some(data) => data.clone(),
                        None => {
                            let data = self.coordinator.get_block(hash)?;
                            let actual = BlockHash::from_bytes(&data);
                            if actual != *hash {
                                return Err(SyncError::HashMismatch {
                                    expected: hash.to_hex(),
                                    actual: actual.to_hex(),
                                });
                            }
                            data
                        }
                    };
                    content.extend_from_slice(&data);
                }

                std::fs::write(&path, &content)
                    .map_err(|err| SyncError::local_io(path.display().to_string(), err))?;
                Adoption::Wrote
            }
        };

        index.upsert(record.clone());
        Ok(adoption)
    }
}

/// A file is locally changed when its computed hash list differs from what
/// the index last recorded (creation, modification, recreation over a
/// tombstone, or deletion).
fn locally_changed(local: Option<&Vec<BlockHash>>, recorded: Option<&FileMeta>) -> bool {
    match (local, recorded) {
        (Some(_), None) => true,
        (Some(hashes), Some(record)) => match record.hash_list.blocks() {
            Some(recorded) => recorded != &hashes[..],
            None => true,
        },
        (None, Some(record)) => !record.is_tombstone(),
        (None, None) => false,
    }
}

/// Digest -> bytes for every block of the file currently on disk, so the
/// download path can skip fetching blocks it already holds.
fn local_blocks(path: &Path, block_size: u32) -> HashMap<BlockHash, Bytes> {
    let Ok(data) = std::fs::read(path) else {
        return HashMap::new();
    };
    chunker::chunk_bytes(&data, block_size)
        .into_iter()
        .map(|block| (block.hash, block.data))
        .collect()
}

fn remove_if_present(path: &Path) -> Result<(), SyncError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(SyncError::local_io(path.display().to_string(), err)),
    }
}
