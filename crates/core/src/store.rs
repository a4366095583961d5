//! Server-side durable stores: content-addressed blocks and file metadata
//!
//! Both stores use LMDB (via heed). The block store maps digest -> raw
//! bytes and never stores the same content twice. The metadata store maps
//! file name -> rkyv-encoded record and is the single source of truth for
//! versions: all mutation goes through [`MetaStore::propose`], a
//! compare-and-swap on the record's version. LMDB's single-writer
//! transaction serializes concurrent proposals, so exactly one proposal
//! with a given expected version can ever succeed for a file name.

use std::path::Path;

use bytes::Bytes;
use heed::types::{Bytes as HeedBytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use rkyv::rancor::Error as RkyvError;
use rkyv::{Archive, Deserialize, Serialize};

use crate::error::SyncError;
use crate::hash::BlockHash;
use crate::meta::{FileMeta, HashList, UpdateOutcome};

/// Content-addressed block store.
///
/// Key: SHA-256 digest (32 bytes)
/// Value: raw block bytes
pub struct BlockStore {
    env: Env,
    blocks: Database<HeedBytes, HeedBytes>,
}

impl BlockStore {
    /// Open or create a block store at the given path.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or created.
    pub fn open(path: &Path) -> Result<Self, SyncError> {
        std::fs::create_dir_all(path)
            .map_err(|err| SyncError::local_io(path.display().to_string(), err))?;

        // SAFETY: Standard LMDB memory-mapped I/O
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(4 * 1024 * 1024 * 1024) // 4GB max
                .max_dbs(1)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let blocks: Database<HeedBytes, HeedBytes> = env
            .database_options()
            .types::<HeedBytes, HeedBytes>()
            .name("blocks")
            .create(&mut wtxn)?;
        wtxn.commit()?;

        Ok(Self { env, blocks })
    }

    /// Store a block, returning its digest. Idempotent: storing content that
    /// is already present is a no-op that still returns the correct digest.
    ///
    /// # Errors
    /// Returns an error if the write transaction fails.
    pub fn put(&self, data: &[u8]) -> Result<BlockHash, SyncError> {
        let hash = BlockHash::from_bytes(data);

        let mut wtxn = self.env.write_txn()?;
        if self.blocks.get(&wtxn, hash.as_bytes())?.is_none() {
            self.blocks.put(&mut wtxn, hash.as_bytes(), data)?;
            wtxn.commit()?;
        }
        Ok(hash)
    }

    /// Get a block by digest.
    ///
    /// # Errors
    /// Returns `NotFound` if the digest is unknown.
    pub fn get(&self, hash: &BlockHash) -> Result<Bytes, SyncError> {
        let rtxn = self.env.read_txn()?;
        let data = self
            .blocks
            .get(&rtxn, hash.as_bytes())?
            .ok_or_else(|| SyncError::not_found(format!("block {hash}")))?;
        Ok(Bytes::copy_from_slice(data))
    }

    /// Check whether a single digest is present.
    ///
    /// # Errors
    /// Returns an error if the read transaction fails.
    pub fn has(&self, hash: &BlockHash) -> Result<bool, SyncError> {
        let rtxn = self.env.read_txn()?;
        Ok(self.blocks.get(&rtxn, hash.as_bytes())?.is_some())
    }

    /// Return the subset of the given digests that are already present.
    ///
    /// # Errors
    /// Returns an error if the read transaction fails.
    pub fn present(&self, hashes: &[BlockHash]) -> Result<Vec<BlockHash>, SyncError> {
        let rtxn = self.env.read_txn()?;

        let mut present = Vec::new();
        for hash in hashes {
            if self.blocks.get(&rtxn, hash.as_bytes())?.is_some() {
                present.push(*hash);
            }
        }
        Ok(present)
    }

    /// Count of unique blocks and total stored bytes.
    ///
    /// # Errors
    /// Returns an error if iteration fails.
    pub fn stats(&self) -> Result<StoreStats, SyncError> {
        let rtxn = self.env.read_txn()?;
        let mut count = 0u64;
        let mut total_bytes = 0u64;

        for entry in self.blocks.iter(&rtxn)? {
            let (_, data) = entry?;
            count += 1;
            total_bytes += data.len() as u64;
        }

        Ok(StoreStats { count, total_bytes })
    }
}

/// Statistics about the block store
#[derive(Debug, Clone, Copy)]
pub struct StoreStats {
    /// Number of unique blocks stored
    pub count: u64,
    /// Total bytes stored
    pub total_bytes: u64,
}

/// On-disk encoding of a metadata record (rkyv, keyed by file name)
#[derive(Archive, Serialize, Deserialize, Debug)]
#[rkyv(derive(Debug))]
struct StoredMeta {
    version: u64,
    tombstone: bool,
    hashes: Vec<[u8; 32]>,
}

impl StoredMeta {
    fn from_record(version: u64, hash_list: &HashList) -> Self {
        match hash_list.blocks() {
            None => Self {
                version,
                tombstone: true,
                hashes: Vec::new(),
            },
            Some(hashes) => Self {
                version,
                tombstone: false,
                hashes: hashes.iter().map(|h| *h.as_bytes()).collect(),
            },
        }
    }

    fn into_record(self, file_name: &str) -> FileMeta {
        let hash_list = if self.tombstone {
            HashList::Tombstone
        } else {
            HashList::from_blocks(self.hashes.into_iter().map(BlockHash::from_raw).collect())
        };
        FileMeta::new(file_name, self.version, hash_list)
    }
}

fn decode_stored(bytes: &[u8]) -> Result<StoredMeta, SyncError> {
    // Copy out of the memory map into an aligned buffer before access
    let mut aligned = rkyv::util::AlignedVec::<16>::new();
    aligned.extend_from_slice(bytes);

    let archived =
        rkyv::access::<ArchivedStoredMeta, RkyvError>(&aligned).map_err(|err| SyncError::Store {
            message: format!("failed to access stored record: {err}"),
        })?;
    rkyv::deserialize::<StoredMeta, RkyvError>(archived).map_err(|err| SyncError::Store {
        message: format!("failed to decode stored record: {err}"),
    })
}

fn encode_stored(stored: &StoredMeta) -> Result<Vec<u8>, SyncError> {
    let bytes = rkyv::to_bytes::<RkyvError>(stored).map_err(|err| SyncError::Store {
        message: format!("failed to encode record: {err}"),
    })?;
    Ok(bytes.to_vec())
}

/// Authoritative mapping from file name to its latest metadata record.
///
/// Records are created on first accepted upload and never deleted; a
/// deletion is an accepted update to a tombstone.
pub struct MetaStore {
    env: Env,
    records: Database<Str, HeedBytes>,
}

impl MetaStore {
    /// Open or create a metadata store at the given path.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or created.
    pub fn open(path: &Path) -> Result<Self, SyncError> {
        std::fs::create_dir_all(path)
            .map_err(|err| SyncError::local_io(path.display().to_string(), err))?;

        // SAFETY: Standard LMDB memory-mapped I/O
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(256 * 1024 * 1024) // 256MB max
                .max_dbs(1)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let records: Database<Str, HeedBytes> = env
            .database_options()
            .types::<Str, HeedBytes>()
            .name("records")
            .create(&mut wtxn)?;
        wtxn.commit()?;

        Ok(Self { env, records })
    }

    /// Get the current record for a file name.
    ///
    /// # Errors
    /// Returns an error if the read transaction or decoding fails.
    pub fn get(&self, file_name: &str) -> Result<Option<FileMeta>, SyncError> {
        let rtxn = self.env.read_txn()?;
        match self.records.get(&rtxn, file_name)? {
            None => Ok(None),
            Some(bytes) => Ok(Some(decode_stored(bytes)?.into_record(file_name))),
        }
    }

    /// List every record ever seen, tombstones included.
    ///
    /// # Errors
    /// Returns an error if iteration or decoding fails.
    pub fn list(&self) -> Result<Vec<FileMeta>, SyncError> {
        let rtxn = self.env.read_txn()?;

        let mut records = Vec::new();
        for entry in self.records.iter(&rtxn)? {
            let (file_name, bytes) = entry?;
            records.push(decode_stored(bytes)?.into_record(file_name));
        }
        Ok(records)
    }

    /// Propose an update under optimistic concurrency.
    ///
    /// Accepted iff `expected_version` equals the current record's version,
    /// or the record is absent and `expected_version == 0` (first creation).
    /// On acceptance the new record is stored with version
    /// `expected_version + 1`. On rejection the authoritative current record
    /// is returned so the proposer can reconcile.
    ///
    /// # Errors
    /// Returns `NotFound` for a nonzero expected version on an unknown file,
    /// or a store error if the transaction fails.
    pub fn propose(
        &self,
        file_name: &str,
        expected_version: u64,
        hash_list: &HashList,
    ) -> Result<UpdateOutcome, SyncError> {
        let mut wtxn = self.env.write_txn()?;

        let current = match self.records.get(&wtxn, file_name)? {
            None => None,
            Some(bytes) => Some(decode_stored(bytes)?),
        };

        match current {
            None if expected_version == 0 => {}
            None => {
                return Err(SyncError::not_found(format!(
                    "file {file_name} (proposed against version {expected_version})"
                )));
            }
            Some(current) if current.version == expected_version => {}
            Some(current) => {
                return Ok(UpdateOutcome::Rejected {
                    current: current.into_record(file_name),
                });
            }
        }

        let version = expected_version + 1;
        let stored = StoredMeta::from_record(version, hash_list);
        self.records
            .put(&mut wtxn, file_name, &encode_stored(&stored)?)?;
        wtxn.commit()?;

        Ok(UpdateOutcome::Accepted { version })
    }
}
