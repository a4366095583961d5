//! Local index: the client's on-disk snapshot of its last successful sync
//!
//! Plain text, one record per line, newline-terminated:
//!
//! ```text
//! fileName,version,hash1 hash2 ... hashN
//! ```
//!
//! Hashes are space-separated lower-case hex SHA-256 digests; a tombstone
//! line carries the single literal `0`. The parser skips a trailing blank
//! line. The index is rewritten only at the end of a pass, after local file
//! state matches what is recorded.

use std::collections::HashMap;
use std::path::Path;

use crate::error::SyncError;
use crate::hash::BlockHash;
use crate::meta::{FileMeta, HashList, TOMBSTONE_MARK};

/// Index file name inside the base directory; never synchronized itself
pub const INDEX_FILE: &str = "index.txt";

/// The set of records last synchronized, keyed by file name
#[derive(Debug, Clone, Default)]
pub struct LocalIndex {
    records: HashMap<String, FileMeta>,
}

impl LocalIndex {
    /// Create an empty index
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the index from `base_dir`, or return an empty index if the file
    /// does not exist yet.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read, or if a
    /// non-blank line is malformed.
    pub fn load(base_dir: &Path) -> Result<Self, SyncError> {
        let path = base_dir.join(INDEX_FILE);

        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::new());
            }
            Err(err) => return Err(SyncError::local_io(path.display().to_string(), err)),
        };

        let mut records = HashMap::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let meta = parse_line(line)?;
            records.insert(meta.file_name.clone(), meta);
        }

        Ok(Self { records })
    }

    /// Write the index to `base_dir`, records sorted by name.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save(&self, base_dir: &Path) -> Result<(), SyncError> {
        let mut names: Vec<&String> = self.records.keys().collect();
        names.sort();

        let mut out = String::new();
        for name in names {
            out.push_str(&format_line(&self.records[name]));
            out.push('\n');
        }

        let path = base_dir.join(INDEX_FILE);
        std::fs::write(&path, out)
            .map_err(|err| SyncError::local_io(path.display().to_string(), err))
    }

    #[must_use]
    pub fn get(&self, file_name: &str) -> Option<&FileMeta> {
        self.records.get(file_name)
    }

    /// Version last synchronized for a file, 0 if never seen
    #[must_use]
    pub fn version_of(&self, file_name: &str) -> u64 {
        self.records.get(file_name).map_or(0, |meta| meta.version)
    }

    pub fn upsert(&mut self, meta: FileMeta) {
        self.records.insert(meta.file_name.clone(), meta);
    }

    pub fn file_names(&self) -> impl Iterator<Item = &String> {
        self.records.keys()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn parse_line(line: &str) -> Result<FileMeta, SyncError> {
    let parts: Vec<&str> = line.split(',').collect();
    if parts.len() != 3 {
        return Err(SyncError::Index {
            message: format!("expected 3 comma-separated fields: {line:?}"),
        });
    }
    let (file_name, version, hashes) = (parts[0], parts[1], parts[2]);

    let version: u64 = version.parse().map_err(|_| SyncError::Index {
        message: format!("bad version in line: {line:?}"),
    })?;

    let hash_list = if hashes == TOMBSTONE_MARK {
        HashList::Tombstone
    } else {
        let hashes = hashes
            .split(' ')
            .filter(|part| !part.is_empty())
            .map(BlockHash::from_hex)
            .collect::<Result<Vec<_>, _>>()?;
        if hashes.is_empty() {
            return Err(SyncError::Index {
                message: format!("empty hash list in line: {line:?}"),
            });
        }
        HashList::from_blocks(hashes)
    };

    Ok(FileMeta::new(file_name.to_string(), version, hash_list))
}

fn format_line(meta: &FileMeta) -> String {
    let hashes = match meta.hash_list.blocks() {
        None => TOMBSTONE_MARK.to_string(),
        Some(hashes) => hashes
            .iter()
            .map(BlockHash::to_hex)
            .collect::<Vec<_>>()
            .join(" "),
    };
    format!("{},{},{}", meta.file_name, meta.version, hashes)
}
