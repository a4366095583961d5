//! Base-directory scanning via the `ignore` crate
//!
//! Sync scope is plain relative file names: the walk stays at the top level
//! of the base directory and skips subdirectories and the index file.

use std::path::PathBuf;

use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};

use crate::chunker;
use crate::error::SyncError;
use crate::hash::BlockHash;

/// A local file with its hash list computed at the configured block size
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalFile {
    /// File name relative to the base directory
    pub name: String,
    /// File size in bytes
    pub size: u64,
    /// Ordered block digests (never empty; one empty-block digest for S = 0)
    pub hash_list: Vec<BlockHash>,
}

/// Scanner for a sync base directory
pub struct Scanner {
    base_dir: PathBuf,
    block_size: u32,
}

impl Scanner {
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>, block_size: u32) -> Self {
        Self {
            base_dir: base_dir.into(),
            block_size,
        }
    }

    /// Scan the base directory and return all sync-eligible files, sorted by
    /// name for deterministic ordering.
    ///
    /// # Errors
    /// Returns an error if directory traversal or file reading fails.
    pub fn scan(&self) -> Result<Vec<LocalFile>, SyncError> {
        let mut entries = Vec::new();

        // Hidden files stay local: the index and per-directory config are
        // dotfiles and must never be uploaded as sync content.
        let walker = WalkBuilder::new(&self.base_dir)
            .max_depth(Some(1))
            .hidden(true)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .require_git(false)
            .build();

        for result in walker {
            let entry = result.map_err(|err| SyncError::LocalIo {
                path: self.base_dir.display().to_string(),
                source: std::io::Error::other(err),
            })?;
            let path = entry.path();

            if !path.is_file() {
                continue;
            }

            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if !crate::meta::is_sync_name(name) {
                continue;
            }

            let data = std::fs::read(path)
                .map_err(|err| SyncError::local_io(path.display().to_string(), err))?;

            entries.push(LocalFile {
                name: name.to_string(),
                size: data.len() as u64,
                hash_list: chunker::hash_list(&data, self.block_size),
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::INDEX_FILE;
    use tempfile::TempDir;

    #[test]
    fn test_scan_simple_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("file1.txt"), "hello").unwrap();
        std::fs::write(dir.path().join("file2.txt"), "world").unwrap();

        let scanner = Scanner::new(dir.path(), 4096);
        let entries = scanner.scan().unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "file1.txt");
        assert_eq!(entries[1].name, "file2.txt");
        assert_eq!(entries[0].hash_list, vec![BlockHash::from_bytes(b"hello")]);
    }

    #[test]
    fn test_scan_skips_index_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(INDEX_FILE), "t.txt,1,0\n").unwrap();
        std::fs::write(dir.path().join("t.txt"), "content").unwrap();

        let scanner = Scanner::new(dir.path(), 4096);
        let entries = scanner.scan().unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "t.txt");
    }

    #[test]
    fn test_scan_skips_subdirectories() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested/inner.txt"), "deep").unwrap();
        std::fs::write(dir.path().join("top.txt"), "top").unwrap();

        let scanner = Scanner::new(dir.path(), 4096);
        let entries = scanner.scan().unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "top.txt");
    }

    #[test]
    fn test_scan_chunks_at_block_size() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("big.bin"), vec![7u8; 10_000]).unwrap();

        let scanner = Scanner::new(dir.path(), 4096);
        let entries = scanner.scan().unwrap();

        // ceil(10000 / 4096) = 3
        assert_eq!(entries[0].hash_list.len(), 3);
        assert_eq!(entries[0].size, 10_000);
    }

    #[test]
    fn test_scan_skips_hidden_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".blocksync.toml"), "block_size = 64").unwrap();
        std::fs::write(dir.path().join("seen.txt"), "seen").unwrap();

        let scanner = Scanner::new(dir.path(), 4096);
        let entries = scanner.scan().unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "seen.txt");
    }

    #[test]
    fn test_scan_empty_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("empty.txt"), "").unwrap();

        let scanner = Scanner::new(dir.path(), 4096);
        let entries = scanner.scan().unwrap();

        assert_eq!(entries[0].hash_list, vec![BlockHash::of_empty()]);
    }
}
