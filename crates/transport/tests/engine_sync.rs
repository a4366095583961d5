//! Sync engine scenarios against an in-process coordinator
//!
//! Each test stands up shared stores, points one or more client directories
//! at them, and drives full reconciliation passes.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use bytes::Bytes;
use tempfile::TempDir;

use blocksync_core::chunker;
use blocksync_core::engine::{PassSummary, SyncEngine};
use blocksync_core::error::SyncError;
use blocksync_core::hash::BlockHash;
use blocksync_core::index::{LocalIndex, INDEX_FILE};
use blocksync_core::meta::{FileMeta, HashList, UpdateOutcome};
use blocksync_core::Coordinator;
use blocksync_transport::LocalCoordinator;

const BLOCK_SIZE: u32 = 4096;

fn coordinator() -> (TempDir, LocalCoordinator) {
    let data = TempDir::new().unwrap();
    let coordinator = LocalCoordinator::open(data.path()).unwrap();
    (data, coordinator)
}

fn run(coordinator: &LocalCoordinator, dir: &Path) -> PassSummary {
    let mut coordinator = coordinator.clone();
    SyncEngine::new(&mut coordinator, dir, BLOCK_SIZE)
        .run()
        .unwrap()
}

fn write(dir: &TempDir, name: &str, content: impl AsRef<[u8]>) {
    std::fs::write(dir.path().join(name), content).unwrap();
}

fn delete(dir: &TempDir, name: &str) {
    std::fs::remove_file(dir.path().join(name)).unwrap();
}

/// All synced files in the directory, excluding the index
fn files_of(dir: &TempDir) -> BTreeMap<String, Vec<u8>> {
    let mut files = BTreeMap::new();
    for entry in std::fs::read_dir(dir.path()).unwrap() {
        let entry = entry.unwrap();
        if !entry.path().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name == INDEX_FILE || name.starts_with('.') {
            continue;
        }
        files.insert(name, std::fs::read(entry.path()).unwrap());
    }
    files
}

/// The convergence check from the contract: every local file's recomputed
/// hash list matches its index record, every non-tombstone record has its
/// file on disk, and tombstoned files are absent.
fn assert_index_matches_local(dir: &TempDir) {
    let index = LocalIndex::load(dir.path()).unwrap();
    let files = files_of(dir);

    for (name, content) in &files {
        let record = index
            .get(name)
            .unwrap_or_else(|| panic!("{name} on disk but not in index"));
        let recomputed = chunker::hash_list(content, BLOCK_SIZE);
        assert_eq!(
            record.hash_list,
            HashList::from_blocks(recomputed),
            "index hash list for {name} does not match local content"
        );
    }

    for name in index.file_names() {
        let record = index.get(name).unwrap();
        assert_eq!(
            record.is_tombstone(),
            !files.contains_key(name),
            "index/disk mismatch for {name}"
        );
    }
}

#[test]
fn test_create_then_second_client_downloads() {
    let (_data, coordinator) = coordinator();
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();

    write(&a, "t1.txt", "This is test1");
    let summary = run(&coordinator, a.path());
    assert_eq!(summary.uploaded, 1);
    assert!(summary.is_clean());

    let summary = run(&coordinator, b.path());
    assert_eq!(summary.downloaded, 1);

    assert_eq!(files_of(&a), files_of(&b));
    assert_eq!(
        std::fs::read_to_string(b.path().join("t1.txt")).unwrap(),
        "This is test1"
    );

    // Both indexes record version 1 with identical single-block hash lists
    let index_a = LocalIndex::load(a.path()).unwrap();
    let index_b = LocalIndex::load(b.path()).unwrap();
    assert_eq!(index_a.version_of("t1.txt"), 1);
    assert_eq!(index_b.version_of("t1.txt"), 1);
    assert_eq!(index_a.get("t1.txt"), index_b.get("t1.txt"));
    assert_eq!(
        index_a.get("t1.txt").unwrap().hash_list,
        HashList::from_blocks(vec![BlockHash::from_bytes(b"This is test1")])
    );

    assert_index_matches_local(&a);
    assert_index_matches_local(&b);
}

#[test]
fn test_update_propagates_and_version_increments() {
    let (_data, coordinator) = coordinator();
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();

    write(&a, "t1.txt", "This is test1");
    write(&a, "t2.txt", "This is test2");
    run(&coordinator, a.path());
    run(&coordinator, b.path());

    write(&a, "t1.txt", "This is new test1!!!!!!");
    let summary = run(&coordinator, a.path());
    assert_eq!(summary.uploaded, 1);
    assert_eq!(summary.unchanged, 1);

    run(&coordinator, b.path());

    assert_eq!(files_of(&a), files_of(&b));
    let index_b = LocalIndex::load(b.path()).unwrap();
    assert_eq!(index_b.version_of("t1.txt"), 2);
    assert_eq!(index_b.version_of("t2.txt"), 1);

    assert_index_matches_local(&a);
    assert_index_matches_local(&b);
}

#[test]
fn test_delete_propagates_as_tombstone() {
    let (_data, coordinator) = coordinator();
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();

    write(&a, "t1.txt", "This is test1");
    write(&a, "t2.txt", "This is test2");
    run(&coordinator, a.path());
    run(&coordinator, b.path());

    delete(&a, "t1.txt");
    let summary = run(&coordinator, a.path());
    assert_eq!(summary.removed, 1);

    let summary = run(&coordinator, b.path());
    assert_eq!(summary.removed, 1);
    assert!(!b.path().join("t1.txt").exists());
    assert!(b.path().join("t2.txt").exists());

    // Deletion is an accepted update: version 2, tombstone line is `0`
    let index_b = LocalIndex::load(b.path()).unwrap();
    assert_eq!(index_b.version_of("t1.txt"), 2);
    assert!(index_b.get("t1.txt").unwrap().is_tombstone());
    let raw = std::fs::read_to_string(b.path().join(INDEX_FILE)).unwrap();
    assert!(raw.lines().any(|line| line == "t1.txt,2,0"), "raw: {raw}");

    assert_index_matches_local(&a);
    assert_index_matches_local(&b);
}

#[test]
fn test_recreate_after_delete_increments_again() {
    let (_data, coordinator) = coordinator();
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();

    write(&a, "t1.txt", "This is test1");
    run(&coordinator, a.path());
    run(&coordinator, b.path());

    delete(&a, "t1.txt");
    run(&coordinator, a.path());
    run(&coordinator, b.path());

    write(&a, "t1.txt", "Recreate test1!!!!!!");
    run(&coordinator, a.path());
    run(&coordinator, b.path());

    assert_eq!(files_of(&a), files_of(&b));
    let index_a = LocalIndex::load(a.path()).unwrap();
    assert_eq!(index_a.version_of("t1.txt"), 3);
    assert_eq!(
        std::fs::read_to_string(b.path().join("t1.txt")).unwrap(),
        "Recreate test1!!!!!!"
    );

    assert_index_matches_local(&a);
    assert_index_matches_local(&b);
}

#[test]
fn test_stale_edit_loses_and_adopts_winner() {
    let (_data, coordinator) = coordinator();
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();

    write(&a, "t1.txt", "base");
    run(&coordinator, a.path());
    run(&coordinator, b.path());

    // Both edit from version 1; A proposes first and wins version 2
    write(&a, "t1.txt", "from A");
    write(&b, "t1.txt", "from B");
    run(&coordinator, a.path());

    // B's proposal is rejected within its own pass; it adopts A's content
    let summary = run(&coordinator, b.path());
    assert_eq!(summary.uploaded, 0);
    assert_eq!(summary.downloaded, 1);

    assert_eq!(
        std::fs::read_to_string(b.path().join("t1.txt")).unwrap(),
        "from A"
    );
    let index_b = LocalIndex::load(b.path()).unwrap();
    assert_eq!(index_b.version_of("t1.txt"), 2);

    // The losing edit is gone for good: another pass changes nothing
    let summary = run(&coordinator, b.path());
    assert_eq!(summary.unchanged, 1);

    assert_index_matches_local(&a);
    assert_index_matches_local(&b);
}

#[test]
fn test_both_seed_same_name_before_first_sync() {
    let (_data, coordinator) = coordinator();
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();

    // Neither has an index yet, so both propose creation from version 0
    write(&a, "testing.txt", "from A");
    write(&b, "testing.txt", "from B");

    run(&coordinator, a.path());
    run(&coordinator, b.path());

    // A won the creation; B adopted A's content in the same pass
    assert_eq!(files_of(&a), files_of(&b));
    assert_eq!(
        std::fs::read_to_string(b.path().join("testing.txt")).unwrap(),
        "from A"
    );
    let index_b = LocalIndex::load(b.path()).unwrap();
    assert_eq!(index_b.version_of("testing.txt"), 1);
}

#[test]
fn test_empty_file_syncs_as_single_empty_block() {
    let (_data, coordinator) = coordinator();
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();

    write(&a, "t1.txt", "");
    run(&coordinator, a.path());
    run(&coordinator, b.path());

    let content = std::fs::read(b.path().join("t1.txt")).unwrap();
    assert!(content.is_empty());

    let index_b = LocalIndex::load(b.path()).unwrap();
    assert_eq!(
        index_b.get("t1.txt").unwrap().hash_list,
        HashList::from_blocks(vec![BlockHash::of_empty()])
    );
}

#[test]
fn test_update_to_empty_propagates() {
    let (_data, coordinator) = coordinator();
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();

    write(&a, "t1.txt", "This is test1");
    run(&coordinator, a.path());
    run(&coordinator, b.path());

    write(&a, "t1.txt", "");
    run(&coordinator, a.path());
    run(&coordinator, b.path());

    assert_eq!(std::fs::read(b.path().join("t1.txt")).unwrap(), b"");
    assert_eq!(LocalIndex::load(b.path()).unwrap().version_of("t1.txt"), 2);
    assert_index_matches_local(&b);
}

#[test]
fn test_multi_block_files_grow_and_shrink() {
    let (_data, coordinator) = coordinator();
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();

    write(&a, "t1.txt", vec![b'1'; 4 * 1024]);
    write(&a, "t2.txt", vec![b'2'; 4 * 1024]);
    run(&coordinator, a.path());
    run(&coordinator, b.path());

    // Append to one file, truncate the other
    write(&a, "t1.txt", vec![b'1'; 8 * 1024]);
    write(&a, "t2.txt", vec![b'2'; 2 * 1024]);
    run(&coordinator, a.path());
    run(&coordinator, b.path());

    let files = files_of(&b);
    assert_eq!(files["t1.txt"], vec![b'1'; 8 * 1024]);
    assert_eq!(files["t2.txt"], vec![b'2'; 2 * 1024]);

    let index_b = LocalIndex::load(b.path()).unwrap();
    assert_eq!(
        index_b.get("t1.txt").unwrap().hash_list.blocks().unwrap().len(),
        2
    );
    assert_index_matches_local(&b);
}

#[test]
fn test_late_third_client_converges() {
    let (_data, coordinator) = coordinator();
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();

    write(&a, "t1.txt", "This is test1");
    write(&a, "t2.txt", "This is test2");
    run(&coordinator, a.path());
    run(&coordinator, b.path());

    delete(&b, "t1.txt");
    run(&coordinator, b.path());
    run(&coordinator, a.path());

    // A third client seeded with its own conflicting content joins late
    let c = TempDir::new().unwrap();
    write(&c, "t1.txt", "This is test1 in c3");
    write(&c, "t2.txt", "This is test2 in c3");
    run(&coordinator, c.path());

    // Both of C's stale creations lost: t1 adopted the tombstone (local
    // file removed), t2 adopted the original version-1 content
    let files = files_of(&c);
    assert!(!files.contains_key("t1.txt"));
    assert_eq!(files["t2.txt"], b"This is test2");
    let index_c = LocalIndex::load(c.path()).unwrap();
    assert!(index_c.get("t1.txt").unwrap().is_tombstone());
    assert_eq!(index_c.version_of("t1.txt"), 2);

    // Recreating over the tombstone is accepted and increments again
    write(&c, "t1.txt", "This is new test1 in c3!!!!!!");
    run(&coordinator, c.path());
    assert_eq!(
        LocalIndex::load(c.path()).unwrap().version_of("t1.txt"),
        3
    );

    run(&coordinator, a.path());
    run(&coordinator, b.path());
    assert_eq!(files_of(&a), files_of(&c));
    assert_eq!(files_of(&b), files_of(&c));

    assert_index_matches_local(&a);
    assert_index_matches_local(&b);
    assert_index_matches_local(&c);
}

#[test]
fn test_noop_pass_leaves_index_untouched() {
    let (_data, coordinator) = coordinator();
    let a = TempDir::new().unwrap();

    write(&a, "t1.txt", "stable");
    run(&coordinator, a.path());

    let before = std::fs::read_to_string(a.path().join(INDEX_FILE)).unwrap();
    let summary = run(&coordinator, a.path());
    assert_eq!(summary.unchanged, 1);
    assert_eq!(summary.uploaded + summary.downloaded + summary.removed, 0);

    let after = std::fs::read_to_string(a.path().join(INDEX_FILE)).unwrap();
    assert_eq!(before, after);
}

/// Delegates to the in-process coordinator but fails every `get_block` for
/// one poisoned digest, to exercise per-file failure isolation.
struct FailingFetch {
    inner: LocalCoordinator,
    poisoned: BlockHash,
}

impl Coordinator for FailingFetch {
    fn file_info_map(&mut self) -> Result<std::collections::HashMap<String, FileMeta>, SyncError> {
        self.inner.file_info_map()
    }

    fn update_file(
        &mut self,
        file_name: &str,
        expected_version: u64,
        hash_list: &HashList,
    ) -> Result<UpdateOutcome, SyncError> {
        self.inner.update_file(file_name, expected_version, hash_list)
    }

    fn get_block(&mut self, hash: &BlockHash) -> Result<Bytes, SyncError> {
        if *hash == self.poisoned {
            return Err(SyncError::Transport(std::io::Error::other(
                "injected fetch failure",
            )));
        }
        self.inner.get_block(hash)
    }

    fn put_block(&mut self, data: &[u8]) -> Result<BlockHash, SyncError> {
        self.inner.put_block(data)
    }

    fn has_blocks(&mut self, hashes: &[BlockHash]) -> Result<HashSet<BlockHash>, SyncError> {
        self.inner.has_blocks(hashes)
    }
}

#[test]
fn test_failed_file_leaves_others_and_its_own_state_intact() {
    let (_data, coordinator) = coordinator();
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();

    write(&a, "bad.txt", "content that will fail to fetch");
    write(&a, "good.txt", "content that downloads fine");
    run(&coordinator, a.path());

    let poisoned = BlockHash::from_bytes(b"content that will fail to fetch");
    let mut failing = FailingFetch {
        inner: coordinator.clone(),
        poisoned,
    };

    let summary = SyncEngine::new(&mut failing, b.path(), BLOCK_SIZE)
        .run()
        .unwrap();

    // good.txt synced; bad.txt failed and left no trace
    assert_eq!(summary.downloaded, 1);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].0, "bad.txt");
    assert!(b.path().join("good.txt").exists());
    assert!(!b.path().join("bad.txt").exists());

    let index_b = LocalIndex::load(b.path()).unwrap();
    assert!(index_b.get("bad.txt").is_none());
    assert_eq!(index_b.version_of("good.txt"), 1);

    // A later pass without the fault finishes the job
    let summary = run(&coordinator, b.path());
    assert_eq!(summary.downloaded, 1);
    assert_eq!(files_of(&a), files_of(&b));
}

#[test]
fn test_shared_blocks_are_deduplicated_across_files() {
    let (_data, coordinator) = coordinator();
    let a = TempDir::new().unwrap();

    // Two files, same single full block plus different tails
    let mut one = vec![b'x'; BLOCK_SIZE as usize];
    one.extend_from_slice(b"tail-one");
    let mut two = vec![b'x'; BLOCK_SIZE as usize];
    two.extend_from_slice(b"tail-two");

    write(&a, "one.bin", &one);
    write(&a, "two.bin", &two);
    run(&coordinator, a.path());

    let b = TempDir::new().unwrap();
    run(&coordinator, b.path());
    assert_eq!(files_of(&a), files_of(&b));

    // The shared leading block is stored once
    let mut probe = coordinator.clone();
    let shared = BlockHash::from_bytes(&one[..BLOCK_SIZE as usize]);
    let present = probe.has_blocks(&[shared]).unwrap();
    assert!(present.contains(&shared));
}
