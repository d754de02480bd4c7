//! # Storage File Tests
//!
//! Tests for:
//! - Block round-trips through the storage file
//! - Scan resilience to damaged blocks
//! - Open-time repair of interrupted writes
//! - Compaction idempotence

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};

use bytes::Bytes;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tempfile::TempDir;

use cairn_core::{config::StorageConfig, metrics::Metrics, Mutation};
use cairn_storage::{analyze, compact_and_repair, PersistentBlock, ReliableStorage};

fn config(dir: &TempDir) -> StorageConfig {
    StorageConfig {
        data_dir: dir.path().to_path_buf(),
        ..Default::default()
    }
}

fn open(dir: &TempDir) -> ReliableStorage {
    ReliableStorage::open(config(dir), Metrics::new()).unwrap().0
}

fn key(i: usize) -> String {
    format!("items:{:04}", i)
}

// =============================================================================
// Round-trip
// =============================================================================

#[test]
fn test_values_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    let mut expected = Vec::new();
    {
        let storage = open(&dir);
        for i in 0..50 {
            let len = rng.gen_range(0..512);
            let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            storage.put(key(i), Bytes::from(payload.clone())).unwrap();
            expected.push((key(i), payload));
        }
    }

    let (storage, report) = ReliableStorage::open(config(&dir), Metrics::new()).unwrap();
    assert!(report.is_clean());
    assert_eq!(report.valid_blocks, 50);
    for (k, payload) in expected {
        assert_eq!(storage.get(&k).unwrap().as_deref(), Some(payload.as_slice()));
    }
}

#[test]
fn test_block_transaction_ids_keep_increasing_across_reopen() {
    let dir = TempDir::new().unwrap();
    let first = {
        let storage = open(&dir);
        storage.put(key(1), Bytes::from_static(b"a")).unwrap()
    };
    let storage = open(&dir);
    let second = storage.put(key(2), Bytes::from_static(b"b")).unwrap();
    assert!(second > first);
}

// =============================================================================
// Corruption resilience
// =============================================================================

#[test]
fn test_corrupt_end_marker_skips_one_block() {
    let dir = TempDir::new().unwrap();
    let n = 20;
    let victim = 7;
    let path = {
        let storage = open(&dir);
        for i in 0..=n {
            storage.put(key(i), Bytes::from(vec![i as u8; 64])).unwrap();
        }
        let location = storage.location(&key(victim)).unwrap();

        let mut file = OpenOptions::new().write(true).open(storage.path()).unwrap();
        file.seek(SeekFrom::Start(location.offset + location.length as u64 - 1))
            .unwrap();
        file.write_all(&[0x00]).unwrap();
        file.sync_all().unwrap();
        storage.path().to_path_buf()
    };

    let report = analyze(&path, false).unwrap();
    assert_eq!(report.valid_blocks, n as u64);
    assert_eq!(report.invalid_blocks, 1);
    assert!(report.trailing_garbage_from.is_none());

    let storage = open(&dir);
    assert!(!storage.contains(&key(victim)));
    assert!(storage.contains(&key(victim + 1)));
    assert_eq!(storage.len(), n);
}

#[test]
fn test_torn_tail_is_cut_on_open() {
    let dir = TempDir::new().unwrap();
    let (path, good_len) = {
        let storage = open(&dir);
        storage.put(key(1), Bytes::from_static(b"kept")).unwrap();
        (storage.path().to_path_buf(), storage.file_size())
    };

    let torn = PersistentBlock::new(key(2), Bytes::from_static(b"lost"), 99).encode();
    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&torn[..torn.len() / 2]).unwrap();
    drop(file);

    let (storage, report) = ReliableStorage::open(config(&dir), Metrics::new()).unwrap();
    assert_eq!(report.trailing_garbage_from, Some(good_len));
    assert_eq!(storage.file_size(), good_len);
    assert!(storage.get(&key(2)).unwrap().is_none());

    // appends land right after the last valid block
    storage.put(key(3), Bytes::from_static(b"new")).unwrap();
    drop(storage);
    assert!(analyze(&path, false).unwrap().is_clean());
}

// =============================================================================
// Open-time repair
// =============================================================================

#[test]
fn test_duplicate_active_blocks_resolved_by_transaction_id() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(&config(&dir).storage_file);
    {
        // crash between appending the new version and retiring the old one
        let mut file = std::fs::File::create(&path).unwrap();
        PersistentBlock::new("acct:1", Bytes::from_static(b"old"), 4)
            .write(&mut file)
            .unwrap();
        PersistentBlock::new("acct:1", Bytes::from_static(b"new"), 5)
            .write(&mut file)
            .unwrap();
    }

    let storage = open(&dir);
    assert_eq!(storage.get("acct:1").unwrap().as_deref(), Some(&b"new"[..]));
    let report = storage.scan(true).unwrap();
    assert_eq!(report.active_blocks, 1);
    assert_eq!(report.dirty_blocks, 1);
}

#[test]
fn test_stale_temp_file_removed() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    std::fs::write(dir.path().join(&cfg.temp_file), b"half written").unwrap();
    let _storage = open(&dir);
    assert!(!dir.path().join(&cfg.temp_file).exists());
}

// =============================================================================
// Compaction
// =============================================================================

fn churn(storage: &ReliableStorage) {
    for i in 0..30 {
        storage.put(key(i), Bytes::from(format!("v1-{}", i))).unwrap();
    }
    for i in (0..30).step_by(2) {
        storage.put(key(i), Bytes::from(format!("v2-{}", i))).unwrap();
    }
    let doomed: Vec<String> = (0..30).step_by(3).map(key).collect();
    storage.delete(&doomed).unwrap();
}

#[test]
fn test_compaction_drops_dead_blocks() {
    let dir = TempDir::new().unwrap();
    let storage = open(&dir);
    churn(&storage);
    let live_before = storage.live_items(None).unwrap();
    let size_before = storage.file_size();
    assert!(storage.dirty_ratio() > 0.3);

    let report = storage.compact().unwrap();
    assert_eq!(report.blocks_kept, live_before.len() as u64);
    assert!(storage.file_size() < size_before);
    assert_eq!(storage.dirty_ratio(), 0.0);
    assert_eq!(storage.live_items(None).unwrap(), live_before);

    let scan = storage.scan(false).unwrap();
    assert_eq!(scan.dirty_blocks + scan.deleted_blocks + scan.invalid_blocks, 0);
}

#[test]
fn test_compaction_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    let path = {
        let storage = open(&dir);
        churn(&storage);
        storage.path().to_path_buf()
    };

    compact_and_repair(dir.path(), &cfg.storage_file, &cfg.temp_file).unwrap();
    let once = std::fs::read(&path).unwrap();
    let second = compact_and_repair(dir.path(), &cfg.storage_file, &cfg.temp_file).unwrap();
    let twice = std::fs::read(&path).unwrap();

    assert_eq!(once, twice);
    assert_eq!(second.blocks_dropped, 0);
    assert!(!dir.path().join(&cfg.temp_file).exists());
}

#[test]
fn test_apply_after_compaction() {
    let dir = TempDir::new().unwrap();
    let storage = open(&dir);
    churn(&storage);
    storage.compact().unwrap();

    storage
        .apply(&[
            Mutation::Put { key: key(1), payload: Bytes::from_static(b"after") },
            Mutation::Delete { key: key(2) },
        ])
        .unwrap();
    drop(storage);

    let storage = open(&dir);
    assert_eq!(storage.get(&key(1)).unwrap().as_deref(), Some(&b"after"[..]));
    assert!(!storage.contains(&key(2)));
    let report = storage.scan(true).unwrap();
    assert!(report.is_clean());
    assert_eq!(
        report.active_blocks,
        storage.len() as u64,
        "every live key has exactly one active block"
    );
}
