//! Whole-database integration tests covering the engine's end-to-end
//! scenarios: a committed write surviving a reopen, conflicting writes
//! being refused, rollback discarding its writes, the lock-free append
//! list's concurrent count, the bucket index's Bloom false-positive bound,
//! and WAL rotation across many commits.

use std::sync::Arc;
use std::thread;

use vtm_concurrency::{AccessMode, AppendAtomicList, BucketIndexedList};
use vtm_core::region::Rwr;
use vtmdb::{Database, DatabaseConfig};

fn small_segment_config() -> DatabaseConfig {
    DatabaseConfig::default().with_transactions_per_file(5)
}

#[test]
fn small_alloc_write_commit_reopen_round_trips_the_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.vtm");

    let config = DatabaseConfig::default().with_segment_size(1024 * 1024);

    let addr;
    {
        let db = Database::create_new(&path, config.clone()).unwrap();
        addr = db.allocate(64).unwrap();

        let tx = db.begin_transaction();
        let region = Rwr::new(addr, 13);
        let shadow = tx.buffer_of_region(region, AccessMode::Write).unwrap().unwrap();
        shadow.set_bytes(b"hello, world\0".to_vec());
        tx.commit().unwrap();
        db.flush(false).unwrap();
    }

    let db = Database::open_existing(&path, config).unwrap();
    let tx = db.begin_transaction();
    let region = Rwr::new(addr, 13);
    let shadow = tx.buffer_of_region(region, AccessMode::Read).unwrap().unwrap();
    assert_eq!(shadow.bytes(), b"hello, world\0".to_vec());
    tx.commit().unwrap();
}

#[test]
fn overlapping_writable_regions_across_transactions_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.vtm");
    let db = Database::create_new(&path, small_segment_config()).unwrap();
    let addr = db.allocate(64).unwrap();

    let tx1 = db.begin_transaction();
    let region1 = Rwr::new(addr, 32);
    let shadow1 = tx1.buffer_of_region(region1, AccessMode::Write).unwrap();
    assert!(shadow1.is_some());

    let tx2 = db.begin_transaction();
    let region2 = Rwr::new(addr.checked_offset(16).unwrap(), 32);
    let shadow2 = tx2.buffer_of_region(region2, AccessMode::Write).unwrap();
    assert!(shadow2.is_none(), "overlapping writable region should have been refused");

    tx1.commit().unwrap();
    tx2.rollback().unwrap();
}

#[test]
fn rollback_discards_its_writes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.vtm");
    let db = Database::create_new(&path, small_segment_config()).unwrap();
    let addr = db.allocate(64).unwrap();
    let region = Rwr::new(addr, 16);

    let tx1 = db.begin_transaction();
    let shadow = tx1.buffer_of_region(region, AccessMode::Write).unwrap().unwrap();
    shadow.set_bytes(vec![0xAA; 16]);
    tx1.rollback().unwrap();

    let tx2 = db.begin_transaction();
    let shadow = tx2.buffer_of_region(region, AccessMode::Read).unwrap().unwrap();
    assert_eq!(shadow.bytes(), vec![0u8; 16]);
    tx2.commit().unwrap();
}

#[test]
fn fifty_threads_appending_a_hundred_each_yields_five_thousand_items() {
    let list = Arc::new(AppendAtomicList::<u64>::default());
    let mut handles = Vec::new();
    for t in 0..50u64 {
        let list = list.clone();
        handles.push(thread::spawn(move || {
            for i in 0..100u64 {
                list.append(t * 100 + i);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let items: Vec<u64> = list.iter().copied().collect();
    assert_eq!(items.len(), 5000);
    assert_eq!(items.iter().sum::<u64>(), (0..5000u64).sum());
}

#[test]
fn bloom_index_false_positive_rate_stays_below_bound() {
    let num_buckets = 4096;
    let index: BucketIndexedList<u64> = BucketIndexedList::new(num_buckets);
    for i in 0..5700u64 {
        let bucket = (i as usize) % num_buckets;
        index.insert(bucket, i, i);
    }
    let probe = u64::MAX / 2; // never inserted
    assert!(
        index.admission_rate(probe) < 0.51,
        "false-positive admission rate exceeded bound"
    );
}

#[test]
fn wal_rotation_reproduces_the_exact_committed_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.vtm");
    let db = Database::create_new(&path, small_segment_config()).unwrap();

    for _ in 0..23 {
        let addr = db.allocate(32).unwrap();
        let tx = db.begin_transaction();
        let region = Rwr::new(addr, 4);
        let shadow = tx.buffer_of_region(region, AccessMode::Write).unwrap().unwrap();
        shadow.set_bytes(vec![1, 2, 3, 4]);
        tx.commit().unwrap();
    }

    // threshold 5: suffixes 0..4 sealed (5 files), suffix 4 still open.
    let wal_dir = path.with_file_name("db.vtm.wal");
    let mut suffixes: Vec<u32> = std::fs::read_dir(&wal_dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
        .filter_map(|name| {
            name.strip_prefix("a0")
                .and_then(|rest| rest.strip_suffix(".tlog"))
                .and_then(|n| n.parse::<u32>().ok())
        })
        .collect();
    suffixes.sort_unstable();
    assert_eq!(suffixes, vec![0, 1, 2, 3, 4]);
}
