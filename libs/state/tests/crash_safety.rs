//! Checkpoint rotation under interrupted saves, and table key uniqueness
//! under concurrent access.

use std::fs;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Instant;

use bbuf_state::{decode, AllocationTable, CheckpointEncoder, CheckpointStore, Generation};
use tempfile::TempDir;

fn table_with(names: &[&str]) -> AllocationTable {
    let mut table = AllocationTable::new();
    for name in names {
        table.insert_or_get(name, 1000).size = 64;
    }
    table
}

#[test]
fn truncated_staged_file_leaves_current_intact() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path());
    let mut encoder = CheckpointEncoder::new();

    let first = encoder.encode(table_with(&["1", "2"]).iter());
    store.write(&first, Instant::now()).unwrap();

    // Killed halfway through writing the next generation.
    let second = encoder.encode(table_with(&["1", "2", "3"]).iter());
    fs::write(store.new_path(), &second[..second.len() / 2]).unwrap();

    let stored = store.read().unwrap().unwrap();
    assert_eq!(stored.generation, Generation::Current);
    assert_eq!(stored.data, first.to_vec());
    assert_eq!(decode(&stored.data).unwrap().records.len(), 2);
}

#[test]
fn next_save_replaces_leftover_staged_file() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path());
    let mut encoder = CheckpointEncoder::new();

    fs::write(store.new_path(), b"garbage from a dead process").unwrap();

    let bytes = encoder.encode(table_with(&["scratch"]).iter());
    store.write(&bytes, Instant::now()).unwrap();

    assert!(!store.new_path().exists());
    let stored = store.read().unwrap().unwrap();
    assert_eq!(decode(&stored.data).unwrap().records[0].name, "scratch");
}

#[test]
fn crash_between_unlink_and_link_recovers_previous_generation() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path());
    let mut encoder = CheckpointEncoder::new();

    let gen1 = encoder.encode(table_with(&["a"]).iter());
    let gen2 = encoder.encode(table_with(&["a", "b"]).iter());
    store.write(&gen1, Instant::now()).unwrap();
    store.write(&gen2, Instant::now()).unwrap();

    // A third save dies right after "unlink current".
    fs::write(store.new_path(), b"partial").unwrap();
    fs::remove_file(store.old_path()).unwrap();
    fs::hard_link(store.current_path(), store.old_path()).unwrap();
    fs::remove_file(store.current_path()).unwrap();

    let stored = store.read().unwrap().unwrap();
    assert_eq!(stored.generation, Generation::Old);
    assert_eq!(stored.data, gen2.to_vec());
}

#[test]
fn concurrent_insert_or_get_yields_one_record_per_key() {
    let table = Arc::new(Mutex::new(AllocationTable::new()));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let table = Arc::clone(&table);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut ids = Vec::new();
                for _ in 0..100 {
                    let mut guard = table.lock().unwrap();
                    ids.push(guard.insert_or_get("shared", 1000).id);
                }
                ids
            })
        })
        .collect();

    let ids: Vec<u32> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();

    assert!(ids.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(table.lock().unwrap().len(), 1);
}
