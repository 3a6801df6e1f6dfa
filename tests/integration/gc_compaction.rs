//! Garbage collection and compaction.
//!
//! Verifies the consolidation protocol end to end: history below the
//! cutoff disappears, live history survives, tombstoned keys vanish,
//! chains keep working through the forwarding swing, reverted slots get
//! collected, and the journals are truncated back to one page — for both
//! storage layouts.

#![allow(missing_docs)]

use deltastore::{Config, SnapshotDescriptor, Store, StorageLayout};

const LAYOUTS: [StorageLayout; 2] = [StorageLayout::Row, StorageLayout::Column];

fn open(layout: StorageLayout) -> (Store, u64) {
    let store = Store::open(Config::testing().with_layout(layout)).unwrap();
    let table = store.create_table("t").unwrap();
    (store, table)
}

fn at(version: u64) -> SnapshotDescriptor {
    SnapshotDescriptor::up_to(version)
}

fn run_gc(store: &Store, min_version: u64) -> deltastore::GcStats {
    store.run_gc(min_version).unwrap()[0]
}

#[test]
fn gc_drops_history_invisible_below_the_cutoff() {
    for layout in LAYOUTS {
        let (store, t) = open(layout);
        assert!(store.insert(t, 1, b"v1", &at(1)).unwrap());
        assert!(store.update(t, 1, b"v2", &at(2)).unwrap());
        assert!(store.update(t, 1, b"v3", &at(3)).unwrap());

        let stats = run_gc(&store, 3);
        assert_eq!(stats.keys_consolidated, 1);
        assert_eq!(stats.keys_dropped, 0);

        // Only the cutoff version survives.
        assert_eq!(store.get(t, 1, &at(3)).unwrap().unwrap().data, b"v3");
        assert!(store.get(t, 1, &at(2)).unwrap().is_none());
        assert!(store.get(t, 1, &at(1)).unwrap().is_none());
    }
}

#[test]
fn gc_preserves_history_still_visible_at_the_cutoff() {
    for layout in LAYOUTS {
        let (store, t) = open(layout);
        assert!(store.insert(t, 1, b"v1", &at(1)).unwrap());
        assert!(store.update(t, 1, b"v2", &at(2)).unwrap());

        run_gc(&store, 1);

        assert_eq!(store.get(t, 1, &at(1)).unwrap().unwrap().data, b"v1");
        assert_eq!(store.get(t, 1, &at(2)).unwrap().unwrap().data, b"v2");
        let old = store.get(t, 1, &at(1)).unwrap().unwrap();
        assert!(!old.is_newest);
    }
}

#[test]
fn gc_removes_keys_whose_newest_tombstone_passed_the_cutoff() {
    for layout in LAYOUTS {
        let (store, t) = open(layout);
        assert!(store.insert(t, 9, b"v1", &at(1)).unwrap());
        assert!(store.remove(t, 9, &at(2)).unwrap());

        let stats = run_gc(&store, 2);
        assert_eq!(stats.keys_dropped, 1);

        assert!(store.get(t, 9, &at(100)).unwrap().is_none());
        assert!(store.get_newest(t, 9).unwrap().is_none());
        // The key slot is free again.
        assert!(store.insert(t, 9, b"again", &at(3)).unwrap());
        assert_eq!(store.get(t, 9, &at(3)).unwrap().unwrap().data, b"again");
    }
}

#[test]
fn gc_keeps_tombstones_above_the_cutoff() {
    for layout in LAYOUTS {
        let (store, t) = open(layout);
        assert!(store.insert(t, 5, b"v1", &at(1)).unwrap());
        assert!(store.remove(t, 5, &at(2)).unwrap());

        run_gc(&store, 1);

        // The tombstone is still visible as "deleted"; the old version
        // stays readable below it.
        assert_eq!(store.get(t, 5, &at(1)).unwrap().unwrap().data, b"v1");
        assert!(store.get(t, 5, &at(2)).unwrap().is_none());

        // Once the tombstone itself passes the cutoff the key goes away.
        let stats = run_gc(&store, 2);
        assert_eq!(stats.keys_dropped, 1);
        assert!(store.get(t, 5, &at(1)).unwrap().is_none());
    }
}

#[test]
fn chains_keep_growing_through_the_forwarding_swing() {
    for layout in LAYOUTS {
        let (store, t) = open(layout);
        assert!(store.insert(t, 3, b"v1", &at(1)).unwrap());
        assert!(store.update(t, 3, b"v2", &at(2)).unwrap());
        run_gc(&store, 2);

        // The consolidated record replaced the log chain; new updates
        // attach to it.
        assert!(store.update(t, 3, b"v3", &at(3)).unwrap());
        assert_eq!(store.get(t, 3, &at(3)).unwrap().unwrap().data, b"v3");
        assert_eq!(store.get(t, 3, &at(2)).unwrap().unwrap().data, b"v2");

        // A second pass absorbs the post-swing update as well.
        run_gc(&store, 3);
        assert_eq!(store.get(t, 3, &at(3)).unwrap().unwrap().data, b"v3");
        assert!(store.get(t, 3, &at(2)).unwrap().is_none());

        // Deletion still works against the twice-consolidated record.
        assert!(store.remove(t, 3, &at(4)).unwrap());
        assert!(store.get(t, 3, &at(4)).unwrap().is_none());
    }
}

#[test]
fn reinsert_over_a_consolidated_tombstone() {
    for layout in LAYOUTS {
        let (store, t) = open(layout);
        assert!(store.insert(t, 6, b"v1", &at(1)).unwrap());
        assert!(store.remove(t, 6, &at(2)).unwrap());
        run_gc(&store, 1);

        assert!(store.insert(t, 6, b"v3", &at(3)).unwrap());
        assert_eq!(store.get(t, 6, &at(3)).unwrap().unwrap().data, b"v3");
        assert_eq!(store.get(t, 6, &at(1)).unwrap().unwrap().data, b"v1");
        assert!(store.get(t, 6, &at(2)).unwrap().is_none());
    }
}

#[test]
fn reverting_a_consolidated_tombstone_restores_the_key() {
    for layout in LAYOUTS {
        let (store, t) = open(layout);
        assert!(store.insert(t, 7, b"v1", &at(1)).unwrap());
        assert!(store.remove(t, 7, &at(3)).unwrap());
        // Consolidate while the tombstone is above the cutoff: it becomes
        // the record's top slot.
        run_gc(&store, 1);
        assert!(store.get(t, 7, &at(3)).unwrap().is_none());

        // The deleting transaction aborts and withdraws its tombstone.
        assert!(store.revert(t, 7, &at(3)).unwrap());
        let restored = store.get(t, 7, &at(3)).unwrap().unwrap();
        assert_eq!(restored.data, b"v1");
        assert_eq!(restored.version, 1);
        assert!(restored.is_newest);
        assert_eq!(store.get_newest(t, 7).unwrap().unwrap(), (b"v1".to_vec(), 1));

        // Idempotent, and the next pass collects the reverted slot.
        assert!(store.revert(t, 7, &at(3)).unwrap());
        let stats = run_gc(&store, 1);
        assert_eq!(stats.keys_consolidated, 1);
        assert_eq!(store.get(t, 7, &at(5)).unwrap().unwrap().data, b"v1");
    }
}

#[test]
fn gc_collects_reverted_slots() {
    for layout in LAYOUTS {
        let (store, t) = open(layout);
        assert!(store.insert(t, 4, b"only", &at(1)).unwrap());
        run_gc(&store, 1);

        // Revert the consolidated record's only version.
        assert!(store.revert(t, 4, &at(1)).unwrap());
        assert!(store.get(t, 4, &at(10)).unwrap().is_none());

        let stats = run_gc(&store, 1);
        assert_eq!(stats.keys_dropped, 1);
        assert!(store.get(t, 4, &at(10)).unwrap().is_none());
        assert!(store.insert(t, 4, b"fresh", &at(2)).unwrap());
    }
}

#[test]
fn gc_truncates_the_journals_back_to_the_boundary() {
    for layout in LAYOUTS {
        let (store, t) = open(layout);
        let blob = vec![0x5au8; 2048];
        for key in 0..64u64 {
            assert!(store.insert(t, key, &blob, &at(key + 1)).unwrap());
        }
        for round in 0..4u64 {
            for key in 0..64u64 {
                let version = 100 + round * 64 + key;
                assert!(store.update(t, key, &blob, &at(version)).unwrap());
            }
        }
        let before = store.stats();
        assert!(before.tables[0].insert_log_pages > 1);
        assert!(before.tables[0].update_log_pages > 1);

        let stats = run_gc(&store, 1_000);
        assert!(stats.truncated);
        assert_eq!(stats.keys_consolidated, 64);

        let after = store.stats();
        assert_eq!(after.tables[0].insert_log_pages, 1);
        // The update journal holds the write head plus the freshly built
        // consolidated pages.
        assert!(after.tables[0].update_log_pages < before.tables[0].update_log_pages);

        for key in 0..64u64 {
            assert_eq!(store.get(t, key, &at(1_000)).unwrap().unwrap().data, blob);
        }

        // A quiescent table makes the next pass a no-op.
        let noop = run_gc(&store, 1_000);
        assert_eq!(noop.keys_consolidated, 0);
        assert_eq!(noop.keys_dropped, 0);
        assert!(!noop.truncated);
    }
}

#[test]
fn oversized_records_postpone_collection() {
    for layout in LAYOUTS {
        let (store, t) = open(layout);
        // Two ~40 KiB versions cannot be consolidated into one 64 KiB
        // page together.
        let blob = vec![1u8; 40 * 1024];
        assert!(store.insert(t, 1, &blob, &at(1)).unwrap());
        assert!(store.update(t, 1, &blob, &at(2)).unwrap());

        let stats = run_gc(&store, 1);
        assert_eq!(stats.keys_skipped, 1);
        assert!(!stats.truncated);

        // The chain is untouched and fully readable.
        assert_eq!(store.get(t, 1, &at(1)).unwrap().unwrap().data, blob);
        assert_eq!(store.get(t, 1, &at(2)).unwrap().unwrap().data, blob);

        // Once the older version falls behind the cutoff the record fits
        // and the journals drain.
        let stats = run_gc(&store, 2);
        assert_eq!(stats.keys_consolidated, 1);
        assert!(stats.truncated);
        assert_eq!(store.get(t, 1, &at(2)).unwrap().unwrap().data, blob);
    }
}

#[test]
fn column_pages_cluster_many_keys() {
    let (store, t) = open(StorageLayout::Column);
    for key in 0..50u64 {
        assert!(store
            .insert(t, key, format!("value-{key}").as_bytes(), &at(key + 1))
            .unwrap());
        assert!(store
            .update(t, key, format!("value-{key}b").as_bytes(), &at(100 + key))
            .unwrap());
    }

    let stats = run_gc(&store, 60);
    assert_eq!(stats.keys_consolidated, 50);
    assert!(stats.pages_built >= 1);

    for key in 0..50u64 {
        let newest = store.get(t, key, &at(200)).unwrap().unwrap();
        assert_eq!(newest.data, format!("value-{key}b").into_bytes());
        // History at the cutoff stays readable after clustering.
        let old = store.get(t, key, &at(key + 1)).unwrap().unwrap();
        assert_eq!(old.data, format!("value-{key}").into_bytes());
    }
}
