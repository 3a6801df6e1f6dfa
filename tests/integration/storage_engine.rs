//! Storage engine semantics.
//!
//! Exercises the write protocol and snapshot-visibility reads through the
//! public store API: insert/update/delete chains, write-write conflicts,
//! revert, tombstone fallback, and scan partitions, for both storage
//! layouts.

#![allow(missing_docs)]

use deltastore::{Config, SnapshotDescriptor, Store, StorageLayout};
use proptest::prelude::*;

const LAYOUTS: [StorageLayout; 2] = [StorageLayout::Row, StorageLayout::Column];

fn open(layout: StorageLayout) -> (Store, u64) {
    let store = Store::open(Config::testing().with_layout(layout)).unwrap();
    let table = store.create_table("t").unwrap();
    (store, table)
}

fn at(version: u64) -> SnapshotDescriptor {
    SnapshotDescriptor::up_to(version)
}

#[test]
fn insert_then_get_returns_the_newest_visible_version() {
    for layout in LAYOUTS {
        let (store, t) = open(layout);
        assert!(store.insert(t, 10, b"A", &at(5)).unwrap());

        let result = store.get(t, 10, &at(5)).unwrap().unwrap();
        assert_eq!(result.data, b"A");
        assert_eq!(result.version, 5);
        assert!(result.is_newest);

        // The version is invisible to an older snapshot.
        assert!(store.get(t, 10, &at(4)).unwrap().is_none());
        assert!(store.get(t, 99, &at(5)).unwrap().is_none());
    }
}

#[test]
fn update_chains_resolve_per_snapshot() {
    for layout in LAYOUTS {
        let (store, t) = open(layout);
        assert!(store.insert(t, 7, b"a", &at(1)).unwrap());
        assert!(store.update(t, 7, b"b", &at(3)).unwrap());

        let old = store.get(t, 7, &at(2)).unwrap().unwrap();
        assert_eq!(old.data, b"a");
        assert_eq!(old.version, 1);
        assert!(!old.is_newest, "a newer invisible version exists");

        let new = store.get(t, 7, &at(3)).unwrap().unwrap();
        assert_eq!(new.data, b"b");
        assert_eq!(new.version, 3);
        assert!(new.is_newest);

        assert_eq!(store.get_newest(t, 7).unwrap().unwrap(), (b"b".to_vec(), 3));
    }
}

#[test]
fn writes_outside_the_read_set_conflict() {
    for layout in LAYOUTS {
        let (store, t) = open(layout);
        assert!(store.insert(t, 1, b"base", &at(3)).unwrap());
        // Writer B commits version 5 first.
        assert!(store.update(t, 1, b"b", &at(5)).unwrap());
        // Writer A began before B committed: version 5 is not in A's read
        // set, so A's update at version 6 must fail.
        let a = SnapshotDescriptor::new(6, 3, [5]);
        assert!(!store.update(t, 1, b"a", &a).unwrap());
        // After refreshing the snapshot the same write goes through.
        assert!(store.update(t, 1, b"a", &at(6)).unwrap());
        assert_eq!(store.get_newest(t, 1).unwrap().unwrap(), (b"a".to_vec(), 6));
    }
}

#[test]
fn delete_hides_the_key_and_gates_updates() {
    for layout in LAYOUTS {
        let (store, t) = open(layout);
        assert!(store.insert(t, 4, b"v", &at(1)).unwrap());
        assert!(store.remove(t, 4, &at(2)).unwrap());

        assert_eq!(store.get(t, 4, &at(1)).unwrap().unwrap().data, b"v");
        assert!(store.get(t, 4, &at(2)).unwrap().is_none());
        assert!(store.get_newest(t, 4).unwrap().is_none());

        // A tombstone cannot be updated or deleted again...
        assert!(!store.update(t, 4, b"w", &at(3)).unwrap());
        assert!(!store.remove(t, 4, &at(3)).unwrap());
        // ...but an insert falls back onto the chain over it.
        assert!(store.insert(t, 4, b"w", &at(3)).unwrap());
        assert_eq!(store.get(t, 4, &at(3)).unwrap().unwrap().data, b"w");
        // The old snapshot still sees through to the original version.
        assert_eq!(store.get(t, 4, &at(1)).unwrap().unwrap().data, b"v");
    }
}

#[test]
fn duplicate_insert_of_a_live_key_fails() {
    for layout in LAYOUTS {
        let (store, t) = open(layout);
        assert!(store.insert(t, 8, b"x", &at(1)).unwrap());
        assert!(!store.insert(t, 8, b"y", &at(2)).unwrap());
        assert_eq!(store.get(t, 8, &at(2)).unwrap().unwrap().data, b"x");
    }
}

#[test]
fn update_of_a_missing_key_fails() {
    for layout in LAYOUTS {
        let (store, t) = open(layout);
        assert!(!store.update(t, 123, b"x", &at(1)).unwrap());
        assert!(!store.remove(t, 123, &at(1)).unwrap());
    }
}

#[test]
fn revert_unlinks_only_the_own_topmost_version() {
    for layout in LAYOUTS {
        let (store, t) = open(layout);
        assert!(store.insert(t, 2, b"keep", &at(1)).unwrap());
        assert!(store.update(t, 2, b"drop", &at(2)).unwrap());

        assert!(store.revert(t, 2, &at(2)).unwrap());
        let result = store.get(t, 2, &at(2)).unwrap().unwrap();
        assert_eq!(result.data, b"keep");
        assert_eq!(result.version, 1);
        assert!(result.is_newest, "the reverted version no longer counts");

        // Reverting again, or reverting a version that is not on top, is
        // a no-op.
        assert!(store.revert(t, 2, &at(2)).unwrap());
        assert!(store.revert(t, 2, &at(1)).unwrap());
        assert_eq!(store.get(t, 2, &at(2)).unwrap().unwrap().data, b"keep");
    }
}

#[test]
fn reverting_an_unchained_insert_withdraws_the_key() {
    for layout in LAYOUTS {
        let (store, t) = open(layout);
        assert!(store.insert(t, 3, b"oops", &at(1)).unwrap());
        assert!(store.revert(t, 3, &at(1)).unwrap());
        assert!(store.get(t, 3, &at(5)).unwrap().is_none());
        // The key is free for a fresh insert.
        assert!(store.insert(t, 3, b"redo", &at(2)).unwrap());
        assert_eq!(store.get(t, 3, &at(2)).unwrap().unwrap().data, b"redo");
    }
}

#[test]
fn repeated_reads_under_one_snapshot_are_stable() {
    for layout in LAYOUTS {
        let (store, t) = open(layout);
        assert!(store.insert(t, 6, b"one", &at(1)).unwrap());
        let snapshot = at(1);
        let first = store.get(t, 6, &snapshot).unwrap();
        // Concurrent-looking writes at higher versions.
        assert!(store.update(t, 6, b"two", &at(5)).unwrap());
        assert!(store.update(t, 6, b"three", &at(6)).unwrap());
        let second = store.get(t, 6, &snapshot).unwrap();
        assert_eq!(
            first.as_ref().map(|r| (&r.data, r.version)),
            second.as_ref().map(|r| (&r.data, r.version)),
        );
    }
}

#[test]
fn scan_partitions_cover_the_live_key_space() {
    for layout in LAYOUTS {
        let (store, t) = open(layout);
        for key in 0..20u64 {
            assert!(store
                .insert(t, key, format!("v{key}").as_bytes(), &at(key + 1))
                .unwrap());
        }
        for key in [3u64, 11, 19] {
            assert!(store.remove(t, key, &at(40 + key)).unwrap());
        }

        let partitions = store.start_scan(t, 3).unwrap();
        assert_eq!(partitions.len(), 3);
        let mut seen: Vec<_> = partitions
            .into_iter()
            .flatten()
            .map(|entry| (entry.key, entry.data))
            .collect();
        seen.sort_unstable();
        let expected: Vec<_> = (0..20u64)
            .filter(|key| ![3, 11, 19].contains(key))
            .map(|key| (key, format!("v{key}").into_bytes()))
            .collect();
        assert_eq!(seen, expected);
    }
}

/// Model state of one key after a prefix of operations.
#[derive(Clone, Debug, PartialEq)]
enum ModelState {
    Absent,
    Deleted,
    Live(Vec<u8>),
}

proptest! {
    /// Applying any sequence of writes at ascending versions, every
    /// snapshot cut resolves to exactly what a sequential model predicts.
    #[test]
    fn chains_match_the_sequential_model(ops in proptest::collection::vec(any::<(bool, u8)>(), 1..24)) {
        for layout in LAYOUTS {
            let (store, t) = open(layout);
            let key = 77u64;
            let mut history: Vec<(u64, ModelState)> = vec![(0, ModelState::Absent)];
            let mut state = ModelState::Absent;

            for (i, (delete, payload)) in ops.iter().enumerate() {
                let version = i as u64 + 1;
                let snapshot = at(version);
                match (&state, delete) {
                    (ModelState::Live(_), true) => {
                        prop_assert!(store.remove(t, key, &snapshot).unwrap());
                        state = ModelState::Deleted;
                    }
                    (ModelState::Live(_), false) => {
                        let data = vec![*payload; 3];
                        prop_assert!(store.update(t, key, &data, &snapshot).unwrap());
                        state = ModelState::Live(data);
                    }
                    (_, false) => {
                        let data = vec![*payload; 3];
                        prop_assert!(store.insert(t, key, &data, &snapshot).unwrap());
                        state = ModelState::Live(data);
                    }
                    (_, true) => {
                        // Deleting an absent or deleted key fails and
                        // leaves the state unchanged.
                        prop_assert!(!store.remove(t, key, &snapshot).unwrap());
                    }
                }
                history.push((version, state.clone()));
            }

            for (version, expected) in &history {
                let got = store.get(t, key, &at(*version)).unwrap();
                match expected {
                    ModelState::Live(data) => {
                        let got = got.expect("model says the key is live");
                        prop_assert_eq!(&got.data, data);
                    }
                    _ => prop_assert!(got.is_none()),
                }
            }
        }
    }
}
