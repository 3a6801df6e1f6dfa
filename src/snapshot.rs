//! Snapshot descriptors and transaction version tracking.
//!
//! A snapshot is a read-set predicate over version numbers: a transaction
//! sees its own writes, plus every version committed before it began.
//! Versions belonging to transactions that were still active at begin are
//! invisible regardless of numeric order.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use smallvec::SmallVec;

/// Read-set predicate handed to every engine operation.
#[derive(Clone, Debug)]
pub struct SnapshotDescriptor {
    version: u64,
    base_version: u64,
    active: SmallVec<[u64; 8]>,
}

impl SnapshotDescriptor {
    /// A snapshot at `version` with the given base and the set of
    /// transactions active at begin.
    pub fn new(version: u64, base_version: u64, active: impl IntoIterator<Item = u64>) -> Self {
        Self {
            version,
            base_version,
            active: active.into_iter().collect(),
        }
    }

    /// A snapshot that reads every version up to and including `version`.
    pub fn up_to(version: u64) -> Self {
        Self {
            version,
            base_version: version,
            active: SmallVec::new(),
        }
    }

    /// The version this transaction writes at.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Everything strictly below this version is stable for this snapshot.
    pub fn lowest_active(&self) -> u64 {
        self.base_version
    }

    /// Whether a committed version is visible to this snapshot.
    pub fn in_read_set(&self, version: u64) -> bool {
        if version == self.version {
            return true;
        }
        version < self.version && !self.active.contains(&version)
    }
}

#[derive(Default)]
struct TrackerState {
    next_version: u64,
    /// Active transaction version -> its base version at begin.
    active: BTreeMap<u64, u64>,
}

/// Issues transaction versions and snapshot descriptors, and derives the
/// garbage collection horizon from the set of live transactions.
pub struct CommitTracker {
    state: Mutex<TrackerState>,
}

impl Default for CommitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CommitTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState {
                next_version: 1,
                active: BTreeMap::new(),
            }),
        }
    }

    /// Starts a transaction: assigns the next version and captures the
    /// active set.
    pub fn begin(&self) -> SnapshotDescriptor {
        let mut state = self.state.lock();
        let version = state.next_version;
        state.next_version += 1;
        let base = state
            .active
            .keys()
            .next()
            .copied()
            .unwrap_or(version);
        let snapshot = SnapshotDescriptor::new(version, base, state.active.keys().copied());
        state.active.insert(version, base);
        snapshot
    }

    /// Finishes a transaction, making its writes visible to later
    /// snapshots.
    pub fn commit(&self, snapshot: &SnapshotDescriptor) {
        self.state.lock().active.remove(&snapshot.version());
    }

    /// Abandons a transaction. The caller is expected to have reverted its
    /// writes; version-wise this is the same as a commit.
    pub fn abort(&self, snapshot: &SnapshotDescriptor) {
        self.commit(snapshot);
    }

    /// Largest version every live snapshot is guaranteed to see — the GC
    /// cutoff. With no live transactions everything issued so far is
    /// stable.
    pub fn min_active_version(&self) -> u64 {
        let state = self.state.lock();
        match state.active.values().next() {
            Some(base) => base.saturating_sub(1),
            None => state.next_version - 1,
        }
    }
}
