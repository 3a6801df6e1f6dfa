//! Per-table storage engine: journals, index, and the write protocol.
//!
//! Writers append their version to a journal first, then publish it by
//! linking it onto the key's version chain (or into the index for brand
//! new keys). All publication happens through single-word CAS, so readers
//! are never blocked; a writer that loses a race either retries behind
//! the new chain state or reports a write-write conflict. Entries whose
//! publication never happened stay unreachable in the journals and are
//! reclaimed with the next GC truncation.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::alloc::PageArena;
use crate::config::StorageLayout;
use crate::error::Result;
use crate::gc::{self, GcStats};
use crate::index::{HashIndex, KeyIndex};
use crate::log::{OrderedLog, UnorderedLog};
use crate::record::log_entry::{DeleteRecord, InsertRecord, UpdateRecord};
use crate::record::{
    attach, chase, read_chain, read_newest, view, AttachGate, AttachOutcome, ChainHead, Chase,
    RecordPtr, RecordView, LOG_DELETE, LOG_INSERT, LOG_UPDATE,
};
use crate::snapshot::SnapshotDescriptor;

/// A versioned read result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetResult {
    pub data: Vec<u8>,
    pub version: u64,
    /// Whether no newer committed-but-invisible version exists.
    pub is_newest: bool,
}

/// Usage counters for one table.
#[derive(Clone, Debug)]
pub struct TableStats {
    pub name: String,
    pub keys: usize,
    pub insert_log_pages: usize,
    pub update_log_pages: u64,
}

pub struct Table {
    name: String,
    layout: StorageLayout,
    arena: Arc<PageArena>,
    insert_log: OrderedLog,
    update_log: UnorderedLog,
    index: Arc<dyn KeyIndex>,
    /// Serialises GC passes; never touched by the data plane.
    gc_lock: Mutex<()>,
}

impl Table {
    pub fn new(
        name: impl Into<String>,
        layout: StorageLayout,
        arena: Arc<PageArena>,
        hash_capacity: usize,
    ) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            layout,
            insert_log: OrderedLog::new(Arc::clone(&arena))?,
            update_log: UnorderedLog::new(Arc::clone(&arena))?,
            index: Arc::new(HashIndex::with_capacity(hash_capacity)),
            arena,
            gc_lock: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn arena(&self) -> &Arc<PageArena> {
        &self.arena
    }

    pub(crate) fn index(&self) -> &Arc<dyn KeyIndex> {
        &self.index
    }

    pub(crate) fn insert_log(&self) -> &OrderedLog {
        &self.insert_log
    }

    pub(crate) fn update_log(&self) -> &UnorderedLog {
        &self.update_log
    }

    pub(crate) fn layout(&self) -> StorageLayout {
        self.layout
    }

    /// Snapshot read: the newest version visible to `snapshot`, or `None`
    /// when the key is absent, deleted, or entirely invisible.
    pub fn get(&self, key: u64, snapshot: &SnapshotDescriptor) -> Option<GetResult> {
        let _guard = crossbeam_epoch::pin();
        let head = self.index.get(key)?;
        let visible = read_chain(&self.arena, head, snapshot)?;
        visible.data.map(|data| GetResult {
            data,
            version: visible.version,
            is_newest: visible.is_newest,
        })
    }

    /// The newest committed version regardless of snapshots; `None` for
    /// absent or deleted keys.
    pub fn get_newest(&self, key: u64) -> Option<(Vec<u8>, u64)> {
        let _guard = crossbeam_epoch::pin();
        let head = self.index.get(key)?;
        let newest = read_newest(&self.arena, head)?;
        newest.data.map(|data| (data, newest.version))
    }

    /// Inserts a new key. A duplicate falls back to the update path when
    /// the existing newest version is a tombstone; a live duplicate
    /// returns `false`.
    pub fn insert(&self, key: u64, data: &[u8], snapshot: &SnapshotDescriptor) -> Result<bool> {
        let _guard = crossbeam_epoch::pin();
        let ptr = self
            .insert_log
            .append(InsertRecord::size_for(data.len()), LOG_INSERT)?;
        let page = self.arena.page(ptr.page());
        InsertRecord::init(&page, ptr.offset(), key, snapshot.version(), data);

        let result = self.publish_insert(key, ptr, data, snapshot);
        // Sealed regardless of outcome: an orphaned entry must not hold
        // back journal reclamation.
        page.seal_entry(ptr.offset());
        result
    }

    fn publish_insert(
        &self,
        key: u64,
        ptr: RecordPtr,
        data: &[u8],
        snapshot: &SnapshotDescriptor,
    ) -> Result<bool> {
        loop {
            if self.index.insert(key, ptr)? {
                return Ok(true);
            }
            let Some(head) = self.index.get(key) else {
                // The mapping vanished between the failed insert and the
                // lookup; try claiming it again.
                continue;
            };
            let update_ptr = self
                .update_log
                .append(UpdateRecord::size_for(data.len()), LOG_UPDATE)?;
            let update_page = self.arena.page(update_ptr.page());
            UpdateRecord::init(&update_page, update_ptr.offset(), key, snapshot.version(), data);
            let outcome = attach(
                &self.arena,
                head,
                update_ptr,
                snapshot,
                AttachGate::RequireDeleted,
            );
            update_page.seal_entry(update_ptr.offset());
            match outcome {
                AttachOutcome::Attached => return Ok(true),
                AttachOutcome::Conflict => return Ok(false),
                AttachOutcome::Gated => {
                    debug!(key, table = %self.name, "insert.duplicate");
                    return Ok(false);
                }
                AttachOutcome::Invalid => return Ok(false),
                AttachOutcome::HeadGone => continue,
            }
        }
    }

    /// Replaces the key's newest version. `false` on a write-write
    /// conflict, on a missing key, or when the key is deleted.
    pub fn update(&self, key: u64, data: &[u8], snapshot: &SnapshotDescriptor) -> Result<bool> {
        let _guard = crossbeam_epoch::pin();
        if self.index.get(key).is_none() {
            return Ok(false);
        }
        let ptr = self
            .update_log
            .append(UpdateRecord::size_for(data.len()), LOG_UPDATE)?;
        let page = self.arena.page(ptr.page());
        UpdateRecord::init(&page, ptr.offset(), key, snapshot.version(), data);
        let result = self.attach_entry(key, ptr, snapshot);
        page.seal_entry(ptr.offset());
        result
    }

    /// Appends a tombstone version. Same failure modes as [`Table::update`].
    pub fn remove(&self, key: u64, snapshot: &SnapshotDescriptor) -> Result<bool> {
        let _guard = crossbeam_epoch::pin();
        if self.index.get(key).is_none() {
            return Ok(false);
        }
        let ptr = self
            .update_log
            .append(crate::record::log_entry::DELETE_SIZE, LOG_DELETE)?;
        let page = self.arena.page(ptr.page());
        DeleteRecord::init(&page, ptr.offset(), key, snapshot.version());
        let result = self.attach_entry(key, ptr, snapshot);
        page.seal_entry(ptr.offset());
        result
    }

    fn attach_entry(
        &self,
        key: u64,
        entry: RecordPtr,
        snapshot: &SnapshotDescriptor,
    ) -> Result<bool> {
        loop {
            let Some(head) = self.index.get(key) else {
                return Ok(false);
            };
            match attach(&self.arena, head, entry, snapshot, AttachGate::RequireLive) {
                AttachOutcome::Attached => return Ok(true),
                AttachOutcome::Conflict => {
                    debug!(key, table = %self.name, "write.conflict");
                    return Ok(false);
                }
                AttachOutcome::Gated | AttachOutcome::Invalid => return Ok(false),
                AttachOutcome::HeadGone => continue,
            }
        }
    }

    /// Withdraws the snapshot's own topmost version of `key`. Idempotent:
    /// reverting a version that is not on top leaves the chain unchanged.
    pub fn revert(&self, key: u64, snapshot: &SnapshotDescriptor) -> Result<bool> {
        let _guard = crossbeam_epoch::pin();
        loop {
            // Re-resolved every attempt: a concurrent GC pass may re-point
            // the index entry while we race it.
            let Some(head_ptr) = self.index.get(key) else {
                return Ok(false);
            };
            let head = ChainHead::resolve(&self.arena, head_ptr);
            let (cell, observed, anchor) = match chase(&self.arena, &head) {
                Chase::Resolved {
                    cell,
                    observed,
                    anchor,
                } => (cell, observed, anchor),
                Chase::Dropped => return Ok(false),
            };

            if observed.is_null() {
                match ChainHead::resolve(&self.arena, anchor).view() {
                    RecordView::Insert(insert) => {
                        if insert.version() == snapshot.version() {
                            // An unchained insert is withdrawn wholesale;
                            // the orphaned entry goes with the journal. A
                            // failed erase means GC re-pointed the key —
                            // start over against the replacement record.
                            if !self.index.erase(key, head_ptr) {
                                continue;
                            }
                        }
                    }
                    RecordView::MultiRow(row) => row.revert(snapshot.version()),
                    RecordView::MultiCol(col) => col.revert(snapshot.version()),
                    _ => unreachable!("chain heads are inserts or consolidated records"),
                }
                return Ok(true);
            }

            let (version, previous) = match view(&self.arena, observed) {
                RecordView::Update(update) => (update.version(), update.previous()),
                RecordView::Delete(delete) => (delete.version(), delete.previous()),
                _ => unreachable!("newest cells only name update or delete entries"),
            };
            if version != snapshot.version() {
                return Ok(true);
            }
            // Unlink the entry: the chain continues at the previous log
            // entry, or collapses back onto the head record.
            let unlink_to = match view(&self.arena, previous) {
                RecordView::Update(_) | RecordView::Delete(_) => previous,
                _ => RecordPtr::NULL,
            };
            if cell.compare_exchange(observed, unlink_to) {
                return Ok(true);
            }
        }
    }

    /// Splits the key space into `num_threads` partitions for parallel
    /// scans of the newest live versions.
    pub fn start_scan(&self, num_threads: usize) -> Vec<ScanPartition> {
        let _guard = crossbeam_epoch::pin();
        let num_threads = num_threads.max(1);
        let keys: Vec<u64> = self
            .index
            .entries()
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        let chunk = keys.len().div_ceil(num_threads).max(1);
        let mut partitions: Vec<ScanPartition> = keys
            .chunks(chunk)
            .map(|part| ScanPartition {
                arena: Arc::clone(&self.arena),
                index: Arc::clone(&self.index),
                keys: part.to_vec(),
                position: 0,
            })
            .collect();
        while partitions.len() < num_threads {
            partitions.push(ScanPartition {
                arena: Arc::clone(&self.arena),
                index: Arc::clone(&self.index),
                keys: Vec::new(),
                position: 0,
            });
        }
        partitions
    }

    /// Consolidates version chains, dropping everything invisible below
    /// `min_version`. See [`crate::gc`].
    pub fn run_gc(&self, min_version: u64) -> Result<GcStats> {
        let _pass = self.gc_lock.lock();
        gc::run(self, min_version)
    }

    pub fn stats(&self) -> TableStats {
        let _guard = crossbeam_epoch::pin();
        TableStats {
            name: self.name.clone(),
            keys: self.index.len(),
            insert_log_pages: self.insert_log.pages().len(),
            update_log_pages: self.update_log.page_count(),
        }
    }
}

/// One slice of a partitioned scan, yielding the newest live version per
/// key. Keys are re-resolved through the index on every step, so a scan
/// stays valid across concurrent writes and GC passes; keys dropped in
/// the meantime are skipped.
pub struct ScanPartition {
    arena: Arc<PageArena>,
    index: Arc<dyn KeyIndex>,
    keys: Vec<u64>,
    position: usize,
}

/// A key's newest live version as seen by a scan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanEntry {
    pub key: u64,
    pub version: u64,
    pub data: Vec<u8>,
}

impl Iterator for ScanPartition {
    type Item = ScanEntry;

    fn next(&mut self) -> Option<ScanEntry> {
        let _guard = crossbeam_epoch::pin();
        while self.position < self.keys.len() {
            let key = self.keys[self.position];
            self.position += 1;
            let Some(head) = self.index.get(key) else {
                continue;
            };
            if let Some(newest) = read_newest(&self.arena, head) {
                if let Some(data) = newest.data {
                    return Some(ScanEntry {
                        key,
                        version: newest.version,
                        data,
                    });
                }
            }
        }
        None
    }
}
