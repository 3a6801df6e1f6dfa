//! Engine facade: table registry, transaction versions, background GC.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::alloc::{ArenaStats, PageArena};
use crate::config::Config;
use crate::error::{Result, StoreError};
use crate::gc::GcStats;
use crate::snapshot::{CommitTracker, SnapshotDescriptor};
use crate::table::{GetResult, ScanPartition, Table, TableStats};

/// Point-in-time usage counters for the whole store.
#[derive(Clone, Debug)]
pub struct StoreStats {
    pub arena: ArenaStats,
    pub tables: Vec<TableStats>,
}

struct Shared {
    config: Config,
    arena: Arc<PageArena>,
    commit: CommitTracker,
    tables: RwLock<Vec<Arc<Table>>>,
    names: RwLock<FxHashMap<String, u64>>,
}

impl Shared {
    fn table(&self, table_id: u64) -> Result<Arc<Table>> {
        self.tables
            .read()
            .get(table_id as usize)
            .cloned()
            .ok_or(StoreError::UnknownTable(table_id))
    }

    fn run_gc(&self, min_version: u64) -> Result<Vec<GcStats>> {
        let tables: Vec<_> = self.tables.read().clone();
        tables.iter().map(|table| table.run_gc(min_version)).collect()
    }
}

/// The multi-version storage engine.
///
/// Owns the page arena, the transaction version tracker, and the table
/// registry. With `gc.enabled` a background thread periodically
/// consolidates version chains; [`Store::force_gc`] runs a pass inline.
pub struct Store {
    shared: Arc<Shared>,
    gc_worker: Option<GcWorker>,
}

impl Store {
    pub fn open(config: Config) -> Result<Store> {
        config.validate()?;
        let arena = Arc::new(PageArena::new(config.total_memory, config.page_size));
        let shared = Arc::new(Shared {
            arena,
            commit: CommitTracker::new(),
            tables: RwLock::new(Vec::new()),
            names: RwLock::new(FxHashMap::default()),
            config,
        });
        let gc_worker = if shared.config.gc.enabled {
            Some(GcWorker::spawn(
                Arc::clone(&shared),
                shared.config.gc.interval(),
            ))
        } else {
            None
        };
        Ok(Store { shared, gc_worker })
    }

    /// Creates a table and returns its id.
    pub fn create_table(&self, name: &str) -> Result<u64> {
        let mut names = self.shared.names.write();
        if names.contains_key(name) {
            return Err(StoreError::TableExists(name.to_string()));
        }
        let table = Arc::new(Table::new(
            name,
            self.shared.config.storage_layout,
            Arc::clone(&self.shared.arena),
            self.shared.config.hash_capacity,
        )?);
        let mut tables = self.shared.tables.write();
        let table_id = tables.len() as u64;
        tables.push(table);
        names.insert(name.to_string(), table_id);
        debug!(name, table_id, "store.table.created");
        Ok(table_id)
    }

    pub fn table_id(&self, name: &str) -> Option<u64> {
        self.shared.names.read().get(name).copied()
    }

    /// Starts a transaction.
    pub fn begin(&self) -> SnapshotDescriptor {
        self.shared.commit.begin()
    }

    /// Makes a transaction's writes visible to later snapshots.
    pub fn commit(&self, snapshot: &SnapshotDescriptor) {
        self.shared.commit.commit(snapshot);
    }

    /// Abandons a transaction; the caller reverts its writes first.
    pub fn abort(&self, snapshot: &SnapshotDescriptor) {
        self.shared.commit.abort(snapshot);
    }

    pub fn get(
        &self,
        table_id: u64,
        key: u64,
        snapshot: &SnapshotDescriptor,
    ) -> Result<Option<GetResult>> {
        Ok(self.shared.table(table_id)?.get(key, snapshot))
    }

    pub fn get_newest(&self, table_id: u64, key: u64) -> Result<Option<(Vec<u8>, u64)>> {
        Ok(self.shared.table(table_id)?.get_newest(key))
    }

    pub fn insert(
        &self,
        table_id: u64,
        key: u64,
        data: &[u8],
        snapshot: &SnapshotDescriptor,
    ) -> Result<bool> {
        self.shared.table(table_id)?.insert(key, data, snapshot)
    }

    pub fn update(
        &self,
        table_id: u64,
        key: u64,
        data: &[u8],
        snapshot: &SnapshotDescriptor,
    ) -> Result<bool> {
        self.shared.table(table_id)?.update(key, data, snapshot)
    }

    pub fn remove(
        &self,
        table_id: u64,
        key: u64,
        snapshot: &SnapshotDescriptor,
    ) -> Result<bool> {
        self.shared.table(table_id)?.remove(key, snapshot)
    }

    pub fn revert(
        &self,
        table_id: u64,
        key: u64,
        snapshot: &SnapshotDescriptor,
    ) -> Result<bool> {
        self.shared.table(table_id)?.revert(key, snapshot)
    }

    /// Partitions a table's key space for a parallel scan.
    pub fn start_scan(&self, table_id: u64, num_threads: usize) -> Result<Vec<ScanPartition>> {
        Ok(self.shared.table(table_id)?.start_scan(num_threads))
    }

    /// Runs a GC pass over every table with an explicit cutoff.
    pub fn run_gc(&self, min_version: u64) -> Result<Vec<GcStats>> {
        self.shared.run_gc(min_version)
    }

    /// Runs a GC pass with the cutoff derived from live transactions.
    pub fn force_gc(&self) -> Result<Vec<GcStats>> {
        self.shared.run_gc(self.shared.commit.min_active_version())
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            arena: self.shared.arena.stats(),
            tables: self
                .shared
                .tables
                .read()
                .iter()
                .map(|table| table.stats())
                .collect(),
        }
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Some(worker) = self.gc_worker.take() {
            worker.shutdown();
        }
    }
}

/// Background consolidation thread: wakes on the configured interval and
/// collects with the horizon the commit tracker derives from live
/// transactions.
struct GcWorker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl GcWorker {
    fn spawn(shared: Arc<Shared>, interval: Duration) -> GcWorker {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("deltastore-gc".into())
            .spawn(move || {
                let mut next_pass = Instant::now() + interval;
                while !thread_stop.load(Ordering::Acquire) {
                    if Instant::now() < next_pass {
                        thread::sleep(Duration::from_millis(10).min(interval));
                        continue;
                    }
                    next_pass = Instant::now() + interval;
                    let min_version = shared.commit.min_active_version();
                    if let Err(err) = shared.run_gc(min_version) {
                        warn!(error = %err, "gc.worker.failed");
                    }
                }
            })
            .expect("spawning the GC worker thread");
        GcWorker {
            stop,
            handle: Some(handle),
        }
    }

    fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
