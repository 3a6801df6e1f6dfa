//! # deltastore — multi-version in-memory key-value storage engine
//!
//! deltastore stores tuples by primary key, each key carrying a chain of
//! versioned records. Readers resolve the version visible under their
//! snapshot, writers publish new versions with a single compare-and-swap
//! on the chain's newest pointer, and a garbage collector periodically
//! consolidates chains into dense multi-version records, reclaiming
//! whatever no live transaction can still see.
//!
//! ## Quick start
//!
//! ```rust
//! use deltastore::{Config, Store};
//!
//! let store = Store::open(Config::testing())?;
//! let accounts = store.create_table("accounts")?;
//!
//! let tx = store.begin();
//! store.insert(accounts, 42, b"alice", &tx)?;
//! store.commit(&tx);
//!
//! let reader = store.begin();
//! let row = store.get(accounts, 42, &reader)?.expect("committed row");
//! assert_eq!(row.data, b"alice");
//! store.commit(&reader);
//! # Ok::<(), deltastore::StoreError>(())
//! ```
//!
//! ## Architecture
//!
//! - **Journals**: lock-free append-only paged logs — a strictly ordered
//!   insert journal and an unordered update journal that also absorbs the
//!   page chains built by GC.
//! - **Record family**: insert / update / delete entries plus consolidated
//!   multi-version records in a row or column layout, dispatched by type
//!   tag from a shared pointer representation.
//! - **Write protocol**: append first, then publish through a CAS on the
//!   per-key newest pointer; write-write conflicts surface as plain
//!   `false` under snapshot isolation.
//! - **GC**: chains are copied into fresh consolidated pages, the old
//!   heads forward concurrent traffic to the replacements, and the
//!   journals are truncated back to the pass boundary.

pub mod alloc;
pub mod config;
pub mod error;
pub mod gc;
pub mod index;
pub mod log;
pub mod logging;
pub mod record;
pub mod snapshot;
pub mod store;
pub mod table;

pub use crate::config::{Config, GcConfig, StorageLayout};
pub use crate::error::{Result, StoreError};
pub use crate::gc::GcStats;
pub use crate::snapshot::{CommitTracker, SnapshotDescriptor};
pub use crate::store::{Store, StoreStats};
pub use crate::table::{GetResult, ScanEntry, ScanPartition, Table, TableStats};
