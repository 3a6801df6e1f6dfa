use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Hard engine faults.
///
/// Recoverable outcomes (write-write conflict, duplicate key, invisible
/// version, tombstone) are reported through plain `bool`/`Option` returns;
/// only conditions the caller cannot resolve by retrying with a fresh
/// snapshot surface here.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("page arena exhausted")]
    OutOfMemory,
    #[error("entry of {size} bytes exceeds the page capacity of {max}")]
    EntryTooLarge { size: usize, max: usize },
    #[error("key index is full")]
    IndexFull,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("configuration parse error: {0}")]
    ConfigParse(String),
    #[error("table {0:?} already exists")]
    TableExists(String),
    #[error("unknown table id {0}")]
    UnknownTable(u64),
}
