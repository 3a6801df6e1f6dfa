//! Journal-resident record shapes: the initial version of a key, chained
//! non-null versions, and tombstones.
//!
//! Field layouts relative to the entry start (all offsets 8-aligned):
//!
//! | shape  | +0 header | +8  | +16     | +24      | +32    | +40  |
//! |--------|-----------|-----|---------|----------|--------|------|
//! | insert | size/tag  | key | version | previous | newest | data |
//! | update | size/tag  | key | version | previous | data   |      |
//! | delete | size/tag  | key | version | previous |        |      |

use std::sync::Arc;

use crate::log::page::Page;
use crate::record::{CellRef, RecordPtr};

/// Record-header bytes of an insert entry (excluding the entry header).
pub const INSERT_HEADER: u32 = 32;
/// Record-header bytes of an update entry (excluding the entry header).
pub const UPDATE_HEADER: u32 = 24;
/// Payload size of a delete entry.
pub const DELETE_SIZE: u32 = 24;

const KEY: u32 = 8;
const VERSION: u32 = 16;
const PREVIOUS: u32 = 24;
const INSERT_NEWEST: u32 = 32;
const INSERT_DATA: u32 = 40;
const UPDATE_DATA: u32 = 32;

/// The initial version of a key; always the tail of its version chain and
/// the anchor of the newest pointer until GC consolidates the key.
pub struct InsertRecord {
    page: Arc<Page>,
    offset: u32,
    size: u32,
}

impl InsertRecord {
    pub fn at(page: Arc<Page>, offset: u32, size: u32) -> Self {
        Self { page, offset, size }
    }

    /// Entry payload size for `data_len` bytes of tuple data.
    pub fn size_for(data_len: usize) -> u32 {
        INSERT_HEADER + data_len as u32
    }

    /// Fills in a freshly appended entry. The newest pointer starts null;
    /// the record becomes reachable only through the index publication.
    pub fn init(page: &Page, offset: u32, key: u64, version: u64, data: &[u8]) {
        page.write_u64(offset + KEY, key);
        page.write_u64(offset + VERSION, version);
        page.write_u64(offset + PREVIOUS, 0);
        page.write_u64(offset + INSERT_NEWEST, 0);
        page.write_bytes(offset + INSERT_DATA, data);
    }

    pub fn key(&self) -> u64 {
        self.page.read_u64(self.offset + KEY)
    }

    pub fn version(&self) -> u64 {
        self.page.read_u64(self.offset + VERSION)
    }

    pub fn newest_cell(&self) -> CellRef {
        CellRef {
            page: Arc::clone(&self.page),
            offset: self.offset + INSERT_NEWEST,
        }
    }

    pub fn payload(&self) -> Vec<u8> {
        let len = (self.size - INSERT_HEADER) as usize;
        self.page.read_bytes(self.offset + INSERT_DATA, len)
    }
}

/// A chained non-null version.
pub struct UpdateRecord {
    page: Arc<Page>,
    offset: u32,
    size: u32,
}

impl UpdateRecord {
    pub fn at(page: Arc<Page>, offset: u32, size: u32) -> Self {
        Self { page, offset, size }
    }

    pub fn size_for(data_len: usize) -> u32 {
        UPDATE_HEADER + data_len as u32
    }

    pub fn init(page: &Page, offset: u32, key: u64, version: u64, data: &[u8]) {
        page.write_u64(offset + KEY, key);
        page.write_u64(offset + VERSION, version);
        page.write_u64(offset + PREVIOUS, 0);
        page.write_bytes(offset + UPDATE_DATA, data);
    }

    pub fn key(&self) -> u64 {
        self.page.read_u64(self.offset + KEY)
    }

    pub fn version(&self) -> u64 {
        self.page.read_u64(self.offset + VERSION)
    }

    pub fn previous(&self) -> RecordPtr {
        RecordPtr(self.page.read_u64(self.offset + PREVIOUS))
    }

    /// Linked right before the newest-cell CAS publishes the entry.
    pub fn write_previous(&self, previous: RecordPtr) {
        self.page.write_u64(self.offset + PREVIOUS, previous.0);
    }

    pub fn payload(&self) -> Vec<u8> {
        let len = (self.size - UPDATE_HEADER) as usize;
        self.page.read_bytes(self.offset + UPDATE_DATA, len)
    }
}

/// A tombstone version.
pub struct DeleteRecord {
    page: Arc<Page>,
    offset: u32,
}

impl DeleteRecord {
    pub fn at(page: Arc<Page>, offset: u32) -> Self {
        Self { page, offset }
    }

    pub fn init(page: &Page, offset: u32, key: u64, version: u64) {
        page.write_u64(offset + KEY, key);
        page.write_u64(offset + VERSION, version);
        page.write_u64(offset + PREVIOUS, 0);
    }

    pub fn key(&self) -> u64 {
        self.page.read_u64(self.offset + KEY)
    }

    pub fn version(&self) -> u64 {
        self.page.read_u64(self.offset + VERSION)
    }

    pub fn previous(&self) -> RecordPtr {
        RecordPtr(self.page.read_u64(self.offset + PREVIOUS))
    }

    pub fn write_previous(&self, previous: RecordPtr) {
        self.page.write_u64(self.offset + PREVIOUS, previous.0);
    }
}
