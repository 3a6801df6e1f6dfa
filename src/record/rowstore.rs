//! Row-layout consolidated records.
//!
//! One record holds every retained version of a single key: a 24-byte
//! record header (key, newest cell, version count), the version numbers in
//! descending order, `n + 1` signed byte offsets delimiting the packed
//! payloads, then the payload bytes. A zero-length extent is a tombstone;
//! a negated offset marks the version reverted until the next GC pass.

use std::sync::Arc;

use crate::alloc::{PageArena, PageRef};
use crate::error::{Result, StoreError};
use crate::log::page::{entry_size, Page, PageKind};
use crate::record::{
    CellRef, HeadState, Placement, RecordPtr, VisibleVersion, MULTI_VERSION_RECORD,
};
use crate::snapshot::SnapshotDescriptor;

/// Record-header bytes (key, newest, count word) excluding the entry
/// header.
pub const ROW_RECORD_HEADER: u32 = 24;

const KEY: u32 = 8;
const NEWEST: u32 = 16;
const COUNT: u32 = 24;
const VERSIONS: u32 = 32;

/// A version retained by consolidation; `None` payload is a tombstone.
pub type VersionSlice<'a> = &'a [(u64, Option<Vec<u8>>)];

pub struct RowRecord {
    page: Arc<Page>,
    offset: u32,
}

impl RowRecord {
    pub fn at(page: Arc<Page>, offset: u32) -> Self {
        Self { page, offset }
    }

    /// Entry payload size needed to consolidate `versions`.
    pub fn size_for(versions: VersionSlice<'_>) -> u32 {
        let n = versions.len() as u32;
        let payload: usize = versions
            .iter()
            .map(|(_, data)| data.as_ref().map_or(0, Vec::len))
            .sum();
        ROW_RECORD_HEADER + 8 * n + 4 * (n + 1) + payload as u32
    }

    /// Lays the record out in a freshly claimed entry. `versions` must be
    /// sorted by version descending, newest first.
    pub fn write_into(page: &Page, offset: u32, key: u64, versions: VersionSlice<'_>) {
        let n = versions.len() as u32;
        debug_assert!(n > 0, "a consolidated record holds at least one version");
        debug_assert!(versions.windows(2).all(|w| w[0].0 > w[1].0));
        page.write_u64(offset + KEY, key);
        page.write_u64(offset + NEWEST, 0);
        page.write_u64(offset + COUNT, n as u64);
        let offsets_base = VERSIONS + 8 * n;
        let mut cursor = offsets_base + 4 * (n + 1);
        for (i, (version, data)) in versions.iter().enumerate() {
            page.write_u64(offset + VERSIONS + 8 * i as u32, *version);
            page.write_u32(offset + offsets_base + 4 * i as u32, cursor);
            if let Some(data) = data {
                page.write_bytes(offset + cursor, data);
                cursor += data.len() as u32;
            }
        }
        page.write_u32(offset + offsets_base + 4 * n, cursor);
    }

    pub fn key(&self) -> u64 {
        self.page.read_u64(self.offset + KEY)
    }

    pub fn count(&self) -> u32 {
        self.page.read_u64(self.offset + COUNT) as u32
    }

    pub fn newest_cell(&self) -> CellRef {
        CellRef {
            page: Arc::clone(&self.page),
            offset: self.offset + NEWEST,
        }
    }

    pub fn version_at(&self, index: u32) -> u64 {
        debug_assert!(index < self.count());
        self.page.read_u64(self.offset + VERSIONS + 8 * index)
    }

    fn offset_slot(&self, index: u32) -> u32 {
        self.offset + VERSIONS + 8 * self.count() + 4 * index
    }

    fn raw_offset(&self, index: u32) -> i32 {
        self.page.read_u32(self.offset_slot(index)) as i32
    }

    /// Payload extent of version `index`: page offset, length, reverted.
    pub fn extent(&self, index: u32) -> (u32, usize, bool) {
        let raw = self.raw_offset(index);
        let reverted = raw < 0;
        let start = raw.unsigned_abs();
        let end = self.raw_offset(index + 1).unsigned_abs();
        (self.offset + start, (end - start) as usize, reverted)
    }

    pub fn payload_at(&self, index: u32) -> Option<Vec<u8>> {
        let (start, len, _) = self.extent(index);
        if len == 0 {
            None
        } else {
            Some(self.page.read_bytes(start, len))
        }
    }

    pub fn find_visible(
        &self,
        snapshot: &SnapshotDescriptor,
        mut is_newest: bool,
    ) -> Option<VisibleVersion> {
        for index in 0..self.count() {
            let (start, len, reverted) = self.extent(index);
            if reverted {
                continue;
            }
            let version = self.version_at(index);
            if snapshot.in_read_set(version) {
                let data = if len == 0 {
                    None
                } else {
                    Some(self.page.read_bytes(start, len))
                };
                return Some(VisibleVersion {
                    data,
                    version,
                    is_newest,
                });
            }
            is_newest = false;
        }
        None
    }

    /// Newest non-reverted version of the record itself.
    pub fn newest_version(&self) -> Option<VisibleVersion> {
        for index in 0..self.count() {
            let (start, len, reverted) = self.extent(index);
            if reverted {
                continue;
            }
            let data = if len == 0 {
                None
            } else {
                Some(self.page.read_bytes(start, len))
            };
            return Some(VisibleVersion {
                data,
                version: self.version_at(index),
                is_newest: true,
            });
        }
        None
    }

    pub fn head_state(&self) -> HeadState {
        for index in 0..self.count() {
            let (_, len, reverted) = self.extent(index);
            if reverted {
                continue;
            }
            return HeadState::Version(self.version_at(index), len == 0);
        }
        HeadState::AllReverted
    }

    /// Marks the topmost version reverted when it matches `version`.
    /// Idempotent: a mismatched or already-reverted top is left alone.
    pub fn revert(&self, version: u64) {
        for index in 0..self.count() {
            let (_, _, reverted) = self.extent(index);
            if reverted {
                continue;
            }
            if self.version_at(index) == version {
                self.page.update_u32(self.offset_slot(index), |lane| {
                    let raw = lane as i32;
                    if raw > 0 {
                        (-raw) as u32
                    } else {
                        lane
                    }
                });
            }
            return;
        }
    }

    /// Versions as (version, payload) pairs, skipping reverted slots.
    pub fn live_versions(&self) -> Vec<(u64, Option<Vec<u8>>)> {
        let mut out = Vec::with_capacity(self.count() as usize);
        for index in 0..self.count() {
            let (start, len, reverted) = self.extent(index);
            if reverted {
                continue;
            }
            let data = if len == 0 {
                None
            } else {
                Some(self.page.read_bytes(start, len))
            };
            out.push((self.version_at(index), data));
        }
        out
    }

    pub fn any_reverted(&self) -> bool {
        (0..self.count()).any(|index| self.extent(index).2)
    }
}

/// Lays consolidated row records out as ordinary tagged log entries,
/// rolling to a fresh page whenever the current one fills up.
pub struct RowPageBuilder {
    arena: Arc<PageArena>,
    pages: Vec<(PageRef, Arc<Page>)>,
    placements: Vec<Placement>,
}

impl RowPageBuilder {
    pub fn new(arena: Arc<PageArena>) -> Self {
        Self {
            arena,
            pages: Vec::new(),
            placements: Vec::new(),
        }
    }

    /// Consolidates one key. `versions` must be descending and non-empty;
    /// fails only when the record cannot fit a page by itself.
    pub fn stage(&mut self, key: u64, versions: Vec<(u64, Option<Vec<u8>>)>) -> Result<()> {
        let size = RowRecord::size_for(&versions);
        if entry_size(size) > self.arena.max_entry_size() {
            return Err(StoreError::EntryTooLarge {
                size: entry_size(size) as usize,
                max: self.arena.max_entry_size() as usize,
            });
        }

        let offset = match self.pages.last().and_then(|(_, page)| {
            page.append(size, MULTI_VERSION_RECORD)
        }) {
            Some(offset) => offset,
            None => {
                let (page_ref, page) = self
                    .arena
                    .allocate(PageKind::Entries)
                    .ok_or(StoreError::OutOfMemory)?;
                self.pages.push((page_ref, page));
                let (_, page) = self.pages.last().expect("page just pushed");
                page.append(size, MULTI_VERSION_RECORD)
                    .expect("fresh page holds a validated record")
            }
        };
        let (page_ref, page) = self.pages.last().expect("at least one page");
        RowRecord::write_into(page, offset, key, &versions);
        page.seal_entry(offset);
        self.placements.push(Placement {
            key,
            ptr: RecordPtr::new(*page_ref, offset),
        });
        Ok(())
    }

    /// Seals and links the built pages, handing back the placements.
    pub fn finish(mut self) -> Result<(Vec<(PageRef, Arc<Page>)>, Vec<Placement>)> {
        let pages = std::mem::take(&mut self.pages);
        let placements = std::mem::take(&mut self.placements);
        for (_, page) in &pages {
            page.seal();
        }
        crate::log::link_chain(&pages);
        Ok((pages, placements))
    }
}

impl Drop for RowPageBuilder {
    fn drop(&mut self) {
        // An abandoned build never published its pages; hand them back.
        for (page_ref, _) in self.pages.drain(..) {
            self.arena.free_now(page_ref);
        }
    }
}
