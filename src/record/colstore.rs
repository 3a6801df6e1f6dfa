//! Column-map consolidated records.
//!
//! A whole page clusters the retained versions of many keys:
//!
//! - header: record count (u32) plus padding,
//! - key-version column: `count` pairs of `{key, version}`, sorted by key
//!   then version descending,
//! - newest-pointer column: `count` atomic words, valid only at the first
//!   slot of each key's cluster,
//! - var-size-length column: `count^` (count rounded up to even) signed
//!   32-bit lengths — zero marks a tombstone, a negative value a reverted
//!   slot (negated payload size for data slots; zero has no sign, so a
//!   reverted tombstone carries the `REVERTED_TOMBSTONE` sentinel),
//! - heap-offset column: `count` page offsets into the payload heap,
//! - the var-sized heap itself.
//!
//! Tuple payloads are opaque byte strings, so there are no fixed-size
//! columns or null bitmatrix to cluster; the var-size metadata and heap
//! carry the whole record. A pointer to a record addresses its first
//! key-version pair and carries tag bit 1; readers strip the tag before
//! dereferencing.

use std::sync::Arc;

use crate::alloc::{PageArena, PageRef};
use crate::error::{Result, StoreError};
use crate::log::page::{Page, PageKind, PAGE_HEADER_SIZE};
use crate::record::{CellRef, HeadState, Placement, RecordPtr, VisibleVersion};
use crate::snapshot::SnapshotDescriptor;

const COUNT: u32 = 0;
const KV: u32 = 8;

/// Reverted marker for tombstone slots, whose length of zero cannot be
/// negated.
const REVERTED_TOMBSTONE: i32 = i32::MIN;

fn even(count: u32) -> u32 {
    (count + 1) & !1
}

fn newest_base(count: u32) -> u32 {
    KV + 16 * count
}

fn varlen_base(count: u32) -> u32 {
    newest_base(count) + 8 * count
}

fn heap_offset_base(count: u32) -> u32 {
    varlen_base(count) + 4 * even(count)
}

fn heap_base(count: u32) -> u32 {
    // Keep the heap on the word grid so whole-page layouts stay aligned.
    (heap_offset_base(count) + 4 * count + 7) & !7
}

/// Bytes a page needs for `slots` version slots and `heap` payload bytes.
fn page_footprint(slots: u32, heap: usize) -> usize {
    heap_base(slots) as usize + heap
}

/// One key's record inside a column-map page.
pub struct ColumnRecord {
    page: Arc<Page>,
    /// Byte offset of the record's first key-version pair.
    offset: u32,
}

impl ColumnRecord {
    pub fn at(page: Arc<Page>, offset: u32) -> Self {
        debug_assert_eq!(page.kind(), PageKind::ColumnCluster);
        debug_assert_eq!((offset - KV) % 16, 0);
        Self { page, offset }
    }

    fn count(&self) -> u32 {
        self.page.read_u32(COUNT)
    }

    fn index(&self) -> u32 {
        (self.offset - KV) / 16
    }

    fn key_at(&self, slot: u32) -> u64 {
        self.page.read_u64(KV + 16 * slot)
    }

    fn version_at(&self, slot: u32) -> u64 {
        self.page.read_u64(KV + 16 * slot + 8)
    }

    fn varlen_slot(&self, slot: u32) -> u32 {
        varlen_base(self.count()) + 4 * slot
    }

    fn varlen_at(&self, slot: u32) -> i32 {
        self.page.read_u32(self.varlen_slot(slot)) as i32
    }

    fn heap_offset_at(&self, slot: u32) -> u32 {
        self.page.read_u32(heap_offset_base(self.count()) + 4 * slot)
    }

    pub fn key(&self) -> u64 {
        self.key_at(self.index())
    }

    pub fn newest_cell(&self) -> CellRef {
        CellRef {
            page: Arc::clone(&self.page),
            offset: newest_base(self.count()) + 8 * self.index(),
        }
    }

    /// Slots of this record's cluster, first (newest) to last.
    fn cluster(&self) -> impl Iterator<Item = u32> + '_ {
        let key = self.key();
        let count = self.count();
        (self.index()..count).take_while(move |slot| self.key_at(*slot) == key)
    }

    fn payload(&self, slot: u32) -> Option<Vec<u8>> {
        let varlen = self.varlen_at(slot);
        let len = varlen.unsigned_abs() as usize;
        if len == 0 {
            None
        } else {
            Some(self.page.read_bytes(self.heap_offset_at(slot), len))
        }
    }

    /// Scans the cluster for the first version in the snapshot's read set.
    /// Reverted slots are skipped outright; only a cluster with no
    /// non-reverted slot at all resolves to nothing.
    pub fn find_visible(
        &self,
        snapshot: &SnapshotDescriptor,
        mut is_newest: bool,
    ) -> Option<VisibleVersion> {
        for slot in self.cluster() {
            if self.varlen_at(slot) < 0 {
                continue;
            }
            let version = self.version_at(slot);
            if snapshot.in_read_set(version) {
                return Some(VisibleVersion {
                    data: self.payload(slot),
                    version,
                    is_newest,
                });
            }
            is_newest = false;
        }
        None
    }

    pub fn newest_version(&self) -> Option<VisibleVersion> {
        for slot in self.cluster() {
            if self.varlen_at(slot) < 0 {
                continue;
            }
            return Some(VisibleVersion {
                data: self.payload(slot),
                version: self.version_at(slot),
                is_newest: true,
            });
        }
        None
    }

    pub fn head_state(&self) -> HeadState {
        for slot in self.cluster() {
            let varlen = self.varlen_at(slot);
            if varlen < 0 {
                continue;
            }
            return HeadState::Version(self.version_at(slot), varlen == 0);
        }
        HeadState::AllReverted
    }

    /// Marks the topmost version reverted when it matches; idempotent.
    pub fn revert(&self, version: u64) {
        for slot in self.cluster() {
            if self.varlen_at(slot) < 0 {
                continue;
            }
            if self.version_at(slot) == version {
                self.page.update_u32(self.varlen_slot(slot), |lane| {
                    match lane as i32 {
                        raw if raw > 0 => (-raw) as u32,
                        0 => REVERTED_TOMBSTONE as u32,
                        _ => lane,
                    }
                });
            }
            return;
        }
    }

    pub fn live_versions(&self) -> Vec<(u64, Option<Vec<u8>>)> {
        self.cluster()
            .filter(|slot| self.varlen_at(*slot) >= 0)
            .map(|slot| (self.version_at(slot), self.payload(slot)))
            .collect()
    }

    pub fn any_reverted(&self) -> bool {
        self.cluster().any(|slot| self.varlen_at(slot) < 0)
    }
}

struct Staged {
    key: u64,
    versions: Vec<(u64, Option<Vec<u8>>)>,
}

/// Accumulates consolidated keys and lays them out page by page. Keys must
/// be staged in ascending key order; a page is cut whenever the next
/// record would overflow it.
pub struct ColumnPageBuilder {
    arena: Arc<PageArena>,
    staged: Vec<Staged>,
    staged_slots: u32,
    staged_heap: usize,
    pages: Vec<(PageRef, Arc<Page>)>,
    placements: Vec<Placement>,
}

impl ColumnPageBuilder {
    pub fn new(arena: Arc<PageArena>) -> Self {
        Self {
            arena,
            staged: Vec::new(),
            staged_slots: 0,
            staged_heap: 0,
            pages: Vec::new(),
            placements: Vec::new(),
        }
    }

    fn page_capacity(&self) -> usize {
        self.arena.page_size() - PAGE_HEADER_SIZE
    }

    /// Stages one key's retained versions (descending). Fails only when a
    /// single record cannot fit a page by itself.
    pub fn stage(&mut self, key: u64, versions: Vec<(u64, Option<Vec<u8>>)>) -> Result<()> {
        debug_assert!(!versions.is_empty());
        debug_assert!(self.staged.last().map_or(true, |prev| prev.key < key));
        let slots = versions.len() as u32;
        let heap: usize = versions
            .iter()
            .map(|(_, data)| data.as_ref().map_or(0, Vec::len))
            .sum();
        if page_footprint(slots, heap) > self.page_capacity() {
            return Err(StoreError::EntryTooLarge {
                size: page_footprint(slots, heap),
                max: self.page_capacity(),
            });
        }
        if page_footprint(self.staged_slots + slots, self.staged_heap + heap)
            > self.page_capacity()
        {
            self.flush()?;
        }
        self.staged_slots += slots;
        self.staged_heap += heap;
        self.staged.push(Staged { key, versions });
        Ok(())
    }

    /// Lays the staged records out into a fresh sealed column page.
    fn flush(&mut self) -> Result<()> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let (page_ref, page) = self
            .arena
            .allocate(PageKind::ColumnCluster)
            .ok_or(StoreError::OutOfMemory)?;

        let count = self.staged_slots;
        page.write_u32(COUNT, count);
        let mut slot = 0u32;
        let mut heap_cursor = heap_base(count);
        for record in self.staged.drain(..) {
            let first_slot = slot;
            for (version, data) in &record.versions {
                page.write_u64(KV + 16 * slot, record.key);
                page.write_u64(KV + 16 * slot + 8, *version);
                page.write_u64(newest_base(count) + 8 * slot, 0);
                let len = data.as_ref().map_or(0, Vec::len) as u32;
                page.write_u32(varlen_base(count) + 4 * slot, len);
                page.write_u32(heap_offset_base(count) + 4 * slot, heap_cursor);
                if let Some(data) = data {
                    page.write_bytes(heap_cursor, data);
                    heap_cursor += len;
                }
                slot += 1;
            }
            let offset = KV + 16 * first_slot;
            self.placements.push(Placement {
                key: record.key,
                ptr: RecordPtr::new(page_ref, offset).tagged_column(),
            });
        }
        page.seal();
        self.pages.push((page_ref, page));
        self.staged_slots = 0;
        self.staged_heap = 0;
        Ok(())
    }

    /// Flushes the remainder and hands back the built pages (in build
    /// order, already linked) together with every record placement.
    pub fn finish(mut self) -> Result<(Vec<(PageRef, Arc<Page>)>, Vec<Placement>)> {
        self.flush()?;
        let pages = std::mem::take(&mut self.pages);
        let placements = std::mem::take(&mut self.placements);
        crate::log::link_chain(&pages);
        Ok((pages, placements))
    }
}

impl Drop for ColumnPageBuilder {
    fn drop(&mut self) {
        // An abandoned build never published its pages; hand them back.
        for (page_ref, _) in self.pages.drain(..) {
            self.arena.free_now(page_ref);
        }
    }
}
