//! Multi-version record family.
//!
//! Every record is addressed by a [`RecordPtr`] whose low two bits carry
//! tags: bit 0 marks a forwarded pointer installed by the garbage
//! collector, bit 1 marks a record clustered in a column-map page.
//! Untagged pointers name a log entry; the entry header's type tag selects
//! the shape. Dispatch is closed over the four wire shapes; an unknown tag
//! means the arena has been corrupted and the process aborts.

pub mod colstore;
pub mod log_entry;
pub mod rowstore;

use std::sync::Arc;

use crate::alloc::{PageArena, PageRef};
use crate::log::page::Page;
use crate::snapshot::SnapshotDescriptor;
use colstore::ColumnRecord;
use log_entry::{DeleteRecord, InsertRecord, UpdateRecord};
use rowstore::RowRecord;

/// Entry type tags.
pub const LOG_INSERT: u32 = 1;
pub const LOG_UPDATE: u32 = 2;
pub const LOG_DELETE: u32 = 3;
pub const MULTI_VERSION_RECORD: u32 = 4;

const TAG_FORWARD: u64 = 0b01;
const TAG_COLUMN: u64 = 0b10;
const TAG_MASK: u64 = 0b11;

/// Packed record handle: page reference in the high word, byte offset in
/// the low word. Offsets are 8-aligned, freeing the two tag bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RecordPtr(pub u64);

impl RecordPtr {
    pub const NULL: RecordPtr = RecordPtr(0);

    /// Forwarding sentinel with a null target: the key was dropped by GC
    /// and concurrent operations must restart from the index.
    pub const DROPPED: RecordPtr = RecordPtr(TAG_FORWARD);

    pub fn new(page: PageRef, offset: u32) -> Self {
        debug_assert_eq!(offset % 8, 0);
        Self(((page.0 as u64) << 32) | offset as u64)
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn page(self) -> PageRef {
        PageRef((self.0 >> 32) as u32)
    }

    pub fn offset(self) -> u32 {
        (self.0 as u32) & !(TAG_MASK as u32)
    }

    pub fn is_forwarded(self) -> bool {
        self.0 & TAG_FORWARD != 0
    }

    pub fn is_column(self) -> bool {
        self.0 & TAG_COLUMN != 0
    }

    /// The same location with both tag bits cleared.
    pub fn untagged(self) -> Self {
        Self(self.0 & !TAG_MASK)
    }

    pub fn tagged_column(self) -> Self {
        Self(self.0 | TAG_COLUMN)
    }

    /// Marks a pointer as a GC forward to a replacement record.
    pub fn tagged_forward(self) -> Self {
        Self(self.0 | TAG_FORWARD)
    }

    /// Strips only the forward bit, preserving the column tag.
    fn forward_target(self) -> Self {
        Self(self.0 & !TAG_FORWARD)
    }
}

/// Location of an atomic cell inside a page.
#[derive(Clone)]
pub struct CellRef {
    pub page: Arc<Page>,
    pub offset: u32,
}

impl CellRef {
    pub fn load(&self) -> RecordPtr {
        RecordPtr(
            self.page
                .atomic_at(self.offset)
                .load(std::sync::atomic::Ordering::Acquire),
        )
    }

    pub fn compare_exchange(&self, expected: RecordPtr, new: RecordPtr) -> bool {
        self.page
            .atomic_at(self.offset)
            .compare_exchange(
                expected.0,
                new.0,
                std::sync::atomic::Ordering::AcqRel,
                std::sync::atomic::Ordering::Acquire,
            )
            .is_ok()
    }
}

/// Where a consolidated key landed after a GC build.
pub struct Placement {
    pub key: u64,
    /// Pointer suitable for the index, previous links, and forwarding
    /// (column-tagged for column records).
    pub ptr: RecordPtr,
}

/// Closed dispatch over the record shapes.
pub enum RecordView {
    Insert(InsertRecord),
    Update(UpdateRecord),
    Delete(DeleteRecord),
    MultiRow(RowRecord),
    MultiCol(ColumnRecord),
}

/// Resolves a handle to its shape. Aborts on a corrupted type tag.
pub fn view(arena: &PageArena, ptr: RecordPtr) -> RecordView {
    debug_assert!(!ptr.is_null() && !ptr.is_forwarded());
    let location = ptr.untagged();
    let page = arena.page(location.page());
    if ptr.is_column() {
        return RecordView::MultiCol(ColumnRecord::at(page, location.offset()));
    }
    let header = page
        .atomic_at(location.offset())
        .load(std::sync::atomic::Ordering::Acquire);
    let tag = (header >> 32) as u32;
    let size = (header as u32) >> 1;
    match tag {
        LOG_INSERT => RecordView::Insert(InsertRecord::at(page, location.offset(), size)),
        LOG_UPDATE => RecordView::Update(UpdateRecord::at(page, location.offset(), size)),
        LOG_DELETE => RecordView::Delete(DeleteRecord::at(page, location.offset())),
        MULTI_VERSION_RECORD => RecordView::MultiRow(RowRecord::at(page, location.offset())),
        _ => panic!("corrupted record type tag {tag} at page {}", location.page().0),
    }
}

/// A version resolved against a snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VisibleVersion {
    /// `None` marks a tombstone.
    pub data: Option<Vec<u8>>,
    pub version: u64,
    pub is_newest: bool,
}

/// Chain heads are the shapes an index value may name.
pub struct ChainHead {
    pub ptr: RecordPtr,
    view: RecordView,
}

/// Latest committed state of a chain head, before any chained entries.
pub enum HeadState {
    /// Version number and whether it is a tombstone.
    Version(u64, bool),
    /// Every slot of the record is reverted.
    AllReverted,
}

impl ChainHead {
    pub fn resolve(arena: &PageArena, ptr: RecordPtr) -> ChainHead {
        let view = view(arena, ptr);
        debug_assert!(matches!(
            view,
            RecordView::Insert(_) | RecordView::MultiRow(_) | RecordView::MultiCol(_)
        ));
        ChainHead { ptr, view }
    }

    /// The newest cell this record publishes through.
    pub fn newest_cell(&self) -> CellRef {
        match &self.view {
            RecordView::Insert(insert) => insert.newest_cell(),
            RecordView::MultiRow(row) => row.newest_cell(),
            RecordView::MultiCol(col) => col.newest_cell(),
            _ => unreachable!("chain heads are inserts or consolidated records"),
        }
    }

    /// Newest version stored in the head record itself.
    pub fn state(&self) -> HeadState {
        match &self.view {
            RecordView::Insert(insert) => HeadState::Version(insert.version(), false),
            RecordView::MultiRow(row) => row.head_state(),
            RecordView::MultiCol(col) => col.head_state(),
            _ => unreachable!("chain heads are inserts or consolidated records"),
        }
    }

    pub fn view(&self) -> &RecordView {
        &self.view
    }
}

/// Result of chasing a newest pointer through GC forwards.
pub enum Chase {
    Resolved {
        /// The live newest cell of the chain.
        cell: CellRef,
        /// Value the cell held.
        observed: RecordPtr,
        /// The record owning that cell: the original head, or the
        /// replacement record the chain was forwarded to.
        anchor: RecordPtr,
    },
    /// The chain ends in a dropped-key sentinel installed by GC.
    Dropped,
}

/// Follows forwarded newest pointers from `head` until a live cell is
/// found. Each forward names the replacement record; the walk continues
/// on that record's own newest cell.
pub fn chase(arena: &PageArena, head: &ChainHead) -> Chase {
    let mut anchor = head.ptr;
    let mut cell = head.newest_cell();
    loop {
        let value = cell.load();
        if !value.is_forwarded() {
            return Chase::Resolved {
                cell,
                observed: value,
                anchor,
            };
        }
        let target = value.forward_target();
        if target.untagged().is_null() {
            return Chase::Dropped;
        }
        anchor = target;
        cell = ChainHead::resolve(arena, target).newest_cell();
    }
}

/// Snapshot-visibility resolution over a whole chain.
///
/// Walks from the newest published version toward the oldest, clearing
/// `is_newest` whenever a version outside the snapshot's read set is
/// passed over. Reverted slots are skipped without affecting `is_newest`;
/// a chain with no visible version resolves to `None`.
pub fn read_chain(
    arena: &PageArena,
    head_ptr: RecordPtr,
    snapshot: &SnapshotDescriptor,
) -> Option<VisibleVersion> {
    let head = ChainHead::resolve(arena, head_ptr);
    let (observed, anchor) = match chase(arena, &head) {
        Chase::Resolved {
            observed, anchor, ..
        } => (observed, anchor),
        Chase::Dropped => return None,
    };

    let mut is_newest = true;
    let mut cursor = if observed.is_null() { anchor } else { observed };

    loop {
        match view(arena, cursor) {
            RecordView::Update(update) => {
                if snapshot.in_read_set(update.version()) {
                    return Some(VisibleVersion {
                        data: Some(update.payload()),
                        version: update.version(),
                        is_newest,
                    });
                }
                is_newest = false;
                cursor = update.previous();
            }
            RecordView::Delete(delete) => {
                if snapshot.in_read_set(delete.version()) {
                    return Some(VisibleVersion {
                        data: None,
                        version: delete.version(),
                        is_newest,
                    });
                }
                is_newest = false;
                cursor = delete.previous();
            }
            RecordView::Insert(insert) => {
                if snapshot.in_read_set(insert.version()) {
                    return Some(VisibleVersion {
                        data: Some(insert.payload()),
                        version: insert.version(),
                        is_newest,
                    });
                }
                return None;
            }
            RecordView::MultiRow(row) => return row.find_visible(snapshot, is_newest),
            RecordView::MultiCol(col) => return col.find_visible(snapshot, is_newest),
        }
        if cursor.is_null() {
            return None;
        }
    }
}

/// Newest committed state of a chain, ignoring snapshots. `None` when the
/// key holds no version at all; a `VisibleVersion` with `data: None` when
/// the newest version is a tombstone.
pub fn read_newest(arena: &PageArena, head_ptr: RecordPtr) -> Option<VisibleVersion> {
    let head = ChainHead::resolve(arena, head_ptr);
    let (observed, anchor) = match chase(arena, &head) {
        Chase::Resolved {
            observed, anchor, ..
        } => (observed, anchor),
        Chase::Dropped => return None,
    };
    if !observed.is_null() {
        return Some(match view(arena, observed) {
            RecordView::Update(update) => VisibleVersion {
                data: Some(update.payload()),
                version: update.version(),
                is_newest: true,
            },
            RecordView::Delete(delete) => VisibleVersion {
                data: None,
                version: delete.version(),
                is_newest: true,
            },
            _ => unreachable!("newest cells only name update or delete entries"),
        });
    }
    match ChainHead::resolve(arena, anchor).view() {
        RecordView::Insert(insert) => Some(VisibleVersion {
            data: Some(insert.payload()),
            version: insert.version(),
            is_newest: true,
        }),
        RecordView::MultiRow(row) => row.newest_version(),
        RecordView::MultiCol(col) => col.newest_version(),
        _ => unreachable!(),
    }
}

/// How an attachment relates to the existing newest version.
pub enum AttachGate {
    /// update / remove: the key must hold a live (non-deleted) version.
    RequireLive,
    /// insert falling back over a duplicate: only valid over a tombstone.
    RequireDeleted,
}

/// Outcome of trying to link a new version onto a chain.
pub enum AttachOutcome {
    Attached,
    /// The chain's latest version is outside the writer's read set.
    Conflict,
    /// Gate violation: the key is deleted (RequireLive) or live
    /// (RequireDeleted).
    Gated,
    /// Every version of the record is reverted; the key is effectively
    /// absent.
    Invalid,
    /// GC dropped the key while we were attaching; retry from the index.
    HeadGone,
}

/// The update / delete attachment protocol: conflict-check against the
/// chain's latest version, link `previous`, CAS the anchoring record's
/// newest cell. Retries internally — including across GC forwards — until
/// it succeeds or detects a true conflict.
pub fn attach(
    arena: &PageArena,
    head_ptr: RecordPtr,
    new_entry: RecordPtr,
    snapshot: &SnapshotDescriptor,
    gate: AttachGate,
) -> AttachOutcome {
    let head = ChainHead::resolve(arena, head_ptr);

    loop {
        let (cell, observed, anchor) = match chase(arena, &head) {
            Chase::Resolved {
                cell,
                observed,
                anchor,
            } => (cell, observed, anchor),
            Chase::Dropped => return AttachOutcome::HeadGone,
        };

        let latest = if observed.is_null() {
            ChainHead::resolve(arena, anchor).state()
        } else {
            match view(arena, observed) {
                RecordView::Update(update) => HeadState::Version(update.version(), false),
                RecordView::Delete(delete) => HeadState::Version(delete.version(), true),
                _ => unreachable!("newest cells only name update or delete entries"),
            }
        };

        match latest {
            HeadState::Version(version, is_delete) => {
                if !snapshot.in_read_set(version) {
                    return AttachOutcome::Conflict;
                }
                match gate {
                    AttachGate::RequireLive if is_delete => return AttachOutcome::Gated,
                    AttachGate::RequireDeleted if !is_delete => return AttachOutcome::Gated,
                    _ => {}
                }
            }
            HeadState::AllReverted => match gate {
                // No committed version to conflict with; a re-insert may
                // attach, an update has nothing to update.
                AttachGate::RequireDeleted => {}
                AttachGate::RequireLive => return AttachOutcome::Invalid,
            },
        }

        let previous = if observed.is_null() { anchor } else { observed };
        match view(arena, new_entry) {
            RecordView::Update(update) => update.write_previous(previous),
            RecordView::Delete(delete) => delete.write_previous(previous),
            _ => unreachable!("only update and delete entries attach to chains"),
        }

        if cell.compare_exchange(observed, new_entry) {
            return AttachOutcome::Attached;
        }
    }
}
