//! Chain consolidation and journal reclamation.
//!
//! A pass walks every index entry, collects the key's version chain, and
//! rewrites it into freshly built consolidated pages, dropping versions no
//! live snapshot can see. The old chain head is redirected through a
//! forwarded newest cell so concurrent writers retry against the new
//! record; once every chain has been absorbed, the journals are truncated
//! back to the pass boundary. A key whose record cannot fit a single page
//! is left for a later pass, which also postpones truncation.

use std::sync::Arc;
use std::time::Instant;

use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use tracing::{debug, info, warn};

use crate::alloc::{PageArena, PageRef};
use crate::config::StorageLayout;
use crate::error::{Result, StoreError};
use crate::log::page::{Page, PageKind};
use crate::record::colstore::ColumnPageBuilder;
use crate::record::rowstore::RowPageBuilder;
use crate::record::{
    chase, view, CellRef, ChainHead, Chase, HeadState, Placement, RecordPtr, RecordView,
};
use crate::table::Table;

/// Bound on reconciliation sweeps before truncation is postponed to the
/// next pass.
const MAX_RECONCILE_SWEEPS: usize = 3;

/// Outcome counters of one GC pass.
#[derive(Clone, Copy, Debug, Default)]
pub struct GcStats {
    pub min_version: u64,
    pub keys_examined: u64,
    pub keys_consolidated: u64,
    pub keys_dropped: u64,
    /// Keys left alone because their record exceeds a page.
    pub keys_skipped: u64,
    pub pages_built: u64,
    /// Whether the journals were truncated back to the pass boundary.
    pub truncated: bool,
    pub run_millis: u64,
}

impl GcStats {
    fn made_progress(&self) -> bool {
        self.keys_consolidated > 0 || self.keys_dropped > 0 || self.truncated
    }
}

/// A collected version chain, newest first.
struct Collected {
    versions: SmallVec<[(u64, Option<Vec<u8>>); 4]>,
    /// The final newest cell after chasing forwards.
    cell: CellRef,
    /// Value the cell held at collection time.
    observed: RecordPtr,
    /// Record owning that cell.
    anchor: RecordPtr,
    any_reverted: bool,
    /// The chain still references journal entries (its head is a log
    /// insert or chained updates exist).
    rooted_in_log: bool,
}

fn collect(arena: &Arc<PageArena>, head_ptr: RecordPtr) -> Option<Collected> {
    let head = ChainHead::resolve(arena, head_ptr);
    let (cell, observed, anchor) = match chase(arena, &head) {
        Chase::Resolved {
            cell,
            observed,
            anchor,
        } => (cell, observed, anchor),
        Chase::Dropped => return None,
    };

    let mut versions: SmallVec<[(u64, Option<Vec<u8>>); 4]> = SmallVec::new();
    let mut any_reverted = false;
    let mut rooted_in_log = !observed.is_null();
    let mut push = |version: u64, data: Option<Vec<u8>>, out: &mut SmallVec<_>| {
        // A transaction that wrote the same key twice leaves adjacent
        // duplicates; the newer entry wins.
        if out.last().map(|(v, _): &(u64, _)| *v) != Some(version) {
            out.push((version, data));
        }
    };

    let mut cursor = if observed.is_null() { anchor } else { observed };
    loop {
        match view(arena, cursor) {
            RecordView::Update(update) => {
                push(update.version(), Some(update.payload()), &mut versions);
                cursor = update.previous();
            }
            RecordView::Delete(delete) => {
                push(delete.version(), None, &mut versions);
                cursor = delete.previous();
            }
            RecordView::Insert(insert) => {
                rooted_in_log = true;
                push(insert.version(), Some(insert.payload()), &mut versions);
                break;
            }
            RecordView::MultiRow(row) => {
                any_reverted |= row.any_reverted();
                for (version, data) in row.live_versions() {
                    push(version, data, &mut versions);
                }
                break;
            }
            RecordView::MultiCol(col) => {
                any_reverted |= col.any_reverted();
                for (version, data) in col.live_versions() {
                    push(version, data, &mut versions);
                }
                break;
            }
        }
    }

    Some(Collected {
        versions,
        cell,
        observed,
        anchor,
        any_reverted,
        rooted_in_log,
    })
}

/// A revert may negate the old record's top version while its chain is
/// being copied. After the swing the old record is frozen, so a single
/// re-check suffices: when the copied top is no longer live in the old
/// record, the revert is mirrored onto the replacement. Entry-resident
/// tops need no check — reverting those unlinks through the newest cell
/// and would have failed the swing instead.
fn mirror_late_revert(
    arena: &Arc<PageArena>,
    old_anchor: RecordPtr,
    observed: RecordPtr,
    new_ptr: RecordPtr,
    top_version: u64,
) {
    if !observed.is_null() {
        return;
    }
    let old = ChainHead::resolve(arena, old_anchor);
    if matches!(old.view(), RecordView::Insert(_)) {
        // Insert reverts withdraw the index mapping and resolve through
        // the erase/update CAS pair instead.
        return;
    }
    let still_live = matches!(old.state(), HeadState::Version(v, _) if v == top_version);
    if still_live {
        return;
    }
    match view(arena, new_ptr) {
        RecordView::MultiRow(row) => row.revert(top_version),
        RecordView::MultiCol(col) => col.revert(top_version),
        _ => unreachable!("replacements are consolidated records"),
    }
}

/// Versions that survive consolidation under `min_version`: everything
/// above the cutoff, plus the cutoff version itself when it is live. A
/// tombstone at or below the cutoff — and everything under it — is
/// garbage.
fn retain(
    versions: &[(u64, Option<Vec<u8>>)],
    min_version: u64,
) -> Vec<(u64, Option<Vec<u8>>)> {
    let mut out = Vec::with_capacity(versions.len());
    for (version, data) in versions {
        if *version <= min_version {
            if data.is_some() {
                out.push((*version, data.clone()));
            }
            break;
        }
        out.push((*version, data.clone()));
    }
    out
}

enum LayoutBuilder {
    Row(RowPageBuilder),
    Column(ColumnPageBuilder),
}

impl LayoutBuilder {
    fn new(layout: StorageLayout, arena: Arc<PageArena>) -> Self {
        match layout {
            StorageLayout::Row => LayoutBuilder::Row(RowPageBuilder::new(arena)),
            StorageLayout::Column => LayoutBuilder::Column(ColumnPageBuilder::new(arena)),
        }
    }

    fn stage(&mut self, key: u64, versions: Vec<(u64, Option<Vec<u8>>)>) -> Result<()> {
        match self {
            LayoutBuilder::Row(builder) => builder.stage(key, versions),
            LayoutBuilder::Column(builder) => builder.stage(key, versions),
        }
    }

    fn finish(self) -> Result<(Vec<(PageRef, Arc<Page>)>, Vec<Placement>)> {
        match self {
            LayoutBuilder::Row(builder) => builder.finish(),
            LayoutBuilder::Column(builder) => builder.finish(),
        }
    }
}

struct PendingSwing {
    key: u64,
    head_ptr: RecordPtr,
    cell: CellRef,
    observed: RecordPtr,
    anchor: RecordPtr,
    top_version: u64,
}

/// Runs one consolidation pass over `table`. Callers serialise passes via
/// the table's GC lock.
pub(crate) fn run(table: &Table, min_version: u64) -> Result<GcStats> {
    let started = Instant::now();
    let guard = crossbeam_epoch::pin();
    let arena = table.arena();

    // Journal boundaries: everything strictly older than these pages is
    // absorbed by this pass and reclaimable afterwards.
    let insert_tail = table.insert_log().tail();
    let insert_boundary = table.insert_log().head();
    let update_boundary = table.update_log().write_head();

    let mut stats = GcStats {
        min_version,
        ..GcStats::default()
    };

    let entries = table.index().entries();
    stats.keys_examined = entries.len() as u64;

    // First sweep: decide whether anything needs rewriting at all.
    let mut plans = Vec::with_capacity(entries.len());
    let mut any_dirty = false;
    for (key, head_ptr) in entries {
        let Some(collected) = collect(arena, head_ptr) else {
            continue;
        };
        let retained = retain(&collected.versions, min_version);
        any_dirty |= collected.rooted_in_log
            || collected.any_reverted
            || retained.len() != collected.versions.len();
        plans.push((key, head_ptr, collected, retained));
    }

    if !any_dirty {
        stats.run_millis = started.elapsed().as_millis() as u64;
        debug!(
            table = %table.name(),
            min_version,
            keys = stats.keys_examined,
            "gc.pass.noop"
        );
        return Ok(stats);
    }

    // Second sweep: drop dead keys outright, stage the rest into fresh
    // consolidated pages.
    let mut builder = LayoutBuilder::new(table.layout(), Arc::clone(arena));
    let mut pending: Vec<PendingSwing> = Vec::new();
    for (key, head_ptr, collected, retained) in plans {
        if retained.is_empty() {
            drop_key(table, &mut stats, min_version, key, head_ptr, collected)?;
            continue;
        }
        let top_version = retained[0].0;
        match builder.stage(key, retained) {
            Ok(()) => pending.push(PendingSwing {
                key,
                head_ptr,
                cell: collected.cell,
                observed: collected.observed,
                anchor: collected.anchor,
                top_version,
            }),
            Err(StoreError::EntryTooLarge { size, max }) => {
                warn!(
                    table = %table.name(),
                    key,
                    size,
                    max,
                    "gc.record.oversized"
                );
                stats.keys_skipped += 1;
            }
            Err(err) => return Err(err),
        }
    }

    let (pages, placements) = builder.finish()?;
    stats.pages_built += pages.len() as u64;
    if let (Some((begin, _)), Some((end, _))) = (pages.first(), pages.last()) {
        table.update_log().append_page(*begin, *end);
    }

    debug_assert_eq!(pending.len(), placements.len());
    for (swing, placement) in pending.into_iter().zip(placements) {
        if swing
            .cell
            .compare_exchange(swing.observed, placement.ptr.tagged_forward())
        {
            table.index().update(swing.key, swing.head_ptr, placement.ptr);
            mirror_late_revert(
                arena,
                swing.anchor,
                swing.observed,
                placement.ptr,
                swing.top_version,
            );
            stats.keys_consolidated += 1;
        } else {
            // A writer extended the chain since collection; redo this key
            // against the fresh state. The batched copy stays behind as
            // dead data until the next pass.
            consolidate_contended(table, &mut stats, min_version, swing.key, swing.head_ptr)?;
        }
    }

    // Reclaim the journals once every chain has been absorbed. The pages
    // this pass wants to free were all sealed before the boundary, but a
    // slow writer may still be publishing an entry that lives in one of
    // them, and an already-published entry may have been attached to a
    // replacement record after collection. Truncation therefore requires,
    // in order: no skipped keys, no in-flight entries in the doomed
    // pages, and a reconciliation sweep showing no live chain touches
    // them.
    let mut doomed: FxHashSet<PageRef> = FxHashSet::default();
    doomed.extend(crate::log::chain_refs(arena, insert_tail, insert_boundary));
    let update_old = PageRef(arena.page(update_boundary).next());
    doomed.extend(crate::log::chain_refs(arena, update_old, PageRef::NULL));

    let mut safe = stats.keys_skipped == 0;
    if safe && !doomed.is_empty() {
        safe = doomed.iter().all(|page_ref| {
            let page = arena.page(*page_ref);
            page.kind() != PageKind::Entries || !page.has_inflight_entries()
        });
        let mut sweeps = 0;
        while safe {
            let mut contended = 0u64;
            for (key, head_ptr) in table.index().entries() {
                if chain_touches(arena, head_ptr, &doomed) {
                    consolidate_contended(table, &mut stats, min_version, key, head_ptr)?;
                    contended += 1;
                }
            }
            if contended == 0 {
                break;
            }
            sweeps += 1;
            if sweeps >= MAX_RECONCILE_SWEEPS {
                safe = false;
            }
        }
        safe = safe && stats.keys_skipped == 0;
    }

    if safe {
        table
            .insert_log()
            .truncate(&guard, insert_tail, insert_boundary);
        table
            .update_log()
            .erase(&guard, update_boundary, PageRef::NULL);
        stats.truncated = true;
    } else {
        warn!(
            table = %table.name(),
            skipped = stats.keys_skipped,
            "gc.truncation.postponed"
        );
    }

    stats.run_millis = started.elapsed().as_millis() as u64;
    if stats.made_progress() {
        info!(
            table = %table.name(),
            min_version,
            keys = stats.keys_examined,
            consolidated = stats.keys_consolidated,
            dropped = stats.keys_dropped,
            skipped = stats.keys_skipped,
            pages_built = stats.pages_built,
            truncated = stats.truncated,
            run_millis = stats.run_millis,
            "gc.pass.completed"
        );
    } else {
        debug!(table = %table.name(), min_version, "gc.pass.noop");
    }
    Ok(stats)
}

/// Drops a key whose every version is garbage: poison the newest cell so
/// racing writers restart from the index, then withdraw the mapping.
fn drop_key(
    table: &Table,
    stats: &mut GcStats,
    min_version: u64,
    key: u64,
    head_ptr: RecordPtr,
    mut collected: Collected,
) -> Result<()> {
    loop {
        if collected
            .cell
            .compare_exchange(collected.observed, RecordPtr::DROPPED)
        {
            table.index().erase(key, head_ptr);
            stats.keys_dropped += 1;
            return Ok(());
        }
        // A writer attached a fresh version; the key may no longer be
        // dead.
        let Some(fresh) = collect(table.arena(), head_ptr) else {
            return Ok(());
        };
        let retained = retain(&fresh.versions, min_version);
        if retained.is_empty() {
            collected = fresh;
            continue;
        }
        return consolidate_contended(table, stats, min_version, key, head_ptr);
    }
}

/// Whether any record of the chain lives in one of the given pages.
fn chain_touches(
    arena: &Arc<PageArena>,
    head_ptr: RecordPtr,
    pages: &FxHashSet<PageRef>,
) -> bool {
    let head = ChainHead::resolve(arena, head_ptr);
    let (observed, anchor) = match chase(arena, &head) {
        Chase::Resolved {
            observed, anchor, ..
        } => (observed, anchor),
        Chase::Dropped => return false,
    };
    let mut cursor = if observed.is_null() { anchor } else { observed };
    loop {
        if cursor.is_null() {
            return false;
        }
        if pages.contains(&cursor.page()) {
            return true;
        }
        cursor = match view(arena, cursor) {
            RecordView::Update(update) => update.previous(),
            RecordView::Delete(delete) => delete.previous(),
            _ => return false,
        };
    }
}

/// Single-key consolidation used when a batched swing loses its race:
/// rebuild against the live chain until the swing lands.
fn consolidate_contended(
    table: &Table,
    stats: &mut GcStats,
    min_version: u64,
    key: u64,
    head_ptr: RecordPtr,
) -> Result<()> {
    loop {
        let Some(collected) = collect(table.arena(), head_ptr) else {
            return Ok(());
        };
        let retained = retain(&collected.versions, min_version);
        if retained.is_empty() {
            return drop_key(table, stats, min_version, key, head_ptr, collected);
        }

        let top_version = retained[0].0;
        let mut builder = LayoutBuilder::new(table.layout(), Arc::clone(table.arena()));
        if let Err(err) = builder.stage(key, retained) {
            if matches!(err, StoreError::EntryTooLarge { .. }) {
                stats.keys_skipped += 1;
                return Ok(());
            }
            return Err(err);
        }
        let (pages, mut placements) = builder.finish()?;
        stats.pages_built += pages.len() as u64;
        if let (Some((begin, _)), Some((end, _))) = (pages.first(), pages.last()) {
            table.update_log().append_page(*begin, *end);
        }
        let placement = placements.pop().expect("one staged key yields one placement");

        if collected
            .cell
            .compare_exchange(collected.observed, placement.ptr.tagged_forward())
        {
            table.index().update(key, head_ptr, placement.ptr);
            mirror_late_revert(
                table.arena(),
                collected.anchor,
                collected.observed,
                placement.ptr,
                top_version,
            );
            stats.keys_consolidated += 1;
            return Ok(());
        }
    }
}
