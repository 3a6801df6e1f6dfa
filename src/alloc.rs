//! Page supply with deferred release.
//!
//! The arena owns a fixed budget of page slots. Handles embed the slot id,
//! and resolving a handle goes through a lock-free slot table so readers
//! never take a lock. Freed slot ids re-enter circulation only through an
//! epoch-deferred callback: a thread that observed a handle while pinned
//! can never see the slot remapped under it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use crossbeam_epoch::Guard;
use parking_lot::Mutex;
use tracing::warn;

use crate::log::page::{Page, PageKind, PAGE_HEADER_SIZE};

/// 1-based page slot id; 0 is the null reference.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PageRef(pub u32);

impl PageRef {
    pub const NULL: PageRef = PageRef(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    fn slot(self) -> usize {
        debug_assert!(!self.is_null());
        self.0 as usize - 1
    }
}

/// Arena usage counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct ArenaStats {
    pub capacity: u64,
    pub allocated: u64,
    pub freed: u64,
}

impl ArenaStats {
    pub fn live(&self) -> u64 {
        self.allocated - self.freed
    }
}

/// Fixed-budget page allocator.
pub struct PageArena {
    slots: Box<[ArcSwapOption<Page>]>,
    free: Mutex<Vec<u32>>,
    page_size: usize,
    allocated: AtomicU64,
    freed: AtomicU64,
}

impl PageArena {
    pub fn new(total_memory: usize, page_size: usize) -> Self {
        let capacity = total_memory / page_size;
        debug_assert!(capacity >= 1);
        let slots = (0..capacity).map(|_| ArcSwapOption::const_empty()).collect();
        // Hand out low slot ids first.
        let free = (1..=capacity as u32).rev().collect();
        Self {
            slots,
            free: Mutex::new(free),
            page_size,
            allocated: AtomicU64::new(0),
            freed: AtomicU64::new(0),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Largest entry footprint a page from this arena can hold.
    pub fn max_entry_size(&self) -> u32 {
        (self.page_size - PAGE_HEADER_SIZE) as u32
    }

    /// Returns `None` when the budget is exhausted; callers surface this
    /// as [`crate::StoreError::OutOfMemory`] or retry after a GC pass.
    pub fn allocate(&self, kind: PageKind) -> Option<(PageRef, Arc<Page>)> {
        let id = match self.free.lock().pop() {
            Some(id) => id,
            None => {
                warn!(capacity = self.slots.len(), "arena.exhausted");
                return None;
            }
        };
        let page = Arc::new(Page::new(self.page_size, kind));
        self.slots[id as usize - 1].store(Some(Arc::clone(&page)));
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Some((PageRef(id), page))
    }

    pub fn resolve(&self, page_ref: PageRef) -> Option<Arc<Page>> {
        if page_ref.is_null() {
            return None;
        }
        self.slots[page_ref.slot()].load_full()
    }

    /// Resolves a handle that must be live. A miss means a handle escaped
    /// its epoch protection, which is memory corruption by definition.
    pub fn page(&self, page_ref: PageRef) -> Arc<Page> {
        match self.resolve(page_ref) {
            Some(page) => page,
            None => panic!("dangling page reference {}", page_ref.0),
        }
    }

    /// Immediately releases a page that was never published.
    pub fn free_now(&self, page_ref: PageRef) {
        self.slots[page_ref.slot()].store(None);
        self.free.lock().push(page_ref.0);
        self.freed.fetch_add(1, Ordering::Relaxed);
    }

    /// Schedules slot release once every thread pinned at or before this
    /// point has moved on.
    pub fn defer_free(self: &Arc<Self>, guard: &Guard, refs: Vec<PageRef>) {
        if refs.is_empty() {
            return;
        }
        let arena = Arc::clone(self);
        guard.defer(move || {
            for page_ref in refs {
                arena.free_now(page_ref);
            }
        });
    }

    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            capacity: self.slots.len() as u64,
            allocated: self.allocated.load(Ordering::Relaxed),
            freed: self.freed.load(Ordering::Relaxed),
        }
    }
}
