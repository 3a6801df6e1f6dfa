//! Strictly ordered log: one write head, pages chained in allocation
//! order (`next` pointing from older to newer), truncation from the tail.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crossbeam_epoch::Guard;

use crate::alloc::{PageArena, PageRef};
use crate::error::{Result, StoreError};
use crate::log::page::{entry_size, PageKind};
use crate::record::RecordPtr;

pub struct OrderedLog {
    arena: Arc<PageArena>,
    head: AtomicU32,
    tail: AtomicU32,
}

impl OrderedLog {
    pub fn new(arena: Arc<PageArena>) -> Result<Self> {
        let (first, _) = arena
            .allocate(PageKind::Entries)
            .ok_or(StoreError::OutOfMemory)?;
        Ok(Self {
            arena,
            head: AtomicU32::new(first.0),
            tail: AtomicU32::new(first.0),
        })
    }

    pub fn head(&self) -> PageRef {
        PageRef(self.head.load(Ordering::Acquire))
    }

    pub fn tail(&self) -> PageRef {
        PageRef(self.tail.load(Ordering::Acquire))
    }

    /// Appends an entry, rolling to a new page when the head fills up.
    pub fn append(&self, size: u32, tag: u32) -> Result<RecordPtr> {
        if entry_size(size) > self.arena.max_entry_size() {
            return Err(StoreError::EntryTooLarge {
                size: entry_size(size) as usize,
                max: self.arena.max_entry_size() as usize,
            });
        }
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let page = self.arena.page(PageRef(head));
            if let Some(offset) = page.append(size, tag) {
                return Ok(RecordPtr::new(PageRef(head), offset));
            }
            head = self.create_page(head)?;
        }
    }

    /// Advances the head past a full page, reusing a link another thread
    /// already installed where possible.
    fn create_page(&self, old_head: u32) -> Result<u32> {
        let page = self.arena.page(PageRef(old_head));

        let next = page.next();
        if next != 0 {
            return Ok(
                match self
                    .head
                    .compare_exchange(old_head, next, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => next,
                    Err(current) => current,
                },
            );
        }

        page.seal();

        let (new_ref, _) = self
            .arena
            .allocate(PageKind::Entries)
            .ok_or(StoreError::OutOfMemory)?;
        match page.cas_next(0, new_ref.0) {
            Err(installed) => {
                // Another thread linked its page first; ours was never
                // published and can be released immediately.
                self.arena.free_now(new_ref);
                Ok(installed)
            }
            Ok(_) => {
                // Either outcome is fine: a failed head CAS means another
                // thread advanced it past our page for us.
                let _ = self.head.compare_exchange(
                    old_head,
                    new_ref.0,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                Ok(new_ref.0)
            }
        }
    }

    /// Atomically moves the tail from `old_tail` to `new_tail` and
    /// schedules the pages in between for release. Returns `false` when
    /// the tail had already moved.
    pub fn truncate(&self, guard: &Guard, old_tail: PageRef, new_tail: PageRef) -> bool {
        if old_tail == new_tail {
            return self.tail.load(Ordering::Acquire) == new_tail.0;
        }
        if self
            .tail
            .compare_exchange(old_tail.0, new_tail.0, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let refs = super::chain_refs(&self.arena, old_tail, new_tail);
        self.arena.defer_free(guard, refs);
        true
    }

    /// Pages from tail to head, oldest first.
    pub fn pages(&self) -> Vec<PageRef> {
        super::chain_refs(&self.arena, self.tail(), PageRef::NULL)
    }
}
