//! Unordered log: a packed double head so concurrent appenders can roll
//! pages while the garbage collector splices in whole pre-filled chains.
//!
//! `next` links point from newer pages to older ones; the tail is the
//! oldest page still owned by the log.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_epoch::Guard;

use crate::alloc::{PageArena, PageRef};
use crate::error::{Result, StoreError};
use crate::log::page::{entry_size, Page, PageKind};
use crate::record::RecordPtr;

/// The two log heads packed into one atomic word: the page taking appends
/// and the most recent bulk-appended chain not yet promoted to write head.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct LogHead {
    write: PageRef,
    append: PageRef,
}

impl LogHead {
    fn pack(self) -> u64 {
        ((self.write.0 as u64) << 32) | self.append.0 as u64
    }

    fn unpack(word: u64) -> Self {
        Self {
            write: PageRef((word >> 32) as u32),
            append: PageRef(word as u32),
        }
    }
}

pub struct UnorderedLog {
    arena: Arc<PageArena>,
    head: AtomicU64,
    tail: AtomicU32,
    pages: AtomicU64,
}

impl UnorderedLog {
    pub fn new(arena: Arc<PageArena>) -> Result<Self> {
        let (first, _) = arena
            .allocate(PageKind::Entries)
            .ok_or(StoreError::OutOfMemory)?;
        let head = LogHead {
            write: first,
            append: PageRef::NULL,
        };
        Ok(Self {
            arena,
            head: AtomicU64::new(head.pack()),
            tail: AtomicU32::new(first.0),
            pages: AtomicU64::new(1),
        })
    }

    fn load_head(&self) -> LogHead {
        LogHead::unpack(self.head.load(Ordering::Acquire))
    }

    pub fn write_head(&self) -> PageRef {
        self.load_head().write
    }

    pub fn tail(&self) -> PageRef {
        PageRef(self.tail.load(Ordering::Acquire))
    }

    pub fn page_count(&self) -> u64 {
        self.pages.load(Ordering::Relaxed)
    }

    pub fn append(&self, size: u32, tag: u32) -> Result<RecordPtr> {
        if entry_size(size) > self.arena.max_entry_size() {
            return Err(StoreError::EntryTooLarge {
                size: entry_size(size) as usize,
                max: self.arena.max_entry_size() as usize,
            });
        }
        let mut head = self.load_head();
        loop {
            let page = self.arena.page(head.write);
            if let Some(offset) = page.append(size, tag) {
                return Ok(RecordPtr::new(head.write, offset));
            }
            head = self.create_page(head)?;
        }
    }

    /// Rolls the write head: promote the pending append head when there is
    /// one, otherwise allocate. A page allocated on a lost race was never
    /// published and is released on the spot.
    fn create_page(&self, mut old: LogHead) -> Result<LogHead> {
        let stale_write = old.write;
        self.arena.page(stale_write).seal();

        loop {
            let mut fresh: Option<(PageRef, Arc<Page>)> = None;
            let mut new = LogHead {
                write: old.append,
                append: PageRef::NULL,
            };

            if old.append.is_null() {
                let (new_ref, new_page) = self
                    .arena
                    .allocate(PageKind::Entries)
                    .ok_or(StoreError::OutOfMemory)?;
                new_page.set_next(old.write.0);
                new.write = new_ref;
                self.pages.fetch_add(1, Ordering::Relaxed);
                fresh = Some((new_ref, new_page));
            }

            match self.head.compare_exchange(
                old.pack(),
                new.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(new),
                Err(current) => {
                    if let Some((new_ref, _)) = fresh {
                        self.pages.fetch_sub(1, Ordering::Relaxed);
                        self.arena.free_now(new_ref);
                    }
                    let current = LogHead::unpack(current);
                    if current.write == stale_write {
                        // Only the append head changed underneath us.
                        old = current;
                        continue;
                    }
                    return Ok(current);
                }
            }
        }
    }

    /// Splices the pre-filled chain `begin ..= end` in on the append side.
    /// The chain's pages must already be sealed and linked `begin -> end`.
    pub fn append_page(&self, begin: PageRef, end: PageRef) {
        debug_assert!(!begin.is_null() && !end.is_null());
        let mut count = 1;
        let mut current = begin;
        while current != end {
            current = PageRef(self.arena.page(current).next());
            count += 1;
        }
        self.pages.fetch_add(count, Ordering::Relaxed);

        let end_page = self.arena.page(end);
        let mut old = self.load_head();
        loop {
            // The chain continues at the pending append head, or at the
            // write head when no batch is waiting.
            let link = if old.append.is_null() {
                old.write
            } else {
                old.append
            };
            end_page.set_next(link.0);
            if !old.append.is_null() {
                self.arena.page(old.append).seal();
            }
            let new = LogHead {
                write: old.write,
                append: begin,
            };
            match self.head.compare_exchange(
                old.pack(),
                new.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(current) => old = LogHead::unpack(current),
            }
        }
    }

    /// Splices the pages strictly between `begin` and `end` out of the
    /// chain and schedules them for release. A null `end` resets the tail
    /// to `begin`.
    pub fn erase(&self, guard: &Guard, begin: PageRef, end: PageRef) {
        debug_assert!(!begin.is_null());
        if begin == end {
            return;
        }
        if end.is_null() {
            self.tail.store(begin.0, Ordering::Release);
        }
        let next = PageRef(self.arena.page(begin).swap_next(end.0));
        if next == end {
            return;
        }
        let refs = super::chain_refs(&self.arena, next, end);
        self.pages.fetch_sub(refs.len() as u64, Ordering::Relaxed);
        self.arena.defer_free(guard, refs);
    }

    /// Pages from the write head toward the tail, newest first.
    pub fn pages(&self) -> Vec<PageRef> {
        let head = self.load_head();
        let mut refs = Vec::new();
        if !head.append.is_null() {
            refs.extend(super::chain_refs(&self.arena, head.append, head.write));
        }
        refs.extend(super::chain_refs(&self.arena, head.write, PageRef::NULL));
        refs
    }
}
