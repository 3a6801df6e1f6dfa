//! Lock-free append-only paged logs.
//!
//! Two disciplines share the page format: the [`ordered::OrderedLog`]
//! keeps a single write head and pages chained in allocation order (the
//! insert journal), while the [`unordered::UnorderedLog`] adds a second
//! head so whole pre-filled page chains can be spliced in by the garbage
//! collector (the update journal).

pub mod ordered;
pub mod page;
pub mod unordered;

pub use ordered::OrderedLog;
pub use unordered::UnorderedLog;

use std::sync::Arc;

use crate::alloc::{PageArena, PageRef};

/// Collects the page chain `[begin, end)` following `next` links.
pub(crate) fn chain_refs(arena: &PageArena, begin: PageRef, end: PageRef) -> Vec<PageRef> {
    let mut refs = Vec::new();
    let mut current = begin;
    while current != end && !current.is_null() {
        refs.push(current);
        current = PageRef(arena.page(current).next());
    }
    refs
}

/// Links a builder-produced page chain in slice order: each page's `next`
/// names its successor, the last page stays open for the log splice.
pub(crate) fn link_chain(pages: &[(PageRef, Arc<crate::log::page::Page>)]) {
    for pair in pages.windows(2) {
        pair[0].1.set_next(pair[1].0 .0);
    }
}
