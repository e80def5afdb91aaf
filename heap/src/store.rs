//! Lifecycle bookkeeping for the pages of one page type.
//!
//! Every page sits in exactly one of four lists:
//! - `empty`: no live blocks, ready to be reused for any request
//! - `ready`: swept, holding live blocks and (usually) free space
//! - `used`: checked out by an allocator during the current cycle
//! - `unswept`: waiting for the sweep of the current cycle
//!
//! A page taken off a list is exclusively owned by the taker until it is
//! pushed back; its contents are never touched under the store lock except
//! for `has_room` queries on `ready` pages, which nobody else owns.

use std::{
    ops::AddAssign,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;

use crate::{
    FinalizerQueue, SweepPolicy, SweepScope,
    heap::AllocatedSizeTracker,
    page::HeapPage,
};

/// Sizes of the four page lists of a store.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PageCensus {
    pub empty: usize,
    pub ready: usize,
    pub used: usize,
    pub unswept: usize,
}

impl PageCensus {
    pub fn total(&self) -> usize {
        self.empty + self.ready + self.used + self.unswept
    }
}

impl AddAssign for PageCensus {
    fn add_assign(&mut self, rhs: Self) {
        self.empty += rhs.empty;
        self.ready += rhs.ready;
        self.used += rhs.used;
        self.unswept += rhs.unswept;
    }
}

/// What an allocating thread needs to sweep a page on its own.
pub struct InlineSweep<'a> {
    pub sweepers: &'a AtomicUsize,
    pub policy: &'a dyn SweepPolicy,
    pub tracker: &'a AllocatedSizeTracker,
    pub epoch: i64,
}

struct PageLists<P> {
    empty: Vec<NonNull<P>>,
    ready: Vec<NonNull<P>>,
    used: Vec<NonNull<P>>,
    unswept: Vec<NonNull<P>>,
}

impl<P> PageLists<P> {
    fn drain_all(&mut self) -> Vec<NonNull<P>> {
        let mut pages = std::mem::take(&mut self.empty);
        pages.append(&mut self.ready);
        pages.append(&mut self.used);
        pages.append(&mut self.unswept);
        pages
    }

    fn iter(&self) -> impl Iterator<Item = &NonNull<P>> {
        self.empty
            .iter()
            .chain(&self.ready)
            .chain(&self.used)
            .chain(&self.unswept)
    }
}

pub struct PageStore<P: HeapPage> {
    lists: Mutex<PageLists<P>>,
}

// SAFETY: pages are plain memory regions; the lists are only touched under
// the mutex and a page is mutated only by whoever popped it.
unsafe impl<P: HeapPage> Send for PageStore<P> {}
// SAFETY: see above
unsafe impl<P: HeapPage> Sync for PageStore<P> {}

impl<P: HeapPage> Default for PageStore<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: HeapPage> PageStore<P> {
    pub fn new() -> Self {
        Self {
            lists: Mutex::new(PageLists {
                empty: Vec::new(),
                ready: Vec::new(),
                used: Vec::new(),
                unswept: Vec::new(),
            }),
        }
    }

    /// Returns a page with room for `request`, now in `used`.
    ///
    /// Tries `ready`, then sweeps `unswept` pages inline, then reuses an
    /// `empty` page and finally maps a new one.
    pub fn get_page(
        &self,
        request: P::Request,
        queue: &mut FinalizerQueue,
        sweep: &InlineSweep<'_>,
    ) -> NonNull<P> {
        if let Some(page) = self.take_ready(request) {
            return page;
        }
        if let Some(page) = self.sweep_for_room(request, queue, sweep) {
            return page;
        }
        {
            let mut lists = self.lists.lock();
            if let Some(page) = lists.empty.pop() {
                lists.used.push(page);
                return page;
            }
        }
        self.new_page(request)
    }

    fn take_ready(&self, request: P::Request) -> Option<NonNull<P>> {
        let mut lists = self.lists.lock();
        let index = lists.ready.iter().rposition(|page| {
            // SAFETY: ready pages are owned by the store, and we hold its lock
            unsafe { page.as_ref() }.has_room(request)
        })?;
        let page = lists.ready.swap_remove(index);
        lists.used.push(page);
        Some(page)
    }

    fn sweep_for_room(
        &self,
        request: P::Request,
        queue: &mut FinalizerQueue,
        sweep: &InlineSweep<'_>,
    ) -> Option<NonNull<P>> {
        loop {
            let page = self.pop_unswept(sweep.sweepers)?;
            let mut scope = SweepScope::new(sweep.policy, sweep.epoch, "inline");
            // SAFETY: popped from unswept, so this thread owns the page
            let swept = unsafe { &mut *page.as_ptr() };
            swept.sweep(&mut scope, queue);
            let room = swept.has_room(request);
            sweep.tracker.add(swept.stats().allocated_bytes);
            drop(scope);

            // full live pages go to used as well; the next cycle sweeps them
            self.lists.lock().used.push(page);
            sweep.sweepers.fetch_sub(1, Ordering::Release);
            if room {
                return Some(page);
            }
        }
    }

    /// Pops an unswept page and registers the caller as a sweeper while the
    /// lock is still held.
    fn pop_unswept(&self, sweepers: &AtomicUsize) -> Option<NonNull<P>> {
        let mut lists = self.lists.lock();
        let page = lists.unswept.pop()?;
        sweepers.fetch_add(1, Ordering::AcqRel);
        Some(page)
    }

    /// Maps a fresh page straight into `used`.
    pub fn new_page(&self, request: P::Request) -> NonNull<P> {
        let page = P::create(request);
        self.lists.lock().used.push(page);
        page
    }

    /// Moves every page to `unswept`. Only with the world stopped.
    pub fn prepare_for_gc(&self) {
        let mut lists = self.lists.lock();
        let PageLists {
            empty,
            ready,
            used,
            unswept,
        } = &mut *lists;
        debug_assert!(unswept.is_empty(), "previous cycle left unswept pages");
        unswept.append(ready);
        unswept.append(used);
        unswept.append(empty);
    }

    /// Sweeps `unswept` until it is drained; callable from several threads.
    pub fn sweep(
        &self,
        scope: &mut SweepScope<'_>,
        queue: &mut FinalizerQueue,
        sweepers: &AtomicUsize,
    ) {
        while let Some(page) = self.pop_unswept(sweepers) {
            // SAFETY: popped from unswept, so this thread owns the page
            let swept = unsafe { &mut *page.as_ptr() };
            let empty = swept.sweep(scope, queue);
            scope.add_live_bytes(swept.stats().allocated_bytes);
            {
                let mut lists = self.lists.lock();
                if empty {
                    lists.empty.push(page);
                } else {
                    lists.ready.push(page);
                }
            }
            sweepers.fetch_sub(1, Ordering::Release);
        }
    }

    /// Like [`PageStore::sweep`], but unmaps pages that end up empty.
    pub fn sweep_and_free(
        &self,
        scope: &mut SweepScope<'_>,
        queue: &mut FinalizerQueue,
        sweepers: &AtomicUsize,
    ) {
        let mut freed = 0;
        while let Some(page) = self.pop_unswept(sweepers) {
            // SAFETY: popped from unswept, so this thread owns the page
            let swept = unsafe { &mut *page.as_ptr() };
            if swept.sweep(scope, queue) {
                // SAFETY: the page is in no list and owned by us
                unsafe { P::destroy(page) };
                freed += 1;
            } else {
                scope.add_live_bytes(swept.stats().allocated_bytes);
                self.lists.lock().ready.push(page);
            }
            sweepers.fetch_sub(1, Ordering::Release);
        }
        if freed > 0 {
            log::trace!("{:?} store freed {freed} pages", P::KIND);
        }
    }

    /// Unmaps empty pages beyond the first `keep`. Returns how many went.
    pub fn release_empty(&self, keep: usize) -> usize {
        let released: Vec<_> = {
            let mut lists = self.lists.lock();
            let keep = keep.min(lists.empty.len());
            lists.empty.drain(keep..).collect()
        };
        for &page in &released {
            // SAFETY: removed from every list
            unsafe { P::destroy(page) };
        }
        released.len()
    }

    /// Visits every page. Only with the world stopped.
    pub fn traverse_pages(&self, mut f: impl FnMut(&P)) {
        let lists = self.lists.lock();
        for page in lists.iter() {
            // SAFETY: mutators are parked, so no one mutates pages meanwhile
            f(unsafe { page.as_ref() });
        }
    }

    pub fn census(&self) -> PageCensus {
        let lists = self.lists.lock();
        PageCensus {
            empty: lists.empty.len(),
            ready: lists.ready.len(),
            used: lists.used.len(),
            unswept: lists.unswept.len(),
        }
    }

    /// Unmaps every page.
    pub fn clear_for_tests(&self) {
        let pages = self.lists.lock().drain_all();
        for page in pages {
            // SAFETY: removed from every list
            unsafe { P::destroy(page) };
        }
    }
}

impl<P: HeapPage> Drop for PageStore<P> {
    fn drop(&mut self) {
        for page in self.lists.get_mut().drain_all() {
            // SAFETY: the store is going away together with its pages
            unsafe { P::destroy(page) };
        }
    }
}
