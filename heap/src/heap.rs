use std::{
    fmt,
    ops::Deref,
    ptr::NonNull,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    thread,
};

use parking_lot::Mutex;

use crate::{
    FinalizerQueue, SweepPolicy, SweepScope,
    object::ExtraObjectData,
    page::{
        BlockRef, ExtraObjectPage, FixedBlockPage, HeapPage, MAX_BLOCK_SIZE, NextFitPage,
        PageInfo, PageStats, SingleObjectPage,
    },
    store::{InlineSweep, PageCensus, PageStore},
};

// ── Size classes ──────────────────────────────────────────────────────

/// Page type an allocation of a given size is served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    FixedBlock(u32),
    NextFit(u32),
    SingleObject(u64),
}

impl SizeClass {
    #[inline]
    #[must_use]
    pub fn for_cells(cells: u64) -> Self {
        let cells = cells.max(1);
        if cells <= MAX_BLOCK_SIZE as u64 {
            Self::FixedBlock(cells as u32)
        } else if cells <= NextFitPage::max_block_size() as u64 {
            Self::NextFit(cells as u32)
        } else {
            Self::SingleObject(cells)
        }
    }

    #[inline]
    #[must_use]
    pub fn for_bytes(bytes: usize) -> Self {
        Self::for_cells(crate::page::cells_for_bytes(bytes) as u64)
    }
}

// ── Allocation accounting ─────────────────────────────────────────────

/// Heap wide count of allocated bytes plus the collection trigger.
#[derive(Debug)]
pub struct AllocatedSizeTracker {
    allocated: AtomicUsize,
    target: AtomicUsize,
}

impl Default for AllocatedSizeTracker {
    fn default() -> Self {
        Self {
            allocated: AtomicUsize::new(0),
            target: AtomicUsize::new(usize::MAX),
        }
    }
}

impl AllocatedSizeTracker {
    /// Adds `bytes`; returns `true` if this call crossed the target.
    #[inline]
    pub fn add(&self, bytes: usize) -> bool {
        if bytes == 0 {
            return false;
        }
        let before = self.allocated.fetch_add(bytes, Ordering::Relaxed);
        let target = self.target.load(Ordering::Relaxed);
        before < target && before.saturating_add(bytes) >= target
    }

    #[inline]
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn target(&self) -> usize {
        self.target.load(Ordering::Relaxed)
    }

    pub fn set_target(&self, bytes: usize) {
        self.target.store(bytes, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.allocated.store(0, Ordering::Relaxed);
    }
}

// ── Census ────────────────────────────────────────────────────────────

/// Page list sizes and byte totals per page type.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapCensus {
    pub fixed_block: PageCensus,
    pub next_fit: PageCensus,
    pub single_object: PageCensus,
    pub extra_object: PageCensus,
    pub objects: PageStats,
    pub extra_objects: PageStats,
}

impl fmt::Display for HeapCensus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let row = |f: &mut fmt::Formatter<'_>, name: &str, c: &PageCensus| {
            writeln!(
                f,
                "  {name:<14} ready {:>5}  empty {:>5}  used {:>5}  unswept {:>5}",
                c.ready, c.empty, c.used, c.unswept
            )
        };
        writeln!(f, "heap census:")?;
        row(f, "fixed block", &self.fixed_block)?;
        row(f, "next fit", &self.next_fit)?;
        row(f, "single object", &self.single_object)?;
        row(f, "extra object", &self.extra_object)?;
        write!(
            f,
            "  objects {} / {} bytes, extra objects {} / {} bytes",
            self.objects.allocated_bytes,
            self.objects.capacity_bytes,
            self.extra_objects.allocated_bytes,
            self.extra_objects.capacity_bytes,
        )
    }
}

/// Number of partitions [`HeapInner::traverse_fixed_pages_part`] accepts.
pub const FIXED_PAGE_PARTS: usize = 3;

// ── HeapInner ─────────────────────────────────────────────────────────

pub struct HeapInner {
    /// Indexed by block size in cells; slot 0 stays unused.
    fixed_block_pages: Box<[PageStore<FixedBlockPage>]>,
    next_fit_pages: PageStore<NextFitPage>,
    single_object_pages: PageStore<SingleObjectPage>,
    extra_object_pages: PageStore<ExtraObjectPage>,
    pending_finalizers: Mutex<FinalizerQueue>,
    concurrent_sweepers: AtomicUsize,
    /// Bumped by every `prepare_for_gc`; allocators drop cached pages when
    /// it moves.
    page_epoch: AtomicU64,
    size_tracker: AllocatedSizeTracker,
    policy: Arc<dyn SweepPolicy>,
}

impl HeapInner {
    fn new(policy: Arc<dyn SweepPolicy>) -> Self {
        Self {
            fixed_block_pages: (0..=MAX_BLOCK_SIZE).map(|_| PageStore::new()).collect(),
            next_fit_pages: PageStore::new(),
            single_object_pages: PageStore::new(),
            extra_object_pages: PageStore::new(),
            pending_finalizers: Mutex::new(FinalizerQueue::default()),
            concurrent_sweepers: AtomicUsize::new(0),
            page_epoch: AtomicU64::new(0),
            size_tracker: AllocatedSizeTracker::default(),
            policy,
        }
    }

    #[inline]
    pub fn policy(&self) -> &dyn SweepPolicy {
        &*self.policy
    }

    #[inline]
    pub fn page_epoch(&self) -> u64 {
        self.page_epoch.load(Ordering::Acquire)
    }

    #[inline]
    pub fn size_tracker(&self) -> &AllocatedSizeTracker {
        &self.size_tracker
    }

    /// Bytes committed by allocators plus bytes that survived the last sweep.
    #[inline]
    pub fn allocated_bytes(&self) -> usize {
        self.size_tracker.allocated()
    }

    fn inline_sweep(&self) -> InlineSweep<'_> {
        InlineSweep {
            sweepers: &self.concurrent_sweepers,
            policy: &*self.policy,
            tracker: &self.size_tracker,
            epoch: self.page_epoch() as i64,
        }
    }

    // ── Page acquisition ──

    pub fn get_fixed_block_page(
        &self,
        cells: u32,
        queue: &mut FinalizerQueue,
    ) -> NonNull<FixedBlockPage> {
        debug_assert!(cells > 0 && cells as usize <= MAX_BLOCK_SIZE);
        self.fixed_block_pages[cells as usize].get_page(cells, queue, &self.inline_sweep())
    }

    pub fn get_next_fit_page(&self, cells: u32, queue: &mut FinalizerQueue) -> NonNull<NextFitPage> {
        self.next_fit_pages.get_page(cells, queue, &self.inline_sweep())
    }

    /// Always maps a new page.
    pub fn get_single_object_page(&self, cells: u64) -> NonNull<SingleObjectPage> {
        self.single_object_pages.new_page(cells)
    }

    pub fn get_extra_object_page(&self, queue: &mut FinalizerQueue) -> NonNull<ExtraObjectPage> {
        self.extra_object_pages.get_page((), queue, &self.inline_sweep())
    }

    // ── Collection ──

    /// Hands every page over to the coming sweep. Once per cycle, with the
    /// world stopped.
    pub fn prepare_for_gc(&self) {
        self.page_epoch.fetch_add(1, Ordering::AcqRel);
        for store in &self.fixed_block_pages[..] {
            store.prepare_for_gc();
        }
        self.next_fit_pages.prepare_for_gc();
        self.single_object_pages.prepare_for_gc();
        self.extra_object_pages.prepare_for_gc();
        self.size_tracker.reset();
        log::trace!("heap prepared for page epoch {}", self.page_epoch());
    }

    /// Sweeps every store and returns the blocks that need finalizing.
    ///
    /// Does not return while any other thread is still sweeping a page.
    pub fn sweep(&self, epoch: i64) -> FinalizerQueue {
        let mut queue = FinalizerQueue::default();
        let sweepers = &self.concurrent_sweepers;
        {
            let mut scope = SweepScope::new(&*self.policy, epoch, "objects");
            for store in &self.fixed_block_pages[..] {
                store.sweep(&mut scope, &mut queue, sweepers);
            }
            self.next_fit_pages.sweep(&mut scope, &mut queue, sweepers);
            self.single_object_pages
                .sweep_and_free(&mut scope, &mut queue, sweepers);
            self.size_tracker.add(scope.stats().live_bytes);
        }
        {
            let mut scope = SweepScope::new(&*self.policy, epoch, "extra objects");
            self.extra_object_pages.sweep(&mut scope, &mut queue, sweepers);
        }
        while self.concurrent_sweepers.load(Ordering::Acquire) > 0 {
            thread::yield_now();
        }
        queue
    }

    /// Helps [`HeapInner::sweep`] with the fixed block stores, largest size
    /// class first so it meets the collector in the middle.
    pub fn assist_sweep(&self, epoch: i64) -> FinalizerQueue {
        let mut queue = FinalizerQueue::default();
        let mut scope = SweepScope::new(&*self.policy, epoch, "assist");
        for store in self.fixed_block_pages.iter().rev() {
            store.sweep(&mut scope, &mut queue, &self.concurrent_sweepers);
        }
        self.size_tracker.add(scope.stats().live_bytes);
        queue
    }

    /// Unmaps empty pages beyond `keep` per store.
    pub fn release_empty_pages(&self, keep: usize) -> usize {
        let released = self
            .fixed_block_pages
            .iter()
            .map(|store| store.release_empty(keep))
            .sum::<usize>()
            + self.next_fit_pages.release_empty(keep)
            + self.extra_object_pages.release_empty(keep);
        if released > 0 {
            log::debug!("released {released} empty pages");
        }
        released
    }

    // ── Finalizers ──

    pub fn add_to_finalizer_queue(&self, queue: FinalizerQueue) {
        if queue.is_empty() {
            return;
        }
        self.pending_finalizers.lock().merge(queue);
    }

    pub fn extract_finalizer_queue(&self) -> FinalizerQueue {
        std::mem::take(&mut *self.pending_finalizers.lock())
    }

    // ── Traversal ──
    // Everything below reads page contents and must run with the world
    // stopped or otherwise without concurrent allocation.

    pub fn traverse_allocated_blocks(&self, mut f: impl FnMut(BlockRef)) {
        for store in &self.fixed_block_pages[..] {
            store.traverse_pages(|page| page.allocated_blocks().for_each(&mut f));
        }
        self.next_fit_pages
            .traverse_pages(|page| page.allocated_blocks().for_each(&mut f));
        self.single_object_pages
            .traverse_pages(|page| page.allocated_blocks().for_each(&mut f));
    }

    #[must_use]
    pub fn allocated_blocks(&self) -> Vec<BlockRef> {
        let mut blocks = Vec::new();
        self.traverse_allocated_blocks(|block| blocks.push(block));
        blocks
    }

    pub fn traverse_allocated_extra_objects(&self, mut f: impl FnMut(&ExtraObjectData)) {
        self.extra_object_pages
            .traverse_pages(|page| page.allocated_extra_objects().for_each(&mut f));
    }

    pub fn traverse_pages(&self, mut f: impl FnMut(PageInfo)) {
        for part in 0..FIXED_PAGE_PARTS {
            self.traverse_fixed_pages_part(part, &mut f);
        }
        self.next_fit_pages.traverse_pages(|page| f(page.info()));
        self.single_object_pages.traverse_pages(|page| f(page.info()));
        self.extra_object_pages.traverse_pages(|page| f(page.info()));
    }

    /// Visits the fixed block pages of one of [`FIXED_PAGE_PARTS`] size
    /// class ranges, so several threads can dump the heap together.
    pub fn traverse_fixed_pages_part(&self, part: usize, mut f: impl FnMut(PageInfo)) {
        assert!(part < FIXED_PAGE_PARTS, "no fixed page part {part}");
        let len = self.fixed_block_pages.len();
        let bounds = [0, len / 5, len * 9 / 20, len];
        for store in &self.fixed_block_pages[bounds[part]..bounds[part + 1]] {
            store.traverse_pages(|page| f(page.info()));
        }
    }

    pub fn page_census(&self) -> HeapCensus {
        let mut census = HeapCensus::default();
        for store in &self.fixed_block_pages[..] {
            census.fixed_block += store.census();
            store.traverse_pages(|page| census.objects += page.stats());
        }
        census.next_fit = self.next_fit_pages.census();
        self.next_fit_pages
            .traverse_pages(|page| census.objects += page.stats());
        census.single_object = self.single_object_pages.census();
        self.single_object_pages
            .traverse_pages(|page| census.objects += page.stats());
        census.extra_object = self.extra_object_pages.census();
        self.extra_object_pages
            .traverse_pages(|page| census.extra_objects += page.stats());
        census
    }

    /// Drops every page and pending finalizer.
    pub fn clear_for_tests(&self) {
        for store in &self.fixed_block_pages[..] {
            store.clear_for_tests();
        }
        self.next_fit_pages.clear_for_tests();
        self.single_object_pages.clear_for_tests();
        self.extra_object_pages.clear_for_tests();
        *self.pending_finalizers.lock() = FinalizerQueue::default();
        self.size_tracker.reset();
    }
}

// ── Heap (Arc wrapper) ────────────────────────────────────────────────

#[derive(Clone)]
pub struct Heap(Arc<HeapInner>);

impl Heap {
    #[must_use]
    pub fn new(policy: Arc<dyn SweepPolicy>) -> Self {
        Self(Arc::new(HeapInner::new(policy)))
    }

    #[must_use]
    pub fn allocator(&self) -> crate::ThreadAllocator {
        crate::ThreadAllocator::new(self.clone())
    }
}

impl Deref for Heap {
    type Target = HeapInner;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("allocated_bytes", &self.allocated_bytes())
            .field("page_epoch", &self.page_epoch())
            .finish_non_exhaustive()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::{BlockFate, page::CELL_SIZE};

    fn heap_with(policy: impl SweepPolicy + 'static) -> Heap {
        Heap::new(Arc::new(policy))
    }

    #[test]
    fn size_class_routing() {
        assert_eq!(SizeClass::for_cells(0), SizeClass::FixedBlock(1));
        assert_eq!(SizeClass::for_cells(1), SizeClass::FixedBlock(1));
        assert_eq!(
            SizeClass::for_cells(MAX_BLOCK_SIZE as u64),
            SizeClass::FixedBlock(MAX_BLOCK_SIZE as u32)
        );
        assert_eq!(
            SizeClass::for_cells(MAX_BLOCK_SIZE as u64 + 1),
            SizeClass::NextFit(MAX_BLOCK_SIZE as u32 + 1)
        );
        let max = NextFitPage::max_block_size();
        assert_eq!(SizeClass::for_cells(max as u64), SizeClass::NextFit(max));
        assert_eq!(
            SizeClass::for_cells(max as u64 + 1),
            SizeClass::SingleObject(max as u64 + 1)
        );
        assert_eq!(SizeClass::for_bytes(17), SizeClass::FixedBlock(3));
        assert_eq!(SizeClass::for_bytes(0), SizeClass::FixedBlock(1));
    }

    #[test]
    fn tracker_reports_crossing_once() {
        let tracker = AllocatedSizeTracker::default();
        tracker.set_target(100);
        assert!(!tracker.add(60));
        assert!(tracker.add(60));
        assert!(!tracker.add(60));
        tracker.reset();
        assert!(tracker.add(100));
    }

    #[test]
    fn finalizer_accumulator_merges() {
        let heap = heap_with(|_: BlockRef| BlockFate::Dead);
        let mut allocator = heap.allocator();
        let a = allocator.allocate(8);
        let b = allocator.allocate(8);
        let mut first = FinalizerQueue::default();
        first.push(a);
        let mut second = FinalizerQueue::default();
        second.push(b);
        heap.add_to_finalizer_queue(first);
        heap.add_to_finalizer_queue(second);
        let drained: Vec<_> = heap.extract_finalizer_queue().into_iter().collect();
        assert_eq!(drained, vec![a, b]);
        assert!(heap.extract_finalizer_queue().is_empty());
    }

    #[test]
    fn sweep_frees_by_policy_and_tracks_survivors() {
        let live = Arc::new(Mutex::new(HashSet::new()));
        let policy = {
            let live = Arc::clone(&live);
            move |block: BlockRef| {
                if live.lock().contains(&block) { BlockFate::Live } else { BlockFate::Dead }
            }
        };
        let heap = heap_with(policy);
        let mut allocator = heap.allocator();
        let blocks: Vec<_> = (0..1000).map(|i| allocator.allocate(8 + (i % 64) * 8)).collect();
        let big = allocator.allocate(4096);
        let huge = allocator.allocate((NextFitPage::max_block_size() as usize + 1) * CELL_SIZE);
        {
            let mut live = live.lock();
            live.extend(blocks.iter().step_by(7).copied());
            live.insert(huge);
        }

        heap.prepare_for_gc();
        let queue = heap.sweep(1);
        assert!(queue.is_empty());

        let survivors: HashSet<_> = heap.allocated_blocks().into_iter().collect();
        assert_eq!(survivors, *live.lock());
        assert!(!survivors.contains(&big));

        let expected: usize = blocks
            .iter()
            .enumerate()
            .step_by(7)
            .map(|(i, _)| (1 + i % 64) * CELL_SIZE)
            .sum::<usize>()
            + (NextFitPage::max_block_size() as usize + 1) * CELL_SIZE;
        assert_eq!(heap.allocated_bytes(), expected);
    }

    #[test]
    fn fixed_page_parts_cover_every_fixed_page() {
        let heap = heap_with(|_: BlockRef| BlockFate::Live);
        let mut allocator = heap.allocator();
        for cells in 1..=MAX_BLOCK_SIZE {
            allocator.allocate(cells * CELL_SIZE);
        }
        let mut from_parts = Vec::new();
        for part in 0..FIXED_PAGE_PARTS {
            heap.traverse_fixed_pages_part(part, |info| from_parts.push(info));
        }
        assert_eq!(from_parts.len(), MAX_BLOCK_SIZE);
        let mut all = Vec::new();
        heap.traverse_pages(|info| all.push(info));
        assert_eq!(&all[..from_parts.len()], &from_parts[..]);

        let census = heap.page_census();
        assert_eq!(census.fixed_block.used, MAX_BLOCK_SIZE);
        assert_eq!(census.fixed_block.total(), MAX_BLOCK_SIZE);
        heap.clear_for_tests();
        assert_eq!(heap.page_census().fixed_block.total(), 0);
    }

    #[test]
    fn release_keeps_requested_empty_pages() {
        let heap = heap_with(|_: BlockRef| BlockFate::Dead);
        let mut allocator = heap.allocator();
        for _ in 0..3 * (FixedBlockPage::cell_count() as usize) {
            allocator.allocate(8);
        }
        heap.prepare_for_gc();
        heap.sweep(1);
        assert_eq!(heap.page_census().fixed_block.empty, 3);
        assert_eq!(heap.release_empty_pages(1), 2);
        assert_eq!(heap.page_census().fixed_block.empty, 1);
        assert_eq!(heap.allocated_bytes(), 0);
    }
}
