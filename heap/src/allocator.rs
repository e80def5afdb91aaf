//! Per-thread allocation front end.

use std::{mem, ptr::NonNull};

use crate::{
    FinalizerQueue, Heap, SizeClass,
    object::{ARRAY_LENGTH_BYTES, ExtraFlags, ExtraObjectData, HEADER_BYTES, ObjectRef},
    page::{BlockRef, CELL_SIZE, ExtraObjectPage, FixedBlockPage, MAX_BLOCK_SIZE, NextFitPage},
};

/// Thread-local allocator.
///
/// Caches one page per fixed block size class plus a next-fit and an
/// extra-object page. Cached pages sit in their store's `used` list and are
/// only touched by this allocator until the heap's next `prepare_for_gc`,
/// which is noticed through the page epoch.
pub struct ThreadAllocator {
    heap: Heap,
    page_epoch: u64,
    fixed_block_pages: Box<[Option<NonNull<FixedBlockPage>>]>,
    next_fit_page: Option<NonNull<NextFitPage>>,
    extra_object_page: Option<NonNull<ExtraObjectPage>>,
    /// Blocks queued by an inline sweep, handed to the heap right after the
    /// page acquisition that found them.
    finalizer_queue: FinalizerQueue,
    /// Bytes allocated since the last commit to the heap.
    local_bytes: usize,
    gc_requested: bool,
}

// SAFETY: cached pages are owned by this allocator until the page epoch
// moves; the allocator itself is used from one thread at a time.
unsafe impl Send for ThreadAllocator {}

impl ThreadAllocator {
    #[must_use]
    pub fn new(heap: Heap) -> Self {
        let page_epoch = heap.page_epoch();
        Self {
            heap,
            page_epoch,
            fixed_block_pages: vec![None; MAX_BLOCK_SIZE + 1].into_boxed_slice(),
            next_fit_page: None,
            extra_object_page: None,
            finalizer_queue: FinalizerQueue::default(),
            local_bytes: 0,
            gc_requested: false,
        }
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Whether committed allocations crossed the heap's trigger since the
    /// last call.
    pub fn take_gc_request(&mut self) -> bool {
        mem::take(&mut self.gc_requested)
    }

    /// Allocates `bytes` of zeroed memory.
    #[inline]
    pub fn allocate(&mut self, bytes: usize) -> BlockRef {
        self.sync_with_heap();
        match SizeClass::for_bytes(bytes) {
            SizeClass::FixedBlock(cells) => self.allocate_in_fixed_block_page(cells),
            SizeClass::NextFit(cells) => self.allocate_in_next_fit_page(cells),
            SizeClass::SingleObject(cells) => self.allocate_in_single_object_page(cells),
        }
    }

    /// Allocates an object with `payload_bytes` of zeroed payload.
    pub fn create_object(&mut self, payload_bytes: usize) -> ObjectRef {
        let bytes = payload_bytes
            .checked_add(HEADER_BYTES)
            .expect("object size overflows usize");
        let block = self.allocate(bytes);
        // SAFETY: the block is zeroed and large enough for header and payload
        unsafe { ObjectRef::from_block(block) }
    }

    /// Allocates an array of `count` elements of `element_bytes` each.
    pub fn create_array(&mut self, element_bytes: usize, count: usize) -> ObjectRef {
        let payload = element_bytes
            .checked_mul(count)
            .and_then(|bytes| bytes.checked_add(ARRAY_LENGTH_BYTES))
            .expect("array size overflows usize");
        let array = self.create_object(payload);
        // SAFETY: the payload starts with room for the length word
        unsafe { array.as_ptr().cast::<usize>().write(count) };
        array
    }

    /// Attaches an extra record to `object`, or returns the one it already has.
    pub fn create_extra_object(
        &mut self,
        object: ObjectRef,
        has_finalizer: bool,
    ) -> NonNull<ExtraObjectData> {
        let flags = if has_finalizer {
            ExtraFlags::HAS_FINALIZER
        } else {
            ExtraFlags::empty()
        };
        if let Some(extra) = object.header().extra() {
            extra.insert(flags);
            return NonNull::from(extra);
        }

        self.sync_with_heap();
        let record = self.allocate_extra_record(object, flags);
        match object.header().install_extra(record) {
            Ok(()) => record,
            Err(installed) => {
                // lost the race; ours is unreachable and goes with the next sweep
                // SAFETY: record was just allocated and is owned by us
                unsafe { record.as_ref() }.detach();
                // SAFETY: installed records stay valid while the object is
                unsafe { installed.as_ref() }.insert(flags);
                installed
            }
        }
    }

    fn allocate_extra_record(
        &mut self,
        object: ObjectRef,
        flags: ExtraFlags,
    ) -> NonNull<ExtraObjectData> {
        if let Some(mut page) = self.extra_object_page {
            // SAFETY: cached pages are owned by this allocator
            if let Some(record) = unsafe { page.as_mut() }.try_allocate(Some(object), flags) {
                return record;
            }
        }
        loop {
            let mut page = self.heap.get_extra_object_page(&mut self.finalizer_queue);
            self.flush_finalizers();
            self.extra_object_page = Some(page);
            // SAFETY: get_page hands the page to us via the used list
            if let Some(record) = unsafe { page.as_mut() }.try_allocate(Some(object), flags) {
                return record;
            }
        }
    }

    #[inline]
    fn allocate_in_fixed_block_page(&mut self, cells: u32) -> BlockRef {
        let slot = cells as usize;
        if let Some(mut page) = self.fixed_block_pages[slot] {
            // SAFETY: cached pages are owned by this allocator
            if let Some(block) = unsafe { page.as_mut() }.try_allocate() {
                self.local_bytes += cells as usize * CELL_SIZE;
                return block;
            }
        }
        self.refill_fixed_block_page(cells)
    }

    #[cold]
    #[inline(never)]
    fn refill_fixed_block_page(&mut self, cells: u32) -> BlockRef {
        self.commit_local_bytes();
        loop {
            let mut page = self
                .heap
                .get_fixed_block_page(cells, &mut self.finalizer_queue);
            self.flush_finalizers();
            self.fixed_block_pages[cells as usize] = Some(page);
            // SAFETY: get_page hands the page to us via the used list
            if let Some(block) = unsafe { page.as_mut() }.try_allocate() {
                self.local_bytes += cells as usize * CELL_SIZE;
                return block;
            }
        }
    }

    fn allocate_in_next_fit_page(&mut self, cells: u32) -> BlockRef {
        let bytes = (cells as usize + 1) * CELL_SIZE;
        if let Some(mut page) = self.next_fit_page {
            // SAFETY: cached pages are owned by this allocator
            if let Some(block) = unsafe { page.as_mut() }.try_allocate(cells) {
                self.local_bytes += bytes;
                return block;
            }
        }
        self.commit_local_bytes();
        loop {
            let mut page = self
                .heap
                .get_next_fit_page(cells, &mut self.finalizer_queue);
            self.flush_finalizers();
            self.next_fit_page = Some(page);
            // SAFETY: get_page hands the page to us via the used list
            if let Some(block) = unsafe { page.as_mut() }.try_allocate(cells) {
                self.local_bytes += bytes;
                return block;
            }
        }
    }

    fn allocate_in_single_object_page(&mut self, cells: u64) -> BlockRef {
        let mut page = self.heap.get_single_object_page(cells);
        // SAFETY: a fresh page we just created
        let block = unsafe { page.as_mut() }
            .try_allocate()
            .expect("fresh single object page is empty");
        self.local_bytes += cells as usize * CELL_SIZE;
        self.commit_local_bytes();
        block
    }

    fn commit_local_bytes(&mut self) {
        let bytes = mem::take(&mut self.local_bytes);
        if self.heap.size_tracker().add(bytes) {
            self.gc_requested = true;
        }
    }

    /// Drops cached pages if the heap re-owned them since the last call.
    #[inline]
    fn sync_with_heap(&mut self) {
        let epoch = self.heap.page_epoch();
        if epoch != self.page_epoch {
            self.release_pages();
            self.page_epoch = epoch;
        }
    }

    #[cold]
    fn release_pages(&mut self) {
        self.fixed_block_pages.fill(None);
        self.next_fit_page = None;
        self.extra_object_page = None;
        // counted again by the sweep if it survives
        self.local_bytes = 0;
        self.flush_finalizers();
    }

    fn flush_finalizers(&mut self) {
        let queue = mem::take(&mut self.finalizer_queue);
        self.heap.add_to_finalizer_queue(queue);
    }
}

impl Drop for ThreadAllocator {
    fn drop(&mut self) {
        if self.heap.page_epoch() == self.page_epoch {
            self.commit_local_bytes();
        }
        self.flush_finalizers();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{BlockFate, MarkBitSweep};

    fn object_heap() -> Heap {
        Heap::new(Arc::new(MarkBitSweep))
    }

    #[test]
    fn routes_sizes_to_page_types() {
        let heap = object_heap();
        let mut allocator = heap.allocator();
        allocator.allocate(16);
        allocator.allocate(MAX_BLOCK_SIZE * CELL_SIZE + 1);
        allocator.allocate((NextFitPage::max_block_size() as usize + 1) * CELL_SIZE);

        let census = heap.page_census();
        assert_eq!(census.fixed_block.used, 1);
        assert_eq!(census.next_fit.used, 1);
        assert_eq!(census.single_object.used, 1);
    }

    #[test]
    fn blocks_are_zeroed_and_distinct() {
        let heap = object_heap();
        let mut allocator = heap.allocator();
        let mut seen = std::collections::HashSet::new();
        for size in [1usize, 8, 24, 100, 1000, 2000] {
            for _ in 0..50 {
                let block = allocator.allocate(size);
                assert!(seen.insert(block));
                // SAFETY: block holds at least `size` bytes
                let bytes = unsafe { std::slice::from_raw_parts(block.as_ptr(), size) };
                assert!(bytes.iter().all(|&b| b == 0));
                unsafe { block.as_ptr().write_bytes(0xEE, size) };
            }
        }
    }

    #[test]
    fn page_cache_is_dropped_after_prepare() {
        let heap = Heap::new(Arc::new(|_: BlockRef| BlockFate::Live));
        let mut allocator = heap.allocator();
        let before = allocator.allocate(8);
        heap.prepare_for_gc();
        assert_eq!(heap.page_census().fixed_block.unswept, 1);

        // the cached page is unswept now; it comes back through an inline sweep
        let after = allocator.allocate(8);
        assert_ne!(before, after);
        let census = heap.page_census();
        assert_eq!(census.fixed_block.unswept, 0);
        assert_eq!(census.fixed_block.used, 1);
        let blocks = heap.allocated_blocks();
        assert!(blocks.contains(&before) && blocks.contains(&after));
        assert_eq!(heap.allocated_bytes(), CELL_SIZE);
    }

    #[test]
    fn arrays_record_their_length() {
        let heap = object_heap();
        let mut allocator = heap.allocator();
        let array = allocator.create_array(8, 40);
        // SAFETY: created as an array
        assert_eq!(unsafe { array.array_length() }, 40);
        assert!(!array.is_marked());
    }

    #[test]
    fn extra_objects_attach_once() {
        let heap = object_heap();
        let mut allocator = heap.allocator();
        let object = allocator.create_object(16);
        let first = allocator.create_extra_object(object, false);
        let second = allocator.create_extra_object(object, true);
        assert_eq!(first, second);
        // SAFETY: attached record of a live object
        let extra = unsafe { first.as_ref() };
        assert!(extra.flags().contains(ExtraFlags::HAS_FINALIZER));
        assert_eq!(extra.base(), Some(object));

        let mut records = 0;
        heap.traverse_allocated_extra_objects(|_| records += 1);
        assert_eq!(records, 1);
        let census = heap.page_census();
        assert_eq!(census.extra_object.used, 1);
        let record_bytes = census.extra_objects.capacity_bytes / ExtraObjectPage::cell_count() as usize;
        assert_eq!(census.extra_objects.allocated_bytes, record_bytes);
    }

    #[test]
    fn trigger_is_reported_on_page_switch() {
        let heap = object_heap();
        heap.size_tracker().set_target(2 * crate::page::PAGE_SIZE);
        let mut allocator = heap.allocator();
        let mut requested = false;
        for _ in 0..4 * FixedBlockPage::cell_count() {
            allocator.allocate(8);
            requested |= allocator.take_gc_request();
        }
        assert!(requested);
        assert!(!allocator.take_gc_request());
    }
}
