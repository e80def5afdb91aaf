use std::{mem, ptr, ptr::NonNull};

use crate::{
    BlockFate, FinalizerQueue, SweepScope,
    page::{BlockRef, CELL_SIZE, HeapPage, MAX_BLOCK_SIZE, PAGE_SIZE, PageKind, PageStats, header_bytes},
    system,
};

/// A run of free cells threaded through the page.
///
/// Cells `first, first + bs, .., last - bs` can be bump allocated. When
/// `last < end` the cell at `last` is free as well and stores the next range.
#[repr(C, align(8))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FixedCellRange {
    first: u32,
    last: u32,
}

/// Page of uniform blocks of `block_size` cells.
#[repr(C)]
#[derive(Debug)]
pub struct FixedBlockPage {
    next_free: FixedCellRange,
    block_size: u32,
    end: u32,
    allocated_bytes: usize,
    cells: NonNull<u8>,
}

const _: () = assert!(mem::size_of::<FixedCellRange>() == CELL_SIZE);

impl FixedBlockPage {
    const HEADER_BYTES: usize = header_bytes::<Self>();

    #[inline]
    #[must_use]
    pub const fn cell_count() -> u32 {
        ((PAGE_SIZE - Self::HEADER_BYTES) / CELL_SIZE) as u32
    }

    #[inline]
    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    #[inline]
    fn block_bytes(&self) -> usize {
        self.block_size as usize * CELL_SIZE
    }

    /// Number of blocks the page holds when empty.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.end / self.block_size
    }

    #[inline]
    fn cell_ptr(&self, cell: u32) -> *mut u8 {
        debug_assert!(cell <= self.end);
        // SAFETY: cell is within the mapped region
        unsafe { self.cells.as_ptr().add(cell as usize * CELL_SIZE) }
    }

    #[inline]
    fn read_range(&self, cell: u32) -> FixedCellRange {
        debug_assert!(cell < self.end);
        // SAFETY: free link cells hold a FixedCellRange, cells are 8 aligned
        unsafe { ptr::read(self.cell_ptr(cell).cast::<FixedCellRange>()) }
    }

    #[inline]
    fn write_range(&mut self, cell: u32, range: FixedCellRange) {
        debug_assert!(cell < self.end);
        // SAFETY: cell is free and owned by the page
        unsafe { ptr::write(self.cell_ptr(cell).cast::<FixedCellRange>(), range) };
    }

    /// Claims one block, or `None` when every block is taken.
    #[inline]
    pub fn try_allocate(&mut self) -> Option<BlockRef> {
        let cell = self.next_free.first;
        if cell < self.next_free.last {
            self.next_free.first += self.block_size;
        } else {
            if cell >= self.end {
                return None;
            }
            self.next_free = self.read_range(cell);
        }
        let block = self.cell_ptr(cell);
        // SAFETY: the block is free; only its first cell can carry a range
        unsafe { ptr::write_bytes(block, 0, mem::size_of::<FixedCellRange>()) };
        self.allocated_bytes += self.block_bytes();
        // SAFETY: derived from the non-null cell base
        Some(BlockRef::new(unsafe { NonNull::new_unchecked(block) }))
    }

    /// Allocated blocks in address order.
    #[must_use]
    pub fn allocated_blocks(&self) -> FixedBlocks<'_> {
        FixedBlocks {
            page: self,
            cell: 0,
            next_free: self.next_free,
        }
    }

    /// Allocated blocks paired with their byte offset from the page start.
    pub fn allocated_blocks_with_offset(&self) -> impl Iterator<Item = (BlockRef, usize)> + '_ {
        let base = self as *const Self as usize;
        self.allocated_blocks().map(move |block| (block, block.addr() - base))
    }

    /// Links `range` into the chain being rebuilt and advances the link.
    fn link_range(&mut self, link: &mut Option<u32>, range: FixedCellRange) {
        match *link {
            None => self.next_free = range,
            Some(cell) => self.write_range(cell, range),
        }
        *link = Some(range.last);
    }
}

impl HeapPage for FixedBlockPage {
    type Request = u32;

    const KIND: PageKind = PageKind::FixedBlock;

    fn create(block_size: u32) -> NonNull<Self> {
        assert!(block_size > 0 && block_size as usize <= MAX_BLOCK_SIZE);
        let region = system::map_page_region(PAGE_SIZE);
        let end = Self::cell_count() / block_size * block_size;
        let page = region.cast::<Self>();
        // SAFETY: the region is PAGE_SIZE bytes, page aligned and exclusively
        // ours; the header fits in front of the cells
        unsafe {
            let cells = NonNull::new_unchecked(region.as_ptr().add(Self::HEADER_BYTES));
            ptr::write(
                page.as_ptr(),
                Self {
                    next_free: FixedCellRange { first: 0, last: end },
                    block_size,
                    end,
                    allocated_bytes: 0,
                    cells,
                },
            );
        }
        log::trace!("fixed block page {:p} created for {block_size} cells", page);
        page
    }

    unsafe fn destroy(page: NonNull<Self>) {
        log::trace!("fixed block page {:p} destroyed", page);
        system::unmap_memory(page.cast(), PAGE_SIZE);
    }

    #[inline]
    fn has_room(&self, _block_size: u32) -> bool {
        self.next_free.first < self.end
    }

    fn sweep(&mut self, scope: &mut SweepScope<'_>, queue: &mut FinalizerQueue) -> bool {
        let bs = self.block_size;
        let end = self.end;
        let mut old = self.next_free;
        let mut link = None;
        let mut run: Option<FixedCellRange> = None;
        let mut live = 0usize;

        let mut cell = 0;
        while cell < end {
            // Old links are read before the rebuilt chain can overwrite them:
            // every write lands strictly behind the cursor.
            let was_free = if cell < old.first {
                false
            } else if cell < old.last {
                true
            } else {
                debug_assert_eq!(cell, old.last);
                old = self.read_range(cell);
                true
            };

            let now_free = was_free || {
                // SAFETY: allocated cells are non-null
                let block = BlockRef::new(unsafe { NonNull::new_unchecked(self.cell_ptr(cell)) });
                match scope.sweep_object(block) {
                    BlockFate::Live => false,
                    BlockFate::Finalize => {
                        queue.push(block);
                        false
                    }
                    BlockFate::Dead => {
                        // SAFETY: the block is dead and owned by the page
                        unsafe { ptr::write_bytes(block.as_ptr(), 0, self.block_bytes()) };
                        true
                    }
                }
            };

            if now_free {
                run = Some(match run {
                    Some(r) => FixedCellRange { first: r.first, last: cell },
                    None => FixedCellRange { first: cell, last: cell },
                });
            } else {
                live += 1;
                if let Some(r) = run.take() {
                    self.link_range(&mut link, r);
                }
            }
            cell += bs;
        }

        let tail = match run {
            Some(r) => FixedCellRange { first: r.first, last: end },
            None => FixedCellRange { first: end, last: end },
        };
        self.link_range(&mut link, tail);

        self.allocated_bytes = live * self.block_bytes();
        live == 0
    }

    fn stats(&self) -> PageStats {
        PageStats {
            capacity_bytes: self.end as usize * CELL_SIZE,
            allocated_bytes: self.allocated_bytes,
        }
    }

    fn region_size(&self) -> usize {
        PAGE_SIZE
    }
}

/// Iterator over the allocated blocks of a [`FixedBlockPage`].
pub struct FixedBlocks<'a> {
    page: &'a FixedBlockPage,
    cell: u32,
    next_free: FixedCellRange,
}

impl Iterator for FixedBlocks<'_> {
    type Item = BlockRef;

    fn next(&mut self) -> Option<BlockRef> {
        let end = self.page.end;
        loop {
            if self.cell >= end {
                return None;
            }
            if self.cell < self.next_free.first {
                let cell = self.cell;
                self.cell += self.page.block_size;
                // SAFETY: cell pointers are never null
                return Some(BlockRef::new(unsafe { NonNull::new_unchecked(self.page.cell_ptr(cell)) }));
            }
            // at the start of a free range; jump past its link cell
            let link = self.next_free.last;
            if link >= end {
                self.cell = end;
                return None;
            }
            self.next_free = self.page.read_range(link);
            self.cell = link + self.page.block_size;
        }
    }
}
