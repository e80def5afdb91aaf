use std::{mem, ptr, ptr::NonNull};

use crate::{
    BlockFate, FinalizerQueue, SweepScope,
    page::{BlockRef, CELL_SIZE, HeapPage, PAGE_SIZE, PageKind, PageStats, header_bytes},
    system,
};

/// Header cell in front of every next-fit block. `size` counts the header.
#[repr(C, align(8))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockHeader {
    allocated: u32,
    size: u32,
}

const _: () = assert!(mem::size_of::<BlockHeader>() == CELL_SIZE);

/// Page of variable sized blocks, allocated next-fit from a cursor block.
///
/// Cell 0 is a zero sized sentinel; a cursor of 0 means the page had no free
/// block at the last search.
#[repr(C)]
#[derive(Debug)]
pub struct NextFitPage {
    cursor: u32,
    allocated_bytes: usize,
    cells: NonNull<u8>,
}

impl NextFitPage {
    const HEADER_BYTES: usize = header_bytes::<Self>();

    #[inline]
    #[must_use]
    pub const fn cell_count() -> u32 {
        ((PAGE_SIZE - Self::HEADER_BYTES) / CELL_SIZE) as u32
    }

    /// Largest request in data cells a fresh page can satisfy.
    #[inline]
    #[must_use]
    pub const fn max_block_size() -> u32 {
        Self::cell_count() - 2
    }

    #[inline]
    fn cell_ptr(&self, cell: u32) -> *mut u8 {
        debug_assert!(cell <= Self::cell_count());
        // SAFETY: cell is within the mapped region
        unsafe { self.cells.as_ptr().add(cell as usize * CELL_SIZE) }
    }

    #[inline]
    fn header(&self, cell: u32) -> BlockHeader {
        // SAFETY: cell is a block boundary, cells are 8 aligned
        unsafe { ptr::read(self.cell_ptr(cell).cast::<BlockHeader>()) }
    }

    #[inline]
    fn set_header(&mut self, cell: u32, header: BlockHeader) {
        // SAFETY: cell is a block boundary owned by the page
        unsafe { ptr::write(self.cell_ptr(cell).cast::<BlockHeader>(), header) };
    }

    #[inline]
    fn data(&self, cell: u32) -> BlockRef {
        // SAFETY: cell pointers are never null
        BlockRef::new(unsafe { NonNull::new_unchecked(self.cell_ptr(cell + 1)) })
    }

    /// Claims a block with room for `cells` data cells.
    pub fn try_allocate(&mut self, cells: u32) -> Option<BlockRef> {
        let needed = cells + 1;
        if let Some(block) = self.carve(self.cursor, needed) {
            return Some(block);
        }
        self.update_cursor(needed);
        self.carve(self.cursor, needed)
    }

    /// Splits `needed` cells off the end of the free block at `cell`.
    fn carve(&mut self, cell: u32, needed: u32) -> Option<BlockRef> {
        let header = self.header(cell);
        if header.allocated != 0 || header.size < needed {
            return None;
        }
        let remaining = header.size - needed;
        if remaining > 0 {
            self.set_header(cell, BlockHeader { allocated: 0, size: remaining });
        }
        let block = cell + remaining;
        self.set_header(block, BlockHeader { allocated: 1, size: needed });
        self.allocated_bytes += needed as usize * CELL_SIZE;
        Some(self.data(block))
    }

    /// Moves the cursor to the first fitting free block at or after it, else
    /// to the largest free block in the page.
    fn update_cursor(&mut self, needed: u32) {
        let count = Self::cell_count();
        let start = self.cursor.max(1);
        let mut largest = (0, 0);

        let mut cell = start;
        while cell < count {
            let header = self.header(cell);
            if header.allocated == 0 {
                if header.size >= needed {
                    self.cursor = cell;
                    return;
                }
                if header.size > largest.1 {
                    largest = (cell, header.size);
                }
            }
            cell += header.size;
        }

        let mut cell = 1;
        while cell < start {
            let header = self.header(cell);
            if header.allocated == 0 && header.size > largest.1 {
                largest = (cell, header.size);
            }
            cell += header.size;
        }
        self.cursor = largest.0;
    }

    #[must_use]
    pub fn allocated_blocks(&self) -> NextFitBlocks<'_> {
        NextFitBlocks { page: self, cell: 1 }
    }

    pub fn allocated_blocks_with_offset(&self) -> impl Iterator<Item = (BlockRef, usize)> + '_ {
        let base = self as *const Self as usize;
        self.allocated_blocks().map(move |block| (block, block.addr() - base))
    }

    /// Whether block sizes tile the page and no two free blocks touch.
    ///
    /// Adjacent free blocks are legal between sweeps, so `coalesced` is only
    /// meaningful right after [`HeapPage::sweep`].
    #[must_use]
    pub fn check_invariants(&self, coalesced: bool) -> bool {
        let count = Self::cell_count();
        if self.header(0).size != 0 {
            return false;
        }
        let mut previous_free = false;
        let mut cell = 1;
        while cell < count {
            let header = self.header(cell);
            if header.size == 0 {
                return false;
            }
            let free = header.allocated == 0;
            if coalesced && free && previous_free {
                return false;
            }
            previous_free = free;
            cell += header.size;
        }
        cell == count
    }

    fn free_block(&mut self, cell: u32, size: u32) {
        // SAFETY: data cells of a dead block owned by the page
        unsafe {
            ptr::write_bytes(self.cell_ptr(cell + 1), 0, (size as usize - 1) * CELL_SIZE);
        }
        self.set_header(cell, BlockHeader { allocated: 0, size });
    }
}

impl HeapPage for NextFitPage {
    type Request = u32;

    const KIND: PageKind = PageKind::NextFit;

    fn create(_cells: u32) -> NonNull<Self> {
        let region = system::map_page_region(PAGE_SIZE);
        let page = region.cast::<Self>();
        // SAFETY: fresh zeroed PAGE_SIZE region exclusively owned here
        unsafe {
            let cells = NonNull::new_unchecked(region.as_ptr().add(Self::HEADER_BYTES));
            ptr::write(
                page.as_ptr(),
                Self {
                    cursor: 1,
                    allocated_bytes: 0,
                    cells,
                },
            );
            (*page.as_ptr()).set_header(
                1,
                BlockHeader {
                    allocated: 0,
                    size: Self::cell_count() - 1,
                },
            );
        }
        log::trace!("next fit page {:p} created", page);
        page
    }

    unsafe fn destroy(page: NonNull<Self>) {
        log::trace!("next fit page {:p} destroyed", page);
        system::unmap_memory(page.cast(), PAGE_SIZE);
    }

    fn has_room(&self, cells: u32) -> bool {
        let needed = cells + 1;
        let count = Self::cell_count();
        let mut cell = 1;
        while cell < count {
            let header = self.header(cell);
            if header.allocated == 0 && header.size >= needed {
                return true;
            }
            cell += header.size;
        }
        false
    }

    fn sweep(&mut self, scope: &mut SweepScope<'_>, queue: &mut FinalizerQueue) -> bool {
        let count = Self::cell_count();
        let mut live_bytes = 0;

        let mut cell = 1;
        while cell < count {
            let header = self.header(cell);
            if header.allocated != 0 {
                let block = self.data(cell);
                match scope.sweep_object(block) {
                    BlockFate::Live => live_bytes += header.size as usize * CELL_SIZE,
                    BlockFate::Finalize => {
                        queue.push(block);
                        live_bytes += header.size as usize * CELL_SIZE;
                    }
                    BlockFate::Dead => self.free_block(cell, header.size),
                }
            }
            cell += header.size;
        }

        let mut largest = (0, 0);
        let mut cell = 1;
        while cell < count {
            let header = self.header(cell);
            if header.allocated != 0 {
                cell += header.size;
                continue;
            }
            let mut size = header.size;
            while cell + size < count {
                let next = self.header(cell + size);
                if next.allocated != 0 {
                    break;
                }
                // the absorbed header becomes a data cell of this block
                self.set_header(cell + size, BlockHeader { allocated: 0, size: 0 });
                size += next.size;
            }
            self.set_header(cell, BlockHeader { allocated: 0, size });
            if size > largest.1 {
                largest = (cell, size);
            }
            cell += size;
        }

        self.cursor = largest.0;
        self.allocated_bytes = live_bytes;
        live_bytes == 0
    }

    fn stats(&self) -> PageStats {
        PageStats {
            capacity_bytes: (Self::cell_count() as usize - 1) * CELL_SIZE,
            allocated_bytes: self.allocated_bytes,
        }
    }

    fn region_size(&self) -> usize {
        PAGE_SIZE
    }
}

/// Iterator over the allocated blocks of a [`NextFitPage`].
pub struct NextFitBlocks<'a> {
    page: &'a NextFitPage,
    cell: u32,
}

impl Iterator for NextFitBlocks<'_> {
    type Item = BlockRef;

    fn next(&mut self) -> Option<BlockRef> {
        let count = NextFitPage::cell_count();
        while self.cell < count {
            let cell = self.cell;
            let header = self.page.header(cell);
            self.cell += header.size;
            if header.allocated != 0 {
                return Some(self.page.data(cell));
            }
        }
        None
    }
}
