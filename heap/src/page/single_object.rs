use std::{ptr, ptr::NonNull};

use crate::{
    BlockFate, FinalizerQueue, SweepScope,
    page::{BlockRef, CELL_SIZE, HeapPage, NextFitPage, PageKind, PageStats, header_bytes},
    system,
};

/// Page holding exactly one large block.
#[repr(C)]
#[derive(Debug)]
pub struct SingleObjectPage {
    allocated: bool,
    cells: u64,
    data: NonNull<u8>,
}

impl SingleObjectPage {
    const HEADER_BYTES: usize = header_bytes::<Self>();

    #[inline]
    fn block_bytes(&self) -> usize {
        self.cells as usize * CELL_SIZE
    }

    #[inline]
    fn block(&self) -> BlockRef {
        BlockRef::new(self.data)
    }

    /// Claims the page's block. Fails if it is already taken.
    pub fn try_allocate(&mut self) -> Option<BlockRef> {
        if self.allocated {
            return None;
        }
        self.allocated = true;
        Some(self.block())
    }

    pub fn allocated_blocks(&self) -> impl Iterator<Item = BlockRef> + '_ {
        self.allocated.then(|| self.block()).into_iter()
    }

    pub fn allocated_blocks_with_offset(&self) -> impl Iterator<Item = (BlockRef, usize)> + '_ {
        self.allocated_blocks().map(|block| (block, Self::HEADER_BYTES))
    }

    /// Region size for a page of `cells` cells, `None` if it overflows.
    fn region_bytes(cells: u64) -> Option<usize> {
        usize::try_from(cells)
            .ok()?
            .checked_mul(CELL_SIZE)?
            .checked_add(Self::HEADER_BYTES)
    }
}

impl HeapPage for SingleObjectPage {
    type Request = u64;

    const KIND: PageKind = PageKind::SingleObject;

    fn create(cells: u64) -> NonNull<Self> {
        assert!(
            cells > NextFitPage::max_block_size() as u64,
            "{cells} cells fit a next fit page"
        );
        // an overflowing size can never be mapped and takes the OOM path
        let size = Self::region_bytes(cells).unwrap_or(usize::MAX);
        let region = system::map_page_region(size);
        let page = region.cast::<Self>();
        // SAFETY: the region holds the header followed by `cells` cells
        unsafe {
            let data = NonNull::new_unchecked(region.as_ptr().add(Self::HEADER_BYTES));
            ptr::write(
                page.as_ptr(),
                Self {
                    allocated: false,
                    cells,
                    data,
                },
            );
        }
        log::trace!("single object page {:p} created, {size} bytes", page);
        page
    }

    unsafe fn destroy(page: NonNull<Self>) {
        // SAFETY: the caller guarantees the header is still valid
        let size = unsafe { page.as_ref() }.region_size();
        log::trace!("single object page {:p} destroyed", page);
        system::unmap_memory(page.cast(), size);
    }

    fn has_room(&self, _cells: u64) -> bool {
        !self.allocated
    }

    fn sweep(&mut self, scope: &mut SweepScope<'_>, queue: &mut FinalizerQueue) -> bool {
        if !self.allocated {
            return true;
        }
        let block = self.block();
        match scope.sweep_object(block) {
            BlockFate::Live => false,
            BlockFate::Finalize => {
                queue.push(block);
                false
            }
            BlockFate::Dead => {
                self.allocated = false;
                true
            }
        }
    }

    fn stats(&self) -> PageStats {
        PageStats {
            capacity_bytes: self.block_bytes(),
            allocated_bytes: if self.allocated { self.block_bytes() } else { 0 },
        }
    }

    fn region_size(&self) -> usize {
        Self::HEADER_BYTES + self.block_bytes()
    }
}
