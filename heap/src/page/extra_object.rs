use std::{mem, ptr, ptr::NonNull};

use crate::{
    BlockFate, FinalizerQueue, SweepScope,
    object::{ExtraFlags, ExtraObjectData, ObjectRef},
    page::{BlockRef, HeapPage, PAGE_SIZE, PageKind, PageStats, header_bytes},
    system,
};

const NO_CELL: u32 = u32::MAX;

#[repr(C)]
struct ExtraObjectCell {
    next_free: u32,
    allocated: u32,
    data: ExtraObjectData,
}

/// Page of fixed size [`ExtraObjectData`] records with an index free list.
#[repr(C)]
#[derive(Debug)]
pub struct ExtraObjectPage {
    next_free: u32,
    allocated: u32,
    cells: NonNull<ExtraObjectCell>,
}

impl ExtraObjectPage {
    const HEADER_BYTES: usize = header_bytes::<Self>();

    #[inline]
    #[must_use]
    pub const fn cell_count() -> u32 {
        ((PAGE_SIZE - Self::HEADER_BYTES) / mem::size_of::<ExtraObjectCell>()) as u32
    }

    #[inline]
    fn cell(&self, index: u32) -> *mut ExtraObjectCell {
        debug_assert!(index < Self::cell_count());
        // SAFETY: index is within the cell array
        unsafe { self.cells.as_ptr().add(index as usize) }
    }

    /// Claims a record and initialises it for `base`.
    pub fn try_allocate(
        &mut self,
        base: Option<ObjectRef>,
        flags: ExtraFlags,
    ) -> Option<NonNull<ExtraObjectData>> {
        if self.next_free == NO_CELL {
            return None;
        }
        let cell = self.cell(self.next_free);
        // SAFETY: free cells are owned by the page
        unsafe {
            self.next_free = (*cell).next_free;
            (*cell).allocated = 1;
            let data = &raw mut (*cell).data;
            ptr::write(data, ExtraObjectData::new(base, flags));
            self.allocated += 1;
            Some(NonNull::new_unchecked(data))
        }
    }

    /// Allocated records in address order.
    pub fn allocated_extra_objects(&self) -> impl Iterator<Item = &ExtraObjectData> + '_ {
        (0..Self::cell_count()).filter_map(move |index| {
            // SAFETY: index is in range; allocated cells hold initialised data
            let cell = unsafe { &*self.cell(index) };
            (cell.allocated != 0).then_some(&cell.data)
        })
    }

    fn link_free_cells(&mut self, is_free: impl Fn(&ExtraObjectCell) -> bool) {
        let mut head = NO_CELL;
        for index in (0..Self::cell_count()).rev() {
            // SAFETY: index is in range
            let cell = unsafe { &mut *self.cell(index) };
            if is_free(cell) {
                cell.next_free = head;
                head = index;
            }
        }
        self.next_free = head;
    }
}

impl HeapPage for ExtraObjectPage {
    type Request = ();

    const KIND: PageKind = PageKind::ExtraObject;

    fn create(_: ()) -> NonNull<Self> {
        let region = system::map_page_region(PAGE_SIZE);
        let page = region.cast::<Self>();
        // SAFETY: fresh PAGE_SIZE region exclusively owned here
        unsafe {
            let cells = NonNull::new_unchecked(region.as_ptr().add(Self::HEADER_BYTES)).cast();
            ptr::write(
                page.as_ptr(),
                Self {
                    next_free: NO_CELL,
                    allocated: 0,
                    cells,
                },
            );
            (*page.as_ptr()).link_free_cells(|_| true);
        }
        log::trace!("extra object page {:p} created", page);
        page
    }

    unsafe fn destroy(page: NonNull<Self>) {
        log::trace!("extra object page {:p} destroyed", page);
        system::unmap_memory(page.cast(), PAGE_SIZE);
    }

    fn has_room(&self, _: ()) -> bool {
        self.next_free != NO_CELL
    }

    fn sweep(&mut self, scope: &mut SweepScope<'_>, queue: &mut FinalizerQueue) -> bool {
        let mut live = 0;
        for index in 0..Self::cell_count() {
            // SAFETY: index is in range
            let cell = unsafe { &mut *self.cell(index) };
            if cell.allocated == 0 {
                continue;
            }
            match scope.sweep_extra_object(&cell.data) {
                BlockFate::Live => live += 1,
                BlockFate::Finalize => {
                    queue.push(BlockRef::new(NonNull::from(&mut cell.data).cast()));
                    live += 1;
                }
                BlockFate::Dead => {
                    cell.allocated = 0;
                    // SAFETY: the record is dead; zero it like any freed block
                    unsafe { ptr::write_bytes(&raw mut cell.data, 0, 1) };
                }
            }
        }
        self.link_free_cells(|cell| cell.allocated == 0);
        self.allocated = live;
        live == 0
    }

    fn stats(&self) -> PageStats {
        let record = mem::size_of::<ExtraObjectCell>();
        PageStats {
            capacity_bytes: Self::cell_count() as usize * record,
            allocated_bytes: self.allocated as usize * record,
        }
    }

    fn region_size(&self) -> usize {
        PAGE_SIZE
    }
}
