//! Page types backing the segregated heap.
//!
//! Every page owns one region from [`crate::system::map_page_region`]; the
//! page header sits at the start of the region and its cells follow. Cells
//! are addressed by index, free-list overlays are typed views of a cell.

use std::{fmt::Debug, ptr::NonNull};

use crate::{FinalizerQueue, SweepScope};

mod extra_object;
mod fixed_block;
mod next_fit;
mod single_object;

pub use extra_object::ExtraObjectPage;
pub use fixed_block::{FixedBlockPage, FixedBlocks};
pub use next_fit::{NextFitBlocks, NextFitPage};
pub use single_object::SingleObjectPage;

pub const KIB: usize = 1024;

/// Smallest unit of allocation inside a page.
pub const CELL_SIZE: usize = 8;

#[cfg(not(feature = "compact-pages"))]
pub const PAGE_SIZE: usize = 256 * KIB;
#[cfg(feature = "compact-pages")]
pub const PAGE_SIZE: usize = 128 * KIB;

/// Largest fixed-block size class, in cells.
#[cfg(not(feature = "compact-pages"))]
pub const MAX_BLOCK_SIZE: usize = 128;
#[cfg(feature = "compact-pages")]
pub const MAX_BLOCK_SIZE: usize = 32;

/// Number of cells needed to hold `bytes`.
#[inline]
#[must_use]
pub const fn cells_for_bytes(bytes: usize) -> usize {
    bytes.div_ceil(CELL_SIZE)
}

/// Pointer to the first byte of an allocated block.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockRef(NonNull<u8>);

// SAFETY: a BlockRef is an address; access to the memory behind it is
// governed by the page ownership rules, not by the handle.
unsafe impl Send for BlockRef {}
// SAFETY: see above
unsafe impl Sync for BlockRef {}

impl BlockRef {
    #[inline]
    pub(crate) fn new(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    /// # Safety
    /// `ptr` must point to a block handed out by this heap.
    #[inline]
    pub unsafe fn from_raw(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    #[inline]
    #[must_use]
    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    #[inline]
    #[must_use]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageKind {
    FixedBlock = 1,
    NextFit = 2,
    SingleObject = 3,
    ExtraObject = 4,
}

/// Location and extent of one page, for dump tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub kind: PageKind,
    pub address: usize,
    pub size: usize,
}

/// Capacity and occupancy of a page in bytes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PageStats {
    pub capacity_bytes: usize,
    pub allocated_bytes: usize,
}

impl std::ops::AddAssign for PageStats {
    fn add_assign(&mut self, rhs: Self) {
        self.capacity_bytes += rhs.capacity_bytes;
        self.allocated_bytes += rhs.allocated_bytes;
    }
}

/// Capabilities a [`crate::PageStore`] needs from its pages.
pub trait HeapPage: Sized {
    /// Size-class parameter the page is created and queried with.
    type Request: Copy + Debug;

    const KIND: PageKind;

    /// Maps a region and constructs the page header at its start.
    fn create(request: Self::Request) -> NonNull<Self>;

    /// Releases the page region.
    ///
    /// # Safety
    /// `page` must come from [`HeapPage::create`] and must no longer be
    /// reachable from any page list or allocator.
    unsafe fn destroy(page: NonNull<Self>);

    /// Whether an allocation for `request` would succeed right now.
    fn has_room(&self, request: Self::Request) -> bool;

    /// Sweeps every allocated block. Returns `true` if the page is now empty.
    fn sweep(
        &mut self,
        scope: &mut SweepScope<'_>,
        queue: &mut FinalizerQueue,
    ) -> bool;

    fn stats(&self) -> PageStats;

    /// Size of the page region in bytes.
    fn region_size(&self) -> usize;

    fn info(&self) -> PageInfo {
        PageInfo {
            kind: Self::KIND,
            address: self as *const Self as usize,
            size: self.region_size(),
        }
    }
}

/// Bytes reserved for a page header of type `T`, rounded up to whole cells.
pub(crate) const fn header_bytes<T>() -> usize {
    std::mem::size_of::<T>().div_ceil(CELL_SIZE) * CELL_SIZE
}
