//! Raw arena allocator backing every heap page.
//!
//! Pages are carved from anonymous mappings so they come back zeroed and
//! aligned to the OS page size. Exhaustion here is fatal.

use std::{alloc::Layout, ptr::NonNull};

#[cfg(unix)]
#[allow(unused)]
mod unix {
    use core::ffi::c_void;

    pub const PROT_NONE: i32 = 0x0;
    pub const PROT_READ: i32 = 0x1;
    pub const PROT_WRITE: i32 = 0x2;

    pub const MAP_PRIVATE: i32 = 0x02;

    #[cfg(target_os = "linux")]
    pub const MAP_ANON: i32 = 0x20;
    #[cfg(not(target_os = "linux"))]
    pub const MAP_ANON: i32 = 0x1000;

    pub const MAP_FAILED: isize = -1;

    /// posix mmap and munmap
    /// # Safety
    /// see valid mmap and munmap usage online
    unsafe extern "C" {
        pub fn mmap(
            addr: *mut c_void,
            length: usize,
            prot: i32,
            flags: i32,
            fd: i32,
            offset: isize,
        ) -> *mut c_void;

        pub fn munmap(addr: *mut c_void, length: usize) -> i32;
    }

    /// # Safety
    /// null must be checked
    #[inline]
    pub unsafe fn anonymous_mmap(len: usize) -> *mut u8 {
        // SAFETY: safe if contract holds
        let p = unsafe {
            mmap(
                core::ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANON,
                -1,
                0,
            )
        };
        if (p as isize) == MAP_FAILED {
            core::ptr::null_mut()
        } else {
            p as *mut u8
        }
    }

    /// # Safety
    /// must be allocated by mmmap
    #[inline]
    pub unsafe fn anonymous_munmap(ptr: *mut u8, len: usize) {
        // SAFETY: safe if contract holds
        let _ = unsafe { munmap(ptr.cast(), len) };
    }
}

pub const OS_PAGE_SIZE: usize = 4096;

#[inline]
fn region_layout(size: usize) -> Layout {
    // size is never zero for a page and OS_PAGE_SIZE is a power of two
    Layout::from_size_align(size.max(1), OS_PAGE_SIZE)
        .unwrap_or_else(|_| Layout::new::<u8>())
}

/// Maps `size` bytes of zeroed, OS-page-aligned memory.
#[must_use]
pub fn map_memory(size: usize) -> Option<NonNull<u8>> {
    #[cfg(unix)]
    {
        // SAFETY: anonymous private mapping, null is checked by NonNull::new
        let ptr = unsafe { unix::anonymous_mmap(size) };
        NonNull::new(ptr)
    }
    #[cfg(not(unix))]
    {
        // SAFETY: layout has a non-zero size
        let ptr = unsafe { std::alloc::alloc_zeroed(region_layout(size)) };
        NonNull::new(ptr)
    }
}

/// Releases a region obtained from [`map_memory`].
pub fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    #[cfg(unix)]
    {
        // SAFETY: ptr must be from mmap allocation
        unsafe { unix::anonymous_munmap(ptr.as_ptr(), size) };
    }
    #[cfg(not(unix))]
    {
        // SAFETY: ptr was allocated by map_memory with the same layout
        unsafe { std::alloc::dealloc(ptr.as_ptr(), region_layout(size)) };
    }
}

/// Maps a region for a page, treating failure as fatal.
pub fn map_page_region(size: usize) -> NonNull<u8> {
    match map_memory(size) {
        Some(ptr) => {
            debug_assert!(ptr.as_ptr() as usize % OS_PAGE_SIZE == 0);
            ptr
        }
        None => {
            log::error!("out of memory: failed to map a {size} byte page");
            std::alloc::handle_alloc_error(region_layout(size))
        }
    }
}
