//! Object header, object handles and extra object records.

use std::{
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering},
};

use bitflags::bitflags;

use crate::page::{BlockRef, CELL_SIZE};

const UNMARKED: usize = 0;
const MARKED: usize = 1;

/// Prefix of every block created through the object API.
#[repr(C)]
#[derive(Debug)]
pub struct ObjectHeader {
    mark: AtomicUsize,
    extra: AtomicPtr<ExtraObjectData>,
}

pub const HEADER_BYTES: usize = size_of::<ObjectHeader>();
const _: () = assert!(HEADER_BYTES % CELL_SIZE == 0);

/// Width of the length word in front of array elements.
pub const ARRAY_LENGTH_BYTES: usize = size_of::<usize>();

impl ObjectHeader {
    /// # Safety
    /// `block` must start with an `ObjectHeader` and stay allocated for `'a`.
    #[inline]
    pub unsafe fn from_block<'a>(block: BlockRef) -> &'a Self {
        // SAFETY: guaranteed by the caller
        unsafe { &*block.as_ptr().cast::<Self>() }
    }

    /// Sets the mark bit. Returns `true` if this call marked the object.
    #[inline]
    pub fn try_mark(&self) -> bool {
        self.mark
            .compare_exchange(UNMARKED, MARKED, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Clears the mark bit. Returns whether it was set.
    #[inline]
    pub fn try_reset_mark(&self) -> bool {
        self.mark.swap(UNMARKED, Ordering::AcqRel) == MARKED
    }

    #[inline]
    pub fn is_marked(&self) -> bool {
        self.mark.load(Ordering::Acquire) == MARKED
    }

    #[inline]
    pub fn extra(&self) -> Option<&ExtraObjectData> {
        let extra = self.extra.load(Ordering::Acquire);
        // SAFETY: installed extra records outlive their object; they only
        // become sweepable once the object itself is dead
        unsafe { extra.as_ref() }
    }

    /// Publishes `extra` unless a record is already installed, in which case
    /// the installed one is returned.
    pub(crate) fn install_extra(
        &self,
        extra: NonNull<ExtraObjectData>,
    ) -> Result<(), NonNull<ExtraObjectData>> {
        self.extra
            .compare_exchange(
                ptr::null_mut(),
                extra.as_ptr(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|installed| {
                // SAFETY: compare_exchange only fails on a non-null value
                unsafe { NonNull::new_unchecked(installed) }
            })
    }
}

/// Handle to an object payload; the header sits right in front of it.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef(BlockRef);

impl ObjectRef {
    /// # Safety
    /// `block` must have been allocated for an object, header included.
    #[inline]
    pub unsafe fn from_block(block: BlockRef) -> Self {
        Self(block)
    }

    #[inline]
    #[must_use]
    pub fn block(self) -> BlockRef {
        self.0
    }

    /// First byte of the payload.
    #[inline]
    #[must_use]
    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr().wrapping_add(HEADER_BYTES)
    }

    #[inline]
    pub fn header(&self) -> &ObjectHeader {
        // SAFETY: ObjectRefs are only built over object blocks
        unsafe { ObjectHeader::from_block(self.0) }
    }

    #[inline]
    pub fn try_mark(self) -> bool {
        self.header().try_mark()
    }

    #[inline]
    pub fn is_marked(self) -> bool {
        self.header().is_marked()
    }

    /// Element count written by [`crate::ThreadAllocator::create_array`].
    ///
    /// # Safety
    /// The object must have been created as an array.
    #[inline]
    pub unsafe fn array_length(self) -> usize {
        // SAFETY: arrays start their payload with the length word
        unsafe { ptr::read(self.as_ptr().cast::<usize>()) }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExtraFlags: u32 {
        const HAS_FINALIZER = 1 << 0;
        const IN_FINALIZER_QUEUE = 1 << 1;
        const FINALIZED = 1 << 2;
        /// The record may be reclaimed by the next extra object sweep.
        const SWEEPABLE = 1 << 3;
    }
}

/// Side record attached to an object.
#[repr(C)]
#[derive(Debug)]
pub struct ExtraObjectData {
    base: AtomicPtr<u8>,
    flags: AtomicU32,
}

impl ExtraObjectData {
    pub(crate) fn new(base: Option<ObjectRef>, flags: ExtraFlags) -> Self {
        Self {
            base: AtomicPtr::new(base.map_or(ptr::null_mut(), |o| o.block().as_ptr())),
            flags: AtomicU32::new(flags.bits()),
        }
    }

    /// Object this record belongs to, if still attached.
    pub fn base(&self) -> Option<ObjectRef> {
        let base = self.base.load(Ordering::Acquire);
        // SAFETY: the base pointer was taken from an object block
        unsafe { BlockRef::from_raw(base).map(|b| ObjectRef::from_block(b)) }
    }

    #[inline]
    pub fn flags(&self) -> ExtraFlags {
        ExtraFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    #[inline]
    pub fn insert(&self, flags: ExtraFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Detaches the record from its object and lets the sweeper take it.
    pub fn detach(&self) {
        self.base.store(ptr::null_mut(), Ordering::Release);
        self.insert(ExtraFlags::SWEEPABLE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_bit_round_trip() {
        let mut storage = [0u64; 4];
        let block = unsafe { BlockRef::from_raw(storage.as_mut_ptr().cast()) }.expect("non-null");
        let object = unsafe { ObjectRef::from_block(block) };
        assert!(!object.is_marked());
        assert!(object.try_mark());
        assert!(!object.try_mark());
        assert!(object.header().try_reset_mark());
        assert!(!object.header().try_reset_mark());
        assert_eq!(object.as_ptr() as usize - block.addr(), HEADER_BYTES);
    }

    #[test]
    fn extra_install_keeps_first_record() {
        let mut storage = [0u64; 4];
        let block = unsafe { BlockRef::from_raw(storage.as_mut_ptr().cast()) }.expect("non-null");
        let object = unsafe { ObjectRef::from_block(block) };
        let mut first = ExtraObjectData::new(Some(object), ExtraFlags::HAS_FINALIZER);
        let mut second = ExtraObjectData::new(Some(object), ExtraFlags::empty());
        let first_ptr = NonNull::from(&mut first);
        assert!(object.header().install_extra(first_ptr).is_ok());
        assert_eq!(object.header().install_extra(NonNull::from(&mut second)), Err(first_ptr));

        let extra = object.header().extra().expect("installed");
        assert_eq!(extra.base(), Some(object));
        extra.insert(ExtraFlags::IN_FINALIZER_QUEUE);
        assert!(extra.flags().contains(ExtraFlags::HAS_FINALIZER | ExtraFlags::IN_FINALIZER_QUEUE));
        extra.detach();
        assert_eq!(extra.base(), None);
        assert!(extra.flags().contains(ExtraFlags::SWEEPABLE));
    }
}
