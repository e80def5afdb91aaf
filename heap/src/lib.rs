//! Page based heap for a tracing, non-moving garbage collector.
//!
//! Memory comes from the OS in fixed size pages. Small blocks live in
//! [`page::FixedBlockPage`]s with one page per size class, medium blocks in
//! [`page::NextFitPage`]s and anything bigger gets its own
//! [`page::SingleObjectPage`]. Side records for finalizers live in
//! [`page::ExtraObjectPage`]s.
//!
//! Threads allocate through a [`ThreadAllocator`] that caches one page per
//! kind. The collector stops the world, lets a [`Marker`] mark the reachable
//! objects, and sweeps the pages with a [`SweepPolicy`] while mutators run
//! again and sweep whatever page they grab first.

mod allocator;
mod finalizer;
mod heap;
mod object;
pub mod page;
mod runtime;
mod safepoint;
mod settings;
mod state;
mod store;
mod sweep;
pub mod system;

pub use allocator::ThreadAllocator;
pub use finalizer::{FinalizerCallback, FinalizerProcessor, FinalizerQueue};
pub use heap::{
    AllocatedSizeTracker, FIXED_PAGE_PARTS, Heap, HeapCensus, HeapInner, SizeClass,
};
pub use object::{
    ARRAY_LENGTH_BYTES, ExtraFlags, ExtraObjectData, HEADER_BYTES, ObjectHeader, ObjectRef,
};
pub use page::{BlockRef, CELL_SIZE, MAX_BLOCK_SIZE, PAGE_SIZE, PageInfo, PageKind, PageStats};
pub use runtime::{CycleStats, GcRuntime, Marker, Mutator, RuntimeError};
pub use safepoint::{
    SafepointStats, StopReason, ThreadNode, ThreadRegistry, ThreadState, WorldStopped,
};
pub use settings::{GcCreateInfo, GcSettings, MAX_SWEEP_ASSISTANTS, SettingsError};
pub use state::{GC_SUSPENDED, GcStateHolder, MAX_SUSPEND_TIME};
pub use store::{InlineSweep, PageCensus, PageStore};
pub use sweep::{BlockFate, MarkBitSweep, SweepPolicy, SweepScope, SweepStats};
pub use system::OS_PAGE_SIZE;
