//! Reclaim predicates and per-sweep bookkeeping.

use crate::{
    object::{ExtraFlags, ExtraObjectData, ObjectHeader},
    page::BlockRef,
};

/// What a sweep does with an allocated block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockFate {
    Live,
    Dead,
    /// Keep the block allocated and hand it to the finalizer queue.
    Finalize,
}

/// Decides the fate of every allocated block during a sweep.
///
/// Called from the collector, sweep assistants and mutators sweeping inline,
/// possibly at the same time.
pub trait SweepPolicy: Send + Sync {
    fn sweep_object(&self, block: BlockRef) -> BlockFate;

    fn sweep_extra_object(&self, extra: &ExtraObjectData) -> BlockFate {
        if extra.flags().contains(ExtraFlags::SWEEPABLE) {
            BlockFate::Dead
        } else {
            BlockFate::Live
        }
    }

    /// Runs after the finalizer callback for `block` has returned.
    fn on_finalized(&self, _block: BlockRef) {}
}

impl<F> SweepPolicy for F
where
    F: Fn(BlockRef) -> BlockFate + Send + Sync,
{
    #[inline]
    fn sweep_object(&self, block: BlockRef) -> BlockFate {
        self(block)
    }
}

/// Mark-bit policy for blocks created through the object API.
///
/// An unmarked object with a pending finalizer is queued once and kept until
/// it has been finalized; the next cycle that finds it unmarked reclaims it
/// together with its extra record.
#[derive(Debug, Default, Clone, Copy)]
pub struct MarkBitSweep;

impl SweepPolicy for MarkBitSweep {
    fn sweep_object(&self, block: BlockRef) -> BlockFate {
        // SAFETY: this policy is only installed for heaps whose blocks are
        // all created with an object header
        let header = unsafe { ObjectHeader::from_block(block) };
        if header.try_reset_mark() {
            return BlockFate::Live;
        }
        let Some(extra) = header.extra() else {
            return BlockFate::Dead;
        };
        let flags = extra.flags();
        if flags.contains(ExtraFlags::FINALIZED) || !flags.contains(ExtraFlags::HAS_FINALIZER) {
            extra.insert(ExtraFlags::SWEEPABLE);
            return BlockFate::Dead;
        }
        if flags.contains(ExtraFlags::IN_FINALIZER_QUEUE) {
            return BlockFate::Live;
        }
        extra.insert(ExtraFlags::IN_FINALIZER_QUEUE);
        BlockFate::Finalize
    }

    fn on_finalized(&self, block: BlockRef) {
        // SAFETY: queued blocks stay allocated until they are FINALIZED
        let header = unsafe { ObjectHeader::from_block(block) };
        if let Some(extra) = header.extra() {
            extra.insert(ExtraFlags::FINALIZED);
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub kept: usize,
    pub swept: usize,
    pub queued: usize,
    /// Bytes left allocated in the pages swept under this scope.
    pub live_bytes: usize,
}

impl std::ops::AddAssign for SweepStats {
    fn add_assign(&mut self, rhs: Self) {
        self.kept += rhs.kept;
        self.swept += rhs.swept;
        self.queued += rhs.queued;
        self.live_bytes += rhs.live_bytes;
    }
}

/// One sweep pass over some set of pages; logs its totals when dropped.
pub struct SweepScope<'a> {
    policy: &'a dyn SweepPolicy,
    epoch: i64,
    label: &'static str,
    stats: SweepStats,
}

impl<'a> SweepScope<'a> {
    pub fn new(policy: &'a dyn SweepPolicy, epoch: i64, label: &'static str) -> Self {
        Self {
            policy,
            epoch,
            label,
            stats: SweepStats::default(),
        }
    }

    #[inline]
    pub fn sweep_object(&mut self, block: BlockRef) -> BlockFate {
        let fate = self.policy.sweep_object(block);
        self.count(fate);
        fate
    }

    #[inline]
    pub fn sweep_extra_object(&mut self, extra: &ExtraObjectData) -> BlockFate {
        let fate = self.policy.sweep_extra_object(extra);
        self.count(fate);
        fate
    }

    #[inline]
    fn count(&mut self, fate: BlockFate) {
        match fate {
            BlockFate::Live => self.stats.kept += 1,
            BlockFate::Dead => self.stats.swept += 1,
            BlockFate::Finalize => self.stats.queued += 1,
        }
    }

    #[inline]
    pub(crate) fn add_live_bytes(&mut self, bytes: usize) {
        self.stats.live_bytes += bytes;
    }

    pub fn stats(&self) -> SweepStats {
        self.stats
    }

    pub fn epoch(&self) -> i64 {
        self.epoch
    }
}

impl Drop for SweepScope<'_> {
    fn drop(&mut self) {
        let SweepStats { kept, swept, queued, live_bytes } = self.stats;
        if kept + swept + queued == 0 {
            return;
        }
        log::debug!(
            "epoch {} sweep [{}]: kept {kept}, swept {swept}, queued {queued}, {live_bytes} bytes live",
            self.epoch,
            self.label,
        );
    }
}

#[cfg(test)]
mod tests {
    use std::ptr::NonNull;

    use super::*;
    use crate::object::ObjectRef;

    struct Object {
        storage: [u64; 4],
        extra: ExtraObjectData,
    }

    impl Object {
        fn new(flags: Option<ExtraFlags>) -> Box<Self> {
            let mut object = Box::new(Self {
                storage: [0; 4],
                extra: ExtraObjectData::new(None, ExtraFlags::empty()),
            });
            if let Some(flags) = flags {
                object.extra.insert(flags);
                let extra = NonNull::from(&mut object.extra);
                object.object().header().install_extra(extra).expect("fresh header");
            }
            object
        }

        fn object(&mut self) -> ObjectRef {
            let block = unsafe { BlockRef::from_raw(self.storage.as_mut_ptr().cast()) }.expect("non-null");
            unsafe { ObjectRef::from_block(block) }
        }
    }

    #[test]
    fn marked_objects_survive_once() {
        let mut object = Object::new(None);
        let obj = object.object();
        obj.try_mark();
        assert_eq!(MarkBitSweep.sweep_object(obj.block()), BlockFate::Live);
        assert_eq!(MarkBitSweep.sweep_object(obj.block()), BlockFate::Dead);
    }

    #[test]
    fn finalizable_objects_queue_then_die() {
        let mut object = Object::new(Some(ExtraFlags::HAS_FINALIZER));
        let obj = object.object();
        assert_eq!(MarkBitSweep.sweep_object(obj.block()), BlockFate::Finalize);
        // still waiting for the finalizer
        assert_eq!(MarkBitSweep.sweep_object(obj.block()), BlockFate::Live);
        MarkBitSweep.on_finalized(obj.block());
        assert_eq!(MarkBitSweep.sweep_object(obj.block()), BlockFate::Dead);
        assert_eq!(MarkBitSweep.sweep_extra_object(&object.extra), BlockFate::Dead);
    }

    #[test]
    fn dead_objects_release_plain_extra_records() {
        let mut object = Object::new(Some(ExtraFlags::empty()));
        let obj = object.object();
        assert_eq!(MarkBitSweep.sweep_extra_object(&object.extra), BlockFate::Live);
        assert_eq!(MarkBitSweep.sweep_object(obj.block()), BlockFate::Dead);
        assert!(object.extra.flags().contains(ExtraFlags::SWEEPABLE));
    }

    #[test]
    fn scope_counts_fates() {
        let policy = |block: BlockRef| {
            if block.addr() % 16 == 0 { BlockFate::Live } else { BlockFate::Dead }
        };
        let mut scope = SweepScope::new(&policy, 3, "test");
        for addr in [16usize, 24, 32, 40, 48] {
            let block = unsafe { BlockRef::from_raw(addr as *mut u8) }.expect("non-null");
            scope.sweep_object(block);
        }
        assert_eq!(scope.stats().kept, 3);
        assert_eq!(scope.stats().swept, 2);
        assert_eq!(scope.epoch(), 3);
    }
}
