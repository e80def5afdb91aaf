//! Process wide collector context, the collector thread and mutators.

use std::{
    io,
    ptr::NonNull,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use thiserror::Error;

use crate::{
    FinalizerCallback, FinalizerProcessor, FinalizerQueue, GcSettings, GcStateHolder, Heap,
    SettingsError, SweepPolicy, ThreadAllocator,
    object::{ExtraObjectData, ObjectRef},
    page::BlockRef,
    safepoint::{StopReason, ThreadNode, ThreadRegistry, ThreadState},
};

/// Marks every object reachable from the mutators' roots.
///
/// Runs on the collector thread with the world stopped, between
/// `prepare_for_gc` and the sweep.
pub trait Marker: Send + Sync {
    fn mark(&self, heap: &Heap, epoch: i64);
}

impl<F> Marker for F
where
    F: Fn(&Heap, i64) + Send + Sync,
{
    fn mark(&self, heap: &Heap, epoch: i64) {
        self(heap, epoch)
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("failed to spawn the {thread} thread")]
    Spawn {
        thread: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("the collector is already running")]
    AlreadyStarted,
}

/// Summary of one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleStats {
    pub epoch: i64,
    /// Time the world was stopped.
    pub pause: Duration,
    pub duration: Duration,
    pub queued_finalizers: usize,
    pub released_pages: usize,
    /// Heap bytes right after the sweep.
    pub allocated_bytes: usize,
}

// ── GcRuntime ─────────────────────────────────────────────────────────

pub struct GcRuntime {
    settings: GcSettings,
    heap: Heap,
    state: Arc<GcStateHolder>,
    registry: ThreadRegistry,
    collector: Mutex<Option<JoinHandle<()>>>,
    finalizers: Mutex<Option<FinalizerProcessor>>,
    last_cycle: Mutex<Option<CycleStats>>,
    /// Held for a whole cycle, so collector thread and `collect_now` take turns.
    cycle: Mutex<()>,
}

impl GcRuntime {
    pub fn new(
        settings: GcSettings,
        policy: Arc<dyn SweepPolicy>,
    ) -> Result<Arc<Self>, RuntimeError> {
        settings.validate()?;
        let heap = Heap::new(policy);
        heap.size_tracker().set_target(settings.trigger_bytes);
        log::debug!("gc runtime created: {settings:?}");
        Ok(Arc::new(Self {
            settings,
            heap,
            state: Arc::new(GcStateHolder::new()),
            registry: ThreadRegistry::new(),
            collector: Mutex::new(None),
            finalizers: Mutex::new(None),
            last_cycle: Mutex::new(None),
            cycle: Mutex::new(()),
        }))
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn state(&self) -> &GcStateHolder {
        &self.state
    }

    pub fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &GcSettings {
        &self.settings
    }

    pub fn last_cycle(&self) -> Option<CycleStats> {
        *self.last_cycle.lock()
    }

    /// Registers the calling thread as a mutator.
    pub fn attach_mutator(self: &Arc<Self>) -> Mutator {
        Mutator::new(Arc::clone(self))
    }

    /// Spawns the collector and finalizer threads.
    ///
    /// The collector keeps the runtime alive until [`GcRuntime::shutdown`].
    pub fn start(
        self: &Arc<Self>,
        marker: Arc<dyn Marker>,
        on_finalize: FinalizerCallback,
    ) -> Result<(), RuntimeError> {
        let mut collector = self.collector.lock();
        if collector.is_some() {
            return Err(RuntimeError::AlreadyStarted);
        }
        let processor =
            FinalizerProcessor::spawn(self.heap.clone(), Arc::clone(&self.state), on_finalize)?;
        *self.finalizers.lock() = Some(processor);

        let runtime = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("gc-collector".into())
            .spawn(move || runtime.collector_loop(&*marker))
            .map_err(|source| RuntimeError::Spawn {
                thread: "collector",
                source,
            })?;
        *collector = Some(handle);
        log::info!("collector started");
        Ok(())
    }

    fn collector_loop(&self, marker: &dyn Marker) {
        while let Some(epoch) = self.state.wait_scheduled() {
            self.state.wait_resumed_for(self.settings.suspend_timeout);
            if self.state.is_shutdown() {
                break;
            }
            let _cycle = self.cycle.lock();
            if self.state.finished() >= epoch {
                // already collected by collect_now
                continue;
            }
            self.collect(marker, epoch);
        }
        log::debug!("collector stopped");
    }

    /// Runs one full cycle for `epoch` on the calling thread. Callers hold
    /// the cycle lock.
    fn collect(&self, marker: &dyn Marker, epoch: i64) -> CycleStats {
        self.state.start(epoch);
        let stats = self.perform_gc(marker, epoch);
        self.state.finish(epoch);
        match &*self.finalizers.lock() {
            Some(processor) => processor.schedule(epoch),
            None => self.state.finalized(epoch),
        }
        stats
    }

    /// Schedules and runs a cycle right here, without the collector thread.
    ///
    /// The caller must not be a `Runnable` mutator, or the stop-the-world
    /// phase waits for it forever.
    pub fn collect_now(&self, marker: &dyn Marker) -> CycleStats {
        let _cycle = self.cycle.lock();
        let epoch = self.state.schedule();
        self.collect(marker, epoch)
    }

    fn perform_gc(&self, marker: &dyn Marker, epoch: i64) -> CycleStats {
        let started = Instant::now();
        let world = self.registry.stop_the_world(StopReason::GarbageCollection);
        if log::log_enabled!(log::Level::Trace) {
            log::trace!("epoch {epoch} {}", self.heap.page_census());
        }
        self.heap.prepare_for_gc();
        marker.mark(&self.heap, epoch);
        world.resume();
        let pause = started.elapsed();

        let queue = self.sweep(epoch);
        let queued_finalizers = queue.len();
        self.heap.add_to_finalizer_queue(queue);
        let released_pages = self
            .heap
            .release_empty_pages(self.settings.retained_empty_pages);
        let allocated_bytes = self.heap.allocated_bytes();
        let next_trigger = self.settings.next_trigger(allocated_bytes);
        self.heap.size_tracker().set_target(next_trigger);

        let stats = CycleStats {
            epoch,
            pause,
            duration: started.elapsed(),
            queued_finalizers,
            released_pages,
            allocated_bytes,
        };
        log::info!(
            "GC epoch {epoch}: pause {pause:?}, total {:?}, {allocated_bytes} bytes live, \
             {queued_finalizers} finalizers queued, next at {next_trigger} bytes",
            stats.duration,
        );
        *self.last_cycle.lock() = Some(stats);
        stats
    }

    fn sweep(&self, epoch: i64) -> FinalizerQueue {
        let assistants = self.settings.sweep_assistants;
        if assistants == 0 {
            return self.heap.sweep(epoch);
        }
        thread::scope(|s| {
            let helpers: Vec<_> = (0..assistants)
                .map(|_| s.spawn(|| self.heap.assist_sweep(epoch)))
                .collect();
            let mut queue = self.heap.sweep(epoch);
            for helper in helpers {
                match helper.join() {
                    Ok(assisted) => queue.merge(assisted),
                    Err(_) => log::error!("sweep assistant panicked"),
                }
            }
            queue
        })
    }

    /// Stops the collector and finalizer threads and wakes every waiter.
    ///
    /// Pages are unmapped if no mutator is attached anymore.
    pub fn shutdown(&self) {
        self.state.shutdown();
        if let Some(collector) = self.collector.lock().take() {
            if collector.join().is_err() {
                log::error!("collector thread panicked");
            }
        }
        if let Some(mut processor) = self.finalizers.lock().take() {
            processor.stop();
        }
        if self.registry.thread_count() == 0 {
            self.heap.clear_for_tests();
        } else {
            log::warn!(
                "shutdown with {} mutators attached, keeping the heap",
                self.registry.thread_count()
            );
        }
        log::info!("gc runtime shut down");
    }
}

// ── Mutator ───────────────────────────────────────────────────────────

/// A registered thread allocating from the heap.
///
/// Blocks may be reclaimed at any safepoint, so references that must survive
/// one have to be visible to the [`Marker`].
pub struct Mutator {
    runtime: Arc<GcRuntime>,
    node: Arc<ThreadNode>,
    allocator: ThreadAllocator,
}

impl Mutator {
    fn new(runtime: Arc<GcRuntime>) -> Self {
        let node = runtime.registry.register();
        runtime.registry.switch_state(&node, ThreadState::Runnable);
        let allocator = runtime.heap.allocator();
        Self {
            runtime,
            node,
            allocator,
        }
    }

    pub fn runtime(&self) -> &Arc<GcRuntime> {
        &self.runtime
    }

    pub fn node(&self) -> &ThreadNode {
        &self.node
    }

    #[inline]
    pub fn safepoint(&self) {
        self.runtime.registry.safepoint(&self.node);
    }

    #[inline]
    pub fn allocate(&mut self, bytes: usize) -> BlockRef {
        self.safepoint();
        let block = self.allocator.allocate(bytes);
        self.check_trigger();
        block
    }

    pub fn create_object(&mut self, payload_bytes: usize) -> ObjectRef {
        self.safepoint();
        let object = self.allocator.create_object(payload_bytes);
        self.check_trigger();
        object
    }

    pub fn create_array(&mut self, element_bytes: usize, count: usize) -> ObjectRef {
        self.safepoint();
        let array = self.allocator.create_array(element_bytes, count);
        self.check_trigger();
        array
    }

    /// No safepoint here, so `object` stays valid across the call.
    pub fn create_extra_object(
        &mut self,
        object: ObjectRef,
        has_finalizer: bool,
    ) -> NonNull<ExtraObjectData> {
        self.allocator.create_extra_object(object, has_finalizer)
    }

    fn check_trigger(&mut self) {
        if self.allocator.take_gc_request() {
            let epoch = self.runtime.state.schedule();
            log::debug!(
                "thread {} crossed the allocation trigger, epoch {epoch} scheduled",
                self.node.id()
            );
        }
    }

    /// Runs `f` in `Native` state, where collections may proceed without
    /// this thread. `f` must not touch the heap.
    pub fn in_native<R>(&mut self, f: impl FnOnce() -> R) -> R {
        let registry = &self.runtime.registry;
        registry.switch_state(&self.node, ThreadState::Native);
        let result = f();
        registry.switch_state(&self.node, ThreadState::Runnable);
        result
    }

    /// Schedules a collection and waits for it to finish.
    pub fn collect_garbage(&mut self) -> i64 {
        let runtime = Arc::clone(&self.runtime);
        let epoch = runtime.state.schedule();
        self.in_native(|| runtime.state.wait_epoch_finished(epoch));
        epoch
    }

    /// Like [`Mutator::collect_garbage`], but also waits for the finalizers
    /// found by that collection.
    pub fn collect_garbage_and_finalize(&mut self) -> i64 {
        let runtime = Arc::clone(&self.runtime);
        let epoch = runtime.state.schedule();
        self.in_native(|| runtime.state.wait_epoch_finalized(epoch));
        epoch
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.runtime
            .registry
            .switch_state(&self.node, ThreadState::Native);
        self.runtime.registry.unregister(&self.node);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{MarkBitSweep, SettingsError};

    fn runtime() -> Arc<GcRuntime> {
        GcRuntime::new(GcSettings::default(), Arc::new(MarkBitSweep)).expect("valid settings")
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let settings = GcSettings {
            trigger_bytes: 0,
            ..Default::default()
        };
        match GcRuntime::new(settings, Arc::new(MarkBitSweep)) {
            Err(RuntimeError::Settings(SettingsError::ZeroTrigger)) => {}
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("zero trigger accepted"),
        }
    }

    #[test]
    fn collect_now_reclaims_unmarked_objects() {
        let runtime = runtime();
        let mut mutator = runtime.attach_mutator();
        let keep = mutator.create_object(32);
        let _drop = mutator.create_object(32);

        let marker = move |_: &Heap, _: i64| {
            keep.try_mark();
        };
        let stats = mutator.in_native(|| runtime.collect_now(&marker));
        assert_eq!(stats.epoch, 1);
        assert_eq!(runtime.heap().allocated_blocks(), vec![keep.block()]);
        assert_eq!(runtime.state().finished(), 1);
        assert_eq!(runtime.state().finalized_epoch(), 1);
        assert_eq!(runtime.registry().stats().pauses(), 1);
        drop(mutator);
        runtime.shutdown();
    }

    #[test]
    fn collector_thread_serves_mutator_requests() {
        let runtime = runtime();
        let finalized = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&finalized);
        runtime
            .start(
                Arc::new(|_: &Heap, _: i64| {}),
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::Relaxed);
                }),
            )
            .expect("start");
        assert!(matches!(
            runtime.start(Arc::new(|_: &Heap, _: i64| {}), Box::new(|_| {})),
            Err(RuntimeError::AlreadyStarted)
        ));

        let mut mutator = runtime.attach_mutator();
        let object = mutator.create_object(8);
        mutator.create_extra_object(object, true);
        let first = mutator.collect_garbage_and_finalize();
        assert_eq!(finalized.load(Ordering::Relaxed), 1);
        let second = mutator.collect_garbage();
        assert!(second > first);
        assert!(runtime.heap().allocated_blocks().is_empty());

        drop(mutator);
        runtime.shutdown();
        assert!(runtime.state().is_shutdown());
        assert_eq!(runtime.heap().page_census().fixed_block.total(), 0);
    }

    #[test]
    fn collect_now_takes_turns_with_the_collector() {
        let runtime = runtime();
        let cycles = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&cycles);
        let marker = move |_: &Heap, _: i64| {
            counted.fetch_add(1, Ordering::Relaxed);
            thread::sleep(Duration::from_millis(2));
        };
        let marker: Arc<dyn Marker> = Arc::new(marker);
        runtime
            .start(Arc::clone(&marker), Box::new(|_| {}))
            .expect("start");

        let direct = {
            let runtime = Arc::clone(&runtime);
            let marker = Arc::clone(&marker);
            thread::spawn(move || {
                for _ in 0..10 {
                    runtime.collect_now(&*marker);
                }
            })
        };
        for _ in 0..10 {
            let epoch = runtime.state().schedule();
            runtime.state().wait_epoch_finished(epoch);
        }
        direct.join().expect("collect_now panicked");

        let finished = runtime.state().finished();
        assert!(finished >= 10);
        assert_eq!(cycles.load(Ordering::Relaxed), finished as usize);
        assert_eq!(runtime.registry().stats().pauses(), finished as usize);
        runtime.shutdown();
    }
}
