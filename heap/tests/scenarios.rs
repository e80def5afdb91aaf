use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use pageheap::{
    BlockFate, BlockRef, CELL_SIZE, ExtraFlags, GcRuntime, GcSettings, Heap, MAX_BLOCK_SIZE,
    MarkBitSweep, ObjectRef, PageKind, SizeClass, ThreadAllocator,
    page::{FixedBlockPage, NextFitPage},
};
use parking_lot::Mutex;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn heap_with(fate: BlockFate) -> Heap {
    Heap::new(Arc::new(move |_: BlockRef| fate))
}

fn collect(heap: &Heap) {
    heap.prepare_for_gc();
    let queue = heap.sweep(1);
    heap.add_to_finalizer_queue(queue);
}

#[test]
fn live_small_objects_survive_a_sweep() {
    init_logging();
    let heap = heap_with(BlockFate::Live);
    let mut allocator = ThreadAllocator::new(heap.clone());
    let blocks: HashSet<BlockRef> = (0..1000).map(|_| allocator.allocate(24)).collect();
    assert_eq!(blocks.len(), 1000);
    drop(allocator);

    collect(&heap);

    let survivors: HashSet<BlockRef> = heap.allocated_blocks().into_iter().collect();
    assert_eq!(survivors, blocks);
    let census = heap.page_census();
    assert_eq!(census.fixed_block.empty, 0);
    assert_eq!(census.fixed_block.ready, census.fixed_block.total());
    heap.clear_for_tests();
}

#[test]
fn dead_objects_leave_only_empty_pages() {
    init_logging();
    let size = MAX_BLOCK_SIZE * CELL_SIZE;
    let heap = heap_with(BlockFate::Dead);
    let mut allocator = ThreadAllocator::new(heap.clone());
    for _ in 0..1000 {
        allocator.allocate(size);
    }
    drop(allocator);
    let pages = heap.page_census().fixed_block.total();
    assert!(pages > 1);

    collect(&heap);

    assert!(heap.allocated_blocks().is_empty());
    let census = heap.page_census();
    assert_eq!(census.fixed_block.empty, pages);
    assert_eq!(census.fixed_block.total(), pages);
    assert_eq!(heap.allocated_bytes(), 0);

    let mut queue = Default::default();
    let mut page = heap.get_fixed_block_page(MAX_BLOCK_SIZE as u32, &mut queue);
    // SAFETY: the page was just handed out to us
    assert!(unsafe { page.as_mut() }.try_allocate().is_some());
    assert_eq!(heap.page_census().fixed_block.total(), pages);

    assert_eq!(heap.release_empty_pages(0), pages - 1);
    heap.clear_for_tests();
}

#[test]
fn oversized_objects_get_their_own_page() {
    init_logging();
    let cells = NextFitPage::max_block_size() as usize + 1;
    let bytes = cells * CELL_SIZE;
    assert_eq!(SizeClass::for_bytes(bytes), SizeClass::SingleObject(cells as u64));

    let heap = heap_with(BlockFate::Live);
    let mut allocator = ThreadAllocator::new(heap.clone());
    let blocks: HashSet<_> = (0..3).map(|_| allocator.allocate(bytes)).collect();

    let mut kinds = Vec::new();
    heap.traverse_pages(|info| kinds.push(info.kind));
    assert_eq!(kinds, vec![PageKind::SingleObject; 3]);
    let census = heap.page_census();
    assert_eq!(census.single_object.total(), 3);
    assert_eq!(census.fixed_block.total() + census.next_fit.total(), 0);
    assert_eq!(heap.allocated_blocks().into_iter().collect::<HashSet<_>>(), blocks);
    assert_eq!(heap.allocated_bytes(), 3 * bytes);
    heap.clear_for_tests();
}

#[test]
fn dead_single_objects_are_unmapped() {
    init_logging();
    let heap = heap_with(BlockFate::Dead);
    let mut allocator = ThreadAllocator::new(heap.clone());
    allocator.allocate((NextFitPage::max_block_size() as usize + 10) * CELL_SIZE);
    collect(&heap);
    assert_eq!(heap.page_census().single_object.total(), 0);
}

#[test]
fn mutators_sweep_inline_while_the_collector_sweeps() {
    init_logging();
    let heap = Heap::new(Arc::new(MarkBitSweep));
    let mut seed = ThreadAllocator::new(heap.clone());
    let per_page = FixedBlockPage::cell_count() as usize / 4;
    for _ in 0..per_page * 16 {
        seed.allocate(4 * CELL_SIZE);
    }
    drop(seed);
    heap.prepare_for_gc();

    let allocated = thread::scope(|s| {
        let mutators: Vec<_> = (0..4)
            .map(|_| {
                let heap = heap.clone();
                s.spawn(move || {
                    let mut allocator = ThreadAllocator::new(heap);
                    (0..per_page * 2)
                        .map(|_| allocator.allocate(4 * CELL_SIZE))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let queue = heap.sweep(1);
        assert!(queue.is_empty());
        mutators
            .into_iter()
            .flat_map(|m| m.join().expect("mutator panicked"))
            .collect::<HashSet<_>>()
    });

    assert_eq!(allocated.len(), per_page * 8);
    let live: HashSet<_> = heap.allocated_blocks().into_iter().collect();
    assert_eq!(live, allocated);
    heap.clear_for_tests();
}

#[test]
fn inline_sweep_finalizers_reach_the_heap_queue() {
    init_logging();
    let heap = Heap::new(Arc::new(MarkBitSweep));
    let mut allocator = ThreadAllocator::new(heap.clone());
    let object = allocator.create_object(8);
    allocator.create_extra_object(object, true);

    heap.prepare_for_gc();
    // sweeps the object's page inline; the allocator stays idle afterwards
    allocator.create_object(8);
    let queue = heap.sweep(1);
    assert!(queue.is_empty());

    let pending: Vec<_> = heap.extract_finalizer_queue().into_iter().collect();
    assert_eq!(pending, vec![object.block()]);
    let extra = object.header().extra().expect("extra record");
    assert!(extra.flags().contains(ExtraFlags::IN_FINALIZER_QUEUE));
    heap.policy().on_finalized(object.block());

    collect(&heap);
    assert!(heap.extract_finalizer_queue().is_empty());
    assert!(!heap.allocated_blocks().contains(&object.block()));
    drop(allocator);
    heap.clear_for_tests();
}

#[test]
fn concurrent_mutators_keep_their_roots() {
    init_logging();
    const THREADS: usize = 4;
    const OBJECTS: usize = 20_000;

    let settings = GcSettings {
        trigger_bytes: 256 * 1024,
        sweep_assistants: 2,
        retained_empty_pages: 1,
        ..Default::default()
    };
    let runtime = GcRuntime::new(settings, Arc::new(MarkBitSweep)).expect("valid settings");
    let roots: Arc<Mutex<Vec<ObjectRef>>> = Arc::default();
    let finalized = Arc::new(AtomicUsize::new(0));

    let marked = Arc::clone(&roots);
    let counter = Arc::clone(&finalized);
    runtime
        .start(
            Arc::new(move |_: &Heap, _: i64| {
                for root in marked.lock().iter() {
                    root.try_mark();
                }
            }),
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            }),
        )
        .expect("start");

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let runtime = Arc::clone(&runtime);
            let roots = Arc::clone(&roots);
            thread::spawn(move || {
                let mut mutator = runtime.attach_mutator();
                for i in 0..OBJECTS {
                    let payload = 8 + (i % 37) * CELL_SIZE;
                    let object = mutator.create_object(payload);
                    let id = (t * OBJECTS + i) as u64;
                    // SAFETY: the payload holds at least 8 bytes
                    unsafe { object.as_ptr().cast::<u64>().write(id) };
                    if i % 10 == 0 {
                        roots.lock().push(object);
                    }
                    if i % 7 == 0 {
                        mutator.create_extra_object(object, true);
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker panicked");
    }

    let mut mutator = runtime.attach_mutator();
    mutator.collect_garbage_and_finalize();
    mutator.collect_garbage_and_finalize();

    let live: HashSet<_> = runtime.heap().allocated_blocks().into_iter().collect();
    let roots = roots.lock();
    assert_eq!(roots.len(), THREADS * OBJECTS / 10);
    let mut ids = HashSet::new();
    for root in roots.iter() {
        assert!(live.contains(&root.block()));
        // SAFETY: roots stay allocated
        ids.insert(unsafe { root.as_ptr().cast::<u64>().read() });
    }
    assert_eq!(ids.len(), roots.len());

    let unrooted_finalizable = (0..OBJECTS).filter(|i| i % 7 == 0 && i % 10 != 0).count();
    assert_eq!(finalized.load(Ordering::Relaxed), THREADS * unrooted_finalizable);
    assert!(runtime.registry().stats().pauses() >= 2);
    assert!(runtime.last_cycle().is_some());

    drop(mutator);
    runtime.shutdown();
}

#[test]
fn suspended_collections_wait_for_resume() {
    init_logging();
    let settings = GcSettings {
        suspend_timeout: Duration::from_secs(30),
        ..Default::default()
    };
    let runtime = GcRuntime::new(settings, Arc::new(MarkBitSweep)).expect("valid settings");
    runtime
        .start(Arc::new(|_: &Heap, _: i64| {}), Box::new(|_| {}))
        .expect("start");

    runtime.state().suspend();
    let epoch = runtime.state().schedule();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(runtime.state().finished(), 0);

    runtime.state().resume();
    runtime.state().wait_epoch_finished(epoch);
    assert_eq!(runtime.state().finished(), epoch);
    runtime.shutdown();
}

#[test]
fn shutdown_releases_waiters() {
    init_logging();
    let runtime =
        GcRuntime::new(GcSettings::default(), Arc::new(MarkBitSweep)).expect("valid settings");
    let waiter = {
        let runtime = Arc::clone(&runtime);
        thread::spawn(move || runtime.state().wait_epoch_finished(100))
    };
    thread::sleep(Duration::from_millis(20));
    runtime.shutdown();
    waiter.join().expect("waiter panicked");
    assert!(runtime.state().wait_scheduled().is_none());
}
