//! Allocation and sweep benchmarks

use std::sync::Arc;

use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use pageheap::{BlockFate, BlockRef, CELL_SIZE, Heap, ThreadAllocator};

const OBJECTS: usize = 10_000;

fn dead_heap() -> Heap {
    Heap::new(Arc::new(|_: BlockRef| BlockFate::Dead))
}

fn fixed_size(c: &mut Criterion) {
    let heap = dead_heap();
    c.bench_function("allocate 10k x 32 bytes", |b| {
        b.iter(|| {
            let mut allocator = ThreadAllocator::new(heap.clone());
            for _ in 0..OBJECTS {
                black_box(allocator.allocate(32));
            }
            drop(allocator);
            heap.prepare_for_gc();
            heap.sweep(0);
        })
    });
    heap.clear_for_tests();
}

fn mixed_sizes(c: &mut Criterion) {
    let heap = dead_heap();
    c.bench_function("allocate 10k mixed sizes", |b| {
        b.iter(|| {
            let mut allocator = ThreadAllocator::new(heap.clone());
            for i in 0..OBJECTS {
                let bytes = match i % 16 {
                    15 => 64 * 1024,
                    n => (n + 1) * 3 * CELL_SIZE,
                };
                black_box(allocator.allocate(bytes));
            }
            drop(allocator);
            heap.prepare_for_gc();
            heap.sweep(0);
        })
    });
    heap.clear_for_tests();
}

fn sweep(c: &mut Criterion) {
    let heap = Heap::new(Arc::new(|block: BlockRef| {
        if block.addr() % 32 == 0 {
            BlockFate::Live
        } else {
            BlockFate::Dead
        }
    }));
    c.bench_function("sweep 10k blocks", |b| {
        b.iter_batched(
            || {
                let mut allocator = ThreadAllocator::new(heap.clone());
                for _ in 0..OBJECTS {
                    allocator.allocate(2 * CELL_SIZE);
                }
                drop(allocator);
                heap.prepare_for_gc();
            },
            |()| black_box(heap.sweep(0)),
            BatchSize::PerIteration,
        )
    });
    heap.clear_for_tests();
}

criterion_group!(benches, fixed_size, mixed_sizes, sweep);
criterion_main!(benches);
