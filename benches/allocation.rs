use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use halffit::{Heap, RawAllocator};

use std::mem::MaybeUninit;

const ARENA_SIZE: usize = 1024 * 1024;

/// Fragment the arena into `holes` small free blocks separated by live ones.
///
/// A linear-scan allocator slows down with every hole, the search over the
/// size-class bitmap must not.
fn fragmented(holes: usize) -> RawAllocator<&'static mut [MaybeUninit<u8>]> {
    let heap: &'static mut Heap<ARENA_SIZE> = Box::leak(Box::new(Heap::new()));
    let mut allocator = RawAllocator::init(heap.as_mut()).unwrap();
    let blocks: Vec<_> = (0..2 * holes)
        .map(|_| allocator.allocate(8).unwrap())
        .collect();
    for ptr in blocks.into_iter().step_by(2) {
        unsafe { allocator.free(ptr) }.unwrap();
    }
    allocator
}

fn repeated_allocation_deallocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate_free");
    for holes in [0, 8, 512, 8192] {
        for size in [8, 200, 4000] {
            let mut allocator = fragmented(holes);
            group.bench_with_input(
                BenchmarkId::new(format!("{}_holes", holes), size),
                &size,
                |b, &size| {
                    b.iter(|| {
                        let ptr = allocator.allocate(black_box(size)).unwrap();
                        unsafe { allocator.free(black_box(ptr)) }.unwrap();
                    })
                },
            );
        }
    }
    group.finish();
}

fn global_alloc(c: &mut Criterion) {
    use std::alloc::{GlobalAlloc as _, Layout};

    let allocator = halffit::Allocator::<8192>::new();
    let layout = Layout::new::<[u64; 4]>();
    c.bench_function("global_alloc_dealloc", |b| {
        b.iter(|| unsafe {
            let ptr = allocator.alloc(black_box(layout));
            allocator.dealloc(black_box(ptr), layout);
        })
    });
}

criterion_group!(benches, repeated_allocation_deallocation, global_alloc);
criterion_main!(benches);
