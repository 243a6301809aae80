//! The reference call sequence of the demonstration firmware: a 32K arena,
//! three allocations, two releases, a reuse of the released space, a large
//! request and finally a release of a stale pointer.
use halffit::{FreeError, Heap, RawAllocator};

use core::ptr::NonNull;
use core::slice;

const ARENA_SIZE: usize = 32 * 1024;

fn fill(ptr: NonNull<u8>, len: usize, pattern: u8) {
    unsafe { ptr.as_ptr().write_bytes(pattern, len) };
}

fn holds(ptr: NonNull<u8>, len: usize, pattern: u8) -> bool {
    let memory = unsafe { slice::from_raw_parts(ptr.as_ptr(), len) };
    memory.iter().all(|&byte| byte == pattern)
}

#[test]
fn reference_sequence() {
    let mut allocator = RawAllocator::init(Heap::<ARENA_SIZE>::new()).unwrap();

    let a0 = allocator.allocate(6112).unwrap();
    let a1 = allocator.allocate(3300).unwrap();
    let a2 = allocator.allocate(8572).unwrap();
    fill(a0, 6112, 0xA0);
    fill(a1, 3300, 0xA1);
    fill(a2, 8572, 0xA2);
    assert!(a0 < a1 && a1 < a2, "blocks are carved from the low end");
    allocator.check_integrity().unwrap();

    unsafe {
        allocator.free(a0).unwrap();
        allocator.free(a2).unwrap();
    }
    allocator.check_integrity().unwrap();
    // the third block merged with the untouched rest of the arena
    assert_eq!(allocator.stats().free_blocks, 2);

    let a3 = allocator.allocate(2540).unwrap();
    assert_eq!(a3, a0, "the released space of the first block is reused");
    fill(a3, 2540, 0xA3);

    // fits into the merged region of the third block and the rest
    let a4 = allocator.allocate(15990).unwrap();
    assert_eq!(a4, a2);
    fill(a4, 15990, 0xA4);
    allocator.check_integrity().unwrap();

    // The stale pointer `a0` names the block now owned by `a3`, so the
    // allocator cannot tell them apart and releases that block. Only the
    // headers are touched: no live payload may change.
    assert_eq!(allocator.stats().used_blocks, 3);
    unsafe { allocator.free(a0) }.unwrap();
    allocator.check_integrity().unwrap();
    // `a3` is no longer owned: its block is back in the free lists
    assert_eq!(allocator.stats().used_blocks, 2);
    assert_eq!(
        unsafe { allocator.free(a3) },
        Err(FreeError::DoubleFreeDetected)
    );
    assert!(holds(a1, 3300, 0xA1));
    assert!(holds(a3, 2540, 0xA3));
    assert!(holds(a4, 15990, 0xA4));

    // a second release of the same pointer is a genuine double-free
    assert_eq!(unsafe { allocator.free(a0) }, Err(FreeError::DoubleFreeDetected));
    allocator.check_integrity().unwrap();
    assert!(holds(a1, 3300, 0xA1));
    assert!(holds(a4, 15990, 0xA4));
}

#[test]
fn reference_sequence_addresses() {
    let mut allocator = RawAllocator::init(Heap::<ARENA_SIZE>::new()).unwrap();
    let base = allocator.allocate(8).unwrap().as_ptr() as usize;
    allocator.reset();

    let offset = |ptr: NonNull<u8>| ptr.as_ptr() as usize - base;
    let a0 = allocator.allocate(6112).unwrap();
    let a1 = allocator.allocate(3300).unwrap();
    let a2 = allocator.allocate(8572).unwrap();
    assert_eq!(offset(a0), 0);
    assert_eq!(offset(a1), 6136);
    assert_eq!(offset(a2), 6136 + 3328);
}

#[test]
fn large_request_fails_without_contiguous_space() {
    let mut allocator = RawAllocator::init(Heap::<ARENA_SIZE>::new()).unwrap();
    let a0 = allocator.allocate(6112).unwrap();
    let a1 = allocator.allocate(3300).unwrap();
    let _a2 = allocator.allocate(8572).unwrap();
    let _rest = allocator.allocate(12000).unwrap();
    fill(a1, 3300, 0xA1);

    unsafe { allocator.free(a0) }.unwrap();
    assert_eq!(
        allocator.allocate(15990),
        Err(halffit::AllocError::OutOfMemory)
    );
    assert!(holds(a1, 3300, 0xA1));
    allocator.check_integrity().unwrap();
}
