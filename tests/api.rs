#[test]
fn is_usable_in_const_contexts() {
    const _ALLOCATOR1: halffit::Allocator<32> = halffit::Allocator::new();
    static _ALLOCATOR2: halffit::Allocator<32> = halffit::Allocator::new();
}

#[test]
fn supports_global_alloc() {
    fn assert<T: core::alloc::GlobalAlloc>(_: T) {}
    assert(halffit::Allocator::<64>::new())
}

#[test]
fn allocator_is_sync() {
    fn assert<T: Sync>(_: &T) {}
    assert(&halffit::Allocator::<64>::new())
}

#[test]
#[should_panic(expected = "too small heap memory")]
fn min_heap_size_of_at_least_32() {
    let _allocator = halffit::Allocator::<24>::new(); // panic here
}

#[test]
#[should_panic(expected = "divisible by 8")]
fn heap_size_must_be_a_multiple_of_8() {
    let _allocator = halffit::Allocator::<63>::new(); // panic here
}

#[test]
fn raw_allocator_accepts_boxed_arenas() {
    use core::mem::MaybeUninit;

    let arena = vec![MaybeUninit::<u64>::uninit(); 512].into_boxed_slice();
    let arena = Box::leak(arena);
    let len = core::mem::size_of_val(arena);
    // SAFETY: a `[MaybeUninit<u64>]` can be viewed as `[MaybeUninit<u8>]`
    let arena = unsafe {
        core::slice::from_raw_parts_mut(arena.as_mut_ptr().cast::<MaybeUninit<u8>>(), len)
    };

    let mut allocator = halffit::RawAllocator::init(arena).unwrap();
    assert_eq!(allocator.arena_size(), 4096);
    let ptr = allocator.allocate(1000).unwrap();
    unsafe { allocator.free(ptr) }.unwrap();
}

#[test]
fn errors_are_displayable() {
    assert_eq!(halffit::AllocError::OutOfMemory.to_string(), "out of memory");
    assert_eq!(
        halffit::FreeError::DoubleFreeDetected.to_string(),
        "double free detected"
    );
    assert_eq!(
        halffit::InitError::TooSmall.to_string(),
        "arena smaller than 32 bytes"
    );
    assert_eq!(
        halffit::IntegrityError::Uncoalesced(64).to_string(),
        "uncoalesced free blocks at offset 64"
    );
}
