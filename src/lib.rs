//! Deterministic half-fit allocator for embedded systems
//!
//! This crate provides a dynamic memory allocator over a single, fixed-size
//! arena. Allocation and release take a bounded number of steps, independent
//! of how many blocks are live or how fragmented the arena is. This makes the
//! allocator usable in environments with tight worst-case timing requirements.
//!
//! There are two ways to use it:
//! - [`Allocator`] implements [`core::alloc::GlobalAlloc`], which is required
//!   to use the [`alloc`-crate][alloc] on `#![no_std]`-targets.
//! - [`RawAllocator`] is the allocator core with an explicit
//!   `init`/`allocate`/`free` API over any arena the caller provides.
//!
//! # Usage
//! The usage is simple: just copy and paste the following code snipped into
//! your binary crate and potentially adjust the number of bytes of the heap
//! (here 32K):
//! ```no_run
//! #[global_allocator]
//! static ALLOCATOR: halffit::Allocator<32768> = halffit::Allocator::new();
//!
//! extern crate alloc;
//! ```
//! Afterwards you don't need to interact with the crate or the variable
//! `ALLOCATOR` anymore. Now you can just `use alloc::vec::Vec` or even
//! `use alloc::collections::BTreeMap`, i.e. every fancy collection which is
//! normally provided by the `std`.
//!
//! If the arena is provided by other means (e.g. a dedicated RAM region), the
//! raw allocator can be used directly:
//! ```
//! use halffit::{Heap, RawAllocator};
//!
//! let mut allocator = RawAllocator::init(Heap::<4096>::new()).unwrap();
//! let ptr = allocator.allocate(100).unwrap();
//! unsafe { allocator.free(ptr) }.unwrap();
//! ```
//!
//! The minimal heap size is `32`, which would allow exactly one allocation of
//! size up to 8 at a time. Every block costs a header of 24 bytes and block
//! sizes are rounded up to a multiple of 8. Adjust the size as necessary, e.g.
//! by doing a worst case calculation and adding some backup space.
//!
//! # Implementation
//! Each block of the arena starts with a header, which stores its total size,
//! whether it is free and the size of the block before it. The blocks tile the
//! whole arena without gaps, so the neighbors of a block are found by address
//! arithmetic in both directions.
//!
//! Free blocks are additionally linked into one of several free lists. There
//! is one list per power of two ("size class"): a free block of size `s`
//! lives in the list of the largest power of two `<= s`. A bitmap stores
//! which lists are non-empty.
//!
//! 1.  We start with an empty arena of 32K.
//!     ```text
//!     hhhh 0000 0000 0000 0000 0000 0000 0000 0000 ...
//!     ^---------------------------------------------
//!     FREE size = 32768 (class 2^15)
//!     ```
//!     There is a single free block spanning the whole arena. Only the bit of
//!     class `2^15` is set in the bitmap.
//! 2.  A block of 6112 bytes is allocated.
//!     ```text
//!     hhhh 0000 ... 0000 hhhh 0000 0000 ...
//!     ^----------------- ^------------------
//!     USED size = 6136   FREE size = 26632 (class 2^14)
//!     ```
//!     The needed block size is the header plus the request, rounded up to 8.
//!     The request is rounded _up_ to the next power of two (`2^13`) and the
//!     bitmap is searched for the first set bit at or above that class. Every
//!     block found this way is large enough. The free block is split: the low
//!     part is handed out, the remainder is filed under its own class.
//! 3.  Further blocks of 3300 and 8572 bytes are allocated the same way.
//!     ```text
//!     [USED 6136][USED 3328][USED 8600][FREE 14704]
//!     ```
//! 4.  The first and the third block are freed.
//!     ```text
//!     [FREE 6136][USED 3328][FREE 23304             ]
//!     ```
//!     When freeing, the neighbors are inspected: the third block is followed
//!     by a free block, so both are merged into one. There are never two
//!     adjacent free blocks. The first block is filed under class `2^12`, the
//!     merged one under `2^14`.
//! 5.  A block of 2540 bytes (2568 with header) is allocated.
//!     ```text
//!     [USED 2568][FREE 3568][USED 3328][FREE 23304             ]
//!     ```
//!     The search starts at class `2^12`, which contains the first free block.
//!     It is split again and the new block ends up at the address of the very
//!     first allocation.
//!
//! If no class at or above the rounded-up class is populated, the first block
//! of the class just below is checked, since it might still be large enough.
//! All steps look at a fixed number of headers and bitmap words, there is no
//! scan over the blocks of the arena.
//!
//! Freeing a pointer checks the header in front of it: the header carries a
//! tag and a check word, so double-frees, foreign pointers and overwritten
//! headers are detected and reported instead of corrupting the arena.
//!
//! [alloc]: https://doc.rust-lang.org/alloc/index.html
#![no_std]

pub mod raw_allocator;

pub use raw_allocator::{
    AllocError, FreeError, Heap, InitError, IntegrityError, RawAllocator, Stats, Storage,
    ALIGNMENT, HEADER_SIZE, MAX_ARENA_SIZE, MIN_BLOCK_SIZE,
};

use core::alloc::{GlobalAlloc, Layout};
use core::mem;
use core::ptr::{self, NonNull};

/// The memory allocator for embedded systems.
///
/// This is the core type of this crate: it is an allocator with a predefined
/// heap size. Therefore the heap memory usage is statically limited to an upper
/// value, which also helps to prevent issues with heap/stack-smashes, as the
/// heap is counted to the static memory (e.g. `.data`/`.bss`-sections). Such a
/// smash might still happen though, if the stack pointer grows into the heap,
/// but the heap cannot grow into the stack pointer.
///
/// Its usage is simple: just copy and paste the following in the binary crate
/// you're developing. The memory size of the heap is `4096` or 4K in this
/// example. Adjust that value to your needs.
/// ```no_run
/// #[global_allocator]
/// static ALLOCATOR: halffit::Allocator<4096> = halffit::Allocator::new();
/// ```
/// Also please refer to the [crate-level](crate)-documentation for
/// recommendations on the buffer size and general usage.
///
/// The allocator state is protected by a spin lock. Do not allocate from an
/// interrupt handler, that might preempt an allocation in progress, as this
/// would deadlock. For the same reason nothing is logged while the lock is
/// held: only a failed `dealloc` is reported, after the lock is released.
pub struct Allocator<const N: usize> {
    raw: spin::Mutex<RawAllocator<Heap<N>>>,
}
impl<const N: usize> Allocator<N> {
    /// Create a new [`Allocator`].
    ///
    /// This function is a `const fn`, therefore you can call it directly when
    /// creating the allocator.
    ///
    /// Please see the [crate-level](crate)-documentation for recommendations on
    /// the buffer size and general usage.
    ///
    /// # Panics
    /// This function will panic, if the supplied buffer size, i.e. `N` is less
    /// than `32`, larger than [`MAX_ARENA_SIZE`] or not divisible by `8`.
    #[must_use = "assign the allocator to a static variable and apply the `#[global_allocator]`-attribute to make it the global allocator"]
    pub const fn new() -> Self {
        assert!(N >= MIN_BLOCK_SIZE, "too small heap memory: minimum size is 32");
        assert!(N <= MAX_ARENA_SIZE, "too large heap memory");
        assert!(N % ALIGNMENT == 0, "memory size has to be divisible by 8");
        Self {
            raw: spin::Mutex::new(RawAllocator::unformatted(Heap::new())),
        }
    }

    /// Gather usage statistics of the heap.
    ///
    /// This walks all blocks of the heap, so it should not be called in
    /// time-critical code.
    pub fn stats(&self) -> Stats {
        let mut raw = self.raw.lock();
        raw.ensure_formatted();
        raw.stats()
    }
}
impl<const N: usize> Default for Allocator<N> {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl<const N: usize> GlobalAlloc for Allocator<N> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut raw = self.raw.lock();
        raw.ensure_formatted();

        let size = layout.size().max(1);
        if layout.align() <= ALIGNMENT {
            return raw.allocate(size).map_or(ptr::null_mut(), NonNull::as_ptr);
        }

        // Over-allocate, so that an aligned address with at least one word in
        // front of it is inside the block. That word stores the block pointer.
        let padded = match size.checked_add(layout.align()) {
            Some(padded) => padded,
            None => return ptr::null_mut(),
        };
        match raw.allocate(padded) {
            Ok(block) => {
                let block = block.as_ptr();
                let offset = layout.align() - (block as usize & (layout.align() - 1));
                let aligned = block.add(offset);
                aligned.cast::<*mut u8>().sub(1).write(block);
                aligned
            }
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let block = if layout.align() <= ALIGNMENT {
            ptr
        } else {
            ptr.cast::<*mut u8>().sub(1).read()
        };
        let block = match NonNull::new(block) {
            Some(block) => block,
            None => return,
        };

        let result = {
            let mut raw = self.raw.lock();
            raw.ensure_formatted();
            raw.free(block)
        };
        // Allocators are not allowed to unwind: the block is leaked instead.
        // The lock is released here, as the logger may allocate.
        if let Err(error) = result {
            log::error!("dealloc({:p}, {:?}) failed: {}", ptr, layout, error);
        }
    }
}

const _: () = assert!(mem::size_of::<*mut u8>() <= ALIGNMENT);
