//! This module provides the raw allocator and its support types.
//!
//! A "raw allocator" is one, that simply gets request for a specific memory
//! size but does not need to worry about alignment beyond the fixed payload
//! alignment of [`ALIGNMENT`] bytes.
mod buffer;
mod header;
mod size_class;

pub use buffer::{Heap, Storage};

use buffer::{Buffer, ValidatedOffset};
use header::{Header, State};
use size_class::{SizeClassIndex, CLASS_COUNT};

use core::fmt;
use core::ptr::NonNull;

/// Emit a log record, unless logging is switched off for this allocator.
macro_rules! event {
    ($allocator:expr, $level:ident, $($arg:tt)+) => {
        if $allocator.logging {
            log::$level!($($arg)+);
        }
    };
}

/// The granularity of block sizes and the alignment of every payload.
pub const ALIGNMENT: usize = 8;

/// The number of bytes each block spends on its header.
pub const HEADER_SIZE: usize = Header::SIZE;

/// The smallest block: a header plus the smallest possible payload.
pub const MIN_BLOCK_SIZE: usize = HEADER_SIZE + ALIGNMENT;

/// The largest arena, since block sizes are stored as `u32`.
pub const MAX_ARENA_SIZE: usize = u32::MAX as usize & !(ALIGNMENT - 1);

const _: () = assert!(HEADER_SIZE % ALIGNMENT == 0);

/// An error occurred when calling [`RawAllocator::init()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    /// The arena cannot hold even a single block of [`MIN_BLOCK_SIZE`].
    TooSmall,
    /// The arena is larger than [`MAX_ARENA_SIZE`].
    TooLarge,
    /// The start of the arena is not aligned to [`ALIGNMENT`].
    MisalignedBase,
    /// The length of the arena is not a multiple of [`ALIGNMENT`].
    MisalignedSize,
}
impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooSmall => write!(f, "arena smaller than {} bytes", MIN_BLOCK_SIZE),
            Self::TooLarge => write!(f, "arena larger than {} bytes", MAX_ARENA_SIZE),
            Self::MisalignedBase => write!(f, "arena not aligned to {} bytes", ALIGNMENT),
            Self::MisalignedSize => write!(f, "arena size not a multiple of {}", ALIGNMENT),
        }
    }
}

/// An error occurred when calling [`RawAllocator::allocate()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// A zero-sized block was requested.
    ZeroSize,
    /// There is no free block large enough for the request. This is a normal
    /// condition: the caller may free memory and try again.
    OutOfMemory,
}
impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroSize => f.write_str("zero-sized allocation"),
            Self::OutOfMemory => f.write_str("out of memory"),
        }
    }
}

/// An error occurred when calling [`RawAllocator::free()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeError {
    /// There is a double-free detected. An already freed-up-block is freed up
    /// again.
    DoubleFreeDetected,
    /// An invalid pointer was freed up (either a pointer outside of the heap
    /// memory or a pointer, that was never handed out).
    AllocationNotFound,
    /// The header in front of the pointer is tagged, but its check word or
    /// size does not match. The memory in front of the allocation was
    /// overwritten.
    HeaderCorrupted,
}
impl fmt::Display for FreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DoubleFreeDetected => f.write_str("double free detected"),
            Self::AllocationNotFound => f.write_str("pointer was not allocated here"),
            Self::HeaderCorrupted => f.write_str("block header corrupted"),
        }
    }
}

/// A violation of the allocator invariants found by
/// [`RawAllocator::check_integrity()`].
///
/// Each variant carries the offset of the offending block header (or the
/// class of the offending list).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityError {
    /// A header has an invalid tag or check word.
    BadHeader(usize),
    /// The blocks do not exactly tile the arena.
    BrokenChain(usize),
    /// Two physically adjacent blocks are both free.
    Uncoalesced(usize),
    /// A free list contains a block, that is used or of another class.
    WrongClass(usize),
    /// The free-list links are inconsistent within a class.
    BrokenFreeList(usize),
    /// The number of listed free blocks differs from the number of free
    /// blocks in the chain.
    FreeBlockCountMismatch,
}
impl fmt::Display for IntegrityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadHeader(offset) => write!(f, "bad header at offset {}", offset),
            Self::BrokenChain(offset) => write!(f, "block chain broken at offset {}", offset),
            Self::Uncoalesced(offset) => write!(f, "uncoalesced free blocks at offset {}", offset),
            Self::WrongClass(offset) => write!(f, "misfiled block at offset {}", offset),
            Self::BrokenFreeList(class) => write!(f, "broken free list of class {}", class),
            Self::FreeBlockCountMismatch => f.write_str("free lists do not match the chain"),
        }
    }
}

/// Statistics about the usage of an arena.
///
/// The payload bytes of all blocks plus the header overhead always add up to
/// the arena size:
/// `used_bytes + free_bytes + overhead_bytes == arena_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// The total size of the arena.
    pub arena_size: usize,
    /// The number of blocks handed out.
    pub used_blocks: usize,
    /// The number of free blocks.
    pub free_blocks: usize,
    /// The payload bytes of all used blocks.
    pub used_bytes: usize,
    /// The payload bytes of all free blocks.
    pub free_bytes: usize,
    /// The bytes occupied by block headers.
    pub overhead_bytes: usize,
    /// The largest payload a single free block could provide.
    pub largest_free: usize,
    /// The occupancy bitmap of the size classes.
    pub class_bitmap: u32,
}

/// A half-fit memory allocator over a single arena.
///
/// This allocator hands out blocks of contiguous bytes aligned to
/// [`ALIGNMENT`]. Free blocks are kept in one list per power-of-two size
/// class and a bitmap records, which lists are non-empty. Both allocation and
/// release run in a bounded number of steps, independent of the number of
/// blocks in the arena.
///
/// The allocator is not reentrant: concurrent use has to be serialized by the
/// caller (e.g. by a mutex, as done by [`Allocator`](crate::Allocator)).
///
/// Block headers store offsets, not addresses. With an inline storage like
/// [`Heap`] the allocator may therefore be moved freely before the first
/// allocation, but moving it afterwards invalidates all handed out pointers.
pub struct RawAllocator<S> {
    buffer: Buffer<S>,
    index: SizeClassIndex,
    formatted: bool,
    logging: bool,
}
impl<S: Storage> RawAllocator<S> {
    /// Create an allocator over the given arena.
    ///
    /// The whole arena is formatted as a single free block. The arena has to
    /// start at an address aligned to [`ALIGNMENT`] and its length has to be
    /// a multiple of it in the range `MIN_BLOCK_SIZE..=MAX_ARENA_SIZE`.
    pub fn init(storage: S) -> Result<Self, InitError> {
        let mut allocator = Self::unformatted(storage);
        allocator.logging = true;
        allocator.validate()?;
        allocator.format();
        Ok(allocator)
    }

    /// Wrap the storage without validating or formatting it.
    ///
    /// The caller is responsible to validate the storage and to call
    /// [`ensure_formatted()`](Self::ensure_formatted) before the first use.
    ///
    /// Such an allocator does not log: it backs the global allocator, where a
    /// logger allocating memory would re-enter the allocator.
    pub(crate) const fn unformatted(storage: S) -> Self {
        Self {
            buffer: Buffer::new(storage),
            index: SizeClassIndex::new(),
            formatted: false,
            logging: false,
        }
    }

    /// Format the arena on first use.
    pub(crate) fn ensure_formatted(&mut self) {
        if !self.formatted {
            self.format();
        }
    }

    fn validate(&self) -> Result<(), InitError> {
        let len = self.buffer.len();
        if len < MIN_BLOCK_SIZE {
            Err(InitError::TooSmall)
        } else if len > MAX_ARENA_SIZE {
            Err(InitError::TooLarge)
        } else if self.buffer.base() % ALIGNMENT != 0 {
            Err(InitError::MisalignedBase)
        } else if len % ALIGNMENT != 0 {
            Err(InitError::MisalignedSize)
        } else {
            Ok(())
        }
    }

    fn format(&mut self) {
        let len = self.buffer.len();
        let whole = self.buffer.write(0, Header::free(len, 0));
        self.index.clear();
        self.link(whole);
        self.formatted = true;
        event!(self, debug, "formatted arena of {} bytes at {:#x}", len, self.buffer.base());
    }

    /// Re-format the arena as a single free block.
    ///
    /// All outstanding allocations are silently discarded: pointers handed out
    /// before must not be used or freed afterwards.
    pub fn reset(&mut self) {
        self.format();
    }

    /// The total number of bytes of the arena.
    pub fn arena_size(&self) -> usize {
        self.buffer.len()
    }

    /// Allocate a new memory block of `n` bytes.
    ///
    /// The returned pointer is aligned to [`ALIGNMENT`] and is valid for
    /// reads and writes of at least `n` bytes until it is passed to
    /// [`free()`](Self::free). The choice of the block is deterministic for a
    /// given allocator state.
    ///
    /// # Algorithm
    /// The request is turned into a block size (header plus `n`, rounded up to
    /// the granularity). The bitmap is scanned for the first non-empty class,
    /// whose blocks are all large enough, and the head of its list is taken.
    /// If there is none, the head of the class just below is taken, if it
    /// happens to be large enough. If the taken block is larger than needed by
    /// at least [`MIN_BLOCK_SIZE`], the tail is split off and put back as a new
    /// free block.
    pub fn allocate(&mut self, n: usize) -> Result<NonNull<u8>, AllocError> {
        if n == 0 {
            return Err(AllocError::ZeroSize);
        }
        let needed = match block_size_for(n) {
            Some(needed) => needed,
            None => return self.out_of_memory(n),
        };
        let block = match self.find_block(needed) {
            Some(block) => block,
            None => return self.out_of_memory(n),
        };
        self.unlink(block);
        self.split(block, needed);
        self.buffer[block].mark_used();

        let ptr = self.buffer.payload_of(block);
        event!(self, trace, "allocate({}) -> {:p} (block of {})", n, ptr, self.buffer[block].size());
        Ok(ptr)
    }

    fn out_of_memory(&self, n: usize) -> Result<NonNull<u8>, AllocError> {
        event!(self, debug, "allocate({}) -> out of memory", n);
        Err(AllocError::OutOfMemory)
    }

    /// Find a free block of at least `needed` bytes without taking it.
    fn find_block(&self, needed: usize) -> Option<ValidatedOffset> {
        let start = size_class::search_start(needed);
        if let Some(class) = self.index.first_at_or_above(start) {
            let head = self.index.head(class)?;
            // SAFETY: list heads are always valid block headers
            return Some(unsafe { self.buffer.assume_valid(head) });
        }

        // the class below the search start may still contain a fitting block:
        // looking at its head keeps the search bounded
        let below = size_class::class_of(needed).min(CLASS_COUNT - 1);
        let head = self.index.head(below)?;
        // SAFETY: list heads are always valid block headers
        let head = unsafe { self.buffer.assume_valid(head) };
        (self.buffer[head].size() >= needed).then(|| head)
    }

    /// Shrink an unlinked block to `needed` bytes and put the tail back.
    fn split(&mut self, block: ValidatedOffset, needed: usize) {
        let size = self.buffer[block].size();
        let remaining = size - needed;
        if remaining < MIN_BLOCK_SIZE {
            return;
        }

        self.buffer[block].set_size(needed);
        let rest = self
            .buffer
            .write(block.get() + needed, Header::free(remaining, needed));
        if let Some(next) = self.buffer.following(rest) {
            self.buffer[next].set_prev_size(remaining);
        }
        self.link(rest);
    }

    /// Free a pointer returned by [`allocate()`](Self::allocate).
    ///
    /// The block is marked as free and merged with its free physical
    /// neighbors, so that there are never two adjacent free blocks. The
    /// resulting block is put in front of the free list of its class. The
    /// payload bytes are not modified.
    ///
    /// # Errors
    /// Misuse is detected and reported instead of corrupting the arena:
    /// pointers outside of the arena or not aligned to a payload boundary are
    /// reported as [`FreeError::AllocationNotFound`], freeing a free block as
    /// [`FreeError::DoubleFreeDetected`] and an overwritten header as
    /// [`FreeError::HeaderCorrupted`]. Nothing is changed in these cases.
    ///
    /// # Safety
    /// `ptr` has to be a pointer returned by this allocator or a pointer
    /// outside of its arena. A pointer into the middle of an allocation makes
    /// the allocator interpret arbitrary (possibly uninitialized) payload
    /// bytes as a header.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) -> Result<(), FreeError> {
        let block = match self.validate_ptr(ptr) {
            Ok(block) => block,
            Err(error) => {
                event!(self, error, "free({:p}) rejected: {}", ptr, error);
                return Err(error);
            }
        };

        // The header stays behind inside the merged block, if the block is
        // absorbed by its predecessor: it must not look used anymore.
        let own = self.buffer[block];
        self.buffer[block] = Header::free(own.size(), own.prev_size());

        let mut start = block;
        let mut size = self.buffer[block].size();
        if let Some(next) = self.buffer.following(block) {
            if self.buffer[next].is_free() {
                self.unlink(next);
                size += self.buffer[next].size();
            }
        }
        if let Some(prev) = self.buffer.preceding(block) {
            if self.buffer[prev].is_free() {
                self.unlink(prev);
                size += self.buffer[prev].size();
                start = prev;
            }
        }

        let prev_size = self.buffer[start].prev_size();
        let merged = self.buffer.write(start.get(), Header::free(size, prev_size));
        if let Some(next) = self.buffer.following(merged) {
            self.buffer[next].set_prev_size(size);
        }
        self.link(merged);

        event!(self, trace, "free({:p}) -> free block of {} at {:#x}", ptr, size, start.get());
        Ok(())
    }

    /// Check, that `ptr` names a used block of this arena.
    ///
    /// # Safety
    /// See [`free()`](Self::free).
    unsafe fn validate_ptr(&self, ptr: NonNull<u8>) -> Result<ValidatedOffset, FreeError> {
        let offset = self
            .buffer
            .header_offset_of(ptr)
            .ok_or(FreeError::AllocationNotFound)?;
        let header = self.buffer.peek(offset);
        let state = header.state().ok_or(FreeError::AllocationNotFound)?;

        let fits = header.size() >= MIN_BLOCK_SIZE
            && header.size() % ALIGNMENT == 0
            && offset + header.size() <= self.buffer.len()
            && header.prev_size() <= offset;
        if !header.is_intact() || !fits {
            return Err(FreeError::HeaderCorrupted);
        }
        match state {
            State::Used => Ok(self.buffer.assume_valid(offset)),
            State::Free => Err(FreeError::DoubleFreeDetected),
        }
    }

    /// Query the number of payload bytes usable through a pointer returned by
    /// [`allocate()`](Self::allocate).
    ///
    /// This is at least the requested size, but might be larger due to
    /// rounding or a remainder too small to be split off.
    ///
    /// # Safety
    /// Same as [`free()`](Self::free).
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize, FreeError> {
        let block = self.validate_ptr(ptr)?;
        Ok(self.buffer[block].payload_size())
    }

    /// Insert a free block in front of the free list of its class.
    fn link(&mut self, block: ValidatedOffset) {
        let class = size_class::class_of(self.buffer[block].size());
        let head = self.index.head(class);
        if let Some(head) = head {
            // SAFETY: list heads are always valid block headers
            let head = unsafe { self.buffer.assume_valid(head) };
            self.buffer[head].set_prev_free(Some(block.get()));
        }
        let header = &mut self.buffer[block];
        header.set_prev_free(None);
        header.set_next_free(head);
        self.index.set_head(class, Some(block.get()));
    }

    /// Remove a free block from the free list of its class.
    fn unlink(&mut self, block: ValidatedOffset) {
        let header = self.buffer[block];
        let class = size_class::class_of(header.size());
        if let Some(next) = header.next_free() {
            // SAFETY: free-list links always point to valid block headers
            let next = unsafe { self.buffer.assume_valid(next) };
            self.buffer[next].set_prev_free(header.prev_free());
        }
        match header.prev_free() {
            Some(prev) => {
                // SAFETY: free-list links always point to valid block headers
                let prev = unsafe { self.buffer.assume_valid(prev) };
                self.buffer[prev].set_next_free(header.next_free());
            }
            None => self.index.set_head(class, header.next_free()),
        }
    }

    /// Gather usage statistics by walking the block chain.
    pub fn stats(&self) -> Stats {
        let mut stats = Stats {
            arena_size: self.buffer.len(),
            used_blocks: 0,
            free_blocks: 0,
            used_bytes: 0,
            free_bytes: 0,
            overhead_bytes: 0,
            largest_free: 0,
            class_bitmap: self.index.bitmap(),
        };
        for block in self.buffer.blocks() {
            let header = &self.buffer[block];
            stats.overhead_bytes += HEADER_SIZE;
            if header.is_free() {
                stats.free_blocks += 1;
                stats.free_bytes += header.payload_size();
                stats.largest_free = stats.largest_free.max(header.payload_size());
            } else {
                stats.used_blocks += 1;
                stats.used_bytes += header.payload_size();
            }
        }
        stats
    }

    /// Verify the invariants of the arena.
    ///
    /// This walks the whole chain and all free lists, so it takes time linear
    /// in the number of blocks. It checks, that the blocks exactly tile the
    /// arena, that no two adjacent blocks are free, that every free block is
    /// listed exactly once in the list of its class and that the bitmap
    /// matches the lists.
    pub fn check_integrity(&self) -> Result<(), IntegrityError> {
        let len = self.buffer.len();
        let mut expected_offset = 0;
        let mut prev: Option<(usize, bool)> = None;
        let mut free_blocks = 0;
        for block in self.buffer.blocks() {
            let offset = block.get();
            let header = &self.buffer[block];
            if !header.is_intact() {
                return Err(IntegrityError::BadHeader(offset));
            }
            let prev_size = prev.map_or(0, |(size, _)| size);
            let tiles = offset == expected_offset
                && header.prev_size() == prev_size
                && header.size() >= MIN_BLOCK_SIZE
                && header.size() % ALIGNMENT == 0
                && offset + header.size() <= len;
            if !tiles {
                return Err(IntegrityError::BrokenChain(offset));
            }
            if header.is_free() {
                if prev.map_or(false, |(_, free)| free) {
                    return Err(IntegrityError::Uncoalesced(offset));
                }
                free_blocks += 1;
            }
            prev = Some((header.size(), header.is_free()));
            expected_offset = offset + header.size();
        }
        if expected_offset != len {
            return Err(IntegrityError::BrokenChain(expected_offset));
        }

        let mut listed = 0;
        for class in 0..CLASS_COUNT {
            let mut prev = None;
            let mut cursor = self.index.head(class);
            while let Some(offset) = cursor {
                listed += 1;
                if listed > free_blocks {
                    return Err(IntegrityError::FreeBlockCountMismatch);
                }
                let header = self.listed_header(offset, class)?;
                if header.prev_free() != prev {
                    return Err(IntegrityError::BrokenFreeList(class));
                }
                prev = Some(offset);
                cursor = header.next_free();
            }
        }
        if listed != free_blocks {
            return Err(IntegrityError::FreeBlockCountMismatch);
        }
        Ok(())
    }

    /// Look up a block referenced by the free list of `class`.
    fn listed_header(&self, offset: usize, class: usize) -> Result<Header, IntegrityError> {
        let on_chain = self.buffer.blocks().any(|block| block.get() == offset);
        if !on_chain {
            return Err(IntegrityError::BrokenFreeList(class));
        }
        // SAFETY: the offset is the start of a block of the chain
        let header = self.buffer[unsafe { self.buffer.assume_valid(offset) }];
        if !header.is_free() || size_class::class_of(header.size()) != class {
            return Err(IntegrityError::WrongClass(offset));
        }
        Ok(header)
    }
}

/// Compute the size of a block with a payload of `n` bytes.
///
/// Returns `None` if no block of that size can exist.
fn block_size_for(n: usize) -> Option<usize> {
    let size = n.checked_add(HEADER_SIZE + ALIGNMENT - 1)? & !(ALIGNMENT - 1);
    (size <= MAX_ARENA_SIZE).then(|| size.max(MIN_BLOCK_SIZE))
}
