//! The size-class index: one free list per power-of-two class plus a bitmap
//! of the non-empty lists.
//!
//! Class `c` holds the free blocks with a size in the range
//! `[2^(c + MIN_EXP), 2^(c + MIN_EXP + 1))`, i.e. a free block is classified
//! by the largest power of two not exceeding its size. A request is looked up
//! the other way around: its size is rounded _up_ to the next power of two,
//! since every block in that class (or above) is guaranteed to be large
//! enough. Finding the first populated class at or above is a single masking
//! and a trailing-zeros count, so the lookup time depends on neither the
//! number of free blocks nor on the fragmentation of the arena.
use super::MIN_BLOCK_SIZE;

/// The exponent of the smallest class, which is the minimum block size.
const MIN_EXP: u32 = MIN_BLOCK_SIZE.trailing_zeros();

/// The number of size classes. Block sizes are stored as `u32`, so no block
/// can be larger than `2^32 - 1`.
pub const CLASS_COUNT: usize = (u32::BITS - MIN_EXP) as usize;

const _: () = assert!(MIN_BLOCK_SIZE.is_power_of_two());
const _: () = assert!(CLASS_COUNT <= u32::BITS as usize);

/// Compute the class of a free block of the given size (rounding down).
///
/// # Panics
/// This function panics if the size is below the minimum block size.
pub const fn class_of(size: usize) -> usize {
    assert!(size >= MIN_BLOCK_SIZE, "block smaller than minimum block size");
    (usize::BITS - 1 - size.leading_zeros() - MIN_EXP) as usize
}

/// Compute the first class, whose blocks all can hold a block of the given
/// size (rounding up).
///
/// The result might be equal to or exceed [`CLASS_COUNT`], which means, that
/// there is no such class.
pub const fn search_start(size: usize) -> usize {
    let class = class_of(size);
    if size.is_power_of_two() {
        class
    } else {
        class + 1
    }
}

/// The heads of the free lists together with the occupancy bitmap.
///
/// Bit `c` of the bitmap is set if and only if the free list of class `c` is
/// non-empty. The head of a class is only meaningful while its bit is set,
/// which allows an all-zero initial state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeClassIndex {
    bitmap: u32,
    heads: [u32; CLASS_COUNT],
}
impl SizeClassIndex {
    /// Create an index with all lists empty.
    pub const fn new() -> Self {
        Self {
            bitmap: 0,
            heads: [0; CLASS_COUNT],
        }
    }

    /// Empty all the free lists.
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    /// The occupancy bitmap of the classes.
    pub const fn bitmap(&self) -> u32 {
        self.bitmap
    }

    /// The offset of the first block in the free list of the given class.
    pub fn head(&self, class: usize) -> Option<usize> {
        (self.bitmap & (1 << class) != 0).then(|| self.heads[class] as usize)
    }

    /// Replace the head of the given class, which also updates the bitmap.
    pub fn set_head(&mut self, class: usize, head: Option<usize>) {
        match head {
            Some(offset) => {
                self.heads[class] = offset as u32;
                self.bitmap |= 1 << class;
            }
            None => self.bitmap &= !(1 << class),
        }
    }

    /// Find the lowest non-empty class at or above the given one.
    pub fn first_at_or_above(&self, class: usize) -> Option<usize> {
        if class >= CLASS_COUNT {
            return None;
        }
        let candidates = self.bitmap & (u32::MAX << class);
        (candidates != 0).then(|| candidates.trailing_zeros() as usize)
    }
}
