//! The block header, which precedes every block of the arena.
use core::mem;

/// The sentinel offset marking the end of a free list.
pub const NIL: u32 = u32::MAX;

/// Tag of a block currently handed out to the user.
const USED: u32 = 0x4846_5553; // "HFUS"
/// Tag of a block sitting in one of the free lists.
const FREE: u32 = 0x4846_4652; // "HFFR"
/// Seed of the integrity check word.
const CHECK_SEED: u32 = 0x5A5A_A5A5;

/// The occupancy state of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// The block is handed out to the user.
    Used,
    /// The block is free and linked into its size class.
    Free,
}

/// The header in front of each block.
///
/// The header stores the total size of the block (including the header
/// itself) and the size of the physically preceding block. The next block
/// starts at `offset + size`, the previous one at `offset - prev_size`, so the
/// chain can be walked in both directions without stored pointers.
///
/// The free-list links are stored here as well (and not in the payload), so a
/// `free()` never touches the payload bytes. They are only meaningful while
/// the block is free.
///
/// All offsets and sizes are `u32`, which limits the arena to 4 GiB, but
/// keeps the header at 24 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Header {
    tag: u32,
    size: u32,
    prev_size: u32,
    check: u32,
    next_free: u32,
    prev_free: u32,
}
impl Header {
    /// The number of bytes of a header.
    pub const SIZE: usize = mem::size_of::<Self>();

    /// Create the header of a used block.
    #[cfg(test)]
    pub const fn used(size: usize, prev_size: usize) -> Self {
        Self::new(USED, size, prev_size)
    }

    /// Create the header of a free block, which is not linked into any list.
    pub const fn free(size: usize, prev_size: usize) -> Self {
        Self::new(FREE, size, prev_size)
    }

    const fn new(tag: u32, size: usize, prev_size: usize) -> Self {
        let size = size as u32;
        let prev_size = prev_size as u32;
        Self {
            tag,
            size,
            prev_size,
            check: check_word(size, prev_size),
            next_free: NIL,
            prev_free: NIL,
        }
    }

    /// The state of the block or `None`, if the tag is not a valid one.
    pub const fn state(&self) -> Option<State> {
        match self.tag {
            USED => Some(State::Used),
            FREE => Some(State::Free),
            _ => None,
        }
    }

    /// Query, whether the block is free.
    pub const fn is_free(&self) -> bool {
        self.tag == FREE
    }

    /// Check, that the tag is valid and the check word matches the sizes.
    pub const fn is_intact(&self) -> bool {
        self.state().is_some() && self.check == check_word(self.size, self.prev_size)
    }

    /// The total size of the block including this header.
    pub const fn size(&self) -> usize {
        self.size as usize
    }

    /// The size of the physically preceding block, `0` for the first block.
    pub const fn prev_size(&self) -> usize {
        self.prev_size as usize
    }

    /// The number of payload bytes of this block.
    pub const fn payload_size(&self) -> usize {
        self.size() - Self::SIZE
    }

    pub fn set_size(&mut self, size: usize) {
        self.size = size as u32;
        self.check = check_word(self.size, self.prev_size);
    }

    pub fn set_prev_size(&mut self, prev_size: usize) {
        self.prev_size = prev_size as u32;
        self.check = check_word(self.size, self.prev_size);
    }

    pub fn mark_used(&mut self) {
        self.tag = USED;
        self.next_free = NIL;
        self.prev_free = NIL;
    }

    /// The offset of the next block in the same free list.
    pub fn next_free(&self) -> Option<usize> {
        link(self.next_free)
    }

    /// The offset of the previous block in the same free list.
    pub fn prev_free(&self) -> Option<usize> {
        link(self.prev_free)
    }

    pub fn set_next_free(&mut self, next: Option<usize>) {
        self.next_free = next.map_or(NIL, |offset| offset as u32);
    }

    pub fn set_prev_free(&mut self, prev: Option<usize>) {
        self.prev_free = prev.map_or(NIL, |offset| offset as u32);
    }
}

const fn check_word(size: u32, prev_size: u32) -> u32 {
    CHECK_SEED ^ size ^ prev_size.rotate_left(16)
}

fn link(raw: u32) -> Option<usize> {
    (raw != NIL).then(|| raw as usize)
}
