use super::header::Header;
use super::ALIGNMENT;

use core::mem::{self, MaybeUninit};
use core::ptr::NonNull;

/// The backing memory of an arena.
///
/// This is implemented for every type, that can be viewed as a (mutable)
/// slice of possibly uninitialized bytes, e.g. `&mut [MaybeUninit<u8>]`,
/// `Box<[MaybeUninit<u8>]>` or the inline [`Heap`].
pub trait Storage: AsRef<[MaybeUninit<u8>]> + AsMut<[MaybeUninit<u8>]> {}
impl<T: AsRef<[MaybeUninit<u8>]> + AsMut<[MaybeUninit<u8>]> + ?Sized> Storage for T {}

/// An inline, suitably aligned arena of `N` bytes.
///
/// The memory is left uninitialized, so a `static` containing a [`Heap`] is
/// placed into the `.bss`-section and does not occupy any flash.
#[repr(align(8))]
pub struct Heap<const N: usize>([MaybeUninit<u8>; N]);
impl<const N: usize> Heap<N> {
    /// Create a new, uninitialized heap.
    pub const fn new() -> Self {
        Self([MaybeUninit::uninit(); N])
    }
}
impl<const N: usize> Default for Heap<N> {
    fn default() -> Self {
        Self::new()
    }
}
impl<const N: usize> AsRef<[MaybeUninit<u8>]> for Heap<N> {
    fn as_ref(&self) -> &[MaybeUninit<u8>] {
        &self.0
    }
}
impl<const N: usize> AsMut<[MaybeUninit<u8>]> for Heap<N> {
    fn as_mut(&mut self) -> &mut [MaybeUninit<u8>] {
        &mut self.0
    }
}

/// An offset into the [`Buffer`], that is validated and known to be safe.
///
/// A validated offset always points to a block header written by the
/// allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatedOffset(usize);
impl ValidatedOffset {
    /// The raw byte offset into the arena.
    pub const fn get(self) -> usize {
        self.0
    }
}

/// The buffer memory backing the arena.
pub struct Buffer<S>(S);
impl<S: Storage> Buffer<S> {
    /// Wrap the storage without touching it.
    pub const fn new(storage: S) -> Self {
        Self(storage)
    }

    /// The total number of bytes of the arena.
    pub fn len(&self) -> usize {
        self.0.as_ref().len()
    }

    /// The address of the first byte of the arena.
    pub fn base(&self) -> usize {
        self.0.as_ref().as_ptr() as usize
    }

    /// Obtain a reference to a [`Header`] inside of the buffer.
    ///
    /// For safety-reasons this function does not return the [`Header`]
    /// directly, but a [`MaybeUninit<Header>`] instead. The caller has to use
    /// an `unsafe`-block when actually assuming, that the memory is
    /// initialized with a valid header.
    ///
    /// # Panics
    /// This function panics if the offset is not a multiple of the header
    /// alignment or the header would extend past the end of the buffer.
    fn at(&self, offset: usize) -> &MaybeUninit<Header> {
        assert!(offset % mem::align_of::<Header>() == 0);
        assert!(offset + Header::SIZE <= self.len());

        // SAFETY: the bounds are checked by the assert above, so the whole
        // header lies inside the buffer. The alignment is satisfied, since the
        // offset is a multiple of the header alignment and the base of the
        // buffer is at least 8-aligned (checked when the arena is
        // initialized). Whether the memory holds a valid header is up to the
        // caller, which is why a `MaybeUninit` is returned.
        unsafe {
            let memory = self.0.as_ref()[offset..offset + Header::SIZE].as_ptr();
            #[allow(clippy::cast_ptr_alignment)] // alignment is asserted above
            &*(memory.cast::<MaybeUninit<Header>>())
        }
    }

    /// Obtain a mutable reference to a [`Header`] inside of the buffer.
    ///
    /// Please see [`at()`](Self::at) for details.
    fn at_mut(&mut self, offset: usize) -> &mut MaybeUninit<Header> {
        assert!(offset % mem::align_of::<Header>() == 0);
        assert!(offset + Header::SIZE <= self.len());

        // SAFETY: same as `at()`
        unsafe {
            let memory = self.0.as_mut()[offset..offset + Header::SIZE].as_mut_ptr();
            #[allow(clippy::cast_ptr_alignment)] // alignment is asserted above
            &mut *(memory.cast::<MaybeUninit<Header>>())
        }
    }

    /// Write a new header at the given offset and mark the offset as valid.
    ///
    /// # Panics
    /// Panics under the same conditions as [`at()`](Self::at).
    pub fn write(&mut self, offset: usize, header: Header) -> ValidatedOffset {
        self.at_mut(offset).write(header);
        ValidatedOffset(offset)
    }

    /// Mark an offset obtained from a header link or size as valid.
    ///
    /// # Safety
    /// The offset must point to a header written by the allocator, i.e. it has
    /// to be derived from the size or the links of another valid header.
    pub unsafe fn assume_valid(&self, offset: usize) -> ValidatedOffset {
        debug_assert!(offset + Header::SIZE <= self.len());
        ValidatedOffset(offset)
    }

    /// Map a payload pointer back to the offset of its (alleged) header.
    ///
    /// This returns `None`, if the pointer lies outside of the arena, is not
    /// aligned to a payload boundary or does not leave room for a header in
    /// front of it.
    pub fn header_offset_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let offset = (ptr.as_ptr() as usize).checked_sub(self.base())?;
        let offset = offset.checked_sub(Header::SIZE)?;
        let in_bounds = offset + Header::SIZE < self.len();
        let aligned = offset % ALIGNMENT == 0;
        (in_bounds && aligned).then(|| offset)
    }

    /// Read the header at an unvalidated offset.
    ///
    /// # Safety
    /// The memory at the offset has to be initialized, which is the case for
    /// any offset returned by [`header_offset_of()`](Self::header_offset_of)
    /// for a pointer handed out by the allocator.
    pub unsafe fn peek(&self, offset: usize) -> Header {
        self.at(offset).assume_init_read()
    }

    /// Iterate over all blocks of the chain and obtain the
    /// [`ValidatedOffset`]s of their headers.
    pub fn blocks(&self) -> BlockIter<'_, S> {
        BlockIter::new(self)
    }

    /// Request a pointer to the payload of the block at an offset.
    pub fn payload_of(&mut self, offset: ValidatedOffset) -> NonNull<u8> {
        let offset = offset.0 + Header::SIZE;
        let memory = self.0.as_mut()[offset..].as_mut_ptr();
        // SAFETY: pointers into a slice are never null
        unsafe { NonNull::new_unchecked(memory.cast::<u8>()) }
    }

    /// Query the block physically following the given one.
    ///
    /// If there is no block after it (because the given one is the last in
    /// the buffer), then `None` is returned.
    pub fn following(&self, offset: ValidatedOffset) -> Option<ValidatedOffset> {
        let next = offset.0 + self[offset].size();
        (next < self.len()).then(|| ValidatedOffset(next))
    }

    /// Query the block physically preceding the given one.
    ///
    /// If the given one is the first block, then `None` is returned.
    pub fn preceding(&self, offset: ValidatedOffset) -> Option<ValidatedOffset> {
        match self[offset].prev_size() {
            0 => None,
            prev_size => Some(ValidatedOffset(offset.0 - prev_size)),
        }
    }
}
impl<S: Storage> core::ops::Index<ValidatedOffset> for Buffer<S> {
    type Output = Header;

    fn index(&self, index: ValidatedOffset) -> &Self::Output {
        // SAFETY: the `ValidatedOffset` marks the read valid (safety invariant
        // of that type)
        unsafe { self.at(index.0).assume_init_ref() }
    }
}
impl<S: Storage> core::ops::IndexMut<ValidatedOffset> for Buffer<S> {
    fn index_mut(&mut self, index: ValidatedOffset) -> &mut Self::Output {
        // SAFETY: the `ValidatedOffset` marks the read valid (safety invariant
        // of that type)
        unsafe { self.at_mut(index.0).assume_init_mut() }
    }
}

/// An iterator over the block chain of a formatted [`Buffer`].
pub struct BlockIter<'buffer, S> {
    buffer: &'buffer Buffer<S>,
    offset: usize,
}
impl<'buffer, S: Storage> BlockIter<'buffer, S> {
    /// Create a block iterator over the given [`Buffer`].
    pub const fn new(buffer: &'buffer Buffer<S>) -> Self {
        Self { buffer, offset: 0 }
    }
}
impl<'buffer, S: Storage> Iterator for BlockIter<'buffer, S> {
    type Item = ValidatedOffset;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset + Header::SIZE <= self.buffer.len() {
            let offset = ValidatedOffset(self.offset);
            let size = self.buffer[offset].size();
            // a zero-sized block would never advance: stop on corruption
            self.offset = if size == 0 {
                usize::MAX - Header::SIZE
            } else {
                self.offset + size
            };
            Some(offset)
        } else {
            None
        }
    }
}
