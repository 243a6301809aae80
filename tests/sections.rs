//! This test ensures, that the allocator heap is not placed in `.data`.
//!
//! The `.data`-section holds global variables with a non-zero initial value.
//! Their initial contents have to be stored in the non-volatile flash of most
//! micro-controllers, so every byte in `.data` costs flash as well as RAM.
//!
//! A `static` [`halffit::Allocator`] must therefore be entirely zeroed or
//! uninitialized at compile time: the heap bytes are left uninitialized, the
//! size-class index starts out with an empty bitmap and the arena is only
//! formatted on the first allocation. If any of this changed, e.g. by writing
//! the initial block header in the `const` constructor, the whole heap would
//! end up in `.data` and this test fails.

use std::alloc::{GlobalAlloc, Layout};
use std::ptr;

static ALLOCATOR: halffit::Allocator<{ 128 * 1024 * 1024 }> = halffit::Allocator::new();

#[cfg(all(target_arch = "x86_64", target_os = "linux"))] // default GNU linker script only
#[test]
fn static_heap_lives_in_bss() {
    // Use the allocator, so that it is not optimized out of the binary.
    // SAFETY: the pointer is freed with the layout it was allocated with.
    unsafe {
        let layout = Layout::new::<u64>();
        let ptr = ALLOCATOR.alloc(layout);
        assert!(!ptr.is_null());
        ALLOCATOR.dealloc(ptr, layout);
    }

    let sections = Sections::locate();
    assert_eq!(
        sections.data_end, sections.bss_start,
        "test assumes .bss directly after .data"
    );

    let allocator = ptr::addr_of!(ALLOCATOR) as usize;
    assert!(allocator >= sections.bss_start, "allocator is placed in .data");
}

/// Section boundaries taken from the symbols of the default linker script.
struct Sections {
    data_end: usize,
    bss_start: usize,
}
impl Sections {
    fn locate() -> Self {
        extern "C" {
            static _edata: u8;
            static __bss_start: u8;
        }

        // SAFETY: only the addresses of the linker symbols are taken
        unsafe {
            Self {
                data_end: ptr::addr_of!(_edata) as usize,
                bss_start: ptr::addr_of!(__bss_start) as usize,
            }
        }
    }
}
