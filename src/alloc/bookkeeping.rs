//! The allocator behind the tracker's own containers.
//!
//! The registry's live table and history log have to allocate somewhere,
//! and that somewhere must not be the intercepted path or every insert
//! would recurse back into [`record`](crate::AllocationRegistry::record).
//! `BookkeepingAlloc` routes straight to [`std::alloc::System`], bypassing
//! whatever `#[global_allocator]` is installed.

use allocator_api2::alloc::{AllocError, Allocator};
use std::alloc::{GlobalAlloc, Layout, System};
use std::ptr::{self, NonNull};

/// Stateless allocator forwarding to the raw system allocator. Injected
/// into every internal container of the tracker.
#[derive(Clone, Copy, Debug, Default)]
pub struct BookkeepingAlloc;

unsafe impl Allocator for BookkeepingAlloc {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            // Zero-size requests get a dangling, well-aligned pointer.
            let dangling = layout.align() as *mut u8;
            let slice = ptr::slice_from_raw_parts_mut(dangling, 0);
            // SAFETY: align() is never zero.
            return Ok(unsafe { NonNull::new_unchecked(slice) });
        }

        // SAFETY: layout has non-zero size.
        let raw = unsafe { System.alloc(layout) };
        let slice = ptr::slice_from_raw_parts_mut(raw, layout.size());
        NonNull::new(slice).ok_or(AllocError)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() != 0 {
            // SAFETY: the block was obtained from System with this layout.
            unsafe { System.dealloc(ptr.as_ptr(), layout) };
        }
    }
}
