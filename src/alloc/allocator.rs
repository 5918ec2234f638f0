//! The interception points.
//!
//! `TrackingAllocator` replaces the process's default allocation entry
//! points when installed with `#[global_allocator]`. It forwards every
//! request to [`std::alloc::System`] with a 16-byte minimum alignment and
//! mirrors the call into the [`AllocationRegistry`](crate::AllocationRegistry).
//! The tracker's presence never changes whether an allocation succeeds,
//! only what is reported at teardown.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;

use crate::registry::registry;

/// Every block handed out by the hooked path is at least this aligned.
pub const MIN_ALIGNMENT: usize = 16;

thread_local! {
    static SUPPRESS_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// RAII guard that suppresses bookkeeping on the current thread while it
/// is alive. The hook holds one around its own registry calls, so any
/// allocation made by the tracker's internals (or by the symbol backend)
/// passes through untracked instead of recursing.
pub struct SuppressGuard;

impl SuppressGuard {
    pub fn new() -> Self {
        SUPPRESS_DEPTH.with(|depth| depth.set(depth.get() + 1));
        SuppressGuard
    }
}

impl Default for SuppressGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SuppressGuard {
    fn drop(&mut self) {
        SUPPRESS_DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

fn suppressed() -> bool {
    SUPPRESS_DEPTH.with(|depth| depth.get() > 0)
}

fn padded(layout: Layout) -> Layout {
    if layout.align() >= MIN_ALIGNMENT {
        return layout;
    }
    match layout.align_to(MIN_ALIGNMENT) {
        Ok(aligned) => aligned,
        Err(_) => layout,
    }
}

/// Global allocator that records provenance for every allocation made
/// through the default path.
///
/// ```no_run
/// use leaktrail::TrackingAllocator;
///
/// #[global_allocator]
/// static ALLOC: TrackingAllocator = TrackingAllocator;
/// ```
pub struct TrackingAllocator;

impl TrackingAllocator {
    /// Annotated allocation entry point: like [`GlobalAlloc::alloc`] but
    /// additionally records a usage category and the call site. Prefer the
    /// [`alloc_tagged!`](crate::alloc_tagged) macro, which fills in
    /// `file!()` and `line!()`.
    ///
    /// There is deliberately no annotated deallocation counterpart: blocks
    /// obtained here are released through the plain path
    /// ([`std::alloc::dealloc`] with the same layout).
    ///
    /// # Safety
    ///
    /// Same contract as [`GlobalAlloc::alloc`]: `layout` must have
    /// non-zero size. `TrackingAllocator` must be the installed global
    /// allocator, otherwise the plain deallocation path will not route the
    /// block back to the system allocator it came from.
    pub unsafe fn alloc_with_site(
        &self,
        layout: Layout,
        category: u32,
        file: &'static str,
        line: u32,
    ) -> *mut u8 {
        // SAFETY: forwarded caller contract.
        let ptr = unsafe { System.alloc(padded(layout)) };
        if !ptr.is_null() && !suppressed() {
            let _guard = SuppressGuard::new();
            registry().record_with_site(ptr as usize, layout.size(), category, file, line);
        }
        ptr
    }
}

unsafe impl GlobalAlloc for TrackingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // SAFETY: forwarded caller contract.
        let ptr = unsafe { System.alloc(padded(layout)) };
        // A null return propagates to the caller exactly as the unwrapped
        // allocator's would; nothing is recorded for a block never obtained.
        if !ptr.is_null() && !suppressed() {
            let _guard = SuppressGuard::new();
            registry().record(ptr as usize, layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // Unregister regardless of the registry's enabled gate; a release
        // for an address the registry never saw is a defined no-op.
        if !suppressed() {
            let _guard = SuppressGuard::new();
            registry().release(ptr as usize);
        }
        // SAFETY: `ptr` came from `alloc` above, which padded identically.
        unsafe { System.dealloc(ptr, padded(layout)) };
    }
}

/// Annotated allocation with the call site filled in.
///
/// Expands to [`TrackingAllocator::alloc_with_site`] with `file!()` and
/// `line!()`, so the resulting [`AllocationRecord`](crate::AllocationRecord)
/// carries the source location of the macro invocation.
#[macro_export]
macro_rules! alloc_tagged {
    ($layout:expr, $category:expr) => {
        $crate::TrackingAllocator.alloc_with_site($layout, $category, file!(), line!())
    };
}
