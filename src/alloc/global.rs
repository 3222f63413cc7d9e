//! Route Rust's own allocations through the process-wide context.
//!
//! ```no_run
//! use guardalloc::MemGlobalAlloc;
//!
//! #[global_allocator]
//! static GLOBAL: MemGlobalAlloc = MemGlobalAlloc;
//! ```
//!
//! Every `Box`, `Vec` and `String` then shows up in the usage counters and,
//! on the guarded backend, in leak reports as `rust::alloc`. Once the leak
//! detector has run, any further deallocation aborts, so only arm it if the
//! process really frees everything before exit.

use std::alloc::{GlobalAlloc, Layout};

use crate::{api, os::mem::MIN_ALIGN};

const IDENTITY: Option<&str> = Some("rust::alloc");

pub struct MemGlobalAlloc;

impl MemGlobalAlloc {
    /// Both backends hand out pointer-aligned payloads from plain `malloc()`.
    /// Anything stricter goes through the aligned path.
    fn needs_aligned(layout: &Layout) -> bool {
        layout.align() > MIN_ALIGN
    }
}

unsafe impl GlobalAlloc for MemGlobalAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ctx = api::context();
        if Self::needs_aligned(&layout) {
            ctx.malloc_n_aligned(layout.size(), layout.align(), IDENTITY)
        } else {
            ctx.malloc_n(layout.size(), IDENTITY)
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ctx = api::context();
        if Self::needs_aligned(&layout) {
            ctx.calloc_n_aligned(layout.size(), layout.align(), IDENTITY)
        } else {
            ctx.calloc_n(layout.size(), IDENTITY)
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // SAFETY: `ptr` came from `alloc()` on this allocator
        unsafe { api::context().free_n(ptr) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, _layout: Layout, new_size: usize) -> *mut u8 {
        // SAFETY: as above. Both backends keep the block's alignment on
        //         reallocation.
        unsafe { api::context().realloc_n_id(ptr, new_size, IDENTITY) }
    }
}
