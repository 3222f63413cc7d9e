//! The lock-free backend. Each block only carries its (4-byte rounded)
//! length, so there is no registry, no lock and no corruption detection.
//!
//! ```plaintext
//! unaligned:  [ len ][ payload... ]
//! aligned:    [ pad... ][ alignment ][ len | 1 ][ payload... ]
//! ```
//!
//! Rounding keeps the two low bits of `len` clear; bit 0 marks blocks that
//! carry an alignment word and came from the aligned host allocator.

use std::{
    fmt, mem,
    ptr::{self, NonNull},
};

use super::{
    checked_align,
    dispatch::{BackendKind, Fill, Identity, MemAllocator},
    layout::BlockLayout,
    usage::UsageTracker,
};
use crate::{
    error::{fatal, MemError},
    os::mem as os,
    util::{assert::pointer_aligned, hint::unlikely, num::checked_round_up},
};

const ALIGNED_FLAG: usize = 1;

const LEN_ROUND: usize = 4;

#[repr(C)]
struct LockfreeHeader {
    /// Rounded length, with [`ALIGNED_FLAG`]
    len: usize,
}

#[repr(C)]
struct LockfreeAlignedHeader {
    alignment: usize,
    head: LockfreeHeader,
}

const HEADER_SIZE: usize = mem::size_of::<LockfreeHeader>();
const ALIGNED_HEADER_SIZE: usize = mem::size_of::<LockfreeAlignedHeader>();

pub struct LockfreeAllocator;

impl LockfreeAllocator {
    pub const fn new() -> Self {
        Self
    }

    fn alloc_block(&self, usage: &UsageTracker, size: usize, align: usize, fill: Fill) -> *mut u8 {
        let Some(len) = checked_round_up(size, LEN_ROUND) else {
            return ptr::null_mut();
        };
        let layout = match align {
            0 => BlockLayout::unaligned(HEADER_SIZE, len, 0),
            align => BlockLayout::aligned(ALIGNED_HEADER_SIZE, len, 0, align),
        };
        let Some(layout) = layout else {
            return ptr::null_mut();
        };
        let base = if layout.is_aligned() {
            os::aligned_malloc(layout.total(), layout.align())
        } else {
            os::malloc(layout.total())
        };
        let Some(base) = base else {
            return ptr::null_mut();
        };

        // SAFETY: fresh allocation of `layout.total()` bytes; both headers
        //         land on pointer-aligned offsets
        let payload = unsafe {
            let header = layout.header_ptr(base);
            if layout.is_aligned() {
                header.cast::<LockfreeAlignedHeader>().as_ptr().write(LockfreeAlignedHeader {
                    alignment: layout.align(),
                    head: LockfreeHeader {
                        len: len | ALIGNED_FLAG,
                    },
                });
            } else {
                header.cast::<LockfreeHeader>().as_ptr().write(LockfreeHeader { len });
            }
            layout.payload_ptr(base)
        };
        if fill == Fill::Zero {
            // SAFETY: `len` payload bytes are ours
            unsafe { payload.as_ptr().write_bytes(0, len) };
        }
        usage.block_alloc(len);
        payload.as_ptr()
    }

    /// `(rounded len, alignment or 0)` of a block.
    ///
    /// # Safety
    ///
    /// `payload` must be a live block from this backend.
    unsafe fn decode(payload: NonNull<u8>) -> (usize, usize) {
        unsafe {
            let head = payload.sub(HEADER_SIZE).cast::<LockfreeHeader>().as_ptr().read();
            if head.len & ALIGNED_FLAG == 0 {
                return (head.len, 0);
            }
            let header = payload
                .sub(ALIGNED_HEADER_SIZE)
                .cast::<LockfreeAlignedHeader>()
                .as_ptr()
                .read();
            (head.len & !ALIGNED_FLAG, header.alignment)
        }
    }

    fn checked_payload(op: &'static str, ptr: *mut u8) -> NonNull<u8> {
        let Some(payload) = NonNull::new(ptr) else {
            fatal(MemError::NullFree);
        };
        if unlikely(!pointer_aligned(ptr)) {
            fatal(MemError::Misaligned {
                op,
                addr: ptr as usize,
            });
        }
        payload
    }

    unsafe fn realloc_with(&self, usage: &UsageTracker, ptr: *mut u8, size: usize, fill: Fill) -> *mut u8 {
        if ptr.is_null() {
            return self.alloc_block(usage, size, 0, fill);
        }
        let payload = Self::checked_payload("realloc", ptr);
        let (old_len, align) = unsafe { Self::decode(payload) };
        let new = self.alloc_block(usage, size, align, Fill::Uninit);
        if new.is_null() {
            return new;
        }
        unsafe {
            ptr::copy_nonoverlapping(ptr, new, old_len.min(size));
            if fill == Fill::Zero && size > old_len {
                new.add(old_len).write_bytes(0, size - old_len);
            }
            self.free_n(usage, ptr);
        }
        new
    }
}

impl Default for LockfreeAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemAllocator for LockfreeAllocator {
    fn kind(&self) -> BackendKind {
        BackendKind::Lockfree
    }

    fn malloc_n(&self, usage: &UsageTracker, size: usize, _identity: Identity) -> *mut u8 {
        self.alloc_block(usage, size, 0, Fill::Uninit)
    }

    fn malloc_n_aligned(
        &self,
        usage: &UsageTracker,
        size: usize,
        align: usize,
        _identity: Identity,
    ) -> *mut u8 {
        self.alloc_block(usage, size, checked_align(align), Fill::Uninit)
    }

    fn calloc_n(&self, usage: &UsageTracker, size: usize, _identity: Identity) -> *mut u8 {
        self.alloc_block(usage, size, 0, Fill::Zero)
    }

    fn calloc_n_aligned(
        &self,
        usage: &UsageTracker,
        size: usize,
        align: usize,
        _identity: Identity,
    ) -> *mut u8 {
        self.alloc_block(usage, size, checked_align(align), Fill::Zero)
    }

    unsafe fn realloc_n_id(
        &self,
        usage: &UsageTracker,
        ptr: *mut u8,
        size: usize,
        _identity: Identity,
    ) -> *mut u8 {
        unsafe { self.realloc_with(usage, ptr, size, Fill::Uninit) }
    }

    unsafe fn recalloc_n_id(
        &self,
        usage: &UsageTracker,
        ptr: *mut u8,
        size: usize,
        _identity: Identity,
    ) -> *mut u8 {
        unsafe { self.realloc_with(usage, ptr, size, Fill::Zero) }
    }

    unsafe fn dupalloc_n(&self, usage: &UsageTracker, ptr: *mut u8) -> *mut u8 {
        if ptr.is_null() {
            return ptr;
        }
        let payload = Self::checked_payload("dupalloc", ptr);
        let (len, align) = unsafe { Self::decode(payload) };
        let new = self.alloc_block(usage, len, align, Fill::Uninit);
        if !new.is_null() {
            unsafe { ptr::copy_nonoverlapping(ptr, new, len) };
        }
        new
    }

    unsafe fn free_n(&self, usage: &UsageTracker, ptr: *mut u8) {
        let payload = Self::checked_payload("free", ptr);
        let (len, align) = unsafe { Self::decode(payload) };
        usage.block_free(len);
        unsafe {
            if align == 0 {
                os::free(payload.sub(HEADER_SIZE));
            } else {
                let pad = BlockLayout::pad_for(ALIGNED_HEADER_SIZE, align);
                os::aligned_free(payload.sub(pad + ALIGNED_HEADER_SIZE));
            }
        }
    }

    unsafe fn alloc_n_length(&self, ptr: *mut u8) -> usize {
        let Some(payload) = NonNull::new(ptr) else {
            return 0;
        };
        if unlikely(!pointer_aligned(ptr)) {
            fatal(MemError::Misaligned {
                op: "length",
                addr: ptr as usize,
            });
        }
        unsafe { Self::decode(payload) }.0
    }

    fn print_memlist(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(out, "lockfree allocator: no block list is kept, switch to the guarded allocator to list blocks")
    }
}
