//! The guarded backend: every block carries a header with two sentinels, a
//! trailing sentinel after the payload, its size, alignment and identity, and
//! is linked into the [`BlockRegistry`] for as long as it is alive.
//!
//! ```plaintext
//! +-----------------------------+
//! | tag1 "MEMO"    | alignment  |
//! | size                        |
//! | prev, next (registry links) |
//! | identity (ptr, len)         |
//! | padding...     | tag2 "RYBL"|
//! +-----------------------------+ <- payload, aligned to MALLOC_ALIGN
//! | payload                     |      or to the requested alignment
//! +-----------------------------+
//! | tag3 "OCK!"   (unaligned)   |
//! +-----------------------------+
//! ```
//!
//! On free all three sentinels are overwritten with "FREE". A free that finds
//! anything other than three live sentinels aborts with the most precise
//! diagnosis it can make.

use std::{
    fmt, mem,
    ptr::{self, NonNull},
    sync::atomic::{AtomicBool, Ordering},
};

use super::{
    checked_align,
    dispatch::{BackendKind, Fill, Identity, IdentityPolicy, MemAllocator},
    layout::BlockLayout,
    registry::{BlockRegistry, Lookup},
    report::{self, BlockInfo},
    usage::UsageTracker,
    MAX_ALIGN,
};
use crate::{
    error::{fatal, CorruptTags, MemError},
    os::mem::{self as os, MALLOC_ALIGN},
    util::{assert::pointer_aligned, hint::unlikely, num::checked_round_up},
};

const fn make_tag(id: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*id)
}

pub const TAG1: u32 = make_tag(b"MEMO");
pub const TAG2: u32 = make_tag(b"RYBL");
pub const TAG3: u32 = make_tag(b"OCK!");
pub const FREED: u32 = make_tag(b"FREE");

/// Payload bytes painted by debug fill
pub const DEBUG_FILL_BYTE: u8 = 0xFF;

const HEADER_FIELDS: usize = 2 * mem::size_of::<u32>() + 5 * mem::size_of::<usize>();

/// Pads the header so that `tag2` is its last field and its size is a
/// multiple of [`MALLOC_ALIGN`].
const HEADER_PAD: usize = match checked_round_up(HEADER_FIELDS + mem::size_of::<u32>(), MALLOC_ALIGN) {
    Some(n) => n - HEADER_FIELDS - mem::size_of::<u32>(),
    None => panic!("header size overflows"),
};

#[repr(C)]
pub struct GuardedHeader {
    tag1: u32,
    /// `0` for blocks from plain `malloc()`
    alignment: u32,
    size: usize,
    pub(crate) prev: *mut GuardedHeader,
    pub(crate) next: *mut GuardedHeader,
    identity_ptr: *const u8,
    identity_len: usize,
    _pad: [u8; HEADER_PAD],
    tag2: u32,
}

#[repr(C)]
pub struct GuardedTail {
    tag3: u32,
}

pub const HEADER_SIZE: usize = mem::size_of::<GuardedHeader>();
pub const TAIL_SIZE: usize = mem::size_of::<GuardedTail>();

const _: () = assert!(HEADER_SIZE % MALLOC_ALIGN == 0);
const _: () = assert!(mem::offset_of!(GuardedHeader, tag2) + mem::size_of::<u32>() == HEADER_SIZE);
// the header stores the alignment as a `u32`
const _: () = assert!(MAX_ALIGN <= u32::MAX as usize);

/// A handle on a guarded block, by its header.
///
/// The handle itself is just an address. Every accessor reads one field with
/// a raw, unaligned-safe load, so inspecting a corrupt header never creates a
/// reference to garbage. Identity strings are only materialised for headers
/// whose tags check out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockRef(NonNull<GuardedHeader>);

impl BlockRef {
    /// # Safety
    ///
    /// `header` must point to at least [`HEADER_SIZE`] readable bytes, and
    /// to `size` payload bytes plus the tail if the tail is inspected.
    pub unsafe fn from_header(header: NonNull<GuardedHeader>) -> Self {
        Self(header)
    }

    /// # Safety
    ///
    /// As [`from_header()`](Self::from_header), for the header in front of
    /// `payload`.
    pub unsafe fn from_payload(payload: NonNull<u8>) -> Self {
        Self(unsafe { payload.sub(HEADER_SIZE) }.cast())
    }

    pub fn as_ptr(self) -> *mut GuardedHeader {
        self.0.as_ptr()
    }

    pub fn payload(self) -> NonNull<u8> {
        // SAFETY: the payload immediately follows the header
        unsafe { self.0.cast::<u8>().add(HEADER_SIZE) }
    }

    pub fn tag1(self) -> u32 {
        unsafe { ptr::addr_of!((*self.as_ptr()).tag1).read() }
    }

    pub fn tag2(self) -> u32 {
        unsafe { ptr::addr_of!((*self.as_ptr()).tag2).read() }
    }

    /// The trailing sentinel. Only meaningful when `size()` can be trusted.
    pub fn tag3(self) -> u32 {
        unsafe { self.tail().cast::<u32>().as_ptr().read_unaligned() }
    }

    pub fn size(self) -> usize {
        unsafe { ptr::addr_of!((*self.as_ptr()).size).read() }
    }

    /// `0` if the block is unaligned
    pub fn alignment(self) -> usize {
        unsafe { ptr::addr_of!((*self.as_ptr()).alignment).read() as usize }
    }

    pub(crate) fn next(self) -> *mut GuardedHeader {
        unsafe { ptr::addr_of!((*self.as_ptr()).next).read() }
    }

    /// The block's identity.
    ///
    /// # Safety
    ///
    /// The header must be intact: the identity was written from a
    /// `&'static str` at allocation and is rebuilt from its raw parts.
    pub unsafe fn identity(self) -> Identity {
        let (data, len) = unsafe {
            (
                ptr::addr_of!((*self.as_ptr()).identity_ptr).read(),
                ptr::addr_of!((*self.as_ptr()).identity_len).read(),
            )
        };
        if data.is_null() {
            return None;
        }
        // SAFETY: passed to caller
        unsafe { Some(std::str::from_utf8_unchecked(std::slice::from_raw_parts(data, len))) }
    }

    pub fn is_live(self) -> bool {
        self.tag1() == TAG1 && self.tag2() == TAG2
    }

    /// A released block keeps `tag2 == FREED`, but its first bytes (and with
    /// them `tag1`) may since hold the host's own free list links. A `tag1`
    /// that still reads live means `tag2` was overwritten instead.
    pub fn is_freed(self) -> bool {
        self.tag2() == FREED && self.tag1() != TAG1
    }

    pub fn corrupt_header_tags(self) -> CorruptTags {
        CorruptTags {
            tag1: self.tag1() != TAG1,
            tag2: self.tag2() != TAG2,
            tag3: false,
        }
    }

    /// The layout this block was allocated with.
    pub fn layout(self) -> Option<BlockLayout> {
        match self.alignment() {
            0 => BlockLayout::unaligned(HEADER_SIZE, self.size(), TAIL_SIZE),
            align => BlockLayout::aligned(HEADER_SIZE, self.size(), TAIL_SIZE, align),
        }
    }

    fn tail(self) -> NonNull<u8> {
        unsafe { self.payload().add(self.size()) }
    }

    fn mark_freed(self) {
        unsafe {
            ptr::addr_of_mut!((*self.as_ptr()).tag1).write(FREED);
            ptr::addr_of_mut!((*self.as_ptr()).tag2).write(FREED);
            self.tail().cast::<u32>().as_ptr().write_unaligned(FREED);
        }
    }

    pub fn info(self) -> BlockInfo {
        BlockInfo {
            addr: self.payload().as_ptr() as usize,
            size: self.size(),
            align: self.alignment(),
            // SAFETY: only called on blocks that passed the registry walk
            identity: unsafe { self.identity() },
        }
    }
}

/// The guarded allocator. Owns the registry of its live blocks.
pub struct GuardedAllocator {
    registry: BlockRegistry,
    debug_fill: AtomicBool,
}

impl GuardedAllocator {
    pub const fn new(debug_fill: bool) -> Self {
        Self {
            registry: BlockRegistry::new(),
            debug_fill: AtomicBool::new(debug_fill),
        }
    }

    pub fn registry(&self) -> &BlockRegistry {
        &self.registry
    }

    /// Paint fresh, non-zeroed payloads with [`DEBUG_FILL_BYTE`] so reads of
    /// uninitialised memory stand out.
    pub fn set_debug_fill(&self, enabled: bool) {
        self.debug_fill.store(enabled, Ordering::Relaxed);
    }

    pub fn debug_fill(&self) -> bool {
        self.debug_fill.load(Ordering::Relaxed)
    }

    /// Allocate, tag and register a block. `align == 0` means unaligned.
    fn alloc_block(
        &self,
        usage: &UsageTracker,
        size: usize,
        align: usize,
        fill: Fill,
        identity: Identity,
    ) -> *mut u8 {
        let layout = match align {
            0 => BlockLayout::unaligned(HEADER_SIZE, size, TAIL_SIZE),
            align => BlockLayout::aligned(HEADER_SIZE, size, TAIL_SIZE, align),
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

        // SAFETY: `base` points to `layout.total()` fresh bytes, and the
        //         header offset is a multiple of the header's alignment
        //         (`pad` is a multiple of the pointer size).
        let block = unsafe {
            let header = layout.header_ptr(base).cast::<GuardedHeader>();
            let (identity_ptr, identity_len) = match identity {
                Some(identity) => (identity.as_ptr(), identity.len()),
                None => (ptr::null(), 0),
            };
            header.as_ptr().write(GuardedHeader {
                tag1: TAG1,
                alignment: layout.align() as u32,
                size,
                prev: ptr::null_mut(),
                next: ptr::null_mut(),
                identity_ptr,
                identity_len,
                _pad: [0; HEADER_PAD],
                tag2: TAG2,
            });
            layout
                .tail_ptr(base)
                .cast::<GuardedTail>()
                .as_ptr()
                .write_unaligned(GuardedTail { tag3: TAG3 });
            BlockRef::from_header(header)
        };

        let payload = block.payload();
        debug_assert_eq!(payload, unsafe { layout.payload_ptr(base) });
        match fill {
            // SAFETY: the payload is `size` bytes we own
            Fill::Zero => unsafe { payload.as_ptr().write_bytes(0, size) },
            Fill::Uninit if self.debug_fill() => unsafe {
                payload.as_ptr().write_bytes(DEBUG_FILL_BYTE, size)
            },
            Fill::Uninit => {}
        }

        usage.block_alloc(size);
        // SAFETY: header was just written and is not linked
        unsafe { self.registry.link(block) };
        payload.as_ptr()
    }

    /// Validate a block about to be freed or read from by `op`, aborting
    /// with the most precise diagnosis available if it is not a live block.
    ///
    /// # Safety
    ///
    /// `ptr` must be non-null and point just past a readable header.
    unsafe fn checked_block(&self, op: &'static str, ptr: *mut u8) -> BlockRef {
        let addr = ptr as usize;
        if unlikely(!pointer_aligned(ptr)) {
            fatal(MemError::Misaligned { op, addr });
        }
        // SAFETY: non-null, header readable per caller
        let block = unsafe { BlockRef::from_payload(NonNull::new_unchecked(ptr)) };

        if unlikely(block.is_freed()) {
            fatal(MemError::DoubleFree { op, addr });
        }
        if block.is_live() {
            if block.tag3() == TAG3 {
                return block;
            }
            fatal(MemError::EndCorrupt {
                addr,
                // SAFETY: both header tags are intact
                identity: unsafe { block.identity() },
            });
        }

        let lookup = self.registry.lock().find(block);
        match lookup {
            Lookup::Found => fatal(MemError::HeaderCorrupt {
                addr,
                tags: block.corrupt_header_tags(),
            }),
            Lookup::NotFound => fatal(MemError::NotInRegistry { op, addr }),
            Lookup::Corrupt { addr, tags } => fatal(MemError::RegistryCorrupt { addr, tags }),
        }
    }

    /// Unregister and release a block that passed [`checked_block()`](Self::checked_block).
    unsafe fn release(&self, usage: &UsageTracker, block: BlockRef) {
        let size = block.size();
        let Some(layout) = block.layout() else {
            unreachable!("a live block's layout was computed once already");
        };
        // SAFETY: block is live and linked
        unsafe { self.registry.unlink(block) };
        block.mark_freed();
        usage.block_free(size);
        unsafe {
            let base = layout.base_ptr(block.payload());
            if layout.is_aligned() {
                os::aligned_free(base);
            } else {
                os::free(base);
            }
        }
    }

    unsafe fn realloc_with(
        &self,
        usage: &UsageTracker,
        ptr: *mut u8,
        size: usize,
        identity: Identity,
        policy: IdentityPolicy,
        fill: Fill,
    ) -> *mut u8 {
        if ptr.is_null() {
            return self.alloc_block(usage, size, 0, fill, identity);
        }
        let old = unsafe { self.checked_block("realloc", ptr) };
        let old_size = old.size();
        let identity = match policy {
            IdentityPolicy::Replace => identity,
            // SAFETY: `old` passed validation
            IdentityPolicy::PreserveExisting => unsafe { old.identity() }.or(identity),
        };

        let new = self.alloc_block(usage, size, old.alignment(), Fill::Uninit, identity);
        if new.is_null() {
            return new;
        }
        unsafe {
            ptr::copy_nonoverlapping(ptr, new, old_size.min(size));
            if fill == Fill::Zero && size > old_size {
                new.add(old_size).write_bytes(0, size - old_size);
            }
            self.release(usage, old);
        }
        new
    }

    /// Copy of the live block list. The buffer is sized before taking the
    /// lock so nothing is allocated while it is held.
    pub fn snapshot(&self) -> Vec<BlockInfo> {
        let mut blocks = Vec::with_capacity(self.registry.len() + 16);
        let registry = self.registry.lock();
        for node in registry.iter() {
            let Ok(node) = node else { break };
            if blocks.len() == blocks.capacity() {
                break;
            }
            blocks.push(node.info());
        }
        blocks
    }
}

impl Default for GuardedAllocator {
    fn default() -> Self {
        Self::new(cfg!(debug_assertions))
    }
}

impl MemAllocator for GuardedAllocator {
    fn kind(&self) -> BackendKind {
        BackendKind::Guarded
    }

    fn malloc_n(&self, usage: &UsageTracker, size: usize, identity: Identity) -> *mut u8 {
        self.alloc_block(usage, size, 0, Fill::Uninit, identity)
    }

    fn malloc_n_aligned(
        &self,
        usage: &UsageTracker,
        size: usize,
        align: usize,
        identity: Identity,
    ) -> *mut u8 {
        self.alloc_block(usage, size, checked_align(align), Fill::Uninit, identity)
    }

    fn calloc_n(&self, usage: &UsageTracker, size: usize, identity: Identity) -> *mut u8 {
        self.alloc_block(usage, size, 0, Fill::Zero, identity)
    }

    fn calloc_n_aligned(
        &self,
        usage: &UsageTracker,
        size: usize,
        align: usize,
        identity: Identity,
    ) -> *mut u8 {
        self.alloc_block(usage, size, checked_align(align), Fill::Zero, identity)
    }

    unsafe fn realloc_n_id(
        &self,
        usage: &UsageTracker,
        ptr: *mut u8,
        size: usize,
        identity: Identity,
    ) -> *mut u8 {
        unsafe { self.realloc_with(usage, ptr, size, identity, IdentityPolicy::Replace, Fill::Uninit) }
    }

    unsafe fn recalloc_n_id(
        &self,
        usage: &UsageTracker,
        ptr: *mut u8,
        size: usize,
        identity: Identity,
    ) -> *mut u8 {
        unsafe {
            self.realloc_with(
                usage,
                ptr,
                size,
                identity,
                IdentityPolicy::PreserveExisting,
                Fill::Zero,
            )
        }
    }

    unsafe fn dupalloc_n(&self, usage: &UsageTracker, ptr: *mut u8) -> *mut u8 {
        if ptr.is_null() {
            return ptr;
        }
        let old = unsafe { self.checked_block("dupalloc", ptr) };
        // SAFETY: validated above
        let identity = unsafe { old.identity() };
        let new = self.alloc_block(usage, old.size(), old.alignment(), Fill::Uninit, identity);
        if !new.is_null() {
            unsafe { ptr::copy_nonoverlapping(ptr, new, old.size()) };
        }
        new
    }

    unsafe fn free_n(&self, usage: &UsageTracker, ptr: *mut u8) {
        if unlikely(ptr.is_null()) {
            fatal(MemError::NullFree);
        }
        unsafe {
            let block = self.checked_block("free", ptr);
            self.release(usage, block);
        }
    }

    unsafe fn alloc_n_length(&self, ptr: *mut u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        if unlikely(!pointer_aligned(ptr)) {
            fatal(MemError::Misaligned {
                op: "length",
                addr: ptr as usize,
            });
        }
        let block = unsafe { BlockRef::from_payload(NonNull::new_unchecked(ptr)) };
        if block.is_live() {
            block.size()
        } else {
            0
        }
    }

    unsafe fn name_ptr(&self, ptr: *mut u8) -> Identity {
        let block = unsafe { BlockRef::from_payload(NonNull::new(ptr)?) };
        if !pointer_aligned(ptr) || !block.is_live() {
            return None;
        }
        // SAFETY: tags intact
        unsafe { block.identity() }
    }

    fn print_memlist(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let registry = self.registry.lock();
        for node in registry.iter() {
            match node {
                Ok(node) => {
                    let info = node.info();
                    let mut dump = [0u8; report::DUMP_LIMIT];
                    let payload = if info.size < report::DUMP_LIMIT {
                        for (i, byte) in dump[..info.size].iter_mut().enumerate() {
                            // SAFETY: the payload of a live block is `size`
                            //         bytes, possibly never written to
                            *byte = unsafe { node.payload().as_ptr().add(i).read_volatile() };
                        }
                        Some(&dump[..info.size])
                    } else {
                        None
                    };
                    report::write_block(out, &info, payload)?;
                }
                Err(node) => {
                    writeln!(
                        out,
                        "block {:p}: broken header ({}), rest of list unreadable",
                        node.payload(),
                        node.corrupt_header_tags()
                    )?;
                }
            }
        }
        Ok(())
    }

    fn memlist(&self) -> Option<Vec<BlockInfo>> {
        Some(self.snapshot())
    }

    fn consistency_check(&self, out: &mut dyn fmt::Write) -> bool {
        let registry = self.registry.lock();
        let mut ok = true;
        for node in registry.iter() {
            let (node, mut tags) = match node {
                Ok(node) => (node, CorruptTags::default()),
                Err(node) => (node, node.corrupt_header_tags()),
            };
            if !tags.any() {
                tags.tag3 = node.tag3() != TAG3;
            }
            if tags.any() {
                ok = false;
                let _ = writeln!(out, "block {:p}: corrupt {tags}", node.payload());
            }
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (GuardedAllocator, UsageTracker) {
        (GuardedAllocator::new(true), UsageTracker::new(0))
    }

    #[test]
    fn header_keeps_payload_aligned() {
        assert_eq!(HEADER_SIZE % MALLOC_ALIGN, 0);
        assert_eq!(TAIL_SIZE, 4);
    }

    #[test]
    fn tags_spell_their_names() {
        assert_eq!(&TAG1.to_le_bytes(), b"MEMO");
        assert_eq!(&FREED.to_le_bytes(), b"FREE");
    }

    #[test]
    fn malloc_records_size_and_registers() {
        let (alloc, usage) = fixture();
        let p = alloc.malloc_n(&usage, 64, Some("A"));
        assert!(!p.is_null());
        assert_eq!(unsafe { alloc.alloc_n_length(p) }, 64);
        assert_eq!(unsafe { alloc.name_ptr(p) }, Some("A"));
        assert_eq!(alloc.registry().len(), 1);
        assert_eq!(usage.bytes_in_use(), 64);
        unsafe { alloc.free_n(&usage, p) };
        assert_eq!(alloc.registry().len(), 0);
        assert_eq!(usage.blocks_in_use(), 0);
        assert_eq!(usage.bytes_in_use(), 0);
    }

    #[test]
    fn lengths_are_exact_for_odd_sizes() {
        let (alloc, usage) = fixture();
        for size in [0, 1, 3, 7, 13, 127, 128, 4099] {
            let p = alloc.malloc_n(&usage, size, Some("odd"));
            assert_eq!(unsafe { alloc.alloc_n_length(p) }, size);
            unsafe { alloc.free_n(&usage, p) };
        }
    }

    #[test]
    fn debug_fill_paints_fresh_payloads() {
        let (alloc, usage) = fixture();
        let p = alloc.malloc_n(&usage, 32, None);
        let bytes = unsafe { std::slice::from_raw_parts(p, 32) };
        assert!(bytes.iter().all(|b| *b == DEBUG_FILL_BYTE));
        unsafe { alloc.free_n(&usage, p) };
    }

    #[test]
    fn calloc_zeroes_even_with_debug_fill() {
        let (alloc, usage) = fixture();
        let p = alloc.calloc_n_aligned(&usage, 100, 64, Some("B"));
        assert_eq!(p as usize % 64, 0);
        let bytes = unsafe { std::slice::from_raw_parts(p, 100) };
        assert!(bytes.iter().all(|b| *b == 0));
        unsafe { alloc.free_n(&usage, p) };
    }

    #[test]
    fn aligned_blocks_honour_alignment() {
        let (alloc, usage) = fixture();
        for shift in 3..13 {
            let align = 1 << shift;
            let p = alloc.malloc_n_aligned(&usage, 40, align, Some("aligned"));
            assert_eq!(p as usize % align, 0, "align {align}");
            assert_eq!(unsafe { alloc.alloc_n_length(p) }, 40);
            unsafe { alloc.free_n(&usage, p) };
        }
        assert_eq!(usage.blocks_in_use(), 0);
    }

    #[test]
    fn realloc_keeps_prefix_and_takes_new_identity() {
        let (alloc, usage) = fixture();
        let p = alloc.malloc_n(&usage, 10, Some("C"));
        unsafe { p.write_bytes(0xAA, 10) };
        let q = unsafe { alloc.realloc_n_id(&usage, p, 20, Some("C grown")) };
        assert_ne!(q, p);
        let bytes = unsafe { std::slice::from_raw_parts(q, 20) };
        assert!(bytes[..10].iter().all(|b| *b == 0xAA));
        assert_eq!(unsafe { alloc.name_ptr(q) }, Some("C grown"));

        let r = unsafe { alloc.realloc_n_id(&usage, q, 4, Some("C shrunk")) };
        let bytes = unsafe { std::slice::from_raw_parts(r, 4) };
        assert!(bytes.iter().all(|b| *b == 0xAA));
        assert_eq!(usage.blocks_in_use(), 1);
        assert_eq!(usage.bytes_in_use(), 4);
        unsafe { alloc.free_n(&usage, r) };
    }

    #[test]
    fn realloc_keeps_alignment() {
        let (alloc, usage) = fixture();
        let p = alloc.malloc_n_aligned(&usage, 8, 256, Some("aligned"));
        let q = unsafe { alloc.realloc_n_id(&usage, p, 300, Some("aligned")) };
        assert_eq!(q as usize % 256, 0);
        unsafe { alloc.free_n(&usage, q) };
    }

    #[test]
    fn realloc_of_null_is_malloc() {
        let (alloc, usage) = fixture();
        let p = unsafe { alloc.realloc_n_id(&usage, ptr::null_mut(), 12, Some("fresh")) };
        assert_eq!(unsafe { alloc.alloc_n_length(p) }, 12);
        unsafe { alloc.free_n(&usage, p) };
    }

    #[test]
    fn recalloc_zeroes_growth_and_keeps_identity() {
        let (alloc, usage) = fixture();
        let p = alloc.malloc_n(&usage, 8, Some("original"));
        unsafe { p.write_bytes(0x11, 8) };
        let q = unsafe { alloc.recalloc_n_id(&usage, p, 24, Some("caller")) };
        let bytes = unsafe { std::slice::from_raw_parts(q, 24) };
        assert!(bytes[..8].iter().all(|b| *b == 0x11));
        assert!(bytes[8..].iter().all(|b| *b == 0));
        assert_eq!(unsafe { alloc.name_ptr(q) }, Some("original"));
        unsafe { alloc.free_n(&usage, q) };

        let p = alloc.malloc_n(&usage, 8, None);
        let q = unsafe { alloc.recalloc_n_id(&usage, p, 16, Some("caller")) };
        assert_eq!(unsafe { alloc.name_ptr(q) }, Some("caller"));
        unsafe { alloc.free_n(&usage, q) };
    }

    #[test]
    fn dupalloc_copies_everything() {
        let (alloc, usage) = fixture();
        let p = alloc.malloc_n_aligned(&usage, 33, 32, Some("dup me"));
        for i in 0..33 {
            unsafe { p.add(i).write(i as u8) };
        }
        let q = unsafe { alloc.dupalloc_n(&usage, p) };
        assert_ne!(p, q);
        assert_eq!(q as usize % 32, 0);
        assert_eq!(unsafe { alloc.alloc_n_length(q) }, 33);
        assert_eq!(unsafe { alloc.name_ptr(q) }, Some("dup me"));
        let (a, b) = unsafe { (std::slice::from_raw_parts(p, 33), std::slice::from_raw_parts(q, 33)) };
        assert_eq!(a, b);
        assert!(unsafe { alloc.dupalloc_n(&usage, ptr::null_mut()) }.is_null());
        unsafe {
            alloc.free_n(&usage, p);
            alloc.free_n(&usage, q);
        }
    }

    #[test]
    fn length_of_broken_block_is_zero() {
        let (alloc, usage) = fixture();
        let p = alloc.malloc_n(&usage, 16, Some("victim"));
        let block = unsafe { BlockRef::from_payload(NonNull::new(p).unwrap()) };
        unsafe { ptr::addr_of_mut!((*block.as_ptr()).tag2).write(0) };
        assert_eq!(unsafe { alloc.alloc_n_length(p) }, 0);
        assert_eq!(unsafe { alloc.name_ptr(p) }, None);
        unsafe { ptr::addr_of_mut!((*block.as_ptr()).tag2).write(TAG2) };
        unsafe { alloc.free_n(&usage, p) };
        assert_eq!(unsafe { alloc.alloc_n_length(ptr::null_mut()) }, 0);
    }

    #[test]
    fn freed_marker_over_a_live_tag1_is_not_a_double_free() {
        let (alloc, usage) = fixture();
        let p = alloc.malloc_n(&usage, 16, Some("stomped"));
        let block = unsafe { BlockRef::from_payload(NonNull::new(p).unwrap()) };
        unsafe { ptr::addr_of_mut!((*block.as_ptr()).tag2).write(FREED) };
        assert!(!block.is_freed());
        assert!(!block.is_live());
        assert_eq!(alloc.registry().lock().find(block), Lookup::Found);

        unsafe { ptr::addr_of_mut!((*block.as_ptr()).tag1).write(0) };
        assert!(block.is_freed());

        unsafe {
            ptr::addr_of_mut!((*block.as_ptr()).tag1).write(TAG1);
            ptr::addr_of_mut!((*block.as_ptr()).tag2).write(TAG2);
            alloc.free_n(&usage, p);
        }
    }

    #[test]
    fn registry_finds_live_blocks_only() {
        let (alloc, usage) = fixture();
        let p = alloc.malloc_n(&usage, 16, Some("one"));
        let q = alloc.malloc_n(&usage, 16, Some("two"));
        let block = unsafe { BlockRef::from_payload(NonNull::new(q).unwrap()) };
        assert_eq!(alloc.registry().lock().find(block), Lookup::Found);

        let mut stranger = [0u64; 16];
        let fake = unsafe {
            BlockRef::from_payload(NonNull::new(stranger.as_mut_ptr().cast::<u8>().add(HEADER_SIZE)).unwrap())
        };
        assert_eq!(alloc.registry().lock().find(fake), Lookup::NotFound);
        unsafe {
            alloc.free_n(&usage, p);
            alloc.free_n(&usage, q);
        }
    }

    #[test]
    fn registry_walk_stops_at_a_corrupt_neighbour() {
        let (alloc, usage) = fixture();
        let p = alloc.malloc_n(&usage, 16, Some("broken"));
        let q = alloc.malloc_n(&usage, 16, Some("wanted"));
        let broken = unsafe { BlockRef::from_payload(NonNull::new(p).unwrap()) };
        let wanted = unsafe { BlockRef::from_payload(NonNull::new(q).unwrap()) };
        unsafe { ptr::addr_of_mut!((*broken.as_ptr()).tag1).write(0xdead) };
        match alloc.registry().lock().find(wanted) {
            Lookup::Corrupt { addr, tags } => {
                assert_eq!(addr, p as usize);
                assert!(tags.tag1 && !tags.tag2);
            }
            other => panic!("expected corruption, got {other:?}"),
        }
        let mut report = String::new();
        assert!(!alloc.consistency_check(&mut report));
        assert!(report.contains("tag1"), "{report}");
        unsafe {
            ptr::addr_of_mut!((*broken.as_ptr()).tag1).write(TAG1);
            alloc.free_n(&usage, p);
            alloc.free_n(&usage, q);
        }
    }

    #[test]
    fn consistency_check_spots_overruns() {
        let (alloc, usage) = fixture();
        let p = alloc.malloc_n(&usage, 5, Some("overrun"));
        let mut report = String::new();
        assert!(alloc.consistency_check(&mut report));
        unsafe { p.add(5).write(0) };
        assert!(!alloc.consistency_check(&mut report));
        assert!(report.contains("tag3"), "{report}");
        unsafe {
            p.add(5).cast::<u32>().write_unaligned(TAG3);
            alloc.free_n(&usage, p);
        }
    }

    #[test]
    fn print_memlist_dumps_small_blocks() {
        let (alloc, usage) = fixture();
        let small = alloc.calloc_n(&usage, 4, Some("small"));
        unsafe { small.copy_from_nonoverlapping(b"hey!".as_ptr(), 4) };
        let big = alloc.calloc_n(&usage, 256, Some("big"));
        let mut out = String::new();
        alloc.print_memlist(&mut out).unwrap();
        assert!(out.contains("small len: 4"), "{out}");
        assert!(out.contains("68 65 79 21"), "{out}");
        assert!(out.contains("|hey!|"), "{out}");
        assert!(out.contains("big len: 256"), "{out}");
        // the big block gets no dump
        assert_eq!(out.matches('|').count(), 2, "{out}");
        unsafe {
            alloc.free_n(&usage, small);
            alloc.free_n(&usage, big);
        }
    }

    #[test]
    fn snapshot_lists_blocks_in_allocation_order() {
        let (alloc, usage) = fixture();
        let ptrs: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|name| alloc.malloc_n(&usage, 8, Some(*name)))
            .collect();
        let names: Vec<_> = alloc.snapshot().iter().map(|b| b.identity).collect();
        assert_eq!(names, [Some("a"), Some("b"), Some("c")]);
        unsafe { alloc.free_n(&usage, ptrs[1]) };
        let names: Vec<_> = alloc.snapshot().iter().map(|b| b.identity).collect();
        assert_eq!(names, [Some("a"), Some("c")]);
        for p in [ptrs[0], ptrs[2]] {
            unsafe { alloc.free_n(&usage, p) };
        }
        assert!(alloc.registry().is_empty());
    }

    #[test]
    fn concurrent_alloc_free_keeps_registry_consistent() {
        let (alloc, usage) = fixture();
        crossbeam::thread::scope(|s| {
            for t in 0..8usize {
                let (alloc, usage) = (&alloc, &usage);
                s.spawn(move |_| {
                    let mut live = Vec::new();
                    for i in 0..2000usize {
                        live.push(alloc.malloc_n(usage, (t + i) % 200, Some("worker")));
                        if i % 3 == 0 {
                            let p = live.swap_remove(live.len() / 2);
                            unsafe { alloc.free_n(usage, p) };
                        }
                    }
                    for p in live {
                        unsafe { alloc.free_n(usage, p) };
                    }
                });
            }
        })
        .unwrap();
        assert!(alloc.registry().is_empty());
        assert_eq!(usage.blocks_in_use(), 0);
        assert_eq!(usage.bytes_in_use(), 0);
    }
}
