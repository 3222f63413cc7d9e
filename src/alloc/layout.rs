//! Where everything lives inside a block.
//!
//! Both backends lay a block out the same way, they only differ in how big
//! the header and tail are:
//!
//! ```plaintext
//! base                                    (what the host allocator returned)
//! +--------------------+
//! | padding...         | pad bytes, aligned blocks only
//! +--------------------+
//! | header             | header bytes
//! +--------------------+ <- payload        (what the caller gets)
//! | payload            | size bytes
//! +--------------------+
//! | tail               | tail bytes, guarded blocks only
//! +--------------------+
//! ```
//!
//! For aligned blocks `pad = align - (header % align)`, so `pad + header` is
//! a multiple of `align` and the payload lands on an aligned address as long
//! as `base` is aligned. Note that when `header` is already a multiple of
//! `align` we still pad by a whole `align`: the pad can then be recomputed
//! from the alignment alone when the block is freed.

use std::ptr::NonNull;

use crate::{os::mem::MIN_ALIGN, util::num::checked_sum};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockLayout {
    pad: usize,
    header: usize,
    size: usize,
    tail: usize,
    /// `0` for blocks that came from plain `malloc()`
    align: usize,
    total: usize,
}

impl BlockLayout {
    /// Layout of an unaligned block. `None` if the total overflows.
    pub fn unaligned(header: usize, size: usize, tail: usize) -> Option<Self> {
        Some(Self {
            pad: 0,
            header,
            size,
            tail,
            align: 0,
            total: checked_sum(&[header, size, tail])?,
        })
    }

    /// Layout of a block whose payload is aligned to `align` (a power of
    /// two, raised to at least pointer size). `None` if the total overflows.
    pub fn aligned(header: usize, size: usize, tail: usize, align: usize) -> Option<Self> {
        debug_assert!(align.is_power_of_two());
        let align = align.max(MIN_ALIGN);
        let pad = Self::pad_for(header, align);
        Some(Self {
            pad,
            header,
            size,
            tail,
            align,
            total: checked_sum(&[pad, header, size, tail])?,
        })
    }

    /// The padding in front of a header of `header` bytes for a block aligned
    /// to `align`.
    pub const fn pad_for(header: usize, align: usize) -> usize {
        align - (header % align)
    }

    /// Bytes to request from the host
    pub const fn total(&self) -> usize {
        self.total
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    /// Alignment to request from the host, `0` if unaligned
    pub const fn align(&self) -> usize {
        self.align
    }

    pub const fn is_aligned(&self) -> bool {
        self.align != 0
    }

    pub const fn header_offset(&self) -> usize {
        self.pad
    }

    pub const fn payload_offset(&self) -> usize {
        self.pad + self.header
    }

    pub const fn tail_offset(&self) -> usize {
        self.pad + self.header + self.size
    }

    /// # Safety
    ///
    /// `base` must be the start of an allocation of at least
    /// [`total()`](Self::total) bytes.
    pub unsafe fn header_ptr(&self, base: NonNull<u8>) -> NonNull<u8> {
        unsafe { base.add(self.header_offset()) }
    }

    /// # Safety
    ///
    /// As [`header_ptr()`](Self::header_ptr)
    pub unsafe fn payload_ptr(&self, base: NonNull<u8>) -> NonNull<u8> {
        unsafe { base.add(self.payload_offset()) }
    }

    /// # Safety
    ///
    /// As [`header_ptr()`](Self::header_ptr)
    pub unsafe fn tail_ptr(&self, base: NonNull<u8>) -> NonNull<u8> {
        unsafe { base.add(self.tail_offset()) }
    }

    /// Walk back from a payload to the start of its host allocation.
    ///
    /// # Safety
    ///
    /// `payload` must have been produced by [`payload_ptr()`](Self::payload_ptr)
    /// on an identical layout.
    pub unsafe fn base_ptr(&self, payload: NonNull<u8>) -> NonNull<u8> {
        unsafe { payload.sub(self.payload_offset()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unaligned_layout_is_header_payload_tail() {
        let layout = BlockLayout::unaligned(64, 10, 4).unwrap();
        assert_eq!(layout.header_offset(), 0);
        assert_eq!(layout.payload_offset(), 64);
        assert_eq!(layout.tail_offset(), 74);
        assert_eq!(layout.total(), 78);
        assert!(!layout.is_aligned());
    }

    #[test]
    fn aligned_payload_offset_is_multiple_of_align() {
        for header in [8, 24, 56, 64] {
            for shift in 3..10 {
                let align = 1 << shift;
                let layout = BlockLayout::aligned(header, 100, 4, align).unwrap();
                assert_eq!(layout.payload_offset() % align, 0, "{header} {align}");
                assert!(layout.header_offset() > 0);
                assert_eq!(layout.total(), layout.tail_offset() + 4);
            }
        }
    }

    #[test]
    fn small_alignments_are_raised_to_pointer_size() {
        let layout = BlockLayout::aligned(8, 1, 0, 1).unwrap();
        assert_eq!(layout.align(), MIN_ALIGN);
        assert_eq!(layout.payload_offset() % MIN_ALIGN, 0);
    }

    #[test]
    fn overflowing_sizes_are_rejected() {
        assert!(BlockLayout::unaligned(64, usize::MAX - 10, 4).is_none());
        assert!(BlockLayout::aligned(64, usize::MAX - 70, 4, 64).is_none());
    }

    #[test]
    fn base_round_trips_through_payload() {
        let mut backing = [0u64; 64];
        let base = NonNull::new(backing.as_mut_ptr().cast::<u8>()).unwrap();
        let layout = BlockLayout::aligned(24, 16, 4, 16).unwrap();
        let payload = unsafe { layout.payload_ptr(base) };
        assert_eq!(unsafe { layout.base_ptr(payload) }, base);
        assert_eq!(
            unsafe { layout.tail_ptr(base) }.as_ptr() as usize - payload.as_ptr() as usize,
            16
        );
    }
}
