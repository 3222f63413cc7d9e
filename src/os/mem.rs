//! The host allocator, seen through two pairs of functions: plain
//! `malloc()`/`free()` and an aligned pair. Every block either backend hands
//! out is exactly one allocation from here.

use std::{mem, ptr::NonNull};

use crate::util::hint::cold;

/// Alignment the system `malloc()` guarantees for every allocation
/// (`alignof(max_align_t)`).
pub const MALLOC_ALIGN: usize = 2 * mem::size_of::<usize>();

/// The smallest alignment the aligned pair accepts. Anything smaller is
/// rounded up to this.
pub const MIN_ALIGN: usize = mem::size_of::<*const ()>();

/// `malloc()` from the host. `None` if the host is out of memory.
pub fn malloc(size: usize) -> Option<NonNull<u8>> {
    // SAFETY: `malloc()` has no preconditions
    let data = unsafe { libc::malloc(size) };
    match NonNull::new(data.cast::<u8>()) {
        Some(data) => Some(data),
        None => cold(|| None),
    }
}

/// Release a block from [`malloc()`].
///
/// # Safety
///
/// `data` must come from [`malloc()`] and must not have been freed yet.
pub unsafe fn free(data: NonNull<u8>) {
    unsafe { libc::free(data.as_ptr().cast()) }
}

/// Allocate `size` bytes aligned to `align`, which must be a power of two.
/// `align` is raised to at least [`MIN_ALIGN`].
#[cfg(unix)]
pub fn aligned_malloc(size: usize, align: usize) -> Option<NonNull<u8>> {
    debug_assert!(align.is_power_of_two());
    let align = align.max(MIN_ALIGN);
    let mut data = std::ptr::null_mut();
    // SAFETY: `align` is a power of two and a multiple of
    //         `sizeof(void *)`, which is all `posix_memalign()` asks for
    let rc = unsafe { libc::posix_memalign(&mut data, align, size) };
    if rc != 0 {
        return cold(|| None);
    }
    NonNull::new(data.cast::<u8>())
}

/// Release a block from [`aligned_malloc()`].
///
/// # Safety
///
/// `data` must come from [`aligned_malloc()`] and must not have been freed
/// yet.
#[cfg(unix)]
pub unsafe fn aligned_free(data: NonNull<u8>) {
    // `posix_memalign()` memory goes back through plain `free()`
    unsafe { libc::free(data.as_ptr().cast()) }
}

#[cfg(windows)]
pub fn aligned_malloc(size: usize, align: usize) -> Option<NonNull<u8>> {
    debug_assert!(align.is_power_of_two());
    let align = align.max(MIN_ALIGN);
    // SAFETY: `align` is a power of two
    let data = unsafe { libc::aligned_malloc(size, align) };
    match NonNull::new(data.cast::<u8>()) {
        Some(data) => Some(data),
        None => cold(|| None),
    }
}

#[cfg(windows)]
pub unsafe fn aligned_free(data: NonNull<u8>) {
    unsafe { libc::aligned_free(data.as_ptr().cast()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::assert::aligned_to;

    #[test]
    fn malloc_respects_max_align() {
        let data = malloc(24).expect("24 bytes");
        assert!(aligned_to(data.as_ptr(), MALLOC_ALIGN));
        unsafe { free(data) };
    }

    #[test]
    fn aligned_malloc_honours_large_alignments() {
        for shift in 3..13 {
            let align = 1usize << shift;
            let data = aligned_malloc(100, align).expect("100 bytes");
            assert!(aligned_to(data.as_ptr(), align), "align {align}");
            unsafe { aligned_free(data) };
        }
    }

    #[test]
    fn aligned_malloc_raises_tiny_alignments() {
        let data = aligned_malloc(3, 1).expect("3 bytes");
        assert!(aligned_to(data.as_ptr(), MIN_ALIGN));
        unsafe { aligned_free(data) };
    }

    #[test]
    fn malloc_reports_exhaustion() {
        // an unused malloc/free pair may be folded away in release builds
        let huge = std::hint::black_box(usize::MAX);
        assert!(std::hint::black_box(malloc(huge)).is_none());
        assert!(std::hint::black_box(aligned_malloc(huge - 4096, 64)).is_none());
    }
}
