use std::mem;

/// Test if `ptr` is aligned to a multiple of `align`
pub fn aligned_to<T>(ptr: *const T, align: usize) -> bool {
    debug_assert!(align.is_power_of_two());
    ptr as usize & (align - 1) == 0
}

/// Test if `ptr` sits on a pointer-sized boundary. Every payload either
/// backend hands out does, so anything else cannot be one of ours.
pub fn pointer_aligned<T>(ptr: *const T) -> bool {
    aligned_to(ptr, mem::size_of::<*const ()>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_to_checks_low_bits() {
        assert!(aligned_to(64 as *const u8, 64));
        assert!(!aligned_to(65 as *const u8, 64));
        assert!(aligned_to(0 as *const u8, 4096));
    }

    #[test]
    fn pointer_aligned_rejects_odd_addresses() {
        let word = mem::size_of::<usize>();
        assert!(pointer_aligned(word as *const u8));
        assert!(!pointer_aligned((word + 1) as *const u8));
    }
}
