//! The two allocator backends and everything they share.

pub mod dispatch;
pub mod global;
pub mod guarded;
pub mod layout;
pub mod lockfree;
pub mod registry;
pub mod report;
pub mod spin;
pub mod usage;

use crate::error::{fatal, MemError};

/// Largest alignment either backend accepts
pub const MAX_ALIGN: usize = 1 << 31;

/// `align` if it is a power of two no larger than [`MAX_ALIGN`], otherwise
/// abort.
pub(crate) fn checked_align(align: usize) -> usize {
    if !align.is_power_of_two() || align > MAX_ALIGN {
        fatal(MemError::InvalidAlignment { align });
    }
    align
}
