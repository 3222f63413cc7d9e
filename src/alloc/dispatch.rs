//! The operation set both backends implement, and the slot that picks which
//! one is live.

use std::{
    fmt,
    str::FromStr,
    sync::atomic::{AtomicU8, Ordering},
};

use serde::{Deserialize, Serialize};

use super::{guarded::GuardedAllocator, lockfree::LockfreeAllocator, report::BlockInfo, usage::UsageTracker};
use crate::error::MemError;

/// A borrowed, never-owned description of a block, used in diagnostics.
pub type Identity = Option<&'static str>;

/// How a reallocation picks the identity of the new block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdentityPolicy {
    /// Always take the caller's identity
    Replace,
    /// Keep the old block's identity if it had one
    PreserveExisting,
}

/// What to put in a fresh payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fill {
    /// Leave it alone (the guarded backend may still paint it in debug mode)
    Uninit,
    Zero,
}

/// The full operation set of an allocator backend.
///
/// `usage` is the tracker of the owning context: every block is registered
/// with it on allocation and removed from it on free, using the size the
/// backend recorded for the block.
///
/// Aligned variants take a power-of-two `align`. Anything else is a contract
/// violation and aborts. Allocation failures return null.
pub trait MemAllocator: Sync {
    fn kind(&self) -> BackendKind;

    fn malloc_n(&self, usage: &UsageTracker, size: usize, identity: Identity) -> *mut u8;

    fn malloc_n_aligned(
        &self,
        usage: &UsageTracker,
        size: usize,
        align: usize,
        identity: Identity,
    ) -> *mut u8;

    fn calloc_n(&self, usage: &UsageTracker, size: usize, identity: Identity) -> *mut u8;

    fn calloc_n_aligned(
        &self,
        usage: &UsageTracker,
        size: usize,
        align: usize,
        identity: Identity,
    ) -> *mut u8;

    /// # Safety
    ///
    /// `ptr` must be null or a live block from this backend.
    unsafe fn realloc_n_id(
        &self,
        usage: &UsageTracker,
        ptr: *mut u8,
        size: usize,
        identity: Identity,
    ) -> *mut u8;

    /// Like [`realloc_n_id()`](Self::realloc_n_id), but bytes past the old
    /// size are zeroed and an existing identity wins over `identity`.
    ///
    /// # Safety
    ///
    /// As [`realloc_n_id()`](Self::realloc_n_id)
    unsafe fn recalloc_n_id(
        &self,
        usage: &UsageTracker,
        ptr: *mut u8,
        size: usize,
        identity: Identity,
    ) -> *mut u8;

    /// # Safety
    ///
    /// As [`realloc_n_id()`](Self::realloc_n_id)
    unsafe fn dupalloc_n(&self, usage: &UsageTracker, ptr: *mut u8) -> *mut u8;

    /// # Safety
    ///
    /// `ptr` must have been allocated by this backend. Passing anything else
    /// is detected on a best-effort basis and aborts.
    unsafe fn free_n(&self, usage: &UsageTracker, ptr: *mut u8);

    /// # Safety
    ///
    /// `ptr` must be null or point into memory allocated by this backend.
    unsafe fn alloc_n_length(&self, ptr: *mut u8) -> usize;

    /// # Safety
    ///
    /// As [`alloc_n_length()`](Self::alloc_n_length)
    unsafe fn name_ptr(&self, _ptr: *mut u8) -> Identity {
        None
    }

    fn print_memlist(&self, out: &mut dyn fmt::Write) -> fmt::Result;

    /// A copy of the live block list, or `None` if this backend keeps none.
    fn memlist(&self) -> Option<Vec<BlockInfo>> {
        None
    }

    /// Walk all live blocks and report broken ones to `out`. `true` if
    /// nothing was found.
    fn consistency_check(&self, _out: &mut dyn fmt::Write) -> bool {
        true
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum BackendKind {
    Guarded = 0,
    Lockfree = 1,
}

impl BackendKind {
    /// Guarded in debug builds, lockfree otherwise
    pub const fn default_for_build() -> Self {
        if cfg!(debug_assertions) {
            Self::Guarded
        } else {
            Self::Lockfree
        }
    }

    const fn from_u8(n: u8) -> Self {
        match n {
            0 => Self::Guarded,
            _ => Self::Lockfree,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Guarded => "guarded",
            Self::Lockfree => "lockfree",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown allocator backend {0:?}, expected \"guarded\" or \"lockfree\"")]
pub struct ParseBackendError(String);

impl FromStr for BackendKind {
    type Err = ParseBackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "guarded" => Ok(Self::Guarded),
            "lockfree" | "lock-free" => Ok(Self::Lockfree),
            _ => Err(ParseBackendError(s.to_owned())),
        }
    }
}

/// Both backends, and the slot saying which one every entry point uses.
pub struct Dispatch {
    guarded: GuardedAllocator,
    lockfree: LockfreeAllocator,
    slot: AtomicU8,
}

impl Dispatch {
    pub const fn new(kind: BackendKind, debug_fill: bool) -> Self {
        Self {
            guarded: GuardedAllocator::new(debug_fill),
            lockfree: LockfreeAllocator::new(),
            slot: AtomicU8::new(kind as u8),
        }
    }

    pub fn kind(&self) -> BackendKind {
        BackendKind::from_u8(self.slot.load(Ordering::Acquire))
    }

    /// The backend every entry point should use right now
    pub fn current(&self) -> &dyn MemAllocator {
        self.backend(self.kind())
    }

    pub fn backend(&self, kind: BackendKind) -> &dyn MemAllocator {
        match kind {
            BackendKind::Guarded => &self.guarded,
            BackendKind::Lockfree => &self.lockfree,
        }
    }

    pub fn guarded(&self) -> &GuardedAllocator {
        &self.guarded
    }

    /// Point every entry point at `kind`.
    ///
    /// The two backends encode their headers differently, so a block
    /// allocated by one and freed by the other would be misread. The switch
    /// is therefore refused while `usage` reports any live block. This does
    /// not synchronise with allocations racing on other threads; the caller
    /// has to make sure the process is quiescent.
    pub fn switch_to(&self, kind: BackendKind, usage: &UsageTracker) -> Result<(), MemError> {
        if self.kind() == kind {
            return Ok(());
        }
        let blocks = usage.blocks_in_use();
        if blocks != 0 {
            return Err(MemError::BlocksOutstanding { blocks });
        }
        self.slot.store(kind as u8, Ordering::Release);
        Ok(())
    }
}
