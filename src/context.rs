//! [`MemContext`]: the usage tracker, both backends and the leak detector,
//! behind one set of entry points.
//!
//! The process-wide instance lives in [`crate::api`]. Tests build their own.

use std::{fmt, ptr};

use crate::{
    alloc::{
        dispatch::{BackendKind, Dispatch, Identity, MemAllocator},
        report::{self, MemReport},
        usage::UsageTracker,
    },
    config::MemConfig,
    error::{fatal, MemError},
    leak::{LeakDetector, LeakOutcome},
    util::{hint::unlikely, print::Stderr},
};

pub struct MemContext {
    usage: UsageTracker,
    dispatch: Dispatch,
    leak: LeakDetector,
}

impl MemContext {
    pub const fn new(config: MemConfig) -> Self {
        Self {
            usage: UsageTracker::new(config.peak_threshold),
            dispatch: Dispatch::new(config.backend, config.debug_fill),
            leak: LeakDetector::new(config.fail_on_leak, config.ignore_leaks),
        }
    }

    /// Re-apply `config` to a running context. The backend is only switched
    /// if no blocks are live.
    pub fn apply_config(&self, config: &MemConfig) -> Result<(), MemError> {
        self.usage.set_threshold(config.peak_threshold);
        self.dispatch.guarded().set_debug_fill(config.debug_fill);
        self.leak.set_fail_on_leak(config.fail_on_leak);
        self.leak.set_ignore_leaks(config.ignore_leaks);
        self.switch_backend(config.backend)
    }

    fn backend(&self) -> &dyn MemAllocator {
        self.dispatch.current()
    }

    pub fn usage(&self) -> &UsageTracker {
        &self.usage
    }

    pub fn leak_detector(&self) -> &LeakDetector {
        &self.leak
    }

    pub fn malloc_n(&self, size: usize, identity: Identity) -> *mut u8 {
        self.backend().malloc_n(&self.usage, size, identity)
    }

    pub fn malloc_n_aligned(&self, size: usize, align: usize, identity: Identity) -> *mut u8 {
        self.backend().malloc_n_aligned(&self.usage, size, align, identity)
    }

    pub fn calloc_n(&self, size: usize, identity: Identity) -> *mut u8 {
        self.backend().calloc_n(&self.usage, size, identity)
    }

    pub fn calloc_n_aligned(&self, size: usize, align: usize, identity: Identity) -> *mut u8 {
        self.backend().calloc_n_aligned(&self.usage, size, align, identity)
    }

    /// `malloc_n(count * size)`, null if the product overflows.
    pub fn malloc_array_n(&self, count: usize, size: usize, identity: Identity) -> *mut u8 {
        match count.checked_mul(size) {
            Some(total) => self.malloc_n(total, identity),
            None => ptr::null_mut(),
        }
    }

    /// `calloc_n(count * size)`, null if the product overflows.
    pub fn calloc_array_n(&self, count: usize, size: usize, identity: Identity) -> *mut u8 {
        match count.checked_mul(size) {
            Some(total) => self.calloc_n(total, identity),
            None => ptr::null_mut(),
        }
    }

    /// Resize `ptr` to `size` bytes. A null `ptr` allocates. On failure null is
    /// returned and `ptr` stays valid.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live block from this context.
    pub unsafe fn realloc_n_id(&self, ptr: *mut u8, size: usize, identity: Identity) -> *mut u8 {
        self.check_release(ptr);
        unsafe { self.backend().realloc_n_id(&self.usage, ptr, size, identity) }
    }

    /// As [`realloc_n_id()`](Self::realloc_n_id), zeroing grown bytes.
    ///
    /// # Safety
    ///
    /// As [`realloc_n_id()`](Self::realloc_n_id)
    pub unsafe fn recalloc_n_id(&self, ptr: *mut u8, size: usize, identity: Identity) -> *mut u8 {
        self.check_release(ptr);
        unsafe { self.backend().recalloc_n_id(&self.usage, ptr, size, identity) }
    }

    /// # Safety
    ///
    /// As [`realloc_n_id()`](Self::realloc_n_id)
    pub unsafe fn dupalloc_n(&self, ptr: *mut u8) -> *mut u8 {
        unsafe { self.backend().dupalloc_n(&self.usage, ptr) }
    }

    /// # Safety
    ///
    /// `ptr` must be a live block from this context.
    pub unsafe fn free_n(&self, ptr: *mut u8) {
        if unlikely(ptr.is_null()) {
            fatal(MemError::NullFree);
        }
        self.check_release(ptr);
        unsafe { self.backend().free_n(&self.usage, ptr) }
    }

    /// Every path that hands a block back to the host goes through here.
    /// Once the leak detector has reported, releasing anything is fatal.
    fn check_release(&self, ptr: *mut u8) {
        if unlikely(!ptr.is_null() && self.leak.has_run()) {
            fatal(MemError::FreeAfterLeakDetection { addr: ptr as usize });
        }
    }

    /// # Safety
    ///
    /// `ptr` must be null or point just past a block header from this context.
    pub unsafe fn alloc_n_length(&self, ptr: *mut u8) -> usize {
        unsafe { self.backend().alloc_n_length(ptr) }
    }

    /// # Safety
    ///
    /// As [`alloc_n_length()`](Self::alloc_n_length)
    pub unsafe fn name_ptr(&self, ptr: *mut u8) -> Identity {
        unsafe { self.backend().name_ptr(ptr) }
    }

    pub fn num_memory_blocks_in_use(&self) -> usize {
        self.usage.blocks_in_use()
    }

    pub fn num_memory_in_use(&self) -> usize {
        self.usage.bytes_in_use()
    }

    pub fn peak_memory(&self) -> usize {
        self.usage.peak()
    }

    pub fn reset_peak_memory(&self) {
        self.usage.peak_reset()
    }

    pub fn active_backend(&self) -> BackendKind {
        self.dispatch.kind()
    }

    fn switch_backend(&self, kind: BackendKind) -> Result<(), MemError> {
        let from = self.dispatch.kind();
        match self.dispatch.switch_to(kind, &self.usage) {
            Ok(()) if from != kind => {
                log::info!("allocator backend switched from {from} to {kind}");
                Ok(())
            }
            Ok(()) => Ok(()),
            Err(e) => {
                log::warn!("refusing to switch allocator backend to {kind}: {e}");
                Err(e)
            }
        }
    }

    pub fn use_lockfree_allocator(&self) -> Result<(), MemError> {
        self.switch_backend(BackendKind::Lockfree)
    }

    pub fn use_guarded_allocator(&self) -> Result<(), MemError> {
        self.switch_backend(BackendKind::Guarded)
    }

    pub fn set_memory_debug(&self, enabled: bool) {
        self.dispatch.guarded().set_debug_fill(enabled);
    }

    pub fn enable_fail_on_memleak(&self) {
        self.leak.set_fail_on_leak(true);
    }

    /// Report leaks at shutdown (`true`) or ignore them.
    pub fn use_memleak_detection(&self, enabled: bool) {
        self.leak.set_ignore_leaks(!enabled);
    }

    /// Arm the leak detector. `true` if this call armed it.
    pub fn init(&self) -> bool {
        self.leak.init()
    }

    /// Run the leak detector, reporting to stderr.
    pub fn shutdown(&self) -> LeakOutcome {
        self.shutdown_with(&mut Stderr)
    }

    /// Run the leak detector, reporting to `out`. Aborts after the report if
    /// leaks were found and fail-on-leak is set.
    ///
    /// Nothing is logged from here on: a logger may allocate, and once the
    /// detector has run every free aborts.
    pub fn shutdown_with(&self, out: &mut dyn fmt::Write) -> LeakOutcome {
        let outcome = self.leak.run(&self.usage, self.backend(), out);
        if let LeakOutcome::Leaked { blocks, bytes } = outcome {
            if self.leak.fail_on_leak() {
                fatal(MemError::LeakDetected { blocks, bytes });
            }
        }
        outcome
    }

    /// List the live blocks to `out`. The guarded backend holds its registry
    /// lock meanwhile, so if this context is the global allocator `out` must
    /// not allocate.
    pub fn print_memlist_to(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        self.backend().print_memlist(out)
    }

    pub fn print_memlist(&self) {
        let _ = self.print_memlist_to(&mut Stderr);
    }

    /// Per-identity totals of the live blocks, largest first. Only the guarded
    /// backend keeps a block list to report on.
    pub fn print_memlist_stats_to(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        match self.backend().memlist() {
            Some(blocks) => report::write_stats(out, &report::stats_by_identity(&blocks)),
            None => self.print_memlist_to(out),
        }
    }

    pub fn print_memlist_stats(&self) {
        let _ = self.print_memlist_stats_to(&mut Stderr);
    }

    /// Walk all live blocks and report broken ones to `out`.
    pub fn consistency_check_to(&self, out: &mut dyn fmt::Write) -> bool {
        self.backend().consistency_check(out)
    }

    pub fn consistency_check(&self) -> bool {
        self.consistency_check_to(&mut Stderr)
    }

    pub fn report(&self) -> MemReport {
        MemReport {
            backend: self.active_backend(),
            blocks_in_use: self.num_memory_blocks_in_use(),
            bytes_in_use: self.num_memory_in_use(),
            peak: self.peak_memory(),
            blocks: self.backend().memlist(),
        }
    }

    pub fn memlist_json(&self) -> serde_json::Result<String> {
        self.report().to_json()
    }
}

impl Default for MemContext {
    fn default() -> Self {
        Self::new(MemConfig::new())
    }
}
