//! The process-wide allocator: free functions over one static
//! [`MemContext`], plus macros that name each block after the call site.
//!
//! ```
//! use guardalloc::{api, malloc_n};
//!
//! let p = malloc_n!(64);
//! assert_eq!(unsafe { api::alloc_n_length(p) }, 64);
//! unsafe { api::free_n(p) };
//! ```

use crate::{
    alloc::dispatch::BackendKind,
    config::{MemConfig, ENV_CONFIG},
    context::MemContext,
    error::MemError,
    leak::LeakOutcome,
};

static GLOBAL: MemContext = MemContext::new(MemConfig::new());

/// The process-wide context behind every function in this module.
pub fn context() -> &'static MemContext {
    &GLOBAL
}

/// Apply the `GUARDALLOC_*` environment variables to the process-wide
/// context. Fails if a backend switch is requested while blocks are live.
pub fn configure_from_env() -> Result<(), MemError> {
    GLOBAL.apply_config(&ENV_CONFIG)
}

pub fn malloc_n(size: usize, identity: &'static str) -> *mut u8 {
    GLOBAL.malloc_n(size, Some(identity))
}

pub fn malloc_n_aligned(size: usize, align: usize, identity: &'static str) -> *mut u8 {
    GLOBAL.malloc_n_aligned(size, align, Some(identity))
}

pub fn calloc_n(size: usize, identity: &'static str) -> *mut u8 {
    GLOBAL.calloc_n(size, Some(identity))
}

pub fn calloc_n_aligned(size: usize, align: usize, identity: &'static str) -> *mut u8 {
    GLOBAL.calloc_n_aligned(size, align, Some(identity))
}

pub fn malloc_array_n(count: usize, size: usize, identity: &'static str) -> *mut u8 {
    GLOBAL.malloc_array_n(count, size, Some(identity))
}

pub fn calloc_array_n(count: usize, size: usize, identity: &'static str) -> *mut u8 {
    GLOBAL.calloc_array_n(count, size, Some(identity))
}

/// # Safety
///
/// See [`MemContext::realloc_n_id()`]
pub unsafe fn realloc_n_id(ptr: *mut u8, size: usize, identity: &'static str) -> *mut u8 {
    unsafe { GLOBAL.realloc_n_id(ptr, size, Some(identity)) }
}

/// # Safety
///
/// See [`MemContext::recalloc_n_id()`]
pub unsafe fn recalloc_n_id(ptr: *mut u8, size: usize, identity: &'static str) -> *mut u8 {
    unsafe { GLOBAL.recalloc_n_id(ptr, size, Some(identity)) }
}

/// # Safety
///
/// See [`MemContext::dupalloc_n()`]
pub unsafe fn dupalloc_n(ptr: *mut u8) -> *mut u8 {
    unsafe { GLOBAL.dupalloc_n(ptr) }
}

/// # Safety
///
/// See [`MemContext::free_n()`]
pub unsafe fn free_n(ptr: *mut u8) {
    unsafe { GLOBAL.free_n(ptr) }
}

/// # Safety
///
/// See [`MemContext::alloc_n_length()`]
pub unsafe fn alloc_n_length(ptr: *mut u8) -> usize {
    unsafe { GLOBAL.alloc_n_length(ptr) }
}

/// # Safety
///
/// See [`MemContext::name_ptr()`]
pub unsafe fn name_ptr(ptr: *mut u8) -> Option<&'static str> {
    unsafe { GLOBAL.name_ptr(ptr) }
}

pub fn print_memlist() {
    GLOBAL.print_memlist()
}

pub fn print_memlist_stats() {
    GLOBAL.print_memlist_stats()
}

pub fn memlist_json() -> serde_json::Result<String> {
    GLOBAL.memlist_json()
}

pub fn consistency_check() -> bool {
    GLOBAL.consistency_check()
}

pub fn num_memory_blocks_in_use() -> usize {
    GLOBAL.num_memory_blocks_in_use()
}

pub fn num_memory_in_use() -> usize {
    GLOBAL.num_memory_in_use()
}

pub fn peak_memory() -> usize {
    GLOBAL.peak_memory()
}

pub fn reset_peak_memory() {
    GLOBAL.reset_peak_memory()
}

pub fn active_backend() -> BackendKind {
    GLOBAL.active_backend()
}

pub fn use_lockfree_allocator() -> Result<(), MemError> {
    GLOBAL.use_lockfree_allocator()
}

pub fn use_guarded_allocator() -> Result<(), MemError> {
    GLOBAL.use_guarded_allocator()
}

pub fn set_memory_debug(enabled: bool) {
    GLOBAL.set_memory_debug(enabled)
}

pub fn use_memleak_detection(enabled: bool) {
    GLOBAL.use_memleak_detection(enabled)
}

pub fn enable_fail_on_memleak() {
    GLOBAL.enable_fail_on_memleak()
}

extern "C" fn leak_detector_at_exit() {
    GLOBAL.shutdown();
}

/// Arm the leak detector and have it run when the process exits. Calling
/// this more than once has no further effect.
pub fn init_memleak_detection() {
    if !GLOBAL.init() {
        return;
    }
    // SAFETY: the hook only touches the static context
    if unsafe { libc::atexit(leak_detector_at_exit) } != 0 {
        log::warn!("could not register the leak detector with atexit()");
    }
}

/// Run the leak detector now instead of at exit.
pub fn shutdown() -> LeakOutcome {
    GLOBAL.shutdown()
}

/// `"module::path:line"` of the call site, as a `&'static str`.
#[doc(hidden)]
#[macro_export]
macro_rules! here {
    () => {
        concat!(module_path!(), ":", line!())
    };
}

/// [`api::malloc_n()`](crate::api::malloc_n) named after the call site
/// unless an identity is given.
#[macro_export]
macro_rules! malloc_n {
    ($size:expr) => {
        $crate::api::malloc_n($size, $crate::here!())
    };
    ($size:expr, $identity:expr) => {
        $crate::api::malloc_n($size, $identity)
    };
}

#[macro_export]
macro_rules! calloc_n {
    ($size:expr) => {
        $crate::api::calloc_n($size, $crate::here!())
    };
    ($size:expr, $identity:expr) => {
        $crate::api::calloc_n($size, $identity)
    };
}

#[macro_export]
macro_rules! malloc_n_aligned {
    ($size:expr, $align:expr) => {
        $crate::api::malloc_n_aligned($size, $align, $crate::here!())
    };
    ($size:expr, $align:expr, $identity:expr) => {
        $crate::api::malloc_n_aligned($size, $align, $identity)
    };
}

#[macro_export]
macro_rules! calloc_n_aligned {
    ($size:expr, $align:expr) => {
        $crate::api::calloc_n_aligned($size, $align, $crate::here!())
    };
    ($size:expr, $align:expr, $identity:expr) => {
        $crate::api::calloc_n_aligned($size, $align, $identity)
    };
}

/// Expands to an `unsafe` call; see [`api::realloc_n_id()`](crate::api::realloc_n_id).
#[macro_export]
macro_rules! realloc_n {
    ($ptr:expr, $size:expr) => {
        $crate::api::realloc_n_id($ptr, $size, $crate::here!())
    };
    ($ptr:expr, $size:expr, $identity:expr) => {
        $crate::api::realloc_n_id($ptr, $size, $identity)
    };
}

/// Expands to an `unsafe` call; see [`api::recalloc_n_id()`](crate::api::recalloc_n_id).
#[macro_export]
macro_rules! recalloc_n {
    ($ptr:expr, $size:expr) => {
        $crate::api::recalloc_n_id($ptr, $size, $crate::here!())
    };
    ($ptr:expr, $size:expr, $identity:expr) => {
        $crate::api::recalloc_n_id($ptr, $size, $identity)
    };
}
