//! C entry points over the process-wide context.
//!
//! Identities are C strings that must outlive the block (string literals, in
//! practice). A null identity or one that is not UTF-8 leaves the block
//! unnamed.

use std::ffi::{c_char, CStr};

use libc::{c_void, size_t};

use crate::api;

/// # Safety
///
/// `identity` must be null or a NUL-terminated string that lives for the rest
/// of the process.
unsafe fn identity(identity: *const c_char) -> Option<&'static str> {
    if identity.is_null() {
        return None;
    }
    // SAFETY: passed to caller
    unsafe { CStr::from_ptr(identity) }.to_str().ok()
}

#[no_mangle]
pub unsafe extern "C" fn guardalloc_malloc(size: size_t, identity: *const c_char) -> *mut c_void {
    api::context().malloc_n(size, unsafe { self::identity(identity) }).cast()
}

#[no_mangle]
pub unsafe extern "C" fn guardalloc_calloc(size: size_t, identity: *const c_char) -> *mut c_void {
    api::context().calloc_n(size, unsafe { self::identity(identity) }).cast()
}

#[no_mangle]
pub unsafe extern "C" fn guardalloc_malloc_aligned(
    size: size_t,
    align: size_t,
    identity: *const c_char,
) -> *mut c_void {
    api::context()
        .malloc_n_aligned(size, align, unsafe { self::identity(identity) })
        .cast()
}

#[no_mangle]
pub unsafe extern "C" fn guardalloc_realloc(
    ptr: *mut c_void,
    size: size_t,
    identity: *const c_char,
) -> *mut c_void {
    unsafe {
        api::context()
            .realloc_n_id(ptr.cast(), size, self::identity(identity))
            .cast()
    }
}

#[no_mangle]
pub unsafe extern "C" fn guardalloc_dupalloc(ptr: *mut c_void) -> *mut c_void {
    unsafe { api::context().dupalloc_n(ptr.cast()).cast() }
}

#[no_mangle]
pub unsafe extern "C" fn guardalloc_free(ptr: *mut c_void) {
    unsafe { api::context().free_n(ptr.cast()) }
}

#[no_mangle]
pub unsafe extern "C" fn guardalloc_len(ptr: *const c_void) -> size_t {
    unsafe { api::context().alloc_n_length(ptr.cast_mut().cast()) }
}

#[no_mangle]
pub extern "C" fn guardalloc_print_memlist() {
    api::print_memlist()
}
