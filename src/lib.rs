//! Block allocators with a switchable backend.
//!
//! - The **guarded** backend wraps every block in a header and tail with
//!   sentinels, names it, and keeps it in a registry. Double frees, overruns
//!   and foreign pointers abort with a precise message, and leaks are listed
//!   block by block at shutdown.
//! - The **lockfree** backend only stores the block length in front of the
//!   payload.
//!
//! Both count live blocks and bytes, and both go through the same
//! [`MemContext`] entry points. [`api`] exposes the process-wide context as
//! free functions and macros, [`MemGlobalAlloc`] plugs it in as Rust's global
//! allocator, and [`externc`] exports it to C.

pub mod alloc;
pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod externc;
pub mod leak;
pub mod os;
mod serialize;
pub mod util;

pub use alloc::{
    dispatch::{BackendKind, Identity, MemAllocator},
    global::MemGlobalAlloc,
    report::{BlockInfo, MemReport},
};
pub use config::MemConfig;
pub use context::MemContext;
pub use error::MemError;
pub use leak::LeakOutcome;
