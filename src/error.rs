//! Error vocabulary for the allocator.
//!
//! Most of these are usage-contract violations. They are never handed back to
//! the caller. Instead they go through [`fatal()`], which prints the message
//! and aborts at the point of detection.

use std::fmt;

use thiserror::Error;

use crate::eputln;

/// Which sentinels of a guarded block failed validation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CorruptTags {
    pub tag1: bool,
    pub tag2: bool,
    pub tag3: bool,
}

impl CorruptTags {
    pub fn any(self) -> bool {
        self.tag1 || self.tag2 || self.tag3
    }
}

impl fmt::Display for CorruptTags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [(self.tag1, "tag1"), (self.tag2, "tag2"), (self.tag3, "tag3")];
        let mut first = true;
        for (_, name) in names.iter().filter(|(bad, _)| *bad) {
            if !first {
                f.write_str(", ")?;
            }
            f.write_str(name)?;
            first = false;
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

fn identity_name(identity: &Option<&'static str>) -> &'static str {
    identity.unwrap_or("<unnamed>")
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemError {
    #[error("attempt to free a null pointer")]
    NullFree,

    #[error("free of {addr:#x} after the leak detector has run; this memory would be reported as leaked and the program is in an inconsistent state")]
    FreeAfterLeakDetection { addr: usize },

    #[error("{op}: pointer {addr:#x} is not aligned to the pointer size")]
    Misaligned { op: &'static str, addr: usize },

    #[error("attempt to {op} memory that was already freed ({addr:#x})")]
    DoubleFree { op: &'static str, addr: usize },

    #[error("{}: end of block {addr:#x} corrupt", identity_name(.identity))]
    EndCorrupt {
        addr: usize,
        identity: Option<&'static str>,
    },

    #[error("error in header of block {addr:#x}: corrupt {tags}")]
    HeaderCorrupt { addr: usize, tags: CorruptTags },

    #[error("{op}: pointer {addr:#x} not in registry")]
    NotInRegistry { op: &'static str, addr: usize },

    #[error("registry corrupt: block {addr:#x} has broken tags ({tags})")]
    RegistryCorrupt { addr: usize, tags: CorruptTags },

    #[error("alignment {align} is not a power of two no larger than 2^31")]
    InvalidAlignment { align: usize },

    #[error("cannot switch allocator backend with {blocks} block(s) still allocated")]
    BlocksOutstanding { blocks: usize },

    #[error("{blocks} block(s) totalling {bytes} bytes were never freed")]
    LeakDetected { blocks: usize, bytes: usize },
}

/// Print `err` and abort the process. This is the only way a contract
/// violation leaves the allocator.
#[cold]
#[inline(never)]
pub fn fatal(err: MemError) -> ! {
    eputln!("guardalloc: {err}");
    std::process::abort()
}
