//! Formatting of the live block list: the per-block listing printed by the
//! leak detector, per-identity statistics and a JSON snapshot.
//!
//! The `write_*` functions only use `core::fmt` and never allocate, so they
//! can run while the registry lock is held.

use std::fmt;

use hashbrown::HashMap;
use serde::Serialize;

use super::dispatch::{BackendKind, Identity};
use crate::util::num::HumanBytes;

/// Payloads shorter than this are hex dumped in listings.
pub const DUMP_LIMIT: usize = 128;

const DUMP_WIDTH: usize = 16;

const UNNAMED: &str = "<unnamed>";

/// One live block, as seen from outside the allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BlockInfo {
    #[serde(serialize_with = "crate::serialize::serde_addr::serialize")]
    pub addr: usize,
    pub size: usize,
    /// `0` if the block is unaligned
    pub align: usize,
    pub identity: Identity,
}

/// `{identity} len: {size} {addr}`, then a dump of `payload` if given.
pub fn write_block(out: &mut dyn fmt::Write, block: &BlockInfo, payload: Option<&[u8]>) -> fmt::Result {
    write!(
        out,
        "{} len: {} {:#x}",
        block.identity.unwrap_or(UNNAMED),
        block.size,
        block.addr
    )?;
    if block.align != 0 {
        write!(out, " aligned: {}", block.align)?;
    }
    writeln!(out)?;
    if let Some(payload) = payload {
        write_hex_dump(out, payload)?;
    }
    Ok(())
}

/// Classic `offset  hex bytes  |ascii|` dump, 16 bytes to a line.
pub fn write_hex_dump(out: &mut dyn fmt::Write, bytes: &[u8]) -> fmt::Result {
    for (line, chunk) in bytes.chunks(DUMP_WIDTH).enumerate() {
        write!(out, "  {:04x} ", line * DUMP_WIDTH)?;
        for byte in chunk {
            write!(out, " {byte:02x}")?;
        }
        for _ in chunk.len()..DUMP_WIDTH {
            out.write_str("   ")?;
        }
        out.write_str("  |")?;
        for &byte in chunk {
            let c = if byte.is_ascii_graphic() || byte == b' ' {
                byte as char
            } else {
                '.'
            };
            out.write_char(c)?;
        }
        out.write_str("|\n")?;
    }
    Ok(())
}

/// Live blocks sharing one identity
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IdentityStats {
    pub identity: Identity,
    pub blocks: usize,
    pub bytes: usize,
}

/// Group `blocks` by identity, biggest total first.
pub fn stats_by_identity(blocks: &[BlockInfo]) -> Vec<IdentityStats> {
    let mut groups: HashMap<Identity, (usize, usize)> = HashMap::new();
    for block in blocks {
        let (count, bytes) = groups.entry(block.identity).or_default();
        *count += 1;
        *bytes += block.size;
    }
    let mut stats: Vec<_> = groups
        .into_iter()
        .map(|(identity, (blocks, bytes))| IdentityStats {
            identity,
            blocks,
            bytes,
        })
        .collect();
    stats.sort_by(|a, b| b.bytes.cmp(&a.bytes).then_with(|| a.identity.cmp(&b.identity)));
    stats
}

pub fn write_stats(out: &mut dyn fmt::Write, stats: &[IdentityStats]) -> fmt::Result {
    for group in stats {
        writeln!(
            out,
            "{} in {} block(s): {}",
            HumanBytes(group.bytes),
            group.blocks,
            group.identity.unwrap_or(UNNAMED)
        )?;
    }
    Ok(())
}

/// Everything the allocator knows about its current state.
#[derive(Clone, Debug, Serialize)]
pub struct MemReport {
    pub backend: BackendKind,
    pub blocks_in_use: usize,
    pub bytes_in_use: usize,
    pub peak: usize,
    /// `None` when the backend keeps no block list
    pub blocks: Option<Vec<BlockInfo>>,
}

impl MemReport {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
