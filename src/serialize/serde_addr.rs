//! Addresses as `"0x..."` strings, so JSON consumers don't lose the top bits
//! of a 64-bit pointer to a double.

use serde::Serializer;

pub fn serialize<S>(value: &usize, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_str(&format_args!("{value:#x}"))
}
