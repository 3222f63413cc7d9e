use std::fmt;

/// Round up `n` to the nearest multiple of `to`, `None` on overflow. `to`
/// must be a power of two.
pub const fn checked_round_up(n: usize, to: usize) -> Option<usize> {
    debug_assert!(to.is_power_of_two());
    match n.checked_add(to - 1) {
        Some(n) => Some(n & !(to - 1)),
        None => None,
    }
}

/// Add up a handful of sizes, `None` if any step overflows.
pub fn checked_sum(parts: &[usize]) -> Option<usize> {
    parts
        .iter()
        .try_fold(0usize, |total, part| total.checked_add(*part))
}

const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// Displays a byte count in the largest unit that keeps the number below
/// 1000, e.g. `1536` -> `1.500 KB`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HumanBytes(pub usize);

impl HumanBytes {
    /// The scaled value and its unit.
    pub fn scaled(self) -> (f64, &'static str) {
        let mut value = self.0 as f64;
        let mut unit = 0;
        while value >= 1000.0 && unit + 1 < UNITS.len() {
            value /= 1024.0;
            unit += 1;
        }
        (value, UNITS[unit])
    }
}

impl fmt::Display for HumanBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (value, unit) = self.scaled();
        write!(f, "{value:.3} {unit}")
    }
}
