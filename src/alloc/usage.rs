//! Process-wide byte/block counters and an approximate peak.
//!
//! The peak is not refreshed on every allocation. Growth is accumulated and
//! the peak only catches up with the current usage once that growth (or a
//! single allocation) reaches `threshold` bytes. Between refreshes the peak
//! can lag by up to `threshold` per allocating thread; large allocations are
//! never missed.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;

/// Default peak refresh threshold
pub const PEAK_UPDATE_THRESHOLD: usize = 1024 * 1024;

pub struct UsageTracker {
    bytes: CachePadded<AtomicUsize>,
    blocks: CachePadded<AtomicUsize>,
    /// Growth since the last time the peak was refreshed
    growth: CachePadded<AtomicUsize>,
    peak: AtomicUsize,
    threshold: AtomicUsize,
}

impl UsageTracker {
    pub const fn new(threshold: usize) -> Self {
        Self {
            bytes: CachePadded::new(AtomicUsize::new(0)),
            blocks: CachePadded::new(AtomicUsize::new(0)),
            growth: CachePadded::new(AtomicUsize::new(0)),
            peak: AtomicUsize::new(0),
            threshold: AtomicUsize::new(threshold),
        }
    }

    /// Record a new block with a payload of `size` bytes.
    pub fn block_alloc(&self, size: usize) {
        let bytes = self.bytes.fetch_add(size, Ordering::Relaxed) + size;
        self.blocks.fetch_add(1, Ordering::Relaxed);

        let threshold = self.threshold.load(Ordering::Relaxed);
        let growth = self.growth.fetch_add(size, Ordering::Relaxed) + size;
        if size >= threshold || growth >= threshold {
            self.growth.store(0, Ordering::Relaxed);
            self.peak.fetch_max(bytes, Ordering::Relaxed);
        }
    }

    /// Forget a block. `size` must be the size recorded by the matching
    /// [`block_alloc()`](Self::block_alloc).
    pub fn block_free(&self, size: usize) {
        let before = self.bytes.fetch_sub(size, Ordering::Relaxed);
        debug_assert!(before >= size, "usage underflow: {before} - {size}");
        let blocks = self.blocks.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(blocks > 0, "block count underflow");
    }

    /// Bytes currently handed out
    pub fn bytes_in_use(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Blocks currently handed out
    pub fn blocks_in_use(&self) -> usize {
        self.blocks.load(Ordering::Relaxed)
    }

    /// The highest usage seen since the last reset. The current usage is
    /// folded in first, so this is never below [`bytes_in_use()`](Self::bytes_in_use).
    pub fn peak(&self) -> usize {
        let bytes = self.bytes_in_use();
        self.peak.fetch_max(bytes, Ordering::Relaxed).max(bytes)
    }

    /// Restart peak tracking from the current usage.
    pub fn peak_reset(&self) {
        self.growth.store(0, Ordering::Relaxed);
        self.peak.store(self.bytes_in_use(), Ordering::Relaxed);
    }

    pub fn set_threshold(&self, threshold: usize) {
        self.threshold.store(threshold, Ordering::Relaxed);
    }

    pub fn threshold(&self) -> usize {
        self.threshold.load(Ordering::Relaxed)
    }
}

impl Default for UsageTracker {
    fn default() -> Self {
        Self::new(PEAK_UPDATE_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_free_are_symmetric() {
        let usage = UsageTracker::default();
        usage.block_alloc(100);
        usage.block_alloc(28);
        assert_eq!(usage.bytes_in_use(), 128);
        assert_eq!(usage.blocks_in_use(), 2);
        usage.block_free(28);
        usage.block_free(100);
        assert_eq!(usage.bytes_in_use(), 0);
        assert_eq!(usage.blocks_in_use(), 0);
    }

    #[test]
    fn large_allocations_refresh_the_peak_immediately() {
        let usage = UsageTracker::new(1000);
        usage.block_alloc(5000);
        usage.block_free(5000);
        // `peak()` folds in the current usage, so look at the raw value too
        assert_eq!(usage.peak.load(Ordering::Relaxed), 5000);
        assert_eq!(usage.peak(), 5000);
    }

    #[test]
    fn small_allocations_refresh_once_growth_reaches_threshold() {
        let usage = UsageTracker::new(1000);
        for _ in 0..9 {
            usage.block_alloc(100);
        }
        assert_eq!(usage.peak.load(Ordering::Relaxed), 0);
        usage.block_alloc(100);
        assert_eq!(usage.peak.load(Ordering::Relaxed), 1000);
        for _ in 0..10 {
            usage.block_free(100);
        }
        assert_eq!(usage.peak(), 1000);
    }

    #[test]
    fn peak_may_under_report_by_less_than_threshold() {
        let usage = UsageTracker::new(1000);
        usage.block_alloc(999);
        usage.block_free(999);
        assert!(usage.peak() + usage.threshold() > 999);
    }

    #[test]
    fn peak_reset_starts_from_current_usage() {
        let usage = UsageTracker::new(0);
        usage.block_alloc(300);
        usage.block_alloc(200);
        usage.block_free(300);
        assert_eq!(usage.peak(), 500);
        usage.peak_reset();
        assert_eq!(usage.peak(), 200);
    }

    #[test]
    fn counters_survive_concurrent_updates() {
        let usage = UsageTracker::new(64);
        crossbeam::thread::scope(|s| {
            for t in 0..8 {
                let usage = &usage;
                s.spawn(move |_| {
                    for i in 0..10_000 {
                        let size = (t * 7 + i) % 97;
                        usage.block_alloc(size);
                        usage.block_free(size);
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(usage.bytes_in_use(), 0);
        assert_eq!(usage.blocks_in_use(), 0);
        assert!(usage.peak() <= 8 * 96);
    }
}
