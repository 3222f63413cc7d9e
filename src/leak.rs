//! Shutdown-time leak detection.
//!
//! The detector is armed once with [`LeakDetector::init()`] and runs at most
//! once. After it has run every remaining block counts as leaked, so a later
//! free is a contract violation (the context enforces that).

use std::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU8, Ordering},
};

use crate::{
    alloc::{dispatch::MemAllocator, usage::UsageTracker},
    util::num::HumanBytes,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LeakState {
    NotInitialized = 0,
    Armed = 1,
    HasRun = 2,
}

impl LeakState {
    const fn from_u8(n: u8) -> Self {
        match n {
            0 => Self::NotInitialized,
            1 => Self::Armed,
            _ => Self::HasRun,
        }
    }
}

/// What a call to [`LeakDetector::run()`] found
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeakOutcome {
    /// `init()` was never called, nothing was checked
    NotArmed,
    /// The detector had already run
    AlreadyRun,
    /// Leaks are being ignored, nothing was checked
    Ignored,
    Clean,
    Leaked { blocks: usize, bytes: usize },
}

pub struct LeakDetector {
    state: AtomicU8,
    ignore_leaks: AtomicBool,
    fail_on_leak: AtomicBool,
}

impl LeakDetector {
    pub const fn new(fail_on_leak: bool, ignore_leaks: bool) -> Self {
        Self {
            state: AtomicU8::new(LeakState::NotInitialized as u8),
            ignore_leaks: AtomicBool::new(ignore_leaks),
            fail_on_leak: AtomicBool::new(fail_on_leak),
        }
    }

    pub fn state(&self) -> LeakState {
        LeakState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Arm the detector. `true` if this call armed it, `false` if it was
    /// armed (or has run) already.
    pub fn init(&self) -> bool {
        let armed = self
            .state
            .compare_exchange(
                LeakState::NotInitialized as u8,
                LeakState::Armed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if armed {
            log::debug!("leak detector armed");
        }
        armed
    }

    pub fn has_run(&self) -> bool {
        self.state() == LeakState::HasRun
    }

    pub fn set_ignore_leaks(&self, ignore: bool) {
        self.ignore_leaks.store(ignore, Ordering::Relaxed);
    }

    pub fn ignore_leaks(&self) -> bool {
        self.ignore_leaks.load(Ordering::Relaxed)
    }

    pub fn set_fail_on_leak(&self, fail: bool) {
        self.fail_on_leak.store(fail, Ordering::Relaxed);
    }

    pub fn fail_on_leak(&self) -> bool {
        self.fail_on_leak.load(Ordering::Relaxed)
    }

    /// Move from armed to has-run and report any live blocks to `out`.
    pub fn run(&self, usage: &UsageTracker, backend: &dyn MemAllocator, out: &mut dyn fmt::Write) -> LeakOutcome {
        if let Err(state) = self.state.compare_exchange(
            LeakState::Armed as u8,
            LeakState::HasRun as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return match LeakState::from_u8(state) {
                LeakState::NotInitialized => LeakOutcome::NotArmed,
                _ => LeakOutcome::AlreadyRun,
            };
        }

        if self.ignore_leaks() {
            return LeakOutcome::Ignored;
        }
        let blocks = usage.blocks_in_use();
        if blocks == 0 {
            return LeakOutcome::Clean;
        }
        let bytes = usage.bytes_in_use();
        let _ = writeln!(
            out,
            "Error: Not freed memory blocks: {blocks}, total unfreed memory {}",
            HumanBytes(bytes)
        );
        let _ = backend.print_memlist(out);
        LeakOutcome::Leaked { blocks, bytes }
    }
}

impl Default for LeakDetector {
    fn default() -> Self {
        Self::new(cfg!(debug_assertions), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::guarded::GuardedAllocator;

    #[test]
    fn runs_only_when_armed_and_only_once() {
        let detector = LeakDetector::new(false, false);
        let usage = UsageTracker::default();
        let backend = GuardedAllocator::new(false);
        let mut out = String::new();

        assert_eq!(detector.run(&usage, &backend, &mut out), LeakOutcome::NotArmed);
        assert_eq!(detector.state(), LeakState::NotInitialized);
        assert!(detector.init());
        assert!(!detector.init());
        assert_eq!(detector.state(), LeakState::Armed);
        assert_eq!(detector.run(&usage, &backend, &mut out), LeakOutcome::Clean);
        assert!(detector.has_run());
        assert_eq!(detector.run(&usage, &backend, &mut out), LeakOutcome::AlreadyRun);
        assert!(!detector.init());
        assert!(out.is_empty());
    }

    #[test]
    fn leaks_are_reported_with_the_block_list() {
        let detector = LeakDetector::new(false, false);
        let usage = UsageTracker::default();
        let backend = GuardedAllocator::new(false);
        let p = backend.calloc_n(&usage, 1536, Some("forgotten"));
        detector.init();

        let mut out = String::new();
        let outcome = detector.run(&usage, &backend, &mut out);
        assert_eq!(outcome, LeakOutcome::Leaked { blocks: 1, bytes: 1536 });
        assert!(
            out.starts_with("Error: Not freed memory blocks: 1, total unfreed memory 1.500 KB\n"),
            "{out}"
        );
        assert!(out.contains("forgotten len: 1536"), "{out}");
        unsafe { backend.free_n(&usage, p) };
    }

    #[test]
    fn ignored_leaks_print_nothing() {
        let detector = LeakDetector::new(true, true);
        let usage = UsageTracker::default();
        let backend = GuardedAllocator::new(false);
        let p = backend.malloc_n(&usage, 8, None);
        detector.init();
        let mut out = String::new();
        assert_eq!(detector.run(&usage, &backend, &mut out), LeakOutcome::Ignored);
        assert!(out.is_empty());
        assert!(detector.has_run());
        unsafe { backend.free_n(&usage, p) };
    }
}
