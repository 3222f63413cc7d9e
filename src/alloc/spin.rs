//! The registry lock. Blocking on it must never allocate, because the
//! allocator may itself be the global allocator: parking threads (as
//! `parking_lot::Mutex` does) allocates the parking table on first use.
//! Critical sections are a few pointer writes, so waiters spin and then
//! yield instead.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::utils::Backoff;
use parking_lot::lock_api::{self, GuardSend};

pub struct RawSpinLock {
    locked: AtomicBool,
}

// SAFETY: `lock()` only returns once this thread flipped `locked` from false
//         to true, and only `unlock()` flips it back.
unsafe impl lock_api::RawMutex for RawSpinLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        locked: AtomicBool::new(false),
    };

    type GuardMarker = GuardSend;

    fn lock(&self) {
        let backoff = Backoff::new();
        while !self.try_lock() {
            while self.locked.load(Ordering::Relaxed) {
                backoff.snooze();
            }
        }
    }

    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

pub type SpinMutex<T> = lock_api::Mutex<RawSpinLock, T>;
pub type SpinMutexGuard<'a, T> = lock_api::MutexGuard<'a, RawSpinLock, T>;
