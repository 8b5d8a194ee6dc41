use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crate::{Error, Result};

/// Yields attempted before an acquisition fails with `LockNotTaken`.
const SPIN_YIELD_MAX: u32 = 1_000_000;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

#[inline]
fn current_thread_id() -> u64 {
    THREAD_ID.with(|id| *id)
}

/// Outcome of a successful [`SpinLock::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    /// The lock was taken by this call and must be released by it.
    Taken,
    /// This thread already holds the lock; do not release twice.
    AlreadyTaken,
}

/// A spinlock that remembers the holding thread, so same-thread re-entry is
/// reported instead of deadlocking. 0 means unheld.
pub struct SpinLock {
    holder: AtomicU64,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            holder: AtomicU64::new(0),
        }
    }

    /// Spins with yield until the lock is taken, up to the spin bound.
    /// Re-entry by the holding thread returns `AlreadyTaken` without
    /// reacquiring.
    pub fn acquire(&self) -> Result<LockStatus> {
        let our_tid = current_thread_id();
        let mut count = 0;
        while count < SPIN_YIELD_MAX {
            match self
                .holder
                .compare_exchange(0, our_tid, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return Ok(LockStatus::Taken),
                Err(old) if old == our_tid => return Ok(LockStatus::AlreadyTaken),
                Err(_) => {
                    count += 1;
                    thread::yield_now();
                }
            }
        }
        Err(Error::LockNotTaken)
    }

    /// Releases the lock. The caller must be the holding thread.
    pub fn release(&self) {
        let our_tid = current_thread_id();
        let swapped =
            self.holder
                .compare_exchange(our_tid, 0, Ordering::Release, Ordering::Relaxed);
        assert!(
            swapped.is_ok(),
            "lock released by thread {our_tid} which does not hold it"
        );
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}
