//! # Countdown
//!
//! One-shot "wait for K acknowledgements" primitive behind barriers and
//! watermarks.
//!
//! The count lives in an atomic so acknowledging never takes a lock on the
//! fast path. Waiters park on a `parking_lot` condvar and always wait with a
//! deadline, so a caller can re-check the pipeline's running state between
//! ticks instead of blocking forever.
//!
//! ```text
//!   lane 0 ──count_down()──┐
//!   lane 1 ──count_down()──┼──> remaining: 3 → 2 → 1 → 0 ──notify_all──> waiters
//!   lane 2 ──count_down()──┘
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A countdown that releases all waiters once it reaches zero.
///
/// The count only decreases. Reaching zero is irreversible and wakes every
/// waiter exactly once; further `count_down` calls are ignored.
#[derive(Debug)]
pub struct Countdown {
    remaining: AtomicUsize,
    lock: Mutex<()>,
    released: Condvar,
}

impl Countdown {
    /// Creates a countdown expecting `count` acknowledgements.
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(count),
            lock: Mutex::new(()),
            released: Condvar::new(),
        }
    }

    /// Records one acknowledgement.
    ///
    /// Returns true if this call released the countdown.
    pub fn count_down(&self) -> bool {
        let mut current = self.remaining.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.remaining.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        if current == 1 {
            // Taking the lock orders the notify after any waiter's check.
            let _guard = self.lock.lock();
            self.released.notify_all();
            true
        } else {
            false
        }
    }

    /// Returns the number of outstanding acknowledgements.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Returns true once every acknowledgement has arrived.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.remaining() == 0
    }

    /// Waits up to `timeout` for the countdown to reach zero.
    ///
    /// Returns true if released, false on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_released() {
            return true;
        }

        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock();
        while !self.is_released() {
            if self.released.wait_until(&mut guard, deadline).timed_out() {
                return self.is_released();
            }
        }
        true
    }
}
