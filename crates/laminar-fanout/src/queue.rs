//! # Bounded Queue
//!
//! Blocking bounded FIFO used for lane queues and the coordinator's
//! watermark queue.
//!
//! Every blocking call takes a timeout. Callers loop on the timeout and
//! re-check the pipeline's running state, which is how shutdown reaches a
//! thread parked on a full or empty queue.
//!
//! ## Design
//!
//! - `parking_lot::Mutex<VecDeque<T>>` holds the items
//! - `not_empty` / `not_full` condvars wake consumers and producers
//! - Capacity is fixed at construction and never exceeded

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A bounded multi-producer FIFO with timed blocking operations.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> BoundedQueue<T> {
    /// Creates a queue holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Appends `item`, waiting up to `timeout` for free capacity.
    ///
    /// # Errors
    ///
    /// Returns the item back if the queue was still full at the deadline.
    pub fn offer_timeout(&self, item: T, timeout: Duration) -> Result<(), T> {
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock();
        while items.len() >= self.capacity {
            if self.not_full.wait_until(&mut items, deadline).timed_out()
                && items.len() >= self.capacity
            {
                return Err(item);
            }
        }
        items.push_back(item);
        drop(items);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Appends `item` only if there is free capacity right now.
    ///
    /// # Errors
    ///
    /// Returns the item back if the queue is full.
    pub fn try_offer(&self, item: T) -> Result<(), T> {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            return Err(item);
        }
        items.push_back(item);
        drop(items);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Removes the head, waiting up to `timeout` for one to arrive.
    pub fn poll_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock();
        loop {
            if let Some(item) = items.pop_front() {
                drop(items);
                self.not_full.notify_one();
                return Some(item);
            }
            if self.not_empty.wait_until(&mut items, deadline).timed_out() {
                let item = items.pop_front();
                if item.is_some() {
                    drop(items);
                    self.not_full.notify_one();
                }
                return item;
            }
        }
    }

    /// Moves up to `max` items into `buffer`, waiting up to `timeout` for the
    /// first one.
    ///
    /// Returns as soon as at least one item is available; whatever else is
    /// queued at that moment (up to `max`) is taken along with it. Returns the
    /// number of items appended.
    pub fn drain_timeout(&self, buffer: &mut Vec<T>, max: usize, timeout: Duration) -> usize {
        if max == 0 {
            return 0;
        }
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock();
        while items.is_empty() {
            if self.not_empty.wait_until(&mut items, deadline).timed_out() && items.is_empty() {
                return 0;
            }
        }
        let count = max.min(items.len());
        buffer.extend(items.drain(..count));
        drop(items);
        self.not_full.notify_all();
        count
    }

    /// Returns the number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Returns the fixed capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
