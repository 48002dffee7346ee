//! Processor metrics.
//!
//! Lock-free atomic counters updated from the dispatcher, lane workers and
//! the checkpoint coordinator. Read them through [`FanoutMetrics::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for a partitioned processor.
///
/// All counters use relaxed atomic ordering; they are diagnostics and do not
/// order any other memory access.
#[derive(Debug, Default)]
pub struct FanoutMetrics {
    /// Data events enqueued onto a lane.
    pub events_submitted: AtomicU64,
    /// Data events handed to the batch processor successfully.
    pub events_processed: AtomicU64,
    /// Batches handed to the batch processor successfully.
    pub batches_processed: AtomicU64,
    /// Barrier broadcasts.
    pub barriers: AtomicU64,
    /// Watermark broadcasts.
    pub watermarks: AtomicU64,
    /// Successful offset flushes.
    pub checkpoints_flushed: AtomicU64,
    /// Queue offers that timed out and were retried.
    pub enqueue_timeouts: AtomicU64,
    /// Failures reported to the error handler.
    pub failures: AtomicU64,
}

impl FanoutMetrics {
    /// Creates a new metrics instance with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a data event enqueued onto a lane.
    pub fn record_submitted(&self) {
        self.events_submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a processed batch of `events` data events.
    pub fn record_batch(&self, events: usize) {
        self.batches_processed.fetch_add(1, Ordering::Relaxed);
        self.events_processed
            .fetch_add(events as u64, Ordering::Relaxed);
    }

    /// Records a barrier broadcast.
    pub fn record_barrier(&self) {
        self.barriers.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a watermark broadcast.
    pub fn record_watermark(&self) {
        self.watermarks.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a successful offset flush.
    pub fn record_checkpoint(&self) {
        self.checkpoints_flushed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an enqueue timeout.
    pub fn record_enqueue_timeout(&self) {
        self.enqueue_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a reported failure.
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> FanoutMetricsSnapshot {
        FanoutMetricsSnapshot {
            events_submitted: self.events_submitted.load(Ordering::Relaxed),
            events_processed: self.events_processed.load(Ordering::Relaxed),
            batches_processed: self.batches_processed.load(Ordering::Relaxed),
            barriers: self.barriers.load(Ordering::Relaxed),
            watermarks: self.watermarks.load(Ordering::Relaxed),
            checkpoints_flushed: self.checkpoints_flushed.load(Ordering::Relaxed),
            enqueue_timeouts: self.enqueue_timeouts.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`FanoutMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutMetricsSnapshot {
    /// Data events enqueued onto a lane.
    pub events_submitted: u64,
    /// Data events handed to the batch processor successfully.
    pub events_processed: u64,
    /// Batches handed to the batch processor successfully.
    pub batches_processed: u64,
    /// Barrier broadcasts.
    pub barriers: u64,
    /// Watermark broadcasts.
    pub watermarks: u64,
    /// Successful offset flushes.
    pub checkpoints_flushed: u64,
    /// Queue offers that timed out and were retried.
    pub enqueue_timeouts: u64,
    /// Failures reported to the error handler.
    pub failures: u64,
}

impl FanoutMetricsSnapshot {
    /// Data events accepted but not yet processed.
    #[must_use]
    pub fn events_in_flight(&self) -> u64 {
        self.events_submitted.saturating_sub(self.events_processed)
    }
}
