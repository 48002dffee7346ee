//! State shared by the dispatcher, the lane workers and the checkpoint
//! coordinator.
//!
//! Holds the queues, the injected strategies and callbacks, the running flag
//! and the metrics. Everything here is reached through one `Arc<Shared>`; the
//! only state several lane workers mutate concurrently is the countdown inside
//! a broadcast marker.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::callback::{BatchProcessor, ErrorHandler, OffsetFlusher};
use crate::config::FanoutConfig;
use crate::error::FanoutError;
use crate::event::ChangeEvent;
use crate::marker::{BarrierMarker, PartitionMarker, WatermarkMarker};
use crate::metrics::FanoutMetrics;
use crate::partition::{KeySelector, Partitioner};
use crate::queue::BoundedQueue;

/// External liveness gate, ANDed into every running check.
pub(crate) type LivenessGate = Box<dyn Fn() -> bool + Send + Sync>;

pub(crate) struct Shared {
    pub(crate) config: FanoutConfig,
    running: AtomicBool,
    liveness: LivenessGate,
    pub(crate) lanes: Vec<BoundedQueue<PartitionMarker>>,
    pub(crate) markers: BoundedQueue<Arc<WatermarkMarker>>,
    pub(crate) key_selector: Box<dyn KeySelector>,
    pub(crate) partitioner: Box<dyn Partitioner>,
    pub(crate) processor: Box<dyn BatchProcessor>,
    pub(crate) flusher: Box<dyn OffsetFlusher>,
    error_handler: Box<dyn ErrorHandler>,
    pub(crate) metrics: FanoutMetrics,
    next_marker_id: AtomicU64,
    next_seq: AtomicU64,
    last_watermark: AtomicU64,
    flushed_watermark: Mutex<u64>,
    checkpoint_flushed: Condvar,
}

/// Strategies and callbacks handed over by the builder.
pub(crate) struct Components {
    pub(crate) key_selector: Box<dyn KeySelector>,
    pub(crate) partitioner: Box<dyn Partitioner>,
    pub(crate) processor: Box<dyn BatchProcessor>,
    pub(crate) flusher: Box<dyn OffsetFlusher>,
    pub(crate) error_handler: Box<dyn ErrorHandler>,
    pub(crate) liveness: LivenessGate,
}

impl Shared {
    pub(crate) fn new(config: FanoutConfig, components: Components) -> Self {
        let lanes = (0..config.lane_count)
            .map(|_| BoundedQueue::new(config.lane_queue_capacity()))
            .collect();
        let markers = BoundedQueue::new(config.marker_queue_capacity());
        Self {
            running: AtomicBool::new(true),
            liveness: components.liveness,
            lanes,
            markers,
            key_selector: components.key_selector,
            partitioner: components.partitioner,
            processor: components.processor,
            flusher: components.flusher,
            error_handler: components.error_handler,
            metrics: FanoutMetrics::new(),
            next_marker_id: AtomicU64::new(0),
            next_seq: AtomicU64::new(0),
            last_watermark: AtomicU64::new(0),
            flushed_watermark: Mutex::new(0),
            checkpoint_flushed: Condvar::new(),
            config,
        }
    }

    pub(crate) fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// True while neither a stop nor a failure has happened and the external
    /// gate is open.
    ///
    /// A closed gate latches the running flag off; reopening it later does not
    /// bring the processor back.
    pub(crate) fn is_running(&self) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        if (self.liveness)() {
            return true;
        }
        if self.halt() {
            tracing::info!(name = %self.config.name, "liveness gate closed, stopping processor");
        }
        false
    }

    /// Clears the running flag. Returns true if this call cleared it.
    pub(crate) fn halt(&self) -> bool {
        self.running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Stops the pipeline and reports `error`.
    ///
    /// Only the first failure flips the flag; every failure is reported.
    pub(crate) fn fail(&self, error: &FanoutError, context: &str) {
        if !self.halt() {
            tracing::debug!(error = %error, "failure reported after the processor stopped");
        }
        self.metrics.record_failure();
        self.error_handler.on_error(error, context);
    }

    /// Assigns the next intake sequence number (starting at 1).
    pub(crate) fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn next_marker_id(&self) -> u64 {
        self.next_marker_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Enqueues onto `lane`, retrying on timeout while running.
    ///
    /// Returns false if the processor stopped before the item was accepted.
    pub(crate) fn offer_blocking(&self, lane: usize, mut marker: PartitionMarker) -> bool {
        let queue = &self.lanes[lane];
        loop {
            if !self.is_running() {
                return false;
            }
            match queue.offer_timeout(marker, self.config.poll_timeout) {
                Ok(()) => return true,
                Err(rejected) => {
                    self.metrics.record_enqueue_timeout();
                    tracing::debug!(lane, "lane queue is full, waiting for enqueue");
                    marker = rejected;
                }
            }
        }
    }

    /// Pushes a barrier onto every lane queue and returns it.
    ///
    /// Broadcasting stops early if the processor stops; waiters on the
    /// returned barrier re-check the running state and give up too.
    pub(crate) fn broadcast_barrier(&self) -> Arc<BarrierMarker> {
        let barrier = Arc::new(BarrierMarker::new(self.next_marker_id(), self.lane_count()));
        self.metrics.record_barrier();
        for lane in 0..self.lane_count() {
            if !self.offer_blocking(lane, PartitionMarker::Barrier(Arc::clone(&barrier))) {
                break;
            }
        }
        barrier
    }

    /// Pushes a watermark for `event` onto every lane queue and the
    /// coordinator's queue.
    pub(crate) fn broadcast_watermark(&self, event: ChangeEvent) -> Arc<WatermarkMarker> {
        let watermark = Arc::new(WatermarkMarker::new(
            self.next_marker_id(),
            self.lane_count(),
            event,
        ));
        self.metrics.record_watermark();
        self.last_watermark.store(watermark.id(), Ordering::Release);
        for lane in 0..self.lane_count() {
            if !self.offer_blocking(lane, PartitionMarker::Watermark(Arc::clone(&watermark))) {
                return watermark;
            }
        }

        let mut pending = Arc::clone(&watermark);
        while self.is_running() {
            match self.markers.offer_timeout(pending, self.config.poll_timeout) {
                Ok(()) => break,
                Err(rejected) => {
                    self.metrics.record_enqueue_timeout();
                    tracing::info!(id = watermark.id(), "watermark queue is full, waiting for enqueue");
                    pending = rejected;
                }
            }
        }
        watermark
    }

    /// Blocks until every lane reached `barrier` or the processor stopped.
    ///
    /// Returns true if the barrier completed.
    pub(crate) fn wait_for_barrier(&self, barrier: &BarrierMarker) -> bool {
        while self.is_running() {
            if barrier.wait_timeout(self.config.poll_timeout) {
                return true;
            }
            tracing::info!(
                id = barrier.id(),
                pending_lanes = barrier.pending_lanes(),
                "waiting for all lanes to process queued events"
            );
        }
        barrier.is_complete()
    }

    /// Records that the checkpoint for watermark `id` was flushed.
    pub(crate) fn record_flushed(&self, id: u64) {
        self.metrics.record_checkpoint();
        let mut flushed = self.flushed_watermark.lock();
        *flushed = (*flushed).max(id);
        drop(flushed);
        self.checkpoint_flushed.notify_all();
    }

    /// Blocks until every watermark broadcast so far has been flushed or the
    /// processor stopped.
    ///
    /// Returns true if all checkpoints were flushed.
    pub(crate) fn wait_for_checkpoints(&self) -> bool {
        let target = self.last_watermark.load(Ordering::Acquire);
        let mut flushed = self.flushed_watermark.lock();
        while *flushed < target {
            if !self.is_running() {
                return false;
            }
            if self
                .checkpoint_flushed
                .wait_for(&mut flushed, self.config.poll_timeout)
                .timed_out()
            {
                tracing::info!(
                    target_id = target,
                    flushed_id = *flushed,
                    "waiting for pending checkpoints to flush"
                );
            }
        }
        true
    }

    pub(crate) fn queue_depths(&self) -> Vec<usize> {
        self.lanes.iter().map(BoundedQueue::len).collect()
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("name", &self.config.name)
            .field("lane_count", &self.lane_count())
            .field("running", &self.running.load(Ordering::Acquire))
            .field("queue_depths", &self.queue_depths())
            .field("pending_watermarks", &self.markers.len())
            .finish_non_exhaustive()
    }
}
