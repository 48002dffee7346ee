//! # Partitioned Processor
//!
//! The caller-facing side of the fan-out: the dispatcher that classifies and
//! routes events, and the lifecycle of the worker pool.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────────────────────────────────────┐
//!   submit() ───> │ dispatcher: classify, barrier?, route, seq    │
//!                 └───────┬──────────────┬──────────────┬────────┘
//!                         ▼              ▼              ▼
//!                   ┌──────────┐   ┌──────────┐   ┌──────────┐
//!                   │  lane 0  │   │  lane 1  │   │  lane N  │   bounded FIFOs
//!                   └────┬─────┘   └────┬─────┘   └────┬─────┘
//!                        ▼              ▼              ▼
//!                   lane worker    lane worker    lane worker ──> BatchProcessor
//!                        │ ack          │ ack          │ ack
//!                        └──────────────┼──────────────┘
//!                                       ▼
//!                           checkpoint coordinator ──> OffsetFlusher
//! ```
//!
//! The pool is exactly `lane_count + 1` threads. The coordinator is spawned
//! when the processor is built; lane workers are spawned by [`PartitionedProcessor::start`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use laminar_fanout::{
//!     CallbackError, ChangeEvent, FanoutConfig, FieldKeySelector, HashPartitioner,
//!     PartitionedProcessor,
//! };
//!
//! let config = FanoutConfig::builder().lane_count(4).batch_size(100).build()?;
//! let processor = PartitionedProcessor::builder(config)
//!     .key_selector(FieldKeySelector::new(["id"]))
//!     .partitioner(HashPartitioner)
//!     .batch_processor(|events: Vec<ChangeEvent>| -> Result<(), CallbackError> {
//!         println!("processing {} events", events.len());
//!         Ok(())
//!     })
//!     .offset_flusher(|event: &ChangeEvent| -> Result<(), CallbackError> {
//!         println!("checkpoint at {:?}", event.position);
//!         Ok(())
//!     })
//!     .build()?;
//!
//! processor.start()?;
//! processor.submit(vec![ChangeEvent::heartbeat()], true)?;
//! processor.stop();
//! # Ok::<(), laminar_fanout::FanoutError>(())
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::callback::{BatchProcessor, ErrorHandler, LoggingErrorHandler, OffsetFlusher};
use crate::config::FanoutConfig;
use crate::coordinator::run_coordinator;
use crate::error::{FanoutError, Result};
use crate::event::{ChangeEvent, ChangeKind, Row};
use crate::marker::PartitionMarker;
use crate::metrics::FanoutMetricsSnapshot;
use crate::partition::{resolve_lane, KeySelector, Partitioner, DEFAULT_LANE};
use crate::shared::{Components, LivenessGate, Shared};
use crate::worker::run_lane;

/// Interval at which shutdown re-checks unfinished workers.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Result of a [`PartitionedProcessor::submit`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitOutcome {
    /// Events enqueued onto a lane.
    pub accepted: usize,
    /// True if the processor stopped during the call, so either not every
    /// event was accepted or the synchronous wait was cut short.
    pub stopped_early: bool,
}

struct Worker {
    name: String,
    handle: JoinHandle<()>,
}

/// Fans an ordered stream of change events out across parallel lanes.
///
/// See the [module documentation](self) for the overall design.
pub struct PartitionedProcessor {
    shared: Arc<Shared>,
    workers: Mutex<Vec<Worker>>,
    /// Serializes intake so a batch and its watermark are never interleaved
    /// with another caller's markers.
    intake: Mutex<()>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl PartitionedProcessor {
    /// Creates a builder for a processor with the given configuration.
    #[must_use]
    pub fn builder(config: FanoutConfig) -> ProcessorBuilder {
        ProcessorBuilder::new(config)
    }

    fn new(config: FanoutConfig, components: Components) -> Result<Self> {
        config.validate()?;
        let pool_size = config.lane_count + 1;
        let processor = Self {
            shared: Arc::new(Shared::new(config, components)),
            workers: Mutex::new(Vec::with_capacity(pool_size)),
            intake: Mutex::new(()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        };

        let name = processor.shared.config.coordinator_thread_name();
        processor.spawn_worker(name, None, run_coordinator)?;
        tracing::info!(
            name = %processor.shared.config.name,
            pool_size,
            "created partitioned processor"
        );
        Ok(processor)
    }

    /// Spawns the lane workers.
    ///
    /// # Errors
    ///
    /// Returns `FanoutError::AlreadyStarted` on a second call,
    /// `FanoutError::NotRunning` if the processor was already stopped, or
    /// `FanoutError::SpawnFailed` if a thread could not be created (the
    /// processor is stopped in that case).
    pub fn start(&self) -> Result<()> {
        if !self.shared.is_running() {
            return Err(FanoutError::NotRunning);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(FanoutError::AlreadyStarted);
        }

        for lane in 0..self.lane_count() {
            let name = self.shared.config.lane_thread_name(lane);
            if let Err(e) = self.spawn_worker(name, Some(lane), move |shared| run_lane(shared, lane)) {
                self.shared.halt();
                return Err(e);
            }
        }
        tracing::info!(
            name = %self.shared.config.name,
            lanes = self.lane_count(),
            "started lane workers"
        );
        Ok(())
    }

    fn spawn_worker<F>(&self, name: String, lane: Option<usize>, body: F) -> Result<()>
    where
        F: FnOnce(&Shared) + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        let processor_name = self.shared.config.name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let span = tracing::info_span!("fanout_worker", processor = %processor_name, lane);
                let _entered = span.enter();
                body(shared.as_ref());
            })
            .map_err(|e| FanoutError::SpawnFailed {
                worker: name.clone(),
                message: e.to_string(),
            })?;
        self.workers.lock().push(Worker { name, handle });
        Ok(())
    }

    /// Submits a batch of events.
    ///
    /// Events are routed in input order. A non-DML event, or an update whose
    /// partition key changes, is preceded by a barrier. After the batch a
    /// watermark referencing its last event is broadcast. With `synchronous`
    /// set, the call returns only after every lane has processed everything
    /// submitted so far.
    ///
    /// Blocks while a target lane queue is full. If the processor stops
    /// midway, the rest of the batch is skipped and reported through
    /// [`SubmitOutcome::stopped_early`].
    ///
    /// # Errors
    ///
    /// Returns `FanoutError::NotStarted` before [`start`](Self::start), or
    /// `FanoutError::NotRunning` if the processor had already stopped.
    pub fn submit(&self, events: Vec<ChangeEvent>, synchronous: bool) -> Result<SubmitOutcome> {
        if !self.started.load(Ordering::Acquire) {
            return Err(FanoutError::NotStarted);
        }
        if events.is_empty() {
            return Ok(SubmitOutcome {
                accepted: 0,
                stopped_early: false,
            });
        }
        if !self.shared.is_running() {
            return Err(FanoutError::NotRunning);
        }

        let _intake = self.intake.lock();
        let total = events.len();
        let mut accepted = 0;
        let mut reference = None;

        for mut event in events {
            if !self.shared.is_running() {
                break;
            }
            let lane = self.route(&event);
            event.seq = self.shared.next_seq();
            if accepted + 1 == total {
                reference = Some(event.clone());
            }
            if !self.shared.offer_blocking(lane, PartitionMarker::Data(event)) {
                break;
            }
            self.shared.metrics.record_submitted();
            accepted += 1;
        }

        if let Some(event) = reference {
            if self.shared.is_running() {
                self.shared.broadcast_watermark(event);
            }
        }

        let mut completed = accepted == total;
        if synchronous && self.shared.is_running() {
            let barrier = self.shared.broadcast_barrier();
            completed &= self.shared.wait_for_barrier(&barrier);
        }

        Ok(SubmitOutcome {
            accepted,
            stopped_early: !completed || !self.shared.is_running(),
        })
    }

    /// Picks the lane for `event`, broadcasting a barrier first when the
    /// event needs one.
    fn route(&self, event: &ChangeEvent) -> usize {
        let shared = &self.shared;
        if !event.is_dml() {
            shared.broadcast_barrier();
            return DEFAULT_LANE;
        }
        let row = match event.kind {
            ChangeKind::Update if self.key_changed(event) => {
                shared.broadcast_barrier();
                event.before_row()
            }
            ChangeKind::Delete => event.before_row(),
            _ => event.after_row(),
        };

        let empty = Row::new();
        let key = shared.key_selector.select(event, row.unwrap_or(&empty));
        let key = shared.key_selector.to_origin_values(key);
        let lane_count = self.lane_count();
        resolve_lane(shared.partitioner.partition(lane_count, event, &key), lane_count)
    }

    /// True if both images of an update are present and select different keys.
    fn key_changed(&self, event: &ChangeEvent) -> bool {
        match (event.before_row(), event.after_row()) {
            (Some(before), Some(after)) => {
                let selector = &self.shared.key_selector;
                selector.select(event, before) != selector.select(event, after)
            }
            _ => false,
        }
    }

    /// Drains everything queued and flushes every pending checkpoint, then
    /// stops and shuts the pool down.
    ///
    /// Must not be called from inside a callback; use
    /// [`force_stop`](Self::force_stop) there. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.started.load(Ordering::Acquire) && self.shared.is_running() {
            let _intake = self.intake.lock();
            let barrier = self.shared.broadcast_barrier();
            if self.shared.wait_for_barrier(&barrier) {
                self.shared.wait_for_checkpoints();
            }
        }
        self.shared.halt();
        self.shutdown_workers();
        tracing::info!(name = %self.shared.config.name, "stopped partitioned processor");
    }

    /// Stops immediately without draining, then shuts the pool down.
    ///
    /// Batches already inside a callback run to completion; no new batch
    /// starts. Idempotent.
    pub fn force_stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.halt();
        self.shutdown_workers();
        tracing::info!(name = %self.shared.config.name, "force stopped partitioned processor");
    }

    /// Joins workers until the grace period elapses; stragglers are detached.
    fn shutdown_workers(&self) {
        let mut workers = std::mem::take(&mut *self.workers.lock());
        let current = thread::current().id();
        workers.retain(|w| w.handle.thread().id() != current);

        let deadline = Instant::now() + self.shared.config.shutdown_grace;
        loop {
            let (finished, running): (Vec<_>, Vec<_>) =
                workers.into_iter().partition(|w| w.handle.is_finished());
            for worker in finished {
                if worker.handle.join().is_err() {
                    tracing::warn!(worker = %worker.name, "worker thread panicked");
                }
            }
            workers = running;
            if workers.is_empty() {
                return;
            }

            let now = Instant::now();
            if now >= deadline {
                for worker in &workers {
                    tracing::warn!(
                        worker = %worker.name,
                        grace = ?self.shared.config.shutdown_grace,
                        "worker still running after shutdown grace period, detaching"
                    );
                }
                return;
            }
            thread::sleep(SHUTDOWN_POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Returns true until the processor stops or fails, and while the
    /// liveness gate is open.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Returns the number of lanes.
    #[must_use]
    pub fn lane_count(&self) -> usize {
        self.shared.lane_count()
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &FanoutConfig {
        &self.shared.config
    }

    /// Returns a snapshot of the processor's counters.
    #[must_use]
    pub fn metrics(&self) -> FanoutMetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Returns the number of markers queued per lane.
    #[must_use]
    pub fn queue_depths(&self) -> Vec<usize> {
        self.shared.queue_depths()
    }
}

impl Drop for PartitionedProcessor {
    fn drop(&mut self) {
        self.force_stop();
    }
}

impl fmt::Debug for PartitionedProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionedProcessor")
            .field("shared", &self.shared)
            .field("started", &self.started.load(Ordering::Acquire))
            .field("stopped", &self.stopped.load(Ordering::Acquire))
            .field("workers", &self.workers.lock().len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`PartitionedProcessor`].
///
/// The key selector, partitioner, batch processor and offset flusher are
/// required. The error handler defaults to [`LoggingErrorHandler`] and the
/// liveness gate to always-open.
pub struct ProcessorBuilder {
    config: FanoutConfig,
    key_selector: Option<Box<dyn KeySelector>>,
    partitioner: Option<Box<dyn Partitioner>>,
    processor: Option<Box<dyn BatchProcessor>>,
    flusher: Option<Box<dyn OffsetFlusher>>,
    error_handler: Option<Box<dyn ErrorHandler>>,
    liveness: Option<LivenessGate>,
}

impl ProcessorBuilder {
    /// Creates a builder with the given configuration.
    #[must_use]
    pub fn new(config: FanoutConfig) -> Self {
        Self {
            config,
            key_selector: None,
            partitioner: None,
            processor: None,
            flusher: None,
            error_handler: None,
            liveness: None,
        }
    }

    /// Sets the key selector.
    #[must_use]
    pub fn key_selector(mut self, selector: impl KeySelector + 'static) -> Self {
        self.key_selector = Some(Box::new(selector));
        self
    }

    /// Sets the partitioner.
    #[must_use]
    pub fn partitioner(mut self, partitioner: impl Partitioner + 'static) -> Self {
        self.partitioner = Some(Box::new(partitioner));
        self
    }

    /// Sets the callback that processes a lane's batch.
    #[must_use]
    pub fn batch_processor(mut self, processor: impl BatchProcessor + 'static) -> Self {
        self.processor = Some(Box::new(processor));
        self
    }

    /// Sets the callback that flushes a checkpoint's offset.
    #[must_use]
    pub fn offset_flusher(mut self, flusher: impl OffsetFlusher + 'static) -> Self {
        self.flusher = Some(Box::new(flusher));
        self
    }

    /// Sets the error handler.
    #[must_use]
    pub fn error_handler(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.error_handler = Some(Box::new(handler));
        self
    }

    /// Sets an external liveness gate checked alongside the processor's own
    /// running state, e.g. the enclosing pipeline node's.
    #[must_use]
    pub fn liveness(mut self, gate: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.liveness = Some(Box::new(gate));
        self
    }

    /// Builds the processor and spawns its checkpoint coordinator.
    ///
    /// # Errors
    ///
    /// Returns `FanoutError::MissingComponent` if a required strategy or
    /// callback is missing, `FanoutError::InvalidConfig` for an invalid
    /// configuration, or `FanoutError::SpawnFailed` if the coordinator thread
    /// could not be created.
    pub fn build(self) -> Result<PartitionedProcessor> {
        let components = Components {
            key_selector: self
                .key_selector
                .ok_or(FanoutError::MissingComponent("key_selector"))?,
            partitioner: self
                .partitioner
                .ok_or(FanoutError::MissingComponent("partitioner"))?,
            processor: self
                .processor
                .ok_or(FanoutError::MissingComponent("batch_processor"))?,
            flusher: self
                .flusher
                .ok_or(FanoutError::MissingComponent("offset_flusher"))?,
            error_handler: self
                .error_handler
                .unwrap_or_else(|| Box::new(LoggingErrorHandler)),
            liveness: self.liveness.unwrap_or_else(|| Box::new(|| true)),
        };
        PartitionedProcessor::new(self.config, components)
    }
}

impl fmt::Debug for ProcessorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorBuilder")
            .field("config", &self.config)
            .field("key_selector", &self.key_selector.is_some())
            .field("partitioner", &self.partitioner.is_some())
            .field("batch_processor", &self.processor.is_some())
            .field("offset_flusher", &self.flusher.is_some())
            .field("error_handler", &self.error_handler.is_some())
            .field("liveness", &self.liveness.is_some())
            .finish()
    }
}
