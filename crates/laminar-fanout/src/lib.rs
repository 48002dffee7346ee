//! # `LaminarDB` Fan-out
//!
//! Partitioned concurrent processing for change-data-capture streams.
//!
//! A [`PartitionedProcessor`] fans one ordered stream of [`ChangeEvent`]s out
//! across N parallel lanes by partition key, while keeping two guarantees a
//! plain set of independent queues would lose:
//!
//! - **Ordering at key changes.** An update that moves a row to another
//!   partition, and every schema change or other non-row event, is fenced by
//!   a barrier: no lane advances past it until every lane has processed what
//!   came before.
//! - **Safe checkpoints.** Each submitted batch ends with a watermark. The
//!   offset of a batch is flushed only after every lane has processed every
//!   event queued ahead of that watermark.
//!
//! ## Modules
//!
//! - [`processor`] - Dispatcher and lifecycle (`PartitionedProcessor`)
//! - [`partition`] - Key selection and partitioning strategies
//! - [`callback`] - Injected batch processor, offset flusher, error handler
//! - [`marker`] - Data, barrier and watermark markers carried on lanes
//! - [`config`] - Processor configuration
//! - [`metrics`] - Atomic counters and snapshots
//!
//! ## Threads
//!
//! ```text
//! {name}-watermark   checkpoint coordinator, spawned on build
//! {name}-lane-0..N   lane workers, spawned on start
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![cfg_attr(
    test,
    allow(
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_sign_loss,
        clippy::needless_pass_by_value
    )
)]

/// Injected callbacks.
pub mod callback;

/// Processor configuration.
pub mod config;

/// One-shot acknowledgement countdown.
pub mod countdown;

/// Error types.
pub mod error;

/// Change events.
pub mod event;

/// Lane markers.
pub mod marker;

/// Processor metrics.
pub mod metrics;

/// Key selection and partitioning.
pub mod partition;

/// The partitioned processor.
pub mod processor;

/// Bounded blocking queue.
pub mod queue;

mod coordinator;
mod shared;
mod worker;

pub use callback::{BatchProcessor, ChainedErrorHandler, ErrorHandler, LoggingErrorHandler, OffsetFlusher};
pub use config::{FanoutConfig, FanoutConfigBuilder};
pub use error::{CallbackError, FanoutError, Result};
pub use event::{ChangeEvent, ChangeKind, KeyVector, Row};
pub use metrics::{FanoutMetrics, FanoutMetricsSnapshot};
pub use partition::{FieldKeySelector, HashPartitioner, KeySelector, Partitioner, RoundRobinPartitioner};
pub use processor::{PartitionedProcessor, ProcessorBuilder, SubmitOutcome};
