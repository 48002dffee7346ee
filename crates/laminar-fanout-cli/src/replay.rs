//! Replays a JSON-lines file of change events through a partitioned processor.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use laminar_fanout::{
    CallbackError, ChangeEvent, ErrorHandler, FanoutConfig, FanoutError, FanoutMetricsSnapshot,
    FieldKeySelector, HashPartitioner, LoggingErrorHandler, PartitionedProcessor,
};
use parking_lot::Mutex;
use tracing::{debug, info};

/// How to run a replay.
#[derive(Debug, Clone)]
pub struct ReplayOptions {
    /// Number of lanes; `None` uses one per CPU.
    pub lanes: Option<usize>,
    /// Events per submission, also the lane drain size.
    pub batch_size: usize,
    /// Row fields forming the partition key.
    pub keys: Vec<String>,
    /// Wait for every submission to be fully processed.
    pub synchronous: bool,
    /// Bounded wait for blocking calls.
    pub poll_timeout: Duration,
}

/// What a replay did.
#[derive(Debug, Clone)]
pub struct ReplaySummary {
    /// Events processed per worker thread.
    pub per_worker: BTreeMap<String, usize>,
    /// Source positions of flushed checkpoints, in flush order.
    pub checkpoints: Vec<Option<String>>,
    /// Processor counters after shutdown.
    pub metrics: FanoutMetricsSnapshot,
}

/// Reads change events, one JSON object per line. Blank lines are skipped.
pub fn read_events(path: &Path) -> Result<Vec<ChangeEvent>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut events = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let event: ChangeEvent = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid change event", path.display(), index + 1))?;
        events.push(event);
    }
    Ok(events)
}

/// Runs `events` through a processor and stops it gracefully.
pub fn replay(events: Vec<ChangeEvent>, options: &ReplayOptions) -> Result<ReplaySummary> {
    let mut builder = FanoutConfig::builder()
        .batch_size(options.batch_size)
        .poll_timeout(options.poll_timeout)
        .name("replay");
    if let Some(lanes) = options.lanes {
        builder = builder.lane_count(lanes);
    }
    let config = builder.build()?;
    if options.keys.is_empty() {
        bail!("at least one --key field is required");
    }

    let per_worker = Arc::new(Mutex::new(BTreeMap::new()));
    let checkpoints = Arc::new(Mutex::new(Vec::new()));
    let first_error = Arc::new(Mutex::new(None));

    let worker_counts = Arc::clone(&per_worker);
    let flushed = Arc::clone(&checkpoints);
    let failure = Arc::clone(&first_error);

    let processor = PartitionedProcessor::builder(config)
        .key_selector(FieldKeySelector::new(options.keys.iter().cloned()))
        .partitioner(HashPartitioner)
        .batch_processor(move |batch: Vec<ChangeEvent>| -> Result<(), CallbackError> {
            let worker = thread::current().name().unwrap_or("unnamed").to_string();
            debug!(worker = %worker, events = batch.len(), "processing batch");
            *worker_counts.lock().entry(worker).or_insert(0) += batch.len();
            Ok(())
        })
        .offset_flusher(move |event: &ChangeEvent| -> Result<(), CallbackError> {
            info!(seq = event.seq, position = ?event.position, "checkpoint flushed");
            flushed.lock().push(event.position.clone());
            Ok(())
        })
        .error_handler(LoggingErrorHandler.and_then(
            move |error: &FanoutError, context: &str| {
                failure
                    .lock()
                    .get_or_insert_with(|| format!("{context}: {error}"));
            },
        ))
        .build()?;
    processor.start()?;

    let total = events.len();
    let mut submitted = 0;
    let mut remaining = events.into_iter().peekable();
    while remaining.peek().is_some() {
        let batch: Vec<ChangeEvent> = remaining.by_ref().take(options.batch_size).collect();
        let outcome = processor.submit(batch, options.synchronous)?;
        submitted += outcome.accepted;
        if outcome.stopped_early {
            break;
        }
    }
    processor.stop();

    if let Some(error) = first_error.lock().take() {
        bail!("replay failed after {submitted} of {total} events: {error}");
    }

    let summary = ReplaySummary {
        per_worker: per_worker.lock().clone(),
        checkpoints: checkpoints.lock().clone(),
        metrics: processor.metrics(),
    };
    Ok(summary)
}
