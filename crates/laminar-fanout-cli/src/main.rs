//! `fanout-replay`: replays captured change events through a partitioned
//! processor and reports how they were spread across lanes.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod replay;

use replay::{read_events, replay, ReplayOptions};

/// Replay JSON-lines change events through a partitioned processor
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON-lines file with one change event per line
    #[arg(short, long)]
    input: PathBuf,

    /// Number of lanes (defaults to the CPU count)
    #[arg(long)]
    lanes: Option<usize>,

    /// Events per submission
    #[arg(long, default_value_t = 100)]
    batch_size: usize,

    /// Row field forming the partition key (repeatable)
    #[arg(short, long = "key", default_value = "id")]
    keys: Vec<String>,

    /// Wait for each submission to be fully processed
    #[arg(long)]
    sync: bool,

    /// Bounded wait for blocking calls, in milliseconds
    #[arg(long, default_value_t = 3000)]
    poll_timeout_ms: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "laminar_fanout={level},fanout_replay={level}",
                    level = args.log_level
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();

    let events = read_events(&args.input)?;
    info!(events = events.len(), input = %args.input.display(), "loaded change events");

    let options = ReplayOptions {
        lanes: args.lanes,
        batch_size: args.batch_size,
        keys: args.keys,
        synchronous: args.sync,
        poll_timeout: Duration::from_millis(args.poll_timeout_ms),
    };
    let summary = replay(events, &options)?;

    for (worker, count) in &summary.per_worker {
        println!("{worker}: {count} events");
    }
    let m = summary.metrics;
    println!(
        "submitted={} processed={} batches={} barriers={} watermarks={} checkpoints={} enqueue_timeouts={}",
        m.events_submitted,
        m.events_processed,
        m.batches_processed,
        m.barriers,
        m.watermarks,
        m.checkpoints_flushed,
        m.enqueue_timeouts,
    );
    if let Some(Some(position)) = summary.checkpoints.last() {
        println!("last checkpoint: {position}");
    }
    Ok(())
}
