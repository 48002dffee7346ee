//! Lane worker loop.
//!
//! Each lane worker owns the read side of one lane queue:
//!
//! ```text
//! loop while running:
//!   drain up to batch_size markers (bounded wait)
//!   for each marker, in order:
//!     Data       -> pending.push(event)
//!     Watermark  -> flush pending, acknowledge
//!     Barrier    -> flush pending, acknowledge, wait for every lane
//!   flush pending
//! ```
//!
//! Pending data is always handed to the batch processor before a control
//! marker is acknowledged, so an acknowledged watermark or barrier means every
//! event queued ahead of it on this lane has been processed.

use std::panic::{self, AssertUnwindSafe};

use crate::error::{panic_message, FanoutError};
use crate::event::ChangeEvent;
use crate::marker::{BarrierMarker, PartitionMarker};
use crate::shared::Shared;

/// Runs lane `lane` until the processor stops.
pub(crate) fn run_lane(shared: &Shared, lane: usize) {
    let worker = shared.config.lane_thread_name(lane);
    let batch_size = shared.config.batch_size;
    let mut drained = Vec::with_capacity(batch_size);
    let mut pending: Vec<ChangeEvent> = Vec::with_capacity(batch_size);

    tracing::debug!(lane, "lane worker started");
    while shared.is_running() {
        if shared.lanes[lane].drain_timeout(&mut drained, batch_size, shared.config.poll_timeout)
            == 0
        {
            continue;
        }

        for marker in drained.drain(..) {
            match marker {
                PartitionMarker::Data(event) => pending.push(event),
                PartitionMarker::Watermark(watermark) => {
                    flush_pending(shared, lane, &worker, &mut pending);
                    watermark.acknowledge();
                }
                PartitionMarker::Barrier(barrier) => {
                    flush_pending(shared, lane, &worker, &mut pending);
                    barrier.acknowledge();
                    await_barrier(shared, lane, &barrier);
                }
            }
        }
        flush_pending(shared, lane, &worker, &mut pending);
    }
    tracing::debug!(lane, "lane worker exiting");
}

fn await_barrier(shared: &Shared, lane: usize, barrier: &BarrierMarker) {
    while shared.is_running() && !barrier.wait_timeout(shared.config.poll_timeout) {
        tracing::debug!(
            lane,
            id = barrier.id(),
            pending_lanes = barrier.pending_lanes(),
            "lane reached barrier, waiting for other lanes"
        );
    }
}

/// Hands `pending` to the batch processor.
///
/// Does nothing for an empty batch. Once the processor has stopped the batch
/// is abandoned, so no new batch starts after a stop.
fn flush_pending(shared: &Shared, lane: usize, worker: &str, pending: &mut Vec<ChangeEvent>) {
    if pending.is_empty() {
        return;
    }
    if !shared.is_running() {
        tracing::debug!(lane, abandoned = pending.len(), "processor stopped, dropping pending batch");
        pending.clear();
        return;
    }

    let batch = std::mem::take(pending);
    let count = batch.len();
    let result = panic::catch_unwind(AssertUnwindSafe(|| shared.processor.process(batch)));
    match result {
        Ok(Ok(())) => shared.metrics.record_batch(count),
        Ok(Err(source)) => shared.fail(
            &FanoutError::Processing { lane, source },
            &format!("lane {lane} failed to process batch"),
        ),
        Err(payload) => shared.fail(
            &FanoutError::Panicked {
                worker: worker.to_string(),
                message: panic_message(payload.as_ref()),
            },
            &format!("lane {lane} failed to process batch"),
        ),
    }
}
