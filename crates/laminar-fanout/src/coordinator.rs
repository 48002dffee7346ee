//! Checkpoint coordinator.
//!
//! A single worker that takes watermarks off the marker queue in broadcast
//! order, waits until every lane has acknowledged one, and then flushes the
//! offset of its reference event. Flushing strictly after all
//! acknowledgements means a persisted offset never covers an event that a
//! lane has not processed yet.

use std::panic::{self, AssertUnwindSafe};

use crate::error::{panic_message, FanoutError};
use crate::marker::WatermarkMarker;
use crate::shared::Shared;

const FLUSH_FAILED: &str = "process watermark event failed";

/// Runs the coordinator until the processor stops.
pub(crate) fn run_coordinator(shared: &Shared) {
    let worker = shared.config.coordinator_thread_name();
    tracing::debug!("checkpoint coordinator started");
    while shared.is_running() {
        let Some(watermark) = shared.markers.poll_timeout(shared.config.poll_timeout) else {
            continue;
        };
        if await_watermark(shared, &watermark) && shared.is_running() {
            flush(shared, &worker, &watermark);
        }
    }
    tracing::debug!("checkpoint coordinator exiting");
}

fn await_watermark(shared: &Shared, watermark: &WatermarkMarker) -> bool {
    while shared.is_running() {
        if watermark.wait_timeout(shared.config.poll_timeout) {
            return true;
        }
        tracing::info!(
            id = watermark.id(),
            source_ts_ms = ?watermark.event().source_ts_ms,
            pending_lanes = watermark.pending_lanes(),
            "waiting watermark event for all lanes to process"
        );
    }
    watermark.is_complete()
}

fn flush(shared: &Shared, worker: &str, watermark: &WatermarkMarker) {
    let event = watermark.event();
    let result = panic::catch_unwind(AssertUnwindSafe(|| shared.flusher.flush(event)));
    match result {
        Ok(Ok(())) => {
            shared.record_flushed(watermark.id());
            tracing::debug!(id = watermark.id(), seq = event.seq, "checkpoint flushed");
        }
        Ok(Err(source)) => shared.fail(&FanoutError::Flush { source }, FLUSH_FAILED),
        Err(payload) => shared.fail(
            &FanoutError::Panicked {
                worker: worker.to_string(),
                message: panic_message(payload.as_ref()),
            },
            FLUSH_FAILED,
        ),
    }
}
