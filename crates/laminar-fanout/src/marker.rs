//! Markers carried on lane queues.
//!
//! A lane queue carries data events interleaved with two control markers:
//!
//! - [`BarrierMarker`]: rendezvous. Every lane flushes what it holds,
//!   acknowledges, and waits until all lanes have acknowledged before reading
//!   further.
//! - [`WatermarkMarker`]: checkpoint. Every lane flushes what it holds and
//!   acknowledges without waiting; the checkpoint coordinator waits for all
//!   acknowledgements and then flushes the reference event's offset.
//!
//! Control markers are broadcast as one shared `Arc` per broadcast, so the
//! countdown they carry is the only state several lane workers mutate.

use std::sync::Arc;
use std::time::Duration;

use crate::countdown::Countdown;
use crate::event::ChangeEvent;

/// A rendezvous point broadcast to every lane.
#[derive(Debug)]
pub struct BarrierMarker {
    id: u64,
    countdown: Countdown,
}

impl BarrierMarker {
    /// Creates a barrier expecting `lane_count` acknowledgements.
    #[must_use]
    pub fn new(id: u64, lane_count: usize) -> Self {
        Self {
            id,
            countdown: Countdown::new(lane_count),
        }
    }

    /// Broadcast id, unique per processor.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Records that one lane has reached the barrier.
    pub fn acknowledge(&self) -> bool {
        self.countdown.count_down()
    }

    /// Lanes that have not reached the barrier yet.
    #[must_use]
    pub fn pending_lanes(&self) -> usize {
        self.countdown.remaining()
    }

    /// Returns true once every lane has reached the barrier.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.countdown.is_released()
    }

    /// Waits up to `timeout` for every lane to reach the barrier.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.countdown.wait_timeout(timeout)
    }
}

/// A checkpoint point broadcast to every lane and to the coordinator.
#[derive(Debug)]
pub struct WatermarkMarker {
    id: u64,
    countdown: Countdown,
    event: ChangeEvent,
}

impl WatermarkMarker {
    /// Creates a watermark for `event`, expecting `lane_count` acknowledgements.
    #[must_use]
    pub fn new(id: u64, lane_count: usize, event: ChangeEvent) -> Self {
        Self {
            id,
            countdown: Countdown::new(lane_count),
            event,
        }
    }

    /// Broadcast id, unique per processor.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The last event of the batch that produced this watermark.
    #[must_use]
    pub fn event(&self) -> &ChangeEvent {
        &self.event
    }

    /// Records that one lane has drained everything before the watermark.
    pub fn acknowledge(&self) -> bool {
        self.countdown.count_down()
    }

    /// Lanes that have not acknowledged yet.
    #[must_use]
    pub fn pending_lanes(&self) -> usize {
        self.countdown.remaining()
    }

    /// Returns true once every lane has acknowledged.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.countdown.is_released()
    }

    /// Waits up to `timeout` for every lane to acknowledge.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.countdown.wait_timeout(timeout)
    }
}

/// An item on a lane queue.
///
/// Lane workers match on this exhaustively; adding a kind forces a review
/// of the lane loop.
#[derive(Debug)]
pub enum PartitionMarker {
    /// A data event, delivered to its assigned lane only.
    Data(ChangeEvent),
    /// A rendezvous shared by all lanes.
    Barrier(Arc<BarrierMarker>),
    /// A checkpoint shared by all lanes and the coordinator.
    Watermark(Arc<WatermarkMarker>),
}
