//! Callbacks injected into the processor.
//!
//! - [`BatchProcessor`]: handles a lane's batch of data events
//! - [`OffsetFlusher`]: persists the source position of a completed checkpoint
//! - [`ErrorHandler`]: the single notification surface for runtime failures
//!
//! Each trait has a blanket impl for closures, so small pipelines and tests can
//! pass a function directly.
//!
//! # Panic Safety
//!
//! Workers invoke `process` and `flush` under [`std::panic::catch_unwind`]; a
//! panicking callback is reported as [`FanoutError::Panicked`] and stops the
//! pipeline like a returned error would.

use crate::error::{CallbackError, FanoutError};
use crate::event::ChangeEvent;

/// Processes one lane's batch of data events.
///
/// Called from a single lane worker thread at a time per lane, possibly from
/// several lanes concurrently. Events arrive in lane FIFO order.
pub trait BatchProcessor: Send + Sync {
    /// Processes a non-empty batch.
    ///
    /// # Errors
    ///
    /// Any error stops the pipeline.
    fn process(&self, events: Vec<ChangeEvent>) -> Result<(), CallbackError>;
}

impl<F> BatchProcessor for F
where
    F: Fn(Vec<ChangeEvent>) -> Result<(), CallbackError> + Send + Sync,
{
    fn process(&self, events: Vec<ChangeEvent>) -> Result<(), CallbackError> {
        self(events)
    }
}

/// Persists the source position of a completed checkpoint.
///
/// Only called from the checkpoint coordinator, in watermark order.
pub trait OffsetFlusher: Send + Sync {
    /// Flushes the offset of `event`, the last event of the checkpointed batch.
    ///
    /// # Errors
    ///
    /// Any error stops the pipeline.
    fn flush(&self, event: &ChangeEvent) -> Result<(), CallbackError>;
}

impl<F> OffsetFlusher for F
where
    F: Fn(&ChangeEvent) -> Result<(), CallbackError> + Send + Sync,
{
    fn flush(&self, event: &ChangeEvent) -> Result<(), CallbackError> {
        self(event)
    }
}

/// Receives runtime failures.
pub trait ErrorHandler: Send + Sync {
    /// Called with the failure and a one-line context.
    fn on_error(&self, error: &FanoutError, context: &str);

    /// Chains `next` after this handler; both see every error.
    #[must_use]
    fn and_then<H>(self, next: H) -> ChainedErrorHandler<Self, H>
    where
        Self: Sized,
        H: ErrorHandler,
    {
        ChainedErrorHandler { first: self, next }
    }
}

impl<F> ErrorHandler for F
where
    F: Fn(&FanoutError, &str) + Send + Sync,
{
    fn on_error(&self, error: &FanoutError, context: &str) {
        self(error, context);
    }
}

/// Two handlers invoked in order. Built with [`ErrorHandler::and_then`].
#[derive(Debug)]
pub struct ChainedErrorHandler<A, B> {
    first: A,
    next: B,
}

impl<A: ErrorHandler, B: ErrorHandler> ErrorHandler for ChainedErrorHandler<A, B> {
    fn on_error(&self, error: &FanoutError, context: &str) {
        self.first.on_error(error, context);
        self.next.on_error(error, context);
    }
}

/// Default handler: logs at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingErrorHandler;

impl ErrorHandler for LoggingErrorHandler {
    fn on_error(&self, error: &FanoutError, context: &str) {
        tracing::error!(error = %error, "{context}");
    }
}
