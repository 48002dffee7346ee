//! Error types for the partitioned processor.
//!
//! - `FanoutError`: every failure the processor reports, either returned from
//!   the caller-facing API or handed to the injected error handler
//! - `CallbackError`: the boxed error type injected callbacks return

use thiserror::Error;

/// Error returned by injected callbacks (batch processor, offset flusher).
pub type CallbackError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for processor operations.
pub type Result<T> = std::result::Result<T, FanoutError>;

/// Errors produced by the partitioned processor.
#[derive(Debug, Error)]
pub enum FanoutError {
    /// Invalid processor configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A required strategy or callback was not supplied to the builder.
    #[error("missing required component: {0}")]
    MissingComponent(&'static str),

    /// `submit` was called before the lane workers were started.
    #[error("processor has not been started")]
    NotStarted,

    /// `start` was called more than once.
    #[error("processor is already started")]
    AlreadyStarted,

    /// The processor was stopped, failed, or the pipeline gate is closed.
    #[error("processor is not running")]
    NotRunning,

    /// A worker thread could not be spawned.
    #[error("failed to spawn worker {worker}: {message}")]
    SpawnFailed {
        /// Name of the worker thread.
        worker: String,
        /// Error message from the OS.
        message: String,
    },

    /// The batch processor returned an error.
    #[error("lane {lane} batch processing failed: {source}")]
    Processing {
        /// The lane whose batch failed.
        lane: usize,
        /// The callback's error.
        #[source]
        source: CallbackError,
    },

    /// The offset flusher returned an error.
    #[error("offset flush failed: {source}")]
    Flush {
        /// The callback's error.
        #[source]
        source: CallbackError,
    },

    /// An injected callback panicked.
    #[error("worker {worker} panicked: {message}")]
    Panicked {
        /// Name of the worker that caught the panic.
        worker: String,
        /// The panic payload, if it was a string.
        message: String,
    },
}

impl FanoutError {
    /// Returns true for errors raised while validating or assembling the processor.
    #[must_use]
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::InvalidConfig(_) | Self::MissingComponent(_))
    }
}

/// Extracts a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
