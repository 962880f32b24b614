//! Error types for the stage engine.

use std::error::Error;
use thiserror::Error;

/// Boxed error returned by transformation functions.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Failures the engine itself can observe while running a stage.
///
/// Per-item variants are handed to the stage's
/// [`ErrorPolicy`](super::policy::ErrorPolicy); they never stop a worker.
#[derive(Debug, Error)]
pub enum StageError {
    /// The transformation returned an error for one item or invocation.
    #[error("{stage}: error applying function: {source}")]
    ItemFailed {
        stage: String,
        #[source]
        source: BoxError,
    },

    /// The transformation panicked for one item or invocation.
    #[error("{stage}: function panicked: {message}")]
    Panicked { stage: String, message: String },

    /// `start()` was called on a stage whose workers are already running.
    #[error("{0}: stage already started")]
    AlreadyStarted(String),

    /// A worker could not be spawned or joined.
    #[error("{stage}: worker join failed: {message}")]
    Join { stage: String, message: String },
}

impl StageError {
    pub(crate) fn from_panic(stage: &str, payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        StageError::Panicked {
            stage: stage.to_string(),
            message,
        }
    }
}

/// Outcome of a channel operation that did not move an item.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    /// Nothing arrived before the timeout, or nothing is buffered.
    #[error("channel is empty")]
    Empty,

    /// Every receiver or sender handle is gone.
    #[error("channel is closed")]
    Closed,
}
