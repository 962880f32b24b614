//! What a stage does with an item whose transformation failed.
//!
//! The worker loops never decide this themselves: every failure goes to the
//! stage's [`ErrorPolicy`], and the loop moves on to the next item. The item
//! is never retried or requeued.

use super::channel::BoundedChannel;
use super::error::StageError;
use serde::Serialize;
use std::fmt;
use tracing::warn;

pub trait ErrorPolicy: Send + Sync + fmt::Debug {
    fn on_item_error(&self, error: StageError);
}

/// Log the failure and move on.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAndDrop;

impl ErrorPolicy for LogAndDrop {
    fn on_item_error(&self, error: StageError) {
        warn!(error = %error, "Error applying function; item dropped");
    }
}

/// One failed item, as recorded by [`DeadLetter`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetterRecord {
    pub stage: String,
    pub error: String,
}

impl From<&StageError> for DeadLetterRecord {
    fn from(error: &StageError) -> Self {
        let stage = match error {
            StageError::ItemFailed { stage, .. }
            | StageError::Panicked { stage, .. }
            | StageError::Join { stage, .. } => stage.clone(),
            StageError::AlreadyStarted(stage) => stage.clone(),
        };
        Self {
            stage,
            error: error.to_string(),
        }
    }
}

/// Log the failure and forward a record of it to a side channel.
///
/// Forwarding never blocks the worker; when the side channel is full the
/// record is dropped with a log line.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    channel: BoundedChannel<DeadLetterRecord>,
}

impl DeadLetter {
    pub fn new(channel: BoundedChannel<DeadLetterRecord>) -> Self {
        Self { channel }
    }
}

impl ErrorPolicy for DeadLetter {
    fn on_item_error(&self, error: StageError) {
        warn!(error = %error, "Error applying function; forwarding to dead letters");
        if let Err(record) = self.channel.try_put(DeadLetterRecord::from(&error)) {
            warn!(stage = %record.stage, "Dead letter channel is full; record dropped");
        }
    }
}
