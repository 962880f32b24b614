//! Staged job engine.
//!
//! A pipeline is a chain of [`Stage`]s joined by [`BoundedChannel`]s. Each
//! stage is a pool of workers applying one function; how a worker loops
//! depends on whether the stage has an input, an output, or both.
//!
//! Stages do not talk to a coordinator. A consumer stage keeps reading while
//! its upstream's [`Liveness`] counter is non-zero, drains what is left once
//! it hits zero, and then exits, which in turn lets its own counter reach
//! zero for the next stage. Only the source stage looks at the orchestrator's
//! [`StopFlag`].
//!
//! ```text
//! source ──[channel]──> transform ──[channel]──> sink
//!   │                       │                      │
//!   └─ liveness ──watch──>  └─ liveness ──watch──> │
//! ```

pub mod backoff;
pub mod channel;
pub mod error;
pub mod liveness;
pub mod policy;
pub mod stage;

pub use backoff::Backoff;
pub use channel::BoundedChannel;
pub use error::{BoxError, StageError};
pub use liveness::{Liveness, StopFlag};
pub use policy::{DeadLetter, DeadLetterRecord, ErrorPolicy, LogAndDrop};
pub use stage::{ExecutionMode, Produced, Stage, StageOptions, StageStats};
