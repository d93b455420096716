//! Event execution primitives.
//!
//! Every task owns a serial [`EventQueue`] that serializes its user-visible
//! callbacks. Observer dispatches are tied to a [`PendingEvent`], a named
//! barrier whose [`CompletionGroup`] drains when the observer chain (and any
//! work user code attached to the event) has completed.
//!
//! - [`queue`]: the serial FIFO executor
//! - [`group`]: completion groups and pending events
//! - [`pool`]: the shared worker pool backing condition evaluation

pub mod group;
pub mod pool;
pub mod queue;

pub use group::{CompletionGroup, PendingEvent};
pub use pool::WorkerPool;
pub use queue::EventQueue;
