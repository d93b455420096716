//! Opkit: a structured-concurrency operation primitive.
//!
//! # Overview
//!
//! Opkit provides [`Task`], an abstract unit of work with a rigid
//! seven-state lifecycle, a per-instance serial event queue for
//! user-visible callbacks, pre-start condition evaluation, process-wide
//! mutual exclusion by category, cooperative cancellation, and an
//! observer fabric. It is the building block of an operation-queue
//! framework: user code implements the [`Work`] hook, attaches
//! dependencies, conditions and observers, and submits tasks to a
//! [`TaskQueue`].
//!
//! # Core Guarantees
//!
//! - **Ordered lifecycle**: `Initialized → WillEnqueue → Pending → Started
//!   → Executing → Finishing → Finished`, with `Started → Finishing` as the
//!   only lawful shortcut
//! - **At-most-once effects**: exactly one `finish` and at most one
//!   `cancel` take effect, each firing its observer chain exactly once
//! - **Serialized callbacks**: observer callbacks for a task are totally
//!   ordered on its event queue
//! - **Race-free cancellation**: the did-cancel observer chain completes
//!   before any automatic finish it gates
//! - **Exclusive categories**: a category acquired through the registry is
//!   released exactly once, at the transition into `Finished`
//!
//! # Module Structure
//!
//! - [`types`]: Core types (identifiers, lifecycle, QoS, finish info)
//! - [`event`]: Serial event queues, completion groups, the worker pool
//! - [`task`]: The task core and the [`Work`] contract
//! - [`observer`]: Lifecycle observers
//! - [`condition`]: Pre-start conditions and their evaluator
//! - [`exclusivity`]: The category exclusivity registry
//! - [`queue`]: A minimal host queue driving task readiness
//! - [`error`]: Error types

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]

pub mod condition;
pub mod error;
pub mod event;
pub mod exclusivity;
pub mod observer;
pub mod queue;
pub mod task;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod tracing_compat;
pub mod types;

// Re-exports for convenient access to core types
pub use condition::{
    BlockCondition, Condition, ConditionContext, MutuallyExclusive, NegatedCondition,
};
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use event::{CompletionGroup, EventQueue, PendingEvent, WorkerPool};
pub use exclusivity::ExclusivityRegistry;
pub use observer::{BlockObserver, Observer};
pub use queue::{BuildError, BuildResult, ScheduleSink, TaskQueue, TaskQueueBuilder};
pub use task::{BlockTask, Task, TaskBuilder, Work};
pub use types::{FinishInfo, FinishSource, Lifecycle, Qos, TaskId, Transition};
