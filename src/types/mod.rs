//! Core types for opkit.
//!
//! This module contains the fundamental types used throughout the crate:
//!
//! - [`id`]: Identifier types (`TaskId`)
//! - [`lifecycle`]: The seven-state task lifecycle and transition rules
//! - [`qos`]: Quality-of-service hints propagated to event queues
//! - [`finish`]: Finish provenance (`FinishInfo`, `FinishSource`)

pub mod finish;
pub mod id;
pub mod lifecycle;
pub mod qos;

pub use finish::{FinishInfo, FinishSource};
pub use id::TaskId;
pub use lifecycle::{Lifecycle, LifecycleCell, Transition};
pub use qos::Qos;
