//! Identifier types for tasks.
//!
//! Task identifiers are process-unique, allocated from a shared atomic
//! counter, and stable for the lifetime of the task they name.

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static TASK_COUNTER: AtomicU64 = AtomicU64::new(1);

/// A unique identifier for a task.
///
/// Identifiers are never reused within a process.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TaskId(u64);

impl TaskId {
    /// Allocates the next task identifier.
    #[must_use]
    pub fn next() -> Self {
        Self(TASK_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw numeric value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Creates a task ID with a fixed value for testing purposes.
    #[doc(hidden)]
    #[must_use]
    pub const fn new_for_test(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({})", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}
