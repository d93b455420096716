//! The task lifecycle state machine.
//!
//! A task moves through seven states:
//!
//! ```text
//! Initialized -> WillEnqueue -> Pending -> Started -> Executing -> Finishing -> Finished
//!                                              \____________________^
//! ```
//!
//! The state is non-decreasing. The only lawful non-adjacent edge is
//! `Started -> Finishing`, taken when cancellation is detected after the
//! will-execute observers have drained but before `execute` runs, or when a
//! pre-start finish was stashed on a cancelled task.
//!
//! Cancellation does not advance the state; it is a separate latch observed
//! by the execute and finish paths at their gating checkpoints.

use core::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Lifecycle {
    /// Constructed, not yet handed to a queue.
    Initialized = 0,
    /// The host queue has announced admission.
    WillEnqueue = 1,
    /// Admitted; conditions (if any) are being evaluated.
    Pending = 2,
    /// `start` has been called; the event queue is driving the main path.
    Started = 3,
    /// User `execute` is running (or scheduled to run).
    Executing = 4,
    /// `finish` is in flight; will-finish observers are draining.
    Finishing = 5,
    /// Terminal state.
    Finished = 6,
}

impl Lifecycle {
    /// Returns a short name for tracing output.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Initialized => "Initialized",
            Self::WillEnqueue => "WillEnqueue",
            Self::Pending => "Pending",
            Self::Started => "Started",
            Self::Executing => "Executing",
            Self::Finishing => "Finishing",
            Self::Finished => "Finished",
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Initialized,
            1 => Self::WillEnqueue,
            2 => Self::Pending,
            3 => Self::Started,
            4 => Self::Executing,
            5 => Self::Finishing,
            _ => Self::Finished,
        }
    }

    /// Classifies an attempted transition from `self` to `target`.
    ///
    /// Legal edges are exactly the adjacent ones plus the
    /// `Started -> Finishing` shortcut.
    #[must_use]
    pub fn classify(self, target: Self) -> Transition {
        if target <= self {
            return Transition::AlreadyPast;
        }
        let adjacent = target as u8 == self as u8 + 1;
        let shortcut = self == Self::Started && target == Self::Finishing;
        if adjacent || shortcut {
            Transition::Advanced
        } else {
            Transition::Illegal
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The outcome of a transition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The transition is legal and was (or may be) taken.
    Advanced,
    /// The state is already at or beyond the target.
    AlreadyPast,
    /// The transition skips states unlawfully. Programmer error.
    Illegal,
}

/// Atomic lifecycle cell for lock-free cross-thread reads.
///
/// This mirrors the lifecycle field guarded by the task mutex; the mutex
/// holder is the only writer.
#[derive(Debug)]
pub struct LifecycleCell {
    inner: AtomicU8,
}

impl LifecycleCell {
    /// Creates a new cell initialized to the given state.
    #[must_use]
    pub fn new(state: Lifecycle) -> Self {
        Self {
            inner: AtomicU8::new(state as u8),
        }
    }

    /// Loads the current state.
    #[must_use]
    pub fn load(&self) -> Lifecycle {
        Lifecycle::from_u8(self.inner.load(Ordering::Acquire))
    }

    /// Stores the new state.
    pub fn store(&self, state: Lifecycle) {
        self.inner.store(state as u8, Ordering::Release);
    }
}
