//! Finish provenance.

use crate::error::Error;

/// Where a finish request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FinishSource {
    /// The start path finished the task automatically because it was
    /// cancelled before `execute` could run.
    AutomaticFromStart,
    /// User code called `finish`.
    ExplicitCall,
}

/// A finish request captured for deferred application.
///
/// Stored as `pending_finish` when `finish` arrives before `start` on a
/// cancelled task, and as `pending_automatic_finish` when the start path
/// must wait for the did-cancel observer chain to drain.
#[derive(Debug, Clone)]
pub struct FinishInfo {
    /// Errors to append to the task's error sequence.
    pub errors: Vec<Error>,
    /// Provenance of the request.
    pub source: FinishSource,
}

impl FinishInfo {
    /// Creates finish info with the given provenance and no errors.
    #[must_use]
    pub const fn new(source: FinishSource) -> Self {
        Self {
            errors: Vec::new(),
            source,
        }
    }

    /// Creates finish info carrying errors.
    #[must_use]
    pub fn with_errors(source: FinishSource, errors: Vec<Error>) -> Self {
        Self { errors, source }
    }
}
