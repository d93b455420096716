//! Error types and error handling strategy for opkit.
//!
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - Cancellation and finishing always succeed; failure is reported through
//!   the task's accumulated error sequence, never thrown across the boundary
//! - Every error can be attributed to the task and condition it belongs to,
//!   and that attribution survives aggregation across the evaluator
//! - Programmer errors (illegal transitions, registration after a freeze
//!   point) abort in debug builds and are not representable as `Error` values

use crate::types::TaskId;
use core::fmt;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorKind {
    /// `produce` was called on a task that was never enqueued.
    NoQueue,
    /// A pre-start condition failed with an error.
    ConditionFailed,
    /// Error supplied by user code to `finish` or `cancel`.
    User,
    /// Internal invariant violation (bug).
    Internal,
}

/// The main error type for opkit operations.
///
/// Carries the kind plus optional attribution: which task the error
/// belongs to, which condition produced it, free-form detail, and an
/// underlying source error. Attribution is first-writer-wins so that the
/// most specific origin (the condition that actually failed) is never
/// overwritten by later aggregation layers.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    task: Option<TaskId>,
    condition: Option<String>,
    detail: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind and no attribution.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            task: None,
            condition: None,
            detail: None,
            source: None,
        }
    }

    /// Creates the error `produce` reports for a task that is not on any
    /// queue.
    #[must_use]
    pub fn no_queue(task: TaskId) -> Self {
        Self::new(ErrorKind::NoQueue).for_task(task)
    }

    /// Creates a user error carrying a detail message.
    #[must_use]
    pub fn user(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::User).with_detail(detail)
    }

    /// Creates a condition failure attributed to the named condition.
    #[must_use]
    pub fn condition_failed(condition: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConditionFailed)
            .in_condition(condition)
            .with_detail(detail)
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the task this error is attributed to, if any.
    #[must_use]
    pub const fn task(&self) -> Option<TaskId> {
        self.task
    }

    /// Returns the condition this error is attributed to, if any.
    #[must_use]
    pub fn condition_name(&self) -> Option<&str> {
        self.condition.as_deref()
    }

    /// Returns the detail message, if any.
    #[must_use]
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// Returns true if this error came from a failed condition.
    #[must_use]
    pub const fn is_condition_failure(&self) -> bool {
        matches!(self.kind, ErrorKind::ConditionFailed)
    }

    /// Attributes the error to `task`. First attribution wins.
    #[must_use]
    pub fn for_task(mut self, task: TaskId) -> Self {
        if self.task.is_none() {
            self.task = Some(task);
        }
        self
    }

    /// Attributes the error to the named condition. First attribution wins.
    #[must_use]
    pub fn in_condition(mut self, condition: impl Into<String>) -> Self {
        if self.condition.is_none() {
            self.condition = Some(condition.into());
        }
        self
    }

    /// Sets the detail message.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ErrorKind::NoQueue => match self.task {
                Some(task) => write!(f, "{task} is not on any queue")?,
                None => write!(f, "task is not on any queue")?,
            },
            ErrorKind::ConditionFailed => match &self.condition {
                Some(name) => write!(f, "condition '{name}' failed")?,
                None => write!(f, "condition failed")?,
            },
            ErrorKind::User => write!(f, "user error")?,
            ErrorKind::Internal => write!(f, "internal invariant violated")?,
        }
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        if self.kind != ErrorKind::NoQueue {
            if let Some(task) = self.task {
                write!(f, " ({task})")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|source| source as &(dyn std::error::Error + 'static))
    }
}

/// Attribution helpers for `Result`s carrying opkit errors.
pub trait ResultExt<T> {
    /// Attributes the error to `task`. First attribution wins.
    fn for_task(self, task: TaskId) -> Result<T>;
    /// Attributes the error to the named condition. First attribution wins.
    fn in_condition(self, condition: &str) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn for_task(self, task: TaskId) -> Result<T> {
        self.map_err(|e| e.for_task(task))
    }

    fn in_condition(self, condition: &str) -> Result<T> {
        self.map_err(|e| e.in_condition(condition))
    }
}

/// A specialized Result type for opkit operations.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::BlockCondition;
    use crate::queue::TaskQueue;
    use crate::task::Task;
    use crate::test_utils::init_test_logging;
    use std::time::Duration;

    #[test]
    fn display_reflects_the_taxonomy() {
        let user = Error::user("operator shutdown");
        assert_eq!(user.to_string(), "user error: operator shutdown");

        let condition = Error::condition_failed("disk-space", "only 2 MiB free");
        assert_eq!(
            condition.to_string(),
            "condition 'disk-space' failed: only 2 MiB free"
        );

        let no_queue = Error::no_queue(TaskId::new_for_test(9));
        assert_eq!(no_queue.to_string(), "T9 is not on any queue");
    }

    #[test]
    fn attribution_is_first_writer_wins() {
        let id = TaskId::new_for_test(4);
        let other = TaskId::new_for_test(5);
        let err = Error::condition_failed("reachability", "probe refused")
            .for_task(id)
            .for_task(other)
            .in_condition("outer-wrapper");
        assert_eq!(err.task(), Some(id));
        assert_eq!(err.condition_name(), Some("reachability"));
        assert_eq!(err.to_string(), "condition 'reachability' failed: probe refused (T4)");
    }

    #[test]
    fn produce_without_queue_is_attributed_through_result_ext() {
        init_test_logging();
        let task = Task::from_fn(|_| {});
        let child = Task::from_fn(|_| {});
        let err = task
            .produce(child, None)
            .in_condition("respawn")
            .expect_err("task is not on a queue");
        assert_eq!(err.kind(), ErrorKind::NoQueue);
        assert_eq!(err.task(), Some(task.id()));
        assert_eq!(err.condition_name(), Some("respawn"));
        assert!(err.to_string().contains(&task.id().to_string()));
    }

    #[test]
    fn condition_failures_reach_the_task_error_sequence() {
        init_test_logging();
        let task = Task::from_fn(|_| {});
        task.add_condition(BlockCondition::new("flaky-backend", |_, _| {
            Err(Error::condition_failed("flaky-backend", "probe timed out"))
        }));
        let queue = TaskQueue::new();
        queue.add(&task);
        assert!(queue.wait_until_empty(Duration::from_secs(10)));

        let errors = task.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].is_condition_failure());
        assert_eq!(errors[0].condition_name(), Some("flaky-backend"));
        assert_eq!(errors[0].task(), Some(task.id()));
    }

    #[test]
    fn evaluator_attributes_bare_errors_to_their_condition() {
        init_test_logging();
        let task = Task::from_fn(|_| {});
        // The predicate reports a plain user error; the evaluator fills in
        // the condition and task attribution.
        task.add_condition(BlockCondition::new("quota", |_, _| {
            Err(Error::user("budget exhausted"))
        }));
        let queue = TaskQueue::new();
        queue.add(&task);
        assert!(queue.wait_until_empty(Duration::from_secs(10)));

        let errors = task.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind(), ErrorKind::User);
        assert_eq!(errors[0].condition_name(), Some("quota"));
        assert_eq!(errors[0].task(), Some(task.id()));
    }

    #[test]
    fn source_errors_stay_on_the_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "probe timed out");
        let err = Error::condition_failed("reachability", "endpoint probe failed")
            .with_source(io);
        let source = std::error::Error::source(&err).expect("missing source");
        assert_eq!(source.to_string(), "probe timed out");
        assert_eq!(err.condition_name(), Some("reachability"));
    }
}
