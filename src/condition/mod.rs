//! Pre-start conditions.
//!
//! A [`Condition`] is a predicate evaluated before a task's `execute`.
//! Evaluation happens off the task's event queue, concurrently across
//! conditions, with AND semantics:
//!
//! - all `Ok(true)`: the task proceeds (after acquiring any mutual
//!   exclusion categories the conditions expose);
//! - any `Ok(false)`: the task is cancelled silently (no errors);
//! - any `Err(_)`: the task is cancelled with the failures' errors, which
//!   take precedence over silent refusals.
//!
//! Conditions must honor cooperative cancellation through the shared
//! [`ConditionContext`].

pub mod evaluator;

use crate::error::{Error, Result};
use crate::task::Task;
use core::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// A predicate gating a task's `execute`.
pub trait Condition: Send + Sync + 'static {
    /// A short name used in logs and as the default exclusivity category.
    fn name(&self) -> &str;

    /// The exclusivity category this condition requires, if any.
    ///
    /// Categories of satisfied conditions are acquired through the
    /// exclusivity registry before the task becomes ready.
    fn mutually_exclusive_category(&self) -> Option<String> {
        None
    }

    /// Evaluates the predicate.
    ///
    /// `Ok(true)` satisfies the condition, `Ok(false)` refuses silently,
    /// `Err` refuses with an error. Long-running predicates should poll
    /// [`ConditionContext::is_cancelled`] and bail out early.
    fn evaluate(&self, task: &Task, ctx: &ConditionContext) -> Result<bool>;
}

/// Shared evaluation state supporting cooperative cancellation.
///
/// One context is shared by all conditions of a task; cancelling the task
/// (or its evaluator) flips the flag.
#[derive(Debug, Default)]
pub struct ConditionContext {
    cancelled: AtomicBool,
}

impl ConditionContext {
    /// Creates a fresh, uncancelled context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true once the owning task's evaluation was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

type EvalFn = Box<dyn Fn(&Task, &ConditionContext) -> Result<bool> + Send + Sync>;

/// A [`Condition`] backed by a closure.
pub struct BlockCondition {
    name: String,
    category: Option<String>,
    eval: EvalFn,
}

impl BlockCondition {
    /// Creates a condition from a closure.
    #[must_use]
    pub fn new<F>(name: impl Into<String>, eval: F) -> Self
    where
        F: Fn(&Task, &ConditionContext) -> Result<bool> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            category: None,
            eval: Box::new(eval),
        }
    }

    /// Attaches an exclusivity category.
    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }
}

impl Condition for BlockCondition {
    fn name(&self) -> &str {
        &self.name
    }

    fn mutually_exclusive_category(&self) -> Option<String> {
        self.category.clone()
    }

    fn evaluate(&self, task: &Task, ctx: &ConditionContext) -> Result<bool> {
        (self.eval)(task, ctx)
    }
}

impl fmt::Debug for BlockCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockCondition")
            .field("name", &self.name)
            .field("category", &self.category)
            .finish()
    }
}

/// Wraps a condition and requires an exclusivity category.
///
/// The category defaults to the inner condition's name, so
/// `MutuallyExclusive::new(c)` serializes every task carrying `c`.
#[derive(Debug)]
pub struct MutuallyExclusive<C: Condition> {
    inner: C,
    category: String,
}

impl<C: Condition> MutuallyExclusive<C> {
    /// Wraps `inner`, using its name as the category.
    #[must_use]
    pub fn new(inner: C) -> Self {
        let category = inner.name().to_string();
        Self { inner, category }
    }

    /// Wraps `inner` with an explicit category.
    #[must_use]
    pub fn with_category(inner: C, category: impl Into<String>) -> Self {
        Self {
            inner,
            category: category.into(),
        }
    }
}

impl<C: Condition> Condition for MutuallyExclusive<C> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn mutually_exclusive_category(&self) -> Option<String> {
        Some(self.category.clone())
    }

    fn evaluate(&self, task: &Task, ctx: &ConditionContext) -> Result<bool> {
        self.inner.evaluate(task, ctx)
    }
}

/// Inverts a condition's verdict. Failures stay failures.
#[derive(Debug)]
pub struct NegatedCondition<C: Condition> {
    name: String,
    inner: C,
}

impl<C: Condition> NegatedCondition<C> {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: C) -> Self {
        let name = format!("not<{}>", inner.name());
        Self { name, inner }
    }
}

impl<C: Condition> Condition for NegatedCondition<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, task: &Task, ctx: &ConditionContext) -> Result<bool> {
        self.inner.evaluate(task, ctx).map(|satisfied| !satisfied)
    }
}

/// Outcome of evaluating a full condition set. Internal to the evaluator.
#[derive(Debug)]
pub(crate) enum Aggregate {
    /// Every condition returned `Ok(true)`.
    Satisfied,
    /// At least one `Ok(false)`, no errors.
    Refused,
    /// At least one failure; errors in registration order.
    Failed(Vec<Error>),
}

pub(crate) fn aggregate(results: Vec<Result<bool>>) -> Aggregate {
    let mut errors = Vec::new();
    let mut refused = false;
    for result in results {
        match result {
            Ok(true) => {}
            Ok(false) => refused = true,
            Err(e) => errors.push(e),
        }
    }
    if !errors.is_empty() {
        Aggregate::Failed(errors)
    } else if refused {
        Aggregate::Refused
    } else {
        Aggregate::Satisfied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn aggregate_all_true_is_satisfied() {
        assert!(matches!(
            aggregate(vec![Ok(true), Ok(true)]),
            Aggregate::Satisfied
        ));
    }

    #[test]
    fn aggregate_empty_is_satisfied() {
        assert!(matches!(aggregate(vec![]), Aggregate::Satisfied));
    }

    #[test]
    fn aggregate_any_false_refuses() {
        assert!(matches!(
            aggregate(vec![Ok(true), Ok(false)]),
            Aggregate::Refused
        ));
    }

    #[test]
    fn aggregate_failure_beats_refusal() {
        let result = aggregate(vec![
            Ok(false),
            Err(Error::condition_failed("a", "first failure")),
            Err(Error::condition_failed("b", "second failure")),
        ]);
        match result {
            Aggregate::Failed(errors) => {
                assert_eq!(errors.len(), 2);
                assert!(errors.iter().all(|e| e.kind() == ErrorKind::ConditionFailed));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn context_cancellation_latches() {
        let ctx = ConditionContext::new();
        assert!(!ctx.is_cancelled());
        ctx.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn mutually_exclusive_defaults_category_to_name() {
        let c = MutuallyExclusive::new(BlockCondition::new("disk", |_, _| Ok(true)));
        assert_eq!(c.mutually_exclusive_category().as_deref(), Some("disk"));
    }
}
