//! Test utilities for opkit.
//!
//! This module provides shared helpers for unit tests:
//! - Consistent tracing-based logging initialization
//! - Phase/section macros for readable test output
//! - Observer and condition test doubles
//!
//! # Example
//! ```ignore
//! use opkit::test_utils::{init_test_logging, SequenceObserver};
//!
//! init_test_logging();
//! let observer = SequenceObserver::new();
//! task.add_observer(observer.clone());
//! // ... drive the task ...
//! assert_eq!(observer.names(), ["did-attach", "will-execute"]);
//! ```

use crate::condition::BlockCondition;
use crate::error::Error;
use crate::event::PendingEvent;
use crate::observer::Observer;
use crate::task::Task;
use std::sync::{Arc, Mutex};

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once. A no-op unless the
/// `test-utils` feature is enabled.
#[cfg(feature = "test-utils")]
pub fn init_test_logging() {
    use std::sync::Once;
    static INIT_LOGGING: Once = Once::new();
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Initialize test logging (no-op build: the `test-utils` feature is off).
#[cfg(not(feature = "test-utils"))]
pub fn init_test_logging() {}

/// Log a test phase transition with a visual separator.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        $crate::tracing_compat::info!(phase = %$name, "========================================");
        $crate::tracing_compat::info!(phase = %$name, "TEST PHASE: {}", $name);
        $crate::tracing_compat::info!(phase = %$name, "========================================");
    };
}

/// Log a section within a test phase.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        $crate::tracing_compat::debug!(section = %$name, "--- {} ---", $name);
    };
}

/// Log test completion with summary.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        $crate::tracing_compat::info!(test = %$name, "test completed successfully: {}", $name);
    };
}

/// Log before assertions for context.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        $crate::tracing_compat::debug!(
            expected = ?$expected,
            actual = ?$actual,
            "Asserting: {}",
            $msg
        );
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}

/// An observer that records the order of its callbacks.
///
/// Cloning shares the record, so one instance can be both attached to a
/// task and queried from the test body.
#[derive(Clone, Default)]
pub struct SequenceObserver {
    events: Arc<Mutex<Vec<String>>>,
}

impl SequenceObserver {
    /// Creates an observer with an empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The callback names observed so far, in order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    /// True if `name` was observed.
    #[must_use]
    pub fn saw(&self, name: &str) -> bool {
        self.events.lock().unwrap().iter().any(|e| e == name)
    }

    fn record(&self, name: &str) {
        self.events.lock().unwrap().push(name.to_string());
    }
}

impl Observer for SequenceObserver {
    fn did_attach(&self, _task: &Task) {
        self.record("did-attach");
    }

    fn will_execute(&self, _task: &Task, _event: &PendingEvent) {
        self.record("will-execute");
    }

    fn did_execute(&self, _task: &Task) {
        self.record("did-execute");
    }

    fn will_cancel(&self, _task: &Task, _errors: &[Error]) {
        self.record("will-cancel");
    }

    fn did_cancel(&self, _task: &Task, _errors: &[Error]) {
        self.record("did-cancel");
    }

    fn will_add(&self, _task: &Task, _child: &Task) {
        self.record("will-add");
    }

    fn did_add(&self, _task: &Task, _child: &Task) {
        self.record("did-add");
    }

    fn will_finish(&self, _task: &Task, _errors: &[Error], _event: &PendingEvent) {
        self.record("will-finish");
    }

    fn did_finish(&self, _task: &Task, _errors: &[Error]) {
        self.record("did-finish");
    }
}

/// A condition that always passes.
#[must_use]
pub fn satisfied_condition(name: &str) -> BlockCondition {
    BlockCondition::new(name.to_string(), |_, _| Ok(true))
}

/// A condition that refuses silently.
#[must_use]
pub fn refused_condition(name: &str) -> BlockCondition {
    BlockCondition::new(name.to_string(), |_, _| Ok(false))
}

/// A condition that fails with a condition error.
#[must_use]
pub fn failing_condition(name: &str, message: &str) -> BlockCondition {
    let condition = name.to_string();
    let message = message.to_string();
    BlockCondition::new(name.to_string(), move |_, _| {
        Err(Error::condition_failed(condition.clone(), message.clone()))
    })
}
