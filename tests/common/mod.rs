//! Shared helpers for the end-to-end suites.

use opkit::{Error, Observer, PendingEvent, Task};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

/// Generous drain timeout for queue-driven scenarios.
pub const DRAIN: Duration = Duration::from_secs(10);

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
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

/// Log a test phase transition with a visual separator.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = %$name, "========================================");
        tracing::info!(phase = %$name, "TEST PHASE: {}", $name);
        tracing::info!(phase = %$name, "========================================");
    };
}

/// Log test completion.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = %$name, "test completed successfully: {}", $name);
    };
}

/// A shared, ordered record of labelled happenings across tasks.
#[derive(Clone, Default)]
pub struct EventLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    /// Index of the first entry equal to `needle`; panics when absent.
    pub fn index_of(&self, needle: &str) -> usize {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .position(|e| e == needle)
            .unwrap_or_else(|| panic!("event '{needle}' not recorded; log: {entries:?}"))
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.entries.lock().unwrap().iter().any(|e| e == needle)
    }

    /// Asserts that `earlier` was recorded before `later`.
    pub fn assert_order(&self, earlier: &str, later: &str) {
        let a = self.index_of(earlier);
        let b = self.index_of(later);
        assert!(
            a < b,
            "expected '{earlier}' before '{later}'; log: {:?}",
            self.entries()
        );
    }
}

/// An observer that records every callback into an [`EventLog`], prefixed
/// with a label (`"t1:will-execute"`).
pub struct LoggingObserver {
    label: String,
    log: EventLog,
}

impl LoggingObserver {
    pub fn new(label: impl Into<String>, log: &EventLog) -> Self {
        Self {
            label: label.into(),
            log: log.clone(),
        }
    }

    fn record(&self, name: &str) {
        self.log.push(format!("{}:{}", self.label, name));
    }
}

impl Observer for LoggingObserver {
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

    fn did_cancel(&self, _task: &Task, errors: &[Error]) {
        self.record(&format!("did-cancel[{}]", errors.len()));
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

    fn did_finish(&self, _task: &Task, errors: &[Error]) {
        self.record(&format!("did-finish[{}]", errors.len()));
    }
}
