//! A minimal host queue.
//!
//! [`TaskQueue`] implements the host-queue side of the task contract: it
//! calls `will_enqueue`, `pending_queue_start`, and drives `start` when a
//! task announces readiness through the [`ScheduleSink`] it installs. It
//! deliberately has no priorities or admission limits; scheduling policy
//! belongs to the host, not to this crate.
//!
//! A queue may carry an *underlying* event queue: user `execute` bodies of
//! all its tasks then run there, serialized, while each task's own event
//! queue is suspended for the duration.

use crate::event::EventQueue;
use crate::task::Task;
use crate::tracing_compat::{debug, trace};
use crate::types::{Lifecycle, Qos, TaskId};
use core::fmt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

/// Readiness callbacks a task reports to its host queue.
///
/// This is the crate's rendition of the platform observer protocol: a
/// single callback fires after each change, on the thread that made it.
pub trait ScheduleSink: Send + Sync + 'static {
    /// The task's `is_ready` may have changed.
    fn ready_changed(&self, task: &Task);
    /// The task's `is_executing` changed.
    fn executing_changed(&self, task: &Task);
    /// The task's `is_finished` changed.
    fn finished_changed(&self, task: &Task);
}

/// A minimal admission/ready-driving host queue.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<TaskQueueInner>,
}

/// Non-owning handle stored by tasks.
#[derive(Clone)]
pub(crate) struct WeakTaskQueue {
    inner: Weak<TaskQueueInner>,
}

impl WeakTaskQueue {
    pub(crate) fn upgrade(&self) -> Option<TaskQueue> {
        self.inner.upgrade().map(|inner| TaskQueue { inner })
    }
}

struct TaskQueueInner {
    label: String,
    underlying: Option<EventQueue>,
    state: Mutex<QueueTasks>,
    condvar: Condvar,
}

struct QueueTasks {
    tasks: HashMap<TaskId, Task>,
    started: HashSet<TaskId>,
}

impl TaskQueue {
    /// Creates a queue with default options.
    #[must_use]
    pub fn new() -> Self {
        Self::builder()
            .build()
            .expect("default queue configuration is valid")
    }

    /// Returns a builder for queue options.
    #[must_use]
    pub fn builder() -> TaskQueueBuilder {
        TaskQueueBuilder {
            label: None,
            underlying: None,
        }
    }

    /// The queue's label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Submits a task. The queue drives its lifecycle from here on.
    pub fn add(&self, task: &Task) {
        debug!(queue = %self.inner.label, task_id = %task.id(), "task enqueued");
        task.set_schedule_sink(Arc::new(QueueSink {
            queue: Arc::downgrade(&self.inner),
        }));
        task.will_enqueue(self);
        {
            let mut state = self.inner.state.lock().unwrap();
            state.tasks.insert(task.id(), task.clone());
        }
        task.pending_queue_start();
        self.maybe_start(task);
    }

    /// Number of tasks admitted and not yet finished.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.inner.state.lock().unwrap().tasks.len()
    }

    /// True when no admitted task is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.task_count() == 0
    }

    /// Returns true if the task with `id` is still on the queue.
    #[must_use]
    pub fn contains(&self, id: TaskId) -> bool {
        self.inner.state.lock().unwrap().tasks.contains_key(&id)
    }

    /// Blocks until every admitted task finished or the timeout elapses.
    ///
    /// Returns `true` if the queue drained.
    #[must_use]
    pub fn wait_until_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock().unwrap();
        while !state.tasks.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (next, _) = self.inner.condvar.wait_timeout(state, remaining).unwrap();
            state = next;
        }
        true
    }

    pub(crate) fn underlying(&self) -> Option<EventQueue> {
        self.inner.underlying.clone()
    }

    pub(crate) fn downgrade(&self) -> WeakTaskQueue {
        WeakTaskQueue {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Starts `task` if it is pending, ready, and not already claimed.
    fn maybe_start(&self, task: &Task) {
        if task.state() != Lifecycle::Pending || !task.is_ready() {
            return;
        }
        let claimed = {
            let mut state = self.inner.state.lock().unwrap();
            state.started.insert(task.id())
        };
        if claimed {
            trace!(queue = %self.inner.label, task_id = %task.id(), "starting task");
            task.start();
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("TaskQueue")
            .field("label", &self.inner.label)
            .field("tasks", &state.tasks.len())
            .field("underlying", &self.inner.underlying.is_some())
            .finish()
    }
}

struct QueueSink {
    queue: Weak<TaskQueueInner>,
}

impl ScheduleSink for QueueSink {
    fn ready_changed(&self, task: &Task) {
        if let Some(inner) = self.queue.upgrade() {
            TaskQueue { inner }.maybe_start(task);
        }
    }

    fn executing_changed(&self, _task: &Task) {}

    fn finished_changed(&self, task: &Task) {
        if let Some(inner) = self.queue.upgrade() {
            {
                let mut state = inner.state.lock().unwrap();
                state.tasks.remove(&task.id());
                state.started.remove(&task.id());
            }
            inner.condvar.notify_all();
        }
    }
}

/// Reasons a [`TaskQueueBuilder`] is rejected at build time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// The queue label is empty or whitespace-only. Labels name worker
    /// threads and appear in every log line, so a blank one is never what
    /// the caller meant.
    EmptyLabel,
    /// The underlying queue carries the same label as the queue itself,
    /// which would give two different workers one thread name.
    LabelCollision {
        /// The colliding label.
        label: String,
    },
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyLabel => write!(f, "queue label must not be empty"),
            Self::LabelCollision { label } => {
                write!(f, "underlying queue shares the label '{label}'")
            }
        }
    }
}

impl std::error::Error for BuildError {}

/// Result type for queue construction.
pub type BuildResult<T> = core::result::Result<T, BuildError>;

/// Move-based builder for [`TaskQueue`].
///
/// Setters are infallible; cross-field constraints are checked once at
/// [`build`](Self::build).
#[derive(Debug, Default)]
pub struct TaskQueueBuilder {
    label: Option<String>,
    underlying: Option<EventQueue>,
}

impl TaskQueueBuilder {
    /// Sets the queue label used in logs and thread names. Must not be
    /// empty; validated at build time.
    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Installs an underlying queue: all `execute` bodies of this queue's
    /// tasks run there, serialized across tasks.
    #[must_use]
    pub fn underlying(mut self, queue: EventQueue) -> Self {
        self.underlying = Some(queue);
        self
    }

    /// Installs a fresh underlying queue with the given label and QoS.
    #[must_use]
    pub fn underlying_with_label(self, label: impl Into<String>, qos: Qos) -> Self {
        self.underlying(EventQueue::new(label, qos))
    }

    /// Validates the configuration and builds the queue.
    pub fn build(self) -> BuildResult<TaskQueue> {
        let label = self.label.unwrap_or_else(|| "opkit-queue".to_string());
        if label.trim().is_empty() {
            return Err(BuildError::EmptyLabel);
        }
        if let Some(underlying) = &self.underlying {
            if underlying.label() == label {
                return Err(BuildError::LabelCollision { label });
            }
        }
        Ok(TaskQueue {
            inner: Arc::new(TaskQueueInner {
                label,
                underlying: self.underlying,
                state: Mutex::new(QueueTasks {
                    tasks: HashMap::new(),
                    started: HashSet::new(),
                }),
                condvar: Condvar::new(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;

    #[test]
    fn default_configuration_builds() {
        init_test_logging();
        let queue = TaskQueue::new();
        assert_eq!(queue.label(), "opkit-queue");
        assert!(queue.is_empty());
    }

    #[test]
    fn blank_label_is_rejected() {
        let err = TaskQueue::builder()
            .label("   ")
            .build()
            .expect_err("blank label must be rejected");
        assert_eq!(err, BuildError::EmptyLabel);
    }

    #[test]
    fn underlying_label_collision_is_rejected() {
        let err = TaskQueue::builder()
            .label("io")
            .underlying(EventQueue::new("io", Qos::Default))
            .build()
            .expect_err("colliding labels must be rejected");
        assert!(matches!(err, BuildError::LabelCollision { label } if label == "io"));
    }

    #[test]
    fn underlying_queue_is_kept() {
        let queue = TaskQueue::builder()
            .underlying_with_label("io-serial", Qos::Utility)
            .build()
            .expect("valid configuration");
        assert!(queue.underlying().is_some());
    }
}
