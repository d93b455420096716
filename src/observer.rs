//! The observer contract.
//!
//! Observers receive lifecycle callbacks for one task. Callbacks for a
//! given task are totally ordered; callbacks for different tasks may run
//! concurrently. An observer may be pinned to its own [`EventQueue`], in
//! which case its callbacks run there while the task's queue is held.
//!
//! Observers must be attached before the task reaches `Pending`; attaching
//! later is an inherent race and a programmer error.

use crate::error::Error;
use crate::event::{EventQueue, PendingEvent};
use crate::task::Task;
use std::sync::Arc;

/// Lifecycle callbacks. Every method has a default empty body; implement
/// the ones of interest.
#[allow(unused_variables)]
pub trait Observer: Send + Sync + 'static {
    /// The observer was attached to `task`.
    fn did_attach(&self, task: &Task) {}

    /// `task` is about to run `execute`. Work attached to `event` delays
    /// the transition into `Executing`.
    fn will_execute(&self, task: &Task, event: &PendingEvent) {}

    /// `task`'s `execute` returned.
    fn did_execute(&self, task: &Task) {}

    /// `task` is about to latch its cancelled flag's observer chain.
    fn will_cancel(&self, task: &Task, errors: &[Error]) {}

    /// `task` was cancelled. Fires at most once.
    fn did_cancel(&self, task: &Task, errors: &[Error]) {}

    /// `task` is about to submit `child` to its queue via `produce`.
    fn will_add(&self, task: &Task, child: &Task) {}

    /// `task` submitted `child` to its queue.
    fn did_add(&self, task: &Task, child: &Task) {}

    /// `task` is about to finish. Work attached to `event` delays the
    /// transition into `Finished`.
    fn will_finish(&self, task: &Task, errors: &[Error], event: &PendingEvent) {}

    /// `task` finished. Fires exactly once per task that finishes.
    fn did_finish(&self, task: &Task, errors: &[Error]) {}
}

/// A registered observer together with its optional queue affinity.
#[derive(Clone)]
pub(crate) struct ObserverEntry {
    pub(crate) observer: Arc<dyn Observer>,
    pub(crate) queue: Option<EventQueue>,
}

/// The kind of observer dispatch, naming the pending event it produces.
/// Attach notifications are special-cased (they target one observer, not
/// the snapshot) and have no kind here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObserverEventKind {
    WillExecute,
    DidExecute,
    WillCancel,
    DidCancel,
    WillAdd,
    DidAdd,
    WillFinish,
    DidFinish,
}

impl ObserverEventKind {
    pub(crate) const fn name(self) -> &'static str {
        match self {
            Self::WillExecute => "will-execute",
            Self::DidExecute => "did-execute",
            Self::WillCancel => "will-cancel",
            Self::DidCancel => "did-cancel",
            Self::WillAdd => "will-add",
            Self::DidAdd => "did-add",
            Self::WillFinish => "will-finish",
            Self::DidFinish => "did-finish",
        }
    }
}

type TaskFn = Box<dyn Fn(&Task) + Send + Sync>;
type TaskErrorsFn = Box<dyn Fn(&Task, &[Error]) + Send + Sync>;
type TaskChildFn = Box<dyn Fn(&Task, &Task) + Send + Sync>;

/// An [`Observer`] assembled from closures.
///
/// ```
/// use opkit::BlockObserver;
///
/// let observer = BlockObserver::new()
///     .on_did_finish(|task, errors| {
///         println!("{} finished with {} errors", task.id(), errors.len());
///     });
/// ```
#[derive(Default)]
pub struct BlockObserver {
    did_attach: Option<TaskFn>,
    will_execute: Option<TaskFn>,
    did_execute: Option<TaskFn>,
    will_cancel: Option<TaskErrorsFn>,
    did_cancel: Option<TaskErrorsFn>,
    will_add: Option<TaskChildFn>,
    did_add: Option<TaskChildFn>,
    will_finish: Option<TaskErrorsFn>,
    did_finish: Option<TaskErrorsFn>,
}

impl BlockObserver {
    /// Creates an observer with no callbacks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the did-attach callback.
    #[must_use]
    pub fn on_did_attach(mut self, f: impl Fn(&Task) + Send + Sync + 'static) -> Self {
        self.did_attach = Some(Box::new(f));
        self
    }

    /// Sets the will-execute callback.
    #[must_use]
    pub fn on_will_execute(mut self, f: impl Fn(&Task) + Send + Sync + 'static) -> Self {
        self.will_execute = Some(Box::new(f));
        self
    }

    /// Sets the did-execute callback.
    #[must_use]
    pub fn on_did_execute(mut self, f: impl Fn(&Task) + Send + Sync + 'static) -> Self {
        self.did_execute = Some(Box::new(f));
        self
    }

    /// Sets the will-cancel callback.
    #[must_use]
    pub fn on_will_cancel(mut self, f: impl Fn(&Task, &[Error]) + Send + Sync + 'static) -> Self {
        self.will_cancel = Some(Box::new(f));
        self
    }

    /// Sets the did-cancel callback.
    #[must_use]
    pub fn on_did_cancel(mut self, f: impl Fn(&Task, &[Error]) + Send + Sync + 'static) -> Self {
        self.did_cancel = Some(Box::new(f));
        self
    }

    /// Sets the will-add callback.
    #[must_use]
    pub fn on_will_add(mut self, f: impl Fn(&Task, &Task) + Send + Sync + 'static) -> Self {
        self.will_add = Some(Box::new(f));
        self
    }

    /// Sets the did-add callback.
    #[must_use]
    pub fn on_did_add(mut self, f: impl Fn(&Task, &Task) + Send + Sync + 'static) -> Self {
        self.did_add = Some(Box::new(f));
        self
    }

    /// Sets the will-finish callback.
    #[must_use]
    pub fn on_will_finish(mut self, f: impl Fn(&Task, &[Error]) + Send + Sync + 'static) -> Self {
        self.will_finish = Some(Box::new(f));
        self
    }

    /// Sets the did-finish callback.
    #[must_use]
    pub fn on_did_finish(mut self, f: impl Fn(&Task, &[Error]) + Send + Sync + 'static) -> Self {
        self.did_finish = Some(Box::new(f));
        self
    }
}

impl Observer for BlockObserver {
    fn did_attach(&self, task: &Task) {
        if let Some(f) = &self.did_attach {
            f(task);
        }
    }

    fn will_execute(&self, task: &Task, _event: &PendingEvent) {
        if let Some(f) = &self.will_execute {
            f(task);
        }
    }

    fn did_execute(&self, task: &Task) {
        if let Some(f) = &self.did_execute {
            f(task);
        }
    }

    fn will_cancel(&self, task: &Task, errors: &[Error]) {
        if let Some(f) = &self.will_cancel {
            f(task, errors);
        }
    }

    fn did_cancel(&self, task: &Task, errors: &[Error]) {
        if let Some(f) = &self.did_cancel {
            f(task, errors);
        }
    }

    fn will_add(&self, task: &Task, child: &Task) {
        if let Some(f) = &self.will_add {
            f(task, child);
        }
    }

    fn did_add(&self, task: &Task, child: &Task) {
        if let Some(f) = &self.did_add {
            f(task, child);
        }
    }

    fn will_finish(&self, task: &Task, errors: &[Error], _event: &PendingEvent) {
        if let Some(f) = &self.will_finish {
            f(task, errors);
        }
    }

    fn did_finish(&self, task: &Task, errors: &[Error]) {
        if let Some(f) = &self.did_finish {
            f(task, errors);
        }
    }
}
