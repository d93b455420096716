//! The task core.
//!
//! A [`Task`] is a unit of work with a rigid lifecycle, a serial event
//! queue serializing its user-visible callbacks, pre-start conditions,
//! observers, and cooperative cancellation. User code supplies the work as
//! a [`Work`] implementation (or a closure through [`BlockTask`]); the host
//! queue drives the lifecycle through `will_enqueue`, `pending_queue_start`
//! and `start`.
//!
//! # The cancel/execute race
//!
//! Cancellation may arrive in any state and from any thread. The main path
//! never finishes directly when it sees cancellation mid-flight: it stages
//! a pending automatic finish that the did-cancel observer chain picks up
//! once it drains. If that chain already completed, the main path finishes
//! immediately. This keeps the guarantee that did-cancel observers complete
//! before any automatic finish they gate.

use crate::condition::evaluator::ConditionEvaluator;
use crate::condition::Condition;
use crate::error::{Error, Result};
use crate::event::{EventQueue, PendingEvent};
use crate::exclusivity::ExclusivityRegistry;
use crate::observer::{Observer, ObserverEntry, ObserverEventKind};
use crate::queue::{ScheduleSink, TaskQueue, WeakTaskQueue};
use crate::tracing_compat::{debug, error, trace};
use crate::types::{FinishInfo, FinishSource, Lifecycle, LifecycleCell, Qos, TaskId, Transition};
use core::fmt;
use smallvec::SmallVec;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// The work a task performs, plus optional lifecycle hooks.
///
/// `execute` must eventually arrange for [`Task::finish`] to be called
/// (possibly asynchronously, possibly from a different thread); returning
/// from `execute` does not finish the task. The exception is a task that is
/// cancelled before `execute` runs: unless
/// [`automatic_finishing_disabled`](Work::automatic_finishing_disabled)
/// returns true, the task finishes itself.
#[allow(unused_variables)]
pub trait Work: Send + Sync + 'static {
    /// The body of the task. Runs at most once, on the task's event queue
    /// or on the host queue's underlying queue.
    fn execute(&self, task: &Task);

    /// Opt out of the automatic finish on pre-execute cancellation. An
    /// implementation returning true takes full responsibility for calling
    /// `finish`, even under cancel.
    fn automatic_finishing_disabled(&self) -> bool {
        false
    }

    /// Hook invoked on the event queue when the task is cancelled, before
    /// the did-cancel observers.
    fn did_cancel(&self, task: &Task, errors: &[Error]) {}

    /// Hook invoked on the event queue before the will-finish observers.
    fn will_finish(&self, task: &Task, errors: &[Error]) {}

    /// Hook invoked on the event queue after the state flipped to
    /// `Finished`, before exclusivity release and the did-finish observers.
    fn did_finish(&self, task: &Task, errors: &[Error]) {}
}

type TaskBlock = Box<dyn FnOnce(&Task) + Send + 'static>;

/// A [`Work`] implementation wrapping a closure.
///
/// By default the task finishes when the closure returns; use
/// [`manual`](BlockTask::manual) when the closure arranges an asynchronous
/// finish itself.
pub struct BlockTask {
    block: Mutex<Option<TaskBlock>>,
    auto_finish: bool,
}

impl BlockTask {
    /// Wraps `block`; the task finishes after the block returns.
    #[must_use]
    pub fn new<F>(block: F) -> Self
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        Self {
            block: Mutex::new(Some(Box::new(block))),
            auto_finish: true,
        }
    }

    /// Wraps `block`; the block must arrange for `finish` to be called.
    #[must_use]
    pub fn manual<F>(block: F) -> Self
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        Self {
            block: Mutex::new(Some(Box::new(block))),
            auto_finish: false,
        }
    }
}

impl Work for BlockTask {
    fn execute(&self, task: &Task) {
        let block = self.block.lock().unwrap().take();
        if let Some(block) = block {
            block(task);
        }
        if self.auto_finish {
            task.finish();
        }
    }
}

impl fmt::Debug for BlockTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockTask")
            .field("auto_finish", &self.auto_finish)
            .finish()
    }
}

/// Builder for [`Task`] construction options.
#[derive(Debug)]
pub struct TaskBuilder<W> {
    work: W,
    name: Option<String>,
    qos: Qos,
    registry: Option<Arc<ExclusivityRegistry>>,
}

impl<W: Work> TaskBuilder<W> {
    /// Sets a human-readable name, used in logs and the worker thread name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the QoS hint propagated to the task's event queue.
    #[must_use]
    pub fn qos(mut self, qos: Qos) -> Self {
        self.qos = qos;
        self
    }

    /// Injects an exclusivity registry (tests); defaults to the global one.
    #[must_use]
    pub fn registry(mut self, registry: Arc<ExclusivityRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Builds the task in the `Initialized` state.
    #[must_use]
    pub fn build(self) -> Task {
        let id = TaskId::next();
        let label = match &self.name {
            Some(name) => format!("opkit-eq-{name}"),
            None => format!("opkit-eq-{id}"),
        };
        Task {
            inner: Arc::new(TaskInner {
                id,
                name: self.name,
                work: Box::new(self.work),
                event_queue: EventQueue::new(label, self.qos),
                registry: self.registry.unwrap_or_else(ExclusivityRegistry::global),
                lifecycle_cell: LifecycleCell::new(Lifecycle::Initialized),
                cancelled_cell: AtomicBool::new(false),
                guarded: Mutex::new(Guarded::new()),
            }),
        }
    }
}

/// A handle to a task. Cheap to clone; all clones refer to the same task.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

/// Non-owning task handle used for back-references.
#[derive(Clone)]
pub(crate) struct WeakTask {
    inner: Weak<TaskInner>,
}

impl WeakTask {
    pub(crate) fn upgrade(&self) -> Option<Task> {
        self.inner.upgrade().map(|inner| Task { inner })
    }
}

pub(crate) struct TaskInner {
    id: TaskId,
    name: Option<String>,
    work: Box<dyn Work>,
    event_queue: EventQueue,
    registry: Arc<ExclusivityRegistry>,
    /// Atomic mirror of the guarded lifecycle, for lock-free queries.
    lifecycle_cell: LifecycleCell,
    /// Atomic mirror of the guarded cancelled latch.
    cancelled_cell: AtomicBool,
    guarded: Mutex<Guarded>,
}

impl Drop for TaskInner {
    fn drop(&mut self) {
        // An outstanding evaluator must not keep running against a dead
        // parent.
        let evaluator = self
            .guarded
            .get_mut()
            .map(|g| g.evaluator.take())
            .unwrap_or_default();
        if let Some(evaluator) = evaluator {
            evaluator.cancel();
        }
    }
}

/// Who to notify when this task finishes.
struct Dependent {
    owner: TaskId,
    kind: DependentKind,
}

enum DependentKind {
    Task(WeakTask),
    Evaluator(Weak<ConditionEvaluator>),
}

/// All mutable task state, under the single per-task mutex.
struct Guarded {
    lifecycle: Lifecycle,
    cancelled: bool,
    errors: Vec<Error>,
    observers: Vec<ObserverEntry>,
    dependencies: Vec<Task>,
    dependents: Vec<Dependent>,
    conditions: Vec<Arc<dyn Condition>>,
    /// Exclusivity categories held; released exactly once at `Finished`.
    categories: SmallVec<[String; 2]>,
    queue: Option<WeakTaskQueue>,
    sink: Option<Arc<dyn ScheduleSink>>,
    evaluator: Option<Arc<ConditionEvaluator>>,
    /// `finish` arrived before `start` on a cancelled task.
    pending_finish: Option<FinishInfo>,
    /// Automatic finish staged for the did-cancel chain to consume.
    pending_automatic_finish: Option<FinishInfo>,
    is_handling_cancel: bool,
    is_handling_finish: bool,
    is_transitioning_to_executing: bool,
    finished_handling_cancel: bool,
}

impl Guarded {
    fn new() -> Self {
        Self {
            lifecycle: Lifecycle::Initialized,
            cancelled: false,
            errors: Vec::new(),
            observers: Vec::new(),
            dependencies: Vec::new(),
            dependents: Vec::new(),
            conditions: Vec::new(),
            categories: SmallVec::new(),
            queue: None,
            sink: None,
            evaluator: None,
            pending_finish: None,
            pending_automatic_finish: None,
            is_handling_cancel: false,
            is_handling_finish: false,
            is_transitioning_to_executing: false,
            finished_handling_cancel: false,
        }
    }

    /// Attempts a lifecycle transition; the caller holds the task mutex.
    fn try_advance(&mut self, target: Lifecycle, cell: &LifecycleCell, id: TaskId) -> Transition {
        let transition = self.lifecycle.classify(target);
        match transition {
            Transition::Advanced => {
                trace!(task_id = %id, from = %self.lifecycle, to = %target, "lifecycle advanced");
                self.lifecycle = target;
                cell.store(target);
            }
            Transition::AlreadyPast => {}
            Transition::Illegal => {
                error!(
                    task_id = %id,
                    from = %self.lifecycle,
                    to = %target,
                    "illegal lifecycle transition"
                );
                debug_assert!(
                    false,
                    "illegal lifecycle transition {} -> {} on {id}",
                    self.lifecycle, target
                );
            }
        }
        transition
    }
}

enum StartDisposition {
    PendingFinish(FinishInfo),
    Automatic,
    Main,
}

enum FinishDisposition {
    Reject,
    Stashed,
    Go {
        was_executing: bool,
        sink: Option<Arc<dyn ScheduleSink>>,
    },
}

impl Task {
    /// Creates a task with default options.
    #[must_use]
    pub fn new(work: impl Work) -> Self {
        Self::builder(work).build()
    }

    /// Creates a task from a closure; the task finishes when it returns.
    #[must_use]
    pub fn from_fn<F>(block: F) -> Self
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        Self::new(BlockTask::new(block))
    }

    /// Returns a builder for construction options.
    #[must_use]
    pub fn builder<W: Work>(work: W) -> TaskBuilder<W> {
        TaskBuilder {
            work,
            name: None,
            qos: Qos::default(),
            registry: None,
        }
    }

    /// The task's unique identity.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    /// The task's optional human-readable name.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// The task's current lifecycle state.
    #[must_use]
    pub fn state(&self) -> Lifecycle {
        self.inner.lifecycle_cell.load()
    }

    /// True once `cancel` succeeded. Latched; never reverts.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled_cell.load(Ordering::Acquire)
    }

    /// True exactly while the state is `Executing`.
    #[must_use]
    pub fn is_executing(&self) -> bool {
        self.state() == Lifecycle::Executing
    }

    /// True exactly once the state is `Finished`.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state() == Lifecycle::Finished
    }

    /// Host-queue readiness: a cancelled task is always ready (its
    /// dependencies are moot); otherwise the task must be past admission
    /// with all dependencies finished and condition evaluation complete.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        let guarded = self.inner.guarded.lock().unwrap();
        if guarded.cancelled {
            return true;
        }
        if guarded.lifecycle < Lifecycle::Pending {
            return false;
        }
        if let Some(evaluator) = &guarded.evaluator {
            if !evaluator.is_finished() {
                return false;
            }
        }
        guarded.dependencies.iter().all(Task::is_finished)
    }

    /// A snapshot of the errors accumulated so far, in arrival order.
    #[must_use]
    pub fn errors(&self) -> Vec<Error> {
        self.inner.guarded.lock().unwrap().errors.clone()
    }

    /// The tasks this one depends on (externally visible set only).
    #[must_use]
    pub fn dependencies(&self) -> Vec<Task> {
        self.inner.guarded.lock().unwrap().dependencies.clone()
    }

    /// The task's serial event queue.
    #[must_use]
    pub fn event_queue(&self) -> &EventQueue {
        &self.inner.event_queue
    }

    pub(crate) fn downgrade(&self) -> WeakTask {
        WeakTask {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn registry(&self) -> Arc<ExclusivityRegistry> {
        Arc::clone(&self.inner.registry)
    }

    // ── Registration ────────────────────────────────────────────────────

    /// Adds a dependency. The task will not become ready until `dep` is
    /// finished. Mutable while `state < Started`.
    pub fn add_dependency(&self, dep: &Task) {
        let evaluator = {
            let mut guarded = self.inner.guarded.lock().unwrap();
            if !registration_open(&guarded, Lifecycle::Started, "dependency", self.inner.id) {
                return;
            }
            if guarded.dependencies.iter().any(|d| d.id() == dep.id()) {
                return;
            }
            guarded.dependencies.push(dep.clone());
            guarded.evaluator.clone()
        };
        dep.register_dependent(Dependent {
            owner: self.id(),
            kind: DependentKind::Task(self.downgrade()),
        });
        if let Some(evaluator) = evaluator {
            evaluator.dependency_added(dep.id());
            let registered = dep.register_dependent(Dependent {
                owner: self.id(),
                kind: DependentKind::Evaluator(Arc::downgrade(&evaluator)),
            });
            if !registered {
                evaluator.dependency_did_finish(dep.id());
            }
        }
    }

    /// Removes a dependency added with [`add_dependency`](Self::add_dependency).
    pub fn remove_dependency(&self, dep: &Task) {
        let evaluator = {
            let mut guarded = self.inner.guarded.lock().unwrap();
            if !registration_open(&guarded, Lifecycle::Started, "dependency", self.inner.id) {
                return;
            }
            guarded.dependencies.retain(|d| d.id() != dep.id());
            guarded.evaluator.clone()
        };
        dep.unregister_dependents_of(self.id());
        if let Some(evaluator) = evaluator {
            evaluator.dependency_removed(dep.id());
        }
    }

    /// Adds a pre-start condition. Mutable while `state < WillEnqueue`.
    pub fn add_condition(&self, condition: impl Condition) {
        let mut guarded = self.inner.guarded.lock().unwrap();
        if !registration_open(&guarded, Lifecycle::WillEnqueue, "condition", self.inner.id) {
            return;
        }
        guarded.conditions.push(Arc::new(condition));
    }

    /// Attaches an observer; its `did_attach` fires on the event queue.
    /// Mutable while `state < Pending`.
    pub fn add_observer(&self, observer: impl Observer) {
        self.attach_observer(Arc::new(observer), None);
    }

    /// Attaches an observer pinned to `queue`: its callbacks run there
    /// while this task's event queue is held.
    pub fn add_observer_with_queue(&self, observer: impl Observer, queue: EventQueue) {
        self.attach_observer(Arc::new(observer), Some(queue));
    }

    fn attach_observer(&self, observer: Arc<dyn Observer>, queue: Option<EventQueue>) {
        {
            let mut guarded = self.inner.guarded.lock().unwrap();
            if !registration_open(&guarded, Lifecycle::Pending, "observer", self.inner.id) {
                return;
            }
            guarded.observers.push(ObserverEntry {
                observer: Arc::clone(&observer),
                queue: queue.clone(),
            });
        }
        let task = self.clone();
        self.inner.event_queue.dispatch(move || match queue {
            Some(q) if !q.same_queue(task.event_queue()) => {
                let t = task.clone();
                task.event_queue()
                    .dispatch_synchronized_with(&q, move || observer.did_attach(&t));
            }
            _ => observer.did_attach(&task),
        });
    }

    /// Registers the host queue's readiness sink. Called by the queue
    /// before [`will_enqueue`](Self::will_enqueue).
    pub fn set_schedule_sink(&self, sink: Arc<dyn ScheduleSink>) {
        self.inner.guarded.lock().unwrap().sink = Some(sink);
    }

    // ── Host-queue callbacks ────────────────────────────────────────────

    /// First host callback: the queue accepted the task. Freezes the
    /// condition set.
    pub fn will_enqueue(&self, queue: &TaskQueue) {
        let mut guarded = self.inner.guarded.lock().unwrap();
        guarded.try_advance(
            Lifecycle::WillEnqueue,
            &self.inner.lifecycle_cell,
            self.inner.id,
        );
        guarded.queue = Some(queue.downgrade());
    }

    /// Second host callback. Freezes the observer set and installs the
    /// condition evaluator (a hidden dependency) when conditions exist.
    pub fn pending_queue_start(&self) {
        let setup = {
            let mut guarded = self.inner.guarded.lock().unwrap();
            guarded.try_advance(
                Lifecycle::Pending,
                &self.inner.lifecycle_cell,
                self.inner.id,
            );
            if guarded.conditions.is_empty() || guarded.cancelled {
                None
            } else {
                let deps = guarded.dependencies.clone();
                let unfinished: HashSet<TaskId> = deps
                    .iter()
                    .filter(|d| !d.is_finished())
                    .map(Task::id)
                    .collect();
                let evaluator = ConditionEvaluator::new(
                    self.downgrade(),
                    guarded.conditions.clone(),
                    unfinished,
                );
                guarded.evaluator = Some(Arc::clone(&evaluator));
                Some((evaluator, deps))
            }
        };
        if let Some((evaluator, deps)) = setup {
            for dep in &deps {
                let registered = dep.register_dependent(Dependent {
                    owner: self.id(),
                    kind: DependentKind::Evaluator(Arc::downgrade(&evaluator)),
                });
                if !registered {
                    evaluator.dependency_did_finish(dep.id());
                }
            }
            evaluator.kick();
        }
    }

    /// Third host callback: begin the start path. The dependency set is
    /// frozen from here on.
    pub fn start(&self) {
        let disposition = {
            let mut guarded = self.inner.guarded.lock().unwrap();
            let transition = guarded.try_advance(
                Lifecycle::Started,
                &self.inner.lifecycle_cell,
                self.inner.id,
            );
            if transition != Transition::Advanced {
                debug_assert!(false, "start called on a task that is not pending");
                return;
            }
            if let Some(info) = guarded.pending_finish.take() {
                StartDisposition::PendingFinish(info)
            } else if guarded.cancelled && !self.inner.work.automatic_finishing_disabled() {
                StartDisposition::Automatic
            } else {
                StartDisposition::Main
            }
        };
        match disposition {
            StartDisposition::PendingFinish(info) => self.apply_finish(info),
            StartDisposition::Automatic => {
                self.queue_automatic_finish(FinishInfo::new(FinishSource::AutomaticFromStart));
            }
            StartDisposition::Main => {
                let task = self.clone();
                self.inner.event_queue.dispatch(move || task.main_path());
            }
        }
    }

    // ── Main path ───────────────────────────────────────────────────────

    /// On the event queue: fire will-execute observers, then continue once
    /// their pending event drains.
    fn main_path(&self) {
        let event = self.dispatch_observers(ObserverEventKind::WillExecute, |o, t, e| {
            o.will_execute(t, e);
        });
        let task = self.clone();
        self.inner
            .event_queue
            .dispatch_notify(event.group(), move || task.main_continue());
    }

    /// On the event queue: re-check state, transition to `Executing`, and
    /// run `execute`.
    fn main_continue(&self) {
        enum Next {
            Abort,
            Automatic,
            Execute(Option<Arc<dyn ScheduleSink>>),
        }
        let next = {
            let mut guarded = self.inner.guarded.lock().unwrap();
            if guarded.lifecycle > Lifecycle::Started {
                // A cancellation or concurrent finish won the race.
                Next::Abort
            } else if guarded.cancelled && !self.inner.work.automatic_finishing_disabled() {
                Next::Automatic
            } else {
                guarded.try_advance(
                    Lifecycle::Executing,
                    &self.inner.lifecycle_cell,
                    self.inner.id,
                );
                guarded.is_transitioning_to_executing = true;
                Next::Execute(guarded.sink.clone())
            }
        };
        match next {
            Next::Abort => {}
            Next::Automatic => {
                self.queue_automatic_finish(FinishInfo::new(FinishSource::AutomaticFromStart));
            }
            Next::Execute(sink) => {
                if let Some(sink) = &sink {
                    sink.executing_changed(self);
                }
                debug!(task_id = %self.inner.id, "executing");
                let underlying = {
                    let guarded = self.inner.guarded.lock().unwrap();
                    guarded
                        .queue
                        .as_ref()
                        .and_then(WeakTaskQueue::upgrade)
                        .and_then(|q| q.underlying())
                };
                match underlying {
                    Some(underlying) => {
                        // Suspend the event queue until execute returns.
                        let task = self.clone();
                        self.inner
                            .event_queue
                            .dispatch_synchronized_with(&underlying, move || {
                                task.inner.work.execute(&task);
                            });
                    }
                    None => self.inner.work.execute(self),
                }
                self.inner.guarded.lock().unwrap().is_transitioning_to_executing = false;
                let _ = self.dispatch_observers(ObserverEventKind::DidExecute, |o, t, _| {
                    o.did_execute(t);
                });
            }
        }
    }

    // ── Cancel path ─────────────────────────────────────────────────────

    /// Cancels the task. Idempotent; returns immediately. Does not stop a
    /// running `execute`: cancellation is cooperative.
    pub fn cancel(&self) {
        self.cancel_with_errors(Vec::new());
    }

    /// Cancels the task, appending `errors` to its error sequence.
    pub fn cancel_with_errors(&self, errors: Vec<Error>) {
        let (evaluator, sink) = {
            let mut guarded = self.inner.guarded.lock().unwrap();
            let rejected = guarded.cancelled
                || guarded.is_handling_cancel
                || guarded.lifecycle >= Lifecycle::Finishing;
            if rejected {
                return;
            }
            guarded.is_handling_cancel = true;
            guarded.errors.extend(errors);
            guarded.cancelled = true;
            self.inner.cancelled_cell.store(true, Ordering::Release);
            (guarded.evaluator.clone(), guarded.sink.clone())
        };
        debug!(task_id = %self.inner.id, "cancelled");
        // Dependencies are moot once cancelled: readiness flips true.
        if let Some(sink) = sink {
            sink.ready_changed(self);
        }
        if let Some(evaluator) = evaluator {
            evaluator.cancel();
        }
        let task = self.clone();
        self.inner
            .event_queue
            .dispatch(move || task.handle_cancel());
    }

    /// On the event queue: run the cancel observer chain, then consume any
    /// staged automatic finish.
    fn handle_cancel(&self) {
        let errors = self.errors();
        let will_errors = errors.clone();
        let _ = self.dispatch_observers(ObserverEventKind::WillCancel, move |o, t, _| {
            o.will_cancel(t, &will_errors);
        });
        self.inner.work.did_cancel(self, &errors);
        let event = self.dispatch_observers(ObserverEventKind::DidCancel, move |o, t, _| {
            o.did_cancel(t, &errors);
        });
        let task = self.clone();
        self.inner
            .event_queue
            .dispatch_notify(event.group(), move || {
                let staged = {
                    let mut guarded = task.inner.guarded.lock().unwrap();
                    guarded.finished_handling_cancel = true;
                    guarded.pending_automatic_finish.take()
                };
                if let Some(info) = staged {
                    task.apply_finish(info);
                }
            });
    }

    /// Runs the finish now if the did-cancel chain has drained, otherwise
    /// stages it for that chain to pick up.
    fn queue_automatic_finish(&self, info: FinishInfo) {
        let now = {
            let mut guarded = self.inner.guarded.lock().unwrap();
            if guarded.finished_handling_cancel {
                Some(info)
            } else {
                guarded.pending_automatic_finish = Some(info);
                None
            }
        };
        if let Some(info) = now {
            self.apply_finish(info);
        }
    }

    // ── Finish path ─────────────────────────────────────────────────────

    /// Finishes the task. At most one call has effect; the rest are no-ops.
    pub fn finish(&self) {
        self.finish_with_errors(Vec::new());
    }

    /// Finishes the task, appending `errors` to its error sequence.
    pub fn finish_with_errors(&self, errors: Vec<Error>) {
        self.apply_finish(FinishInfo::with_errors(FinishSource::ExplicitCall, errors));
    }

    fn apply_finish(&self, info: FinishInfo) {
        let mut info = Some(info);
        let disposition = {
            let mut guarded = self.inner.guarded.lock().unwrap();
            if guarded.is_handling_finish || guarded.lifecycle >= Lifecycle::Finishing {
                FinishDisposition::Reject
            } else if guarded.lifecycle < Lifecycle::Started {
                if guarded.cancelled {
                    // Consumed by the start path.
                    guarded.pending_finish = info.take();
                    FinishDisposition::Stashed
                } else {
                    error!(task_id = %self.inner.id, "finish before start on a task that was not cancelled");
                    debug_assert!(false, "finish before start on a task that was not cancelled");
                    FinishDisposition::Reject
                }
            } else {
                guarded.is_handling_finish = true;
                let was_executing = guarded.lifecycle == Lifecycle::Executing
                    || guarded.is_transitioning_to_executing;
                guarded.try_advance(
                    Lifecycle::Finishing,
                    &self.inner.lifecycle_cell,
                    self.inner.id,
                );
                let info = info.take().unwrap_or_else(|| {
                    FinishInfo::new(FinishSource::ExplicitCall)
                });
                guarded.errors.extend(info.errors);
                FinishDisposition::Go {
                    was_executing,
                    sink: guarded.sink.clone(),
                }
            }
        };
        match disposition {
            FinishDisposition::Reject | FinishDisposition::Stashed => {}
            FinishDisposition::Go {
                was_executing,
                sink,
            } => {
                debug!(task_id = %self.inner.id, "finishing");
                if was_executing {
                    if let Some(sink) = &sink {
                        sink.executing_changed(self);
                    }
                }
                let task = self.clone();
                self.inner
                    .event_queue
                    .dispatch(move || task.handle_finish());
            }
        }
    }

    /// On the event queue: will-finish hook and observers, then complete
    /// once their pending event drains.
    fn handle_finish(&self) {
        let errors = self.errors();
        self.inner.work.will_finish(self, &errors);
        let event = self.dispatch_observers(ObserverEventKind::WillFinish, move |o, t, e| {
            o.will_finish(t, &errors, e);
        });
        let task = self.clone();
        self.inner
            .event_queue
            .dispatch_notify(event.group(), move || task.complete_finish());
    }

    /// On the event queue: flip to `Finished`, run the did-finish hook,
    /// release exclusivity, fire did-finish observers, notify dependents.
    fn complete_finish(&self) {
        let (categories, sink, dependents) = {
            let mut guarded = self.inner.guarded.lock().unwrap();
            guarded.try_advance(
                Lifecycle::Finished,
                &self.inner.lifecycle_cell,
                self.inner.id,
            );
            (
                std::mem::take(&mut guarded.categories),
                guarded.sink.clone(),
                std::mem::take(&mut guarded.dependents),
            )
        };
        let errors = self.errors();
        debug!(task_id = %self.inner.id, errors = errors.len(), "finished");
        self.inner.work.did_finish(self, &errors);
        if !categories.is_empty() {
            self.inner.registry.unlock(&categories);
        }
        let _ = self.dispatch_observers(ObserverEventKind::DidFinish, move |o, t, _| {
            o.did_finish(t, &errors);
        });
        if let Some(sink) = sink {
            sink.finished_changed(self);
        }
        for dependent in dependents {
            match dependent.kind {
                DependentKind::Task(weak) => {
                    if let Some(task) = weak.upgrade() {
                        task.dependency_did_finish(self.inner.id);
                    }
                }
                DependentKind::Evaluator(weak) => {
                    if let Some(evaluator) = weak.upgrade() {
                        evaluator.dependency_did_finish(self.inner.id);
                    }
                }
            }
        }
    }

    // ── Produce ─────────────────────────────────────────────────────────

    /// Submits `child` to this task's queue. The will-add and did-add
    /// observers fire around the submission. When `before` is given, the
    /// child is guaranteed to be enqueued before that event fires.
    ///
    /// The returned event's group drains when the submission completed.
    ///
    /// # Errors
    ///
    /// [`crate::ErrorKind::NoQueue`] if this task was never enqueued.
    pub fn produce(&self, child: Task, before: Option<&PendingEvent>) -> Result<PendingEvent> {
        let queue = {
            let guarded = self.inner.guarded.lock().unwrap();
            guarded.queue.as_ref().and_then(WeakTaskQueue::upgrade)
        };
        let Some(queue) = queue else {
            return Err(Error::no_queue(self.inner.id));
        };
        let event = PendingEvent::new("produce");
        event.enter();
        let before_group = before.map(|b| {
            b.enter();
            b.group().clone()
        });
        let task = self.clone();
        let produced = event.clone();
        self.inner.event_queue.dispatch(move || {
            trace!(task_id = %task.inner.id, child_id = %child.id(), "producing child task");
            let will_child = child.clone();
            let _ = task.dispatch_observers(ObserverEventKind::WillAdd, move |o, t, _| {
                o.will_add(t, &will_child);
            });
            queue.add(&child);
            let did_child = child.clone();
            let _ = task.dispatch_observers(ObserverEventKind::DidAdd, move |o, t, _| {
                o.did_add(t, &did_child);
            });
            produced.leave();
            if let Some(group) = before_group {
                group.leave();
            }
        });
        Ok(event)
    }

    // ── Observer fabric ─────────────────────────────────────────────────

    /// Iterates the observer snapshot from the event queue, invoking
    /// `callback` inline or synchronized onto the observer's own queue.
    /// Returns the chain's pending event for follow-up chaining.
    fn dispatch_observers<F>(&self, kind: ObserverEventKind, callback: F) -> PendingEvent
    where
        F: Fn(&dyn Observer, &Task, &PendingEvent) + Send + Sync + 'static,
    {
        let event_queue = self.event_queue();
        event_queue.assert_on_queue();
        let event = PendingEvent::new(kind.name());
        event.enter();
        let observers = self.inner.guarded.lock().unwrap().observers.clone();
        let callback = Arc::new(callback);
        for entry in observers {
            match &entry.queue {
                Some(queue) if !queue.same_queue(event_queue) => {
                    let callback = Arc::clone(&callback);
                    let task = self.clone();
                    let observer = Arc::clone(&entry.observer);
                    let chained = event.clone();
                    event_queue.dispatch_synchronized_with(queue, move || {
                        (*callback)(observer.as_ref(), &task, &chained);
                    });
                }
                _ => (*callback)(entry.observer.as_ref(), self, &event),
            }
        }
        event.leave();
        event
    }

    // ── Dependency bookkeeping ──────────────────────────────────────────

    /// Registers a party to notify when this task finishes. Returns false
    /// if the task already finished (the caller treats it as satisfied).
    fn register_dependent(&self, dependent: Dependent) -> bool {
        let mut guarded = self.inner.guarded.lock().unwrap();
        if guarded.lifecycle == Lifecycle::Finished {
            return false;
        }
        guarded.dependents.push(dependent);
        true
    }

    fn unregister_dependents_of(&self, owner: TaskId) {
        self.inner
            .guarded
            .lock()
            .unwrap()
            .dependents
            .retain(|d| d.owner != owner);
    }

    /// A dependency of this task finished; re-announce readiness.
    pub(crate) fn dependency_did_finish(&self, _dep: TaskId) {
        self.notify_ready();
    }

    /// The condition evaluator completed; re-announce readiness.
    pub(crate) fn evaluator_did_finish(&self) {
        self.notify_ready();
    }

    fn notify_ready(&self) {
        let sink = self.inner.guarded.lock().unwrap().sink.clone();
        if let Some(sink) = sink {
            if self.is_ready() {
                sink.ready_changed(self);
            }
        }
    }

    /// Stores granted exclusivity categories for release at `Finished`.
    /// Returns false when the task is already finishing; the caller must
    /// then release the grant itself.
    pub(crate) fn adopt_exclusivity_categories(&self, categories: &[String]) -> bool {
        let mut guarded = self.inner.guarded.lock().unwrap();
        if guarded.lifecycle >= Lifecycle::Finishing {
            return false;
        }
        guarded
            .categories
            .extend(categories.iter().cloned());
        true
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Returns true when registration is still open; asserts otherwise.
fn registration_open(guarded: &Guarded, frozen_at: Lifecycle, what: &str, id: TaskId) -> bool {
    if guarded.lifecycle >= frozen_at {
        error!(
            task_id = %id,
            state = %guarded.lifecycle,
            "{what} registered after the {frozen_at} freeze point"
        );
        debug_assert!(
            false,
            "{what} registered on {id} after the {frozen_at} freeze point (state {})",
            guarded.lifecycle
        );
        return false;
    }
    true
}
