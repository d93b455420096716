//! The condition evaluator.
//!
//! A lightweight hidden sub-task gating its parent. It mirrors the parent's
//! direct dependencies, waits for them to finish, evaluates all conditions
//! concurrently, and (when every condition is satisfied) acquires the
//! mutually exclusive categories they expose before completing. Its
//! completion is what makes the parent ready.
//!
//! The evaluator holds only a weak reference back to its parent; the parent
//! exclusively owns the evaluator and cancels it on drop.

use crate::condition::{aggregate, Aggregate, Condition, ConditionContext};
use crate::error::Result;
use crate::event::WorkerPool;
use crate::task::{Task, WeakTask};
use crate::tracing_compat::{debug, trace};
use crate::types::TaskId;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// Evaluator lifecycle. Completion is a separate latch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum EvaluatorState {
    /// Waiting for mirrored dependencies to finish.
    WaitingOnDeps = 0,
    /// Dispatched onto the worker pool.
    DispatchedStart = 1,
    /// Running pre-checks (parent liveness, cancellation).
    Started = 2,
    /// Evaluating conditions.
    ExecutingMain = 3,
}

pub(crate) struct ConditionEvaluator {
    parent: WeakTask,
    conditions: Vec<Arc<dyn Condition>>,
    state: AtomicU8,
    cancelled: AtomicBool,
    finished: AtomicBool,
    ctx: ConditionContext,
    remaining_deps: Mutex<HashSet<TaskId>>,
}

impl ConditionEvaluator {
    pub(crate) fn new(
        parent: WeakTask,
        conditions: Vec<Arc<dyn Condition>>,
        unfinished_deps: HashSet<TaskId>,
    ) -> Arc<Self> {
        Arc::new(Self {
            parent,
            conditions,
            state: AtomicU8::new(EvaluatorState::WaitingOnDeps as u8),
            cancelled: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            ctx: ConditionContext::new(),
            remaining_deps: Mutex::new(unfinished_deps),
        })
    }

    /// True once the evaluator completed (in any way).
    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Mirrors a dependency added to the parent before it started.
    pub(crate) fn dependency_added(&self, id: TaskId) {
        self.remaining_deps.lock().unwrap().insert(id);
    }

    /// Mirrors a dependency removed from the parent.
    pub(crate) fn dependency_removed(self: &Arc<Self>, id: TaskId) {
        self.remaining_deps.lock().unwrap().remove(&id);
        self.kick();
    }

    /// A mirrored dependency finished.
    pub(crate) fn dependency_did_finish(self: &Arc<Self>, id: TaskId) {
        self.remaining_deps.lock().unwrap().remove(&id);
        self.kick();
    }

    /// Cancels the evaluator: flips the shared condition context so
    /// predicates can bail out, and forces progress if the evaluator was
    /// still waiting on dependencies. Cascades parent cancellation from the
    /// evaluation body.
    pub(crate) fn cancel(self: &Arc<Self>) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.ctx.cancel();
        self.dispatch();
    }

    /// Dispatches the evaluation body when dependencies have drained (or
    /// the evaluator was cancelled). Idempotent.
    pub(crate) fn kick(self: &Arc<Self>) {
        let waiting = !self.remaining_deps.lock().unwrap().is_empty();
        if waiting && !self.cancelled.load(Ordering::Acquire) {
            return;
        }
        self.dispatch();
    }

    fn dispatch(self: &Arc<Self>) {
        let transitioned = self
            .state
            .compare_exchange(
                EvaluatorState::WaitingOnDeps as u8,
                EvaluatorState::DispatchedStart as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if !transitioned {
            return;
        }
        let this = Arc::clone(self);
        WorkerPool::global().spawn(move || this.run());
    }

    fn run(self: Arc<Self>) {
        self.state
            .store(EvaluatorState::Started as u8, Ordering::Release);

        let Some(parent) = self.parent.upgrade() else {
            self.complete();
            return;
        };
        if self.cancelled.load(Ordering::Acquire) || parent.is_cancelled() {
            trace!(task_id = %parent.id(), "condition evaluation skipped: cancelled");
            parent.cancel();
            self.complete();
            return;
        }

        self.state
            .store(EvaluatorState::ExecutingMain as u8, Ordering::Release);
        let results = self.evaluate_all(&parent);

        // A cancel that raced the predicates wins over their verdict.
        if self.cancelled.load(Ordering::Acquire) {
            parent.cancel();
            self.complete();
            return;
        }

        match aggregate(results) {
            Aggregate::Satisfied => {
                let categories = self.satisfied_categories();
                debug!(
                    task_id = %parent.id(),
                    categories = categories.len(),
                    "conditions satisfied"
                );
                if categories.is_empty() {
                    self.complete();
                } else {
                    let registry = parent.registry();
                    let weak_parent = parent.downgrade();
                    let this = Arc::clone(&self);
                    let granted = categories.clone();
                    let registry_for_release = Arc::clone(&registry);
                    drop(parent);
                    registry.request(&categories, move || {
                        let adopted = weak_parent
                            .upgrade()
                            .is_some_and(|p| p.adopt_exclusivity_categories(&granted));
                        if !adopted {
                            // Parent is gone or already finishing; nobody
                            // else will release these.
                            registry_for_release.unlock(&granted);
                        }
                        this.complete();
                    });
                }
            }
            Aggregate::Refused => {
                debug!(task_id = %parent.id(), "condition refused; cancelling parent");
                parent.cancel();
                self.complete();
            }
            Aggregate::Failed(errors) => {
                debug!(
                    task_id = %parent.id(),
                    errors = errors.len(),
                    "condition failed; cancelling parent"
                );
                let errors = errors
                    .into_iter()
                    .map(|e| e.for_task(parent.id()))
                    .collect();
                parent.cancel_with_errors(errors);
                self.complete();
            }
        }
    }

    /// Evaluates every condition, concurrently when there is more than one.
    /// A failing verdict is attributed to the condition that produced it.
    fn evaluate_all(&self, parent: &Task) -> Vec<Result<bool>> {
        if self.conditions.len() == 1 {
            return vec![eval_one(&self.conditions[0], parent, &self.ctx)];
        }
        let slots: Vec<Mutex<Option<Result<bool>>>> =
            self.conditions.iter().map(|_| Mutex::new(None)).collect();
        thread::scope(|scope| {
            for (condition, slot) in self.conditions.iter().zip(&slots) {
                let ctx = &self.ctx;
                scope.spawn(move || {
                    *slot.lock().unwrap() = Some(eval_one(condition, parent, ctx));
                });
            }
        });
        slots
            .into_iter()
            .map(|slot| {
                slot.into_inner()
                    .unwrap()
                    .expect("condition thread did not report a verdict")
            })
            .collect()
    }

    fn satisfied_categories(&self) -> Vec<String> {
        let mut categories: Vec<String> = self
            .conditions
            .iter()
            .filter_map(|c| c.mutually_exclusive_category())
            .collect();
        categories.sort();
        categories.dedup();
        categories
    }

    /// Latches completion and reports readiness to the parent. At most once.
    fn complete(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(parent) = self.parent.upgrade() {
            trace!(task_id = %parent.id(), "condition evaluator finished");
            parent.evaluator_did_finish();
        }
    }
}

fn eval_one(condition: &Arc<dyn Condition>, parent: &Task, ctx: &ConditionContext) -> Result<bool> {
    condition
        .evaluate(parent, ctx)
        .map_err(|e| e.in_condition(condition.name()))
}

impl std::fmt::Debug for ConditionEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionEvaluator")
            .field("conditions", &self.conditions.len())
            .field("cancelled", &self.cancelled.load(Ordering::Relaxed))
            .field("finished", &self.finished.load(Ordering::Relaxed))
            .finish()
    }
}
