//! End-to-end condition scenarios.
//!
//! Covers silent refusal, condition failure, concurrent evaluation,
//! cooperative cancellation of predicates, and dependency mirroring.

#[macro_use]
mod common;

use common::*;
use opkit::{BlockCondition, Error, NegatedCondition, Task, TaskQueue};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn init_test(name: &str) {
    init_test_logging();
    test_phase!(name);
}

#[test]
fn refused_condition_cancels_silently() {
    init_test("refused_condition_cancels_silently");

    let log = EventLog::new();
    let executed = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&executed);
    let task = Task::from_fn(move |_| {
        flag.store(true, Ordering::SeqCst);
    });
    task.add_condition(BlockCondition::new("never", |_, _| Ok(false)));
    task.add_observer(LoggingObserver::new("t", &log));

    let queue = TaskQueue::new();
    queue.add(&task);
    assert!(queue.wait_until_empty(DRAIN));

    assert!(!executed.load(Ordering::SeqCst));
    assert!(!log.contains("t:will-execute"));
    assert!(log.contains("t:did-cancel[0]"), "log: {:?}", log.entries());
    assert!(log.contains("t:did-finish[0]"));
    assert!(task.errors().is_empty());

    test_complete!("refused_condition_cancels_silently");
}

#[test]
fn failed_condition_cancels_with_errors() {
    init_test("failed_condition_cancels_with_errors");

    let log = EventLog::new();
    let task = Task::from_fn(|_| {});
    task.add_condition(BlockCondition::new("broken", |_, _| {
        Err(Error::condition_failed("broken", "backing store offline"))
    }));
    task.add_observer(LoggingObserver::new("t", &log));

    let queue = TaskQueue::new();
    queue.add(&task);
    assert!(queue.wait_until_empty(DRAIN));

    assert!(!log.contains("t:will-execute"));
    assert!(log.contains("t:did-cancel[1]"));
    assert!(log.contains("t:did-finish[1]"));
    let errors = task.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].is_condition_failure());

    test_complete!("failed_condition_cancels_with_errors");
}

#[test]
fn failure_takes_precedence_over_refusal() {
    init_test("failure_takes_precedence_over_refusal");

    let task = Task::from_fn(|_| {});
    task.add_condition(BlockCondition::new("refuses", |_, _| Ok(false)));
    task.add_condition(BlockCondition::new("fails", |_, _| {
        Err(Error::condition_failed("fails", "hard failure"))
    }));

    let queue = TaskQueue::new();
    queue.add(&task);
    assert!(queue.wait_until_empty(DRAIN));

    let errors = task.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].is_condition_failure());

    test_complete!("failure_takes_precedence_over_refusal");
}

#[test]
fn satisfied_conditions_all_evaluate_before_execute() {
    init_test("satisfied_conditions_all_evaluate_before_execute");

    let evaluated = Arc::new(AtomicUsize::new(0));
    let executed = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&executed);
    let task = Task::from_fn(move |_| {
        flag.store(true, Ordering::SeqCst);
    });
    for name in ["first", "second", "third"] {
        let count = Arc::clone(&evaluated);
        task.add_condition(BlockCondition::new(name, move |_, _| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }));
    }

    let queue = TaskQueue::new();
    queue.add(&task);
    assert!(queue.wait_until_empty(DRAIN));

    assert_eq!(evaluated.load(Ordering::SeqCst), 3);
    assert!(executed.load(Ordering::SeqCst));
    assert!(task.errors().is_empty());

    test_complete!("satisfied_conditions_all_evaluate_before_execute");
}

#[test]
fn negated_refusal_allows_execution() {
    init_test("negated_refusal_allows_execution");

    let executed = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&executed);
    let task = Task::from_fn(move |_| {
        flag.store(true, Ordering::SeqCst);
    });
    task.add_condition(NegatedCondition::new(BlockCondition::new(
        "refuses",
        |_, _| Ok(false),
    )));

    let queue = TaskQueue::new();
    queue.add(&task);
    assert!(queue.wait_until_empty(DRAIN));
    assert!(executed.load(Ordering::SeqCst));

    test_complete!("negated_refusal_allows_execution");
}

#[test]
fn cancellation_reaches_running_predicates() {
    init_test("cancellation_reaches_running_predicates");

    let observed_cancel = Arc::new(AtomicBool::new(false));
    let executed = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&executed);
    let task = Task::from_fn(move |_| {
        flag.store(true, Ordering::SeqCst);
    });
    let seen = Arc::clone(&observed_cancel);
    task.add_condition(BlockCondition::new("slow", move |_, ctx| {
        for _ in 0..500 {
            if ctx.is_cancelled() {
                seen.store(true, Ordering::SeqCst);
                return Ok(false);
            }
            thread::sleep(Duration::from_millis(10));
        }
        Ok(true)
    }));

    let queue = TaskQueue::new();
    queue.add(&task);
    thread::sleep(Duration::from_millis(100));
    task.cancel();
    assert!(queue.wait_until_empty(DRAIN));

    // The task finishes without waiting for the predicate; give the
    // predicate a moment to observe the flag.
    for _ in 0..250 {
        if observed_cancel.load(Ordering::SeqCst) {
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }
    assert!(observed_cancel.load(Ordering::SeqCst));
    assert!(!executed.load(Ordering::SeqCst));
    assert!(task.is_cancelled());
    assert!(task.is_finished());

    test_complete!("cancellation_reaches_running_predicates");
}

#[test]
fn conditions_wait_for_dependencies() {
    init_test("conditions_wait_for_dependencies");

    let log = EventLog::new();

    let dep = Task::from_fn(|_| {
        thread::sleep(Duration::from_millis(100));
    });
    dep.add_observer(LoggingObserver::new("dep", &log));

    let task = Task::from_fn(|_| {});
    let cond_log = log.clone();
    task.add_condition(BlockCondition::new("after-dep", move |_, _| {
        cond_log.push("condition-evaluated");
        Ok(true)
    }));
    task.add_dependency(&dep);
    task.add_observer(LoggingObserver::new("t", &log));

    let queue = TaskQueue::new();
    queue.add(&task);
    queue.add(&dep);
    assert!(queue.wait_until_empty(DRAIN));

    // The evaluator mirrors the parent's dependencies: the predicate only
    // ran after the dependency finished.
    log.assert_order("dep:did-finish[0]", "condition-evaluated");
    log.assert_order("condition-evaluated", "t:will-execute");

    test_complete!("conditions_wait_for_dependencies");
}

#[test]
fn cancel_while_waiting_on_dependency_skips_evaluation() {
    init_test("cancel_while_waiting_on_dependency_skips_evaluation");

    let evaluated = Arc::new(AtomicBool::new(false));

    let dep = Task::from_fn(|_| {
        thread::sleep(Duration::from_millis(300));
    });
    let task = Task::from_fn(|_| {});
    let count = Arc::clone(&evaluated);
    task.add_condition(BlockCondition::new("gated", move |_, _| {
        count.store(true, Ordering::SeqCst);
        Ok(true)
    }));
    task.add_dependency(&dep);

    let queue = TaskQueue::new();
    queue.add(&task);
    queue.add(&dep);
    thread::sleep(Duration::from_millis(50));
    task.cancel();
    assert!(queue.wait_until_empty(DRAIN));

    assert!(
        !evaluated.load(Ordering::SeqCst),
        "a cancelled evaluator must not run predicates"
    );
    assert!(task.is_cancelled());
    assert!(task.is_finished());
    assert!(dep.is_finished());

    test_complete!("cancel_while_waiting_on_dependency_skips_evaluation");
}
