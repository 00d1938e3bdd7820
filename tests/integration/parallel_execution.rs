//! Parallel execution correctness tests.
//!
//! These tests verify that the wave scheduler respects dependencies,
//! priority ordering and pool capacity.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};

use conductor::{SignalType, TaskFailure, TaskId, TaskSpec, TaskState};

use crate::fixtures::{chain, diamond, fails, independent_tasks, returns, set, Gate, Harness};

/// Test: base, dependent and orphan in one batch
/// Given base, dep (on base) and orphan (on an unregistered id)
/// When executed in parallel with pool size 2
/// Then base and dep complete, orphan fails unsatisfied, base completes first
#[test]
fn test_base_dep_orphan_scenario() {
    let harness = Harness::new(2);
    let missing = TaskId::new();
    let base = harness.add(TaskSpec::new("base", returns(json!("ok"))));
    let dep = harness.add(TaskSpec::new("dep", returns(json!("done"))).depends_on(base));
    let orphan = harness.add(TaskSpec::new("orphan", returns(Value::Null)).depends_on(missing));

    let outcomes = harness
        .orchestrator
        .execute_tasks_parallel(&set(&[base, dep, orphan]))
        .unwrap();

    assert_eq!(outcomes[&base], Ok(json!("ok")));
    assert_eq!(outcomes[&dep], Ok(json!("done")));
    assert_eq!(
        outcomes[&orphan],
        Err(TaskFailure::DependencyNotSatisfied {
            pending: vec![missing]
        })
    );
    assert_eq!(
        harness.orchestrator.task_state(&orphan),
        Some(TaskState::Failed)
    );

    assert_eq!(harness.count(SignalType::TaskCompleted, base), 1);
    let base_done = harness.position(SignalType::TaskCompleted, base).unwrap();
    let first_dep_signal = harness
        .events()
        .iter()
        .position(|(_, id)| *id == Some(dep))
        .unwrap();
    assert!(base_done < first_dep_signal);
}

/// Test: Dependency ordering holds for every pool size
/// Given A and B (on A)
/// When executed in parallel with pool sizes 1 through 6
/// Then B never starts before A completes
#[test]
fn test_dependent_never_starts_before_dependency() {
    for workers in 1..=6 {
        let harness = Harness::new(workers);
        let a = harness.add(TaskSpec::new("a", || {
            thread::sleep(Duration::from_millis(5));
            Ok(json!("a"))
        }));
        let b = harness.add(TaskSpec::new("b", returns(json!("b"))).depends_on(a));

        let outcomes = harness
            .orchestrator
            .execute_tasks_parallel(&set(&[a, b]))
            .unwrap();

        assert_eq!(outcomes.len(), 2, "pool size {}", workers);
        let a_done = harness.position(SignalType::TaskCompleted, a).unwrap();
        let b_started = harness.position(SignalType::TaskStarted, b).unwrap();
        assert!(a_done < b_started, "pool size {}", workers);
    }
}

/// Test: Priority then FIFO dispatch
/// Given priorities [5, 1, 5] all ready
/// When executed in parallel with pool size 1
/// Then dispatch order is first 5, second 5, then 1
#[test]
fn test_priority_then_creation_order() {
    let harness = Harness::new(1);
    let first = harness.add(TaskSpec::new("first", returns(json!(1))).priority(5));
    let low = harness.add(TaskSpec::new("low", returns(json!(2))).priority(1));
    let second = harness.add(TaskSpec::new("second", returns(json!(3))).priority(5));

    harness
        .orchestrator
        .execute_tasks_parallel(&set(&[first, low, second]))
        .unwrap();

    assert_eq!(harness.start_order(), vec![first, second, low]);
}

/// Test: Dispatch order within one wide wave
/// Given four ready tasks with mixed priorities
/// When executed with a pool large enough for all of them
/// Then STARTED signals follow priority-then-FIFO order
#[test]
fn test_dispatch_order_within_wave() {
    let harness = Harness::new(4);
    let a = harness.add(TaskSpec::new("a", returns(Value::Null)));
    let b = harness.add(TaskSpec::new("b", returns(Value::Null)).priority(3));
    let c = harness.add(TaskSpec::new("c", returns(Value::Null)).priority(-1));
    let d = harness.add(TaskSpec::new("d", returns(Value::Null)).priority(3));

    harness
        .orchestrator
        .execute_tasks_parallel(&set(&[a, b, c, d]))
        .unwrap();

    assert_eq!(harness.start_order(), vec![b, d, a, c]);
}

/// Test: Independent tasks really run concurrently
/// Given 3 tasks that each wait for the other two to start
/// When executed with pool size 3
/// Then all three complete
#[test]
fn test_independent_tasks_run_concurrently() {
    let harness = Harness::new(3);
    let started = Arc::new(AtomicUsize::new(0));
    let ids: Vec<TaskId> = (0..3)
        .map(|i| {
            let started = Arc::clone(&started);
            harness.add(TaskSpec::new(format!("peer-{}", i), move || {
                started.fetch_add(1, Ordering::SeqCst);
                while started.load(Ordering::SeqCst) < 3 {
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(json!(i))
            }))
        })
        .collect();

    let outcomes = harness
        .orchestrator
        .execute_tasks_parallel(&set(&ids))
        .unwrap();

    assert!(outcomes.values().all(|o| o.is_ok()));
}

/// Test: Capacity bounds each wave
/// Given 6 independent tasks and a pool of 2
/// When executed in parallel
/// Then no more than 2 run at once and all complete
#[test]
fn test_capacity_bounds_waves() {
    let harness = Harness::new(2);
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let ids: Vec<TaskId> = (0..6)
        .map(|i| {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            harness.add(TaskSpec::new(format!("t{}", i), move || {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(5));
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(Value::Null)
            }))
        })
        .collect();

    let outcomes = harness
        .orchestrator
        .execute_tasks_parallel(&set(&ids))
        .unwrap();

    assert_eq!(outcomes.len(), 6);
    assert!(peak.load(Ordering::SeqCst) <= 2);
}

/// Test: Diamond resolves across waves
/// Given top <- {left, right} <- bottom
/// When executed in parallel
/// Then bottom starts only after both middles complete
#[test]
fn test_diamond_waves() {
    let harness = Harness::new(4);
    let [top, left, right, bottom] = diamond(&harness);

    let outcomes = harness
        .orchestrator
        .execute_tasks_parallel(&set(&[top, left, right, bottom]))
        .unwrap();

    assert_eq!(outcomes[&bottom], Ok(json!("bottom")));
    let bottom_started = harness.position(SignalType::TaskStarted, bottom).unwrap();
    for middle in [left, right] {
        assert!(harness.position(SignalType::TaskCompleted, middle).unwrap() < bottom_started);
    }
}

/// Test: Long chain completes in order
/// Given a chain of 8 tasks
/// When executed in parallel
/// Then start order follows the chain
#[test]
fn test_chain_runs_in_order() {
    let harness = Harness::new(4);
    let ids = chain(&harness, 8);

    let outcomes = harness
        .orchestrator
        .execute_tasks_parallel(&set(&ids))
        .unwrap();

    assert_eq!(outcomes.len(), 8);
    assert_eq!(harness.start_order(), ids);
}

/// Test: Failure propagates without running dependents
/// Given a failing task with two dependents and an unrelated task
/// When executed in parallel
/// Then dependents fail with DependencyFailed and never start
#[test]
fn test_failed_dependency_propagates() {
    let harness = Harness::new(2);
    let bad = harness.add(TaskSpec::new("bad", fails("corrupt input")));
    let d1 = harness.add(TaskSpec::new("d1", returns(Value::Null)).depends_on(bad));
    let d2 = harness.add(TaskSpec::new("d2", returns(Value::Null)).depends_on(d1));
    let fine = independent_tasks(&harness, 1)[0];

    let outcomes = harness
        .orchestrator
        .execute_tasks_parallel(&set(&[bad, d1, d2, fine]))
        .unwrap();

    assert_eq!(
        outcomes[&bad],
        Err(TaskFailure::Work {
            message: "corrupt input".to_string()
        })
    );
    assert_eq!(
        outcomes[&d1],
        Err(TaskFailure::DependencyFailed {
            dependency: bad,
            state: TaskState::Failed
        })
    );
    assert!(matches!(
        outcomes[&d2],
        Err(TaskFailure::DependencyFailed { dependency, .. }) if dependency == d1
    ));
    assert_eq!(outcomes[&fine], Ok(json!(0)));
    for dependent in [d1, d2] {
        assert_eq!(harness.count(SignalType::TaskStarted, dependent), 0);
        assert_eq!(harness.count(SignalType::TaskFailed, dependent), 1);
    }
}

/// Test: Cancelled dependency blocks dependents
/// Given A cancelled and B depending on A
/// When B is executed in parallel
/// Then B fails with DependencyFailed naming the cancelled state
#[test]
fn test_cancelled_dependency_blocks() {
    let harness = Harness::new(2);
    let a = harness.add(TaskSpec::new("a", returns(Value::Null)));
    let b = harness.add(TaskSpec::new("b", returns(Value::Null)).depends_on(a));
    harness.orchestrator.cancel_task(&a).unwrap();

    let outcomes = harness
        .orchestrator
        .execute_tasks_parallel(&set(&[b]))
        .unwrap();

    assert_eq!(
        outcomes[&b],
        Err(TaskFailure::DependencyFailed {
            dependency: a,
            state: TaskState::Cancelled
        })
    );
}

/// Test: Late registration wires a dangling dependency
/// Given B declared on an id that is registered afterwards
/// When both are executed in parallel
/// Then B waits for the late task and completes
#[test]
fn test_dependency_registered_later() {
    let harness = Harness::new(2);
    let late_id = TaskId::new();
    let b = harness.add(TaskSpec::new("b", returns(json!("b"))).depends_on(late_id));
    let late = harness.add(TaskSpec::new("late", returns(json!("late"))).with_id(late_id));

    let outcomes = harness
        .orchestrator
        .execute_tasks_parallel(&set(&[b, late]))
        .unwrap();

    assert_eq!(outcomes[&b], Ok(json!("b")));
    assert_eq!(harness.start_order(), vec![late, b]);
}

/// Test: Batch member running on another thread
/// Given a gated task started by a concurrent execute_task call
/// When a parallel batch containing it and its dependent runs
/// Then the batch waits and reports both outcomes
#[test]
fn test_batch_waits_for_member_running_elsewhere() {
    let harness = Arc::new(Harness::new(2));
    let gate = Gate::new();
    let slow = harness.add(TaskSpec::new("slow", gate.work(json!("slow"))));
    let after = harness.add(TaskSpec::new("after", returns(json!("after"))).depends_on(slow));

    let runner = {
        let harness = Arc::clone(&harness);
        thread::spawn(move || harness.orchestrator.execute_task(&slow))
    };
    while harness.orchestrator.task_state(&slow) != Some(TaskState::Running) {
        thread::sleep(Duration::from_millis(1));
    }

    let batch = {
        let harness = Arc::clone(&harness);
        thread::spawn(move || {
            harness
                .orchestrator
                .execute_tasks_parallel(&set(&[slow, after]))
        })
    };
    thread::sleep(Duration::from_millis(10));
    gate.release(1);

    let outcomes = batch.join().unwrap().unwrap();
    runner.join().unwrap().unwrap().unwrap();
    assert_eq!(outcomes[&slow], Ok(json!("slow")));
    assert_eq!(outcomes[&after], Ok(json!("after")));
    assert_eq!(harness.count(SignalType::TaskStarted, slow), 1);
}

/// Test: Every outcome is reported
/// Given an empty batch
/// When executed in parallel
/// Then the outcome map is empty and nothing is emitted
#[test]
fn test_empty_batch() {
    let harness = Harness::new(2);
    let outcomes = harness
        .orchestrator
        .execute_tasks_parallel(&set(&[]))
        .unwrap();

    assert!(outcomes.is_empty());
    assert!(harness.events().is_empty());
}
