//! Sequential execution tests.
//!
//! These tests verify ordered batch execution and that per-task failures
//! are reported in the outcome map rather than raised.

use serde_json::{json, Value};

use conductor::{Error, ExecutionMode, SignalType, TaskFailure, TaskId, TaskSpec, TaskState};

use crate::fixtures::{chain, fails, returns, Harness};

/// Test: A failure does not hide earlier results
/// Given t1 succeeding and t2 failing
/// When executed sequentially
/// Then t1's result and t2's error are both in the map
#[test]
fn test_failure_keeps_earlier_results() {
    let harness = Harness::new(1);
    let t1 = harness.add(TaskSpec::new("t1", returns(json!("first"))));
    let t2 = harness.add(TaskSpec::new("t2", fails("bad checksum")));

    let outcomes = harness
        .orchestrator
        .execute_tasks_sequential(&[t1, t2])
        .unwrap();

    assert_eq!(outcomes[&t1], Ok(json!("first")));
    assert_eq!(
        outcomes[&t2],
        Err(TaskFailure::Work {
            message: "bad checksum".to_string()
        })
    );
}

/// Test: Tasks after a failure still run
/// Given t1 failing and an unrelated t2
/// When executed sequentially
/// Then t2 completes
#[test]
fn test_continues_after_failure() {
    let harness = Harness::new(1);
    let t1 = harness.add(TaskSpec::new("t1", fails("nope")));
    let t2 = harness.add(TaskSpec::new("t2", returns(json!(2))));

    let outcomes = harness
        .orchestrator
        .execute_tasks_sequential(&[t1, t2])
        .unwrap();

    assert!(outcomes[&t1].is_err());
    assert_eq!(outcomes[&t2], Ok(json!(2)));
}

/// Test: Chain in topological order
/// Given a chain of 4 tasks
/// When executed sequentially in chain order
/// Then every task completes in that order
#[test]
fn test_chain_in_order() {
    let harness = Harness::new(1);
    let ids = chain(&harness, 4);

    let outcomes = harness
        .orchestrator
        .execute_tasks_sequential(&ids)
        .unwrap();

    assert_eq!(outcomes.len(), 4);
    assert_eq!(harness.start_order(), ids);
}

/// Test: Unregistered dependency
/// Given a task depending on an id that was never registered
/// When executed sequentially
/// Then it gets DependencyNotSatisfied and stays pending
#[test]
fn test_unregistered_dependency_reported() {
    let harness = Harness::new(1);
    let missing = TaskId::new();
    let orphan = harness.add(TaskSpec::new("orphan", returns(Value::Null)).depends_on(missing));

    let outcomes = harness
        .orchestrator
        .execute_tasks_sequential(&[orphan])
        .unwrap();

    assert_eq!(
        outcomes[&orphan],
        Err(TaskFailure::DependencyNotSatisfied {
            pending: vec![missing]
        })
    );
    assert_eq!(
        harness.orchestrator.task_state(&orphan),
        Some(TaskState::Pending)
    );
    assert!(harness.events().is_empty());
}

/// Test: Direct execution of an unready task
/// Given B depending on a pending A
/// When execute_task(B) is called
/// Then DependencyNotSatisfied is raised to the caller
#[test]
fn test_execute_task_raises_unsatisfied() {
    let harness = Harness::new(1);
    let a = harness.add(TaskSpec::new("a", returns(Value::Null)));
    let b = harness.add(TaskSpec::new("b", returns(Value::Null)).depends_on(a));

    let err = harness.orchestrator.execute_task(&b).unwrap_err();

    match err {
        Error::DependencyNotSatisfied { task_id, pending } => {
            assert_eq!(task_id, b);
            assert_eq!(pending, vec![a]);
        }
        other => panic!("Expected DependencyNotSatisfied, got {:?}", other),
    }
}

/// Test: Terminal state is monotonic
/// Given a completed task
/// When its state is read repeatedly and re-execution is attempted
/// Then it stays COMPLETED with the same result
#[test]
fn test_terminal_state_never_changes() {
    let harness = Harness::new(1);
    let id = harness.add(TaskSpec::new("once", returns(json!("value"))));
    harness.orchestrator.execute_task(&id).unwrap().unwrap();

    for _ in 0..3 {
        assert!(harness.orchestrator.execute_task(&id).is_err());
        assert!(harness.orchestrator.cancel_task(&id).is_err());
        let task = harness.orchestrator.task(&id).unwrap();
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(task.result, Some(json!("value")));
    }
    assert_eq!(harness.count(SignalType::TaskCompleted, id), 1);
}

/// Test: Sequential task group
/// Given a parent with three children
/// When the group is executed sequentially
/// Then children run in creation order
#[test]
fn test_task_group_sequential() {
    let harness = Harness::new(2);
    let parent = harness.add(TaskSpec::new("parent", returns(Value::Null)));
    let children: Vec<TaskId> = (0..3)
        .map(|i| harness.add(TaskSpec::new(format!("child-{}", i), returns(json!(i))).parent(parent)))
        .collect();

    let outcomes = harness
        .orchestrator
        .execute_task_group(&parent, ExecutionMode::Sequential)
        .unwrap();

    assert_eq!(outcomes.len(), 3);
    assert_eq!(harness.start_order(), children);
}

/// Test: Duplicate registration
/// Given a registered id
/// When another task is created with the same id
/// Then DuplicateTask is raised and the original is untouched
#[test]
fn test_duplicate_registration() {
    let harness = Harness::new(1);
    let id = harness.add(TaskSpec::new("original", returns(Value::Null)));

    let err = harness
        .orchestrator
        .create_task(TaskSpec::new("impostor", returns(Value::Null)).with_id(id))
        .unwrap_err();

    assert!(matches!(err, Error::DuplicateTask(dup) if dup == id));
    assert_eq!(harness.orchestrator.task(&id).unwrap().name, "original");
}

/// Test: Cycle rejected at creation
/// Given A depending on a not-yet-registered id X
/// When X is created depending on A
/// Then DependencyCycle is raised and X is not registered
#[test]
fn test_cycle_rejected() {
    let harness = Harness::new(1);
    let x = TaskId::new();
    let a = harness.add(TaskSpec::new("a", returns(Value::Null)).depends_on(x));

    let err = harness
        .orchestrator
        .create_task(TaskSpec::new("x", returns(Value::Null)).with_id(x).depends_on(a))
        .unwrap_err();

    assert!(matches!(err, Error::DependencyCycle { .. }));
    assert!(harness.orchestrator.task(&x).is_none());
}
