//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - An orchestrator wired to a recording subscriber
//! - Work callables that succeed, fail, or block until released
//! - Predefined task shapes (independent, chain, diamond)

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};
use serde_json::{json, Value};

use conductor::{
    Orchestrator, OrchestratorConfig, Signal, SignalBus, SignalType, TaskId, TaskSpec,
    WorkResult,
};

/// An orchestrator plus an ordered record of every signal it published.
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub bus: Arc<SignalBus>,
    pub signals: Arc<Mutex<Vec<Signal>>>,
}

impl Harness {
    /// Create a harness with the given worker pool size.
    pub fn new(workers: usize) -> Self {
        let bus = Arc::new(SignalBus::new(1000));
        let signals = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&signals);
        bus.subscribe(
            "recorder",
            SignalType::ALL.into_iter().collect(),
            move |signal: &Signal| {
                sink.lock().unwrap().push(signal.clone());
                Ok(())
            },
        );
        let orchestrator =
            Orchestrator::with_bus(OrchestratorConfig::with_workers(workers), Arc::clone(&bus))
                .expect("Failed to build orchestrator");

        Self {
            orchestrator,
            bus,
            signals,
        }
    }

    /// Register a task, panicking on misuse.
    pub fn add(&self, spec: TaskSpec) -> TaskId {
        self.orchestrator
            .create_task(spec)
            .expect("Failed to create task")
    }

    /// Recorded signals as `(type, task)` pairs, in emission order.
    pub fn events(&self) -> Vec<(SignalType, Option<TaskId>)> {
        self.signals
            .lock()
            .unwrap()
            .iter()
            .map(|s| (s.signal_type, s.task_id))
            .collect()
    }

    /// Position of the first signal of `signal_type` for `task_id`.
    pub fn position(&self, signal_type: SignalType, task_id: TaskId) -> Option<usize> {
        self.events()
            .iter()
            .position(|(t, id)| *t == signal_type && *id == Some(task_id))
    }

    /// Ids of tasks in the order their TASK_STARTED signals were emitted.
    pub fn start_order(&self) -> Vec<TaskId> {
        self.events()
            .into_iter()
            .filter(|(t, _)| *t == SignalType::TaskStarted)
            .filter_map(|(_, id)| id)
            .collect()
    }

    /// Number of signals of `signal_type` recorded for `task_id`.
    pub fn count(&self, signal_type: SignalType, task_id: TaskId) -> usize {
        self.events()
            .iter()
            .filter(|(t, id)| *t == signal_type && *id == Some(task_id))
            .count()
    }
}

/// Work that returns `value`.
pub fn returns(value: Value) -> impl FnOnce() -> WorkResult + Send + 'static {
    move || Ok(value)
}

/// Work that fails with `message`.
pub fn fails(message: &str) -> impl FnOnce() -> WorkResult + Send + 'static {
    let message = message.to_string();
    move || Err(message.into())
}

/// A gate that holds work until the test releases it.
pub struct Gate {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Gate {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    /// Work that blocks until [`Gate::release`] and then returns `value`.
    pub fn work(&self, value: Value) -> impl FnOnce() -> WorkResult + Send + 'static {
        let rx = self.rx.clone();
        move || {
            rx.recv()?;
            Ok(value)
        }
    }

    pub fn release(&self, n: usize) {
        for _ in 0..n {
            self.tx.send(()).unwrap();
        }
    }
}

/// `n` independent tasks returning their index.
pub fn independent_tasks(harness: &Harness, n: usize) -> Vec<TaskId> {
    (0..n)
        .map(|i| harness.add(TaskSpec::new(format!("task-{}", i), returns(json!(i)))))
        .collect()
}

/// A linear chain `t0 <- t1 <- ... <- t(n-1)`.
pub fn chain(harness: &Harness, n: usize) -> Vec<TaskId> {
    let mut ids: Vec<TaskId> = Vec::with_capacity(n);
    for i in 0..n {
        let mut spec = TaskSpec::new(format!("link-{}", i), returns(json!(i)));
        if let Some(prev) = ids.last() {
            spec = spec.depends_on(*prev);
        }
        ids.push(harness.add(spec));
    }
    ids
}

/// Diamond `top <- {left, right} <- bottom`, returned in that order.
pub fn diamond(harness: &Harness) -> [TaskId; 4] {
    let top = harness.add(TaskSpec::new("top", returns(json!("top"))));
    let left = harness.add(TaskSpec::new("left", returns(json!("left"))).depends_on(top));
    let right = harness.add(TaskSpec::new("right", returns(json!("right"))).depends_on(top));
    let bottom = harness.add(
        TaskSpec::new("bottom", returns(json!("bottom"))).dependencies([left, right]),
    );
    [top, left, right, bottom]
}

pub fn set(ids: &[TaskId]) -> HashSet<TaskId> {
    ids.iter().copied().collect()
}
