//! Task registry: the single owner of task state.
//!
//! Every state change goes through [`TaskRegistry::transition`] (or one of its
//! thin wrappers), which validates the move against the state machine, stamps
//! timestamps, and publishes exactly one signal for it. Each call is a single
//! critical section; signals are published after the lock is released and no
//! lock is ever held while work runs.
//!
//! Because publishing happens outside the lock, a reader on another thread can
//! observe a task's new state shortly before its signal reaches subscribers.
//! The reverse never happens: a subscriber always finds the registry already
//! reporting the state its signal announces. Signals for one task are
//! published in lifecycle order since its transitions are made by whichever
//! thread currently owns it (the dispatcher before the work is handed off, the
//! executing thread after).

use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

use crate::core::dag::DependencyGraph;
use crate::core::task::{Task, TaskFailure, TaskId, TaskSpec, TaskState, Work};
use crate::error::{Error, Result};
use crate::signals::{Publisher, Signal, SignalType};
use crate::{clog, clog_debug, clog_error, clog_warn};

/// A requested state change.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Start,
    Complete(Value),
    Fail(TaskFailure),
    Cancel,
}

impl Transition {
    pub fn target(&self) -> TaskState {
        match self {
            Transition::Start => TaskState::Running,
            Transition::Complete(_) => TaskState::Completed,
            Transition::Fail(_) => TaskState::Failed,
            Transition::Cancel => TaskState::Cancelled,
        }
    }
}

/// Why a task can or cannot run right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Pending and every dependency completed.
    Ready,
    /// Some dependencies are still pending or running.
    Waiting { pending: Vec<TaskId> },
    /// Some dependency ids are not registered.
    Missing { missing: Vec<TaskId> },
    /// A dependency ended as Failed or Cancelled; this task can never run.
    Blocked {
        dependency: TaskId,
        state: TaskState,
    },
    /// The task itself is no longer pending.
    NotPending(TaskState),
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

/// A task snapshot paired with its readiness, taken under one lock.
#[derive(Debug, Clone)]
pub struct Assessment {
    pub task: Task,
    pub readiness: Readiness,
    /// Dependencies that were RUNNING in the same snapshot.
    pub running: Vec<TaskId>,
}

struct Entry {
    task: Task,
    work: Option<Work>,
    token: CancellationToken,
}

struct RegistryInner {
    graph: DependencyGraph,
    entries: HashMap<TaskId, Entry>,
    next_sequence: u64,
}

impl RegistryInner {
    fn readiness(&self, task: &Task) -> Readiness {
        if task.state != TaskState::Pending {
            return Readiness::NotPending(task.state);
        }

        let mut pending = Vec::new();
        let mut missing = Vec::new();
        for dep in &task.dependencies {
            match self.entries.get(dep).map(|e| e.task.state) {
                None => missing.push(*dep),
                Some(TaskState::Completed) => {}
                Some(state @ (TaskState::Failed | TaskState::Cancelled)) => {
                    return Readiness::Blocked {
                        dependency: *dep,
                        state,
                    };
                }
                Some(TaskState::Pending | TaskState::Running) => pending.push(*dep),
            }
        }

        if !missing.is_empty() {
            Readiness::Missing { missing }
        } else if !pending.is_empty() {
            Readiness::Waiting { pending }
        } else {
            Readiness::Ready
        }
    }

    fn running_dependencies(&self, task: &Task) -> Vec<TaskId> {
        task.dependencies
            .iter()
            .filter(|dep| {
                self.entries
                    .get(dep)
                    .is_some_and(|e| e.task.state == TaskState::Running)
            })
            .copied()
            .collect()
    }

    fn tasks_sorted(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.entries.values().map(|e| e.task.clone()).collect();
        tasks.sort_by_key(|t| t.sequence);
        tasks
    }
}

/// Orders tasks for dispatch: priority descending, then creation order.
pub fn dispatch_order(a: &Task, b: &Task) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.sequence.cmp(&b.sequence))
}

/// Thread-safe owner of task records and the dependency graph.
pub struct TaskRegistry {
    inner: Mutex<RegistryInner>,
    /// Notified after every transition.
    changed: Condvar,
    publisher: Arc<dyn Publisher>,
}

impl TaskRegistry {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                graph: DependencyGraph::new(),
                entries: HashMap::new(),
                next_sequence: 0,
            }),
            changed: Condvar::new(),
            publisher,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a new PENDING task.
    ///
    /// # Errors
    /// - [`Error::DuplicateTask`] if the id is already registered
    /// - [`Error::DependencyCycle`] for self-dependencies or cycles closed by
    ///   this registration
    pub fn register(&self, spec: TaskSpec) -> Result<TaskId> {
        let mut inner = self.lock();
        let id = spec.id;
        if inner.entries.contains_key(&id) {
            clog_warn!("Rejected duplicate task {}", id);
            return Err(Error::DuplicateTask(id));
        }

        inner.graph.add_task(id, &spec.dependencies)?;

        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        let (task, work) = spec.into_parts(sequence);
        clog!(
            "Created task {} ({}) priority={} dependencies={}",
            task.id.short(),
            task.name,
            task.priority,
            task.dependencies.len()
        );
        inner.entries.insert(
            id,
            Entry {
                task,
                work: Some(work),
                token: CancellationToken::new(),
            },
        );
        Ok(id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.lock().entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Snapshot of a task.
    pub fn get(&self, id: &TaskId) -> Option<Task> {
        self.lock().entries.get(id).map(|e| e.task.clone())
    }

    pub fn state(&self, id: &TaskId) -> Option<TaskState> {
        self.lock().entries.get(id).map(|e| e.task.state)
    }

    pub fn readiness(&self, id: &TaskId) -> Result<Readiness> {
        let inner = self.lock();
        let entry = inner.entries.get(id).ok_or(Error::TaskNotFound(*id))?;
        Ok(inner.readiness(&entry.task))
    }

    /// True iff the task is PENDING and all its dependencies COMPLETED.
    ///
    /// Unknown ids are never ready.
    pub fn is_ready(&self, id: &TaskId) -> bool {
        matches!(self.readiness(id), Ok(Readiness::Ready))
    }

    /// Snapshots and readiness for `ids`, in the given order. Unknown ids are skipped.
    pub fn assess(&self, ids: &[TaskId]) -> Vec<Assessment> {
        let inner = self.lock();
        ids.iter()
            .filter_map(|id| inner.entries.get(id))
            .map(|entry| Assessment {
                readiness: inner.readiness(&entry.task),
                running: inner.running_dependencies(&entry.task),
                task: entry.task.clone(),
            })
            .collect()
    }

    /// All ready tasks in dispatch order.
    pub fn ready_tasks(&self) -> Vec<Task> {
        let inner = self.lock();
        let mut ready: Vec<Task> = inner
            .entries
            .values()
            .filter(|e| inner.readiness(&e.task).is_ready())
            .map(|e| e.task.clone())
            .collect();
        ready.sort_by(dispatch_order);
        ready
    }

    /// All tasks in creation order.
    pub fn all(&self) -> Vec<Task> {
        self.lock().tasks_sorted()
    }

    pub fn by_state(&self, state: TaskState) -> Vec<Task> {
        self.all().into_iter().filter(|t| t.state == state).collect()
    }

    /// Tasks created with `parent` as their group parent, in creation order.
    pub fn children(&self, parent: &TaskId) -> Vec<Task> {
        self.all()
            .into_iter()
            .filter(|t| t.parent_id.as_ref() == Some(parent))
            .collect()
    }

    /// Registered tasks that declare `id` as a dependency.
    pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
        self.lock().graph.dependents_of(id)
    }

    pub fn topological_order(&self) -> Result<Vec<TaskId>> {
        self.lock().graph.topological_order()
    }

    /// Whether any task is still PENDING or RUNNING.
    pub fn has_unfinished(&self) -> bool {
        self.lock().entries.values().any(|e| !e.task.is_terminal())
    }

    /// Apply a state change and publish its signal.
    ///
    /// Returns the task snapshot after the change.
    ///
    /// # Errors
    /// - [`Error::TaskNotFound`] for unknown ids
    /// - [`Error::InvalidTransition`] if the state machine forbids the move
    pub fn transition(&self, id: &TaskId, transition: Transition) -> Result<Task> {
        self.apply(id, transition).map(|(task, _)| task)
    }

    /// Move a PENDING task to RUNNING and hand out its work and token.
    pub fn start(&self, id: &TaskId) -> Result<(Work, CancellationToken)> {
        let (task, claimed) = self.apply(id, Transition::Start)?;
        claimed.ok_or_else(|| Error::InvalidTransition {
            task_id: task.id,
            from: TaskState::Pending,
            to: TaskState::Running,
        })
    }

    /// Cancel a task that has not started yet.
    pub fn cancel(&self, id: &TaskId) -> Result<Task> {
        self.transition(id, Transition::Cancel)
    }

    /// Ask running work to stop by firing its cancellation token.
    ///
    /// The state machine is untouched; the work decides how to finish.
    pub fn interrupt(&self, id: &TaskId) -> Result<()> {
        let inner = self.lock();
        let entry = inner.entries.get(id).ok_or(Error::TaskNotFound(*id))?;
        if entry.task.state != TaskState::Running {
            return Err(Error::NotRunning {
                task_id: *id,
                state: entry.task.state,
            });
        }
        entry.token.cancel();
        clog_debug!("Interrupt requested for task {}", id.short());
        Ok(())
    }

    /// Fail a PENDING task whose dependencies can make no progress.
    ///
    /// Readiness is re-checked under the same lock as the transition. Returns
    /// `Ok(None)` and changes nothing when the task is no longer pending, has
    /// become ready or blocked, or any of its dependencies is RUNNING.
    pub fn fail_stalled(&self, id: &TaskId) -> Result<Option<Task>> {
        let (snapshot, signal) = {
            let mut inner = self.lock();
            let entry = inner.entries.get(id).ok_or(Error::TaskNotFound(*id))?;
            let pending = match inner.readiness(&entry.task) {
                Readiness::Waiting { pending } => pending,
                Readiness::Missing { missing } => missing,
                _ => return Ok(None),
            };
            if !inner.running_dependencies(&entry.task).is_empty() {
                return Ok(None);
            }
            let failure = TaskFailure::DependencyNotSatisfied { pending };
            let (task, signal, _) =
                Self::apply_locked(&mut inner, id, Transition::Fail(failure))?;
            (task, signal)
        };

        self.publisher.publish(signal);
        self.changed.notify_all();
        Ok(Some(snapshot))
    }

    fn apply(
        &self,
        id: &TaskId,
        transition: Transition,
    ) -> Result<(Task, Option<(Work, CancellationToken)>)> {
        let (snapshot, signal, claimed) = {
            let mut inner = self.lock();
            Self::apply_locked(&mut inner, id, transition)?
        };

        self.publisher.publish(signal);
        self.changed.notify_all();
        Ok((snapshot, claimed))
    }

    /// Validate and apply a transition; the caller publishes the signal.
    fn apply_locked(
        inner: &mut RegistryInner,
        id: &TaskId,
        transition: Transition,
    ) -> Result<(Task, Signal, Option<(Work, CancellationToken)>)> {
        let entry = inner.entries.get_mut(id).ok_or(Error::TaskNotFound(*id))?;
        let from = entry.task.state;
        let to = transition.target();
        if !from.can_transition_to(to) {
            clog_warn!(
                "Rejected transition for task {} from {} to {}",
                id.short(),
                from,
                to
            );
            return Err(Error::InvalidTransition {
                task_id: *id,
                from,
                to,
            });
        }

        let now = Utc::now();
        let task = &mut entry.task;
        task.state = to;
        let mut claimed = None;
        match transition {
            Transition::Start => {
                task.started_at = Some(now);
                claimed = entry
                    .work
                    .take()
                    .map(|work| (work, entry.token.clone()));
            }
            Transition::Complete(value) => {
                task.finished_at = Some(now);
                task.result = Some(value);
            }
            Transition::Fail(failure) => {
                task.finished_at = Some(now);
                task.error = Some(failure);
            }
            Transition::Cancel => {
                task.finished_at = Some(now);
                entry.work = None;
            }
        }

        let task = entry.task.clone();
        log_transition(&task);
        let signal = signal_for(&task);
        Ok((task, signal, claimed))
    }

    /// Block until the task is terminal and return its final snapshot.
    pub fn wait_until_terminal(&self, id: &TaskId) -> Result<Task> {
        let mut inner = self.lock();
        loop {
            let entry = inner.entries.get(id).ok_or(Error::TaskNotFound(*id))?;
            if entry.task.is_terminal() {
                return Ok(entry.task.clone());
            }
            inner = self
                .changed
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until at least one of `ids` is terminal (or unknown).
    pub fn wait_any_terminal(&self, ids: &[TaskId]) {
        let mut inner = self.lock();
        loop {
            let done = ids.iter().any(|id| {
                inner
                    .entries
                    .get(id)
                    .map_or(true, |e| e.task.is_terminal())
            });
            if done || ids.is_empty() {
                return;
            }
            inner = self
                .changed
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("TaskRegistry")
            .field("tasks", &inner.entries.len())
            .field("graph", &inner.graph)
            .finish()
    }
}

fn log_transition(task: &Task) {
    match task.state {
        TaskState::Running => clog_debug!("Started task {} ({})", task.id.short(), task.name),
        TaskState::Completed => clog!(
            "Completed task {} ({}) in {}ms",
            task.id.short(),
            task.name,
            task.duration().map_or(0, |d| d.num_milliseconds())
        ),
        TaskState::Failed => clog_error!(
            "Failed task {} ({}): {}",
            task.id.short(),
            task.name,
            task.error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default()
        ),
        TaskState::Cancelled => clog!("Cancelled task {} ({})", task.id.short(), task.name),
        TaskState::Pending => {}
    }
}

/// Build the lifecycle signal for a task that just changed state.
fn signal_for(task: &Task) -> Signal {
    let signal_type = match task.state {
        TaskState::Running | TaskState::Pending => SignalType::TaskStarted,
        TaskState::Completed => SignalType::TaskCompleted,
        TaskState::Failed => SignalType::TaskFailed,
        TaskState::Cancelled => SignalType::TaskCancelled,
    };
    let signal = Signal::for_task(signal_type, task.id)
        .with_agent(task.agent_id.clone())
        .with("name", json!(task.name));

    let duration_ms = task.duration().map(|d| d.num_milliseconds());
    match task.state {
        TaskState::Running | TaskState::Pending => signal.with("priority", json!(task.priority)),
        TaskState::Completed => signal
            .with("result", task.result.clone().unwrap_or(Value::Null))
            .with("duration_ms", json!(duration_ms)),
        TaskState::Failed => {
            let error = task
                .error
                .as_ref()
                .and_then(|e| serde_json::to_value(e).ok())
                .unwrap_or(Value::Null);
            let message = task.error.as_ref().map(ToString::to_string);
            signal
                .with("error", error)
                .with("message", json!(message))
                .with("duration_ms", json!(duration_ms))
        }
        TaskState::Cancelled => signal,
    }
}
