//! Task data model for the scheduler.
//!
//! A [`Task`] is the schedulable record the registry owns; a [`TaskSpec`] is
//! what callers hand to `create_task`. The opaque unit of work travels
//! alongside as [`Work`] and is never exposed through snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Error type returned by work callables.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// What a work callable produces.
pub type WorkResult = std::result::Result<Value, BoxError>;

/// Per-task outcome reported by the execution APIs.
pub type TaskOutcome = std::result::Result<Value, TaskFailure>;

/// Unique identifier for a task.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Task state in its lifecycle.
///
/// ```text
/// Pending ──► Running ──► Completed | Failed
///    │
///    ├──────► Failed      (a dependency can never complete)
///    └──────► Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    /// Completed, Failed and Cancelled never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Pending, TaskState::Running)
                | (TaskState::Pending, TaskState::Failed)
                | (TaskState::Pending, TaskState::Cancelled)
                | (TaskState::Running, TaskState::Completed)
                | (TaskState::Running, TaskState::Failed)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Running => write!(f, "running"),
            TaskState::Completed => write!(f, "completed"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Why a task ended up FAILED.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TaskFailure {
    /// The work callable returned an error.
    Work { message: String },
    /// The work callable panicked.
    Panicked { message: String },
    /// The work callable gave up after its cancellation token fired.
    Interrupted { message: String },
    /// A dependency finished as Failed or Cancelled.
    DependencyFailed { dependency: TaskId, state: TaskState },
    /// Dependencies were unregistered or never got to run.
    DependencyNotSatisfied { pending: Vec<TaskId> },
}

impl TaskFailure {
    pub fn is_dependency_failure(&self) -> bool {
        matches!(
            self,
            TaskFailure::DependencyFailed { .. } | TaskFailure::DependencyNotSatisfied { .. }
        )
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskFailure::Work { message } => write!(f, "{}", message),
            TaskFailure::Panicked { message } => write!(f, "panicked: {}", message),
            TaskFailure::Interrupted { message } => write!(f, "interrupted: {}", message),
            TaskFailure::DependencyFailed { dependency, state } => {
                write!(f, "dependency {} ended as {}", dependency, state)
            }
            TaskFailure::DependencyNotSatisfied { pending } => {
                let ids: Vec<String> = pending.iter().map(TaskId::short).collect();
                write!(f, "dependencies not satisfied: {}", ids.join(", "))
            }
        }
    }
}

type WorkFn = Box<dyn FnOnce(&CancellationToken) -> WorkResult + Send + 'static>;

/// Opaque unit of work owned by a registered task.
pub struct Work(WorkFn);

impl Work {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() -> WorkResult + Send + 'static,
    {
        Self(Box::new(move |_| f()))
    }

    pub fn cancellable<F>(f: F) -> Self
    where
        F: FnOnce(&CancellationToken) -> WorkResult + Send + 'static,
    {
        Self(Box::new(f))
    }

    /// Run the callable, containing errors and panics as a [`TaskFailure`].
    pub fn run(self, token: &CancellationToken) -> TaskOutcome {
        let f = self.0;
        match catch_unwind(AssertUnwindSafe(|| f(token))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) if token.is_cancelled() => Err(TaskFailure::Interrupted {
                message: e.to_string(),
            }),
            Ok(Err(e)) => Err(TaskFailure::Work {
                message: e.to_string(),
            }),
            Err(payload) => Err(TaskFailure::Panicked {
                message: panic_message(payload.as_ref()),
            }),
        }
    }
}

impl std::fmt::Debug for Work {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Work(..)")
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// A task record owned by the registry.
///
/// Snapshots of this struct are handed out to callers; the mutable copy lives
/// only inside the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub description: String,
    /// Higher runs first among ready tasks.
    pub priority: i32,
    pub dependencies: BTreeSet<TaskId>,
    /// Opaque identity tag, passed through to signals.
    pub agent_id: Option<String>,
    /// Group parent, used by task-group execution.
    pub parent_id: Option<TaskId>,
    pub metadata: Map<String, Value>,
    /// Registration order; breaks priority ties.
    pub sequence: u64,
    pub state: TaskState,
    pub result: Option<Value>,
    pub error: Option<TaskFailure>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Wall time between start and finish, when both happened.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// The recorded outcome, once terminal.
    ///
    /// Cancelled tasks have neither result nor error and yield `None`.
    pub fn outcome(&self) -> Option<TaskOutcome> {
        match self.state {
            TaskState::Completed => Some(Ok(self.result.clone().unwrap_or(Value::Null))),
            TaskState::Failed => self.error.clone().map(Err),
            _ => None,
        }
    }
}

/// Everything needed to create a task.
///
/// # Example
///
/// ```
/// use conductor::TaskSpec;
/// use serde_json::json;
///
/// let spec = TaskSpec::new("fetch", || Ok(json!("ok")))
///     .priority(5)
///     .agent("researcher");
/// assert_eq!(spec.name(), "fetch");
/// ```
#[derive(Debug)]
pub struct TaskSpec {
    pub(crate) id: TaskId,
    pub(crate) name: String,
    pub(crate) description: String,
    pub(crate) priority: i32,
    pub(crate) dependencies: BTreeSet<TaskId>,
    pub(crate) agent_id: Option<String>,
    pub(crate) parent_id: Option<TaskId>,
    pub(crate) metadata: Map<String, Value>,
    pub(crate) work: Work,
}

impl TaskSpec {
    pub fn new<F>(name: impl Into<String>, work: F) -> Self
    where
        F: FnOnce() -> WorkResult + Send + 'static,
    {
        Self::with_work(name, Work::new(work))
    }

    /// Work that receives a token it may poll to stop early.
    pub fn cancellable<F>(name: impl Into<String>, work: F) -> Self
    where
        F: FnOnce(&CancellationToken) -> WorkResult + Send + 'static,
    {
        Self::with_work(name, Work::cancellable(work))
    }

    pub fn with_work(name: impl Into<String>, work: Work) -> Self {
        Self {
            id: TaskId::new(),
            name: name.into(),
            description: String::new(),
            priority: 0,
            dependencies: BTreeSet::new(),
            agent_id: None,
            parent_id: None,
            metadata: Map::new(),
            work,
        }
    }

    /// Id the task will be registered under.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Register under a caller-chosen id instead of a generated one.
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, dependency: TaskId) -> Self {
        self.dependencies.insert(dependency);
        self
    }

    pub fn dependencies(mut self, dependencies: impl IntoIterator<Item = TaskId>) -> Self {
        self.dependencies.extend(dependencies);
        self
    }

    pub fn agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn parent(mut self, parent_id: TaskId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Split into the pending record and its work.
    pub(crate) fn into_parts(self, sequence: u64) -> (Task, Work) {
        let task = Task {
            id: self.id,
            name: self.name,
            description: self.description,
            priority: self.priority,
            dependencies: self.dependencies,
            agent_id: self.agent_id,
            parent_id: self.parent_id,
            metadata: self.metadata,
            sequence,
            state: TaskState::Pending,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        (task, self.work)
    }
}
