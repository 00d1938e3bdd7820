use thiserror::Error;

use crate::core::task::{TaskId, TaskState};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Task already registered: {0}")]
    DuplicateTask(TaskId),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Invalid transition for task {task_id} from {from} to {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskState,
        to: TaskState,
    },

    #[error("Dependencies not satisfied for task {task_id}: waiting on {pending:?}")]
    DependencyNotSatisfied {
        task_id: TaskId,
        pending: Vec<TaskId>,
    },

    #[error("Dependency cycle detected at task {task_id}")]
    DependencyCycle { task_id: TaskId },

    #[error("Task {task_id} is not running (state: {state})")]
    NotRunning { task_id: TaskId, state: TaskState },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Orchestrator is shut down")]
    ShutDown,
}

pub type Result<T> = std::result::Result<T, Error>;
