//! Immutable lifecycle event records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::core::task::TaskId;

/// Kinds of signals the bus carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
    AgentReady,
    AgentBusy,
}

impl SignalType {
    pub const ALL: [SignalType; 6] = [
        SignalType::TaskStarted,
        SignalType::TaskCompleted,
        SignalType::TaskFailed,
        SignalType::TaskCancelled,
        SignalType::AgentReady,
        SignalType::AgentBusy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::TaskStarted => "task_started",
            SignalType::TaskCompleted => "task_completed",
            SignalType::TaskFailed => "task_failed",
            SignalType::TaskCancelled => "task_cancelled",
            SignalType::AgentReady => "agent_ready",
            SignalType::AgentBusy => "agent_busy",
        }
    }

    /// Whether this signal ends a task's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SignalType::TaskCompleted | SignalType::TaskFailed | SignalType::TaskCancelled
        )
    }
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalId(pub Uuid);

impl SignalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SignalId {
    fn default() -> Self {
        Self::new()
    }
}

/// A lifecycle event.
///
/// Signals are built once and never mutated after emission; subscribers and
/// the history buffer only ever see shared references or clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: SignalId,
    pub signal_type: SignalType,
    /// Absent for agent-only signals.
    pub task_id: Option<TaskId>,
    pub agent_id: Option<String>,
    /// Structured data; keys depend on `signal_type`.
    pub payload: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl Signal {
    pub fn new(signal_type: SignalType) -> Self {
        Self {
            id: SignalId::new(),
            signal_type,
            task_id: None,
            agent_id: None,
            payload: Map::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn for_task(signal_type: SignalType, task_id: TaskId) -> Self {
        Self::new(signal_type).with_task(task_id)
    }

    pub fn agent_ready(agent_id: impl Into<String>) -> Self {
        Self::new(SignalType::AgentReady).with_agent(Some(agent_id.into()))
    }

    pub fn agent_busy(agent_id: impl Into<String>, task_id: TaskId) -> Self {
        Self::new(SignalType::AgentBusy)
            .with_agent(Some(agent_id.into()))
            .with_task(task_id)
    }

    pub fn with_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_agent(mut self, agent_id: Option<String>) -> Self {
        self.agent_id = agent_id;
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}
