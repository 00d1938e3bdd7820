//! Conductor: a signal-driven task orchestration engine.
//!
//! Tasks are registered with dependencies and priorities, executed one at a
//! time or in parallel waves on a bounded worker pool, and every lifecycle
//! change is published on a [`SignalBus`] for observers.

pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod signals;

pub use config::OrchestratorConfig;
pub use crate::core::{
    Readiness, Task, TaskFailure, TaskId, TaskOutcome, TaskRegistry, TaskSpec, TaskState,
    WorkResult,
};
pub use error::{Error, Result};
pub use orchestration::{ExecutionMode, Orchestrator, Outcomes};
pub use signals::{HistoryFilter, Publisher, Signal, SignalBus, SignalType};
