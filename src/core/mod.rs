//! Core domain models for the scheduler.
//!
//! This module contains the task record, the dependency graph arena, and the
//! registry that owns task state and enforces the state machine.

pub mod dag;
pub mod registry;
pub mod task;

pub use dag::DependencyGraph;
pub use registry::{Readiness, TaskRegistry, Transition};
pub use task::{
    BoxError, Task, TaskFailure, TaskId, TaskOutcome, TaskSpec, TaskState, Work, WorkResult,
};
