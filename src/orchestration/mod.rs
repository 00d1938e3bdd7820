//! Orchestration layer: the bounded worker pool and the wave scheduler that
//! drives registered tasks through it.

mod orchestrator;
mod pool;

pub use orchestrator::{ExecutionMode, Orchestrator, Outcomes};
pub use pool::{PoolHandle, WorkerPool};
