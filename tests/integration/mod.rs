//! Integration test suite for conductor.
//!
//! These tests drive the public `Orchestrator` API end to end and observe
//! behaviour through the signal bus, the way an external consumer would.
//!
//! # Test Categories
//!
//! - `parallel_execution`: wave scheduling, ordering and dependency handling
//! - `sequential_execution`: ordered batches and per-task outcome maps
//! - `signals`: bus delivery, history and isolation of failing subscribers
//! - `cancellation`: cancel, interrupt and shutdown behaviour
//! - `configuration`: TOML config and file logging

mod fixtures;

mod parallel_execution;
mod sequential_execution;
