//! Lifecycle signals and the bus that fans them out.
//!
//! The bus is an explicit instance owned by (or shared between) orchestrators;
//! there is no process-wide emitter.

pub mod bus;
pub mod signal;

pub use bus::{HistoryFilter, Publisher, SignalBus, SubscriberResult};
pub use signal::{Signal, SignalId, SignalType};
