//! Deterministic simulation of a lockstep replica group.
//!
//! The simulation runs every replica in one thread with simulated time:
//!
//! - A global event queue ordered by (time, priority, arrival) delivers
//!   messages, timer fires, and execution completions.
//! - [`SimulatedNetwork`] injects latency with jitter, packet loss,
//!   partitions; [`SimulationRunner::set_filter`] vetoes individual
//!   messages for fault scenarios.
//! - Each replica owns an in-memory [`StateStore`](lockstep_core::StateStore)
//!   and a [`MockExecutionEngine`]; [`SimulationRunner::restart_replica`]
//!   models a crash by rebuilding the protocol state from that store.
//!
//! Given the same seed and the same script, a run is bit-for-bit
//! reproducible.

mod engine;
mod network;
mod runner;

pub use engine::MockExecutionEngine;
pub use network::{SimulatedNetwork, SimulationConfig};
pub use runner::{MessageFilter, SimulationRunner, SimulationStats};
