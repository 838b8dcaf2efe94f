//! PBFT agreement core for ordered broadcast.
//!
//! This crate implements the replication protocol as a synchronous
//! event-driven state machine:
//!
//! - [`Event::ClientRequest`](lockstep_core::Event) → the primary assigns a
//!   sequence number and broadcasts a pre-prepare
//! - [`Event::MessageReceived`](lockstep_core::Event) → three-phase
//!   agreement, checkpoint tracking, view-change collection
//! - Timer events → null requests, primary suspicion, view-change escalation
//! - Execution callbacks → in-order delivery bookkeeping and checkpoints
//!
//! All I/O is performed by a runner via returned
//! [`Action`](lockstep_core::Action)s.
//!
//! # Safety properties
//!
//! - **Agreement**: conflicting pre-prepares for a slot are refused, and a
//!   commit quorum of `2f + 1` intersects every prepare quorum in a correct
//!   replica.
//! - **Total order**: requests reach the execution engine in strictly
//!   increasing sequence order with no gaps.
//! - **View changes cannot regress**: the new view's low watermark comes
//!   from checkpoint-quorum evidence, never from the union of prepared
//!   entries.
//!
//! # Liveness
//!
//! - Request timers and the backup null-request watchdog suspect a dead
//!   primary; `f + 1` view-change messages drag slow replicas along.
//! - Escalation past a failed view change is gated on a full view-change
//!   quorum, so a single partitioned replica cannot spin through views.
//! - Null requests keep sequence numbers (and checkpoint garbage
//!   collection) advancing under idle load.

mod checkpoint;
mod config;
mod error;
mod log;
mod persist;
mod state;
mod view_change;

pub use config::PbftConfig;
pub use error::PbftError;
pub use persist::RecoveredState;
pub use state::PbftState;
pub use view_change::{assign_sequence_numbers, select_initial_checkpoint};
