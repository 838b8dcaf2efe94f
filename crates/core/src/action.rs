//! Action types for the deterministic state machine.

use crate::TimerId;
use lockstep_types::{Digest, ProtocolMessage, ReplicaId, Request};
use std::time::Duration;

/// Actions the state machine wants to perform.
///
/// Actions are **commands** - they describe something to do.
/// The runner executes actions and may convert results back into events.
///
/// No action execution may call back into the state machine synchronously;
/// results arrive as later events.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    // ═══════════════════════════════════════════════════════════════════════
    // Network
    // ═══════════════════════════════════════════════════════════════════════
    /// Broadcast a message to every replica, including this one.
    ///
    /// The state machine never self-delivers inline; its own copy comes back
    /// through the event queue like everyone else's.
    Broadcast { message: ProtocolMessage },

    /// Send a message to a single replica.
    Unicast {
        message: ProtocolMessage,
        dst: ReplicaId,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// Set a timer to fire after a duration. Re-arming resets the deadline.
    SetTimer { id: TimerId, duration: Duration },

    /// Cancel a previously set timer. Idempotent.
    CancelTimer { id: TimerId },

    // ═══════════════════════════════════════════════════════════════════════
    // Execution Engine (async, returns callback event)
    // ═══════════════════════════════════════════════════════════════════════
    /// Deliver the request at `seq_no` to the execution engine.
    ///
    /// Requests are delivered in strictly increasing sequence order with no
    /// gaps. Returns [`Event::ExecutionDone`](crate::Event::ExecutionDone).
    Execute { seq_no: u64, request: Request },

    /// Ask the execution engine to fetch the application state at
    /// `(seq_no, state_id)` from one of `replicas`.
    ///
    /// Returns [`Event::SkipDone`](crate::Event::SkipDone).
    SkipTo {
        seq_no: u64,
        state_id: Digest,
        replicas: Vec<ReplicaId>,
    },

    /// Ask the runner to fetch a request payload we only know by digest
    /// (named by a new-view message but missing locally).
    ///
    /// The payload arrives as an ordinary `Request` message from whichever
    /// replica still holds it.
    FetchRequest {
        digest: Digest,
        replicas: Vec<ReplicaId>,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Persistence (synchronous from the loop's perspective)
    // ═══════════════════════════════════════════════════════════════════════
    /// Durably store a key/value record. A failure here is fatal to the
    /// replica: the runner halts it rather than risk divergence after
    /// restart.
    StoreState { key: String, value: Vec<u8> },

    /// Delete a persisted record.
    DelState { key: String },
}

impl Action {
    /// Check if this action sends a message on the network.
    pub fn is_network(&self) -> bool {
        matches!(self, Action::Broadcast { .. } | Action::Unicast { .. })
    }

    /// Check if this action touches the persistence store.
    pub fn is_storage(&self) -> bool {
        matches!(self, Action::StoreState { .. } | Action::DelState { .. })
    }

    /// Check if this action is delegated work that returns a callback event.
    pub fn is_delegated(&self) -> bool {
        matches!(
            self,
            Action::Execute { .. } | Action::SkipTo { .. } | Action::FetchRequest { .. }
        )
    }

    /// Get the action type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::Broadcast { .. } => "Broadcast",
            Action::Unicast { .. } => "Unicast",
            Action::SetTimer { .. } => "SetTimer",
            Action::CancelTimer { .. } => "CancelTimer",
            Action::Execute { .. } => "Execute",
            Action::SkipTo { .. } => "SkipTo",
            Action::FetchRequest { .. } => "FetchRequest",
            Action::StoreState { .. } => "StoreState",
            Action::DelState { .. } => "DelState",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_classification() {
        let b = Action::Broadcast {
            message: ProtocolMessage::Checkpoint(lockstep_types::Checkpoint {
                seq_no: 2,
                state_id: Digest::NULL,
                replica_id: ReplicaId(0),
            }),
        };
        assert!(b.is_network());
        assert!(!b.is_storage());

        let s = Action::StoreState {
            key: "chkpt.2".into(),
            value: vec![],
        };
        assert!(s.is_storage());
        assert_eq!(s.type_name(), "StoreState");
    }
}
