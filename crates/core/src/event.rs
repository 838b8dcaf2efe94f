//! Event types for the deterministic state machine.

use lockstep_types::{Digest, ProtocolMessage, ReplicaId, Request};

/// Priority levels for event ordering within the same timestamp.
///
/// Events at the same simulation time are processed in priority order.
/// Lower values = higher priority (processed first).
///
/// This ensures causality is preserved: internal events (consequences of
/// processing an event) are handled before new external inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    /// Internal events: consequences of prior event processing.
    /// Processed first to maintain causality.
    Internal = 0,

    /// Timer events: scheduled by the replica itself.
    Timer = 1,

    /// Network events: external inputs from other replicas.
    Network = 2,

    /// Client events: external inputs from users.
    Client = 3,
}

/// All possible events a replica can receive.
///
/// Events are **passive data** - they describe something that happened.
/// The state machine processes events and returns actions.
#[derive(Debug, Clone)]
pub enum Event {
    // ═══════════════════════════════════════════════════════════════════════
    // Timers (priority: Timer)
    // ═══════════════════════════════════════════════════════════════════════
    /// A pending request went unordered for the configured interval.
    RequestTimeout,

    /// The pending view change produced no new-view in time.
    NewViewTimeout,

    /// Primary side: time to order a null request.
    /// Backup side: the primary's null request never arrived.
    NullRequestTimeout,

    /// Time to rebroadcast our view-change message.
    ViewChangeResendTimeout,

    // ═══════════════════════════════════════════════════════════════════════
    // Network Messages (priority: Network)
    // ═══════════════════════════════════════════════════════════════════════
    /// A protocol message arrived from the transport.
    ///
    /// `sender` is the authenticated transport-level identity; the state
    /// machine rejects messages whose declared replica id differs from it.
    MessageReceived {
        sender: ReplicaId,
        message: ProtocolMessage,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Execution Callbacks (priority: Internal)
    // ═══════════════════════════════════════════════════════════════════════
    /// The execution engine finished the in-flight request.
    ///
    /// Callback from [`Action::Execute`](crate::Action::Execute). Carries the
    /// application state digest after executing `seq_no`.
    ExecutionDone { seq_no: u64, state_id: Digest },

    /// State transfer finished; the application state now matches
    /// `(seq_no, state_id)`.
    ///
    /// Callback from [`Action::SkipTo`](crate::Action::SkipTo).
    SkipDone { seq_no: u64, state_id: Digest },

    // ═══════════════════════════════════════════════════════════════════════
    // Client Requests (priority: Client)
    // ═══════════════════════════════════════════════════════════════════════
    /// A client submitted a request through this replica.
    ///
    /// The request's `replica_id` is the local replica; the submission
    /// surface builds it before queueing.
    ClientRequest { request: Request },
}

impl Event {
    /// Get the priority for this event type.
    ///
    /// Events at the same timestamp are processed in priority order,
    /// ensuring causality is preserved.
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::ExecutionDone { .. } | Event::SkipDone { .. } => EventPriority::Internal,

            Event::RequestTimeout
            | Event::NewViewTimeout
            | Event::NullRequestTimeout
            | Event::ViewChangeResendTimeout => EventPriority::Timer,

            Event::MessageReceived { .. } => EventPriority::Network,

            Event::ClientRequest { .. } => EventPriority::Client,
        }
    }

    /// Check if this is an internal event (consequence of prior processing).
    pub fn is_internal(&self) -> bool {
        self.priority() == EventPriority::Internal
    }

    /// Check if this is a network event (from another replica).
    pub fn is_network(&self) -> bool {
        self.priority() == EventPriority::Network
    }

    /// Get the event type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::RequestTimeout => "RequestTimeout",
            Event::NewViewTimeout => "NewViewTimeout",
            Event::NullRequestTimeout => "NullRequestTimeout",
            Event::ViewChangeResendTimeout => "ViewChangeResendTimeout",
            Event::MessageReceived { .. } => "MessageReceived",
            Event::ExecutionDone { .. } => "ExecutionDone",
            Event::SkipDone { .. } => "SkipDone",
            Event::ClientRequest { .. } => "ClientRequest",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities_order_causally() {
        assert!(EventPriority::Internal < EventPriority::Timer);
        assert!(EventPriority::Timer < EventPriority::Network);
        assert!(EventPriority::Network < EventPriority::Client);
    }

    #[test]
    fn event_classification() {
        let exec = Event::ExecutionDone {
            seq_no: 1,
            state_id: Digest::NULL,
        };
        assert!(exec.is_internal());
        assert_eq!(exec.type_name(), "ExecutionDone");
        assert_eq!(Event::RequestTimeout.priority(), EventPriority::Timer);
    }
}
