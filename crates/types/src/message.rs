//! Protocol message types.
//!
//! Every message carries the id of the replica that produced it. The runner
//! authenticates that id against the transport-level sender before the message
//! reaches the protocol core; the core re-checks it and rejects mismatches.

use crate::{Digest, ReplicaId, Request};
use std::collections::BTreeMap;

/// Leader proposal binding a request digest to a sequence number in a view.
///
/// A pre-prepare with a null digest carries no request and orders a no-op
/// (the primary's liveness heartbeat under idle load).
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct PrePrepare {
    /// View this proposal belongs to.
    pub view: u64,
    /// Sequence number assigned by the primary.
    pub seq_no: u64,
    /// Digest of the carried request, or [`Digest::NULL`] for a null request.
    pub digest: Digest,
    /// The request payload, absent for null requests.
    pub request: Option<Request>,
    /// The proposing primary.
    pub replica_id: ReplicaId,
}

impl PrePrepare {
    /// Whether this orders the null request.
    pub fn is_null(&self) -> bool {
        self.digest.is_null()
    }
}

/// Backup echo of a pre-prepare. Primaries never send prepares.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct Prepare {
    pub view: u64,
    pub seq_no: u64,
    pub digest: Digest,
    pub replica_id: ReplicaId,
}

/// Commit vote, sent once a replica holds a prepared certificate.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct Commit {
    pub view: u64,
    pub seq_no: u64,
    pub digest: Digest,
    pub replica_id: ReplicaId,
}

/// Advertisement that the sender executed through `seq_no` with the given
/// application state digest.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct Checkpoint {
    pub seq_no: u64,
    pub state_id: Digest,
    pub replica_id: ReplicaId,
}

/// A prepared or pre-prepared entry carried in a view-change message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct PqEntry {
    pub seq_no: u64,
    pub digest: Digest,
    pub view: u64,
}

/// A stable-checkpoint claim carried in a view-change message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, sbor::prelude::BasicSbor)]
pub struct CheckpointProof {
    pub seq_no: u64,
    pub state_id: Digest,
}

/// Vote to replace the primary of `view - 1`.
///
/// Carries everything the new primary needs to reconstruct agreement state:
/// the sender's low watermark, its checkpoint claims, and its prepared /
/// pre-prepared evidence.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct ViewChange {
    /// The view being moved to.
    pub view: u64,
    /// Sender's low watermark.
    pub h: u64,
    /// Sender's stable-checkpoint claims.
    pub cset: Vec<CheckpointProof>,
    /// Entries the sender prepared in some view below `view`.
    pub pset: Vec<PqEntry>,
    /// Entries the sender pre-prepared in some view below `view`.
    pub qset: Vec<PqEntry>,
    pub replica_id: ReplicaId,
}

/// The new primary's synchronization message for its view.
///
/// `xset` assigns a digest (or [`Digest::NULL`]) to every sequence number the
/// new view re-orders; every replica recomputes the assignment from `vset`
/// and refuses the new view on mismatch.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct NewView {
    pub view: u64,
    pub vset: Vec<ViewChange>,
    pub xset: BTreeMap<u64, Digest>,
    pub replica_id: ReplicaId,
}

/// The wire-level tagged union of every protocol message.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub enum ProtocolMessage {
    Request(Request),
    PrePrepare(PrePrepare),
    Prepare(Prepare),
    Commit(Commit),
    Checkpoint(Checkpoint),
    ViewChange(ViewChange),
    NewView(Box<NewView>),
}

impl ProtocolMessage {
    /// The replica id the message declares as its sender.
    pub fn replica_id(&self) -> ReplicaId {
        match self {
            ProtocolMessage::Request(m) => m.replica_id,
            ProtocolMessage::PrePrepare(m) => m.replica_id,
            ProtocolMessage::Prepare(m) => m.replica_id,
            ProtocolMessage::Commit(m) => m.replica_id,
            ProtocolMessage::Checkpoint(m) => m.replica_id,
            ProtocolMessage::ViewChange(m) => m.replica_id,
            ProtocolMessage::NewView(m) => m.replica_id,
        }
    }

    /// Message kind name for logs and telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            ProtocolMessage::Request(_) => "Request",
            ProtocolMessage::PrePrepare(_) => "PrePrepare",
            ProtocolMessage::Prepare(_) => "Prepare",
            ProtocolMessage::Commit(_) => "Commit",
            ProtocolMessage::Checkpoint(_) => "Checkpoint",
            ProtocolMessage::ViewChange(_) => "ViewChange",
            ProtocolMessage::NewView(_) => "NewView",
        }
    }

    /// Whether this is a view-change protocol message.
    pub fn is_view_change(&self) -> bool {
        matches!(
            self,
            ProtocolMessage::ViewChange(_) | ProtocolMessage::NewView(_)
        )
    }
}
