//! Protocol rejection reasons.

use lockstep_types::{Digest, ReplicaId};
use thiserror::Error;

/// Why an inbound message or transition was refused.
///
/// Rejections are local: the offending message is dropped and logged, never
/// answered. Only [`PbftError::PersistenceFailure`] is fatal to the replica.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PbftError {
    /// The declared replica id is not allowed to send this message here
    /// (transport mismatch, prepare from a primary, pre-prepare from a
    /// backup, new-view from a non-primary).
    #[error("message from unexpected sender {sender}")]
    InvalidSender { sender: ReplicaId },

    /// Sequence number outside the `(h, H]` window.
    #[error("sequence number {seq_no} outside watermarks ({low}, {high}]")]
    OutsideWatermarks { seq_no: u64, low: u64, high: u64 },

    /// Message for a view other than the current one.
    #[error("message for view {got} while in view {current}")]
    WrongView { got: u64, current: u64 },

    /// A different digest is already pre-prepared at this (view, seqno).
    #[error("conflicting pre-prepare for view {view} seq {seq_no}")]
    DuplicatePrePrepare { view: u64, seq_no: u64 },

    /// The carried request does not hash to the declared digest.
    #[error("declared digest {declared} does not match request digest {computed}")]
    DigestMismatch { declared: Digest, computed: Digest },

    /// Empty or zero-valued top-level message.
    #[error("empty or zero-valued message")]
    EmptyMessage,

    /// View-change material for a view we have already moved past.
    #[error("view change for stale view {view} (current {current})")]
    StaleView { view: u64, current: u64 },

    /// The durable store refused a write. Fatal.
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    /// A new view's initial checkpoint is beyond anything we can reach by
    /// ordinary execution; state transfer is required.
    #[error("execution gap: checkpoint {target} is beyond last executed {last_exec}")]
    ExecutionGap { target: u64, last_exec: u64 },
}
