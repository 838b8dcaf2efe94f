//! Core types for the lockstep replication protocol.
//!
//! This crate provides the foundational types used throughout the protocol
//! implementation:
//!
//! - **Primitives**: [`Digest`], [`ReplicaId`]
//! - **Client payloads**: [`Request`]
//! - **Protocol messages**: [`PrePrepare`], [`Prepare`], [`Commit`],
//!   [`Checkpoint`], [`ViewChange`], [`NewView`] and the [`ProtocolMessage`]
//!   tagged union
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crates, making it the foundation layer. All wire
//! types derive `BasicSbor` so runners can encode them directly.

mod digest;
mod message;

pub use digest::Digest;
pub use message::{
    Checkpoint, CheckpointProof, Commit, NewView, PqEntry, PrePrepare, Prepare, ProtocolMessage,
    ViewChange,
};

use std::fmt;

/// Identity of a replica, in `[0, N)`.
///
/// The primary of view `v` is the replica with id `v mod N`.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, sbor::prelude::BasicSbor,
)]
pub struct ReplicaId(pub u64);

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "replica-{}", self.0)
    }
}

/// A client request submitted through some replica.
///
/// Requests are content-addressed by [`Request::digest`]. Identical payloads
/// submitted through different replicas (or at different times) hash to
/// different digests; the timestamp and submitting replica disambiguate.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct Request {
    /// Submission timestamp, opaque to the protocol beyond disambiguation.
    pub timestamp: u64,
    /// Application payload bytes.
    pub payload: Vec<u8>,
    /// The replica the request entered the system through.
    pub replica_id: ReplicaId,
}

impl Request {
    /// Create a request entering through `replica_id`.
    pub fn new(timestamp: u64, payload: Vec<u8>, replica_id: ReplicaId) -> Self {
        Self {
            timestamp,
            payload,
            replica_id,
        }
    }

    /// The digest naming this request.
    ///
    /// Computed over a domain-tagged canonical encoding so it never collides
    /// with other hashed byte strings in the system.
    pub fn digest(&self) -> Digest {
        let mut bytes = Vec::with_capacity(24 + self.payload.len());
        bytes.extend_from_slice(b"request:");
        bytes.extend_from_slice(&self.timestamp.to_le_bytes());
        bytes.extend_from_slice(&self.replica_id.0.to_le_bytes());
        bytes.extend_from_slice(&self.payload);
        Digest::of(&bytes)
    }
}
