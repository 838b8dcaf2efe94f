//! Checkpoint quorum tracking.
//!
//! Tracks three things: our own checkpoints (the Cset material for view
//! changes), advertisements from peers keyed by `(seq_no, state_id)`, and
//! high-watermark claims from peers whose checkpoints lie beyond our window
//! (the fall-behind detector).

use lockstep_types::{Checkpoint, CheckpointProof, Digest, ReplicaId};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

#[derive(Debug)]
pub struct CheckpointTracker {
    /// Our own checkpoints, `seq_no -> state_id`.
    own: BTreeMap<u64, Digest>,
    /// Advertisements from all replicas (including our own, via loopback).
    advertisements: BTreeMap<(u64, Digest), BTreeSet<ReplicaId>>,
    /// Per-replica claims of checkpoints at or beyond our high watermark.
    high_claims: BTreeMap<ReplicaId, u64>,
}

impl CheckpointTracker {
    pub fn new() -> Self {
        Self {
            own: BTreeMap::new(),
            advertisements: BTreeMap::new(),
            high_claims: BTreeMap::new(),
        }
    }

    /// Record our own checkpoint.
    pub fn record_own(&mut self, seq_no: u64, state_id: Digest) {
        self.own.insert(seq_no, state_id);
    }

    /// Restore own checkpoints after a restart.
    pub fn restore_own(&mut self, checkpoints: BTreeMap<u64, Digest>) {
        self.own = checkpoints;
    }

    pub fn has_own(&self, seq_no: u64) -> bool {
        self.own.contains_key(&seq_no)
    }

    pub fn own(&self) -> &BTreeMap<u64, Digest> {
        &self.own
    }

    /// Our checkpoint claims as view-change Cset material.
    pub fn proofs(&self) -> Vec<CheckpointProof> {
        self.own
            .iter()
            .map(|(n, d)| CheckpointProof {
                seq_no: *n,
                state_id: *d,
            })
            .collect()
    }

    /// Record an advertisement and return how many replicas now back the same
    /// `(seq_no, state_id)`.
    pub fn record(&mut self, chkpt: &Checkpoint) -> u64 {
        let members = self
            .advertisements
            .entry((chkpt.seq_no, chkpt.state_id))
            .or_default();
        members.insert(chkpt.replica_id);
        members.len() as u64
    }

    /// Replicas backing `(seq_no, state_id)`.
    pub fn members(&self, seq_no: u64, state_id: Digest) -> Vec<ReplicaId> {
        self.advertisements
            .get(&(seq_no, state_id))
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Track a claim beyond the high watermark `high`.
    ///
    /// Returns the sequence number the window should jump to when at least
    /// `weak_quorum` replicas claim checkpoints past `high` — the weak
    /// evidence that this replica has fallen irrecoverably behind. Claims
    /// that moved back inside the window are pruned during the scan, which
    /// bounds the claim list without a separate sweep.
    pub fn witness_high_claim(
        &mut self,
        chkpt: &Checkpoint,
        high: u64,
        weak_quorum: u64,
    ) -> Option<u64> {
        if chkpt.seq_no < high {
            self.high_claims.remove(&chkpt.replica_id);
            return None;
        }
        self.high_claims.insert(chkpt.replica_id, chkpt.seq_no);
        if (self.high_claims.len() as u64) < weak_quorum {
            return None;
        }

        let mut claims: Vec<u64> = self.high_claims.values().copied().collect();
        self.high_claims.retain(|replica, n| {
            if *n < high {
                debug!(replica = %replica, claim = *n, "high checkpoint claim back in window");
                false
            } else {
                true
            }
        });
        claims.sort_unstable();
        let pivot = claims[claims.len() - weak_quorum as usize];
        (pivot > high).then_some(pivot)
    }

    /// Drop advertisements at or below `low` and own checkpoints below it.
    ///
    /// The checkpoint *at* the new low watermark stays: it is the Cset
    /// evidence for the next view change. Returns the sequence numbers of
    /// dropped own checkpoints for persistence cleanup.
    pub fn prune(&mut self, low: u64) -> Vec<u64> {
        self.advertisements.retain(|(n, _), _| *n > low);
        let dropped: Vec<u64> = self.own.range(..low).map(|(n, _)| *n).collect();
        self.own.retain(|n, _| *n >= low);
        dropped
    }

    /// Forget everything we claimed ourselves (fall-behind reset).
    pub fn clear_own(&mut self) -> Vec<u64> {
        let dropped: Vec<u64> = self.own.keys().copied().collect();
        self.own.clear();
        dropped
    }
}

impl Default for CheckpointTracker {
    fn default() -> Self {
        Self::new()
    }
}
