//! View-change evidence collection and new-view computation.
//!
//! Two computations live here because getting them wrong is the classic
//! failure mode of this protocol:
//!
//! - [`select_initial_checkpoint`] picks the new view's starting point `n*`
//!   from checkpoint (Cset) evidence only. This is the paper's S.
//! - [`assign_sequence_numbers`] fills `(n*, n* + L]` from PSet/QSet
//!   evidence. This is the paper's S′ selection and must never feed back
//!   into the watermark choice: deriving `h` from the PSet union silently
//!   regresses agreed-upon sequence numbers.

use crate::config::PbftConfig;
use lockstep_types::{CheckpointProof, Digest, ReplicaId, ViewChange};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// View-change messages indexed by `(view, sender)`.
#[derive(Debug, Default)]
pub struct ViewChangeStore {
    messages: BTreeMap<(u64, ReplicaId), ViewChange>,
}

impl ViewChangeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, view: u64, sender: ReplicaId) -> bool {
        self.messages.contains_key(&(view, sender))
    }

    pub fn insert(&mut self, vc: ViewChange) {
        self.messages.insert((vc.view, vc.replica_id), vc);
    }

    /// All messages for `view`, ordered by sender.
    pub fn for_view(&self, view: u64) -> Vec<ViewChange> {
        self.messages
            .iter()
            .filter(|((v, _), _)| *v == view)
            .map(|(_, vc)| vc.clone())
            .collect()
    }

    pub fn count_for_view(&self, view: u64) -> u64 {
        self.messages.keys().filter(|(v, _)| *v == view).count() as u64
    }

    /// Distinct senders with messages for views above `view`, and the
    /// smallest such view. Feeds the f+1 crowd rule.
    pub fn senders_above(&self, view: u64) -> (u64, Option<u64>) {
        let mut senders = std::collections::BTreeSet::new();
        let mut min_view = None;
        for (v, sender) in self.messages.keys() {
            if *v > view {
                senders.insert(*sender);
                min_view = Some(min_view.map_or(*v, |m: u64| m.min(*v)));
            }
        }
        (senders.len() as u64, min_view)
    }

    /// Drop messages for views before `view`.
    pub fn prune_below(&mut self, view: u64) {
        self.messages.retain(|(v, _), _| *v >= view);
    }
}

/// Bounds-check a view-change message's evidence against its own watermark.
pub fn correct_view_change(config: &PbftConfig, vc: &ViewChange) -> bool {
    let log_size = config.log_size();
    for entry in vc.pset.iter().chain(vc.qset.iter()) {
        if !(entry.view < vc.view && entry.seq_no > vc.h && entry.seq_no <= vc.h + log_size) {
            return false;
        }
    }
    for proof in &vc.cset {
        if !(proof.seq_no >= vc.h && proof.seq_no <= vc.h + log_size) {
            return false;
        }
    }
    true
}

/// Pick the initial checkpoint for a new view (the paper's S).
///
/// A candidate `(n*, stateId)` needs a weak certificate — strictly more than
/// `f` view-change messages claiming it in their Cset — and `2f+1` messages
/// whose low watermark does not exceed it (the checkpoint is reachable for a
/// quorum). The greatest such candidate wins. Returns the proof and the
/// replicas that vouched for it (the candidates for state transfer).
pub fn select_initial_checkpoint(
    config: &PbftConfig,
    vcs: &[ViewChange],
) -> Option<(CheckpointProof, Vec<ReplicaId>)> {
    let mut candidates: BTreeMap<(u64, Digest), Vec<ReplicaId>> = BTreeMap::new();
    for vc in vcs {
        for proof in &vc.cset {
            let holders = candidates
                .entry((proof.seq_no, proof.state_id))
                .or_default();
            if !holders.contains(&vc.replica_id) {
                holders.push(vc.replica_id);
            }
        }
    }

    let mut best: Option<(CheckpointProof, Vec<ReplicaId>)> = None;
    for ((seq_no, state_id), holders) in candidates {
        if (holders.len() as u64) < config.weak_quorum() {
            debug!(
                seq_no,
                holders = holders.len(),
                "checkpoint candidate lacks weak certificate"
            );
            continue;
        }
        let reachable = vcs.iter().filter(|vc| vc.h <= seq_no).count() as u64;
        if reachable < config.intersection_quorum() {
            debug!(seq_no, reachable, "checkpoint candidate not reachable for a quorum");
            continue;
        }
        if best.as_ref().is_none_or(|(b, _)| b.seq_no <= seq_no) {
            best = Some((CheckpointProof { seq_no, state_id }, holders));
        }
    }
    best
}

/// Assign a digest or null to every sequence number in `(h, h + L]` (the
/// paper's S′ selection).
///
/// Digest `d` is chosen for `n` when some message's Pset entry `(n, d, v)`
/// is backed by `2f+1` messages whose watermark is below `n` and whose own
/// Pset entries at `n` are either from older views or agree on the digest
/// (A1), plus `f+1` messages whose Qset pre-prepared `(n, d)` in view `>= v`
/// (A2). Null is chosen when `2f+1` messages prepared nothing at `n`.
/// Anything else means the evidence is still incomplete: the caller must
/// wait for more view-change messages.
///
/// Trailing null assignments above the highest digest-bearing sequence are
/// pruned, so an idle tail does not manufacture no-ops.
pub fn assign_sequence_numbers(
    config: &PbftConfig,
    vcs: &[ViewChange],
    h: u64,
) -> Option<BTreeMap<u64, Digest>> {
    let mut msg_list = BTreeMap::new();
    let mut max_assigned = h + 1;

    'next_seq: for n in (h + 1)..=(h + config.log_size()) {
        // Try to find a prepared entry with enough backing.
        for vc in vcs {
            for entry in vc.pset.iter().filter(|e| e.seq_no == n) {
                let mut quorum = 0u64;
                'messages: for other in vcs {
                    if other.h >= n {
                        continue;
                    }
                    for theirs in other.pset.iter().filter(|e| e.seq_no == n) {
                        let compatible = theirs.view < entry.view
                            || (theirs.view == entry.view && theirs.digest == entry.digest);
                        if !compatible {
                            continue 'messages;
                        }
                    }
                    quorum += 1;
                }
                if quorum < config.intersection_quorum() {
                    continue;
                }

                let pre_prepared = vcs
                    .iter()
                    .filter(|other| {
                        other.qset.iter().any(|q| {
                            q.seq_no == n && q.view >= entry.view && q.digest == entry.digest
                        })
                    })
                    .count() as u64;
                if pre_prepared < config.weak_quorum() {
                    continue;
                }

                msg_list.insert(n, entry.digest);
                max_assigned = n;
                continue 'next_seq;
            }
        }

        // Otherwise a quorum must agree nothing was prepared at n.
        let unprepared = vcs
            .iter()
            .filter(|vc| vc.pset.iter().all(|e| e.seq_no != n))
            .count() as u64;
        if unprepared >= config.intersection_quorum() {
            msg_list.insert(n, Digest::NULL);
            continue 'next_seq;
        }

        warn!(
            seq_no = n,
            unprepared, "cannot assign contents of sequence number yet"
        );
        return None;
    }

    msg_list.retain(|n, d| *n <= max_assigned || !d.is_null());
    Some(msg_list)
}
