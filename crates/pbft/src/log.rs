//! Per-sequence-number certificate log and the sliding watermark window.

use lockstep_types::{Commit, Digest, PrePrepare, Prepare, ReplicaId};
use std::collections::BTreeMap;

/// Agreement state for one `(view, seq_no)` slot.
///
/// Created lazily when the first message for the slot arrives, destroyed when
/// the slot falls at or below the low watermark.
#[derive(Debug, Default, Clone)]
pub struct Certificate {
    /// The primary's proposal, at most one per slot.
    pub pre_prepare: Option<PrePrepare>,
    /// The digest bound to this slot, set with the pre-prepare.
    pub digest: Option<Digest>,
    /// Prepares keyed by sender. Digest matching happens at quorum time.
    pub prepares: BTreeMap<ReplicaId, Prepare>,
    /// Commits keyed by sender.
    pub commits: BTreeMap<ReplicaId, Commit>,
    /// We already broadcast our prepare for this slot.
    pub sent_prepare: bool,
    /// We already broadcast our commit for this slot.
    pub sent_commit: bool,
}

impl Certificate {
    /// Count prepares matching `(view, seq_no, digest)`.
    pub fn matching_prepares(&self, view: u64, seq_no: u64, digest: Digest) -> u64 {
        self.prepares
            .values()
            .filter(|p| p.view == view && p.seq_no == seq_no && p.digest == digest)
            .count() as u64
    }

    /// Count commits matching `(view, seq_no, digest)`.
    pub fn matching_commits(&self, view: u64, seq_no: u64, digest: Digest) -> u64 {
        self.commits
            .values()
            .filter(|c| c.view == view && c.seq_no == seq_no && c.digest == digest)
            .count() as u64
    }
}

/// Certificate store between the watermarks.
#[derive(Debug)]
pub struct MessageLog {
    certs: BTreeMap<(u64, u64), Certificate>,
    low: u64,
    log_size: u64,
}

impl MessageLog {
    pub fn new(log_size: u64) -> Self {
        Self {
            certs: BTreeMap::new(),
            low: 0,
            log_size,
        }
    }

    /// Low watermark `h`.
    pub fn low_watermark(&self) -> u64 {
        self.low
    }

    /// High watermark `H = h + L`.
    pub fn high_watermark(&self) -> u64 {
        self.low + self.log_size
    }

    /// Whether `seq_no` lies in `(h, H]`.
    pub fn in_watermarks(&self, seq_no: u64) -> bool {
        seq_no > self.low && seq_no <= self.high_watermark()
    }

    /// Fetch the certificate for `(view, seq_no)`, creating it on demand.
    pub fn cert_mut(&mut self, view: u64, seq_no: u64) -> &mut Certificate {
        self.certs.entry((view, seq_no)).or_default()
    }

    pub fn cert(&self, view: u64, seq_no: u64) -> Option<&Certificate> {
        self.certs.get(&(view, seq_no))
    }

    /// All certificates with their slots, low view and sequence first.
    pub fn iter(&self) -> impl Iterator<Item = (&(u64, u64), &Certificate)> {
        self.certs.iter()
    }

    /// Slots at `seq_no` in any view.
    pub fn slots_at(&self, seq_no: u64) -> Vec<(u64, u64)> {
        self.certs
            .keys()
            .filter(|(_, n)| *n == seq_no)
            .copied()
            .collect()
    }

    /// Whether any certificate binds `digest` in `view`.
    pub fn digest_pre_prepared(&self, digest: Digest, view: u64) -> bool {
        self.certs.iter().any(|((v, _), cert)| {
            *v == view
                && cert
                    .pre_prepare
                    .as_ref()
                    .is_some_and(|pp| pp.digest == digest)
        })
    }

    /// Raise the low watermark and drop everything at or below it.
    ///
    /// Returns the removed certificates for persistence cleanup.
    pub fn move_low_watermark(&mut self, new_low: u64) -> Vec<((u64, u64), Certificate)> {
        let removed: Vec<(u64, u64)> = self
            .certs
            .keys()
            .filter(|(_, n)| *n <= new_low)
            .copied()
            .collect();
        let mut out = Vec::with_capacity(removed.len());
        for key in removed {
            if let Some(cert) = self.certs.remove(&key) {
                out.push((key, cert));
            }
        }
        self.low = new_low;
        out
    }

    /// Drop certificates from views before `view` (view-change cleanup).
    pub fn drop_views_below(&mut self, view: u64) {
        self.certs.retain(|(v, _), _| *v >= view);
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }
}
