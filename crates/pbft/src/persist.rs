//! Durable record layout and restart recovery.
//!
//! Every transition that extends durable state writes one key/value record:
//!
//! - `pset.<n>` on becoming prepared,
//! - `qset.<v>.<n>.<d>` on becoming pre-prepared,
//! - `chkpt.<n>` on a stable checkpoint,
//! - `req.<d>` when a request payload is first stored.
//!
//! Keys are deleted as entries fall below the low watermark. On startup the
//! prefixes are enumerated to rebuild the PSet, QSet, checkpoint set and
//! request store.

use lockstep_core::StateStore;
use lockstep_types::{Digest, PqEntry, Request};
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

pub(crate) fn pset_key(seq_no: u64) -> String {
    format!("pset.{seq_no}")
}

pub(crate) fn qset_key(view: u64, seq_no: u64, digest: Digest) -> String {
    format!("qset.{view}.{seq_no}.{digest}")
}

pub(crate) fn chkpt_key(seq_no: u64) -> String {
    format!("chkpt.{seq_no}")
}

pub(crate) fn req_key(digest: Digest) -> String {
    format!("req.{digest}")
}

pub(crate) fn encode_pq_entry(entry: &PqEntry) -> Vec<u8> {
    sbor::basic_encode(entry).unwrap_or_default()
}

pub(crate) fn encode_request(request: &Request) -> Vec<u8> {
    sbor::basic_encode(request).unwrap_or_default()
}

pub(crate) fn encode_digest(digest: &Digest) -> Vec<u8> {
    sbor::basic_encode(digest).unwrap_or_default()
}

/// Protocol state reconstructed from the durable store on restart.
///
/// `last_exec` and `state_id` come from the execution engine, which knows how
/// far it applied requests; everything else is replayed from the store. For a
/// fresh start use `RecoveredState::default()`.
#[derive(Debug, Clone, Default)]
pub struct RecoveredState {
    /// Prepared entries, `seq_no -> (seq_no, digest, view)`.
    pub pset: BTreeMap<u64, PqEntry>,
    /// Pre-prepared entries, `(digest, seq_no) -> (seq_no, digest, view)`.
    pub qset: BTreeMap<(Digest, u64), PqEntry>,
    /// Stable checkpoints, `seq_no -> state_id`.
    pub checkpoints: BTreeMap<u64, Digest>,
    /// Request payloads by digest.
    pub requests: HashMap<Digest, Request>,
    /// Last sequence number the execution engine applied.
    pub last_exec: u64,
    /// Application state digest after `last_exec`.
    pub state_id: Digest,
}

impl RecoveredState {
    /// Rebuild protocol state from the store.
    ///
    /// Records that fail to decode are skipped with a warning; a corrupt
    /// entry must not keep the replica from starting.
    pub fn load(store: &dyn StateStore, last_exec: u64, state_id: Digest) -> Self {
        let mut recovered = RecoveredState {
            last_exec,
            state_id,
            ..Default::default()
        };

        for (key, value) in store.read_state_set("pset.") {
            match sbor::basic_decode::<PqEntry>(&value) {
                Ok(entry) => {
                    recovered.pset.insert(entry.seq_no, entry);
                }
                Err(e) => warn!(key, error = ?e, "skipping undecodable pset record"),
            }
        }

        for (key, value) in store.read_state_set("qset.") {
            match sbor::basic_decode::<PqEntry>(&value) {
                Ok(entry) => {
                    recovered.qset.insert((entry.digest, entry.seq_no), entry);
                }
                Err(e) => warn!(key, error = ?e, "skipping undecodable qset record"),
            }
        }

        for (key, value) in store.read_state_set("chkpt.") {
            let seq_no = key.strip_prefix("chkpt.").and_then(|s| s.parse::<u64>().ok());
            match (seq_no, sbor::basic_decode::<Digest>(&value)) {
                (Some(n), Ok(state_id)) => {
                    recovered.checkpoints.insert(n, state_id);
                }
                _ => warn!(key, "skipping undecodable checkpoint record"),
            }
        }

        for (key, value) in store.read_state_set("req.") {
            match sbor::basic_decode::<Request>(&value) {
                Ok(request) => {
                    recovered.requests.insert(request.digest(), request);
                }
                Err(e) => warn!(key, error = ?e, "skipping undecodable request record"),
            }
        }

        info!(
            pset = recovered.pset.len(),
            qset = recovered.qset.len(),
            checkpoints = recovered.checkpoints.len(),
            requests = recovered.requests.len(),
            last_exec,
            "recovered protocol state from store"
        );
        recovered
    }

    /// Highest stable checkpoint, the restart low watermark.
    pub fn highest_checkpoint(&self) -> u64 {
        self.checkpoints.keys().next_back().copied().unwrap_or(0)
    }
}
