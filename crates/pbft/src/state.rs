//! The PBFT replica state machine.
//!
//! This module implements the three-phase agreement protocol, checkpointing,
//! view changes, request/null-request timers and crash recovery as a
//! synchronous, event-driven model.
//!
//! # State Machine Flow
//!
//! 1. **Client request** → forwarded to the primary, which assigns the next
//!    sequence number and broadcasts a pre-prepare
//! 2. **Pre-prepare received** → validate, bind digest to the slot, echo a
//!    prepare
//! 3. **Prepare quorum** → persist the PSet entry, broadcast a commit
//! 4. **Commit quorum** → deliver to the execution engine in sequence order
//! 5. **Execution done** → emit a checkpoint every `K` sequence numbers
//! 6. **Trouble** (request timer, silent primary, f+1 crowd, rotation
//!    boundary) → view change
//!
//! All I/O is performed by the runner via returned [`Action`]s, including the
//! replica's own broadcasts: the state machine never self-delivers inline,
//! its own messages come back through the event queue.

use lockstep_core::{Action, Event, StateMachine, TimerId};
use lockstep_types::{
    Checkpoint, Commit, Digest, NewView, PqEntry, PrePrepare, Prepare, ProtocolMessage, ReplicaId,
    Request, ViewChange,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, info, instrument, trace, warn};

use crate::checkpoint::CheckpointTracker;
use crate::config::PbftConfig;
use crate::error::PbftError;
use crate::log::MessageLog;
use crate::persist::{
    chkpt_key, encode_digest, encode_pq_entry, encode_request, pset_key, qset_key, req_key,
    RecoveredState,
};
use crate::view_change::{
    assign_sequence_numbers, correct_view_change, select_initial_checkpoint, ViewChangeStore,
};

/// PBFT replica core.
///
/// One instance per replica. Processes one event at a time on a single
/// thread; every side effect is an [`Action`] executed by the runner.
pub struct PbftState {
    // ═══════════════════════════════════════════════════════════════════════
    // Identity & configuration
    // ═══════════════════════════════════════════════════════════════════════
    id: ReplicaId,
    config: PbftConfig,

    // ═══════════════════════════════════════════════════════════════════════
    // Protocol state
    // ═══════════════════════════════════════════════════════════════════════
    /// Current view. The primary is `view mod N`.
    view: u64,
    /// Highest sequence number this replica assigned or installed.
    seq_no: u64,
    /// Last sequence number delivered to the execution engine.
    last_exec: u64,
    /// Sequence number currently with the execution engine.
    current_exec: Option<u64>,
    /// Application state digest after `last_exec`.
    last_state_id: Digest,
    /// True between a successful new-view and the next view-change trigger.
    active_view: bool,
    /// True while a state transfer is pending.
    skip_in_progress: bool,

    /// Certificate log between the watermarks.
    log: MessageLog,
    /// Request payloads by digest.
    req_store: HashMap<Digest, Request>,
    /// Requests observed but not yet executed.
    outstanding: BTreeMap<Digest, Request>,
    /// Prepared evidence surviving view changes, keyed by sequence number.
    pset: BTreeMap<u64, PqEntry>,
    /// Pre-prepared evidence surviving view changes, keyed by (digest, seq).
    qset: BTreeMap<(Digest, u64), PqEntry>,
    /// Checkpoint bookkeeping.
    checkpoints: CheckpointTracker,

    // ═══════════════════════════════════════════════════════════════════════
    // View-change state
    // ═══════════════════════════════════════════════════════════════════════
    view_changes: ViewChangeStore,
    new_view_store: BTreeMap<u64, NewView>,
    /// Our current view-change message, for resends.
    last_view_change: Option<ViewChange>,
    /// Request payloads a pending new-view names but we do not hold.
    missing_requests: BTreeSet<Digest>,
    /// A view-change quorum formed for the current view.
    view_change_quorum: bool,
    /// Escalation timeout, doubled each consecutive view change.
    last_new_view_timeout: Duration,
    /// Sequence number at which to rotate the primary. `u64::MAX` disables.
    view_change_seq_no: u64,

    // ═══════════════════════════════════════════════════════════════════════
    // Timers & time
    // ═══════════════════════════════════════════════════════════════════════
    request_timer_active: bool,
    now: Duration,
}

impl std::fmt::Debug for PbftState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PbftState")
            .field("id", &self.id)
            .field("view", &self.view)
            .field("seq_no", &self.seq_no)
            .field("last_exec", &self.last_exec)
            .field("low", &self.log.low_watermark())
            .field("active_view", &self.active_view)
            .field("skip_in_progress", &self.skip_in_progress)
            .field("certs", &self.log.len())
            .finish()
    }
}

impl PbftState {
    /// Create a replica state machine.
    ///
    /// `recovered` replays durable state after a crash; use
    /// `RecoveredState::default()` for a fresh start.
    pub fn new(id: ReplicaId, config: PbftConfig, recovered: RecoveredState) -> Self {
        let mut state = Self {
            id,
            view: 0,
            seq_no: 0,
            last_exec: recovered.last_exec,
            current_exec: None,
            last_state_id: recovered.state_id,
            active_view: true,
            skip_in_progress: false,
            log: MessageLog::new(config.log_size()),
            req_store: recovered.requests,
            outstanding: BTreeMap::new(),
            pset: recovered.pset,
            qset: recovered.qset,
            checkpoints: CheckpointTracker::new(),
            view_changes: ViewChangeStore::new(),
            new_view_store: BTreeMap::new(),
            last_view_change: None,
            missing_requests: BTreeSet::new(),
            view_change_quorum: false,
            last_new_view_timeout: config.new_view_timeout,
            view_change_seq_no: u64::MAX,
            request_timer_active: false,
            now: Duration::ZERO,
            config,
        };

        // Durable PSet/QSet evidence tells us how far we got before the crash.
        for entry in state.pset.values().chain(state.qset.values()) {
            state.view = state.view.max(entry.view);
            state.seq_no = state.seq_no.max(entry.seq_no);
        }

        let mut checkpoints = recovered.checkpoints;
        if checkpoints.is_empty() {
            // The genesis checkpoint anchors view changes before the first
            // stable checkpoint exists.
            checkpoints.insert(0, Digest::NULL);
        }
        let highest = checkpoints.keys().next_back().copied().unwrap_or(0);
        state.checkpoints.restore_own(checkpoints);
        if highest > 0 {
            let low = highest / state.config.k * state.config.k;
            state.log.move_low_watermark(low);
            state.pset.retain(|n, _| *n > low);
            state.qset.retain(|(_, n), _| *n > low);
            state.seq_no = state.seq_no.max(low);
            state.last_exec = state.last_exec.max(low);
        }
        state.update_view_change_seq_no();
        state
    }

    /// Arm the initial timers. Call once after construction or restart.
    pub fn start(&mut self) -> Vec<Action> {
        info!(
            replica = %self.id,
            n = self.config.n,
            f = self.config.f,
            view = self.view,
            last_exec = self.last_exec,
            low = self.log.low_watermark(),
            "replica started"
        );
        self.null_request_timer_reset()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    pub fn view(&self) -> u64 {
        self.view
    }

    pub fn active_view(&self) -> bool {
        self.active_view
    }

    pub fn seq_no(&self) -> u64 {
        self.seq_no
    }

    pub fn last_exec(&self) -> u64 {
        self.last_exec
    }

    pub fn low_watermark(&self) -> u64 {
        self.log.low_watermark()
    }

    pub fn high_watermark(&self) -> u64 {
        self.log.high_watermark()
    }

    pub fn skip_in_progress(&self) -> bool {
        self.skip_in_progress
    }

    /// Our stable/own checkpoints, `seq_no -> state_id`.
    pub fn own_checkpoints(&self) -> &BTreeMap<u64, Digest> {
        self.checkpoints.own()
    }

    /// A stored request payload, if we hold it.
    pub fn request(&self, digest: &Digest) -> Option<&Request> {
        self.req_store.get(digest)
    }

    pub fn config(&self) -> &PbftConfig {
        &self.config
    }

    /// Tune the configuration before `start`. Test harness hook.
    pub fn config_mut(&mut self) -> &mut PbftConfig {
        &mut self.config
    }

    /// The primary of a view.
    pub fn primary_of(&self, view: u64) -> ReplicaId {
        ReplicaId(view % self.config.n)
    }

    /// Whether this replica is the primary of the current view.
    pub fn is_primary(&self) -> bool {
        self.primary_of(self.view) == self.id
    }

    fn other_replicas(&self) -> Vec<ReplicaId> {
        (0..self.config.n)
            .map(ReplicaId)
            .filter(|r| *r != self.id)
            .collect()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Certificate predicates
    // ═══════════════════════════════════════════════════════════════════════

    /// Whether `(digest, view, seq_no)` is pre-prepared: the slot binds the
    /// digest (or durable QSet evidence says it did) and we hold the payload.
    pub fn pre_prepared(&self, digest: Digest, view: u64, seq_no: u64) -> bool {
        if !digest.is_null() && !self.req_store.contains_key(&digest) {
            return false;
        }
        if let Some(q) = self.qset.get(&(digest, seq_no)) {
            if q.view == view {
                return true;
            }
        }
        if let Some(cert) = self.log.cert(view, seq_no) {
            if let (Some(pp), Some(d)) = (&cert.pre_prepare, cert.digest) {
                return pp.view == view && pp.seq_no == seq_no && d == digest;
            }
        }
        false
    }

    /// Pre-prepared plus `2f` matching prepares from distinct backups.
    pub fn prepared(&self, digest: Digest, view: u64, seq_no: u64) -> bool {
        if !self.pre_prepared(digest, view, seq_no) {
            return false;
        }
        if let Some(p) = self.pset.get(&seq_no) {
            if p.view == view && p.digest == digest {
                return true;
            }
        }
        let Some(cert) = self.log.cert(view, seq_no) else {
            return false;
        };
        cert.matching_prepares(view, seq_no, digest) >= self.config.intersection_quorum() - 1
    }

    /// Prepared plus `2f + 1` matching commits from distinct replicas.
    pub fn committed(&self, digest: Digest, view: u64, seq_no: u64) -> bool {
        if !self.prepared(digest, view, seq_no) {
            return false;
        }
        self.log
            .cert(view, seq_no)
            .is_some_and(|c| c.matching_commits(view, seq_no, digest) >= self.config.intersection_quorum())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Inbound dispatch
    // ═══════════════════════════════════════════════════════════════════════

    /// Validate and dispatch one protocol message.
    ///
    /// Rejections never propagate beyond the caller: the runner logs them at
    /// debug and drops the message.
    pub fn on_message(
        &mut self,
        sender: ReplicaId,
        message: ProtocolMessage,
    ) -> Result<Vec<Action>, PbftError> {
        let declared = message.replica_id();
        if declared != sender {
            warn!(
                replica = %self.id,
                declared = %declared,
                transport = %sender,
                kind = message.type_name(),
                "declared sender does not match transport sender"
            );
            return Err(PbftError::InvalidSender { sender: declared });
        }
        match message {
            ProtocolMessage::Request(req) => self.recv_request(req),
            ProtocolMessage::PrePrepare(pp) => self.recv_pre_prepare(pp),
            ProtocolMessage::Prepare(p) => self.recv_prepare(p),
            ProtocolMessage::Commit(c) => self.recv_commit(c),
            ProtocolMessage::Checkpoint(c) => self.recv_checkpoint(c),
            ProtocolMessage::ViewChange(vc) => self.recv_view_change(vc),
            ProtocolMessage::NewView(nv) => self.recv_new_view(*nv),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Requests
    // ═══════════════════════════════════════════════════════════════════════

    fn on_client_request(&mut self, request: Request) -> Vec<Action> {
        if request.payload.is_empty() {
            debug!(replica = %self.id, "dropping empty client request");
            return vec![];
        }
        let mut actions = Vec::new();
        if self.active_view && !self.is_primary() {
            actions.push(Action::Unicast {
                message: ProtocolMessage::Request(request.clone()),
                dst: self.primary_of(self.view),
            });
        }
        actions.extend(self.process_request(request));
        actions
    }

    fn recv_request(&mut self, request: Request) -> Result<Vec<Action>, PbftError> {
        if request.payload.is_empty() {
            return Err(PbftError::EmptyMessage);
        }
        Ok(self.process_request(request))
    }

    fn process_request(&mut self, request: Request) -> Vec<Action> {
        let digest = request.digest();
        let mut actions = Vec::new();
        if !self.req_store.contains_key(&digest) {
            actions.push(Action::StoreState {
                key: req_key(digest),
                value: encode_request(&request),
            });
            self.req_store.insert(digest, request.clone());
        }
        self.outstanding.insert(digest, request);

        // A pending new-view may have been waiting for exactly this payload.
        if self.missing_requests.remove(&digest) {
            if self.missing_requests.is_empty() && !self.active_view {
                actions.extend(self.process_new_view());
            }
            return actions;
        }

        if self.active_view && self.is_primary() {
            actions.push(Action::CancelTimer {
                id: TimerId::NullRequest,
            });
            actions.extend(self.send_pre_prepare(digest));
        } else if self.active_view {
            actions.extend(self.soft_start_request_timer());
        } else {
            trace!(replica = %self.id, digest = ?digest, "buffering request during view change");
        }
        actions
    }

    /// Primary path: assign the next sequence number to `digest`.
    ///
    /// The active pre-prepare window is `L/2`: assigning past it risks
    /// filling the log before commits land, so throttled requests stay
    /// outstanding and are resubmitted when the watermarks move.
    fn send_pre_prepare(&mut self, digest: Digest) -> Vec<Action> {
        if !digest.is_null() && self.log.digest_pre_prepared(digest, self.view) {
            trace!(replica = %self.id, digest = ?digest, "request already pre-prepared");
            return vec![];
        }
        let n = self.seq_no + 1;
        if !self.log.in_watermarks(n)
            || n > self.log.low_watermark() + self.config.log_size() / 2
        {
            debug!(
                replica = %self.id,
                seq_no = n,
                low = self.log.low_watermark(),
                "send window full, holding pre-prepare"
            );
            return vec![];
        }
        if n > self.view_change_seq_no {
            trace!(
                replica = %self.id,
                seq_no = n,
                rotation = self.view_change_seq_no,
                "due to rotate primaries, not assigning"
            );
            return vec![];
        }
        let request = if digest.is_null() {
            None
        } else {
            match self.req_store.get(&digest) {
                Some(req) => Some(req.clone()),
                None => {
                    warn!(replica = %self.id, digest = ?digest, "request payload missing at assignment");
                    return vec![];
                }
            }
        };

        self.seq_no = n;
        let pp = PrePrepare {
            view: self.view,
            seq_no: n,
            digest,
            request,
            replica_id: self.id,
        };
        info!(
            replica = %self.id,
            view = self.view,
            seq_no = n,
            digest = ?digest,
            null = pp.is_null(),
            "assigning sequence number"
        );
        let cert = self.log.cert_mut(self.view, n);
        cert.pre_prepare = Some(pp.clone());
        cert.digest = Some(digest);

        let mut actions = self.persist_qset_entry(PqEntry {
            seq_no: n,
            digest,
            view: self.view,
        });
        actions.push(Action::Broadcast {
            message: ProtocolMessage::PrePrepare(pp),
        });
        // With f = 0 the slot is already prepared.
        actions.extend(self.maybe_send_commit(digest, self.view, n));
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Three-phase agreement
    // ═══════════════════════════════════════════════════════════════════════

    #[instrument(skip(self, pp), fields(replica = %self.id, view = pp.view, seq_no = pp.seq_no))]
    fn recv_pre_prepare(&mut self, pp: PrePrepare) -> Result<Vec<Action>, PbftError> {
        if !self.active_view {
            debug!("ignoring pre-prepare while view change is in progress");
            return Ok(vec![]);
        }
        if pp.view != self.view {
            return Err(PbftError::WrongView {
                got: pp.view,
                current: self.view,
            });
        }
        if pp.replica_id != self.primary_of(pp.view) {
            return Err(PbftError::InvalidSender {
                sender: pp.replica_id,
            });
        }
        match &pp.request {
            Some(request) => {
                if request.payload.is_empty() {
                    return Err(PbftError::EmptyMessage);
                }
                let computed = request.digest();
                if computed != pp.digest {
                    // Malicious pre-prepare: discard silently, no broadcast.
                    return Err(PbftError::DigestMismatch {
                        declared: pp.digest,
                        computed,
                    });
                }
            }
            None => {
                if !pp.digest.is_null() {
                    return Err(PbftError::DigestMismatch {
                        declared: pp.digest,
                        computed: Digest::NULL,
                    });
                }
            }
        }
        if !self.log.in_watermarks(pp.seq_no) {
            return Err(PbftError::OutsideWatermarks {
                seq_no: pp.seq_no,
                low: self.log.low_watermark(),
                high: self.log.high_watermark(),
            });
        }

        {
            let cert = self.log.cert_mut(pp.view, pp.seq_no);
            if let Some(existing) = cert.digest {
                if existing != pp.digest {
                    warn!(existing = ?existing, got = ?pp.digest, "conflicting pre-prepare for slot");
                    return Err(PbftError::DuplicatePrePrepare {
                        view: pp.view,
                        seq_no: pp.seq_no,
                    });
                }
            }
            cert.pre_prepare = Some(pp.clone());
            cert.digest = Some(pp.digest);
        }

        let mut actions = Vec::new();
        if let Some(request) = &pp.request {
            if !self.req_store.contains_key(&pp.digest) {
                self.req_store.insert(pp.digest, request.clone());
                self.outstanding.insert(pp.digest, request.clone());
                actions.push(Action::StoreState {
                    key: req_key(pp.digest),
                    value: encode_request(request),
                });
            }
        }

        // The primary is alive; the watchdog re-arms once the log drains.
        actions.push(Action::CancelTimer {
            id: TimerId::NullRequest,
        });
        if !self.skip_in_progress && !pp.is_null() {
            actions.extend(self.soft_start_request_timer());
        }

        if self.primary_of(self.view) != self.id && self.pre_prepared(pp.digest, pp.view, pp.seq_no)
        {
            let send = {
                let cert = self.log.cert_mut(pp.view, pp.seq_no);
                if cert.sent_prepare {
                    false
                } else {
                    cert.sent_prepare = true;
                    true
                }
            };
            if send {
                actions.extend(self.persist_qset_entry(PqEntry {
                    seq_no: pp.seq_no,
                    digest: pp.digest,
                    view: pp.view,
                }));
                actions.push(Action::Broadcast {
                    message: ProtocolMessage::Prepare(Prepare {
                        view: pp.view,
                        seq_no: pp.seq_no,
                        digest: pp.digest,
                        replica_id: self.id,
                    }),
                });
            }
        }
        // Durable PSet evidence may already mark the slot prepared (restart).
        actions.extend(self.maybe_send_commit(pp.digest, pp.view, pp.seq_no));
        Ok(actions)
    }

    fn recv_prepare(&mut self, prepare: Prepare) -> Result<Vec<Action>, PbftError> {
        if prepare.replica_id == self.primary_of(prepare.view) {
            warn!(replica = %self.id, sender = %prepare.replica_id, "prepare from a primary");
            return Err(PbftError::InvalidSender {
                sender: prepare.replica_id,
            });
        }
        if prepare.view != self.view {
            return Err(PbftError::WrongView {
                got: prepare.view,
                current: self.view,
            });
        }
        if !self.log.in_watermarks(prepare.seq_no) {
            return Err(PbftError::OutsideWatermarks {
                seq_no: prepare.seq_no,
                low: self.log.low_watermark(),
                high: self.log.high_watermark(),
            });
        }
        let (digest, view, seq_no) = (prepare.digest, prepare.view, prepare.seq_no);
        {
            let cert = self.log.cert_mut(view, seq_no);
            if cert.prepares.contains_key(&prepare.replica_id) {
                trace!(replica = %self.id, sender = %prepare.replica_id, "duplicate prepare");
                return Ok(vec![]);
            }
            cert.prepares.insert(prepare.replica_id, prepare);
        }
        Ok(self.maybe_send_commit(digest, view, seq_no))
    }

    fn maybe_send_commit(&mut self, digest: Digest, view: u64, seq_no: u64) -> Vec<Action> {
        if !self.prepared(digest, view, seq_no) {
            return vec![];
        }
        {
            let cert = self.log.cert_mut(view, seq_no);
            if cert.sent_commit {
                return vec![];
            }
            cert.sent_commit = true;
        }
        debug!(replica = %self.id, view, seq_no, digest = ?digest, "prepared, broadcasting commit");
        let mut actions = self.persist_pset_entry(PqEntry {
            seq_no,
            digest,
            view,
        });
        actions.push(Action::Broadcast {
            message: ProtocolMessage::Commit(Commit {
                view,
                seq_no,
                digest,
                replica_id: self.id,
            }),
        });
        actions
    }

    fn recv_commit(&mut self, commit: Commit) -> Result<Vec<Action>, PbftError> {
        if commit.view != self.view {
            return Err(PbftError::WrongView {
                got: commit.view,
                current: self.view,
            });
        }
        if !self.log.in_watermarks(commit.seq_no) {
            return Err(PbftError::OutsideWatermarks {
                seq_no: commit.seq_no,
                low: self.log.low_watermark(),
                high: self.log.high_watermark(),
            });
        }
        let (digest, view, seq_no) = (commit.digest, commit.view, commit.seq_no);
        {
            let cert = self.log.cert_mut(view, seq_no);
            if cert.commits.contains_key(&commit.replica_id) {
                trace!(replica = %self.id, sender = %commit.replica_id, "duplicate commit");
                return Ok(vec![]);
            }
            cert.commits.insert(commit.replica_id, commit);
        }

        let mut actions = Vec::new();
        if self.committed(digest, view, seq_no) {
            debug!(replica = %self.id, view, seq_no, "commit quorum reached");
            if self.request_timer_active {
                self.request_timer_active = false;
                actions.push(Action::CancelTimer {
                    id: TimerId::Request,
                });
            }
            if !self.skip_in_progress {
                actions.extend(self.execute_outstanding());
            }
            if seq_no == self.view_change_seq_no {
                info!(replica = %self.id, seq_no, "rotation boundary committed, cycling primary");
                actions.extend(self.send_view_change());
            }
        }
        Ok(actions)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Execution
    // ═══════════════════════════════════════════════════════════════════════

    /// Deliver committed requests in strictly increasing sequence order.
    /// A gap blocks delivery until agreement fills it.
    fn execute_outstanding(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        while self.current_exec.is_none() && !self.skip_in_progress {
            let next = self.last_exec + 1;
            let Some((_, digest)) = self.committed_slot_at(next) else {
                break;
            };
            self.current_exec = Some(next);
            self.outstanding.remove(&digest);
            if digest.is_null() {
                debug!(replica = %self.id, seq_no = next, "executing null request");
                let state_id = self.last_state_id;
                actions.extend(self.complete_execution(state_id));
                continue;
            }
            let Some(request) = self.req_store.get(&digest).cloned() else {
                warn!(replica = %self.id, seq_no = next, digest = ?digest, "committed payload missing");
                self.current_exec = None;
                break;
            };
            debug!(replica = %self.id, seq_no = next, digest = ?digest, "delivering to execution engine");
            actions.push(Action::Execute {
                seq_no: next,
                request,
            });
            break;
        }
        actions.extend(self.start_timer_if_outstanding());
        actions
    }

    /// A committed certificate at `seq_no` in some view, if any.
    fn committed_slot_at(&self, seq_no: u64) -> Option<(u64, Digest)> {
        for (view, n) in self.log.slots_at(seq_no) {
            let Some(cert) = self.log.cert(view, n) else {
                continue;
            };
            if cert.pre_prepare.is_none() {
                continue;
            }
            if let Some(digest) = cert.digest {
                if self.committed(digest, view, n) {
                    return Some((view, digest));
                }
            }
        }
        None
    }

    fn complete_execution(&mut self, state_id: Digest) -> Vec<Action> {
        let Some(n) = self.current_exec.take() else {
            return vec![];
        };
        self.last_exec = n;
        self.last_state_id = state_id;
        if n % self.config.k == 0 {
            return self.emit_checkpoint(n, state_id);
        }
        vec![]
    }

    fn emit_checkpoint(&mut self, seq_no: u64, state_id: Digest) -> Vec<Action> {
        info!(replica = %self.id, seq_no, state = ?state_id, "emitting checkpoint");
        self.checkpoints.record_own(seq_no, state_id);
        vec![Action::Broadcast {
            message: ProtocolMessage::Checkpoint(Checkpoint {
                seq_no,
                state_id,
                replica_id: self.id,
            }),
        }]
    }

    fn on_execution_done(&mut self, seq_no: u64, state_id: Digest) -> Vec<Action> {
        match self.current_exec {
            Some(n) if n == seq_no => {}
            _ => {
                warn!(
                    replica = %self.id,
                    seq_no,
                    in_flight = ?self.current_exec,
                    "execution completion with nothing in flight"
                );
                return vec![];
            }
        }
        let mut actions = self.complete_execution(state_id);
        actions.extend(self.execute_outstanding());
        actions
    }

    fn on_skip_done(&mut self, seq_no: u64, state_id: Digest) -> Vec<Action> {
        if !self.skip_in_progress {
            warn!(replica = %self.id, seq_no, "state transfer completion with no skip in progress");
            return vec![];
        }
        info!(replica = %self.id, seq_no, "state transfer complete, resuming");
        self.skip_in_progress = false;
        self.last_exec = seq_no;
        self.last_state_id = state_id;
        self.current_exec = None;
        let mut actions = self.move_watermarks(seq_no);
        actions.extend(self.execute_outstanding());
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Checkpoints
    // ═══════════════════════════════════════════════════════════════════════

    fn recv_checkpoint(&mut self, chkpt: Checkpoint) -> Result<Vec<Action>, PbftError> {
        if let Some(actions) = self.witness_fall_behind(&chkpt) {
            return Ok(actions);
        }
        if !self.log.in_watermarks(chkpt.seq_no) {
            return Err(PbftError::OutsideWatermarks {
                seq_no: chkpt.seq_no,
                low: self.log.low_watermark(),
                high: self.log.high_watermark(),
            });
        }

        let matching = self.checkpoints.record(&chkpt);
        trace!(
            replica = %self.id,
            seq_no = chkpt.seq_no,
            from = %chkpt.replica_id,
            matching,
            "checkpoint advertisement"
        );

        let mut actions = Vec::new();
        if matching == self.config.weak_quorum() && self.skip_in_progress {
            // A correct replica vouches for this state: transfer target found.
            let replicas = self.checkpoints.members(chkpt.seq_no, chkpt.state_id);
            info!(replica = %self.id, seq_no = chkpt.seq_no, "state transfer target certified");
            actions.push(Action::SkipTo {
                seq_no: chkpt.seq_no,
                state_id: chkpt.state_id,
                replicas,
            });
        }
        if matching < self.config.intersection_quorum() {
            return Ok(actions);
        }
        if !self.checkpoints.has_own(chkpt.seq_no) {
            // A quorum checkpointed past us; if we are skipping, the weak
            // certificate path above drives the transfer.
            debug!(replica = %self.id, seq_no = chkpt.seq_no, "quorum checkpoint we have not reached");
            return Ok(actions);
        }

        info!(replica = %self.id, seq_no = chkpt.seq_no, "checkpoint stable");
        actions.push(Action::StoreState {
            key: chkpt_key(chkpt.seq_no),
            value: encode_digest(&chkpt.state_id),
        });
        actions.extend(self.move_watermarks(chkpt.seq_no));
        Ok(actions)
    }

    /// Weak evidence the network moved past our window entirely.
    fn witness_fall_behind(&mut self, chkpt: &Checkpoint) -> Option<Vec<Action>> {
        let high = self.log.high_watermark();
        let target =
            self.checkpoints
                .witness_high_claim(chkpt, high, self.config.weak_quorum())?;
        warn!(
            replica = %self.id,
            target,
            high,
            "network checkpointed beyond our window, resetting log"
        );
        self.outstanding.clear();
        self.missing_requests.clear();
        self.skip_in_progress = true;
        self.request_timer_active = false;
        let mut actions = vec![
            Action::CancelTimer {
                id: TimerId::Request,
            },
            Action::CancelTimer {
                id: TimerId::NullRequest,
            },
        ];
        for n in self.checkpoints.clear_own() {
            actions.push(Action::DelState { key: chkpt_key(n) });
        }
        actions.extend(self.move_watermarks(target));
        Some(actions)
    }

    /// Slide the window up to the checkpoint at `seq_no`, dropping protocol
    /// state and durable records at or below the new low watermark.
    fn move_watermarks(&mut self, seq_no: u64) -> Vec<Action> {
        let new_low = seq_no / self.config.k * self.config.k;
        if new_low <= self.log.low_watermark() {
            if new_low < self.log.low_watermark() {
                debug!(replica = %self.id, new_low, "ignoring watermark regression");
            }
            return vec![];
        }

        let mut actions = Vec::new();
        for ((view, n), _) in self.log.move_low_watermark(new_low) {
            trace!(replica = %self.id, view, seq_no = n, "dropping certificate below watermark");
        }

        let stale_pset: Vec<u64> = self.pset.range(..=new_low).map(|(n, _)| *n).collect();
        for n in stale_pset {
            self.pset.remove(&n);
            actions.push(Action::DelState { key: pset_key(n) });
        }
        let stale_qset: Vec<(Digest, u64)> = self
            .qset
            .iter()
            .filter(|((_, n), _)| *n <= new_low)
            .map(|(k, _)| *k)
            .collect();
        for key in stale_qset {
            if let Some(entry) = self.qset.remove(&key) {
                actions.push(Action::DelState {
                    key: qset_key(entry.view, entry.seq_no, entry.digest),
                });
            }
        }
        for n in self.checkpoints.prune(new_low) {
            actions.push(Action::DelState { key: chkpt_key(n) });
        }

        info!(
            replica = %self.id,
            low = new_low,
            high = self.log.high_watermark(),
            "moved watermarks"
        );
        if self.active_view && self.is_primary() {
            actions.extend(self.resubmit_requests());
        }
        actions
    }

    /// Primary: retry outstanding requests that never got a slot (throttled
    /// or arrived mid view change).
    fn resubmit_requests(&mut self) -> Vec<Action> {
        if !self.is_primary() {
            return vec![];
        }
        let digests: Vec<Digest> = self.outstanding.keys().copied().collect();
        let mut actions = Vec::new();
        for digest in digests {
            let assigned = self
                .log
                .iter()
                .any(|(_, cert)| cert.digest == Some(digest));
            if assigned {
                continue;
            }
            debug!(replica = %self.id, digest = ?digest, "resubmitting buffered request");
            actions.extend(self.send_pre_prepare(digest));
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // View changes
    // ═══════════════════════════════════════════════════════════════════════

    /// Abandon the current view and vote for the next one.
    pub fn send_view_change(&mut self) -> Vec<Action> {
        let mut actions = vec![
            Action::CancelTimer {
                id: TimerId::Request,
            },
            Action::CancelTimer {
                id: TimerId::NullRequest,
            },
        ];
        self.request_timer_active = false;
        self.new_view_store.remove(&self.view);
        self.view += 1;
        self.active_view = false;
        self.view_change_quorum = false;
        self.missing_requests.clear();

        actions.extend(self.recompute_pq_sets());
        self.log.drop_views_below(self.view);
        self.view_changes.prune_below(self.view);

        let vc = ViewChange {
            view: self.view,
            h: self.log.low_watermark(),
            cset: self.checkpoints.proofs(),
            pset: self.pset.values().copied().collect(),
            qset: self.qset.values().copied().collect(),
            replica_id: self.id,
        };
        info!(
            replica = %self.id,
            view = vc.view,
            h = vc.h,
            pset = vc.pset.len(),
            qset = vc.qset.len(),
            "starting view change"
        );
        self.last_view_change = Some(vc.clone());
        actions.push(Action::Broadcast {
            message: ProtocolMessage::ViewChange(vc),
        });
        actions.push(Action::SetTimer {
            id: TimerId::ViewChangeResend,
            duration: self.config.vc_resend_timeout,
        });
        actions
    }

    /// Fold every prepared / pre-prepared certificate into the durable
    /// PSet/QSet before they are dropped for the new view.
    fn recompute_pq_sets(&mut self) -> Vec<Action> {
        let prepared: Vec<PqEntry> = self
            .log
            .iter()
            .filter_map(|(&(view, seq_no), cert)| {
                let digest = cert.digest?;
                cert.pre_prepare.as_ref()?;
                self.prepared(digest, view, seq_no).then_some(PqEntry {
                    seq_no,
                    digest,
                    view,
                })
            })
            .collect();
        let pre_prepared: Vec<PqEntry> = self
            .log
            .iter()
            .filter_map(|(&(view, seq_no), cert)| {
                let digest = cert.digest?;
                cert.pre_prepare.as_ref()?;
                self.pre_prepared(digest, view, seq_no).then_some(PqEntry {
                    seq_no,
                    digest,
                    view,
                })
            })
            .collect();

        let mut actions = Vec::new();
        for entry in prepared {
            if self
                .pset
                .get(&entry.seq_no)
                .is_some_and(|p| p.view > entry.view)
            {
                continue;
            }
            actions.extend(self.persist_pset_entry(entry));
        }
        for entry in pre_prepared {
            if self
                .qset
                .get(&(entry.digest, entry.seq_no))
                .is_some_and(|q| q.view > entry.view)
            {
                continue;
            }
            actions.extend(self.persist_qset_entry(entry));
        }
        actions
    }

    fn recv_view_change(&mut self, vc: ViewChange) -> Result<Vec<Action>, PbftError> {
        if vc.view < self.view {
            return Err(PbftError::StaleView {
                view: vc.view,
                current: self.view,
            });
        }
        if !correct_view_change(&self.config, &vc) {
            warn!(replica = %self.id, sender = %vc.replica_id, "malformed view-change evidence");
            return Ok(vec![]);
        }
        if self.view_changes.contains(vc.view, vc.replica_id) {
            trace!(replica = %self.id, sender = %vc.replica_id, view = vc.view, "duplicate view change");
            return Ok(vec![]);
        }
        debug!(replica = %self.id, view = vc.view, sender = %vc.replica_id, "recorded view change");
        self.view_changes.insert(vc.clone());

        // Liveness: f+1 replicas ahead of us means our view is dead even if
        // no local timer fired. Join them at the smallest such view.
        let (senders, min_view) = self.view_changes.senders_above(self.view);
        if senders >= self.config.weak_quorum() {
            if let Some(target) = min_view {
                info!(replica = %self.id, target, "joining view-change crowd");
                self.view = target - 1;
                return Ok(self.send_view_change());
            }
        }

        let mut actions = Vec::new();
        if !self.active_view
            && vc.view == self.view
            && self.view_changes.count_for_view(self.view) >= self.config.intersection_quorum()
        {
            if !self.view_change_quorum {
                self.view_change_quorum = true;
                // Escalation is gated on this quorum: a lone replica can
                // never spin through views by itself.
                actions.push(Action::CancelTimer {
                    id: TimerId::ViewChangeResend,
                });
                actions.push(Action::SetTimer {
                    id: TimerId::NewView,
                    duration: self.last_new_view_timeout,
                });
                self.last_new_view_timeout *= 2;
            }
            if self.primary_of(self.view) == self.id {
                actions.extend(self.send_new_view());
            } else {
                actions.extend(self.process_new_view());
            }
        }
        Ok(actions)
    }

    fn send_new_view(&mut self) -> Vec<Action> {
        if self.new_view_store.contains_key(&self.view) {
            return vec![];
        }
        let vcs = self.view_changes.for_view(self.view);
        let Some((cp, _)) = select_initial_checkpoint(&self.config, &vcs) else {
            debug!(replica = %self.id, view = self.view, "no initial checkpoint selectable yet");
            return vec![];
        };
        let Some(xset) = assign_sequence_numbers(&self.config, &vcs, cp.seq_no) else {
            debug!(replica = %self.id, view = self.view, "sequence assignment incomplete, waiting");
            return vec![];
        };
        let nv = NewView {
            view: self.view,
            vset: vcs,
            xset,
            replica_id: self.id,
        };
        info!(
            replica = %self.id,
            view = self.view,
            checkpoint = cp.seq_no,
            entries = nv.xset.len(),
            "broadcasting new view"
        );
        let mut actions = vec![Action::Broadcast {
            message: ProtocolMessage::NewView(Box::new(nv.clone())),
        }];
        self.new_view_store.insert(self.view, nv);
        actions.extend(self.process_new_view());
        actions
    }

    fn recv_new_view(&mut self, nv: NewView) -> Result<Vec<Action>, PbftError> {
        if nv.view == 0 || nv.view < self.view {
            return Err(PbftError::StaleView {
                view: nv.view,
                current: self.view,
            });
        }
        if nv.replica_id != self.primary_of(nv.view) {
            return Err(PbftError::InvalidSender {
                sender: nv.replica_id,
            });
        }
        if self.new_view_store.contains_key(&nv.view) {
            trace!(replica = %self.id, view = nv.view, "duplicate new view");
            return Ok(vec![]);
        }
        let senders: BTreeSet<ReplicaId> = nv.vset.iter().map(|vc| vc.replica_id).collect();
        if (senders.len() as u64) < self.config.intersection_quorum() {
            warn!(replica = %self.id, view = nv.view, senders = senders.len(), "new view lacks a quorum");
            return Ok(vec![]);
        }
        for vc in &nv.vset {
            if vc.view != nv.view || !correct_view_change(&self.config, vc) {
                warn!(replica = %self.id, view = nv.view, "new view carries invalid view-change evidence");
                return Ok(vec![]);
            }
        }

        info!(replica = %self.id, view = nv.view, from = %nv.replica_id, "received new view");
        if self.view < nv.view {
            // We missed the view change itself; adopt the view.
            self.view = nv.view;
            self.active_view = false;
        }
        self.new_view_store.insert(nv.view, nv);
        Ok(self.process_new_view())
    }

    /// Validate and apply the new-view message for our current view.
    ///
    /// The initial checkpoint comes from Cset evidence only; the per-sequence
    /// assignment is recomputed locally and must match the primary's exactly.
    fn process_new_view(&mut self) -> Vec<Action> {
        let Some(nv) = self.new_view_store.get(&self.view).cloned() else {
            return vec![];
        };
        if self.active_view {
            debug!(replica = %self.id, view = self.view, "already active in this view");
            return vec![];
        }
        let Some((cp, replicas)) = select_initial_checkpoint(&self.config, &nv.vset) else {
            warn!(replica = %self.id, view = self.view, "new view has no selectable checkpoint, moving on");
            return self.send_view_change();
        };
        let Some(xset) = assign_sequence_numbers(&self.config, &nv.vset, cp.seq_no) else {
            warn!(replica = %self.id, view = self.view, "new view evidence does not cover the log, moving on");
            return self.send_view_change();
        };
        if xset != nv.xset {
            warn!(replica = %self.id, view = self.view, "new view xset disagrees with local computation");
            return self.send_view_change();
        }

        let mut actions = Vec::new();
        let speculative = self.current_exec.unwrap_or(self.last_exec);
        if self.log.low_watermark() < cp.seq_no {
            actions.extend(self.move_watermarks(cp.seq_no));
        }
        if speculative < cp.seq_no {
            if cp.seq_no > self.last_exec + self.config.log_size() {
                warn!(
                    replica = %self.id,
                    error = %PbftError::ExecutionGap { target: cp.seq_no, last_exec: self.last_exec },
                    "escalating to state transfer"
                );
            }
            info!(replica = %self.id, target = cp.seq_no, "new view starts past our execution, transferring state");
            self.skip_in_progress = true;
            actions.push(Action::SkipTo {
                seq_no: cp.seq_no,
                state_id: cp.state_id,
                replicas,
            });
        }

        // We must hold every payload the new view names before re-preparing.
        self.missing_requests.clear();
        let everyone = self.other_replicas();
        for (n, d) in &nv.xset {
            if *n <= self.log.low_watermark() || d.is_null() {
                continue;
            }
            if !self.req_store.contains_key(d) {
                self.missing_requests.insert(*d);
                actions.push(Action::FetchRequest {
                    digest: *d,
                    replicas: everyone.clone(),
                });
            }
        }
        if !self.missing_requests.is_empty() {
            info!(
                replica = %self.id,
                missing = self.missing_requests.len(),
                "waiting for payloads named by the new view"
            );
            return actions;
        }

        actions.extend(self.finalize_new_view(&nv));
        actions
    }

    fn finalize_new_view(&mut self, nv: &NewView) -> Vec<Action> {
        let mut actions = vec![
            Action::CancelTimer {
                id: TimerId::Request,
            },
            Action::CancelTimer {
                id: TimerId::NewView,
            },
            Action::CancelTimer {
                id: TimerId::ViewChangeResend,
            },
        ];
        self.request_timer_active = false;
        self.active_view = true;
        self.view_change_quorum = false;
        self.last_new_view_timeout = self.config.new_view_timeout;
        self.new_view_store.remove(&self.view.wrapping_sub(1));
        self.seq_no = self.log.low_watermark();

        for (&n, &d) in &nv.xset {
            if n <= self.log.low_watermark() {
                continue;
            }
            let request = if d.is_null() {
                None
            } else {
                self.req_store.get(&d).cloned()
            };
            {
                let cert = self.log.cert_mut(self.view, n);
                cert.pre_prepare = Some(PrePrepare {
                    view: self.view,
                    seq_no: n,
                    digest: d,
                    request,
                    replica_id: nv.replica_id,
                });
                cert.digest = Some(d);
            }
            self.seq_no = self.seq_no.max(n);
            actions.extend(self.persist_qset_entry(PqEntry {
                seq_no: n,
                digest: d,
                view: self.view,
            }));
        }
        self.update_view_change_seq_no();

        if self.primary_of(self.view) != self.id {
            for (&n, &d) in &nv.xset {
                if n <= self.log.low_watermark() {
                    continue;
                }
                self.log.cert_mut(self.view, n).sent_prepare = true;
                actions.push(Action::Broadcast {
                    message: ProtocolMessage::Prepare(Prepare {
                        view: self.view,
                        seq_no: n,
                        digest: d,
                        replica_id: self.id,
                    }),
                });
            }
        } else {
            actions.extend(self.resubmit_requests());
        }

        info!(replica = %self.id, view = self.view, seq_no = self.seq_no, "entered new view");
        actions.extend(self.start_timer_if_outstanding());
        actions
    }

    fn update_view_change_seq_no(&mut self) {
        if self.config.view_change_period == 0 {
            self.view_change_seq_no = u64::MAX;
            return;
        }
        // Rotation always lands on a checkpoint boundary.
        self.view_change_seq_no = self.seq_no + self.config.view_change_period * self.config.k
            - self.seq_no % self.config.k;
        debug!(replica = %self.id, seq_no = self.view_change_seq_no, "primary rotation scheduled");
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════

    fn soft_start_request_timer(&mut self) -> Vec<Action> {
        if self.request_timer_active {
            return vec![];
        }
        self.request_timer_active = true;
        vec![Action::SetTimer {
            id: TimerId::Request,
            duration: self.config.request_timeout,
        }]
    }

    fn start_timer_if_outstanding(&mut self) -> Vec<Action> {
        if self.skip_in_progress || self.current_exec.is_some() {
            return vec![];
        }
        if self.outstanding.is_empty() {
            let mut actions = Vec::new();
            if self.request_timer_active {
                self.request_timer_active = false;
                actions.push(Action::CancelTimer {
                    id: TimerId::Request,
                });
            }
            actions.extend(self.null_request_timer_reset());
            return actions;
        }
        self.soft_start_request_timer()
    }

    fn null_request_timer_reset(&mut self) -> Vec<Action> {
        if self.config.null_request_timeout.is_zero() {
            return vec![];
        }
        let timeout = if self.is_primary() {
            self.config.null_request_timeout
        } else {
            // Backups wait out the send interval plus a request-timeout
            // grace period before declaring the primary dead.
            self.config.null_request_timeout + self.config.request_timeout
        };
        vec![Action::SetTimer {
            id: TimerId::NullRequest,
            duration: timeout,
        }]
    }

    fn on_request_timeout(&mut self) -> Vec<Action> {
        self.request_timer_active = false;
        if !self.active_view {
            debug!(replica = %self.id, "request timer fired during view change, ignoring");
            return vec![];
        }
        if self.outstanding.is_empty() {
            return vec![];
        }
        warn!(
            replica = %self.id,
            pending = self.outstanding.len(),
            view = self.view,
            "request timer expired, suspecting primary"
        );
        self.send_view_change()
    }

    fn on_new_view_timeout(&mut self) -> Vec<Action> {
        if self.active_view {
            return vec![];
        }
        warn!(replica = %self.id, view = self.view, "no new view in time, escalating");
        self.send_view_change()
    }

    fn on_null_request_timeout(&mut self) -> Vec<Action> {
        if !self.active_view {
            return vec![];
        }
        if self.is_primary() {
            debug!(replica = %self.id, "idle interval elapsed, ordering null request");
            let mut actions = self.null_request_timer_reset();
            actions.extend(self.send_pre_prepare(Digest::NULL));
            actions
        } else {
            warn!(replica = %self.id, view = self.view, "primary went silent, forcing view change");
            self.send_view_change()
        }
    }

    fn on_view_change_resend(&mut self) -> Vec<Action> {
        if self.active_view {
            return vec![];
        }
        let Some(vc) = self.last_view_change.clone() else {
            return vec![];
        };
        debug!(replica = %self.id, view = vc.view, "rebroadcasting view change");
        vec![
            Action::Broadcast {
                message: ProtocolMessage::ViewChange(vc),
            },
            Action::SetTimer {
                id: TimerId::ViewChangeResend,
                duration: self.config.vc_resend_timeout,
            },
        ]
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Persistence helpers
    // ═══════════════════════════════════════════════════════════════════════

    fn persist_pset_entry(&mut self, entry: PqEntry) -> Vec<Action> {
        self.pset.insert(entry.seq_no, entry);
        vec![Action::StoreState {
            key: pset_key(entry.seq_no),
            value: encode_pq_entry(&entry),
        }]
    }

    fn persist_qset_entry(&mut self, entry: PqEntry) -> Vec<Action> {
        let mut actions = Vec::new();
        if let Some(old) = self.qset.insert((entry.digest, entry.seq_no), entry) {
            if old.view != entry.view {
                actions.push(Action::DelState {
                    key: qset_key(old.view, old.seq_no, old.digest),
                });
            }
        }
        actions.push(Action::StoreState {
            key: qset_key(entry.view, entry.seq_no, entry.digest),
            value: encode_pq_entry(&entry),
        });
        actions
    }
}

impl StateMachine for PbftState {
    fn handle(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::MessageReceived { sender, message } => {
                let kind = message.type_name();
                match self.on_message(sender, message) {
                    Ok(actions) => actions,
                    Err(error) => {
                        debug!(replica = %self.id, kind, %error, "dropping message");
                        vec![]
                    }
                }
            }
            Event::ClientRequest { request } => self.on_client_request(request),
            Event::RequestTimeout => self.on_request_timeout(),
            Event::NewViewTimeout => self.on_new_view_timeout(),
            Event::NullRequestTimeout => self.on_null_request_timeout(),
            Event::ViewChangeResendTimeout => self.on_view_change_resend(),
            Event::ExecutionDone { seq_no, state_id } => self.on_execution_done(seq_no, state_id),
            Event::SkipDone { seq_no, state_id } => self.on_skip_done(seq_no, state_id),
        }
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_core::{MemoryStore, StateStore};
    use lockstep_types::CheckpointProof;

    fn config(n: u64, f: u64, k: u64, log_multiplier: u64) -> PbftConfig {
        PbftConfig {
            n,
            f,
            k,
            log_multiplier,
            ..PbftConfig::default()
        }
    }

    fn fresh(id: u64, config: PbftConfig) -> PbftState {
        PbftState::new(ReplicaId(id), config, RecoveredState::default())
    }

    fn request(seed: u64) -> Request {
        Request::new(seed, format!("payload-{seed}").into_bytes(), ReplicaId(0))
    }

    fn pre_prepare_for(view: u64, seq_no: u64, req: &Request, primary: u64) -> PrePrepare {
        PrePrepare {
            view,
            seq_no,
            digest: req.digest(),
            request: Some(req.clone()),
            replica_id: ReplicaId(primary),
        }
    }

    fn broadcasts<'a>(actions: &'a [Action], kind: &str) -> Vec<&'a ProtocolMessage> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Broadcast { message } if message.type_name() == kind => Some(message),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn wrong_declared_sender_is_rejected() {
        let mut state = fresh(1, config(4, 1, 10, 4));
        let req = request(1);
        let result = state.on_message(ReplicaId(0), ProtocolMessage::Request(req));
        assert!(matches!(result, Err(PbftError::InvalidSender { .. })));
    }

    #[test]
    fn empty_messages_are_rejected() {
        let mut state = fresh(1, config(4, 1, 10, 4));

        let empty_request = Request::new(0, vec![], ReplicaId(2));
        let result = state.on_message(ReplicaId(2), ProtocolMessage::Request(empty_request));
        assert_eq!(result, Err(PbftError::EmptyMessage));

        // A zero-valued pre-prepare never earns a broadcast.
        let zero_pp = PrePrepare {
            view: 0,
            seq_no: 0,
            digest: Digest::NULL,
            request: None,
            replica_id: ReplicaId(0),
        };
        let result = state.on_message(ReplicaId(0), ProtocolMessage::PrePrepare(zero_pp));
        assert!(matches!(
            result,
            Err(PbftError::OutsideWatermarks { seq_no: 0, .. })
        ));
    }

    #[test]
    fn malicious_pre_prepare_is_discarded_silently() {
        let mut state = fresh(1, config(5, 1, 10, 4));
        let carried = request(7);
        let pp = PrePrepare {
            view: 0,
            seq_no: 1,
            digest: Digest::of(b"hi there"),
            request: Some(carried),
            replica_id: ReplicaId(0),
        };
        let result = state.on_message(ReplicaId(0), ProtocolMessage::PrePrepare(pp));
        assert!(matches!(result, Err(PbftError::DigestMismatch { .. })));
        // Nothing observed means nothing to echo later either.
        assert!(!state.pre_prepared(Digest::of(b"hi there"), 0, 1));
    }

    #[test]
    fn backup_echoes_valid_pre_prepare_with_prepare() {
        let mut state = fresh(1, config(4, 1, 10, 4));
        let req = request(3);
        let pp = pre_prepare_for(0, 1, &req, 0);
        let actions = state
            .on_message(ReplicaId(0), ProtocolMessage::PrePrepare(pp))
            .unwrap();
        assert_eq!(broadcasts(&actions, "Prepare").len(), 1);
        assert!(state.pre_prepared(req.digest(), 0, 1));
        // QSet entry was persisted.
        assert!(actions.iter().any(
            |a| matches!(a, Action::StoreState { key, .. } if key.starts_with("qset.0.1."))
        ));
    }

    #[test]
    fn conflicting_pre_prepare_is_rejected() {
        let mut state = fresh(1, config(4, 1, 10, 4));
        let first = request(1);
        let second = request(2);
        state
            .on_message(
                ReplicaId(0),
                ProtocolMessage::PrePrepare(pre_prepare_for(0, 1, &first, 0)),
            )
            .unwrap();
        let result = state.on_message(
            ReplicaId(0),
            ProtocolMessage::PrePrepare(pre_prepare_for(0, 1, &second, 0)),
        );
        assert!(matches!(
            result,
            Err(PbftError::DuplicatePrePrepare { view: 0, seq_no: 1 })
        ));
        // The original binding survives.
        assert!(state.pre_prepared(first.digest(), 0, 1));
    }

    #[test]
    fn prepare_from_primary_is_rejected() {
        let mut state = fresh(1, config(4, 1, 10, 4));
        let prep = Prepare {
            view: 0,
            seq_no: 1,
            digest: Digest::of(b"x"),
            replica_id: ReplicaId(0),
        };
        let result = state.on_message(ReplicaId(0), ProtocolMessage::Prepare(prep));
        assert!(matches!(result, Err(PbftError::InvalidSender { .. })));
    }

    #[test]
    fn full_round_commits_and_executes() {
        // Backup replica 1 in a 4-replica group: pre-prepare from primary 0,
        // prepares from 2 and 3, commits from everyone.
        let mut state = fresh(1, config(4, 1, 10, 4));
        let req = request(9);
        let d = req.digest();

        let actions = state
            .on_message(
                ReplicaId(0),
                ProtocolMessage::PrePrepare(pre_prepare_for(0, 1, &req, 0)),
            )
            .unwrap();
        assert_eq!(broadcasts(&actions, "Prepare").len(), 1);

        for peer in [2u64, 3] {
            let actions = state
                .on_message(
                    ReplicaId(peer),
                    ProtocolMessage::Prepare(Prepare {
                        view: 0,
                        seq_no: 1,
                        digest: d,
                        replica_id: ReplicaId(peer),
                    }),
                )
                .unwrap();
            if peer == 3 {
                // 2f prepares collected: the commit goes out now.
                assert_eq!(broadcasts(&actions, "Commit").len(), 1);
                assert!(actions.iter().any(
                    |a| matches!(a, Action::StoreState { key, .. } if key == "pset.1")
                ));
            }
        }
        assert!(state.prepared(d, 0, 1));

        let mut execute = None;
        for peer in [0u64, 1, 2] {
            let actions = state
                .on_message(
                    ReplicaId(peer),
                    ProtocolMessage::Commit(Commit {
                        view: 0,
                        seq_no: 1,
                        digest: d,
                        replica_id: ReplicaId(peer),
                    }),
                )
                .unwrap();
            for action in actions {
                if let Action::Execute { seq_no, request } = action {
                    execute = Some((seq_no, request));
                }
            }
        }
        assert!(state.committed(d, 0, 1));
        let (seq_no, delivered) = execute.expect("commit quorum should trigger execution");
        assert_eq!(seq_no, 1);
        assert_eq!(delivered.payload, req.payload);

        // Completion advances last_exec.
        let actions = state.handle(Event::ExecutionDone {
            seq_no: 1,
            state_id: Digest::of(b"s1"),
        });
        assert_eq!(state.last_exec(), 1);
        assert!(broadcasts(&actions, "Checkpoint").is_empty());
    }

    // The send queue is capped at L/2 outstanding pre-prepares; the rest
    // stay buffered until the watermarks move.
    #[test]
    fn send_queue_throttling() {
        let mut state = fresh(0, config(4, 1, 2, 2));
        let mut sent = 0;
        for i in 0..4u64 {
            let actions = state.handle(Event::ClientRequest {
                request: Request::new(i, format!("{i}").into_bytes(), ReplicaId(0)),
            });
            sent += broadcasts(&actions, "PrePrepare").len();
        }
        assert_eq!(sent, 2);
        assert_eq!(state.seq_no(), 2);
    }

    #[test]
    fn stray_execution_done_is_harmless() {
        let mut state = fresh(1, config(4, 1, 10, 4));
        let actions = state.handle(Event::ExecutionDone {
            seq_no: 5,
            state_id: Digest::of(b"s"),
        });
        assert!(actions.is_empty());
        assert_eq!(state.last_exec(), 0);
    }

    // A high checkpoint claim recorded against an old window must not panic
    // once the window has moved past it.
    #[test]
    fn witness_checkpoint_out_of_bounds() {
        let mut state = fresh(1, config(4, 1, 2, 2));
        // Beyond H: recorded as fall-behind evidence, then dropped.
        let result = state.on_message(
            ReplicaId(0),
            ProtocolMessage::Checkpoint(Checkpoint {
                seq_no: 6,
                state_id: Digest::of(b"s"),
                replica_id: ReplicaId(0),
            }),
        );
        assert!(matches!(result, Err(PbftError::OutsideWatermarks { .. })));
        state.move_watermarks(6);
        let result = state.on_message(
            ReplicaId(3),
            ProtocolMessage::Checkpoint(Checkpoint {
                seq_no: 10,
                state_id: Digest::of(b"s"),
                replica_id: ReplicaId(3),
            }),
        );
        assert!(result.is_ok());
        assert!(!state.skip_in_progress());
    }

    // A commit retained without its pre-prepare must survive checkpoint GC.
    #[test]
    fn fall_behind_with_missing_pre_prepare() {
        let mut state = fresh(1, config(4, 1, 2, 2));
        state
            .on_message(
                ReplicaId(0),
                ProtocolMessage::Commit(Commit {
                    view: 0,
                    seq_no: 2,
                    digest: Digest::of(b"d"),
                    replica_id: ReplicaId(0),
                }),
            )
            .unwrap();
        state.move_watermarks(6);
        assert_eq!(state.low_watermark(), 6);
    }

    // Weak quorum of checkpoints beyond H forces a log reset and state
    // transfer.
    #[test]
    fn fall_behind_triggers_skip() {
        let mut state = fresh(3, config(4, 1, 2, 2));
        let state_id = Digest::of(b"state-6");
        // First claim past H is recorded and the message dropped; the second
        // forms the weak set and resets the log.
        let first = state.on_message(
            ReplicaId(0),
            ProtocolMessage::Checkpoint(Checkpoint {
                seq_no: 6,
                state_id,
                replica_id: ReplicaId(0),
            }),
        );
        assert!(matches!(first, Err(PbftError::OutsideWatermarks { .. })));
        state
            .on_message(
                ReplicaId(1),
                ProtocolMessage::Checkpoint(Checkpoint {
                    seq_no: 6,
                    state_id,
                    replica_id: ReplicaId(1),
                }),
            )
            .unwrap();
        assert!(state.skip_in_progress());
        assert_eq!(state.low_watermark(), 6);
        assert_eq!(state.own_checkpoints().len(), 0);

        // A weak certificate inside the new window names the target.
        let target = Digest::of(b"state-8");
        let mut skip = None;
        for peer in [0u64, 1] {
            let actions = state
                .on_message(
                    ReplicaId(peer),
                    ProtocolMessage::Checkpoint(Checkpoint {
                        seq_no: 8,
                        state_id: target,
                        replica_id: ReplicaId(peer),
                    }),
                )
                .unwrap();
            for action in actions {
                if let Action::SkipTo {
                    seq_no, state_id, ..
                } = action
                {
                    skip = Some((seq_no, state_id));
                }
            }
        }
        assert_eq!(skip, Some((8, target)));

        let actions = state.handle(Event::SkipDone {
            seq_no: 8,
            state_id: target,
        });
        assert!(!state.skip_in_progress());
        assert_eq!(state.last_exec(), 8);
        assert_eq!(state.low_watermark(), 8);
        assert!(actions.iter().all(|a| !matches!(a, Action::SkipTo { .. })));
    }

    // Watermarks after a new view come from the Cset checkpoint quorum, not
    // from the local window or the PSet maximum.
    #[test]
    fn new_view_moves_watermarks_to_selected_checkpoint() {
        let mut state = fresh(0, config(4, 1, 10, 2));
        state.view = 1;
        state.active_view = false;
        state.last_exec = 10;

        let vset: Vec<ViewChange> = (0..3u64)
            .map(|replica| ViewChange {
                view: 1,
                h: 5,
                cset: vec![CheckpointProof {
                    seq_no: 10,
                    state_id: Digest::of(b"ten"),
                }],
                pset: vec![],
                qset: vec![],
                replica_id: ReplicaId(replica),
            })
            .collect();
        let mut xset = BTreeMap::new();
        xset.insert(11, Digest::NULL);
        state.new_view_store.insert(
            1,
            NewView {
                view: 1,
                vset,
                xset,
                replica_id: ReplicaId(1),
            },
        );

        let actions = state.process_new_view();
        assert!(state.active_view());
        assert_eq!(state.low_watermark(), 10);
        // last_exec matches the checkpoint: no state transfer.
        assert!(actions.iter().all(|a| !matches!(a, Action::SkipTo { .. })));
        // We are a backup of view 1 and re-prepare the null slot.
        assert_eq!(broadcasts(&actions, "Prepare").len(), 1);
    }

    #[test]
    fn new_view_past_execution_requests_state_transfer() {
        let mut state = fresh(0, config(4, 1, 10, 2));
        state.view = 1;
        state.active_view = false;
        // last_exec stays 0: the checkpoint at 10 is unreachable locally.

        let vset: Vec<ViewChange> = (0..3u64)
            .map(|replica| ViewChange {
                view: 1,
                h: 5,
                cset: vec![CheckpointProof {
                    seq_no: 10,
                    state_id: Digest::of(b"ten"),
                }],
                pset: vec![],
                qset: vec![],
                replica_id: ReplicaId(replica),
            })
            .collect();
        let mut xset = BTreeMap::new();
        xset.insert(11, Digest::NULL);
        state.new_view_store.insert(
            1,
            NewView {
                view: 1,
                vset,
                xset,
                replica_id: ReplicaId(1),
            },
        );

        let actions = state.process_new_view();
        assert!(state.skip_in_progress());
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::SkipTo { seq_no: 10, .. })));
    }

    #[test]
    fn request_timer_is_quiet_during_view_change() {
        let mut state = fresh(1, config(4, 1, 2, 2));
        state.active_view = false;
        state.handle(Event::ClientRequest { request: request(1) });
        let actions = state.handle(Event::RequestTimeout);
        assert!(broadcasts(&actions, "ViewChange").is_empty());
        assert_eq!(state.view(), 0);
    }

    #[test]
    fn crowd_rule_joins_larger_views() {
        let mut state = fresh(0, config(4, 1, 10, 4));
        let vc = |replica: u64| ViewChange {
            view: 2,
            h: 0,
            cset: vec![CheckpointProof {
                seq_no: 0,
                state_id: Digest::NULL,
            }],
            pset: vec![],
            qset: vec![],
            replica_id: ReplicaId(replica),
        };
        state
            .on_message(ReplicaId(2), ProtocolMessage::ViewChange(vc(2)))
            .unwrap();
        assert_eq!(state.view(), 0);
        let actions = state
            .on_message(ReplicaId(3), ProtocolMessage::ViewChange(vc(3)))
            .unwrap();
        // f+1 replicas ahead of us: we join at their view.
        assert_eq!(state.view(), 2);
        assert!(!state.active_view());
        assert_eq!(broadcasts(&actions, "ViewChange").len(), 1);
    }

    #[test]
    fn stale_view_change_is_dropped() {
        let mut state = fresh(0, config(4, 1, 10, 4));
        state.view = 3;
        let vc = ViewChange {
            view: 1,
            h: 0,
            cset: vec![],
            pset: vec![],
            qset: vec![],
            replica_id: ReplicaId(2),
        };
        let result = state.on_message(ReplicaId(2), ProtocolMessage::ViewChange(vc));
        assert!(matches!(result, Err(PbftError::StaleView { view: 1, .. })));
    }

    #[test]
    fn qset_survives_restart() {
        let mut store = MemoryStore::new();
        let cfg = config(4, 1, 10, 4);
        let req = request(1);
        let d = req.digest();

        let mut state = fresh(1, cfg.clone());
        let actions = state
            .on_message(
                ReplicaId(0),
                ProtocolMessage::PrePrepare(pre_prepare_for(0, 1, &req, 0)),
            )
            .unwrap();
        for action in &actions {
            match action {
                Action::StoreState { key, value } => store.store_state(key, value).unwrap(),
                Action::DelState { key } => store.del_state(key),
                _ => {}
            }
        }
        assert!(state.pre_prepared(d, 0, 1));

        // Crash and restart from the store.
        let recovered = RecoveredState::load(&store, 0, Digest::NULL);
        let restarted = PbftState::new(ReplicaId(1), cfg, recovered);
        assert!(restarted.pre_prepared(d, 0, 1));
    }

    #[test]
    fn persisted_records_are_deleted_below_watermark() {
        let mut store = MemoryStore::new();
        let mut state = fresh(1, config(4, 1, 2, 2));
        let req = request(1);

        let mut apply = |store: &mut MemoryStore, actions: &[Action]| {
            for action in actions {
                match action {
                    Action::StoreState { key, value } => store.store_state(key, value).unwrap(),
                    Action::DelState { key } => store.del_state(key),
                    _ => {}
                }
            }
        };

        let actions = state
            .on_message(
                ReplicaId(0),
                ProtocolMessage::PrePrepare(pre_prepare_for(0, 1, &req, 0)),
            )
            .unwrap();
        apply(&mut store, &actions);
        assert!(store.read_state_set("qset.").len() == 1);

        let actions = state.move_watermarks(2);
        apply(&mut store, &actions);
        assert!(store.read_state_set("qset.").is_empty());
    }

    #[test]
    fn view_change_carries_prepared_evidence() {
        let mut state = fresh(1, config(4, 1, 10, 4));
        let req = request(5);
        let d = req.digest();
        state
            .on_message(
                ReplicaId(0),
                ProtocolMessage::PrePrepare(pre_prepare_for(0, 1, &req, 0)),
            )
            .unwrap();
        for peer in [2u64, 3] {
            state
                .on_message(
                    ReplicaId(peer),
                    ProtocolMessage::Prepare(Prepare {
                        view: 0,
                        seq_no: 1,
                        digest: d,
                        replica_id: ReplicaId(peer),
                    }),
                )
                .unwrap();
        }
        assert!(state.prepared(d, 0, 1));

        let actions = state.send_view_change();
        let vcs = broadcasts(&actions, "ViewChange");
        assert_eq!(vcs.len(), 1);
        let ProtocolMessage::ViewChange(vc) = vcs[0] else {
            unreachable!()
        };
        assert_eq!(vc.view, 1);
        assert!(vc.pset.iter().any(|e| e.seq_no == 1 && e.digest == d));
        assert!(vc.qset.iter().any(|e| e.seq_no == 1 && e.digest == d));
        // The genesis checkpoint anchors the Cset.
        assert!(vc.cset.iter().any(|c| c.seq_no == 0));
        assert!(!state.active_view());
        assert_eq!(state.view(), 1);
    }
}
