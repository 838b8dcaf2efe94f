//! Deterministic simulation runner.
//!
//! Runs a whole replica group inside one thread with simulated time. Events
//! are processed from a global queue ordered by (time, priority, sequence),
//! so a given seed always produces the same run. Each replica has its own
//! in-memory store and mock execution engine; crash/restart rebuilds the
//! protocol state from that store the way a production restart would.

use crate::engine::MockExecutionEngine;
use crate::network::{SimulatedNetwork, SimulationConfig};
use lockstep_core::{
    Action, Event, EventPriority, MemoryStore, StateMachine, StateStore, TimerId,
};
use lockstep_pbft::{PbftConfig, PbftState, RecoveredState};
use lockstep_types::{Digest, ProtocolMessage, ReplicaId, Request};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Queue ordering key: time first, then priority, then arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct EventKey {
    time: Duration,
    priority: EventPriority,
    sequence: u64,
}

#[derive(Debug)]
struct QueuedEvent {
    dst: u64,
    event: Event,
}

/// Per-message delivery veto: `(src, dst, message) -> deliver?`.
///
/// Only applied between distinct replicas; loopback copies always arrive.
pub type MessageFilter = Box<dyn FnMut(u64, u64, &ProtocolMessage) -> bool>;

struct ReplicaHarness {
    state: PbftState,
    store: MemoryStore,
    engine: MockExecutionEngine,
    halted: bool,
}

/// Statistics collected during simulation.
#[derive(Debug, Default, Clone)]
pub struct SimulationStats {
    pub events_processed: u64,
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub timers_set: u64,
    pub timers_cancelled: u64,
}

/// Deterministic simulation of a replica group.
pub struct SimulationRunner {
    replicas: Vec<ReplicaHarness>,
    queue: BTreeMap<EventKey, QueuedEvent>,
    sequence: u64,
    now: Duration,
    network: SimulatedNetwork,
    rng: ChaCha8Rng,
    /// Pending timers, `(replica, timer) -> queued key`, for cancellation.
    timers: HashMap<(u64, TimerId), EventKey>,
    filter: Option<MessageFilter>,
    stats: SimulationStats,
    pbft_config: PbftConfig,
    timestamps: u64,
}

impl SimulationRunner {
    /// Create a replica group. `N` and `f` are derived from the simulation
    /// size; the rest of `pbft_config` is taken as given.
    pub fn new(sim_config: SimulationConfig, mut pbft_config: PbftConfig, seed: u64) -> Self {
        let n = sim_config.num_replicas;
        pbft_config.n = n;
        pbft_config.f = n.saturating_sub(1) / 3;

        let replicas = (0..n)
            .map(|id| ReplicaHarness {
                state: PbftState::new(
                    ReplicaId(id),
                    pbft_config.clone(),
                    RecoveredState::default(),
                ),
                store: MemoryStore::new(),
                engine: MockExecutionEngine::new(),
                halted: false,
            })
            .collect();

        info!(replicas = n, f = pbft_config.f, seed, "created simulation");
        Self {
            replicas,
            queue: BTreeMap::new(),
            sequence: 0,
            now: Duration::ZERO,
            network: SimulatedNetwork::new(sim_config),
            rng: ChaCha8Rng::seed_from_u64(seed),
            timers: HashMap::new(),
            filter: None,
            stats: SimulationStats::default(),
            pbft_config,
            timestamps: 0,
        }
    }

    /// Arm every replica's initial timers. Call once before running.
    pub fn start(&mut self) {
        for id in 0..self.replicas.len() as u64 {
            let actions = self.replicas[id as usize].state.start();
            self.apply_actions(id, actions);
        }
    }

    // ─── Introspection ───

    pub fn replica(&self, id: u64) -> &PbftState {
        &self.replicas[id as usize].state
    }

    /// Tune one replica's configuration before [`start`](Self::start).
    pub fn replica_config_mut(&mut self, id: u64) -> &mut PbftConfig {
        self.replicas[id as usize].state.config_mut()
    }

    pub fn engine(&self, id: u64) -> &MockExecutionEngine {
        &self.replicas[id as usize].engine
    }

    pub fn store(&self, id: u64) -> &MemoryStore {
        &self.replicas[id as usize].store
    }

    pub fn executions(&self, id: u64) -> u64 {
        self.engine(id).executions()
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    pub fn network_mut(&mut self) -> &mut SimulatedNetwork {
        &mut self.network
    }

    pub fn set_filter(&mut self, filter: MessageFilter) {
        self.filter = Some(filter);
    }

    pub fn clear_filter(&mut self) {
        self.filter = None;
    }

    // ─── Driving the simulation ───

    /// Submit a client request through one replica. Returns its digest.
    pub fn submit(&mut self, via: u64, payload: Vec<u8>) -> Digest {
        self.timestamps += 1;
        let request = Request::new(self.timestamps, payload, ReplicaId(via));
        let digest = request.digest();
        self.schedule(via, Duration::from_millis(1), Event::ClientRequest { request });
        digest
    }

    /// Submit the same request through every replica, the way a broadcasting
    /// client would. Returns its digest.
    pub fn submit_to_all(&mut self, payload: Vec<u8>) -> Digest {
        self.timestamps += 1;
        let request = Request::new(self.timestamps, payload, ReplicaId(0));
        let digest = request.digest();
        for id in 0..self.replicas.len() as u64 {
            self.schedule(
                id,
                Duration::from_millis(1),
                Event::ClientRequest {
                    request: request.clone(),
                },
            );
        }
        digest
    }

    /// Force a view change on one replica, as if its timers had given up.
    pub fn trigger_view_change(&mut self, id: u64) {
        let harness = &mut self.replicas[id as usize];
        harness.state.set_time(self.now);
        let actions = harness.state.send_view_change();
        self.apply_actions(id, actions);
    }

    /// Stop completing executions on one replica.
    pub fn block_execution(&mut self, id: u64) {
        self.replicas[id as usize].engine.block();
    }

    pub fn block_execution_all(&mut self) {
        for harness in &mut self.replicas {
            harness.engine.block();
        }
    }

    /// Resume executions on one replica, delivering deferred completions.
    pub fn release_execution(&mut self, id: u64) {
        let completions = self.replicas[id as usize].engine.unblock();
        for (seq_no, state_id) in completions {
            self.schedule(
                id,
                Duration::from_millis(1),
                Event::ExecutionDone { seq_no, state_id },
            );
        }
    }

    pub fn release_execution_all(&mut self) {
        for id in 0..self.replicas.len() as u64 {
            self.release_execution(id);
        }
    }

    /// Crash one replica and bring it back from its durable store.
    ///
    /// Pending internal events and timers die with the process; messages
    /// already in flight on the network still arrive.
    pub fn restart_replica(&mut self, id: u64) {
        info!(replica = id, "restarting replica");
        let dead_timers: Vec<((u64, TimerId), EventKey)> = self
            .timers
            .iter()
            .filter(|((replica, _), _)| *replica == id)
            .map(|(k, v)| (*k, *v))
            .collect();
        for (timer, key) in dead_timers {
            self.timers.remove(&timer);
            self.queue.remove(&key);
        }
        let stale: Vec<EventKey> = self
            .queue
            .iter()
            .filter(|(key, queued)| {
                queued.dst == id && key.priority <= EventPriority::Timer
            })
            .map(|(key, _)| *key)
            .collect();
        for key in stale {
            self.queue.remove(&key);
        }

        let harness = &mut self.replicas[id as usize];
        let recovered = RecoveredState::load(
            &harness.store,
            harness.engine.last_seq(),
            harness.engine.state_id(),
        );
        harness.state = PbftState::new(ReplicaId(id), self.pbft_config.clone(), recovered);
        harness.halted = false;
        let actions = self.replicas[id as usize].state.start();
        self.apply_actions(id, actions);
    }

    /// Advance simulated time by `duration`, processing everything due.
    pub fn run_for(&mut self, duration: Duration) {
        let deadline = self.now + duration;
        while let Some((&key, _)) = self.queue.iter().next() {
            if key.time > deadline {
                break;
            }
            let Some(queued) = self.queue.remove(&key) else {
                break;
            };
            self.now = key.time;
            self.dispatch(key, queued);
        }
        self.now = deadline;
    }

    // ─── Internals ───

    fn dispatch(&mut self, key: EventKey, queued: QueuedEvent) {
        if let Some(timer) = timer_id_of(&queued.event) {
            // Only clear the registration this firing belongs to; a re-armed
            // timer has a newer key.
            if self.timers.get(&(queued.dst, timer)) == Some(&key) {
                self.timers.remove(&(queued.dst, timer));
            } else {
                trace!(replica = queued.dst, ?timer, "ignoring superseded timer firing");
                return;
            }
        }
        let harness = &mut self.replicas[queued.dst as usize];
        if harness.halted {
            debug!(replica = queued.dst, "dropping event for halted replica");
            return;
        }
        harness.state.set_time(self.now);
        let actions = harness.state.handle(queued.event);
        self.stats.events_processed += 1;
        self.apply_actions(queued.dst, actions);
    }

    fn apply_actions(&mut self, src: u64, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Broadcast { message } => {
                    for dst in 0..self.replicas.len() as u64 {
                        self.deliver(src, dst, message.clone());
                    }
                }
                Action::Unicast { message, dst } => {
                    self.deliver(src, dst.0, message);
                }
                Action::SetTimer { id, duration } => {
                    self.stats.timers_set += 1;
                    if let Some(old) = self.timers.remove(&(src, id)) {
                        self.queue.remove(&old);
                    }
                    let key = self.schedule(src, duration, id.to_event());
                    self.timers.insert((src, id), key);
                }
                Action::CancelTimer { id } => {
                    if let Some(old) = self.timers.remove(&(src, id)) {
                        self.stats.timers_cancelled += 1;
                        self.queue.remove(&old);
                    }
                }
                Action::Execute { seq_no, request } => {
                    let completion =
                        self.replicas[src as usize].engine.execute(seq_no, request.payload);
                    if let Some((seq_no, state_id)) = completion {
                        self.schedule(
                            src,
                            Duration::from_millis(1),
                            Event::ExecutionDone { seq_no, state_id },
                        );
                    }
                }
                Action::SkipTo {
                    seq_no, state_id, ..
                } => {
                    let (seq_no, state_id) =
                        self.replicas[src as usize].engine.skip_to(seq_no, state_id);
                    self.schedule(
                        src,
                        Duration::from_millis(1),
                        Event::SkipDone { seq_no, state_id },
                    );
                }
                Action::FetchRequest { digest, replicas } => {
                    self.fetch_request(src, digest, &replicas);
                }
                Action::StoreState { key, value } => {
                    if let Err(e) = self.replicas[src as usize].store.store_state(&key, &value) {
                        warn!(replica = src, error = %e, "persistence failure, halting replica");
                        self.replicas[src as usize].halted = true;
                        return;
                    }
                }
                Action::DelState { key } => {
                    self.replicas[src as usize].store.del_state(&key);
                }
            }
        }
    }

    /// Serve a payload fetch from the first peer that still holds it.
    fn fetch_request(&mut self, src: u64, digest: Digest, replicas: &[ReplicaId]) {
        for peer in replicas {
            let Some(request) = self.replicas[peer.0 as usize].state.request(&digest).cloned()
            else {
                continue;
            };
            trace!(replica = src, from = %peer, digest = ?digest, "serving request fetch");
            // A relayed request authenticates as its origin, like any
            // client-signed blob.
            let latency = self.network.sample_latency(&mut self.rng);
            let sender = request.replica_id;
            self.schedule(
                src,
                latency,
                Event::MessageReceived {
                    sender,
                    message: ProtocolMessage::Request(request),
                },
            );
            return;
        }
        debug!(replica = src, digest = ?digest, "no peer holds the requested payload");
    }

    fn deliver(&mut self, src: u64, dst: u64, message: ProtocolMessage) {
        if src != dst {
            if let Some(filter) = self.filter.as_mut() {
                if !filter(src, dst, &message) {
                    self.stats.messages_dropped += 1;
                    return;
                }
            }
        }
        let Some(latency) = self.network.should_deliver(src, dst, &mut self.rng) else {
            self.stats.messages_dropped += 1;
            return;
        };
        self.stats.messages_sent += 1;
        // Requests are authenticated by their origin (client signature);
        // everything else by the sending replica.
        let sender = match &message {
            ProtocolMessage::Request(request) => request.replica_id,
            _ => ReplicaId(src),
        };
        self.schedule(dst, latency, Event::MessageReceived { sender, message });
    }

    fn schedule(&mut self, dst: u64, delay: Duration, event: Event) -> EventKey {
        self.sequence += 1;
        let key = EventKey {
            time: self.now + delay,
            priority: event.priority(),
            sequence: self.sequence,
        };
        self.queue.insert(key, QueuedEvent { dst, event });
        key
    }
}

fn timer_id_of(event: &Event) -> Option<TimerId> {
    match event {
        Event::RequestTimeout => Some(TimerId::Request),
        Event::NewViewTimeout => Some(TimerId::NewView),
        Event::NullRequestTimeout => Some(TimerId::NullRequest),
        Event::ViewChangeResendTimeout => Some(TimerId::ViewChangeResend),
        _ => None,
    }
}
