//! Production event loop.
//!
//! One [`ReplicaRunner`] per replica: a bounded event channel, a dedicated
//! timer channel (so a network flood can never starve liveness timers), and
//! synchronous action execution against the injected [`Transport`],
//! [`ExecutionEngine`] and [`StateStore`] collaborators.
//!
//! Collaborators never call back into the loop synchronously; completions
//! come back through the [`ReplicaHandle`] as events.

use crate::codec::{decode_frame, encode_message, CodecError};
use crate::timers::TimerManager;
use lockstep_core::{Action, Event, StateMachine, StateStore};
use lockstep_pbft::PbftState;
use lockstep_types::{Digest, ReplicaId, Request};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Errors from the production runner.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("event channel closed")]
    ChannelClosed,

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The durable store refused a write; the replica halts rather than risk
    /// divergence after restart.
    #[error("persistence failure: {0}")]
    Persistence(String),
}

/// Outbound side of the network, implemented by the embedding transport.
///
/// The transport owns message authentication: it signs outbound frames (see
/// [`ExecutionEngine::sign`]) and verifies the claimed sender of inbound
/// frames before calling [`ReplicaHandle::deliver`] with the authenticated
/// identity.
pub trait Transport: Send {
    /// Send a frame to every replica, including this one.
    fn broadcast(&mut self, frame: Vec<u8>);

    /// Send a frame to a single replica.
    fn unicast(&mut self, frame: Vec<u8>, dst: ReplicaId);

    /// Ask peers to retransmit the request payload named by `digest`.
    fn fetch_request(&mut self, digest: Digest, replicas: &[ReplicaId]);
}

/// The application this replica orders requests for.
pub trait ExecutionEngine: Send {
    /// Apply the request at `seq_no`. Acknowledge via
    /// [`ReplicaHandle::execution_done`] when finished.
    fn execute(&mut self, seq_no: u64, payload: Vec<u8>);

    /// Fetch the application state at `(seq_no, state_id)` from one of
    /// `replicas`. Acknowledge via [`ReplicaHandle::skip_done`].
    fn skip_to(&mut self, seq_no: u64, state_id: Digest, replicas: Vec<ReplicaId>);

    /// Check a client payload before it enters the protocol.
    fn validate(&self, payload: &[u8]) -> Result<(), String>;

    /// Sign outbound bytes. Called by the transport layer.
    fn sign(&self, bytes: &[u8]) -> Vec<u8>;

    /// Verify a signature from `sender`. Called by the transport layer.
    fn verify(&self, sender: ReplicaId, signature: &[u8], bytes: &[u8]) -> Result<(), String>;
}

/// Handle for feeding events into a running replica.
#[derive(Clone)]
pub struct ReplicaHandle {
    event_tx: mpsc::Sender<Event>,
}

impl ReplicaHandle {
    /// Deliver an authenticated inbound frame.
    ///
    /// `sender` must be the transport-level identity the frame was verified
    /// against; the protocol rejects frames whose declared sender differs.
    pub async fn deliver(&self, sender: ReplicaId, frame: &[u8]) -> Result<(), RunnerError> {
        let (message, _) = decode_frame(frame)?.ok_or(CodecError::MessageTooShort)?;
        self.event_tx
            .send(Event::MessageReceived { sender, message })
            .await
            .map_err(|_| RunnerError::ChannelClosed)
    }

    /// Submit a client request through this replica.
    pub async fn submit(&self, request: Request) -> Result<(), RunnerError> {
        self.event_tx
            .send(Event::ClientRequest { request })
            .await
            .map_err(|_| RunnerError::ChannelClosed)
    }

    /// Acknowledge that execution of `seq_no` finished with `state_id`.
    pub async fn execution_done(&self, seq_no: u64, state_id: Digest) -> Result<(), RunnerError> {
        self.event_tx
            .send(Event::ExecutionDone { seq_no, state_id })
            .await
            .map_err(|_| RunnerError::ChannelClosed)
    }

    /// Acknowledge that state transfer reached `(seq_no, state_id)`.
    pub async fn skip_done(&self, seq_no: u64, state_id: Digest) -> Result<(), RunnerError> {
        self.event_tx
            .send(Event::SkipDone { seq_no, state_id })
            .await
            .map_err(|_| RunnerError::ChannelClosed)
    }
}

/// Handle for shutting down a running [`ReplicaRunner`].
///
/// When dropped, signals the runner to exit gracefully.
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl ShutdownHandle {
    /// Trigger shutdown (consumes the handle).
    pub fn shutdown(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ShutdownHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// The replica event loop.
pub struct ReplicaRunner<T, E, S>
where
    T: Transport,
    E: ExecutionEngine,
    S: StateStore,
{
    state: PbftState,
    transport: T,
    engine: E,
    store: S,
    timers: TimerManager,
    event_rx: mpsc::Receiver<Event>,
    timer_rx: mpsc::Receiver<Event>,
    handle: ReplicaHandle,
    shutdown_rx: oneshot::Receiver<()>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    start_time: Instant,
}

impl<T, E, S> ReplicaRunner<T, E, S>
where
    T: Transport,
    E: ExecutionEngine,
    S: StateStore,
{
    /// Build a runner around a (possibly recovered) protocol state.
    pub fn new(state: PbftState, transport: T, engine: E, store: S, capacity: usize) -> Self {
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let (timer_tx, timer_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        Self {
            state,
            transport,
            engine,
            store,
            timers: TimerManager::new(timer_tx),
            event_rx,
            timer_rx,
            handle: ReplicaHandle { event_tx },
            shutdown_rx,
            shutdown_tx: Some(shutdown_tx),
            start_time: Instant::now(),
        }
    }

    /// Handle for feeding events in. Clone freely.
    pub fn handle(&self) -> ReplicaHandle {
        self.handle.clone()
    }

    /// Take the shutdown handle. Returns `None` after the first call.
    pub fn shutdown_handle(&mut self) -> Option<ShutdownHandle> {
        self.shutdown_tx.take().map(|tx| ShutdownHandle { tx: Some(tx) })
    }

    /// Run the loop until shutdown or a fatal error.
    pub async fn run(mut self) -> Result<(), RunnerError> {
        info!(replica = %self.state.id(), view = self.state.view(), "starting replica runner");
        let actions = self.state.start();
        self.process_actions(actions)?;

        loop {
            tokio::select! {
                biased;

                // Shutdown always wins.
                _ = &mut self.shutdown_rx => {
                    info!(replica = %self.state.id(), "shutdown signal received");
                    break;
                }

                // Timers have their own channel so they are never starved by
                // a network flood - if timers stop firing, the replica can
                // neither suspect a dead primary nor escalate view changes.
                Some(event) = self.timer_rx.recv() => {
                    self.step(event)?;
                }

                event = self.event_rx.recv() => {
                    match event {
                        Some(event) => self.step(event)?,
                        None => break,
                    }
                }
            }
        }
        self.timers.cancel_all();
        Ok(())
    }

    fn step(&mut self, event: Event) -> Result<(), RunnerError> {
        if let Event::ClientRequest { request } = &event {
            if let Err(reason) = self.engine.validate(&request.payload) {
                warn!(replica = %self.state.id(), reason, "rejecting invalid client request");
                return Ok(());
            }
        }
        self.state.set_time(self.start_time.elapsed());
        debug!(replica = %self.state.id(), event = event.type_name(), "handling event");
        let actions = self.state.handle(event);
        self.process_actions(actions)
    }

    fn process_actions(&mut self, actions: Vec<Action>) -> Result<(), RunnerError> {
        for action in actions {
            match action {
                Action::Broadcast { message } => {
                    let frame = encode_message(&message)?;
                    self.transport.broadcast(frame);
                }
                Action::Unicast { message, dst } => {
                    let frame = encode_message(&message)?;
                    self.transport.unicast(frame, dst);
                }
                Action::SetTimer { id, duration } => self.timers.set_timer(id, duration),
                Action::CancelTimer { id } => self.timers.cancel_timer(id),
                Action::Execute { seq_no, request } => {
                    self.engine.execute(seq_no, request.payload);
                }
                Action::SkipTo {
                    seq_no,
                    state_id,
                    replicas,
                } => self.engine.skip_to(seq_no, state_id, replicas),
                Action::FetchRequest { digest, replicas } => {
                    self.transport.fetch_request(digest, &replicas);
                }
                Action::StoreState { key, value } => {
                    if let Err(e) = self.store.store_state(&key, &value) {
                        error!(replica = %self.state.id(), key, error = %e, "halting on persistence failure");
                        return Err(RunnerError::Persistence(e.to_string()));
                    }
                }
                Action::DelState { key } => self.store.del_state(&key),
            }
        }
        Ok(())
    }
}
