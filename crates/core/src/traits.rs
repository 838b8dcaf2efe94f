//! Traits connecting the protocol core to its runners.

use crate::{Action, Event};
use std::collections::BTreeMap;
use std::time::Duration;

/// A synchronous, deterministic state machine.
///
/// ```text
/// Events → StateMachine::handle() → Actions
/// ```
///
/// The state machine is:
/// - **Synchronous**: no async, no `.await`
/// - **Deterministic**: same state + event = same actions
/// - **Pure-ish**: mutates self, but performs no I/O
///
/// All I/O is handled by a runner (simulation or production) which delivers
/// events, executes the returned actions, and converts action results back
/// into events.
pub trait StateMachine {
    /// Process one event to completion and return the actions it caused.
    fn handle(&mut self, event: Event) -> Vec<Action>;

    /// Set the current time. Runners call this before each `handle`.
    fn set_time(&mut self, now: Duration);
}

/// Failure writing to the durable store.
///
/// The replica halts on this rather than risk divergence after restart.
#[derive(Debug, thiserror::Error)]
#[error("state store failure: {0}")]
pub struct StoreError(pub String);

/// The durable key/value store behind
/// [`Action::StoreState`](crate::Action::StoreState).
///
/// The loop's single-threaded invocation serializes all access; implementors
/// need no internal locking.
pub trait StateStore {
    /// Durably store a record.
    fn store_state(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Delete a record. Deleting a missing key is a no-op.
    fn del_state(&mut self, key: &str);

    /// Read a record.
    fn read_state(&self, key: &str) -> Option<Vec<u8>>;

    /// Read every record whose key starts with `prefix`.
    fn read_state_set(&self, prefix: &str) -> BTreeMap<String, Vec<u8>>;
}

/// In-memory [`StateStore`] used by tests and the deterministic simulation.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    records: BTreeMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl StateStore for MemoryStore {
    fn store_state(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.records.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn del_state(&mut self, key: &str) {
        self.records.remove(key);
    }

    fn read_state(&self, key: &str) -> Option<Vec<u8>> {
        self.records.get(key).cloned()
    }

    fn read_state_set(&self, prefix: &str) -> BTreeMap<String, Vec<u8>> {
        self.records
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
