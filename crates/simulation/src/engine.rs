//! Mock execution engine for simulation.
//!
//! Applies payloads by folding them into a running state digest, so any two
//! replicas that executed the same requests in the same order report the same
//! state id. Execution can be blocked to model a slow application, and state
//! transfer jumps the counters to the target.

use lockstep_types::Digest;
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct MockExecutionEngine {
    executions: u64,
    last_seq: u64,
    last_execution: Option<Vec<u8>>,
    state_id: Digest,
    skip_occurred: bool,
    blocked: bool,
    pending: VecDeque<(u64, Vec<u8>)>,
}

impl MockExecutionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Execute one payload. Returns the completion `(seq_no, state_id)`, or
    /// `None` while execution is blocked.
    pub fn execute(&mut self, seq_no: u64, payload: Vec<u8>) -> Option<(u64, Digest)> {
        if self.blocked {
            self.pending.push_back((seq_no, payload));
            return None;
        }
        Some(self.apply(seq_no, payload))
    }

    fn apply(&mut self, seq_no: u64, payload: Vec<u8>) -> (u64, Digest) {
        self.executions += 1;
        self.last_seq = seq_no;
        let mut bytes = self.state_id.as_bytes().to_vec();
        bytes.extend_from_slice(&payload);
        self.state_id = Digest::of(&bytes);
        self.last_execution = Some(payload);
        (seq_no, self.state_id)
    }

    /// Adopt the application state at `(seq_no, state_id)`, as a real engine
    /// would after fetching a snapshot from a peer.
    pub fn skip_to(&mut self, seq_no: u64, state_id: Digest) -> (u64, Digest) {
        self.skip_occurred = true;
        self.executions = seq_no;
        self.last_seq = seq_no;
        self.state_id = state_id;
        (seq_no, state_id)
    }

    /// Stop completing executions; payloads queue up instead.
    pub fn block(&mut self) {
        self.blocked = true;
    }

    /// Resume and return the completions for everything that queued up.
    pub fn unblock(&mut self) -> Vec<(u64, Digest)> {
        self.blocked = false;
        let pending: Vec<_> = self.pending.drain(..).collect();
        pending
            .into_iter()
            .map(|(seq_no, payload)| self.apply(seq_no, payload))
            .collect()
    }

    pub fn executions(&self) -> u64 {
        self.executions
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn last_execution(&self) -> Option<&[u8]> {
        self.last_execution.as_deref()
    }

    pub fn state_id(&self) -> Digest {
        self.state_id
    }

    pub fn skip_occurred(&self) -> bool {
        self.skip_occurred
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_histories_produce_identical_state() {
        let mut a = MockExecutionEngine::new();
        let mut b = MockExecutionEngine::new();
        for (seq, payload) in [(1u64, b"x".to_vec()), (2, b"y".to_vec())] {
            a.execute(seq, payload.clone());
            b.execute(seq, payload);
        }
        assert_eq!(a.state_id(), b.state_id());
        assert_eq!(a.executions(), 2);
    }

    #[test]
    fn blocking_defers_completions() {
        let mut engine = MockExecutionEngine::new();
        engine.block();
        assert!(engine.execute(1, b"x".to_vec()).is_none());
        assert!(engine.execute(2, b"y".to_vec()).is_none());
        assert_eq!(engine.executions(), 0);

        let completions = engine.unblock();
        assert_eq!(completions.len(), 2);
        assert_eq!(completions[0].0, 1);
        assert_eq!(engine.executions(), 2);
        assert_eq!(engine.last_seq(), 2);
    }

    #[test]
    fn skip_adopts_foreign_state() {
        let mut engine = MockExecutionEngine::new();
        let target = Digest::of(b"snapshot");
        let (seq, state) = engine.skip_to(8, target);
        assert_eq!((seq, state), (8, target));
        assert!(engine.skip_occurred());
        assert_eq!(engine.executions(), 8);
    }
}
