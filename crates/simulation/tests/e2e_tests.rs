//! End-to-end scenarios for the deterministic simulation.
//!
//! These drive whole replica groups through agreement, checkpointing and
//! fall-behind recovery with simulated time. Runs are single-threaded and
//! reproducible: the only nondeterminism is the seeded network jitter.

use lockstep_core::StateStore;
use lockstep_pbft::PbftConfig;
use lockstep_simulation::{SimulationConfig, SimulationRunner};
use lockstep_types::ProtocolMessage;
use std::time::Duration;
use tracing_test::traced_test;

fn sim(num_replicas: u64) -> SimulationConfig {
    SimulationConfig {
        num_replicas,
        ..SimulationConfig::default()
    }
}

fn quiet_timers() -> PbftConfig {
    // Generous timeouts keep liveness machinery out of ordering tests.
    PbftConfig {
        request_timeout: Duration::from_secs(30),
        new_view_timeout: Duration::from_secs(30),
        ..PbftConfig::default()
    }
}

/// A single request submitted through replica 0 executes exactly once on all
/// seven replicas, with the submitted payload.
#[traced_test]
#[test]
fn happy_path_seven_replicas() {
    let mut runner = SimulationRunner::new(sim(7), quiet_timers(), 42);
    runner.start();

    let payload = b"deploy the thing".to_vec();
    runner.submit(0, payload.clone());
    runner.run_for(Duration::from_secs(1));

    for id in 0..7 {
        assert_eq!(runner.executions(id), 1, "replica {id} executions");
        assert_eq!(
            runner.engine(id).last_execution(),
            Some(payload.as_slice()),
            "replica {id} payload"
        );
        assert_eq!(runner.replica(id).view(), 0);
    }
}

/// The protocol still orders with a single replica (f = 0).
#[test]
fn single_replica_group() {
    let mut runner = SimulationRunner::new(sim(1), quiet_timers(), 3);
    runner.start();
    let payload = b"solo".to_vec();
    runner.submit(0, payload.clone());
    runner.run_for(Duration::from_secs(1));

    assert_eq!(runner.executions(0), 1);
    assert_eq!(runner.engine(0).last_execution(), Some(payload.as_slice()));
}

/// If the primary's pre-prepare reaches only replicas 1 and 2, replica 3
/// collects prepares and commits but cannot execute: it never learned the
/// proposal.
#[traced_test]
#[test]
fn lost_pre_prepare_leaves_one_replica_behind() {
    let mut runner = SimulationRunner::new(sim(4), quiet_timers(), 42);
    runner.start();
    runner.set_filter(Box::new(|src, dst, message| {
        !(src == 0 && dst == 3 && matches!(message, ProtocolMessage::PrePrepare(_)))
    }));

    runner.submit(0, b"partial".to_vec());
    runner.run_for(Duration::from_secs(1));

    for id in 0..3 {
        assert_eq!(runner.executions(id), 1, "replica {id} should execute");
    }
    assert_eq!(runner.executions(3), 0, "replica 3 lacked the pre-prepare");
}

/// Checkpoint and garbage collection: after two requests with K = 2 every
/// replica holds exactly one stable checkpoint at sequence 2 and the low
/// watermark has moved there.
#[traced_test]
#[test]
fn checkpoint_garbage_collection() {
    let mut config = quiet_timers();
    config.k = 2;
    config.log_multiplier = 2;
    let mut runner = SimulationRunner::new(sim(4), config, 42);
    runner.start();

    runner.submit(0, b"one".to_vec());
    runner.run_for(Duration::from_millis(400));
    runner.submit(0, b"two".to_vec());
    runner.run_for(Duration::from_millis(400));

    for id in 0..4 {
        let state = runner.replica(id);
        let checkpoints = state.own_checkpoints();
        assert_eq!(checkpoints.len(), 1, "replica {id} checkpoint count");
        assert!(checkpoints.contains_key(&2), "replica {id} checkpoint at 2");
        assert_eq!(state.low_watermark(), 2, "replica {id} low watermark");
        assert_eq!(
            runner.store(id).read_state_set("chkpt.").len(),
            1,
            "replica {id} persisted checkpoints"
        );
        assert_eq!(runner.executions(id), 2);
    }

    // All replicas agree on the application state.
    let reference = runner.engine(0).state_id();
    for id in 1..4 {
        assert_eq!(runner.engine(id).state_id(), reference);
    }
}

/// Slow execution fills the pre-prepare window: the primary assigns at most
/// L/2 sequence numbers past the last checkpoint and buffers the rest until
/// execution catches up and the watermarks move.
#[traced_test]
#[test]
fn throttled_requests_complete_after_watermarks_move() {
    let mut config = quiet_timers();
    config.k = 2;
    config.log_multiplier = 2;
    let mut runner = SimulationRunner::new(sim(4), config, 7);
    runner.start();

    // Reach the first stable checkpoint at 2.
    for payload in [b"r1".to_vec(), b"r2".to_vec()] {
        runner.submit(0, payload);
        runner.run_for(Duration::from_millis(400));
    }
    assert_eq!(runner.replica(0).low_watermark(), 2);

    // Stall execution everywhere, then pour in five more requests.
    runner.block_execution_all();
    for payload in [b"r3", b"r4", b"r5", b"r6", b"r7"] {
        runner.submit(0, payload.to_vec());
        runner.run_for(Duration::from_millis(300));
    }

    // Only L/2 = 2 sequence numbers were assigned beyond the checkpoint.
    assert_eq!(runner.replica(0).seq_no(), 4, "send window must cap at L/2");
    for id in 0..4 {
        assert_eq!(runner.executions(id), 2, "replica {id} still stalled");
    }

    // Execution resumes: watermarks advance and the buffered requests drain.
    runner.release_execution_all();
    runner.run_for(Duration::from_secs(2));
    for id in 0..4 {
        assert_eq!(runner.executions(id), 7, "replica {id} final executions");
        assert_eq!(runner.replica(id).last_exec(), 7);
    }
}

/// A replica cut out of agreement for more than a full log window resets to
/// the network's checkpoint and resumes via state transfer.
#[traced_test]
#[test]
fn fall_behind_triggers_state_transfer() {
    let mut config = quiet_timers();
    config.k = 2;
    config.log_multiplier = 2; // L = 4, window exhausted at L + K = 6
    let mut runner = SimulationRunner::new(sim(4), config, 42);
    runner.start();

    // Replica 3 misses the agreement for sequence 1 and can therefore never
    // execute anything: the gap pins it at zero executions.
    runner.set_filter(Box::new(|_, dst, message| {
        let about_seq_one = match message {
            ProtocolMessage::PrePrepare(pp) => pp.seq_no == 1,
            ProtocolMessage::Prepare(p) => p.seq_no == 1,
            ProtocolMessage::Commit(c) => c.seq_no == 1,
            _ => false,
        };
        !(dst == 3 && about_seq_one)
    }));

    for i in 1..=6u64 {
        runner.submit(0, format!("req-{i}").into_bytes());
        runner.run_for(Duration::from_millis(400));
    }

    let behind = runner.replica(3);
    assert!(behind.skip_in_progress(), "replica 3 must notice it fell behind");
    assert_eq!(behind.low_watermark(), 6, "low watermark jumps to L + K");
    assert_eq!(behind.own_checkpoints().len(), 0);
    assert_eq!(runner.executions(3), 0);

    // Two more checkpoints certify a transfer target inside the new window.
    for i in 7..=8u64 {
        runner.submit(0, format!("req-{i}").into_bytes());
        runner.run_for(Duration::from_millis(400));
    }
    assert!(runner.engine(3).skip_occurred(), "state transfer must run");
    assert!(runner.executions(3) >= 8);
    assert!(!runner.replica(3).skip_in_progress());
    assert_eq!(runner.replica(3).low_watermark(), 8);

    // Back to normal participation.
    runner.submit(0, b"req-9".to_vec());
    runner.run_for(Duration::from_millis(400));
    assert_eq!(runner.executions(3), 9);
    assert_eq!(runner.engine(3).state_id(), runner.engine(0).state_id());
}

/// Null requests keep sequence numbers moving under idle load without
/// reaching the execution engine.
#[traced_test]
#[test]
fn null_requests_fill_idle_time() {
    let mut config = quiet_timers();
    config.null_request_timeout = Duration::from_millis(200);
    config.request_timeout = Duration::from_millis(500);
    let mut runner = SimulationRunner::new(sim(4), config, 42);
    runner.start();

    runner.submit(0, b"only one".to_vec());
    runner.run_for(Duration::from_secs(2));

    for id in 0..4 {
        let state = runner.replica(id);
        assert_eq!(runner.executions(id), 1, "replica {id} real executions");
        assert!(state.last_exec() > 1, "replica {id} saw no null requests");
        assert_eq!(state.view(), 0, "replica {id} should not change view");
    }
}
