//! Production runtime for lockstep replicas.
//!
//! Wires the protocol core to the outside world:
//!
//! - [`ReplicaRunner`]: tokio event loop with a bounded inbound queue and a
//!   dedicated timer channel
//! - [`TimerManager`]: cancellable tokio timers behind
//!   [`Action::SetTimer`](lockstep_core::Action)
//! - [`codec`]: length-prefixed SBOR wire frames
//! - [`RocksDbStore`]: durable [`StateStore`](lockstep_core::StateStore) for
//!   crash recovery
//!
//! Transport and execution stay external: implement [`Transport`] and
//! [`ExecutionEngine`] and feed completions back through the
//! [`ReplicaHandle`].

pub mod codec;
mod runner;
mod storage;
mod timers;

pub use runner::{
    ExecutionEngine, ReplicaHandle, ReplicaRunner, RunnerError, ShutdownHandle, Transport,
};
pub use storage::{RocksDbStore, StorageError};
pub use timers::TimerManager;
