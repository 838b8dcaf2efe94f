//! Core event/action model for the lockstep replication protocol.
//!
//! This crate provides the foundational pieces of the replica architecture:
//!
//! - [`Event`]: all possible inputs to the state machine
//! - [`Action`]: all possible outputs from the state machine
//! - [`EventPriority`]: ordering priority for events at the same timestamp
//! - [`StateMachine`]: the trait the protocol core implements
//! - [`StateStore`]: the durable key/value store runners expose
//!
//! # Architecture
//!
//! The core is built on a simple event-driven model:
//!
//! ```text
//! Events → StateMachine::handle() → Actions
//! ```
//!
//! All state transitions happen on one thread; there is no internal locking.
//! Broadcasts, persistence and execution are actions whose results come back
//! as events, never as synchronous callbacks.

mod action;
mod event;
mod traits;

pub use action::Action;
pub use event::{Event, EventPriority};
pub use traits::{MemoryStore, StateMachine, StateStore, StoreError};

/// Identifies the protocol timers a replica maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Pending-request timer; expiry triggers a view change.
    Request,
    /// View-change escalation timer, armed once a view-change quorum forms.
    NewView,
    /// Primary-side null-request send interval / backup-side watchdog.
    NullRequest,
    /// Rebroadcast interval for our own view-change message.
    ViewChangeResend,
}

impl TimerId {
    /// The event this timer produces when it fires.
    pub fn to_event(self) -> Event {
        match self {
            TimerId::Request => Event::RequestTimeout,
            TimerId::NewView => Event::NewViewTimeout,
            TimerId::NullRequest => Event::NullRequestTimeout,
            TimerId::ViewChangeResend => Event::ViewChangeResendTimeout,
        }
    }
}
