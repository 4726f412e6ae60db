//! Per-node protocol state machines
//!
//! Both coordinators are sans-IO: a handler takes one inbound message and
//! returns a [`Step`] holding the envelopes to send and the local events to
//! surface. Nothing in this module touches a socket, a channel or a clock;
//! the node runtime (or the synchronous test network) moves envelopes
//! between parties.
//!
//! # Critical Invariants
//!
//! 1. **Message-driven**: state only changes inside a handler
//! 2. **Keyed runs**: detection state is keyed by scan id, execution state
//!    by the ring owner key; a message for any other run is stale and dropped
//! 3. **No global state**: every coordinator belongs to exactly one party

pub mod detect;
pub mod execute;
pub mod messages;

use crate::models::PartyId;

pub use detect::{DetectCoordinator, DetectError, DetectEvent, DetectOutcome, NeighbourStatus};
pub use execute::{ExecuteCoordinator, ExecuteError, ExecuteEvent, RingPhase};
pub use messages::{
    CodecError, CollectStatesRequest, DeadlockNotice, Envelope, ExecutionOutcome, ExecutionReport,
    FinalizedTransaction, Message, NettingData, RingToken, ScanAcknowledgement, ScanData, ScanId,
    ScanRequest, ScanResponse, SettlementPlan, SigningStructure,
};

/// Effects of handling one input
#[derive(Debug, Clone, PartialEq)]
pub struct Step<E> {
    pub outbound: Vec<Envelope>,
    pub events: Vec<E>,
}

impl<E> Default for Step<E> {
    fn default() -> Self {
        Self {
            outbound: Vec::new(),
            events: Vec::new(),
        }
    }
}

impl<E> Step<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&mut self, from: &PartyId, to: &PartyId, message: Message) {
        self.outbound.push(Envelope::new(from.clone(), to.clone(), message));
    }

    pub fn emit(&mut self, event: E) {
        self.events.push(event);
    }

    /// Convert events, keeping the outbound envelopes
    pub fn map_events<F, T>(self, f: F) -> Step<T>
    where
        F: FnMut(E) -> T,
    {
        Step {
            outbound: self.outbound,
            events: self.events.into_iter().map(f).collect(),
        }
    }

    pub fn merge(&mut self, other: Step<E>) {
        self.outbound.extend(other.outbound);
        self.events.extend(other.events);
    }

    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.events.is_empty()
    }
}
