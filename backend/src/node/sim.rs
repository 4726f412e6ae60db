//! Deterministic synchronous network
//!
//! Delivers envelopes one at a time from a single FIFO queue, so every link
//! is FIFO and a run is reproducible given the same clock. Each delivery is
//! logged, which lets tests count exactly how many hops a protocol phase
//! took.

use super::{LsmNode, LsmStage, NodeEvent};
use crate::error::LsmError;
use crate::models::PartyId;
use crate::protocol::{Envelope, ScanId, SettlementPlan, Step};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, warn};

/// Upper bound on deliveries in one [`SimNetwork::run`]
const MAX_DELIVERIES: usize = 100_000;

/// One delivered (or dropped) envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub from: PartyId,
    pub to: PartyId,
    pub kind: &'static str,
    pub dropped: bool,
}

#[derive(Default)]
pub struct SimNetwork {
    nodes: BTreeMap<PartyId, LsmNode>,
    queue: VecDeque<Envelope>,
    offline: BTreeSet<PartyId>,
    log: Vec<Delivery>,
    events: Vec<(PartyId, NodeEvent)>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: LsmNode) {
        self.nodes.insert(node.party().clone(), node);
    }

    pub fn node(&self, party: &PartyId) -> Option<&LsmNode> {
        self.nodes.get(party)
    }

    pub fn parties(&self) -> Vec<PartyId> {
        self.nodes.keys().cloned().collect()
    }

    /// Messages to an offline party are lost
    pub fn set_offline(&mut self, party: &PartyId, offline: bool) {
        if offline {
            self.offline.insert(party.clone());
        } else {
            self.offline.remove(party);
        }
    }

    fn node_or_err(&mut self, party: &PartyId) -> Result<&mut LsmNode, LsmError> {
        self.nodes
            .get_mut(party)
            .ok_or_else(|| LsmError::MalformedInput(format!("unknown party {party}")))
    }

    pub fn start_detect(&mut self, party: &PartyId) -> Result<(), LsmError> {
        let step = self.node_or_err(party)?.start_detect()?;
        self.absorb(party, step);
        Ok(())
    }

    pub fn execute(&mut self, party: &PartyId, plan: SettlementPlan) -> Result<(), LsmError> {
        let step = self.node_or_err(party)?.execute(plan)?;
        self.absorb(party, step);
        Ok(())
    }

    pub fn broadcast_deadlock(&mut self, party: &PartyId, scan_id: ScanId, reason: String) -> Result<(), LsmError> {
        let step = self.node_or_err(party)?.broadcast_deadlock(scan_id, reason)?;
        self.absorb(party, step);
        Ok(())
    }

    pub fn set_stage(&mut self, party: &PartyId, stage: LsmStage) -> Result<(), LsmError> {
        self.node_or_err(party)?.set_stage(stage);
        Ok(())
    }

    /// Queue an envelope as if a node had sent it
    pub fn inject(&mut self, envelope: Envelope) {
        self.queue.push_back(envelope);
    }

    /// Deliver the oldest queued envelope; `false` when the queue is empty
    pub fn deliver_one(&mut self) -> Result<bool, LsmError> {
        let Some(envelope) = self.queue.pop_front() else {
            return Ok(false);
        };
        let to = envelope.to.clone();
        let mut delivery = Delivery {
            from: envelope.from.clone(),
            to: to.clone(),
            kind: envelope.message.kind(),
            dropped: false,
        };

        let node = match self.nodes.get_mut(&to) {
            Some(node) if !self.offline.contains(&to) => node,
            _ => {
                debug!(to = %to, kind = delivery.kind, "dropping envelope");
                delivery.dropped = true;
                self.log.push(delivery);
                return Ok(true);
            }
        };
        self.log.push(delivery);
        let step = node.handle(envelope)?;
        self.absorb(&to, step);
        Ok(true)
    }

    /// Deliver until the network is quiet; returns the number of deliveries
    pub fn run(&mut self) -> Result<usize, LsmError> {
        let mut delivered = 0;
        while self.deliver_one()? {
            delivered += 1;
            if delivered >= MAX_DELIVERIES {
                warn!(pending = self.queue.len(), "delivery ceiling reached");
                break;
            }
        }
        Ok(delivered)
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn log(&self) -> &[Delivery] {
        &self.log
    }

    /// Delivered envelopes of one message kind
    pub fn count(&self, kind: &str) -> usize {
        self.log.iter().filter(|d| !d.dropped && d.kind == kind).count()
    }

    pub fn events(&self) -> &[(PartyId, NodeEvent)] {
        &self.events
    }

    pub fn take_events(&mut self) -> Vec<(PartyId, NodeEvent)> {
        std::mem::take(&mut self.events)
    }

    fn absorb(&mut self, party: &PartyId, step: Step<NodeEvent>) {
        self.queue.extend(step.outbound);
        self.events
            .extend(step.events.into_iter().map(|event| (party.clone(), event)));
    }
}
