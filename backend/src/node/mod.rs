//! Participant node
//!
//! [`LsmNode`] joins one party's detect and execute coordinators behind a
//! single sans-IO entry point, [`LsmNode::handle`], and keeps the party's run
//! status. Two drivers move its envelopes:
//!
//! - [`sim::SimNetwork`]: deterministic synchronous FIFO delivery for tests
//! - [`runtime::spawn`]: one tokio task per node over an
//!   [`transport::InMemoryNetwork`]
//!
//! # Critical Invariants
//!
//! 1. **One party per node**: a node only ever acts for its own party and
//!    reaches ledger state through its collaborators
//! 2. **Deadlock flood**: each deadlock notice is relayed at most once per
//!    node, to every counterparty except the sender
//! 3. **Fresh start**: taking part in a new detection round clears the
//!    deadlock flag
//! 4. **Participant stage**: a settle-set participant moves to `Executing`
//!    when a ring token reaches it and to `Complete` once finalization does

pub mod runtime;
pub mod sim;
pub mod status;
pub mod transport;

use crate::config::{LsmConfig, NodeConfig};
use crate::core::Clock;
use crate::error::LsmError;
use crate::models::{EphemeralKey, PartyId};
use crate::protocol::{
    DeadlockNotice, DetectCoordinator, DetectEvent, Envelope, ExecuteCoordinator, ExecuteEvent,
    Message, ScanId, SettlementPlan, Step,
};
use crate::services::Collaborators;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub use runtime::{spawn, NodeHandle};
pub use sim::{Delivery, SimNetwork};
pub use status::{LsmStage, LsmStatus};
pub use transport::{InMemoryNetwork, Transport, TransportError};

/// Deadlock notices remembered for flood deduplication
const DEADLOCK_HISTORY: usize = 32;

/// Local event from either coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Detect(DetectEvent),
    Execute(ExecuteEvent),
}

/// One participant of the mechanism
pub struct LsmNode {
    party: PartyId,
    detect: DetectCoordinator,
    execute: ExecuteCoordinator,
    collaborators: Collaborators,
    clock: Arc<dyn Clock>,
    status: LsmStatus,

    /// Scan that put this node in deadlock
    deadlock_scan: Option<ScanId>,
    seen_deadlocks: VecDeque<ScanId>,
}

impl LsmNode {
    pub fn new(node: NodeConfig, config: &LsmConfig, collaborators: Collaborators, clock: Arc<dyn Clock>) -> Self {
        let party = node.party.clone();
        let detect = DetectCoordinator::new(node, config, &collaborators);
        let execute = ExecuteCoordinator::new(party.clone(), collaborators.clone());
        let status = LsmStatus {
            last_updated: clock.now_millis(),
            ..LsmStatus::default()
        };
        Self {
            party,
            detect,
            execute,
            collaborators,
            clock,
            status,
            deadlock_scan: None,
            seen_deadlocks: VecDeque::new(),
        }
    }

    pub fn party(&self) -> &PartyId {
        &self.party
    }

    pub fn status(&self) -> &LsmStatus {
        &self.status
    }

    pub fn detect(&self) -> &DetectCoordinator {
        &self.detect
    }

    pub fn execute_coordinator(&self) -> &ExecuteCoordinator {
        &self.execute
    }

    pub fn set_stage(&mut self, stage: LsmStage) {
        if self.status.stage != stage {
            info!(party = %self.party, from = %self.status.stage, to = %stage, "stage transition");
        }
        self.status.enter(stage, self.clock.now_millis());
    }

    /// Start a detection round with this node as source
    pub fn start_detect(&mut self) -> Result<Step<NodeEvent>, LsmError> {
        self.clear_deadlock();
        let step = self.detect.start(self.clock.now_millis())?;
        Ok(step.map_events(NodeEvent::Detect))
    }

    /// Execute a plan computed on this node
    pub fn execute(&mut self, plan: SettlementPlan) -> Result<Step<NodeEvent>, LsmError> {
        let session = self.detect.session_key(&plan.scan_id);
        let step = self.execute.execute(plan, session)?;
        Ok(step.map_events(NodeEvent::Execute))
    }

    /// Enter deadlock and flood a notice to every counterparty
    pub fn broadcast_deadlock(&mut self, scan_id: ScanId, reason: String) -> Result<Step<NodeEvent>, LsmError> {
        let notice = DeadlockNotice {
            scan_id,
            reason,
            since: self.clock.now_millis(),
        };
        warn!(party = %self.party, scan = %notice.scan_id, reason = %notice.reason, "deadlock");
        self.relay_deadlock(notice, None)
    }

    /// Handle one inbound envelope
    #[instrument(skip_all, fields(party = %self.party, from = %envelope.from, kind = envelope.message.kind()))]
    pub fn handle(&mut self, envelope: Envelope) -> Result<Step<NodeEvent>, LsmError> {
        if envelope.to != self.party {
            debug!(to = %envelope.to, "discarding misaddressed envelope");
            return Ok(Step::new());
        }
        let from = envelope.from;

        let step = match envelope.message {
            Message::ScanRequest(request) => {
                if self.deadlock_scan.as_ref().is_some_and(|id| id != &request.id) {
                    self.clear_deadlock();
                }
                self.detect.handle_request(&from, request)?.map_events(NodeEvent::Detect)
            }
            Message::ScanAcknowledgement(ack) => self.detect.handle_ack(&from, ack).map_events(NodeEvent::Detect),
            Message::ScanResponse(response) => self.detect.handle_response(&from, response).map_events(NodeEvent::Detect),
            Message::NettingData(data) => {
                let session = self.detect.session_key(&data.plan.scan_id);
                self.execute.handle_netting_data(data, session).map_events(NodeEvent::Execute)
            }
            Message::CollectStates(token) => {
                let session = self.detect.session_key(&token.payload.plan.scan_id).cloned();
                self.follow_ring(&token.payload.plan, session.as_ref(), LsmStage::Executing);
                self.execute.handle_collect(token, session.as_ref()).map_events(NodeEvent::Execute)
            }
            Message::Signing(token) => {
                let session = self.detect.session_key(&token.payload.plan.scan_id).cloned();
                self.follow_ring(&token.payload.plan, session.as_ref(), LsmStage::Executing);
                self.execute.handle_signing(token, session.as_ref()).map_events(NodeEvent::Execute)
            }
            Message::Finalized(token) => {
                // Finalized tokens only circulate after the ordering service commits
                let session = self.detect.session_key(&token.payload.plan.scan_id).cloned();
                self.follow_ring(&token.payload.plan, session.as_ref(), LsmStage::Complete);
                self.execute.handle_finalized(token, session.as_ref()).map_events(NodeEvent::Execute)
            }
            Message::ExecutionReport(report) => self.execute.handle_report(report).map_events(NodeEvent::Execute),
            Message::DeadlockNotice(notice) => self.relay_deadlock(notice, Some(&from))?,
        };
        Ok(step)
    }

    /// Participants other than the run's source learn their stage from the
    /// ring tokens passing through
    fn follow_ring(&mut self, plan: &SettlementPlan, session: Option<&EphemeralKey>, stage: LsmStage) {
        if session.is_some_and(|key| plan.involves(key)) && self.status.stage != stage {
            self.set_stage(stage);
        }
    }

    fn relay_deadlock(&mut self, notice: DeadlockNotice, from: Option<&PartyId>) -> Result<Step<NodeEvent>, LsmError> {
        let mut step = Step::new();
        if self.seen_deadlocks.contains(&notice.scan_id) {
            debug!(scan = %notice.scan_id, "deadlock notice already relayed");
            return Ok(step);
        }
        self.seen_deadlocks.push_back(notice.scan_id.clone());
        while self.seen_deadlocks.len() > DEADLOCK_HISTORY {
            self.seen_deadlocks.pop_front();
        }

        self.status.mark_deadlock(notice.since);
        self.deadlock_scan = Some(notice.scan_id.clone());

        let counterparties: BTreeSet<PartyId> = self
            .collaborators
            .obligations
            .obligations_of(&self.party)?
            .iter()
            .filter_map(|ob| ob.counterparty(&self.party).cloned())
            .collect();
        for counterparty in counterparties.iter().filter(|p| Some(*p) != from) {
            step.send(&self.party, counterparty, Message::DeadlockNotice(notice.clone()));
        }
        Ok(step)
    }

    fn clear_deadlock(&mut self) {
        if self.status.in_deadlock {
            debug!(party = %self.party, "leaving deadlock");
        }
        self.status.clear_deadlock();
        self.deadlock_scan = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ManualClock;
    use crate::models::Obligation;
    use crate::protocol::ScanAcknowledgement;
    use crate::services::{InMemoryLedger, InMemoryOrderingService};

    fn node(ledger: &InMemoryLedger, party: &str, clock: &ManualClock) -> LsmNode {
        let config = LsmConfig {
            currency: "USD".into(),
            ..LsmConfig::default()
        };
        let collaborators = Collaborators::in_memory(ledger.clone(), InMemoryOrderingService::new());
        LsmNode::new(NodeConfig::new(party.into()), &config, collaborators, Arc::new(clock.clone()))
    }

    fn ledger() -> InMemoryLedger {
        let ledger = InMemoryLedger::new();
        for (lender, borrower) in [("B", "A"), ("C", "A")] {
            ledger.issue_obligation(Obligation::new(lender.into(), borrower.into(), 10, "USD".into(), 0).unwrap());
        }
        ledger
    }

    #[test]
    fn test_deadlock_notice_is_relayed_once() {
        let clock = ManualClock::new(100);
        let mut a = node(&ledger(), "A", &clock);
        let notice = DeadlockNotice {
            scan_id: ScanId::compute(1, &"B".into()),
            reason: "no cycle".to_string(),
            since: 50,
        };

        let first = a
            .handle(Envelope::new("B".into(), "A".into(), Message::DeadlockNotice(notice.clone())))
            .unwrap();
        let targets: Vec<&str> = first.outbound.iter().map(|e| e.to.as_str()).collect();
        assert_eq!(targets, vec!["C"]);
        assert!(a.status().in_deadlock);
        assert_eq!(a.status().deadlock_since, Some(50));

        let again = a
            .handle(Envelope::new("C".into(), "A".into(), Message::DeadlockNotice(notice)))
            .unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_new_detection_clears_deadlock() {
        let clock = ManualClock::new(100);
        let mut a = node(&ledger(), "A", &clock);
        a.broadcast_deadlock(ScanId::compute(1, &"A".into()), "no cycle".to_string())
            .unwrap();
        assert!(a.status().in_deadlock);

        clock.advance(10);
        a.start_detect().unwrap();
        assert!(!a.status().in_deadlock);
        assert_eq!(a.status().deadlock_since, None);
    }

    #[test]
    fn test_misaddressed_envelope_is_ignored() {
        let clock = ManualClock::new(0);
        let mut a = node(&ledger(), "A", &clock);
        let envelope = Envelope::new(
            "B".into(),
            "C".into(),
            Message::ScanAcknowledgement(ScanAcknowledgement {
                id: ScanId::compute(0, &"B".into()),
            }),
        );
        assert!(a.handle(envelope).unwrap().is_empty());
    }

    #[test]
    fn test_stage_changes_are_timestamped() {
        let clock = ManualClock::new(5);
        let mut a = node(&ledger(), "A", &clock);
        clock.set(42);
        a.set_stage(LsmStage::Planning);
        assert_eq!(a.status().stage, LsmStage::Planning);
        assert_eq!(a.status().last_updated, 42);
    }
}
