//! Execute coordinator
//!
//! Settles a plan as one atomic multi-party transaction. The round moves
//! through these phases, each driven only by messages:
//!
//! ```text
//! Locating ──▶ Gathering (lap 1, optional lap 2) ──▶ Building (source)
//!          ──▶ Signing ──▶ Finalizing ──▶ Done
//! ```
//!
//! 1. **Locate**: a [`NettingData`] walk from the planner node, depth-first
//!    over counterparties, until it reaches a node holding a settle-set
//!    obligation. That node becomes the gather source and mints a fresh ring
//!    key.
//! 2. **Gather**: a [`RingToken`] collects every participant's obligations,
//!    payment certificates (payees) and cash spends (payers). It returns to
//!    the source once every participant has joined.
//! 3. **Build** at the source, then **Sign** once round the recorded route.
//! 4. **Finalize**: submit to the ordering service; on commit the
//!    transaction circulates once more so every participant marks its
//!    obligations settled.
//!
//! The outcome is reported to the planner node as an [`ExecutionReport`].
//!
//! # Critical Invariants
//!
//! 1. **Self-recognition**: a token is back at its source when its owner key
//!    is one of the source's ring keys; nothing else ends a lap
//! 2. **Atomicity**: ledger state changes only after the ordering service
//!    commits, and then for every participant
//! 3. **Local abort**: a rejection is handled at the source alone, which
//!    discards its ring key

mod commit;
mod gather;

use super::messages::{
    ExecutionOutcome, ExecutionReport, Message, NettingData, RingToken, ScanId, SettlementPlan,
};
use super::Step;
use crate::models::{EphemeralKey, ObligationId, PartyId, TransactionError};
use crate::services::{CollaboratorError, Collaborators};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors raised while executing a plan
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecuteError {
    #[error("Plan settles no obligation")]
    EmptyPlan,

    #[error("No session key for scan {scan_id}")]
    NoSessionKey { scan_id: String },

    #[error("No settle-set participant reachable")]
    NoParticipantReachable,

    #[error("{missing} participant(s) never joined the ring")]
    Unreachable { missing: usize },

    #[error("{payers} payer(s) could not fund their payments")]
    Unfunded { payers: usize },

    #[error("{missing} signature(s) missing")]
    MissingSignatures { missing: usize },

    #[error("Invalid signature from {signer}")]
    InvalidSignature { signer: String },

    #[error("Transaction does not match the settlement plan")]
    PlanMismatch,

    #[error("Obligation {id} could not be marked settled")]
    SettlementMismatch { id: String },

    #[error("Not a participant of this settlement")]
    NotParticipant,

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

/// Local events surfaced by the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteEvent {
    /// Outcome of an execution round this node asked for
    Finished { scan_id: ScanId, outcome: ExecutionOutcome },
}

/// Phase of a ring this node is source of
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingPhase {
    Gathering,
    Signing,
    Finalizing,
}

#[derive(Debug, Clone)]
struct SourceRing {
    plan: SettlementPlan,
    reply_to: PartyId,
    session_key: EphemeralKey,
    phase: RingPhase,
}

/// Per-node execution state machine
pub struct ExecuteCoordinator {
    party: PartyId,
    collaborators: Collaborators,

    /// Rings this node is source of, keyed by owner key
    rings: BTreeMap<EphemeralKey, SourceRing>,
}

impl ExecuteCoordinator {
    pub fn new(party: PartyId, collaborators: Collaborators) -> Self {
        Self {
            party,
            collaborators,
            rings: BTreeMap::new(),
        }
    }

    /// Phase of every ring this node is currently source of
    pub fn active_rings(&self) -> Vec<(ScanId, RingPhase)> {
        self.rings
            .values()
            .map(|ring| (ring.plan.scan_id.clone(), ring.phase))
            .collect()
    }

    /// Start executing `plan` with this node as planner
    #[instrument(skip_all, fields(party = %self.party, scan = %plan.scan_id))]
    pub fn execute(
        &mut self,
        plan: SettlementPlan,
        session: Option<&EphemeralKey>,
    ) -> Result<Step<ExecuteEvent>, ExecuteError> {
        if plan.settle.is_empty() {
            return Err(ExecuteError::EmptyPlan);
        }
        info!(
            obligations = plan.settle.len(),
            payments = plan.payments.len(),
            "executing plan"
        );
        let data = NettingData {
            plan,
            reply_to: self.party.clone(),
            path: Vec::new(),
            visited: BTreeSet::new(),
        };
        Ok(self.handle_netting_data(data, session))
    }

    /// Locate step
    #[instrument(skip_all, fields(party = %self.party, scan = %data.plan.scan_id))]
    pub fn handle_netting_data(
        &mut self,
        mut data: NettingData,
        session: Option<&EphemeralKey>,
    ) -> Step<ExecuteEvent> {
        let mut step = Step::new();
        let scan_id = data.plan.scan_id.clone();
        let reply_to = data.reply_to.clone();

        data.visited.insert(self.party.clone());
        if let Some(key) = session.filter(|key| data.plan.involves(key)) {
            if let Err(e) = self.become_source(data.plan, data.reply_to, key.clone(), &mut step) {
                self.fail(&mut step, scan_id, &reply_to, e);
            }
            return step;
        }

        let candidates = match self.counterparties(&data.plan.settle_ids()) {
            Ok(candidates) => candidates,
            Err(e) => {
                self.fail(&mut step, scan_id, &reply_to, e);
                return step;
            }
        };
        if let Some(next) = candidates.into_iter().find(|p| !data.visited.contains(p)) {
            debug!(next = %next, "locate forward");
            data.path.push(self.party.clone());
            step.send(&self.party, &next, Message::NettingData(data));
        } else if let Some(back) = data.path.pop() {
            debug!(back = %back, "locate backtrack");
            step.send(&self.party, &back, Message::NettingData(data));
        } else {
            self.fail(&mut step, scan_id, &reply_to, ExecuteError::NoParticipantReachable);
        }
        step
    }

    /// Report delivered to the planner node
    pub fn handle_report(&mut self, report: ExecutionReport) -> Step<ExecuteEvent> {
        let mut step = Step::new();
        step.emit(ExecuteEvent::Finished {
            scan_id: report.scan_id,
            outcome: report.outcome,
        });
        step
    }

    /// Counterparties of own open obligations, settle-set links first
    fn counterparties(&self, settle_ids: &BTreeSet<ObligationId>) -> Result<Vec<PartyId>, ExecuteError> {
        let mut links: BTreeMap<PartyId, bool> = BTreeMap::new();
        for ob in self.collaborators.obligations.obligations_of(&self.party)? {
            if let Some(counterparty) = ob.counterparty(&self.party) {
                *links.entry(counterparty.clone()).or_insert(false) |= settle_ids.contains(ob.id());
            }
        }
        let mut ordered: Vec<(bool, PartyId)> = links.into_iter().map(|(p, settle)| (!settle, p)).collect();
        ordered.sort();
        Ok(ordered.into_iter().map(|(_, p)| p).collect())
    }

    /// Deliver an outcome to the planner node
    fn report(&self, step: &mut Step<ExecuteEvent>, scan_id: ScanId, reply_to: &PartyId, outcome: ExecutionOutcome) {
        if reply_to == &self.party {
            step.emit(ExecuteEvent::Finished { scan_id, outcome });
        } else {
            step.send(
                &self.party,
                reply_to,
                Message::ExecutionReport(ExecutionReport { scan_id, outcome }),
            );
        }
    }

    fn fail(&self, step: &mut Step<ExecuteEvent>, scan_id: ScanId, reply_to: &PartyId, error: ExecuteError) {
        warn!(error = %error, "execution failed");
        self.report(
            step,
            scan_id,
            reply_to,
            ExecutionOutcome::Failed {
                reason: error.to_string(),
            },
        );
    }

    /// Ring this node is source of, if the token belongs to one
    fn ring_for<T>(&self, token: &RingToken<T>) -> Option<&SourceRing> {
        self.rings.get(&token.owner_key)
    }
}
