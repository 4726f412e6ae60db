//! Signing and finalization laps

use super::{ExecuteCoordinator, ExecuteError, ExecuteEvent, RingPhase};
use crate::models::{EphemeralKey, OrderingResult, PartyId, SignedTransaction};
use crate::protocol::messages::{
    route_successor, ExecutionOutcome, FinalizedTransaction, Message, RingToken, ScanId,
    SettlementPlan, SigningStructure,
};
use crate::protocol::Step;
use std::collections::BTreeSet;
use tracing::{debug, info, instrument, warn};

impl ExecuteCoordinator {
    /// Send a freshly built transaction round the route for signatures
    pub(super) fn start_signing_lap(
        &self,
        token: RingToken<SigningStructure>,
        step: &mut Step<ExecuteEvent>,
    ) -> Result<(), ExecuteError> {
        let next = route_successor(&token.payload.route, &self.party)
            .cloned()
            .ok_or(ExecuteError::NotParticipant)?;
        self.pass_signing(token, &next, step);
        Ok(())
    }

    #[instrument(skip_all, fields(party = %self.party, ring = %token.owner_key))]
    pub fn handle_signing(
        &mut self,
        token: RingToken<SigningStructure>,
        session: Option<&EphemeralKey>,
    ) -> Step<ExecuteEvent> {
        let mut step = Step::new();
        let owner = token.owner_key.clone();
        let scan_id = token.payload.plan.scan_id.clone();
        let reply_to = token.payload.reply_to.clone();

        let result = if self.ring_for(&token).is_some() {
            self.submit(token, &mut step)
        } else {
            self.sign(token, session, &mut step)
        };
        if let Err(e) = result {
            self.abort(&mut step, &owner, scan_id, &reply_to, e);
        }
        step
    }

    #[instrument(skip_all, fields(party = %self.party, ring = %token.owner_key))]
    pub fn handle_finalized(
        &mut self,
        token: RingToken<FinalizedTransaction>,
        session: Option<&EphemeralKey>,
    ) -> Step<ExecuteEvent> {
        let mut step = Step::new();
        let owner = token.owner_key.clone();
        let scan_id = token.payload.plan.scan_id.clone();
        let reply_to = token.payload.reply_to.clone();

        let result = if self.ring_for(&token).is_some() {
            self.complete(token, &mut step);
            Ok(())
        } else {
            self.finalize(token, session, &mut step)
        };
        if let Err(e) = result {
            self.abort(&mut step, &owner, scan_id, &reply_to, e);
        }
        step
    }

    /// Participant check, then countersign
    fn sign(
        &self,
        mut token: RingToken<SigningStructure>,
        session: Option<&EphemeralKey>,
        step: &mut Step<ExecuteEvent>,
    ) -> Result<(), ExecuteError> {
        let key = session
            .filter(|key| token.payload.plan.involves(key))
            .cloned()
            .ok_or(ExecuteError::NotParticipant)?;
        self.verify_signatures(&token.payload.tx)?;

        let tx = &token.payload.tx.tx;
        let inputs: BTreeSet<_> = tx.obligation_inputs.iter().cloned().collect();
        if inputs != token.payload.plan.settle_ids() || !tx.command.signers.contains(&key) {
            return Err(ExecuteError::PlanMismatch);
        }

        if !token.payload.tx.is_signed_by(&key) {
            let signature = self.collaborators.signer.sign(&key, tx.id.as_str());
            token.payload.tx.signatures.push(signature);
            debug!(signed = token.payload.tx.signatures.len(), "countersigned");
        }

        let next = route_successor(&token.payload.route, &self.party)
            .cloned()
            .ok_or(ExecuteError::NotParticipant)?;
        self.pass_signing(token, &next, step);
        Ok(())
    }

    /// Signing lap is back: hand the transaction to the ordering service
    fn submit(
        &mut self,
        token: RingToken<SigningStructure>,
        step: &mut Step<ExecuteEvent>,
    ) -> Result<(), ExecuteError> {
        let owner = token.owner_key.clone();
        let session_key = match self.rings.get(&owner) {
            Some(ring) if ring.phase == RingPhase::Signing => ring.session_key.clone(),
            _ => {
                debug!("discarding signing token for a ring not signing");
                return Ok(());
            }
        };

        let signing = token.payload;
        let missing = signing.tx.missing_signers();
        if !missing.is_empty() {
            return Err(ExecuteError::MissingSignatures {
                missing: missing.len(),
            });
        }
        self.verify_signatures(&signing.tx)?;

        match self.collaborators.ordering.submit_transaction(&signing.tx)? {
            OrderingResult::Committed => {
                info!(tx_id = %signing.tx.tx.id, "transaction committed");
                if let Some(ring) = self.rings.get_mut(&owner) {
                    ring.phase = RingPhase::Finalizing;
                }
                self.apply_finalized(&signing.plan, &signing.tx, &session_key)?;

                let finalized = RingToken::new(
                    owner,
                    FinalizedTransaction {
                        plan: signing.plan,
                        reply_to: signing.reply_to,
                        route: signing.route,
                        tx: signing.tx,
                    },
                );
                match route_successor(&finalized.payload.route, &self.party).cloned() {
                    Some(next) if next != self.party => self.pass_finalized(finalized, &next, step),
                    _ => self.complete(finalized, step),
                }
            }
            OrderingResult::Rejected { reason } => {
                warn!(tx_id = %signing.tx.tx.id, reason = %reason, "transaction rejected");
                self.rings.remove(&owner);
                self.report(
                    step,
                    signing.plan.scan_id,
                    &signing.reply_to,
                    ExecutionOutcome::Rejected { reason },
                );
            }
        }
        Ok(())
    }

    /// Record the committed transaction locally and pass it on
    fn finalize(
        &self,
        token: RingToken<FinalizedTransaction>,
        session: Option<&EphemeralKey>,
        step: &mut Step<ExecuteEvent>,
    ) -> Result<(), ExecuteError> {
        let key = session
            .filter(|key| token.payload.plan.involves(key))
            .cloned()
            .ok_or(ExecuteError::NotParticipant)?;
        let missing = token.payload.tx.missing_signers();
        if !missing.is_empty() {
            return Err(ExecuteError::MissingSignatures {
                missing: missing.len(),
            });
        }
        self.verify_signatures(&token.payload.tx)?;
        self.apply_finalized(&token.payload.plan, &token.payload.tx, &key)?;

        let next = route_successor(&token.payload.route, &self.party)
            .cloned()
            .ok_or(ExecuteError::NotParticipant)?;
        self.pass_finalized(token, &next, step);
        Ok(())
    }

    /// Finalization lap is back: the round is over
    fn complete(&mut self, token: RingToken<FinalizedTransaction>, step: &mut Step<ExecuteEvent>) {
        let ring = match self.rings.get(&token.owner_key) {
            Some(ring) if ring.phase == RingPhase::Finalizing => ring,
            _ => {
                debug!("discarding finalized token for a ring not finalizing");
                return;
            }
        };
        let payments = ring.plan.payments.clone();
        self.rings.remove(&token.owner_key);

        let finalized = token.payload;
        info!(
            tx_id = %finalized.tx.tx.id,
            settled = finalized.tx.tx.obligation_inputs.len(),
            "settlement finalized"
        );
        self.report(
            step,
            finalized.plan.scan_id,
            &finalized.reply_to,
            ExecutionOutcome::Completed {
                tx_id: finalized.tx.tx.id.clone(),
                settled: finalized.tx.tx.obligation_inputs,
                payments,
            },
        );
    }

    /// Mark own settle-set obligations settled and record the transaction
    fn apply_finalized(
        &self,
        plan: &SettlementPlan,
        tx: &SignedTransaction,
        key: &EphemeralKey,
    ) -> Result<(), ExecuteError> {
        for id in plan.obligations_of(key) {
            if !self.collaborators.obligations.mark_settled(&self.party, &id)? {
                return Err(ExecuteError::SettlementMismatch { id: id.to_string() });
            }
        }
        self.collaborators.cash.record_transaction(&self.party, tx)?;
        Ok(())
    }

    fn verify_signatures(&self, tx: &SignedTransaction) -> Result<(), ExecuteError> {
        let tx_id = tx.tx.id.as_str();
        match tx.signatures.iter().find(|s| !self.collaborators.signer.verify(tx_id, s)) {
            Some(bad) => Err(ExecuteError::InvalidSignature {
                signer: bad.signer.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Drop the ring (if this node is its source) and report the failure
    pub(super) fn abort(
        &mut self,
        step: &mut Step<ExecuteEvent>,
        owner: &EphemeralKey,
        scan_id: ScanId,
        reply_to: &PartyId,
        error: ExecuteError,
    ) {
        self.rings.remove(owner);
        self.fail(step, scan_id, reply_to, error);
    }

    fn pass_signing(&self, mut token: RingToken<SigningStructure>, to: &PartyId, step: &mut Step<ExecuteEvent>) {
        token.hops += 1;
        step.send(&self.party, to, Message::Signing(token));
    }

    fn pass_finalized(
        &self,
        mut token: RingToken<FinalizedTransaction>,
        to: &PartyId,
        step: &mut Step<ExecuteEvent>,
    ) {
        token.hops += 1;
        step.send(&self.party, to, Message::Finalized(token));
    }
}
