//! Gather laps and transaction assembly
//!
//! Lap 1 is a depth-first traversal: each holder forwards to an unvisited
//! counterparty and backtracks along the trail when none is left. Payees
//! still owed a certificate are visited first, then settle-set links, then
//! everyone else, so certificates usually exist before their payers join.
//! Backtrack hops are transit only, though a payer the token passes again
//! funds itself then. The token heads home as soon as every participant has
//! joined.
//!
//! Lap 2 is a fallback for a payer still unfunded when lap 1 ends; it
//! follows the recorded route and claims nothing.

use super::{ExecuteCoordinator, ExecuteError, ExecuteEvent, RingPhase, SourceRing};
use crate::models::{
    CashSpend, EphemeralKey, NettingObligation, ObligationId, PartyId, SettlementTransaction, SignedTransaction,
};
use crate::protocol::messages::{
    route_successor, CollectStatesRequest, Message, RingToken, SettlementPlan, SigningStructure,
};
use crate::protocol::Step;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, instrument};

enum GatherHop {
    Forward(PartyId),
    Backtrack(PartyId),

    /// Everyone joined, or nowhere left to go
    Home,
}

impl ExecuteCoordinator {
    /// Mint a ring key and start lap 1 from this node
    pub(super) fn become_source(
        &mut self,
        plan: SettlementPlan,
        reply_to: PartyId,
        session_key: EphemeralKey,
        step: &mut Step<ExecuteEvent>,
    ) -> Result<(), ExecuteError> {
        let owner_key = EphemeralKey::generate();
        info!(ring = %owner_key, "becoming gather source");

        let mut token = RingToken::new(
            owner_key.clone(),
            CollectStatesRequest::new(plan.clone(), reply_to.clone()),
        );
        token.payload.visited.insert(self.party.clone());
        self.join(&mut token.payload, &session_key)?;

        self.rings.insert(
            owner_key,
            SourceRing {
                plan,
                reply_to,
                session_key,
                phase: RingPhase::Gathering,
            },
        );
        self.collect_at_source(token, step)
    }

    #[instrument(skip_all, fields(party = %self.party, ring = %token.owner_key, lap = token.payload.lap))]
    pub fn handle_collect(
        &mut self,
        token: RingToken<CollectStatesRequest>,
        session: Option<&EphemeralKey>,
    ) -> Step<ExecuteEvent> {
        let mut step = Step::new();
        let owner = token.owner_key.clone();
        let scan_id = token.payload.plan.scan_id.clone();
        let reply_to = token.payload.reply_to.clone();

        let result = if self.ring_for(&token).is_some() {
            self.collect_at_source(token, &mut step)
        } else {
            self.collect(token, session, &mut step)
        };
        if let Err(e) = result {
            self.abort(&mut step, &owner, scan_id, &reply_to, e);
        }
        step
    }

    /// Gather step at a node other than the source
    fn collect(
        &self,
        mut token: RingToken<CollectStatesRequest>,
        session: Option<&EphemeralKey>,
        step: &mut Step<ExecuteEvent>,
    ) -> Result<(), ExecuteError> {
        let first_visit = token.payload.visited.insert(self.party.clone());
        let key = session.filter(|key| token.payload.plan.involves(key)).cloned();

        if token.payload.lap > 1 {
            let key = key.ok_or(ExecuteError::NotParticipant)?;
            self.try_fund(&mut token.payload, &key)?;
            let next = route_successor(&token.payload.route, &self.party)
                .cloned()
                .ok_or(ExecuteError::NotParticipant)?;
            self.pass(token, &next, step);
            return Ok(());
        }

        if let Some(key) = &key {
            if first_visit {
                self.join(&mut token.payload, key)?;
            } else {
                self.try_fund(&mut token.payload, key)?;
            }
        }

        match self.next_hop(&mut token.payload)? {
            GatherHop::Forward(next) | GatherHop::Backtrack(next) => self.pass(token, &next, step),
            GatherHop::Home => {
                let source = token
                    .payload
                    .route
                    .first()
                    .cloned()
                    .ok_or(ExecuteError::NoParticipantReachable)?;
                self.pass(token, &source, step);
            }
        }
        Ok(())
    }

    /// Token arrived at its source: keep traversing or end the lap
    fn collect_at_source(
        &mut self,
        mut token: RingToken<CollectStatesRequest>,
        step: &mut Step<ExecuteEvent>,
    ) -> Result<(), ExecuteError> {
        let session_key = match self.ring_for(&token) {
            Some(ring) if ring.phase == RingPhase::Gathering => ring.session_key.clone(),
            _ => {
                debug!("discarding gather token for a ring past gathering");
                return Ok(());
            }
        };

        if token.payload.lap == 1 {
            self.try_fund(&mut token.payload, &session_key)?;
            match self.next_hop(&mut token.payload)? {
                GatherHop::Forward(next) | GatherHop::Backtrack(next) => {
                    self.pass(token, &next, step);
                    return Ok(());
                }
                GatherHop::Home => {}
            }
        }
        self.finish_gather_lap(token, &session_key, step)
    }

    fn finish_gather_lap(
        &mut self,
        mut token: RingToken<CollectStatesRequest>,
        session_key: &EphemeralKey,
        step: &mut Step<ExecuteEvent>,
    ) -> Result<(), ExecuteError> {
        debug!(
            hops = token.hops,
            route = token.payload.route.len(),
            lap = token.payload.lap,
            "gather lap complete"
        );

        if !token.payload.all_joined() {
            let missing = token
                .payload
                .plan
                .participants()
                .iter()
                .filter(|key| !token.payload.signers.contains(key))
                .count();
            return Err(ExecuteError::Unreachable { missing });
        }

        if !token.payload.unfunded_payers().is_empty() && token.payload.lap == 1 {
            token.payload.lap = 2;
            token.hops = 0;
            self.try_fund(&mut token.payload, session_key)?;
            if let Some(next) = token.payload.route.get(1).cloned() {
                info!("payments unfunded after first lap, starting funding lap");
                self.pass(token, &next, step);
                return Ok(());
            }
        }

        let unfunded = token.payload.unfunded_payers();
        if !unfunded.is_empty() {
            return Err(ExecuteError::Unfunded {
                payers: unfunded.len(),
            });
        }

        self.build_and_sign(token, step)
    }

    /// Assemble the transaction, sign it and start the signing lap
    fn build_and_sign(
        &mut self,
        token: RingToken<CollectStatesRequest>,
        step: &mut Step<ExecuteEvent>,
    ) -> Result<(), ExecuteError> {
        let owner_key = token.owner_key;
        let gathered = token.payload;
        if gathered.claimed != gathered.plan.settle_ids() {
            return Err(ExecuteError::PlanMismatch);
        }

        let obligations: Vec<ObligationId> = gathered.claimed.iter().cloned().collect();
        let spends: Vec<CashSpend> = gathered.spends.into_values().collect();
        let tx = SettlementTransaction::build(
            gathered.plan.currency.clone(),
            obligations,
            &spends,
            gathered.signers,
        )?;

        let session_key = match self.rings.get_mut(&owner_key) {
            Some(ring) => {
                ring.phase = RingPhase::Signing;
                ring.session_key.clone()
            }
            None => return Ok(()),
        };
        let mut signed = SignedTransaction::new(tx);
        let signature = self.collaborators.signer.sign(&session_key, signed.tx.id.as_str());
        signed.signatures.push(signature);
        info!(
            tx_id = %signed.tx.id,
            signers = signed.tx.command.signers.len(),
            inputs = signed.tx.cash_inputs.len(),
            "transaction built"
        );

        let token = RingToken::new(
            owner_key,
            SigningStructure {
                plan: gathered.plan,
                reply_to: gathered.reply_to,
                route: gathered.route,
                tx: signed,
            },
        );
        self.start_signing_lap(token, step)
    }

    /// Add this node to the ring: claim, certify, fund
    fn join(&self, gathered: &mut CollectStatesRequest, key: &EphemeralKey) -> Result<(), ExecuteError> {
        if !gathered.signers.insert(key.clone()) {
            return Ok(());
        }
        gathered.route.push(self.party.clone());
        gathered.claimed.extend(gathered.plan.obligations_of(key));

        if gathered.plan.payments.iter().any(|p| &p.to == key) {
            let certificate = self.collaborators.cash.issue_certificate(&self.party)?;
            gathered.certificates.insert(key.clone(), certificate);
        }
        self.try_fund(gathered, key)?;
        debug!(route = gathered.route.len(), "joined ring");
        Ok(())
    }

    /// Attach this payer's spend once every payee it owes has a certificate
    fn try_fund(&self, gathered: &mut CollectStatesRequest, key: &EphemeralKey) -> Result<(), ExecuteError> {
        if gathered.spends.contains_key(key) {
            return Ok(());
        }

        let mut payments = Vec::new();
        for payment in gathered.plan.payments.iter().filter(|p| &p.from == key) {
            let Some(certificate) = gathered.certificates.get(&payment.to) else {
                return Ok(());
            };
            payments.push((certificate.clone(), payment.amount));
        }
        if payments.is_empty() {
            return Ok(());
        }

        let spend = self
            .collaborators
            .cash
            .generate_spend(&self.party, &gathered.plan.currency, &payments)?;
        debug!(payments = payments.len(), amount = spend.output_total(), "funded payments");
        gathered.spends.insert(key.clone(), spend);
        Ok(())
    }

    fn next_hop(&self, gathered: &mut CollectStatesRequest) -> Result<GatherHop, ExecuteError> {
        if gathered.all_joined() {
            return Ok(GatherHop::Home);
        }

        let candidates = self.gather_order(gathered)?;
        if let Some(next) = candidates.into_iter().find(|p| !gathered.visited.contains(p)) {
            gathered.trail.push(self.party.clone());
            return Ok(GatherHop::Forward(next));
        }
        Ok(match gathered.trail.pop() {
            Some(back) => GatherHop::Backtrack(back),
            None => GatherHop::Home,
        })
    }

    /// Own counterparties ranked for lap 1: uncertified payees, then other
    /// settle-set links, then the rest
    fn gather_order(&self, gathered: &CollectStatesRequest) -> Result<Vec<PartyId>, ExecuteError> {
        let settle: BTreeMap<&ObligationId, &NettingObligation> =
            gathered.plan.settle.iter().map(|ob| (&ob.id, ob)).collect();
        let uncertified: BTreeSet<&EphemeralKey> = gathered
            .plan
            .payments
            .iter()
            .map(|p| &p.to)
            .filter(|key| !gathered.certificates.contains_key(*key))
            .collect();

        let mut ranks: BTreeMap<PartyId, u8> = BTreeMap::new();
        for ob in self.collaborators.obligations.obligations_of(&self.party)? {
            let Some(counterparty) = ob.counterparty(&self.party) else {
                continue;
            };
            let rank = match settle.get(ob.id()) {
                Some(edge) => {
                    let their_key = if ob.lender() == &self.party {
                        &edge.borrower
                    } else {
                        &edge.lender
                    };
                    if uncertified.contains(their_key) {
                        0
                    } else {
                        1
                    }
                }
                None => 2,
            };
            ranks
                .entry(counterparty.clone())
                .and_modify(|held| *held = (*held).min(rank))
                .or_insert(rank);
        }

        let mut ordered: Vec<(u8, PartyId)> = ranks.into_iter().map(|(party, rank)| (rank, party)).collect();
        ordered.sort();
        Ok(ordered.into_iter().map(|(_, party)| party).collect())
    }

    fn pass(&self, mut token: RingToken<CollectStatesRequest>, to: &PartyId, step: &mut Step<ExecuteEvent>) {
        token.hops += 1;
        step.send(&self.party, to, Message::CollectStates(token));
    }
}
