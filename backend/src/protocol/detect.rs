//! Detect coordinator
//!
//! Flooding election over the obligation graph. Every node that starts a
//! round floods a [`ScanRequest`]; wherever two rounds meet the lower scan id
//! wins, so each connected region converges on a single round. The round's
//! data flows back up the tree of first-adoptions and is aggregated at the
//! source:
//!
//! ```text
//!   source ──request──▶ n1 ──request──▶ n2 (leaf)
//!          ◀──success──    ◀──success──
//!          (own ∪ n1 ∪ n2)   (own ∪ n2)
//! ```
//!
//! Each node discloses its obligations masked under a session key that is
//! fresh for every scan, so the aggregate never carries durable identities.
//!
//! # Critical Invariants
//!
//! 1. **Single winner**: a node holds at most one round; a lower id always
//!    replaces a higher one, and a node never starts over a live lower round
//! 2. **Stale discard**: acknowledgements and responses for any scan other
//!    than the held one are dropped
//! 3. **Idempotent merge**: obligations merge by id and limits by key, so a
//!    repeated disclosure changes nothing
//! 4. **Stable session key**: a node uses one key per scan id, even if it
//!    re-adopts the scan

use super::messages::{Message, ScanAcknowledgement, ScanData, ScanId, ScanRequest, ScanResponse};
use super::Step;
use crate::config::{LsmConfig, NodeConfig};
use crate::models::{CashLimit, Currency, EphemeralKey, MaskedObligation, ObligationId, PartyId};
use crate::netting::Limits;
use crate::services::{CashLedger, CollaboratorError, Collaborators, ObligationSource};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Session keys kept for execution after their scan completes
const SESSION_KEY_HISTORY: usize = 32;

/// Errors raised by the detect coordinator
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DetectError {
    #[error("Party {party} has no open obligations to scan")]
    NoOpenObligations { party: String },

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

/// Progress of a neighbour within the held round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighbourStatus {
    Sent,
    Acknowledged,
    Received,
}

/// Aggregate of a completed round, available at its source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectOutcome {
    pub scan: ScanRequest,

    /// Key the source disclosed under
    pub session_key: EphemeralKey,

    /// Merged disclosures, sorted by obligation id
    pub obligations: Vec<MaskedObligation>,

    pub limits: Limits,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectEvent {
    /// This node's round completed
    Completed(DetectOutcome),

    /// This node's round lost to a lower scan id
    Superseded { scan_id: ScanId, winner: ScanId },
}

/// State of the round a node currently holds
#[derive(Debug)]
struct Round {
    request: ScanRequest,

    /// Party the request was adopted from; `None` at the source
    upstream: Option<PartyId>,

    /// Neighbours whose response is awaited
    neighbours: BTreeMap<PartyId, NeighbourStatus>,

    obligations: BTreeMap<ObligationId, MaskedObligation>,
    limits: Limits,

    /// Responded upstream, completed, or failed
    done: bool,
}

impl Round {
    fn absorb(&mut self, data: &ScanData) {
        for ob in &data.obligations {
            self.obligations
                .entry(ob.id.clone())
                .and_modify(|held| held.merge(ob))
                .or_insert_with(|| ob.clone());
        }
        for limit in &data.limits {
            self.limits.insert(limit.key.clone(), limit.amount);
        }
    }

    fn all_received(&self) -> bool {
        self.neighbours.values().all(|s| *s == NeighbourStatus::Received)
    }

    fn aggregate(&self) -> ScanData {
        ScanData {
            obligations: self.obligations.values().cloned().collect(),
            limits: self
                .limits
                .iter()
                .map(|(key, amount)| CashLimit::new(key.clone(), *amount))
                .collect(),
        }
    }
}

/// Recent scan → session key pairs
#[derive(Debug, Default)]
struct SessionKeys {
    keys: VecDeque<(ScanId, EphemeralKey)>,
}

impl SessionKeys {
    fn get(&self, scan_id: &ScanId) -> Option<&EphemeralKey> {
        self.keys.iter().find(|(id, _)| id == scan_id).map(|(_, key)| key)
    }

    fn get_or_create(&mut self, scan_id: &ScanId) -> EphemeralKey {
        if let Some(key) = self.get(scan_id) {
            return key.clone();
        }
        let key = EphemeralKey::generate();
        self.keys.push_back((scan_id.clone(), key.clone()));
        while self.keys.len() > SESSION_KEY_HISTORY {
            self.keys.pop_front();
        }
        key
    }
}

/// Per-node detection state machine
pub struct DetectCoordinator {
    party: PartyId,
    node: NodeConfig,
    currency: Currency,
    scan_ttl: u32,

    /// A held round this old (by request start time) no longer blocks newer
    /// requests
    round_expiry_ms: u64,

    obligations: Arc<dyn ObligationSource>,
    cash: Arc<dyn CashLedger>,

    round: Option<Round>,

    /// Scan this node started and has not yet seen finish
    initiated: Option<ScanId>,

    sessions: SessionKeys,
}

impl DetectCoordinator {
    pub fn new(node: NodeConfig, config: &LsmConfig, collaborators: &Collaborators) -> Self {
        Self {
            party: node.party.clone(),
            node,
            currency: config.currency.clone(),
            scan_ttl: config.scan_ttl,
            round_expiry_ms: config.detect_timeout_ms,
            obligations: collaborators.obligations.clone(),
            cash: collaborators.cash.clone(),
            round: None,
            initiated: None,
            sessions: SessionKeys::default(),
        }
    }

    pub fn party(&self) -> &PartyId {
        &self.party
    }

    /// Request of the round currently held
    pub fn winning(&self) -> Option<&ScanRequest> {
        self.round.as_ref().map(|r| &r.request)
    }

    /// Key this node disclosed under for `scan_id`
    pub fn session_key(&self, scan_id: &ScanId) -> Option<&EphemeralKey> {
        self.sessions.get(scan_id)
    }

    pub fn neighbour_status(&self, neighbour: &PartyId) -> Option<NeighbourStatus> {
        self.round.as_ref()?.neighbours.get(neighbour).copied()
    }

    /// Start a round with this node as source
    #[instrument(skip_all, fields(party = %self.party))]
    pub fn start(&mut self, now: u64) -> Result<Step<DetectEvent>, DetectError> {
        let request = ScanRequest::new(self.party.clone(), self.currency.clone(), now, self.scan_ttl);
        let mut step = Step::new();

        // A live lower round already holds this node; starting would orphan it
        if let Some(round) = self.round.as_ref() {
            let expired = now >= round.request.start_time.saturating_add(self.round_expiry_ms);
            if !round.done && !expired && round.request.id < request.id {
                info!(scan = %request.id, winner = %round.request.id, "held round outranks new round");
                step.emit(DetectEvent::Superseded {
                    scan_id: request.id,
                    winner: round.request.id.clone(),
                });
                return Ok(step);
            }
        }

        if let Some(previous) = self.initiated.take() {
            warn!(previous = %previous, "abandoning unfinished round");
        }
        info!(scan = %request.id, ttl = request.ttl, "starting detection round");

        let scan_id = request.id.clone();
        self.adopt(request, None, &mut step)?;
        self.initiated = Some(scan_id);
        self.try_finish(&mut step);
        Ok(step)
    }

    /// Incoming scan request from `from`
    #[instrument(skip_all, fields(party = %self.party, scan = %request.id, from = %from))]
    pub fn handle_request(&mut self, from: &PartyId, request: ScanRequest) -> Result<Step<DetectEvent>, DetectError> {
        let mut step = Step::new();
        step.send(
            &self.party,
            from,
            Message::ScanAcknowledgement(ScanAcknowledgement {
                id: request.id.clone(),
            }),
        );

        let held = self.round.as_ref().map(|round| {
            let replaceable = round.done
                || request.start_time >= round.request.start_time.saturating_add(self.round_expiry_ms);
            (round.request.id.clone(), replaceable)
        });

        match held {
            Some((held_id, _)) if held_id == request.id => {
                // Same round through another path: disclose own data only
                let key = self.sessions.get_or_create(&request.id);
                let (_, data) = self.own_data(&key)?;
                step.send(
                    &self.party,
                    from,
                    Message::ScanResponse(ScanResponse::Success { id: request.id, data }),
                );
            }
            Some((held_id, false)) if held_id < request.id => {
                debug!(winner = %held_id, "rejecting higher scan id");
                step.send(
                    &self.party,
                    from,
                    Message::ScanResponse(ScanResponse::Failure {
                        id: request.id,
                        winner: held_id,
                    }),
                );
            }
            _ => {
                if let Some(initiated) = self.initiated.take() {
                    info!(scan = %initiated, winner = %request.id, "own round superseded");
                    step.emit(DetectEvent::Superseded {
                        scan_id: initiated,
                        winner: request.id.clone(),
                    });
                }
                self.adopt(request, Some(from.clone()), &mut step)?;
                self.try_finish(&mut step);
            }
        }

        Ok(step)
    }

    #[instrument(skip_all, fields(party = %self.party, scan = %ack.id, from = %from))]
    pub fn handle_ack(&mut self, from: &PartyId, ack: ScanAcknowledgement) -> Step<DetectEvent> {
        match self.round.as_mut() {
            Some(round) if round.request.id == ack.id => {
                if let Some(status) = round.neighbours.get_mut(from) {
                    if *status == NeighbourStatus::Sent {
                        *status = NeighbourStatus::Acknowledged;
                    }
                }
            }
            _ => debug!("discarding stale acknowledgement"),
        }
        Step::new()
    }

    #[instrument(skip_all, fields(party = %self.party, scan = %response.id(), from = %from))]
    pub fn handle_response(&mut self, from: &PartyId, response: ScanResponse) -> Step<DetectEvent> {
        let mut step = Step::new();
        let Some(round) = self.round.as_mut() else {
            debug!("discarding response with no round held");
            return step;
        };
        if &round.request.id != response.id() {
            debug!("discarding stale response");
            return step;
        }
        if round.done {
            debug!("discarding response for finished round");
            return step;
        }

        match response {
            ScanResponse::Success { data, .. } => {
                round.absorb(&data);
                if let Some(status) = round.neighbours.get_mut(from) {
                    *status = NeighbourStatus::Received;
                }
                self.try_finish(&mut step);
            }
            ScanResponse::Failure { id, winner } => {
                round.done = true;
                match round.upstream.clone() {
                    Some(upstream) => {
                        debug!(winner = %winner, "forwarding failure upstream");
                        step.send(
                            &self.party,
                            &upstream,
                            Message::ScanResponse(ScanResponse::Failure { id, winner }),
                        );
                    }
                    None => {
                        if self.initiated.as_ref() == Some(&id) {
                            self.initiated = None;
                            info!(winner = %winner, "own round superseded");
                            step.emit(DetectEvent::Superseded { scan_id: id, winner });
                        }
                    }
                }
            }
        }
        step
    }

    /// Replace the held round with `request`
    fn adopt(
        &mut self,
        request: ScanRequest,
        upstream: Option<PartyId>,
        step: &mut Step<DetectEvent>,
    ) -> Result<(), DetectError> {
        let key = self.sessions.get_or_create(&request.id);
        let (neighbours, data) = self.own_data(&key)?;
        if upstream.is_none() && neighbours.is_empty() {
            return Err(DetectError::NoOpenObligations {
                party: self.party.to_string(),
            });
        }

        let leaf = upstream.is_some() && request.ttl == 0;
        let awaited: BTreeMap<PartyId, NeighbourStatus> = if leaf {
            BTreeMap::new()
        } else {
            neighbours
                .into_iter()
                .filter(|n| Some(n) != upstream.as_ref())
                .map(|n| (n, NeighbourStatus::Sent))
                .collect()
        };

        for neighbour in awaited.keys() {
            step.send(
                &self.party,
                neighbour,
                Message::ScanRequest(request.forwarded(&self.party)),
            );
        }
        debug!(awaiting = awaited.len(), leaf, "adopted scan");

        let mut round = Round {
            request,
            upstream,
            neighbours: awaited,
            obligations: BTreeMap::new(),
            limits: Limits::new(),
            done: false,
        };
        round.absorb(&data);
        self.round = Some(round);
        Ok(())
    }

    /// Respond upstream, or complete at the source, once every awaited
    /// neighbour has answered
    fn try_finish(&mut self, step: &mut Step<DetectEvent>) {
        let Some(round) = self.round.as_mut() else {
            return;
        };
        if round.done || !round.all_received() {
            return;
        }
        round.done = true;

        match round.upstream.clone() {
            Some(upstream) => {
                step.send(
                    &self.party,
                    &upstream,
                    Message::ScanResponse(ScanResponse::Success {
                        id: round.request.id.clone(),
                        data: round.aggregate(),
                    }),
                );
            }
            None => {
                if self.initiated.as_ref() != Some(&round.request.id) {
                    return;
                }
                self.initiated = None;
                let Some(session_key) = self.sessions.get(&round.request.id).cloned() else {
                    return;
                };
                info!(
                    obligations = round.obligations.len(),
                    parties = round.limits.len(),
                    "detection complete"
                );
                step.emit(DetectEvent::Completed(DetectOutcome {
                    scan: round.request.clone(),
                    session_key,
                    obligations: round.obligations.values().cloned().collect(),
                    limits: round.limits.clone(),
                }));
            }
        }
    }

    /// Own counterparties plus own masked obligations and declared limit
    fn own_data(&self, key: &EphemeralKey) -> Result<(BTreeSet<PartyId>, ScanData), DetectError> {
        let open = self.obligations.obligations_of(&self.party)?;
        let balance = self.cash.cash_balance(&self.party, &self.currency)?;

        let mut neighbours = BTreeSet::new();
        let mut obligations = Vec::new();
        for ob in open.iter().filter(|ob| ob.currency() == &self.currency) {
            if let Some(counterparty) = ob.counterparty(&self.party) {
                neighbours.insert(counterparty.clone());
            }
            if let Some(masked) = ob.masked_for(&self.party, key) {
                obligations.push(masked);
            }
        }

        let data = ScanData {
            obligations,
            limits: vec![CashLimit::new(key.clone(), self.node.declared_limit(balance))],
        };
        Ok((neighbours, data))
    }
}
