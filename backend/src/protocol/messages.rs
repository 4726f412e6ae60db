//! Wire payloads
//!
//! Every message a node can send to another. All payloads are serde types;
//! the network frames them as JSON (see [`Envelope::encode`]).

use crate::core::Millis;
use crate::models::{
    CashLimit, CashSpend, Currency, EphemeralKey, MaskedObligation, NettingObligation,
    ObligationId, PartyId, PaymentCertificate, SignedTransaction, TransactionId,
};
use crate::netting::{NettingPayment, NettingResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

// ============================================================================
// Detect
// ============================================================================

/// Scan identifier: hex SHA-256 of `(start_time, source)`
///
/// Scans are totally ordered by id and the lower id wins.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanId(String);

impl ScanId {
    pub fn compute(start_time: Millis, source: &PartyId) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(start_time.to_be_bytes());
        hasher.update(source.as_str().as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for logs
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for ScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short())
    }
}

/// Request to join a detection round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRequest {
    pub id: ScanId,

    /// Party that started the round
    pub source: PartyId,

    /// Party this copy came from
    pub requester: PartyId,

    pub currency: Currency,
    pub start_time: Millis,

    /// Remaining hop budget
    pub ttl: u32,
}

impl ScanRequest {
    pub fn new(source: PartyId, currency: Currency, start_time: Millis, ttl: u32) -> Self {
        Self {
            id: ScanId::compute(start_time, &source),
            requester: source.clone(),
            source,
            currency,
            start_time,
            ttl,
        }
    }

    /// Copy to send one hop further, sent by `requester`
    pub fn forwarded(&self, requester: &PartyId) -> Self {
        Self {
            requester: requester.clone(),
            ttl: self.ttl.saturating_sub(1),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanAcknowledgement {
    pub id: ScanId,
}

/// Aggregate returned up the detection tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanData {
    pub obligations: Vec<MaskedObligation>,
    pub limits: Vec<CashLimit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanResponse {
    Success { id: ScanId, data: ScanData },
    Failure { id: ScanId, winner: ScanId },
}

impl ScanResponse {
    pub fn id(&self) -> &ScanId {
        match self {
            ScanResponse::Success { id, .. } | ScanResponse::Failure { id, .. } => id,
        }
    }
}

// ============================================================================
// Execute
// ============================================================================

/// What an execution round settles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementPlan {
    /// Detection round the plan was computed from
    pub scan_id: ScanId,
    pub currency: Currency,
    pub settle: Vec<NettingObligation>,
    pub payments: Vec<NettingPayment>,
}

impl SettlementPlan {
    pub fn new(scan_id: ScanId, currency: Currency, result: &NettingResult) -> Self {
        Self {
            scan_id,
            currency,
            settle: result.settled_obligations.clone(),
            payments: result.payments.clone(),
        }
    }

    pub fn settle_ids(&self) -> BTreeSet<ObligationId> {
        self.settle.iter().map(|ob| ob.id.clone()).collect()
    }

    /// Settle-set obligations with `key` on either side
    pub fn obligations_of(&self, key: &EphemeralKey) -> Vec<ObligationId> {
        self.settle
            .iter()
            .filter(|ob| &ob.lender == key || &ob.borrower == key)
            .map(|ob| ob.id.clone())
            .collect()
    }

    pub fn involves(&self, key: &EphemeralKey) -> bool {
        self.settle.iter().any(|ob| &ob.lender == key || &ob.borrower == key)
    }

    /// Every key on either side of a settle-set obligation
    pub fn participants(&self) -> BTreeSet<EphemeralKey> {
        self.settle
            .iter()
            .flat_map(|ob| [ob.lender.clone(), ob.borrower.clone()])
            .collect()
    }
}

/// Token that circulates a ring and returns to its owner
///
/// Ownership is recognised by key only: the owner key is fresh for every
/// execution round, so a token coming back is known without any ring
/// position arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingToken<T> {
    pub owner_key: EphemeralKey,
    pub payload: T,

    /// Sends so far in the current lap
    pub hops: u32,
}

impl<T> RingToken<T> {
    pub fn new(owner_key: EphemeralKey, payload: T) -> Self {
        Self {
            owner_key,
            payload,
            hops: 0,
        }
    }

    pub fn is_mine(&self, key: &EphemeralKey) -> bool {
        &self.owner_key == key
    }
}

/// Locate walk from the planner node to the first settle-set holder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NettingData {
    pub plan: SettlementPlan,
    pub reply_to: PartyId,

    /// Depth-first path back towards the planner node
    pub path: Vec<PartyId>,
    pub visited: BTreeSet<PartyId>,
}

/// Gather payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectStatesRequest {
    pub plan: SettlementPlan,
    pub reply_to: PartyId,

    /// Settle-set holders in visit order; `route[0]` is the gather source
    pub route: Vec<PartyId>,

    /// Depth-first stack used to backtrack
    pub trail: Vec<PartyId>,
    pub visited: BTreeSet<PartyId>,

    pub claimed: BTreeSet<ObligationId>,

    /// Payee session key → certificate to pay into
    pub certificates: BTreeMap<EphemeralKey, PaymentCertificate>,

    /// Payer session key → its cash spend
    pub spends: BTreeMap<EphemeralKey, CashSpend>,

    pub signers: BTreeSet<EphemeralKey>,

    /// 1 for discovery, 2 for the funding-only lap along `route`
    pub lap: u8,
}

impl CollectStatesRequest {
    pub fn new(plan: SettlementPlan, reply_to: PartyId) -> Self {
        Self {
            plan,
            reply_to,
            route: Vec::new(),
            trail: Vec::new(),
            visited: BTreeSet::new(),
            claimed: BTreeSet::new(),
            certificates: BTreeMap::new(),
            spends: BTreeMap::new(),
            signers: BTreeSet::new(),
            lap: 1,
        }
    }

    /// Every participant has signed up
    pub fn all_joined(&self) -> bool {
        self.plan.participants().iter().all(|key| self.signers.contains(key))
    }

    /// Payers without a spend yet
    pub fn unfunded_payers(&self) -> BTreeSet<EphemeralKey> {
        self.plan
            .payments
            .iter()
            .filter(|p| !self.spends.contains_key(&p.from))
            .map(|p| p.from.clone())
            .collect()
    }
}

/// Signing payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningStructure {
    pub plan: SettlementPlan,
    pub reply_to: PartyId,
    pub route: Vec<PartyId>,
    pub tx: SignedTransaction,
}

/// Committed transaction, circulated so every participant records it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizedTransaction {
    pub plan: SettlementPlan,
    pub reply_to: PartyId,
    pub route: Vec<PartyId>,
    pub tx: SignedTransaction,
}

/// Next route member after `party`, wrapping to the source
pub(crate) fn route_successor<'a>(route: &'a [PartyId], party: &PartyId) -> Option<&'a PartyId> {
    let pos = route.iter().position(|p| p == party)?;
    route.get(pos + 1).or_else(|| route.first())
}

// ============================================================================
// Reports
// ============================================================================

/// Final result of an execution round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionOutcome {
    Completed {
        tx_id: TransactionId,
        settled: Vec<ObligationId>,
        payments: Vec<NettingPayment>,
    },

    /// The ordering service refused the transaction (double spend)
    Rejected { reason: String },

    /// A participant could not complete its step
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub scan_id: ScanId,
    pub outcome: ExecutionOutcome,
}

/// Flooded when planning finds nothing to settle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlockNotice {
    pub scan_id: ScanId,
    pub reason: String,
    pub since: Millis,
}

// ============================================================================
// Framing
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Message {
    ScanRequest(ScanRequest),
    ScanAcknowledgement(ScanAcknowledgement),
    ScanResponse(ScanResponse),
    NettingData(NettingData),
    CollectStates(RingToken<CollectStatesRequest>),
    Signing(RingToken<SigningStructure>),
    Finalized(RingToken<FinalizedTransaction>),
    ExecutionReport(ExecutionReport),
    DeadlockNotice(DeadlockNotice),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::ScanRequest(_) => "scan_request",
            Message::ScanAcknowledgement(_) => "scan_acknowledgement",
            Message::ScanResponse(_) => "scan_response",
            Message::NettingData(_) => "netting_data",
            Message::CollectStates(_) => "collect_states",
            Message::Signing(_) => "signing",
            Message::Finalized(_) => "finalized",
            Message::ExecutionReport(_) => "execution_report",
            Message::DeadlockNotice(_) => "deadlock_notice",
        }
    }
}

/// Frame that could not be encoded or decoded
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Failed to encode or decode a frame: {0}")]
pub struct CodecError(pub String);

/// Point-to-point, party-addressed message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: PartyId,
    pub to: PartyId,
    pub message: Message,
}

impl Envelope {
    pub fn new(from: PartyId, to: PartyId, message: Message) -> Self {
        Self { from, to, message }
    }

    /// JSON frame
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(|e| CodecError(e.to_string()))
    }

    pub fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(frame).map_err(|e| CodecError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_id_depends_on_time_and_source() {
        let a = ScanId::compute(1_000, &"A".into());
        assert_eq!(a, ScanId::compute(1_000, &"A".into()));
        assert_ne!(a, ScanId::compute(1_001, &"A".into()));
        assert_ne!(a, ScanId::compute(1_000, &"B".into()));
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_forwarding_spends_one_hop() {
        let request = ScanRequest::new("A".into(), "USD".into(), 5, 1);
        let hop = request.forwarded(&"B".into());
        assert_eq!(hop.ttl, 0);
        assert_eq!(hop.requester.as_str(), "B");
        assert_eq!(hop.id, request.id);
        assert_eq!(hop.forwarded(&"C".into()).ttl, 0);
    }

    #[test]
    fn test_envelope_frame_is_tagged_json() {
        let envelope = Envelope::new(
            "A".into(),
            "B".into(),
            Message::ScanAcknowledgement(ScanAcknowledgement {
                id: ScanId::compute(0, &"A".into()),
            }),
        );
        let frame = envelope.encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(json["message"]["type"], "scan_acknowledgement");
        assert_eq!(Envelope::decode(&frame).unwrap(), envelope);
        assert!(Envelope::decode(b"{\"from\":\"A\"}").is_err());
    }

    #[test]
    fn test_ring_token_recognises_its_owner() {
        let owner = EphemeralKey::generate();
        let token = RingToken::new(owner.clone(), ());
        assert!(token.is_mine(&owner));
        assert!(!token.is_mine(&EphemeralKey::generate()));
    }

    #[test]
    fn test_route_successor_wraps_to_source() {
        let route: Vec<PartyId> = vec!["A".into(), "B".into(), "C".into()];
        assert_eq!(route_successor(&route, &"B".into()).map(|p| p.as_str()), Some("C"));
        assert_eq!(route_successor(&route, &"C".into()).map(|p| p.as_str()), Some("A"));
        assert_eq!(route_successor(&route, &"Z".into()), None);
    }
}
