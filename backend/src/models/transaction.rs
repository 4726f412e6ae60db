//! Settlement transaction model
//!
//! The single multi-party transaction an execution round commits:
//! - Inputs: every settled obligation plus the cash states funding residual
//!   payments
//! - Outputs: the cash states created for payees (and change)
//! - One settle command naming the obligations and the required signers
//!
//! The transaction id is the SHA-256 of the canonical JSON body, so every
//! participant can recompute it and sign the same digest.
//!
//! CRITICAL: cash inputs and outputs balance exactly (i64 minor units)

use super::obligation::ObligationId;
use super::party::{Amount, Currency, EphemeralKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while assembling a transaction
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Transaction settles no obligation")]
    EmptySettlement,

    #[error("Cash inputs {inputs} do not balance cash outputs {outputs}")]
    CashImbalance { inputs: Amount, outputs: Amount },

    #[error("State {state} is consumed twice")]
    DuplicateInput { state: String },

    #[error("Failed to encode transaction body: {0}")]
    Encoding(String),
}

/// Identifier of a cash state held in a vault
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CashStateId(String);

impl CashStateId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(format!("cash_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CashStateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unspent cash owned by a key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CashState {
    pub id: CashStateId,
    pub owner: EphemeralKey,
    pub amount: Amount,
    pub currency: Currency,
}

impl CashState {
    pub fn new(owner: EphemeralKey, amount: Amount, currency: Currency) -> Self {
        Self {
            id: CashStateId::generate(),
            owner,
            amount,
            currency,
        }
    }
}

/// Anything the ordering service can mark consumed
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StateRef {
    Obligation(ObligationId),
    Cash(CashStateId),
}

impl fmt::Display for StateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateRef::Obligation(id) => write!(f, "obligation:{id}"),
            StateRef::Cash(id) => write!(f, "cash:{id}"),
        }
    }
}

/// Anonymous key a payee hands out to receive a residual payment
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PaymentCertificate {
    pub key: EphemeralKey,
}

/// Cash movement generated by one payer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CashSpend {
    pub inputs: Vec<CashState>,
    pub outputs: Vec<CashState>,
}

impl CashSpend {
    pub fn input_total(&self) -> Amount {
        self.inputs.iter().map(|s| s.amount).sum()
    }

    pub fn output_total(&self) -> Amount {
        self.outputs.iter().map(|s| s.amount).sum()
    }
}

/// Command carried by every netting transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettleCommand {
    /// Obligations this transaction settles
    pub obligations: Vec<ObligationId>,

    /// Keys whose signatures the transaction needs
    pub signers: BTreeSet<EphemeralKey>,
}

/// Transaction identifier (hex SHA-256 of the body)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Serialize)]
struct Body<'a> {
    currency: &'a Currency,
    obligation_inputs: &'a [ObligationId],
    cash_inputs: &'a [CashState],
    cash_outputs: &'a [CashState],
    command: &'a SettleCommand,
}

/// Multi-party netting transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementTransaction {
    pub id: TransactionId,
    pub currency: Currency,
    pub obligation_inputs: Vec<ObligationId>,
    pub cash_inputs: Vec<CashState>,
    pub cash_outputs: Vec<CashState>,
    pub command: SettleCommand,
}

impl SettlementTransaction {
    /// Assemble and hash a transaction
    ///
    /// Obligation inputs are sorted; cash states keep spend order.
    pub fn build(
        currency: Currency,
        mut obligations: Vec<ObligationId>,
        spends: &[CashSpend],
        signers: BTreeSet<EphemeralKey>,
    ) -> Result<Self, TransactionError> {
        if obligations.is_empty() {
            return Err(TransactionError::EmptySettlement);
        }
        obligations.sort();

        let cash_inputs: Vec<CashState> = spends.iter().flat_map(|s| s.inputs.iter().cloned()).collect();
        let cash_outputs: Vec<CashState> = spends.iter().flat_map(|s| s.outputs.iter().cloned()).collect();

        let inputs: Amount = cash_inputs.iter().map(|s| s.amount).sum();
        let outputs: Amount = cash_outputs.iter().map(|s| s.amount).sum();
        if inputs != outputs {
            return Err(TransactionError::CashImbalance { inputs, outputs });
        }

        let mut seen = BTreeSet::new();
        let refs = obligations
            .iter()
            .cloned()
            .map(StateRef::Obligation)
            .chain(cash_inputs.iter().map(|s| StateRef::Cash(s.id.clone())));
        for state in refs {
            if !seen.insert(state.clone()) {
                return Err(TransactionError::DuplicateInput {
                    state: state.to_string(),
                });
            }
        }

        let command = SettleCommand {
            obligations: obligations.clone(),
            signers,
        };
        let body = Body {
            currency: &currency,
            obligation_inputs: &obligations,
            cash_inputs: &cash_inputs,
            cash_outputs: &cash_outputs,
            command: &command,
        };
        let json = serde_json::to_vec(&body).map_err(|e| TransactionError::Encoding(e.to_string()))?;
        let id = TransactionId(format!("{:x}", Sha256::digest(&json)));

        Ok(Self {
            id,
            currency,
            obligation_inputs: obligations,
            cash_inputs,
            cash_outputs,
            command,
        })
    }

    /// Every state the ordering service must mark consumed
    pub fn input_refs(&self) -> Vec<StateRef> {
        self.obligation_inputs
            .iter()
            .cloned()
            .map(StateRef::Obligation)
            .chain(self.cash_inputs.iter().map(|s| StateRef::Cash(s.id.clone())))
            .collect()
    }
}

/// Signature over a transaction id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub signer: EphemeralKey,
    pub digest: String,
}

/// Transaction plus the signatures collected so far
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub tx: SettlementTransaction,
    pub signatures: Vec<Signature>,
}

impl SignedTransaction {
    pub fn new(tx: SettlementTransaction) -> Self {
        Self {
            tx,
            signatures: Vec::new(),
        }
    }

    pub fn is_signed_by(&self, key: &EphemeralKey) -> bool {
        self.signatures.iter().any(|s| &s.signer == key)
    }

    /// Required signers that have not signed yet
    pub fn missing_signers(&self) -> Vec<EphemeralKey> {
        self.tx
            .command
            .signers
            .iter()
            .filter(|key| !self.is_signed_by(key))
            .cloned()
            .collect()
    }

    pub fn is_fully_signed(&self) -> bool {
        self.missing_signers().is_empty()
    }
}

/// Verdict of the ordering service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderingResult {
    Committed,
    Rejected { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(names: &[&str]) -> BTreeSet<EphemeralKey> {
        names.iter().map(|n| EphemeralKey::new(*n)).collect()
    }

    #[test]
    fn test_id_is_stable_for_equal_bodies() {
        let a = SettlementTransaction::build("USD".into(), vec!["o2".into(), "o1".into()], &[], keys(&["A"])).unwrap();
        let b = SettlementTransaction::build("USD".into(), vec!["o1".into(), "o2".into()], &[], keys(&["A"])).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.as_str().len(), 64);
    }

    #[test]
    fn test_rejects_unbalanced_cash() {
        let spend = CashSpend {
            inputs: vec![CashState::new("A".into(), 10, "USD".into())],
            outputs: vec![CashState::new("B".into(), 7, "USD".into())],
        };
        let err = SettlementTransaction::build("USD".into(), vec!["o1".into()], &[spend], keys(&["A"])).unwrap_err();
        assert_eq!(err, TransactionError::CashImbalance { inputs: 10, outputs: 7 });
    }

    #[test]
    fn test_rejects_empty_settlement() {
        let err = SettlementTransaction::build("USD".into(), vec![], &[], BTreeSet::new()).unwrap_err();
        assert_eq!(err, TransactionError::EmptySettlement);
    }

    #[test]
    fn test_missing_signers_shrink_as_signatures_arrive() {
        let tx = SettlementTransaction::build("USD".into(), vec!["o1".into()], &[], keys(&["A", "B"])).unwrap();
        let mut signed = SignedTransaction::new(tx);
        assert_eq!(signed.missing_signers().len(), 2);

        signed.signatures.push(Signature {
            signer: "A".into(),
            digest: "d".to_string(),
        });
        assert_eq!(signed.missing_signers(), vec![EphemeralKey::new("B")]);
        assert!(!signed.is_fully_signed());
    }
}
