//! External collaborators
//!
//! The mechanism never owns ledger state. Obligation records, cash, the
//! consumed-state registry and signing all live behind these traits:
//!
//! - [`ObligationSource`]: open obligations per party, status updates after
//!   commit
//! - [`CashLedger`]: balances, payment certificates, cash spends, recording a
//!   committed transaction in a party's vault
//! - [`OrderingService`]: atomic accept/reject over unconsumed inputs
//! - [`Signer`]: signatures over transaction ids
//!
//! In-memory implementations back the tests and the CLI.

pub mod ledger;
pub mod ordering;
pub mod signer;

use crate::models::{
    Amount, CashSpend, Currency, EphemeralKey, Obligation, ObligationId, OrderingResult, PartyId,
    PaymentCertificate, Signature, SignedTransaction,
};
use std::sync::Arc;
use thiserror::Error;

pub use ledger::InMemoryLedger;
pub use ordering::InMemoryOrderingService;
pub use signer::DigestSigner;

/// Failure inside an external collaborator
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("Unknown party: {0}")]
    UnknownParty(String),

    #[error("Party {party} cannot fund {needed}: only {available} available")]
    InsufficientFunds {
        party: String,
        needed: Amount,
        available: Amount,
    },

    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),
}

/// Source of obligation records and sink for their status
pub trait ObligationSource: Send + Sync {
    /// Open obligations where `party` is lender or borrower
    fn obligations_of(&self, party: &PartyId) -> Result<Vec<Obligation>, CollaboratorError>;

    /// Mark an open obligation settled in `party`'s records
    ///
    /// Returns `false` when the obligation is unknown or not open.
    fn mark_settled(&self, party: &PartyId, id: &ObligationId) -> Result<bool, CollaboratorError>;

    fn mark_cancelled(&self, party: &PartyId, id: &ObligationId) -> Result<bool, CollaboratorError>;
}

/// Cash held by each party
pub trait CashLedger: Send + Sync {
    fn cash_balance(&self, party: &PartyId, currency: &Currency) -> Result<Amount, CollaboratorError>;

    /// Fresh anonymous key under which `party` can receive cash
    fn issue_certificate(&self, party: &PartyId) -> Result<PaymentCertificate, CollaboratorError>;

    /// Select cash owned by `party` covering every `(certificate, amount)`
    fn generate_spend(
        &self,
        party: &PartyId,
        currency: &Currency,
        payments: &[(PaymentCertificate, Amount)],
    ) -> Result<CashSpend, CollaboratorError>;

    /// Apply a committed transaction to `party`'s vault
    fn record_transaction(&self, party: &PartyId, tx: &SignedTransaction) -> Result<(), CollaboratorError>;
}

/// Double-spend prevention
pub trait OrderingService: Send + Sync {
    fn submit_transaction(&self, tx: &SignedTransaction) -> Result<OrderingResult, CollaboratorError>;
}

/// Signature scheme over transaction ids
pub trait Signer: Send + Sync {
    fn sign(&self, signer: &EphemeralKey, tx_id: &str) -> Signature;

    fn verify(&self, tx_id: &str, signature: &Signature) -> bool;
}

/// Handles to every collaborator a node needs
#[derive(Clone)]
pub struct Collaborators {
    pub obligations: Arc<dyn ObligationSource>,
    pub cash: Arc<dyn CashLedger>,
    pub ordering: Arc<dyn OrderingService>,
    pub signer: Arc<dyn Signer>,
}

impl Collaborators {
    /// Wire an in-memory ledger (obligations and cash) and ordering service
    pub fn in_memory(ledger: InMemoryLedger, ordering: InMemoryOrderingService) -> Self {
        let ledger = Arc::new(ledger);
        Self {
            obligations: ledger.clone(),
            cash: ledger,
            ordering: Arc::new(ordering),
            signer: Arc::new(DigestSigner),
        }
    }
}
