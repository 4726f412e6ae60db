//! Obligation model
//!
//! An obligation is a bilateral debt: the borrower owes the lender `amount`.
//! Three views of the same debt exist:
//! - [`Obligation`]: the ledger record, with durable party identities
//! - [`MaskedObligation`]: the detection wire form, where each party fills in
//!   only its own endpoint using its ephemeral key
//! - [`NettingObligation`]: a fully resolved edge of the netting graph, with
//!   both endpoints as ephemeral keys
//!
//! The netting pipeline never mutates an obligation. It only decides which
//! ids belong to the settlement set.
//!
//! CRITICAL: All money values are i64 (minor currency units)

use crate::models::party::{Amount, Currency, EphemeralKey, PartyId};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Globally unique obligation identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObligationId(String);

impl ObligationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObligationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObligationId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Lifecycle status of an obligation as held in a party's ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObligationStatus {
    /// Outstanding and eligible for netting
    Open,

    /// Consumed by a committed settlement transaction
    Settled,

    /// Withdrawn bilaterally
    Cancelled,
}

/// Errors raised when constructing obligation records
#[derive(Debug, Error, PartialEq)]
pub enum ObligationError {
    #[error("Obligation amount must be positive, got {amount}")]
    NonPositiveAmount { amount: Amount },

    #[error("Party {party} cannot owe itself")]
    SelfLoop { party: String },

    #[error("Obligation currency must not be empty")]
    EmptyCurrency,
}

/// Ledger record of a bilateral debt
///
/// # Example
/// ```
/// use liquidity_savings_core::models::{Obligation, PartyId};
///
/// let ob = Obligation::new(
///     PartyId::new("BANK_B"), // lender
///     PartyId::new("BANK_A"), // borrower
///     100_000,
///     "USD".into(),
///     0,
/// )
/// .unwrap();
/// assert_eq!(ob.counterparty(&PartyId::new("BANK_A")), Some(&PartyId::new("BANK_B")));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Obligation {
    id: ObligationId,
    lender: PartyId,
    borrower: PartyId,
    amount: Amount,
    currency: Currency,
    /// Issue time in milliseconds since the epoch
    issue_date: u64,
}

impl Obligation {
    /// Create a new obligation with a generated id
    pub fn new(
        lender: PartyId,
        borrower: PartyId,
        amount: Amount,
        currency: Currency,
        issue_date: u64,
    ) -> Result<Self, ObligationError> {
        Self::with_id(ObligationId::generate(), lender, borrower, amount, currency, issue_date)
    }

    /// Create an obligation with a known id
    pub fn with_id(
        id: ObligationId,
        lender: PartyId,
        borrower: PartyId,
        amount: Amount,
        currency: Currency,
        issue_date: u64,
    ) -> Result<Self, ObligationError> {
        if amount <= 0 {
            return Err(ObligationError::NonPositiveAmount { amount });
        }
        if lender == borrower {
            return Err(ObligationError::SelfLoop {
                party: lender.to_string(),
            });
        }
        if currency.is_empty() {
            return Err(ObligationError::EmptyCurrency);
        }

        Ok(Self {
            id,
            lender,
            borrower,
            amount,
            currency,
            issue_date,
        })
    }

    pub fn id(&self) -> &ObligationId {
        &self.id
    }

    pub fn lender(&self) -> &PartyId {
        &self.lender
    }

    pub fn borrower(&self) -> &PartyId {
        &self.borrower
    }

    pub fn amount(&self) -> Amount {
        self.amount
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    pub fn issue_date(&self) -> u64 {
        self.issue_date
    }

    /// Whether `party` is lender or borrower
    pub fn involves(&self, party: &PartyId) -> bool {
        &self.lender == party || &self.borrower == party
    }

    /// The other side of the obligation, if `party` is one of its sides
    pub fn counterparty(&self, party: &PartyId) -> Option<&PartyId> {
        if &self.lender == party {
            Some(&self.borrower)
        } else if &self.borrower == party {
            Some(&self.lender)
        } else {
            None
        }
    }

    /// Wire view of this obligation as disclosed by `party` under `key`
    ///
    /// Returns `None` if `party` is not a side of the obligation.
    pub fn masked_for(&self, party: &PartyId, key: &EphemeralKey) -> Option<MaskedObligation> {
        let mut masked = MaskedObligation {
            id: self.id.clone(),
            amount: self.amount,
            issue_date: self.issue_date,
            lender: None,
            borrower: None,
        };
        if &self.lender == party {
            masked.lender = Some(key.clone());
        } else if &self.borrower == party {
            masked.borrower = Some(key.clone());
        } else {
            return None;
        }
        Some(masked)
    }
}

/// Detection wire form of an obligation
///
/// Each side discloses only its own endpoint. Merging the two disclosures of
/// the same id yields a fully resolved [`NettingObligation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskedObligation {
    pub id: ObligationId,
    pub amount: Amount,
    pub issue_date: u64,
    pub lender: Option<EphemeralKey>,
    pub borrower: Option<EphemeralKey>,
}

impl MaskedObligation {
    /// Fill endpoints missing here from another disclosure of the same id
    pub fn merge(&mut self, other: &MaskedObligation) {
        debug_assert_eq!(self.id, other.id, "merging disclosures of different obligations");
        if self.lender.is_none() {
            self.lender = other.lender.clone();
        }
        if self.borrower.is_none() {
            self.borrower = other.borrower.clone();
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.lender.is_some() && self.borrower.is_some()
    }

    /// Netting edge, once both sides have disclosed
    ///
    /// Disclosures arrive over the wire, so the amount is checked again here.
    pub fn resolve(&self) -> Result<Option<NettingObligation>, ObligationError> {
        if self.amount <= 0 {
            return Err(ObligationError::NonPositiveAmount { amount: self.amount });
        }
        Ok(match (&self.lender, &self.borrower) {
            (Some(lender), Some(borrower)) => Some(NettingObligation {
                id: self.id.clone(),
                lender: lender.clone(),
                borrower: borrower.clone(),
                amount: self.amount,
                issue_date: self.issue_date,
            }),
            _ => None,
        })
    }
}

/// Fully resolved obligation between two ephemeral keys
///
/// In the netting graph this is an edge borrower → lender, i.e. the
/// direction in which cash would flow.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NettingObligation {
    pub id: ObligationId,
    pub lender: EphemeralKey,
    pub borrower: EphemeralKey,
    pub amount: Amount,
    pub issue_date: u64,
}

impl NettingObligation {
    /// `borrower` owes `lender` the given amount
    ///
    /// # Example
    /// ```
    /// use liquidity_savings_core::models::NettingObligation;
    ///
    /// // A owes B 100: cash would flow A → B
    /// let ob = NettingObligation::owed("o1", "A", "B", 100);
    /// assert_eq!(ob.payer().as_str(), "A");
    /// assert_eq!(ob.payee().as_str(), "B");
    /// ```
    pub fn owed(
        id: impl Into<String>,
        borrower: impl Into<String>,
        lender: impl Into<String>,
        amount: Amount,
    ) -> Self {
        Self {
            id: ObligationId::new(id),
            lender: EphemeralKey::new(lender),
            borrower: EphemeralKey::new(borrower),
            amount,
            issue_date: 0,
        }
    }

    /// Party the cash flows from
    pub fn payer(&self) -> &EphemeralKey {
        &self.borrower
    }

    /// Party the cash flows to
    pub fn payee(&self) -> &EphemeralKey {
        &self.lender
    }
}
