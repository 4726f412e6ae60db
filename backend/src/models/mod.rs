//! Domain models for the liquidity savings mechanism

pub mod obligation;
pub mod party;
pub mod transaction;

// Re-exports
pub use obligation::{
    MaskedObligation, NettingObligation, Obligation, ObligationError, ObligationId,
    ObligationStatus,
};
pub use party::{Amount, CashLimit, Currency, EphemeralKey, PartyId};
pub use transaction::{
    CashSpend, CashState, CashStateId, OrderingResult, PaymentCertificate, SettleCommand,
    SettlementTransaction, Signature, SignedTransaction, StateRef, TransactionError, TransactionId,
};
