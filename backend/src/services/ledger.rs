//! In-memory obligation and cash ledger
//!
//! Each party owns a vault holding its copy of every bilateral obligation it
//! is a side of, the cash states it owns, and the keys it can receive cash
//! under. Handles are cheap clones sharing one store.
//!
//! # Critical Invariants
//!
//! 1. **Bilateral copies**: issuing an obligation places it in both parties'
//!    vaults, and each side marks its own copy
//! 2. **Cash conservation**: a spend's inputs always equal its outputs
//!    (payments plus change)

use super::{CashLedger, CollaboratorError, ObligationSource};
use crate::models::{
    Amount, CashSpend, CashState, CashStateId, Currency, EphemeralKey, Obligation, ObligationId,
    ObligationStatus, PartyId, PaymentCertificate, SignedTransaction, TransactionId,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Vault {
    obligations: BTreeMap<ObligationId, (Obligation, ObligationStatus)>,
    cash: BTreeMap<CashStateId, CashState>,
    keys: BTreeSet<EphemeralKey>,
    transactions: Vec<TransactionId>,
}

/// Shared in-memory vaults, one per party
///
/// # Example
/// ```
/// use liquidity_savings_core::models::{Obligation, PartyId};
/// use liquidity_savings_core::services::{CashLedger, InMemoryLedger, ObligationSource};
///
/// let ledger = InMemoryLedger::new();
/// let (a, b) = (PartyId::new("BANK_A"), PartyId::new("BANK_B"));
/// ledger.deposit(&a, 500, &"USD".into());
/// ledger.issue_obligation(Obligation::new(b.clone(), a.clone(), 100, "USD".into(), 0).unwrap());
///
/// assert_eq!(ledger.cash_balance(&a, &"USD".into()).unwrap(), 500);
/// assert_eq!(ledger.obligations_of(&b).unwrap().len(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedger {
    vaults: Arc<Mutex<BTreeMap<PartyId, Vault>>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<PartyId, Vault>>, CollaboratorError> {
        self.vaults
            .lock()
            .map_err(|_| CollaboratorError::Unavailable("ledger lock poisoned".to_string()))
    }

    /// Register a party with an empty vault
    pub fn add_party(&self, party: &PartyId) {
        if let Ok(mut vaults) = self.lock() {
            vaults.entry(party.clone()).or_default();
        }
    }

    /// Record an open obligation in both parties' vaults
    pub fn issue_obligation(&self, obligation: Obligation) {
        if let Ok(mut vaults) = self.lock() {
            for party in [obligation.lender().clone(), obligation.borrower().clone()] {
                vaults
                    .entry(party)
                    .or_default()
                    .obligations
                    .insert(obligation.id().clone(), (obligation.clone(), ObligationStatus::Open));
            }
        }
    }

    /// Credit `party` with a new cash state
    pub fn deposit(&self, party: &PartyId, amount: Amount, currency: &Currency) -> Option<CashStateId> {
        let mut vaults = self.lock().ok()?;
        let vault = vaults.entry(party.clone()).or_default();
        let owner = EphemeralKey::generate();
        vault.keys.insert(owner.clone());
        let state = CashState::new(owner, amount, currency.clone());
        let id = state.id.clone();
        vault.cash.insert(id.clone(), state);
        Some(id)
    }

    /// Status of `party`'s copy of an obligation
    pub fn status_of(&self, party: &PartyId, id: &ObligationId) -> Option<ObligationStatus> {
        let vaults = self.lock().ok()?;
        vaults.get(party)?.obligations.get(id).map(|(_, status)| *status)
    }

    /// Transactions recorded in `party`'s vault, in commit order
    pub fn recorded_transactions(&self, party: &PartyId) -> Vec<TransactionId> {
        self.lock()
            .ok()
            .and_then(|vaults| vaults.get(party).map(|v| v.transactions.clone()))
            .unwrap_or_default()
    }

    pub fn parties(&self) -> Vec<PartyId> {
        self.lock()
            .map(|vaults| vaults.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn set_status(
        &self,
        party: &PartyId,
        id: &ObligationId,
        status: ObligationStatus,
    ) -> Result<bool, CollaboratorError> {
        let mut vaults = self.lock()?;
        let vault = vaults
            .get_mut(party)
            .ok_or_else(|| CollaboratorError::UnknownParty(party.to_string()))?;
        match vault.obligations.get_mut(id) {
            Some((_, current)) if *current == ObligationStatus::Open => {
                *current = status;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

impl ObligationSource for InMemoryLedger {
    fn obligations_of(&self, party: &PartyId) -> Result<Vec<Obligation>, CollaboratorError> {
        let vaults = self.lock()?;
        let vault = vaults
            .get(party)
            .ok_or_else(|| CollaboratorError::UnknownParty(party.to_string()))?;
        Ok(vault
            .obligations
            .values()
            .filter(|(_, status)| *status == ObligationStatus::Open)
            .map(|(ob, _)| ob.clone())
            .collect())
    }

    fn mark_settled(&self, party: &PartyId, id: &ObligationId) -> Result<bool, CollaboratorError> {
        self.set_status(party, id, ObligationStatus::Settled)
    }

    fn mark_cancelled(&self, party: &PartyId, id: &ObligationId) -> Result<bool, CollaboratorError> {
        self.set_status(party, id, ObligationStatus::Cancelled)
    }
}

impl CashLedger for InMemoryLedger {
    fn cash_balance(&self, party: &PartyId, currency: &Currency) -> Result<Amount, CollaboratorError> {
        let vaults = self.lock()?;
        let vault = vaults
            .get(party)
            .ok_or_else(|| CollaboratorError::UnknownParty(party.to_string()))?;
        Ok(vault
            .cash
            .values()
            .filter(|s| &s.currency == currency)
            .map(|s| s.amount)
            .sum())
    }

    fn issue_certificate(&self, party: &PartyId) -> Result<PaymentCertificate, CollaboratorError> {
        let mut vaults = self.lock()?;
        let vault = vaults
            .get_mut(party)
            .ok_or_else(|| CollaboratorError::UnknownParty(party.to_string()))?;
        let key = EphemeralKey::generate();
        vault.keys.insert(key.clone());
        Ok(PaymentCertificate { key })
    }

    fn generate_spend(
        &self,
        party: &PartyId,
        currency: &Currency,
        payments: &[(PaymentCertificate, Amount)],
    ) -> Result<CashSpend, CollaboratorError> {
        let needed: Amount = payments.iter().map(|(_, amount)| amount).sum();
        if needed == 0 {
            return Ok(CashSpend::default());
        }

        let mut vaults = self.lock()?;
        let vault = vaults
            .get_mut(party)
            .ok_or_else(|| CollaboratorError::UnknownParty(party.to_string()))?;

        let mut inputs = Vec::new();
        let mut gathered: Amount = 0;
        for state in vault.cash.values().filter(|s| &s.currency == currency) {
            if gathered >= needed {
                break;
            }
            gathered += state.amount;
            inputs.push(state.clone());
        }
        if gathered < needed {
            return Err(CollaboratorError::InsufficientFunds {
                party: party.to_string(),
                needed,
                available: gathered,
            });
        }

        let mut outputs: Vec<CashState> = payments
            .iter()
            .map(|(certificate, amount)| CashState::new(certificate.key.clone(), *amount, currency.clone()))
            .collect();
        if gathered > needed {
            let change_key = EphemeralKey::generate();
            vault.keys.insert(change_key.clone());
            outputs.push(CashState::new(change_key, gathered - needed, currency.clone()));
        }

        Ok(CashSpend { inputs, outputs })
    }

    fn record_transaction(&self, party: &PartyId, tx: &SignedTransaction) -> Result<(), CollaboratorError> {
        let mut vaults = self.lock()?;
        let vault = vaults
            .get_mut(party)
            .ok_or_else(|| CollaboratorError::UnknownParty(party.to_string()))?;
        if vault.transactions.contains(&tx.tx.id) {
            return Ok(());
        }

        for input in &tx.tx.cash_inputs {
            vault.cash.remove(&input.id);
        }
        for output in &tx.tx.cash_outputs {
            if vault.keys.contains(&output.owner) {
                vault.cash.insert(output.id.clone(), output.clone());
            }
        }
        vault.transactions.push(tx.tx.id.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SettlementTransaction;

    fn usd() -> Currency {
        Currency::new("USD")
    }

    #[test]
    fn test_spend_returns_change_to_payer() {
        let ledger = InMemoryLedger::new();
        let (a, b) = (PartyId::new("A"), PartyId::new("B"));
        ledger.deposit(&a, 70, &usd());
        ledger.deposit(&a, 50, &usd());
        ledger.add_party(&b);

        let certificate = ledger.issue_certificate(&b).unwrap();
        let spend = ledger.generate_spend(&a, &usd(), &[(certificate, 90)]).unwrap();
        assert_eq!(spend.input_total(), 120);
        assert_eq!(spend.output_total(), 120);

        let tx = SettlementTransaction::build(usd(), vec!["o1".into()], &[spend], BTreeSet::new()).unwrap();
        let signed = SignedTransaction::new(tx);
        ledger.record_transaction(&a, &signed).unwrap();
        ledger.record_transaction(&b, &signed).unwrap();

        assert_eq!(ledger.cash_balance(&a, &usd()).unwrap(), 30);
        assert_eq!(ledger.cash_balance(&b, &usd()).unwrap(), 90);
    }

    #[test]
    fn test_spend_fails_without_funds() {
        let ledger = InMemoryLedger::new();
        let a = PartyId::new("A");
        ledger.deposit(&a, 10, &usd());
        let certificate = ledger.issue_certificate(&a).unwrap();

        let err = ledger.generate_spend(&a, &usd(), &[(certificate, 11)]).unwrap_err();
        assert_eq!(
            err,
            CollaboratorError::InsufficientFunds {
                party: "A".to_string(),
                needed: 11,
                available: 10,
            }
        );
    }

    #[test]
    fn test_mark_settled_only_once() {
        let ledger = InMemoryLedger::new();
        let (a, b) = (PartyId::new("A"), PartyId::new("B"));
        let ob = Obligation::new(b.clone(), a.clone(), 10, usd(), 0).unwrap();
        let id = ob.id().clone();
        ledger.issue_obligation(ob);

        assert!(ledger.mark_settled(&a, &id).unwrap());
        assert!(!ledger.mark_settled(&a, &id).unwrap());
        // B's copy is independent
        assert_eq!(ledger.status_of(&b, &id), Some(ObligationStatus::Open));
        assert!(ledger.obligations_of(&a).unwrap().is_empty());
    }
}
