//! In-memory ordering service
//!
//! Accepts a transaction only if none of its inputs were consumed before and
//! every required signer has signed. Acceptance marks all inputs consumed in
//! one step, so two transactions sharing an input can never both commit.

use super::{CollaboratorError, OrderingService, Signer};
use crate::models::{OrderingResult, SignedTransaction, StateRef, TransactionId};
use crate::services::DigestSigner;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

#[derive(Debug, Default)]
struct Registry {
    consumed: BTreeSet<StateRef>,
    committed: Vec<TransactionId>,
}

/// Consumed-state registry shared by every node
#[derive(Debug, Clone, Default)]
pub struct InMemoryOrderingService {
    registry: Arc<Mutex<Registry>>,
    signer: DigestSigner,
}

impl InMemoryOrderingService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a state consumed outside any transaction
    pub fn consume(&self, state: StateRef) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.consumed.insert(state);
        }
    }

    pub fn is_consumed(&self, state: &StateRef) -> bool {
        self.registry
            .lock()
            .map(|registry| registry.consumed.contains(state))
            .unwrap_or(false)
    }

    pub fn committed(&self) -> Vec<TransactionId> {
        self.registry
            .lock()
            .map(|registry| registry.committed.clone())
            .unwrap_or_default()
    }
}

impl OrderingService for InMemoryOrderingService {
    fn submit_transaction(&self, tx: &SignedTransaction) -> Result<OrderingResult, CollaboratorError> {
        let missing = tx.missing_signers();
        if !missing.is_empty() {
            warn!(tx_id = %tx.tx.id, missing = missing.len(), "rejecting under-signed transaction");
            return Ok(OrderingResult::Rejected {
                reason: format!("missing {} signature(s)", missing.len()),
            });
        }
        if let Some(bad) = tx.signatures.iter().find(|s| !self.signer.verify(tx.tx.id.as_str(), s)) {
            return Ok(OrderingResult::Rejected {
                reason: format!("invalid signature from {}", bad.signer),
            });
        }

        let mut registry = self
            .registry
            .lock()
            .map_err(|_| CollaboratorError::Unavailable("ordering registry lock poisoned".to_string()))?;

        let inputs = tx.tx.input_refs();
        if let Some(spent) = inputs.iter().find(|state| registry.consumed.contains(state)) {
            warn!(tx_id = %tx.tx.id, state = %spent, "double spend rejected");
            return Ok(OrderingResult::Rejected {
                reason: format!("input {spent} already consumed"),
            });
        }

        registry.consumed.extend(inputs);
        registry.committed.push(tx.tx.id.clone());
        info!(tx_id = %tx.tx.id, "transaction committed");
        Ok(OrderingResult::Committed)
    }
}
