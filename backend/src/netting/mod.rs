//! Cycle and component netting solver
//!
//! Given the cycles of a component, the obligations still outstanding on each
//! edge, and every party's declared cash limit, the solver decides which
//! obligations cancel against each other and which residual unilateral
//! payments remain.
//!
//! # Critical Invariants
//!
//! 1. **Conservation**: netting moves money between declared limits but never
//!    creates or destroys it (`Σ new_limits == Σ old_limits`)
//! 2. **No partial cycles**: a non-viable cycle leaves every limit untouched
//! 3. **No double settlement**: each obligation id is settled at most once
//!    per run
//! 4. **Integer money**: all arithmetic is exact i64 addition/subtraction

pub mod component;
pub mod cycle_solver;
pub mod payments;
pub mod strategy;

use crate::graph::ObligationsByEdge;
use crate::models::{Amount, EphemeralKey, NettingObligation, ObligationId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

pub use component::ComponentCycleSolver;
pub use cycle_solver::{BalanceCheckedCycleSolver, CycleSolver};
pub use payments::derive_payments;
pub use strategy::{strategy_for, BestEffort, LargestSumOnly, NettingStrategy};

/// Cash limits keyed by ephemeral key; a missing key has limit zero
pub type Limits = BTreeMap<EphemeralKey, Amount>;

/// Errors raised by the solver
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NettingError {
    #[error("No netting possible: no viable cycle under current limits")]
    NoNettingPossible,

    #[error("Limits not conserved: {before} before netting, {after} after")]
    ConservationViolated { before: Amount, after: Amount },

    #[error("Obligation {id} settled more than once")]
    DoubleSettlement { id: String },
}

/// Residual unilateral transfer left after in-cycle cancellation
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NettingPayment {
    pub from: EphemeralKey,
    pub to: EphemeralKey,
    pub amount: Amount,
}

/// Outcome of settling one cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleResult {
    /// Obligations cancelled by the cycle
    pub settled: Vec<NettingObligation>,

    /// Limits after the cycle
    pub new_limits: Limits,
}

/// Outcome of netting a whole obligation graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NettingResult {
    /// Settled obligations, sorted by id
    pub settled_obligations: Vec<NettingObligation>,

    pub new_limits: Limits,

    /// Residual payments, sorted by (from, to)
    pub payments: Vec<NettingPayment>,
}

impl NettingResult {
    /// Assemble a result, checking conservation and uniqueness
    pub fn new(
        old_limits: &Limits,
        new_limits: Limits,
        mut settled_obligations: Vec<NettingObligation>,
    ) -> Result<Self, NettingError> {
        let before: Amount = old_limits.values().sum();
        let after: Amount = new_limits.values().sum();
        if before != after {
            return Err(NettingError::ConservationViolated { before, after });
        }

        settled_obligations.sort_by(|a, b| a.id.cmp(&b.id));
        let mut ids: BTreeSet<&ObligationId> = BTreeSet::new();
        for ob in &settled_obligations {
            if !ids.insert(&ob.id) {
                return Err(NettingError::DoubleSettlement { id: ob.id.to_string() });
            }
        }

        let payments = derive_payments(old_limits, &new_limits);
        Ok(Self {
            settled_obligations,
            new_limits,
            payments,
        })
    }

    pub fn settled_value(&self) -> Amount {
        self.settled_obligations.iter().map(|ob| ob.amount).sum()
    }
}

/// Outstanding obligations per edge, plus the zero-weight bridges that may
/// close a cycle without carrying any obligation
#[derive(Debug, Clone, Default)]
pub struct EdgeBook {
    remaining: ObligationsByEdge,
    bridges: BTreeSet<(EphemeralKey, EphemeralKey)>,
}

impl EdgeBook {
    pub fn new(remaining: ObligationsByEdge) -> Self {
        Self {
            remaining,
            bridges: BTreeSet::new(),
        }
    }

    pub fn with_bridges(mut self, bridges: impl IntoIterator<Item = (EphemeralKey, EphemeralKey)>) -> Self {
        self.bridges.extend(bridges);
        self
    }

    /// Amount outstanding on `from → to`
    ///
    /// `Some(0)` for a bridge, `None` when the edge is exhausted or absent.
    pub fn amount(&self, from: &EphemeralKey, to: &EphemeralKey) -> Option<Amount> {
        let key = (from.clone(), to.clone());
        match self.remaining.get(&key) {
            Some(obligations) if !obligations.is_empty() => {
                Some(obligations.iter().map(|ob| ob.amount).sum())
            }
            _ if self.bridges.contains(&key) => Some(0),
            _ => None,
        }
    }

    /// Obligations outstanding on `from → to`
    pub fn obligations(&self, from: &EphemeralKey, to: &EphemeralKey) -> &[NettingObligation] {
        self.remaining
            .get(&(from.clone(), to.clone()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// All outstanding obligations, edge by edge
    pub fn outstanding(&self) -> impl Iterator<Item = &NettingObligation> {
        self.remaining.values().flatten()
    }

    /// Remove settled obligations, dropping exhausted edges
    pub fn consume(&mut self, settled: &[NettingObligation]) {
        let ids: BTreeSet<&ObligationId> = settled.iter().map(|ob| &ob.id).collect();
        for obligations in self.remaining.values_mut() {
            obligations.retain(|ob| !ids.contains(&ob.id));
        }
        self.remaining.retain(|_, obligations| !obligations.is_empty());
    }

    pub fn is_empty(&self) -> bool {
        self.remaining.is_empty()
    }
}

/// Limit of a party, zero if it declared none
pub(crate) fn limit_of(limits: &Limits, key: &EphemeralKey) -> Amount {
    limits.get(key).copied().unwrap_or(0)
}

/// Apply `amount` flowing `from → to`
pub(crate) fn transfer(limits: &mut Limits, from: &EphemeralKey, to: &EphemeralKey, amount: Amount) {
    *limits.entry(from.clone()).or_insert(0) -= amount;
    *limits.entry(to.clone()).or_insert(0) += amount;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(entries: &[(&str, Amount)]) -> Limits {
        entries.iter().map(|(k, v)| (EphemeralKey::new(*k), *v)).collect()
    }

    #[test]
    fn test_result_rejects_money_creation() {
        let err = NettingResult::new(&limits(&[("A", 10)]), limits(&[("A", 11)]), vec![]).unwrap_err();
        assert_eq!(err, NettingError::ConservationViolated { before: 10, after: 11 });
    }

    #[test]
    fn test_result_rejects_double_settlement() {
        let ob = NettingObligation::owed("o1", "A", "B", 5);
        let err = NettingResult::new(&Limits::new(), Limits::new(), vec![ob.clone(), ob]).unwrap_err();
        assert_eq!(err, NettingError::DoubleSettlement { id: "o1".to_string() });
    }

    #[test]
    fn test_edge_book_consume_drops_exhausted_edges() {
        let a_b = NettingObligation::owed("o1", "A", "B", 5);
        let mut remaining = ObligationsByEdge::new();
        remaining.insert((EphemeralKey::new("A"), EphemeralKey::new("B")), vec![a_b.clone()]);
        let mut book = EdgeBook::new(remaining).with_bridges([(EphemeralKey::new("B"), EphemeralKey::new("A"))]);

        assert_eq!(book.amount(&"A".into(), &"B".into()), Some(5));
        assert_eq!(book.amount(&"B".into(), &"A".into()), Some(0));

        book.consume(&[a_b]);
        assert_eq!(book.amount(&"A".into(), &"B".into()), None);
        assert!(book.is_empty());
    }
}
