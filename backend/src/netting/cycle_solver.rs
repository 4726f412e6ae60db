//! Per-cycle solving
//!
//! A cycle solver is a pure function of `(cycle, outstanding edges, limits)`.
//! It either returns the obligations the cycle cancels together with the
//! limits after cancellation, or `None`. It never mutates its inputs, which
//! is what lets [`ComponentCycleSolver`](super::ComponentCycleSolver) iterate
//! it to a fixed point.

use super::{limit_of, transfer, CycleResult, EdgeBook, Limits};
use crate::graph::Cycle;
use tracing::trace;

/// Attempts to settle a single cycle
pub trait CycleSolver: Send + Sync {
    fn solve_cycle(&self, cycle: &Cycle, book: &EdgeBook, limits: &Limits) -> Option<CycleResult>;
}

/// Balance-constrained cycle settlement
///
/// The cycle is walked from `n0`. For each `(prev, this, next)`:
///
/// ```text
/// viable  ⇔  limit[this] + incoming(prev → this) ≥ outgoing(this → next)
/// ```
///
/// where `limit[this]` is the limit when the attempt began. A viable step
/// settles every obligation on `prev → this` (`limit[prev] -= incoming`,
/// `limit[this] += incoming`) on a working copy of the limits. A single
/// non-viable step rejects the whole cycle and the working copy is dropped,
/// so a rejected attempt never changes any limit.
///
/// # Example
/// ```
/// use liquidity_savings_core::graph::{Cycle, ObligationGraph};
/// use liquidity_savings_core::models::{EphemeralKey, NettingObligation};
/// use liquidity_savings_core::netting::{BalanceCheckedCycleSolver, CycleSolver, EdgeBook, Limits};
///
/// let graph = ObligationGraph::build(&[
///     NettingObligation::owed("o1", "A", "B", 2),
///     NettingObligation::owed("o2", "B", "A", 2),
/// ]).unwrap();
/// let book = EdgeBook::new(graph.obligations_by_edge());
/// let limits: Limits = [("A", 0), ("B", 0)].iter().map(|(k, v)| (EphemeralKey::new(*k), *v)).collect();
///
/// let cycle = Cycle::from_open(vec!["A".into(), "B".into()]);
/// let result = BalanceCheckedCycleSolver.solve_cycle(&cycle, &book, &limits).unwrap();
/// assert_eq!(result.settled.len(), 2);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct BalanceCheckedCycleSolver;

impl CycleSolver for BalanceCheckedCycleSolver {
    fn solve_cycle(&self, cycle: &Cycle, book: &EdgeBook, limits: &Limits) -> Option<CycleResult> {
        if cycle.len() < 2 {
            return None;
        }

        let mut working = limits.clone();
        let mut settled = Vec::new();

        for (prev, this, next) in cycle.walk() {
            // An exhausted edge means the cycle no longer exists
            let incoming = book.amount(prev, this)?;
            let outgoing = book.amount(this, next)?;

            if limit_of(limits, this) + incoming < outgoing {
                trace!(
                    party = %this,
                    incoming,
                    outgoing,
                    limit = limit_of(limits, this),
                    "cycle not viable, rolling back"
                );
                return None;
            }

            transfer(&mut working, prev, this, incoming);
            settled.extend(book.obligations(prev, this).iter().cloned());
        }

        // A cycle made only of bridges settles nothing
        if settled.is_empty() {
            return None;
        }

        Some(CycleResult {
            settled,
            new_limits: working,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ObligationGraph;
    use crate::models::{EphemeralKey, NettingObligation};

    fn limits(entries: &[(&str, i64)]) -> Limits {
        entries.iter().map(|(k, v)| (EphemeralKey::new(*k), *v)).collect()
    }

    fn cycle(nodes: &[&str]) -> Cycle {
        Cycle::from_open(nodes.iter().map(|n| EphemeralKey::new(*n)).collect())
    }

    #[test]
    fn test_exhausted_edge_yields_none() {
        let graph = ObligationGraph::build(&[NettingObligation::owed("o1", "A", "B", 2)]).unwrap();
        let book = EdgeBook::new(graph.obligations_by_edge());
        assert!(BalanceCheckedCycleSolver
            .solve_cycle(&cycle(&["A", "B"]), &book, &limits(&[("A", 100)]))
            .is_none());
    }

    #[test]
    fn test_bridge_cycle_funded_from_limit() {
        // A owes B 5; the bridge B → A carries nothing, so A pays from its limit
        let graph = ObligationGraph::build(&[NettingObligation::owed("o1", "A", "B", 5)]).unwrap();
        let book = EdgeBook::new(graph.obligations_by_edge())
            .with_bridges([(EphemeralKey::new("B"), EphemeralKey::new("A"))]);

        let funded = BalanceCheckedCycleSolver
            .solve_cycle(&cycle(&["A", "B"]), &book, &limits(&[("A", 5)]))
            .unwrap();
        assert_eq!(funded.new_limits, limits(&[("A", 0), ("B", 5)]));

        assert!(BalanceCheckedCycleSolver
            .solve_cycle(&cycle(&["A", "B"]), &book, &limits(&[("A", 4)]))
            .is_none());
    }
}
