//! Netting strategies
//!
//! Two interchangeable strategies decide how much of a component settles:
//!
//! - [`BestEffort`]: every viable cycle, iterated to a fixed point (default)
//! - [`LargestSumOnly`]: the single highest-value viable cycle, followed by
//!   direct mop-up of obligations a payer can now afford outright

use super::component::ComponentCycleSolver;
use super::cycle_solver::{BalanceCheckedCycleSolver, CycleSolver};
use super::{limit_of, transfer, EdgeBook, Limits};
use crate::config::NettingStrategyKind;
use crate::graph::Cycle;
use crate::models::{Amount, EphemeralKey, NettingObligation};
use std::collections::BTreeSet;
use tracing::debug;

/// Strategy applied to one (possibly extended) component
pub trait NettingStrategy: Send + Sync {
    /// Settle what the strategy can inside `members`
    ///
    /// `book` and `limits` are updated in place; the return value lists the
    /// obligations removed from `book`.
    fn net_component(
        &self,
        members: &BTreeSet<EphemeralKey>,
        cycles: &[Cycle],
        book: &mut EdgeBook,
        limits: &mut Limits,
    ) -> Vec<NettingObligation>;

    fn name(&self) -> &'static str;
}

/// Build the strategy selected in configuration
pub fn strategy_for(kind: NettingStrategyKind) -> Box<dyn NettingStrategy> {
    match kind {
        NettingStrategyKind::BestEffort => Box::new(BestEffort::default()),
        NettingStrategyKind::LargestSumOnly => Box::new(LargestSumOnly::default()),
    }
}

// ============================================================================
// BestEffort
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct BestEffort {
    solver: ComponentCycleSolver<BalanceCheckedCycleSolver>,
}

impl NettingStrategy for BestEffort {
    fn net_component(
        &self,
        _members: &BTreeSet<EphemeralKey>,
        cycles: &[Cycle],
        book: &mut EdgeBook,
        limits: &mut Limits,
    ) -> Vec<NettingObligation> {
        self.solver.solve(cycles, book, limits)
    }

    fn name(&self) -> &'static str {
        "best_effort"
    }
}

// ============================================================================
// LargestSumOnly
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct LargestSumOnly {
    solver: BalanceCheckedCycleSolver,
}

impl LargestSumOnly {
    /// Total outstanding value carried by a cycle's edges
    fn cycle_value(cycle: &Cycle, book: &EdgeBook) -> Amount {
        cycle
            .edges()
            .filter_map(|(from, to)| book.amount(from, to))
            .sum()
    }

    /// Pay off single obligations the payer can now cover from its limit
    fn mop_up(
        members: &BTreeSet<EphemeralKey>,
        book: &mut EdgeBook,
        limits: &mut Limits,
    ) -> Vec<NettingObligation> {
        let mut settled = Vec::new();

        loop {
            let mut candidates: Vec<NettingObligation> = book
                .outstanding()
                .filter(|ob| members.contains(&ob.borrower) && members.contains(&ob.lender))
                .cloned()
                .collect();
            candidates.sort_by(|a, b| b.amount.cmp(&a.amount).then_with(|| a.id.cmp(&b.id)));

            let mut paid = Vec::new();
            for ob in candidates {
                if limit_of(limits, ob.payer()) >= ob.amount {
                    transfer(limits, ob.payer(), ob.payee(), ob.amount);
                    paid.push(ob);
                }
            }

            if paid.is_empty() {
                break;
            }
            debug!(obligations = paid.len(), "mop-up settled obligations directly");
            book.consume(&paid);
            settled.extend(paid);
        }

        settled
    }
}

impl NettingStrategy for LargestSumOnly {
    fn net_component(
        &self,
        members: &BTreeSet<EphemeralKey>,
        cycles: &[Cycle],
        book: &mut EdgeBook,
        limits: &mut Limits,
    ) -> Vec<NettingObligation> {
        let mut ranked: Vec<(Amount, &Cycle)> = cycles
            .iter()
            .map(|cycle| (Self::cycle_value(cycle, book), cycle))
            .collect();
        // Stable: equal values keep the finder's order
        ranked.sort_by(|a, b| b.0.cmp(&a.0));

        let Some(result) = ranked
            .into_iter()
            .find_map(|(_, cycle)| self.solver.solve_cycle(cycle, book, limits))
        else {
            return Vec::new();
        };

        book.consume(&result.settled);
        *limits = result.new_limits;

        let mut settled = result.settled;
        settled.extend(Self::mop_up(members, book, limits));
        settled
    }

    fn name(&self) -> &'static str {
        "largest_sum_only"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ObligationGraph;

    fn limits(entries: &[(&str, Amount)]) -> Limits {
        entries.iter().map(|(k, v)| (EphemeralKey::new(*k), *v)).collect()
    }

    fn cycle(nodes: &[&str]) -> Cycle {
        Cycle::from_open(nodes.iter().map(|n| EphemeralKey::new(*n)).collect())
    }

    fn members(keys: &[&str]) -> BTreeSet<EphemeralKey> {
        keys.iter().map(|k| EphemeralKey::new(*k)).collect()
    }

    #[test]
    fn test_strategy_for_matches_kind() {
        assert_eq!(strategy_for(NettingStrategyKind::BestEffort).name(), "best_effort");
        assert_eq!(strategy_for(NettingStrategyKind::LargestSumOnly).name(), "largest_sum_only");
    }

    #[test]
    fn test_largest_sum_settles_one_cycle_then_mops_up() {
        // Two two-party cycles through A; the A-C cycle is worth more
        let graph = ObligationGraph::build(&[
            NettingObligation::owed("ab", "A", "B", 2),
            NettingObligation::owed("ba", "B", "A", 2),
            NettingObligation::owed("ac", "A", "C", 5),
            NettingObligation::owed("ca", "C", "A", 5),
            NettingObligation::owed("bc", "B", "C", 1),
        ])
        .unwrap();
        let mut book = EdgeBook::new(graph.obligations_by_edge());
        let mut l = limits(&[("A", 0), ("B", 3), ("C", 0)]);

        let settled = LargestSumOnly::default().net_component(
            &members(&["A", "B", "C"]),
            &[cycle(&["A", "B"]), cycle(&["A", "C"])],
            &mut book,
            &mut l,
        );

        let mut ids: Vec<&str> = settled.iter().map(|ob| ob.id.as_str()).collect();
        ids.sort();
        // A-C cycle; B then pays B→A and B→C from its limit of 3, which in
        // turn lets A pay A→B on the next mop-up round
        assert_eq!(ids, vec!["ab", "ac", "ba", "bc", "ca"]);
        assert_eq!(l, limits(&[("A", 0), ("B", 2), ("C", 1)]));
        assert!(book.is_empty());
    }

    #[test]
    fn test_largest_sum_with_no_viable_cycle_settles_nothing() {
        let graph = ObligationGraph::build(&[
            NettingObligation::owed("ab", "A", "B", 5),
            NettingObligation::owed("ba", "B", "A", 2),
        ])
        .unwrap();
        let mut book = EdgeBook::new(graph.obligations_by_edge());
        let mut l = limits(&[("A", 0), ("B", 0)]);

        let settled = LargestSumOnly::default().net_component(
            &members(&["A", "B"]),
            &[cycle(&["A", "B"])],
            &mut book,
            &mut l,
        );
        assert!(settled.is_empty());
        assert_eq!(l, limits(&[("A", 0), ("B", 0)]));
    }
}
