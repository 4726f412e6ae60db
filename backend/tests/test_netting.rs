//! Netting solver tests
//!
//! Reference scenarios for both strategies, rollback of non-viable cycles,
//! and property tests for conservation and single settlement.

use liquidity_savings_core::config::{NettingConfig, NettingStrategyKind};
use liquidity_savings_core::graph::{Cycle, ObligationGraph};
use liquidity_savings_core::models::{EphemeralKey, NettingObligation};
use liquidity_savings_core::netting::{
    BalanceCheckedCycleSolver, CycleSolver, EdgeBook, Limits, NettingPayment, NettingResult,
};
use liquidity_savings_core::planner::{PlanOutcome, Planner};
use proptest::prelude::*;
use std::collections::BTreeSet;

// ============================================================================
// Test Helpers
// ============================================================================

fn ob(id: &str, borrower: &str, lender: &str, amount: i64) -> NettingObligation {
    NettingObligation::owed(id, borrower, lender, amount)
}

fn limits(entries: &[(&str, i64)]) -> Limits {
    entries.iter().map(|(k, v)| (EphemeralKey::new(*k), *v)).collect()
}

fn payment(from: &str, to: &str, amount: i64) -> NettingPayment {
    NettingPayment {
        from: from.into(),
        to: to.into(),
        amount,
    }
}

fn plan(strategy: NettingStrategyKind, obligations: &[NettingObligation], limits: &Limits) -> PlanOutcome {
    let config = NettingConfig {
        strategy,
        ..NettingConfig::default()
    };
    Planner::new(config).plan_resolved(obligations, limits).unwrap()
}

fn ready(outcome: PlanOutcome) -> NettingResult {
    match outcome {
        PlanOutcome::Ready(result) => result,
        PlanOutcome::Deadlock { reason } => panic!("expected a plan, got deadlock: {reason}"),
    }
}

fn scenario_d() -> (Vec<NettingObligation>, Limits) {
    let obligations = vec![
        ob("d01", "A", "B", 2),
        ob("d02", "B", "C", 3),
        ob("d03", "C", "A", 4),
        ob("d04", "A", "C", 6),
        ob("d05", "C", "D", 1),
        ob("d06", "D", "E", 5),
        ob("d07", "E", "A", 6),
        ob("d08", "B", "A", 50),
        ob("d09", "B", "E", 50),
        ob("d10", "D", "A", 50),
    ];
    let limits = limits(&[("A", 3), ("B", 4), ("C", 5), ("D", 4), ("E", 3)]);
    (obligations, limits)
}

// ============================================================================
// Reference Scenarios
// ============================================================================

#[test]
fn test_scenario_a_balanced_ring_needs_no_cash() {
    let obligations = [ob("a1", "A", "B", 100), ob("a2", "B", "C", 100), ob("a3", "C", "A", 100)];
    let start = limits(&[("A", 1000), ("B", 1500), ("C", 2000)]);

    for strategy in [NettingStrategyKind::BestEffort, NettingStrategyKind::LargestSumOnly] {
        let result = ready(plan(strategy, &obligations, &start));
        assert_eq!(result.settled_obligations.len(), 3, "{strategy:?}");
        assert!(result.payments.is_empty(), "{strategy:?}");
        assert_eq!(result.new_limits, start, "{strategy:?}");
    }
}

#[test]
fn test_scenario_b_unbalanced_ring_leaves_one_payment() {
    let obligations = [ob("b1", "A", "B", 100), ob("b2", "B", "C", 200), ob("b3", "C", "A", 100)];
    let start = limits(&[("A", 1000), ("B", 1500), ("C", 2000)]);

    let result = ready(plan(NettingStrategyKind::BestEffort, &obligations, &start));
    assert_eq!(result.settled_obligations.len(), 3);
    assert_eq!(result.payments, vec![payment("B", "C", 100)]);
    assert_eq!(result.new_limits, limits(&[("A", 1000), ("B", 1400), ("C", 2100)]));
}

#[test]
fn test_scenario_c_bilateral_offset_with_zero_limits() {
    let start = limits(&[("A", 0), ("B", 0)]);

    let even = ready(plan(
        NettingStrategyKind::BestEffort,
        &[ob("c1", "A", "B", 2), ob("c2", "B", "A", 2)],
        &start,
    ));
    assert_eq!(even.settled_obligations.len(), 2);
    assert!(even.payments.is_empty());

    let uneven = plan(
        NettingStrategyKind::BestEffort,
        &[ob("c1", "A", "B", 5), ob("c2", "B", "A", 2)],
        &start,
    );
    assert!(uneven.is_deadlock());
}

#[test]
fn test_scenario_d_five_party_best_effort() {
    let (obligations, start) = scenario_d();
    let result = ready(plan(NettingStrategyKind::BestEffort, &obligations, &start));

    let settled: Vec<&str> = result.settled_obligations.iter().map(|ob| ob.id.as_str()).collect();
    assert_eq!(settled, vec!["d01", "d02", "d03", "d04", "d05", "d06", "d07"]);
    assert_eq!(
        result.new_limits,
        limits(&[("A", 5), ("B", 3), ("C", 9), ("D", 0), ("E", 2)])
    );
    assert_eq!(
        result.payments,
        vec![payment("B", "A", 1), payment("D", "C", 4), payment("E", "A", 1)]
    );
    assert_eq!(result.settled_value(), 27);
}

#[test]
fn test_largest_sum_only_settles_at_most_one_cycle_per_component() {
    // Two disjoint-value cycles through A: A-B (2) and A-C (10), no mop-up
    // possible with zero limits
    let obligations = [
        ob("x1", "A", "B", 1),
        ob("x2", "B", "A", 1),
        ob("x3", "A", "C", 5),
        ob("x4", "C", "A", 5),
    ];
    let start = limits(&[("A", 0), ("B", 0), ("C", 0)]);

    let best = ready(plan(NettingStrategyKind::BestEffort, &obligations, &start));
    assert_eq!(best.settled_obligations.len(), 4);

    let largest = ready(plan(NettingStrategyKind::LargestSumOnly, &obligations, &start));
    let ids: Vec<&str> = largest.settled_obligations.iter().map(|ob| ob.id.as_str()).collect();
    assert_eq!(ids, vec!["x3", "x4"]);
}

// ============================================================================
// Rollback
// ============================================================================

#[test]
fn test_non_viable_cycle_leaves_limits_untouched() {
    // C cannot cover its 50 outgoing from limit 1 plus 10 incoming
    let graph = ObligationGraph::build(&[ob("r1", "A", "B", 10), ob("r2", "B", "C", 10), ob("r3", "C", "A", 50)])
        .unwrap();
    let book = EdgeBook::new(graph.obligations_by_edge());
    let start = limits(&[("A", 100), ("B", 0), ("C", 1)]);
    let cycle = Cycle::from_open(vec!["A".into(), "B".into(), "C".into()]);

    assert!(BalanceCheckedCycleSolver.solve_cycle(&cycle, &book, &start).is_none());
    assert_eq!(start, limits(&[("A", 100), ("B", 0), ("C", 1)]));

    // Nothing else can settle either
    let outcome = plan(
        NettingStrategyKind::BestEffort,
        &[ob("r1", "A", "B", 10), ob("r2", "B", "C", 10), ob("r3", "C", "A", 50)],
        &start,
    );
    assert!(outcome.is_deadlock());
}

#[test]
fn test_planning_is_deterministic() {
    let (obligations, start) = scenario_d();
    let first = plan(NettingStrategyKind::BestEffort, &obligations, &start);

    let mut shuffled = obligations.clone();
    shuffled.reverse();
    let second = plan(NettingStrategyKind::BestEffort, &shuffled, &start);
    assert_eq!(first, second);
}

// ============================================================================
// Properties
// ============================================================================

const PARTIES: [&str; 5] = ["A", "B", "C", "D", "E"];

fn arb_obligations() -> impl Strategy<Value = Vec<NettingObligation>> {
    prop::collection::vec((0usize..5, 1usize..5, 1i64..60), 1..14).prop_map(|edges| {
        edges
            .into_iter()
            .enumerate()
            .map(|(i, (from, offset, amount))| {
                let to = (from + offset) % PARTIES.len();
                ob(&format!("p{i:02}"), PARTIES[from], PARTIES[to], amount)
            })
            .collect()
    })
}

fn arb_limits() -> impl Strategy<Value = Limits> {
    prop::collection::vec(0i64..80, PARTIES.len()).prop_map(|amounts| {
        PARTIES
            .iter()
            .zip(amounts)
            .map(|(party, amount)| (EphemeralKey::new(*party), amount))
            .collect()
    })
}

fn arb_strategy() -> impl Strategy<Value = NettingStrategyKind> {
    prop_oneof![
        Just(NettingStrategyKind::BestEffort),
        Just(NettingStrategyKind::LargestSumOnly),
    ]
}

proptest! {
    #[test]
    fn prop_netting_conserves_limits(
        obligations in arb_obligations(),
        start in arb_limits(),
        strategy in arb_strategy(),
    ) {
        if let PlanOutcome::Ready(result) = plan(strategy, &obligations, &start) {
            let before: i64 = start.values().sum();
            let after: i64 = result.new_limits.values().sum();
            prop_assert_eq!(before, after);
            prop_assert!(result.new_limits.values().all(|limit| *limit >= 0));

            let paid: i64 = result.payments.iter().map(|p| p.amount).sum();
            let received: i64 = result
                .new_limits
                .iter()
                .map(|(key, after)| (after - start.get(key).copied().unwrap_or(0)).max(0))
                .sum();
            prop_assert_eq!(paid, received);
        }
    }

    #[test]
    fn prop_no_obligation_settles_twice(
        obligations in arb_obligations(),
        start in arb_limits(),
        strategy in arb_strategy(),
    ) {
        if let PlanOutcome::Ready(result) = plan(strategy, &obligations, &start) {
            let ids: BTreeSet<_> = result.settled_obligations.iter().map(|ob| ob.id.clone()).collect();
            prop_assert_eq!(ids.len(), result.settled_obligations.len());

            let known: BTreeSet<_> = obligations.iter().map(|ob| ob.id.clone()).collect();
            prop_assert!(ids.is_subset(&known));
        }
    }
}
