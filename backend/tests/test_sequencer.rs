//! Run sequencer tests
//!
//! Whole Detect → Plan → Execute runs, over the deterministic network and
//! over tokio tasks.

use liquidity_savings_core::config::{LsmConfig, NodeConfig};
use liquidity_savings_core::core::{ManualClock, SystemClock};
use liquidity_savings_core::error::LsmError;
use liquidity_savings_core::models::{Obligation, ObligationId, ObligationStatus, PartyId};
use liquidity_savings_core::node::{spawn, InMemoryNetwork, LsmNode, LsmStage, SimNetwork};
use liquidity_savings_core::protocol::ScanId;
use liquidity_savings_core::sequencer::{RunOutcome, RunSequencer};
use liquidity_savings_core::services::{
    CashLedger, Collaborators, InMemoryLedger, InMemoryOrderingService,
};
use std::collections::BTreeSet;
use std::sync::Arc;

// ============================================================================
// Test Helpers
// ============================================================================

/// Ledger holding `(id, borrower, lender, amount)` obligations and balances
fn ledger(obligations: &[(&str, &str, &str, i64)], balances: &[(&str, i64)]) -> (InMemoryLedger, BTreeSet<PartyId>) {
    let ledger = InMemoryLedger::new();
    let mut parties = BTreeSet::new();
    for (id, borrower, lender, amount) in obligations {
        ledger.issue_obligation(
            Obligation::with_id(
                ObligationId::new(*id),
                PartyId::new(*lender),
                PartyId::new(*borrower),
                *amount,
                "USD".into(),
                0,
            )
            .unwrap(),
        );
        parties.insert(PartyId::new(*borrower));
        parties.insert(PartyId::new(*lender));
    }
    for (party, amount) in balances {
        ledger.deposit(&PartyId::new(*party), *amount, &"USD".into());
    }
    for party in &parties {
        ledger.add_party(party);
    }
    (ledger, parties)
}

fn sim(
    obligations: &[(&str, &str, &str, i64)],
    balances: &[(&str, i64)],
    clock: &ManualClock,
) -> (SimNetwork, InMemoryLedger) {
    let (ledger, parties) = ledger(obligations, balances);
    let ordering = InMemoryOrderingService::new();
    let mut network = SimNetwork::new();
    for party in parties {
        network.add_node(LsmNode::new(
            NodeConfig::new(party),
            &LsmConfig::default(),
            Collaborators::in_memory(ledger.clone(), ordering.clone()),
            Arc::new(clock.clone()),
        ));
    }
    (network, ledger)
}

const TRIANGLE: [(&str, &str, &str, i64); 3] = [("o1", "A", "B", 100), ("o2", "B", "C", 200), ("o3", "C", "A", 100)];
const TRIANGLE_CASH: [(&str, i64); 3] = [("A", 1000), ("B", 1500), ("C", 2000)];

// ============================================================================
// Deterministic Runs
// ============================================================================

#[test]
fn test_run_completes_and_leaves_source_complete() {
    let clock = ManualClock::new(1_000);
    let (mut network, ledger) = sim(&TRIANGLE, &TRIANGLE_CASH, &clock);
    let sequencer = RunSequencer::new(LsmConfig::default());

    let outcome = sequencer.run_lsm_sim(&mut network, &"A".into()).unwrap();
    let RunOutcome::Complete { settled, payments, .. } = &outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(settled.len(), 3);
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].amount, 100);

    // Participants follow the ring to completion, not just the source
    for party in ["A", "B", "C"] {
        let status = network.node(&party.into()).unwrap().status();
        assert_eq!(status.stage, LsmStage::Complete, "{party}");
        assert_eq!(status.last_updated, 1_000, "{party}");
    }
    assert_eq!(ledger.cash_balance(&"C".into(), &"USD".into()).unwrap(), 2100);

    // Nothing left to net
    clock.advance(1);
    let err = sequencer.run_lsm_sim(&mut network, &"A".into()).unwrap_err();
    assert!(err.is_malformed_input());
}

#[test]
fn test_deadlock_is_flooded_to_counterparties() {
    let clock = ManualClock::new(1_000);
    // A owes B 5 against B's 2, and nobody has cash; C hangs off B
    let (mut network, ledger) = sim(
        &[("c1", "A", "B", 5), ("c2", "B", "A", 2), ("c3", "C", "B", 1)],
        &[],
        &clock,
    );

    let outcome = RunSequencer::new(LsmConfig::default())
        .run_lsm_sim(&mut network, &"A".into())
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Deadlock { .. }));

    let source = network.node(&"A".into()).unwrap().status();
    assert_eq!(source.stage, LsmStage::Deadlock);
    assert!(source.in_deadlock);
    for party in ["B", "C"] {
        let status = network.node(&party.into()).unwrap().status();
        assert!(status.in_deadlock, "{party} should know about the deadlock");
        assert_eq!(status.deadlock_since, Some(1_000));
    }
    assert_eq!(network.count("deadlock_notice"), 2);
    assert_eq!(ledger.status_of(&"A".into(), &"c1".into()), Some(ObligationStatus::Open));

    // A new round clears the flag wherever it reaches
    clock.advance(100);
    network.start_detect(&"B".into()).unwrap();
    network.run().unwrap();
    for party in ["A", "B", "C"] {
        assert!(!network.node(&party.into()).unwrap().status().in_deadlock, "{party}");
    }
}

#[test]
fn test_losing_source_reports_superseded() {
    let clock = ManualClock::new(7_000);
    let (mut network, _) = sim(&TRIANGLE, &TRIANGLE_CASH, &clock);

    let (a, b) = (PartyId::new("A"), PartyId::new("B"));
    let (winner, loser) = if ScanId::compute(7_000, &a) < ScanId::compute(7_000, &b) {
        (a, b)
    } else {
        (b, a)
    };

    network.start_detect(&winner).unwrap();
    let outcome = RunSequencer::new(LsmConfig::default())
        .run_lsm_sim(&mut network, &loser)
        .unwrap();

    assert_eq!(
        outcome,
        RunOutcome::Superseded {
            winner: ScanId::compute(7_000, &winner)
        }
    );
    assert_eq!(network.node(&loser).unwrap().status().stage, LsmStage::Idle);
}

#[test]
fn test_detection_goes_quiet_when_neighbour_is_offline() {
    let clock = ManualClock::new(1_000);
    let (mut network, _) = sim(&TRIANGLE, &TRIANGLE_CASH, &clock);
    network.set_offline(&"B".into(), true);

    let err = RunSequencer::new(LsmConfig::default())
        .run_lsm_sim(&mut network, &"A".into())
        .unwrap_err();
    assert!(matches!(err, LsmError::Timeout { stage: "detect" }));
    assert_eq!(network.node(&"A".into()).unwrap().status().stage, LsmStage::Idle);
}

// ============================================================================
// Async Runtime
// ============================================================================

#[tokio::test]
async fn test_run_over_tokio_tasks() {
    let (ledger, parties) = ledger(&TRIANGLE, &TRIANGLE_CASH);
    let ordering = InMemoryOrderingService::new();
    let network = InMemoryNetwork::new();
    let config = LsmConfig::default();

    let mut handles = Vec::new();
    for party in parties {
        let node = LsmNode::new(
            NodeConfig::new(party),
            &config,
            Collaborators::in_memory(ledger.clone(), ordering.clone()),
            Arc::new(SystemClock),
        );
        handles.push(spawn(node, &network).unwrap());
    }

    let outcome = RunSequencer::new(config.clone()).run_lsm(&handles[0]).await.unwrap();
    let RunOutcome::Complete { settled, .. } = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(settled.len(), 3);

    assert_eq!(ledger.cash_balance(&"A".into(), &"USD".into()).unwrap(), 1000);
    assert_eq!(ledger.cash_balance(&"B".into(), &"USD".into()).unwrap(), 1400);
    assert_eq!(ledger.cash_balance(&"C".into(), &"USD".into()).unwrap(), 2100);
    assert_eq!(ordering.committed().len(), 1);

    for handle in &handles {
        handle.shutdown();
    }
}

#[tokio::test(start_paused = true)]
async fn test_run_times_out_when_network_is_partitioned() {
    let (ledger, parties) = ledger(&TRIANGLE, &TRIANGLE_CASH);
    let ordering = InMemoryOrderingService::new();
    let network = InMemoryNetwork::new();
    let config = LsmConfig::default();

    let mut handles = Vec::new();
    for party in parties {
        let node = LsmNode::new(
            NodeConfig::new(party),
            &config,
            Collaborators::in_memory(ledger.clone(), ordering.clone()),
            Arc::new(SystemClock),
        );
        handles.push(spawn(node, &network).unwrap());
    }
    network.set_offline(&"C".into(), true).unwrap();

    let err = RunSequencer::new(config).run_lsm(&handles[0]).await.unwrap_err();
    assert!(matches!(err, LsmError::Timeout { stage: "detect" }));
    assert!(ordering.committed().is_empty());
}
