//! Detection round tests
//!
//! Flooded scans over a deterministic network: a single winner under
//! concurrent starts, hop budgets, stale traffic and repeat runs.

use liquidity_savings_core::config::{LsmConfig, NodeConfig};
use liquidity_savings_core::core::ManualClock;
use liquidity_savings_core::models::{Obligation, ObligationId, PartyId};
use liquidity_savings_core::node::{LsmNode, NodeEvent, SimNetwork};
use liquidity_savings_core::protocol::{
    DetectEvent, DetectOutcome, Envelope, Message, ScanData, ScanId, ScanResponse,
};
use liquidity_savings_core::services::{Collaborators, InMemoryLedger, InMemoryOrderingService};
use std::collections::BTreeSet;
use std::sync::Arc;

// ============================================================================
// Test Helpers
// ============================================================================

/// Build a network from `(id, borrower, lender, amount)` and balances
fn network(
    obligations: &[(&str, &str, &str, i64)],
    balances: &[(&str, i64)],
    config: &LsmConfig,
    clock: &ManualClock,
) -> SimNetwork {
    let ledger = InMemoryLedger::new();
    let ordering = InMemoryOrderingService::new();

    let mut parties = BTreeSet::new();
    for (id, borrower, lender, amount) in obligations {
        ledger.issue_obligation(
            Obligation::with_id(
                ObligationId::new(*id),
                PartyId::new(*lender),
                PartyId::new(*borrower),
                *amount,
                config.currency.clone(),
                0,
            )
            .unwrap(),
        );
        parties.insert(PartyId::new(*borrower));
        parties.insert(PartyId::new(*lender));
    }
    for (party, amount) in balances {
        ledger.deposit(&PartyId::new(*party), *amount, &config.currency);
    }

    let mut network = SimNetwork::new();
    for party in parties {
        ledger.add_party(&party);
        let collaborators = Collaborators::in_memory(ledger.clone(), ordering.clone());
        network.add_node(LsmNode::new(
            NodeConfig::new(party),
            config,
            collaborators,
            Arc::new(clock.clone()),
        ));
    }
    network
}

fn triangle(clock: &ManualClock) -> SimNetwork {
    network(
        &[("o1", "A", "B", 100), ("o2", "B", "C", 200), ("o3", "C", "A", 100)],
        &[("A", 1000), ("B", 1500), ("C", 2000)],
        &LsmConfig::default(),
        clock,
    )
}

fn detect_events(network: &mut SimNetwork) -> Vec<(PartyId, DetectEvent)> {
    network
        .take_events()
        .into_iter()
        .filter_map(|(party, event)| match event {
            NodeEvent::Detect(event) => Some((party, event)),
            NodeEvent::Execute(_) => None,
        })
        .collect()
}

fn completed(network: &mut SimNetwork) -> DetectOutcome {
    detect_events(network)
        .into_iter()
        .find_map(|(_, event)| match event {
            DetectEvent::Completed(outcome) => Some(outcome),
            DetectEvent::Superseded { .. } => None,
        })
        .expect("detection should complete")
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_single_source_aggregates_whole_ring() {
    let clock = ManualClock::new(1_000);
    let mut network = triangle(&clock);

    network.start_detect(&"A".into()).unwrap();
    network.run().unwrap();
    let outcome = completed(&mut network);

    assert_eq!(outcome.scan.source.as_str(), "A");
    assert_eq!(outcome.scan.id, ScanId::compute(1_000, &"A".into()));
    assert_eq!(outcome.obligations.len(), 3);
    assert!(outcome.obligations.iter().all(|ob| ob.is_resolved()));

    let mut limits: Vec<i64> = outcome.limits.values().copied().collect();
    limits.sort();
    assert_eq!(limits, vec![1000, 1500, 2000]);
    assert!(outcome.limits.contains_key(&outcome.session_key));
}

#[test]
fn test_concurrent_starts_elect_lowest_scan_id() {
    let clock = ManualClock::new(5_000);
    let mut network = triangle(&clock);
    let parties: Vec<PartyId> = network.parties();

    for party in &parties {
        network.start_detect(party).unwrap();
    }
    network.run().unwrap();

    let winner = parties
        .iter()
        .min_by_key(|party| ScanId::compute(5_000, party))
        .cloned()
        .unwrap();
    let events = detect_events(&mut network);

    let completions: Vec<&PartyId> = events
        .iter()
        .filter(|(_, event)| matches!(event, DetectEvent::Completed(_)))
        .map(|(party, _)| party)
        .collect();
    assert_eq!(completions, vec![&winner]);

    for loser in parties.iter().filter(|party| **party != winner) {
        let superseded = events
            .iter()
            .filter(|(party, event)| party == loser && matches!(event, DetectEvent::Superseded { .. }))
            .count();
        assert_eq!(superseded, 1, "{loser} should be superseded exactly once");
    }

    // Every node ends up holding the winning round
    for party in &parties {
        let held = network.node(party).unwrap().detect().winning().unwrap();
        assert_eq!(held.id, ScanId::compute(5_000, &winner));
    }
}

#[test]
fn test_hop_budget_stops_the_flood() {
    // Ring A → B → C → D → A: C is two hops from A either way
    let config = LsmConfig {
        scan_ttl: 1,
        ..LsmConfig::default()
    };
    let clock = ManualClock::new(0);
    let mut network = network(
        &[("o1", "A", "B", 5), ("o2", "B", "C", 5), ("o3", "C", "D", 5), ("o4", "D", "A", 5)],
        &[("A", 10), ("B", 10), ("C", 10), ("D", 10)],
        &config,
        &clock,
    );

    network.start_detect(&"A".into()).unwrap();
    network.run().unwrap();

    assert!(network
        .log()
        .iter()
        .all(|delivery| !(delivery.kind == "scan_request" && delivery.to.as_str() == "C")));
    assert_eq!(network.count("scan_request"), 2);

    let outcome = completed(&mut network);
    assert_eq!(outcome.obligations.len(), 4);
    let resolved: Vec<&str> = outcome
        .obligations
        .iter()
        .filter(|ob| ob.is_resolved())
        .map(|ob| ob.id.as_str())
        .collect();
    assert_eq!(resolved, vec!["o1", "o4"]);
    assert_eq!(outcome.limits.len(), 3);
}

#[test]
fn test_stale_response_is_discarded() {
    let clock = ManualClock::new(2_000);
    let mut network = triangle(&clock);
    network.start_detect(&"A".into()).unwrap();
    network.run().unwrap();
    completed(&mut network);

    let stale = ScanId::compute(1, &"B".into());
    network.inject(Envelope::new(
        "B".into(),
        "A".into(),
        Message::ScanResponse(ScanResponse::Success {
            id: stale.clone(),
            data: ScanData::default(),
        }),
    ));
    network.inject(Envelope::new(
        "C".into(),
        "A".into(),
        Message::ScanResponse(ScanResponse::Failure {
            id: stale,
            winner: ScanId::compute(0, &"C".into()),
        }),
    ));

    assert_eq!(network.run().unwrap(), 2);
    assert!(network.events().is_empty());
    assert_eq!(
        network.node(&"A".into()).unwrap().detect().winning().unwrap().id,
        ScanId::compute(2_000, &"A".into())
    );
}

#[test]
fn test_repeat_detection_sees_same_obligations() {
    let clock = ManualClock::new(10_000);
    let mut network = triangle(&clock);

    network.start_detect(&"B".into()).unwrap();
    network.run().unwrap();
    let first = completed(&mut network);

    clock.advance(10);
    network.start_detect(&"B".into()).unwrap();
    network.run().unwrap();
    let second = completed(&mut network);

    assert_ne!(first.scan.id, second.scan.id);
    assert_ne!(first.session_key, second.session_key);

    let view = |outcome: &DetectOutcome| -> Vec<(String, i64, bool)> {
        outcome
            .obligations
            .iter()
            .map(|ob| (ob.id.to_string(), ob.amount, ob.is_resolved()))
            .collect()
    };
    assert_eq!(view(&first), view(&second));

    let limits = |outcome: &DetectOutcome| -> Vec<i64> {
        let mut values: Vec<i64> = outcome.limits.values().copied().collect();
        values.sort();
        values
    };
    assert_eq!(limits(&first), limits(&second));
}

#[test]
fn test_party_without_obligations_cannot_start() {
    let clock = ManualClock::new(0);
    let mut network = triangle(&clock);
    let ledger = InMemoryLedger::new();
    ledger.add_party(&"Z".into());
    network.add_node(LsmNode::new(
        NodeConfig::new("Z".into()),
        &LsmConfig::default(),
        Collaborators::in_memory(ledger, InMemoryOrderingService::new()),
        Arc::new(clock.clone()),
    ));

    let err = network.start_detect(&"Z".into()).unwrap_err();
    assert!(err.is_malformed_input());
    assert_eq!(network.pending(), 0);
}

#[test]
fn test_start_defers_to_adopted_lower_round() {
    let clock = ManualClock::new(1_000);
    let mut network = triangle(&clock);
    let (a, b) = (PartyId::new("A"), PartyId::new("B"));
    let held = ScanId::compute(1_000, &a);

    network.start_detect(&a).unwrap();
    while network.node(&b).unwrap().detect().winning().is_none() {
        assert!(network.deliver_one().unwrap(), "A's request should reach B");
    }
    assert_eq!(network.node(&b).unwrap().detect().winning().unwrap().id, held);

    // B starts later with an id that loses to the round it already holds
    let start = (1_001..1_200)
        .find(|t| ScanId::compute(*t, &b) > held)
        .unwrap();
    clock.set(start);
    network.start_detect(&b).unwrap();
    network.run().unwrap();

    let events = detect_events(&mut network);
    let completions: Vec<&PartyId> = events
        .iter()
        .filter(|(_, event)| matches!(event, DetectEvent::Completed(_)))
        .map(|(party, _)| party)
        .collect();
    assert_eq!(completions, vec![&a]);
    assert!(events.iter().any(|(party, event)| {
        party == &b && matches!(event, DetectEvent::Superseded { winner, .. } if winner == &held)
    }));
    assert_eq!(network.node(&b).unwrap().detect().winning().unwrap().id, held);
}
