//! Scenario files
//!
//! A scenario describes a closed network: its parties with opening cash,
//! their bilateral obligations, and the run configuration.
//!
//! ```json
//! {
//!   "config": { "currency": "USD", "netting": { "strategy": "best_effort" } },
//!   "parties": [ { "party": "A", "balance": 1000 }, { "party": "B", "balance": 0 } ],
//!   "obligations": [ { "id": "o1", "borrower": "A", "lender": "B", "amount": 100 } ]
//! }
//! ```

use liquidity_savings_core::config::{ConfigError, LsmConfig, NodeConfig};
use liquidity_savings_core::core::Clock;
use liquidity_savings_core::models::{Amount, Obligation, ObligationError, ObligationId, PartyId};
use liquidity_savings_core::node::LsmNode;
use liquidity_savings_core::services::{Collaborators, InMemoryLedger, InMemoryOrderingService};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("Failed to read scenario {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse scenario: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Obligation {id}: {source}")]
    Obligation {
        id: String,
        #[source]
        source: ObligationError,
    },

    #[error("Obligation {id} names unknown party {party}")]
    UnknownParty { id: String, party: String },

    #[error("Party {0} is listed twice")]
    DuplicateParty(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct PartySpec {
    pub party: PartyId,
    #[serde(default)]
    pub balance: Amount,
    #[serde(default)]
    pub max_pledge: Option<Amount>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObligationSpec {
    pub id: ObligationId,
    pub borrower: PartyId,
    pub lender: PartyId,
    pub amount: Amount,
    #[serde(default)]
    pub issue_date: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub config: LsmConfig,
    pub parties: Vec<PartySpec>,
    pub obligations: Vec<ObligationSpec>,
}

/// A loaded scenario: shared in-memory collaborators plus one node per party
pub struct Network {
    pub ledger: InMemoryLedger,
    pub ordering: InMemoryOrderingService,
    pub nodes: Vec<LsmNode>,
}

impl Scenario {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ScenarioError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ScenarioError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let scenario: Scenario = serde_json::from_str(&contents)?;
        scenario.config.validate()?;
        Ok(scenario)
    }

    /// Issue every obligation, fund every party and build their nodes
    pub fn build(&self, clock: Arc<dyn Clock>) -> Result<Network, ScenarioError> {
        let currency = &self.config.currency;
        let ledger = InMemoryLedger::new();
        let ordering = InMemoryOrderingService::new();

        let mut known = BTreeSet::new();
        for spec in &self.parties {
            if !known.insert(spec.party.clone()) {
                return Err(ScenarioError::DuplicateParty(spec.party.to_string()));
            }
            ledger.add_party(&spec.party);
            if spec.balance > 0 {
                ledger.deposit(&spec.party, spec.balance, currency);
            }
        }

        for spec in &self.obligations {
            for party in [&spec.borrower, &spec.lender] {
                if !known.contains(party) {
                    return Err(ScenarioError::UnknownParty {
                        id: spec.id.to_string(),
                        party: party.to_string(),
                    });
                }
            }
            let obligation = Obligation::with_id(
                spec.id.clone(),
                spec.lender.clone(),
                spec.borrower.clone(),
                spec.amount,
                currency.clone(),
                spec.issue_date,
            )
            .map_err(|source| ScenarioError::Obligation {
                id: spec.id.to_string(),
                source,
            })?;
            ledger.issue_obligation(obligation);
        }

        let nodes = self
            .parties
            .iter()
            .map(|spec| {
                let node = NodeConfig {
                    party: spec.party.clone(),
                    max_pledge: spec.max_pledge,
                };
                LsmNode::new(
                    node,
                    &self.config,
                    Collaborators::in_memory(ledger.clone(), ordering.clone()),
                    clock.clone(),
                )
            })
            .collect();

        Ok(Network {
            ledger,
            ordering,
            nodes,
        })
    }
}
