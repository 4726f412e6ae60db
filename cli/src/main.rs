//! Liquidity Savings CLI
//!
//! Loads a scenario, runs one Detect → Plan → Execute round from a chosen
//! source node and prints the outcome with the closing balances as JSON.
//!
//! Nodes run as tokio tasks by default; `--deterministic` delivers every
//! message synchronously in FIFO order under a fixed clock instead.

mod scenario;

use clap::Parser;
use liquidity_savings_core::core::{Clock, ManualClock, SystemClock};
use liquidity_savings_core::models::{Amount, PartyId};
use liquidity_savings_core::node::{spawn, InMemoryNetwork, SimNetwork};
use liquidity_savings_core::services::CashLedger;
use liquidity_savings_core::{LsmError, RunOutcome, RunSequencer};
use scenario::{Network, Scenario, ScenarioError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "liquidity-savings-cli")]
#[command(about = "Run one liquidity savings round over a scenario file")]
struct Cli {
    /// Path to a scenario JSON file
    scenario: PathBuf,

    /// Party that starts the round (defaults to the first listed party)
    #[arg(long)]
    source: Option<PartyId>,

    /// Deliver messages synchronously under a fixed clock
    #[arg(long)]
    deterministic: bool,

    /// Start time for the fixed clock, in milliseconds
    #[arg(long, default_value = "0", requires = "deterministic")]
    start_time: u64,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Scenario(#[from] ScenarioError),

    #[error(transparent)]
    Lsm(#[from] LsmError),

    #[error("Scenario has no parties")]
    NoParties,

    #[error("Unknown source party {0}")]
    UnknownSource(String),

    #[error("Failed to encode report: {0}")]
    Encode(#[from] serde_json::Error),
}

/// What the binary prints
#[derive(Debug, Serialize)]
struct Report {
    source: PartyId,
    #[serde(flatten)]
    outcome: RunOutcome,
    balances: BTreeMap<PartyId, Amount>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "liquidity_savings_core=info,liquidity_savings_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(report) => println!("{report}"),
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<String, CliError> {
    info!(path = %cli.scenario.display(), "loading scenario");
    let scenario = Scenario::from_file(&cli.scenario)?;
    let source = match cli.source {
        Some(source) => source,
        None => scenario
            .parties
            .first()
            .map(|spec| spec.party.clone())
            .ok_or(CliError::NoParties)?,
    };
    if !scenario.parties.iter().any(|spec| spec.party == source) {
        return Err(CliError::UnknownSource(source.to_string()));
    }

    let sequencer = RunSequencer::new(scenario.config.clone());
    let (outcome, network) = if cli.deterministic {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(cli.start_time));
        let network = scenario.build(clock)?;
        run_deterministic(&sequencer, network, &source)?
    } else {
        let network = scenario.build(Arc::new(SystemClock))?;
        run_async(&sequencer, network, &source).await?
    };

    let currency = &scenario.config.currency;
    let mut balances = BTreeMap::new();
    for spec in &scenario.parties {
        let balance = network
            .ledger
            .cash_balance(&spec.party, currency)
            .map_err(LsmError::from)?;
        balances.insert(spec.party.clone(), balance);
    }

    let report = Report {
        source,
        outcome,
        balances,
    };
    Ok(serde_json::to_string_pretty(&report)?)
}

fn run_deterministic(
    sequencer: &RunSequencer,
    mut network: Network,
    source: &PartyId,
) -> Result<(RunOutcome, Network), CliError> {
    let mut sim = SimNetwork::new();
    for node in network.nodes.drain(..) {
        sim.add_node(node);
    }
    let outcome = sequencer.run_lsm_sim(&mut sim, source)?;
    info!(deliveries = sim.log().len(), "deterministic run finished");
    Ok((outcome, network))
}

async fn run_async(
    sequencer: &RunSequencer,
    mut network: Network,
    source: &PartyId,
) -> Result<(RunOutcome, Network), CliError> {
    let transport = InMemoryNetwork::new();
    let mut handles = Vec::new();
    for node in network.nodes.drain(..) {
        handles.push(spawn(node, &transport)?);
    }

    let result = match handles.iter().find(|handle| handle.party() == source) {
        Some(handle) => sequencer.run_lsm(handle).await,
        None => Err(LsmError::MalformedInput(format!("no node for {source}"))),
    };
    for handle in &handles {
        handle.shutdown();
    }
    Ok((result?, network))
}
