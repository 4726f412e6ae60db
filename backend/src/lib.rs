//! Liquidity Savings Mechanism Core
//!
//! Decentralised netting of bilateral payment obligations. A network of
//! participants finds cycles of mutual debt, nets them down to the fewest
//! cash transfers their pledged limits allow, and settles each plan as one
//! atomic multi-party transaction, with no party ever holding global state.
//!
//! # Architecture
//!
//! - **models**: Domain types (Obligation, EphemeralKey, SettlementTransaction)
//! - **graph**: Obligation multigraph, SCCs, bounded cycle search
//! - **netting**: Cycle and component solvers, netting strategies
//! - **planner**: Detection aggregate → settlement plan
//! - **protocol**: Sans-IO detect and execute coordinators, wire messages
//! - **node**: Per-party node, deterministic and tokio drivers
//! - **sequencer**: Detect → Plan → Execute run driver
//! - **services**: External collaborator traits and in-memory backends
//!
//! # Critical Invariants
//!
//! 1. All money values are i64 minor units
//! 2. Netting conserves the sum of declared limits
//! 3. Ledger state changes only after the ordering service commits
//! 4. Given the same clock, a run is fully deterministic

// Module declarations
pub mod config;
pub mod core;
pub mod error;
pub mod graph;
pub mod models;
pub mod netting;
pub mod node;
pub mod planner;
pub mod protocol;
pub mod sequencer;
pub mod services;

// Re-exports for convenience
pub use config::{CycleSearchConfig, LsmConfig, NettingConfig, NettingStrategyKind, NodeConfig};
pub use core::time::{Clock, ManualClock, SystemClock};
pub use error::LsmError;
pub use models::{
    obligation::{MaskedObligation, NettingObligation, Obligation, ObligationId, ObligationStatus},
    party::{Amount, CashLimit, Currency, EphemeralKey, PartyId},
    transaction::{SettlementTransaction, SignedTransaction, TransactionId},
};
pub use netting::{Limits, NettingPayment, NettingResult};
pub use node::{LsmNode, LsmStage, LsmStatus, NodeHandle, SimNetwork};
pub use planner::{PlanOutcome, Planner};
pub use protocol::{ExecutionOutcome, ScanId, SettlementPlan};
pub use sequencer::{RunOutcome, RunSequencer};
pub use services::{Collaborators, InMemoryLedger, InMemoryOrderingService};
