//! Obligation graph and cycle finder
//!
//! Pure graph library used by the planner:
//! - [`ObligationGraph`]: aggregated multigraph (parallel obligations grouped
//!   per ordered pair)
//! - [`strongly_connected_components`]: Tarjan decomposition, singletons
//!   discarded
//! - [`CycleFinder`]: bounded elementary cycle enumeration
//! - [`extended_components`]: components joined through zero-weight bridges

pub mod cycles;
pub mod obligation_graph;
pub mod scc;

use thiserror::Error;

pub use cycles::{Cycle, CycleFinder, CycleSearch};
pub use obligation_graph::{Edge, ObligationGraph, ObligationsByEdge};
pub use scc::{extended_components, strongly_connected_components, Component, ExtendedComponents, SccFinder};

/// Errors raised while building the obligation graph
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Cannot build a graph from an empty obligation set")]
    EmptyGraph,

    #[error("Obligation from {key} to itself")]
    SelfLoop { key: String },

    #[error("Obligation {id} appears more than once")]
    DuplicateObligation { id: String },

    #[error("Obligation {id} has non-positive amount {amount}")]
    NonPositiveAmount { id: String, amount: i64 },
}
