//! Crate-level error
//!
//! Expected outcomes of a run (deadlock, rejection by the ordering service, a
//! lost detection round) are not errors; they are variants of
//! [`crate::sequencer::RunOutcome`]. `LsmError` covers everything that stops
//! a run from producing an outcome at all.

use crate::config::ConfigError;
use crate::graph::GraphError;
use crate::models::ObligationError;
use crate::netting::NettingError;
use crate::node::transport::TransportError;
use crate::protocol::{DetectError, ExecuteError};
use crate::services::CollaboratorError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LsmError {
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Obligation(#[from] ObligationError),

    #[error(transparent)]
    Netting(#[from] NettingError),

    #[error(transparent)]
    Detect(#[from] DetectError),

    #[error(transparent)]
    Execute(#[from] ExecuteError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Timed out waiting for {stage}")]
    Timeout { stage: &'static str },

    #[error("Node {party} has stopped")]
    NodeStopped { party: String },
}

impl LsmError {
    /// Whether the run failed because of its input rather than the network
    pub fn is_malformed_input(&self) -> bool {
        matches!(
            self,
            LsmError::MalformedInput(_)
                | LsmError::Graph(_)
                | LsmError::Obligation(_)
                | LsmError::Detect(DetectError::NoOpenObligations { .. })
        )
    }
}
