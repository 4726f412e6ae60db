//! Configuration for netting runs
//!
//! All configuration is plain serde structs with sensible defaults, so a run
//! can be described in JSON and only the interesting fields overridden:
//!
//! ```rust
//! use liquidity_savings_core::config::{LsmConfig, NettingStrategyKind};
//!
//! let config = LsmConfig::from_json_str(r#"{
//!     "currency": "GBP",
//!     "netting": { "strategy": "largest_sum_only" }
//! }"#).unwrap();
//!
//! assert_eq!(config.currency.as_str(), "GBP");
//! assert_eq!(config.netting.strategy, NettingStrategyKind::LargestSumOnly);
//! assert_eq!(config.scan_ttl, 32);
//! ```

use crate::models::{Amount, Currency, PartyId};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// Netting Configuration
// ============================================================================

/// Which netting strategy the planner runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NettingStrategyKind {
    /// Settle only the most valuable viable cycle, then mop up single
    /// obligations the payer can fund outright
    LargestSumOnly,

    /// Settle every viable cycle, iterating until no cycle makes progress
    #[default]
    BestEffort,
}

/// Bounds on elementary cycle enumeration
///
/// Enumeration starts at `initial_depth` and deepens while paths are still
/// being truncated by the depth bound. The whole search stops once
/// `max_operations` DFS steps have been taken, keeping dense graphs
/// tractable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleSearchConfig {
    /// First depth bound (cycle length in edges)
    pub initial_depth: usize,

    /// Hard ceiling on DFS steps across all deepening rounds
    pub max_operations: usize,
}

impl Default for CycleSearchConfig {
    fn default() -> Self {
        Self {
            initial_depth: 3,
            max_operations: 100_000,
        }
    }
}

/// Configuration for the planner stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NettingConfig {
    pub strategy: NettingStrategyKind,

    /// Join components through zero-weight synthetic bridges so that chains
    /// of obligations between components can be netted
    pub extend_components: bool,

    pub cycle_search: CycleSearchConfig,
}

impl Default for NettingConfig {
    fn default() -> Self {
        Self {
            strategy: NettingStrategyKind::BestEffort,
            extend_components: true,
            cycle_search: CycleSearchConfig::default(),
        }
    }
}

// ============================================================================
// Run Configuration
// ============================================================================

/// Configuration for a complete netting run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LsmConfig {
    /// Single currency netted by the run
    pub currency: Currency,

    /// Hop budget carried by scan requests
    pub scan_ttl: u32,

    pub netting: NettingConfig,

    /// How long the sequencer waits for detection to complete
    pub detect_timeout_ms: u64,

    /// How long the sequencer waits for execution to be reported
    pub execute_timeout_ms: u64,
}

impl Default for LsmConfig {
    fn default() -> Self {
        Self {
            currency: Currency::default(),
            scan_ttl: 32,
            netting: NettingConfig::default(),
            detect_timeout_ms: 5_000,
            execute_timeout_ms: 10_000,
        }
    }
}

impl LsmConfig {
    /// Parse and validate a JSON config
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: LsmConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.currency.is_empty() {
            return Err(ConfigError::Invalid("currency must not be empty".to_string()));
        }
        if self.netting.cycle_search.initial_depth < 2 {
            return Err(ConfigError::Invalid(format!(
                "cycle_search.initial_depth must be at least 2, got {}",
                self.netting.cycle_search.initial_depth
            )));
        }
        if self.netting.cycle_search.max_operations == 0 {
            return Err(ConfigError::Invalid(
                "cycle_search.max_operations must be positive".to_string(),
            ));
        }
        if self.detect_timeout_ms == 0 || self.execute_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be positive".to_string()));
        }
        Ok(())
    }

    pub fn detect_timeout(&self) -> Duration {
        Duration::from_millis(self.detect_timeout_ms)
    }

    pub fn execute_timeout(&self) -> Duration {
        Duration::from_millis(self.execute_timeout_ms)
    }
}

// ============================================================================
// Node Configuration
// ============================================================================

/// Per-participant configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub party: PartyId,

    /// Upper bound on the cash pledged to a run; `None` pledges the full
    /// balance
    #[serde(default)]
    pub max_pledge: Option<Amount>,
}

impl NodeConfig {
    pub fn new(party: PartyId) -> Self {
        Self {
            party,
            max_pledge: None,
        }
    }

    pub fn with_max_pledge(mut self, max_pledge: Amount) -> Self {
        self.max_pledge = Some(max_pledge);
        self
    }

    /// Limit declared for a run given the party's current balance
    pub fn declared_limit(&self, balance: Amount) -> Amount {
        match self.max_pledge {
            Some(cap) => balance.min(cap).max(0),
            None => balance.max(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(LsmConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_shallow_cycle_search() {
        let err = LsmConfig::from_json_str(r#"{"netting": {"cycle_search": {"initial_depth": 1}}}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_unknown_strategy() {
        let err = LsmConfig::from_json_str(r#"{"netting": {"strategy": "greedy"}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_loads_config_file() {
        let path = std::env::temp_dir().join(format!("lsm-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"currency": "EUR", "scan_ttl": 4}"#).unwrap();
        let config = LsmConfig::from_json_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.currency.as_str(), "EUR");
        assert_eq!(config.scan_ttl, 4);

        let missing = LsmConfig::from_json_file(&path).unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));
    }

    #[test]
    fn test_declared_limit_caps_pledge() {
        let node = NodeConfig::new("A".into()).with_max_pledge(300);
        assert_eq!(node.declared_limit(1_000), 300);
        assert_eq!(node.declared_limit(120), 120);
        assert_eq!(NodeConfig::new("A".into()).declared_limit(-5), 0);
    }
}
