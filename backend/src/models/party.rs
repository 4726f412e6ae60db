//! Party identities
//!
//! Two kinds of identity take part in a netting run:
//! - [`PartyId`]: the durable, network-addressable identity of a participant
//! - [`EphemeralKey`]: a key generated fresh for one run, under which a party
//!   discloses its cash limit and its obligation endpoints to the rest of the
//!   region
//!
//! Only counterparties ever learn each other's [`PartyId`]. Everyone else sees
//! ephemeral keys, which are discarded when the run ends.
//!
//! CRITICAL: All money values are i64 (minor currency units)

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Money amount in minor currency units (e.g. cents)
pub type Amount = i64;

/// Durable identity of a participant
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartyId(String);

impl PartyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartyId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Per-run anonymous key
///
/// # Example
/// ```
/// use liquidity_savings_core::models::EphemeralKey;
///
/// let a = EphemeralKey::generate();
/// let b = EphemeralKey::generate();
/// assert_ne!(a, b);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EphemeralKey(String);

impl EphemeralKey {
    /// Generate a fresh random key
    pub fn generate() -> Self {
        Self(format!("ek_{}", Uuid::new_v4().simple()))
    }

    /// Wrap an existing key value (tests and replay)
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EphemeralKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EphemeralKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// Currency code; a run nets a single currency
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Currency(String);

impl Currency {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl Default for Currency {
    fn default() -> Self {
        Self::new("USD")
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Currency {
    fn from(code: &str) -> Self {
        Self::new(code)
    }
}

/// A party's declared spendable cash for one netting run
///
/// Keyed by the run's ephemeral key, never by the durable [`PartyId`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CashLimit {
    pub key: EphemeralKey,
    pub amount: Amount,
}

impl CashLimit {
    pub fn new(key: EphemeralKey, amount: Amount) -> Self {
        Self { key, amount }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ephemeral_keys_are_unique() {
        let keys: std::collections::HashSet<_> = (0..64).map(|_| EphemeralKey::generate()).collect();
        assert_eq!(keys.len(), 64);
    }

    #[test]
    fn test_party_id_serializes_transparently() {
        let json = serde_json::to_string(&PartyId::new("BANK_A")).unwrap();
        assert_eq!(json, "\"BANK_A\"");
    }
}
