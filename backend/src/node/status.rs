//! Run stage and status reported by every node

use crate::core::Millis;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stage of a netting run
///
/// ```text
/// Idle ─▶ Detecting ─▶ Planning ─▶ Executing ─▶ Complete
///                         │
///                         └──────▶ Deadlock
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LsmStage {
    #[default]
    Idle,
    Detecting,
    Planning,
    Executing,
    Complete,
    Deadlock,
}

impl LsmStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            LsmStage::Idle => "idle",
            LsmStage::Detecting => "detecting",
            LsmStage::Planning => "planning",
            LsmStage::Executing => "executing",
            LsmStage::Complete => "complete",
            LsmStage::Deadlock => "deadlock",
        }
    }
}

impl fmt::Display for LsmStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a node's run state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LsmStatus {
    pub stage: LsmStage,

    /// When `stage` last changed
    pub last_updated: Millis,

    pub in_deadlock: bool,
    pub deadlock_since: Option<Millis>,
}

impl LsmStatus {
    pub(crate) fn enter(&mut self, stage: LsmStage, now: Millis) {
        self.stage = stage;
        self.last_updated = now;
    }

    pub(crate) fn mark_deadlock(&mut self, since: Millis) {
        if !self.in_deadlock {
            self.in_deadlock = true;
            self.deadlock_since = Some(since);
        }
    }

    pub(crate) fn clear_deadlock(&mut self) {
        self.in_deadlock = false;
        self.deadlock_since = None;
    }
}
