//! Run sequencer
//!
//! Drives one netting run from a single node:
//!
//! ```text
//! Idle ─▶ Detecting ─▶ Planning ─▶ Executing ─▶ Complete
//!                         │
//!                         └──▶ Deadlock (notice flooded to counterparties)
//! ```
//!
//! Each wait is bounded by the configured stage timeout. A round that loses
//! detection to a lower scan id ends as [`RunOutcome::Superseded`]; the
//! winner's source runs the rest of the pipeline.

use crate::config::LsmConfig;
use crate::error::LsmError;
use crate::models::{ObligationId, PartyId, TransactionId};
use crate::netting::NettingPayment;
use crate::node::{LsmStage, NodeEvent, NodeHandle, SimNetwork};
use crate::planner::{PlanOutcome, Planner};
use crate::protocol::{DetectEvent, DetectOutcome, ExecuteEvent, ExecutionOutcome, ScanId, SettlementPlan};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{info, instrument, warn};

/// Result of one run as seen by the node that started it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Complete {
        tx_id: TransactionId,
        settled: Vec<ObligationId>,
        payments: Vec<NettingPayment>,
    },
    Deadlock {
        reason: String,
    },
    Superseded {
        winner: ScanId,
    },
    Rejected {
        reason: String,
    },
    Failed {
        reason: String,
    },
}

impl RunOutcome {
    /// Stage the node is left in
    pub fn final_stage(&self) -> LsmStage {
        match self {
            RunOutcome::Complete { .. } => LsmStage::Complete,
            RunOutcome::Deadlock { .. } => LsmStage::Deadlock,
            _ => LsmStage::Idle,
        }
    }
}

impl From<ExecutionOutcome> for RunOutcome {
    fn from(outcome: ExecutionOutcome) -> Self {
        match outcome {
            ExecutionOutcome::Completed {
                tx_id,
                settled,
                payments,
            } => RunOutcome::Complete {
                tx_id,
                settled,
                payments,
            },
            ExecutionOutcome::Rejected { reason } => RunOutcome::Rejected { reason },
            ExecutionOutcome::Failed { reason } => RunOutcome::Failed { reason },
        }
    }
}

/// What planning decided
enum Planned {
    Execute(SettlementPlan),
    Deadlock { scan_id: ScanId, reason: String },
}

pub struct RunSequencer {
    config: LsmConfig,
    planner: Planner,
}

impl RunSequencer {
    pub fn new(config: LsmConfig) -> Self {
        let planner = Planner::new(config.netting.clone());
        Self { config, planner }
    }

    pub fn config(&self) -> &LsmConfig {
        &self.config
    }

    /// Run Detect → Plan → Execute with `node` as source
    #[instrument(skip_all, fields(party = %node.party()))]
    pub async fn run_lsm(&self, node: &NodeHandle) -> Result<RunOutcome, LsmError> {
        node.set_stage(LsmStage::Detecting)?;
        let detected = node.start_detect().await?;
        let event = match timeout(self.config.detect_timeout(), detected).await {
            Ok(Ok(event)) => event,
            Ok(Err(_)) => {
                return Err(LsmError::NodeStopped {
                    party: node.party().to_string(),
                })
            }
            Err(_) => {
                node.set_stage(LsmStage::Idle)?;
                return Err(LsmError::Timeout { stage: "detect" });
            }
        };

        let outcome = match event {
            DetectEvent::Completed(detected) => {
                node.set_stage(LsmStage::Planning)?;
                match self.plan(detected)? {
                    Planned::Deadlock { scan_id, reason } => {
                        node.broadcast_deadlock(scan_id, reason.clone()).await?;
                        RunOutcome::Deadlock { reason }
                    }
                    Planned::Execute(plan) => {
                        node.set_stage(LsmStage::Executing)?;
                        let executed = node.execute(plan).await?;
                        match timeout(self.config.execute_timeout(), executed).await {
                            Ok(Ok(outcome)) => outcome.into(),
                            Ok(Err(_)) => {
                                return Err(LsmError::NodeStopped {
                                    party: node.party().to_string(),
                                })
                            }
                            Err(_) => {
                                node.set_stage(LsmStage::Idle)?;
                                return Err(LsmError::Timeout { stage: "execute" });
                            }
                        }
                    }
                }
            }
            DetectEvent::Superseded { winner, .. } => RunOutcome::Superseded { winner },
        };

        node.set_stage(outcome.final_stage())?;
        log_outcome(&outcome);
        Ok(outcome)
    }

    /// Same pipeline over a synchronous [`SimNetwork`]
    ///
    /// Each stage runs the network until it is quiet; a stage that goes quiet
    /// without its completion event has lost messages and times out.
    #[instrument(skip_all, fields(party = %party))]
    pub fn run_lsm_sim(&self, network: &mut SimNetwork, party: &PartyId) -> Result<RunOutcome, LsmError> {
        network.set_stage(party, LsmStage::Detecting)?;
        network.start_detect(party)?;
        network.run()?;

        let event = network.take_events().into_iter().find_map(|(from, event)| match event {
            NodeEvent::Detect(event) if &from == party => Some(event),
            _ => None,
        });
        let outcome = match event {
            Some(DetectEvent::Completed(detected)) => {
                network.set_stage(party, LsmStage::Planning)?;
                match self.plan(detected)? {
                    Planned::Deadlock { scan_id, reason } => {
                        network.broadcast_deadlock(party, scan_id, reason.clone())?;
                        network.run()?;
                        RunOutcome::Deadlock { reason }
                    }
                    Planned::Execute(plan) => {
                        network.set_stage(party, LsmStage::Executing)?;
                        let scan_id = plan.scan_id.clone();
                        network.execute(party, plan)?;
                        network.run()?;
                        let finished = network.take_events().into_iter().find_map(|(from, event)| match event {
                            NodeEvent::Execute(ExecuteEvent::Finished { scan_id: id, outcome })
                                if &from == party && id == scan_id =>
                            {
                                Some(outcome)
                            }
                            _ => None,
                        });
                        match finished {
                            Some(outcome) => outcome.into(),
                            None => {
                                network.set_stage(party, LsmStage::Idle)?;
                                return Err(LsmError::Timeout { stage: "execute" });
                            }
                        }
                    }
                }
            }
            Some(DetectEvent::Superseded { winner, .. }) => RunOutcome::Superseded { winner },
            None => {
                network.set_stage(party, LsmStage::Idle)?;
                return Err(LsmError::Timeout { stage: "detect" });
            }
        };

        network.set_stage(party, outcome.final_stage())?;
        log_outcome(&outcome);
        Ok(outcome)
    }

    fn plan(&self, detected: DetectOutcome) -> Result<Planned, LsmError> {
        let scan_id = detected.scan.id.clone();
        match self.planner.plan(&detected.obligations, &detected.limits)? {
            PlanOutcome::Ready(result) => Ok(Planned::Execute(SettlementPlan::new(
                scan_id,
                detected.scan.currency,
                &result,
            ))),
            PlanOutcome::Deadlock { reason } => Ok(Planned::Deadlock { scan_id, reason }),
        }
    }
}

fn log_outcome(outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Complete { settled, payments, .. } => {
            info!(settled = settled.len(), payments = payments.len(), "run complete")
        }
        RunOutcome::Superseded { winner } => info!(winner = %winner, "run superseded"),
        RunOutcome::Deadlock { reason } => warn!(reason = %reason, "run deadlocked"),
        RunOutcome::Rejected { reason } => warn!(reason = %reason, "run rejected"),
        RunOutcome::Failed { reason } => warn!(reason = %reason, "run failed"),
    }
}
