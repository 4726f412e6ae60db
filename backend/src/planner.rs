//! Planner
//!
//! Turns the aggregate produced by detection into a settlement plan:
//!
//! ```text
//! masked obligations ──resolve──▶ graph ──SCC──▶ components ──(extend)──▶
//!   per component: cycles ──strategy──▶ settled obligations + limits
//!   ──▶ NettingResult (payments derived from limit deltas)
//! ```
//!
//! The planner is deterministic: the same aggregate and limits always give
//! the same plan, whichever node runs it.

use crate::config::{NettingConfig, NettingStrategyKind};
use crate::error::LsmError;
use crate::graph::{
    extended_components, strongly_connected_components, CycleFinder, ObligationGraph,
};
use crate::models::{EphemeralKey, MaskedObligation, NettingObligation};
use crate::netting::{strategy_for, EdgeBook, Limits, NettingResult, NettingStrategy};
use std::collections::BTreeSet;
use tracing::{debug, info, instrument, warn};

/// Result of planning
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanOutcome {
    /// At least one obligation can be settled
    Ready(NettingResult),

    /// Nothing can be settled under the declared limits
    Deadlock { reason: String },
}

impl PlanOutcome {
    pub fn is_deadlock(&self) -> bool {
        matches!(self, PlanOutcome::Deadlock { .. })
    }
}

/// Graph decomposition plus the configured netting strategy
pub struct Planner {
    config: NettingConfig,
    strategy: Box<dyn NettingStrategy>,
}

impl Planner {
    pub fn new(config: NettingConfig) -> Self {
        let strategy = strategy_for(config.strategy);
        Self { config, strategy }
    }

    /// Plan over a detection aggregate
    ///
    /// Obligations whose two sides did not both disclose (the flood was cut
    /// short by the hop budget) are left out.
    pub fn plan(&self, obligations: &[MaskedObligation], limits: &Limits) -> Result<PlanOutcome, LsmError> {
        let mut resolved: Vec<NettingObligation> = Vec::with_capacity(obligations.len());
        for ob in obligations {
            if let Some(edge) = ob.resolve()? {
                resolved.push(edge);
            }
        }
        let unresolved = obligations.len() - resolved.len();
        if unresolved > 0 {
            warn!(unresolved, "dropping obligations disclosed by one side only");
        }
        self.plan_resolved(&resolved, limits)
    }

    /// Plan over fully resolved obligations
    #[instrument(skip_all, fields(strategy = self.strategy.name(), obligations = obligations.len()))]
    pub fn plan_resolved(&self, obligations: &[NettingObligation], limits: &Limits) -> Result<PlanOutcome, LsmError> {
        let graph = ObligationGraph::build(obligations)?;
        let components = strongly_connected_components(&graph);

        let extend = self.config.extend_components && self.config.strategy == NettingStrategyKind::BestEffort;
        let (graph, components) = if extend {
            let extended = extended_components(&graph, &components);
            debug!(bridges = extended.bridges, "extended components");
            (extended.graph, extended.components)
        } else {
            (graph, components)
        };

        if components.is_empty() {
            return Ok(PlanOutcome::Deadlock {
                reason: "obligation graph has no cycle".to_string(),
            });
        }

        let bridges: BTreeSet<(EphemeralKey, EphemeralKey)> = graph
            .edges()
            .filter(|(_, _, edge)| edge.synthetic)
            .map(|(from, to, _)| (from.clone(), to.clone()))
            .collect();
        let mut book = EdgeBook::new(graph.obligations_by_edge()).with_bridges(bridges);
        let mut working = limits.clone();
        let finder = CycleFinder::new(self.config.cycle_search);

        let mut settled = Vec::new();
        for component in &components {
            let search = finder.simple_cycles(&graph, component);
            if search.exhausted {
                warn!(
                    members = component.len(),
                    operations = search.operations,
                    "cycle search hit its operation ceiling; netting the cycles found so far"
                );
            }
            debug!(
                members = component.len(),
                cycles = search.cycles.len(),
                depth = search.depth,
                "netting component"
            );

            let members = component.keys(&graph);
            settled.extend(
                self.strategy
                    .net_component(&members, &search.cycles, &mut book, &mut working),
            );
        }

        if settled.is_empty() {
            warn!(components = components.len(), "no viable cycle under declared limits");
            return Ok(PlanOutcome::Deadlock {
                reason: "no viable cycle under declared limits".to_string(),
            });
        }

        let result = NettingResult::new(limits, working, settled)?;
        info!(
            settled = result.settled_obligations.len(),
            value = result.settled_value(),
            payments = result.payments.len(),
            "plan ready"
        );
        Ok(PlanOutcome::Ready(result))
    }
}
