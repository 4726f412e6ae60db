//! Component-level fixed point over cycles

use super::cycle_solver::CycleSolver;
use super::{EdgeBook, Limits};
use crate::graph::Cycle;
use crate::models::NettingObligation;
use tracing::debug;

/// Applies a [`CycleSolver`] to every cycle of a component until no cycle
/// settles anything more
///
/// Cycles are tried in the order given (the finder's deterministic order).
/// Each success consumes the settled obligations from the [`EdgeBook`] and
/// replaces the limits, so later cycles see the updated state.
#[derive(Debug, Clone, Default)]
pub struct ComponentCycleSolver<S: CycleSolver> {
    solver: S,
}

impl<S: CycleSolver> ComponentCycleSolver<S> {
    pub fn new(solver: S) -> Self {
        Self { solver }
    }

    /// Settle as many cycles as possible, returning what was settled
    pub fn solve(&self, cycles: &[Cycle], book: &mut EdgeBook, limits: &mut Limits) -> Vec<NettingObligation> {
        let mut settled = Vec::new();
        let mut pass = 0usize;

        loop {
            pass += 1;
            let mut progressed = false;

            for cycle in cycles {
                if let Some(result) = self.solver.solve_cycle(cycle, book, limits) {
                    debug!(
                        pass,
                        cycle_len = cycle.len(),
                        obligations = result.settled.len(),
                        "cycle settled"
                    );
                    book.consume(&result.settled);
                    *limits = result.new_limits;
                    settled.extend(result.settled);
                    progressed = true;
                }
            }

            if !progressed {
                break;
            }
        }

        settled
    }
}
