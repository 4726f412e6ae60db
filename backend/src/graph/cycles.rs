//! Elementary cycle enumeration
//!
//! Each cycle is rooted at its smallest vertex index and reported once. The
//! search is an explicit worklist DFS (no native recursion) with two bounds:
//!
//! 1. A depth bound on cycle length, starting at
//!    [`CycleSearchConfig::initial_depth`] and deepening while the bound is
//!    still truncating paths
//! 2. A hard ceiling on DFS steps shared across all deepening rounds
//!
//! Both keep enumeration terminating on densely connected components, where
//! the number of elementary cycles is exponential in the component size.

use super::obligation_graph::ObligationGraph;
use super::scc::Component;
use crate::config::CycleSearchConfig;
use crate::models::EphemeralKey;
use std::collections::BTreeSet;

/// Closed sequence of parties `n0 → n1 → … → nk` with `n0 == nk`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cycle {
    nodes: Vec<EphemeralKey>,
}

impl Cycle {
    /// Build a cycle from an open node sequence; the closing node is added
    pub fn from_open(mut nodes: Vec<EphemeralKey>) -> Self {
        if let Some(first) = nodes.first().cloned() {
            nodes.push(first);
        }
        Self { nodes }
    }

    /// Closed node sequence (first == last)
    pub fn nodes(&self) -> &[EphemeralKey] {
        &self.nodes
    }

    /// Number of edges
    pub fn len(&self) -> usize {
        self.nodes.len().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Edges (payer, payee) in walk order
    pub fn edges(&self) -> impl Iterator<Item = (&EphemeralKey, &EphemeralKey)> {
        self.nodes.windows(2).map(|pair| (&pair[0], &pair[1]))
    }

    /// `(prev, this, next)` for every node of the cycle, starting at `n0`
    pub fn walk(&self) -> impl Iterator<Item = (&EphemeralKey, &EphemeralKey, &EphemeralKey)> {
        let k = self.len();
        (0..k).map(move |i| {
            let prev = &self.nodes[(i + k - 1) % k];
            (prev, &self.nodes[i], &self.nodes[i + 1])
        })
    }
}

/// Result of a bounded cycle search
#[derive(Debug, Clone, Default)]
pub struct CycleSearch {
    /// Cycles found, in deterministic order
    pub cycles: Vec<Cycle>,

    /// Depth bound of the last round
    pub depth: usize,

    /// DFS steps taken across all rounds
    pub operations: usize,

    /// The operation ceiling stopped the search early
    pub exhausted: bool,
}

/// Bounded elementary cycle finder
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleFinder {
    config: CycleSearchConfig,
}

impl CycleFinder {
    pub fn new(config: CycleSearchConfig) -> Self {
        Self { config }
    }

    /// Enumerate the elementary cycles of a component
    pub fn simple_cycles(&self, graph: &ObligationGraph, component: &Component) -> CycleSearch {
        let mut found: BTreeSet<Vec<usize>> = BTreeSet::new();
        let mut operations = 0usize;
        let mut depth = self.config.initial_depth.max(2);
        let mut exhausted = false;

        loop {
            let round = self.search_round(graph, component, depth, &mut operations, &mut found);
            match round {
                RoundEnd::Exhausted => {
                    exhausted = true;
                    break;
                }
                RoundEnd::Truncated if depth < component.len() => depth += 1,
                _ => break,
            }
        }

        let cycles = found
            .into_iter()
            .map(|indices| {
                Cycle::from_open(
                    indices
                        .into_iter()
                        .filter_map(|idx| graph.key_at(idx).cloned())
                        .collect(),
                )
            })
            .collect();

        CycleSearch {
            cycles,
            depth,
            operations,
            exhausted,
        }
    }

    /// One DFS round with a fixed depth bound
    fn search_round(
        &self,
        graph: &ObligationGraph,
        component: &Component,
        depth: usize,
        operations: &mut usize,
        found: &mut BTreeSet<Vec<usize>>,
    ) -> RoundEnd {
        let n = graph.vertex_count();
        let mut on_path = vec![false; n];
        let mut truncated = false;

        for &start in component.members() {
            // Worklist of (vertex, successors, next successor position)
            let mut stack: Vec<(usize, Vec<usize>, usize)> = vec![(start, self.successors(graph, component, start), 0)];
            let mut path = vec![start];
            on_path[start] = true;

            while let Some(top) = stack.len().checked_sub(1) {
                let next = {
                    let (_, successors, pos) = &mut stack[top];
                    let next = successors.get(*pos).copied();
                    *pos += 1;
                    next
                };
                let Some(next) = next else {
                    if let Some((vertex, _, _)) = stack.pop() {
                        on_path[vertex] = false;
                    }
                    path.pop();
                    continue;
                };

                *operations += 1;
                if *operations > self.config.max_operations {
                    return RoundEnd::Exhausted;
                }

                if next == start {
                    if path.len() >= 2 {
                        found.insert(path.clone());
                    }
                } else if next > start && !on_path[next] {
                    if path.len() < depth {
                        on_path[next] = true;
                        path.push(next);
                        stack.push((next, self.successors(graph, component, next), 0));
                    } else {
                        truncated = true;
                    }
                }
            }
        }

        if truncated {
            RoundEnd::Truncated
        } else {
            RoundEnd::Complete
        }
    }

    /// Out-neighbours restricted to the component
    fn successors(&self, graph: &ObligationGraph, component: &Component, vertex: usize) -> Vec<usize> {
        graph
            .out_neighbors(vertex)
            .into_iter()
            .filter(|&w| component.contains(w))
            .collect()
    }
}

enum RoundEnd {
    Complete,
    Truncated,
    Exhausted,
}
