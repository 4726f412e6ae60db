//! Strongly connected components
//!
//! Tarjan's algorithm in O(V+E) with deterministic ordering. Only components
//! with at least two members can hold a cycle, so singletons are discarded.
//!
//! [`extended_components`] additionally joins components that are linked by a
//! one-way edge, by adding a zero-weight synthetic bridge in the reverse
//! direction. Cycles through such a bridge describe a chain of obligations
//! that a payer funds from its limit rather than from an offsetting
//! obligation.

use super::obligation_graph::ObligationGraph;
use crate::models::EphemeralKey;
use std::collections::{BTreeMap, BTreeSet};

/// Set of vertex indices that are mutually reachable
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Component {
    /// Vertex indices, sorted
    members: Vec<usize>,
}

impl Component {
    pub fn new(mut members: Vec<usize>) -> Self {
        members.sort_unstable();
        members.dedup();
        Self { members }
    }

    pub fn members(&self) -> &[usize] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, idx: usize) -> bool {
        self.members.binary_search(&idx).is_ok()
    }

    /// Member keys in index order
    pub fn keys(&self, graph: &ObligationGraph) -> BTreeSet<EphemeralKey> {
        self.members
            .iter()
            .filter_map(|&idx| graph.key_at(idx).cloned())
            .collect()
    }
}

/// Tarjan SCC finder
pub struct SccFinder;

impl SccFinder {
    /// All strongly connected components, including singletons
    ///
    /// Returned in reverse topological order, as Tarjan produces them.
    pub fn find_all(graph: &ObligationGraph) -> Vec<Component> {
        let n = graph.vertex_count();
        if n == 0 {
            return Vec::new();
        }

        let mut state = TarjanState {
            index: 0,
            indices: vec![None; n],
            lowlinks: vec![0; n],
            on_stack: vec![false; n],
            stack: Vec::new(),
            sccs: Vec::new(),
        };

        // Visit vertices in sorted order (deterministic)
        for v in 0..n {
            if state.indices[v].is_none() {
                Self::strongconnect(graph, v, &mut state);
            }
        }

        state.sccs.into_iter().map(Component::new).collect()
    }

    fn strongconnect(graph: &ObligationGraph, v: usize, state: &mut TarjanState) {
        state.indices[v] = Some(state.index);
        state.lowlinks[v] = state.index;
        state.index += 1;
        state.stack.push(v);
        state.on_stack[v] = true;

        for w in graph.out_neighbors(v) {
            match state.indices[w] {
                None => {
                    Self::strongconnect(graph, w, state);
                    state.lowlinks[v] = state.lowlinks[v].min(state.lowlinks[w]);
                }
                Some(w_index) if state.on_stack[w] => {
                    state.lowlinks[v] = state.lowlinks[v].min(w_index);
                }
                Some(_) => {}
            }
        }

        // v is a root: pop its component
        if Some(state.lowlinks[v]) == state.indices[v] {
            let mut scc = Vec::new();
            while let Some(w) = state.stack.pop() {
                state.on_stack[w] = false;
                scc.push(w);
                if w == v {
                    break;
                }
            }
            state.sccs.push(scc);
        }
    }
}

/// Internal state for Tarjan's algorithm
struct TarjanState {
    index: usize,
    indices: Vec<Option<usize>>,
    lowlinks: Vec<usize>,
    on_stack: Vec<bool>,
    stack: Vec<usize>,
    sccs: Vec<Vec<usize>>,
}

/// Components that can hold a cycle, sorted by smallest member
pub fn strongly_connected_components(graph: &ObligationGraph) -> Vec<Component> {
    let mut components: Vec<Component> = SccFinder::find_all(graph)
        .into_iter()
        .filter(|c| c.len() > 1)
        .collect();
    components.sort();
    components
}

/// Components joined through synthetic bridges
#[derive(Debug, Clone)]
pub struct ExtendedComponents {
    /// Input graph plus the synthetic bridges
    pub graph: ObligationGraph,

    pub components: Vec<Component>,

    /// Number of bridges added
    pub bridges: usize,
}

/// Join components linked by a one-way edge
///
/// For every real edge `u → v` whose endpoints fall in different groups
/// (a component from `components`, or a lone vertex), a zero-weight edge
/// `v → u` is added, and the augmented graph is decomposed again.
pub fn extended_components(graph: &ObligationGraph, components: &[Component]) -> ExtendedComponents {
    let mut group_of: BTreeMap<usize, usize> = BTreeMap::new();
    for (group, component) in components.iter().enumerate() {
        for &member in component.members() {
            group_of.insert(member, group);
        }
    }
    // Lone vertices form their own group
    let mut next_group = components.len();
    for idx in 0..graph.vertex_count() {
        group_of.entry(idx).or_insert_with(|| {
            next_group += 1;
            next_group - 1
        });
    }

    let mut bridges = Vec::new();
    for from in 0..graph.vertex_count() {
        for to in graph.out_neighbors(from) {
            if group_of[&from] != group_of[&to] && graph.edge_by_index(to, from).is_none() {
                bridges.push((to, from));
            }
        }
    }

    let mut extended = graph.clone();
    for &(from, to) in &bridges {
        extended.add_synthetic_edge(from, to);
    }
    let components = strongly_connected_components(&extended);

    ExtendedComponents {
        graph: extended,
        components,
        bridges: bridges.len(),
    }
}
