//! Aggregated obligation graph
//!
//! Vertices: ephemeral keys of parties with at least one obligation
//! Edges: one per ordered (payer, payee) pair, carrying every parallel
//! obligation between that pair
//!
//! # Determinism
//!
//! - Vertices indexed in lexicographic key order
//! - All maps use BTreeMap for sorted iteration
//! - Construction is independent of input order

use super::GraphError;
use crate::models::{Amount, EphemeralKey, NettingObligation, ObligationId};
use std::collections::{BTreeMap, BTreeSet};

/// Obligations grouped by (payer, payee)
pub type ObligationsByEdge = BTreeMap<(EphemeralKey, EphemeralKey), Vec<NettingObligation>>;

/// Aggregated edge between two parties
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    /// Sum of all parallel obligations on this edge
    pub amount: Amount,

    /// Parallel obligations, sorted by id
    pub obligations: Vec<NettingObligation>,

    /// Zero-weight bridge added when extending components; carries no
    /// obligations
    pub synthetic: bool,
}

impl Edge {
    fn synthetic() -> Self {
        Self {
            amount: 0,
            obligations: Vec::new(),
            synthetic: true,
        }
    }
}

/// Directed multigraph of obligations, aggregated per ordered pair
#[derive(Debug, Clone, Default)]
pub struct ObligationGraph {
    /// Key → vertex index (stable, sorted)
    key_to_index: BTreeMap<EphemeralKey, usize>,

    /// Vertex index → key
    index_to_key: Vec<EphemeralKey>,

    /// payer_idx → payee_idx → edge
    adj: BTreeMap<usize, BTreeMap<usize, Edge>>,
}

impl ObligationGraph {
    /// Build the graph from a set of resolved obligations
    ///
    /// Fails on empty input, on a self-loop and on a repeated obligation id.
    ///
    /// # Example
    /// ```
    /// use liquidity_savings_core::graph::ObligationGraph;
    /// use liquidity_savings_core::models::NettingObligation;
    ///
    /// let graph = ObligationGraph::build(&[
    ///     NettingObligation::owed("o1", "A", "B", 100),
    ///     NettingObligation::owed("o2", "A", "B", 50),
    ///     NettingObligation::owed("o3", "B", "A", 70),
    /// ]).unwrap();
    ///
    /// assert_eq!(graph.vertex_count(), 2);
    /// assert_eq!(graph.edge_count(), 2);
    /// assert_eq!(graph.edge(&"A".into(), &"B".into()).unwrap().amount, 150);
    /// ```
    pub fn build(obligations: &[NettingObligation]) -> Result<Self, GraphError> {
        if obligations.is_empty() {
            return Err(GraphError::EmptyGraph);
        }

        let mut graph = Self::default();

        // Phase 1: collect keys and assign indices in lexicographic order
        let mut keys: BTreeSet<&EphemeralKey> = BTreeSet::new();
        let mut seen: BTreeSet<&ObligationId> = BTreeSet::new();
        for ob in obligations {
            if ob.payer() == ob.payee() {
                return Err(GraphError::SelfLoop {
                    key: ob.payer().to_string(),
                });
            }
            if ob.amount <= 0 {
                return Err(GraphError::NonPositiveAmount {
                    id: ob.id.to_string(),
                    amount: ob.amount,
                });
            }
            if !seen.insert(&ob.id) {
                return Err(GraphError::DuplicateObligation {
                    id: ob.id.to_string(),
                });
            }
            keys.insert(ob.payer());
            keys.insert(ob.payee());
        }
        for (idx, key) in keys.into_iter().enumerate() {
            graph.key_to_index.insert(key.clone(), idx);
            graph.index_to_key.push(key.clone());
        }

        // Phase 2: aggregate parallel obligations per ordered pair
        for ob in obligations {
            let from = graph.key_to_index[ob.payer()];
            let to = graph.key_to_index[ob.payee()];
            let edge = graph
                .adj
                .entry(from)
                .or_default()
                .entry(to)
                .or_insert_with(|| Edge {
                    amount: 0,
                    obligations: Vec::new(),
                    synthetic: false,
                });
            edge.amount += ob.amount;
            edge.obligations.push(ob.clone());
        }
        for targets in graph.adj.values_mut() {
            for edge in targets.values_mut() {
                edge.obligations.sort_by(|a, b| a.id.cmp(&b.id));
            }
        }

        Ok(graph)
    }

    /// Add a zero-weight bridge `from → to` unless a real edge already exists
    pub(crate) fn add_synthetic_edge(&mut self, from: usize, to: usize) {
        self.adj
            .entry(from)
            .or_default()
            .entry(to)
            .or_insert_with(Edge::synthetic);
    }

    /// Number of vertices in graph
    pub fn vertex_count(&self) -> usize {
        self.index_to_key.len()
    }

    /// Number of edges (ordered pairs) in graph
    pub fn edge_count(&self) -> usize {
        self.adj.values().map(|targets| targets.len()).sum()
    }

    /// Number of obligations across all edges
    pub fn obligation_count(&self) -> usize {
        self.adj
            .values()
            .flat_map(|targets| targets.values())
            .map(|edge| edge.obligations.len())
            .sum()
    }

    pub fn has_edge(&self, from: &EphemeralKey, to: &EphemeralKey) -> bool {
        self.edge(from, to).is_some()
    }

    /// Aggregated edge `from → to`
    pub fn edge(&self, from: &EphemeralKey, to: &EphemeralKey) -> Option<&Edge> {
        let from = self.key_to_index.get(from)?;
        let to = self.key_to_index.get(to)?;
        self.edge_by_index(*from, *to)
    }

    pub fn edge_by_index(&self, from: usize, to: usize) -> Option<&Edge> {
        self.adj.get(&from).and_then(|targets| targets.get(&to))
    }

    /// Keys in index order
    pub fn keys(&self) -> &[EphemeralKey] {
        &self.index_to_key
    }

    pub fn key_at(&self, idx: usize) -> Option<&EphemeralKey> {
        self.index_to_key.get(idx)
    }

    /// Outgoing neighbours of a vertex (sorted)
    pub fn out_neighbors(&self, idx: usize) -> Vec<usize> {
        self.adj
            .get(&idx)
            .map(|targets| targets.keys().copied().collect())
            .unwrap_or_default()
    }

    /// All edges as (payer, payee, edge), in index order
    pub fn edges(&self) -> impl Iterator<Item = (&EphemeralKey, &EphemeralKey, &Edge)> {
        self.adj.iter().flat_map(move |(&from, targets)| {
            targets.iter().map(move |(&to, edge)| {
                (&self.index_to_key[from], &self.index_to_key[to], edge)
            })
        })
    }

    /// Real obligations grouped per ordered pair
    pub fn obligations_by_edge(&self) -> ObligationsByEdge {
        self.edges()
            .filter(|(_, _, edge)| !edge.synthetic)
            .map(|(from, to, edge)| ((from.clone(), to.clone()), edge.obligations.clone()))
            .collect()
    }
}
