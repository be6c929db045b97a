//! Estimation graph (Component D): the size-template alignment lattice for
//! one (left, right) training pair, crossed with sequence-model state so
//! that edge weights already reflect the current back-off model.
//!
//! Built as two flat arenas, one for node records and one for edge records, per the
//! "avoid pointer graphs, store ids only" design: every reference between
//! nodes and edges is a plain array index. The graph is ephemeral, rebuilt
//! (or its weights refreshed via `reweight`) once per sample per training
//! iteration.

use crate::error::{Error, Result};
use crate::multigram::{MultigramId, MultigramInventory, SizeTemplate, UNK_MULTIGRAM};
use crate::sequence_model::{NodeId as SmState, SequenceModel, ROOT};
use crate::symbol::{SymbolId, TERM as SYM_TERM, VOID as SYM_VOID};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};

pub type GraphNodeId = u32;

/// Policy for handling a slice that has never been seen before.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Emergence {
    /// Assign a fresh id, growing the inventory.
    Emerge,
    /// Drop the edge; only already-indexed multigrams are usable.
    Suppress,
    /// Route through the shared `UNK_MULTIGRAM` bucket without growing the
    /// inventory. Used for held-out scoring so it cannot pollute a model
    /// under training.
    Anonymize,
}

#[derive(Debug, Clone, Copy)]
pub struct Edge {
    pub src: GraphNodeId,
    pub tgt: GraphNodeId,
    pub label: MultigramId,
    pub weight: f64,
}

/// One sample's alignment lattice, pruned to the nodes that lie on some
/// start-to-`FINAL` path, numbered in topological order.
#[derive(Clone, Debug)]
pub struct EstimationGraph {
    states: Vec<SmState>,
    edges: Vec<Edge>,
    outgoing: Vec<Vec<u32>>,
    incoming: Vec<Vec<u32>>,
    topo_order: Vec<GraphNodeId>,
    start: GraphNodeId,
    final_node: GraphNodeId,
}

impl EstimationGraph {
    pub fn num_nodes(&self) -> usize {
        self.states.len()
    }

    pub fn start(&self) -> GraphNodeId {
        self.start
    }

    pub fn final_node(&self) -> GraphNodeId {
        self.final_node
    }

    pub fn sm_state(&self, node: GraphNodeId) -> SmState {
        self.states[node as usize]
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn outgoing(&self, node: GraphNodeId) -> &[u32] {
        &self.outgoing[node as usize]
    }

    pub fn incoming(&self, node: GraphNodeId) -> &[u32] {
        &self.incoming[node as usize]
    }

    /// Nodes in topological order (`start` first, `final_node` last).
    pub fn topo_order(&self) -> &[GraphNodeId] {
        &self.topo_order
    }

    /// Refresh edge weights against a newer sequence model, keeping the
    /// lattice topology fixed (the per-iteration cached-graph path).
    pub fn reweight(&mut self, model: &SequenceModel) {
        for edge in &mut self.edges {
            edge.weight = model.score(self.states[edge.src as usize], edge.label);
        }
    }

    pub fn build(
        left: &[SymbolId],
        right: &[SymbolId],
        templates: &[SizeTemplate],
        emergence: Emergence,
        term: MultigramId,
        multigrams: &mut MultigramInventory,
        model: &SequenceModel,
    ) -> Result<EstimationGraph> {
        if left.iter().any(|&s| s == SYM_TERM || s == SYM_VOID)
            || right.iter().any(|&s| s == SYM_TERM || s == SYM_VOID)
        {
            return Err(Error::SampleUnreachable(
                "left or right sequence contains TERM or VOID".into(),
            ));
        }
        let m = left.len();
        let n = right.len();
        let max_order = m + n;

        let mut builder = Builder::new(max_order);
        let start = builder.node(0, 0, ROOT);

        for order in 0..=max_order {
            let current = std::mem::take(&mut builder.buckets[order]);
            for node_id in current {
                let (i, j) = builder.positions[node_id as usize];
                let state = builder.states[node_id as usize];
                for &(a, b) in templates {
                    if a == 0 && b == 0 {
                        continue;
                    }
                    let (ni, nj) = (i + a, j + b);
                    if ni > m || nj > n {
                        continue;
                    }
                    let label = match emergence {
                        Emergence::Emerge => Some(multigrams.index(&left[i..ni], &right[j..nj])),
                        Emergence::Suppress => multigrams.find(&left[i..ni], &right[j..nj]),
                        Emergence::Anonymize => Some(
                            multigrams
                                .find(&left[i..ni], &right[j..nj])
                                .unwrap_or(UNK_MULTIGRAM),
                        ),
                    };
                    let Some(label) = label else { continue };
                    let new_state = model.advance(state, label);
                    let weight = model.score(state, label);
                    let target = builder.node(ni, nj, new_state);
                    builder.add_edge(node_id, target, label, weight);
                }
            }
        }

        let finals: Vec<GraphNodeId> = builder
            .positions
            .iter()
            .enumerate()
            .filter(|(_, &(i, j))| i == m && j == n)
            .map(|(id, _)| id as GraphNodeId)
            .collect();
        if finals.is_empty() {
            return Err(Error::SampleUnreachable(
                "no template combination exactly covers the pair".into(),
            ));
        }

        let final_node = builder.node(m + 1, n + 1, ROOT);
        for src in finals {
            let state = builder.states[src as usize];
            let weight = model.score(state, term);
            builder.add_edge(src, final_node, term, weight);
        }

        builder.prune_and_finish(start, final_node)
    }
}

struct Builder {
    positions: Vec<(usize, usize)>,
    states: Vec<SmState>,
    edges: Vec<Edge>,
    outgoing: Vec<Vec<u32>>,
    incoming: Vec<Vec<u32>>,
    index: AHashMap<(usize, usize, SmState), GraphNodeId>,
    buckets: Vec<Vec<GraphNodeId>>,
    orders: Vec<usize>,
}

impl Builder {
    fn new(max_order: usize) -> Self {
        Self {
            positions: Vec::new(),
            states: Vec::new(),
            edges: Vec::new(),
            outgoing: Vec::new(),
            incoming: Vec::new(),
            index: AHashMap::default(),
            buckets: vec![Vec::new(); max_order + 1],
            orders: Vec::new(),
        }
    }

    fn node(&mut self, i: usize, j: usize, state: SmState) -> GraphNodeId {
        let key = (i, j, state);
        if let Some(&id) = self.index.get(&key) {
            return id;
        }
        let id = self.positions.len() as GraphNodeId;
        self.positions.push((i, j));
        self.states.push(state);
        self.outgoing.push(Vec::new());
        self.incoming.push(Vec::new());
        self.index.insert(key, id);
        let order = i + j;
        self.orders.push(order);
        if order < self.buckets.len() {
            self.buckets[order].push(id);
        }
        id
    }

    fn add_edge(&mut self, src: GraphNodeId, tgt: GraphNodeId, label: MultigramId, weight: f64) {
        let edge_id = self.edges.len() as u32;
        self.edges.push(Edge { src, tgt, label, weight });
        self.outgoing[src as usize].push(edge_id);
        self.incoming[tgt as usize].push(edge_id);
    }

    /// Backward-prune nodes with no path to `final_node`, then renumber
    /// compactly in topological order.
    fn prune_and_finish(self, start: GraphNodeId, final_node: GraphNodeId) -> Result<EstimationGraph> {
        let n = self.positions.len();
        let mut reaches_final = vec![false; n];
        let mut stack = vec![final_node];
        reaches_final[final_node as usize] = true;
        while let Some(node) = stack.pop() {
            for &edge_id in &self.incoming[node as usize] {
                let src = self.edges[edge_id as usize].src;
                if !reaches_final[src as usize] {
                    reaches_final[src as usize] = true;
                    stack.push(src);
                }
            }
        }
        if !reaches_final[start as usize] {
            return Err(Error::SampleUnreachable(
                "start position has no path to FINAL".into(),
            ));
        }

        let mut kept: Vec<GraphNodeId> = (0..n as GraphNodeId).filter(|&id| reaches_final[id as usize]).collect();
        kept.sort_by_key(|&id| self.orders[id as usize]);
        let mut remap = vec![GraphNodeId::MAX; n];
        for (new_id, &old_id) in kept.iter().enumerate() {
            remap[old_id as usize] = new_id as GraphNodeId;
        }

        let states = kept.iter().map(|&old| self.states[old as usize]).collect();
        let mut edges = Vec::new();
        let mut outgoing = vec![Vec::new(); kept.len()];
        let mut incoming = vec![Vec::new(); kept.len()];
        for edge in &self.edges {
            if reaches_final[edge.src as usize] && reaches_final[edge.tgt as usize] {
                let new_src = remap[edge.src as usize];
                let new_tgt = remap[edge.tgt as usize];
                let edge_id = edges.len() as u32;
                edges.push(Edge {
                    src: new_src,
                    tgt: new_tgt,
                    label: edge.label,
                    weight: edge.weight,
                });
                outgoing[new_src as usize].push(edge_id);
                incoming[new_tgt as usize].push(edge_id);
            }
        }

        let topo_order = (0..kept.len() as GraphNodeId).collect();

        Ok(EstimationGraph {
            states,
            edges,
            outgoing,
            incoming,
            topo_order,
            start: remap[start as usize],
            final_node: remap[final_node as usize],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::{self, SymbolInventory};

    fn count_paths(graph: &EstimationGraph) -> u64 {
        let mut counts = vec![0u64; graph.num_nodes()];
        counts[graph.start() as usize] = 1;
        for &node in graph.topo_order() {
            let c = counts[node as usize];
            if c == 0 {
                continue;
            }
            for &eid in graph.outgoing(node) {
                let tgt = graph.edges()[eid as usize].tgt;
                counts[tgt as usize] += c;
            }
        }
        counts[graph.final_node() as usize]
    }

    #[test]
    fn reachability_and_segmentation_count() {
        let mut symbols = SymbolInventory::new();
        let a = symbols.index("a");
        let b = symbols.index("b");
        let c = symbols.index("c");
        let x = symbols.index("X");
        let y = symbols.index("Y");

        let mut multigrams = MultigramInventory::new();
        let term = multigrams.index(&[symbol::TERM], &[symbol::TERM]);

        let mut model = SequenceModel::new();
        model.set_zerogram(50);
        model.set_init_and_term(term, term);

        let left = vec![a, b, c];
        let right = vec![x, y];
        let templates = vec![(1, 1), (1, 0), (0, 1)];

        let graph = EstimationGraph::build(
            &left,
            &right,
            &templates,
            Emergence::Emerge,
            term,
            &mut multigrams,
            &model,
        )
        .unwrap();

        assert!(graph.num_nodes() >= 2);
        assert!(count_paths(&graph) >= 3);
    }

    #[test]
    fn term_or_void_in_input_is_rejected() {
        let mut multigrams = MultigramInventory::new();
        let term = multigrams.index(&[symbol::TERM], &[symbol::TERM]);
        let mut model = SequenceModel::new();
        model.set_zerogram(10);

        let left = vec![symbol::TERM];
        let right = vec![2u32];
        let err = EstimationGraph::build(
            &left,
            &right,
            &[(1, 1)],
            Emergence::Emerge,
            term,
            &mut multigrams,
            &model,
        )
        .unwrap_err();
        assert!(matches!(err, Error::SampleUnreachable(_)));
    }

    #[test]
    fn suppress_drops_unreachable_sample() {
        let mut multigrams = MultigramInventory::new();
        let term = multigrams.index(&[symbol::TERM], &[symbol::TERM]);
        let mut model = SequenceModel::new();
        model.set_zerogram(10);

        // Nothing pre-indexed, so SUPPRESS can assign no edges at all.
        let left = vec![2u32, 3u32];
        let right = vec![4u32];
        let err = EstimationGraph::build(
            &left,
            &right,
            &[(1, 1), (1, 0)],
            Emergence::Suppress,
            term,
            &mut multigrams,
            &model,
        )
        .unwrap_err();
        assert!(matches!(err, Error::SampleUnreachable(_)));
    }

    #[test]
    fn no_template_covers_pair_is_unreachable() {
        let mut multigrams = MultigramInventory::new();
        let term = multigrams.index(&[symbol::TERM], &[symbol::TERM]);
        let mut model = SequenceModel::new();
        model.set_zerogram(10);

        let left = vec![2u32, 3u32, 5u32];
        let right = vec![4u32];
        // only (1,1) steps: can never land exactly on (3,1)
        let err = EstimationGraph::build(
            &left,
            &right,
            &[(1, 1)],
            Emergence::Emerge,
            term,
            &mut multigrams,
            &model,
        )
        .unwrap_err();
        assert!(matches!(err, Error::SampleUnreachable(_)));
    }
}
