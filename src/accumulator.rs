//! Forward–backward and Viterbi accumulation over an estimation graph
//! (Component E). Both variants share one topological traversal; only the
//! combine operation at each node differs (log-sum-exp vs max), matching
//! the "parameterise the semiring, don't subclass" design note.

use crate::evidence::EvidenceStore;
use crate::graph::EstimationGraph;
use crate::sequence_model::SequenceModel;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccumulatorKind {
    /// Forward–backward: posteriors are soft, every path contributes.
    Sum,
    /// Best-path only: posteriors are 0/1, used for maximum-approximation EM.
    Viterbi,
}

/// Numerically stable `ln(Σ exp(v))` with the standard max-shift trick.
/// `values` holds log-probabilities (or path scores); an empty iterator is
/// the log-probability of an impossible event.
fn logsumexp(values: impl Iterator<Item = f64>) -> f64 {
    let values: Vec<f64> = values.collect();
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    let sum: f64 = values.iter().map(|&v| (v - max).exp()).sum();
    max + sum.ln()
}

/// Forward pass: `alpha[v]` is the log-probability of reaching `v` from
/// `graph.start()` (summed over paths for `Sum`, best path for `Viterbi`).
/// For `Viterbi`, `best_edge[v]` records the incoming edge on the best path
/// into `v`, for backtracing.
fn forward(graph: &EstimationGraph, kind: AccumulatorKind) -> (Vec<f64>, Vec<Option<u32>>) {
    let n = graph.num_nodes();
    let mut alpha = vec![f64::NEG_INFINITY; n];
    let mut best_edge = vec![None; n];
    alpha[graph.start() as usize] = 0.0;

    for &node in graph.topo_order() {
        let incoming = graph.incoming(node);
        if incoming.is_empty() {
            continue;
        }
        match kind {
            AccumulatorKind::Sum => {
                let vals = incoming.iter().map(|&eid| {
                    let e = graph.edges()[eid as usize];
                    alpha[e.src as usize] - e.weight
                });
                alpha[node as usize] = logsumexp(vals);
            }
            AccumulatorKind::Viterbi => {
                let mut best = f64::NEG_INFINITY;
                let mut best_id = None;
                for &eid in incoming {
                    let e = graph.edges()[eid as usize];
                    let v = alpha[e.src as usize] - e.weight;
                    if v > best {
                        best = v;
                        best_id = Some(eid);
                    }
                }
                alpha[node as usize] = best;
                best_edge[node as usize] = best_id;
            }
        }
    }
    (alpha, best_edge)
}

/// Backward pass: `beta[v]` is the log-probability of reaching `FINAL`
/// starting at `v`. Always the sum semiring, since posteriors are defined in
/// terms of total probability mass through an edge regardless of which
/// accumulator produced `alpha`.
fn backward(graph: &EstimationGraph) -> Vec<f64> {
    let n = graph.num_nodes();
    let mut beta = vec![f64::NEG_INFINITY; n];
    beta[graph.final_node() as usize] = 0.0;

    for &node in graph.topo_order().iter().rev() {
        let outgoing = graph.outgoing(node);
        if outgoing.is_empty() {
            continue;
        }
        let vals = outgoing.iter().map(|&eid| {
            let e = graph.edges()[eid as usize];
            -e.weight + beta[e.tgt as usize]
        });
        beta[node as usize] = logsumexp(vals);
    }
    beta
}

/// Run the configured accumulator over `graph`, harvesting evidence into
/// `evidence` and returning the sample's (weighted) log-likelihood
/// contribution. `weight` scales every harvested evidence value by the
/// sample's multiplicity in the training set.
pub fn accumulate(
    graph: &EstimationGraph,
    model: &SequenceModel,
    kind: AccumulatorKind,
    weight: f64,
    evidence: &mut EvidenceStore,
) -> f64 {
    let (alpha, best_edge) = forward(graph, kind);
    let log_lik = alpha[graph.final_node() as usize];

    match kind {
        AccumulatorKind::Sum => {
            let beta = backward(graph);
            for edge in graph.edges() {
                let posterior =
                    (alpha[edge.src as usize] - edge.weight + beta[edge.tgt as usize] - log_lik).exp();
                if posterior > 0.0 {
                    let history = model.history_of(graph.sm_state(edge.src)).clone();
                    evidence.add(history, edge.label, posterior * weight);
                }
            }
        }
        AccumulatorKind::Viterbi => {
            let mut node = graph.final_node();
            while let Some(eid) = best_edge[node as usize] {
                let edge = graph.edges()[eid as usize];
                let history = model.history_of(graph.sm_state(edge.src)).clone();
                evidence.add(history, edge.label, weight);
                node = edge.src;
            }
        }
    }

    log_lik * weight
}

/// `log p(R | L)` under `model`, with no evidence harvested. The plain
/// scoring path used by discount search and held-out adjudication, where
/// only the number matters. `graph`'s cached weights are refreshed in place
/// against `model` first.
pub fn log_likelihood(graph: &mut EstimationGraph, model: &SequenceModel) -> f64 {
    graph.reweight(model);
    let (alpha, _) = forward(graph, AccumulatorKind::Sum);
    alpha[graph.final_node() as usize]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Emergence;
    use crate::multigram::MultigramInventory;
    use crate::symbol::{self, SymbolInventory};

    fn toy_graph() -> (EstimationGraph, SequenceModel, MultigramInventory) {
        let mut symbols = SymbolInventory::new();
        let a = symbols.index("a");
        let b = symbols.index("b");
        let mut multigrams = MultigramInventory::new();
        let term = multigrams.index(&[symbol::TERM], &[symbol::TERM]);
        let mut model = SequenceModel::new();
        model.set_zerogram(20);
        model.set_init_and_term(term, term);

        let left = vec![a, b];
        let right: Vec<crate::symbol::SymbolId> = vec![];
        // two templates admit two distinct segmentations of a two-symbol left
        // string against an empty right string: one-step-per-symbol, or a
        // single two-symbol step.
        let templates = vec![(1, 0), (2, 0)];
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
        (graph, model, multigrams)
    }

    #[test]
    fn sum_accumulator_posteriors_leaving_start_sum_to_one() {
        let (graph, _model, _mg) = toy_graph();
        let (alpha, _) = forward(&graph, AccumulatorKind::Sum);
        let beta = backward(&graph);
        let log_lik = alpha[graph.final_node() as usize];

        let total: f64 = graph
            .outgoing(graph.start())
            .iter()
            .map(|&eid| {
                let e = graph.edges()[eid as usize];
                (alpha[e.src as usize] - e.weight + beta[e.tgt as usize] - log_lik).exp()
            })
            .sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn viterbi_accumulator_picks_one_full_path() {
        let (graph, model, _mg) = toy_graph();
        let mut evidence = EvidenceStore::new();
        accumulate(&graph, &model, AccumulatorKind::Viterbi, 1.0, &mut evidence);
        // every harvested value under Viterbi is exactly the sample weight
        for (_, _, v) in evidence.consolidate() {
            assert!((v - 1.0).abs() < 1e-12);
        }
        assert!(!evidence.consolidate().is_empty());
    }

    #[test]
    fn sum_accumulator_total_probability_is_one() {
        let (graph, model, _mg) = toy_graph();
        let final_lik = {
            let (alpha, _) = forward(&graph, AccumulatorKind::Sum);
            alpha[graph.final_node() as usize]
        };
        assert!(final_lik <= 1e-9); // log-probability, must be <= 0
        assert!(final_lik.exp() > 0.0 && final_lik.exp() <= 1.0 + 1e-9);
    }
}
