//! Stack decoder (Component I): first-best and *n*-best joint decoding
//! over a trained [`Model`].
//!
//! Both searches explore the same space: partial hypotheses keyed by
//! `(position on the left string, sequence-model state)`, as a priority
//! queue ordered by cumulative score (first-best: plain best-first /
//! Dijkstra, since edge weights `-ln p` are never negative; *n*-best: the
//! same queue with an admissible heuristic added, giving the standard
//! lazy A* k-shortest-paths search). Hypotheses are never merged across
//! distinct histories reaching the same state: a full `nBestNext`
//! enumeration must visit every segmentation, not just the best one per
//! state, or the posterior mass reported by `total_log_lik` would
//! undercount.
//!
//! No Python/C++ reference for this component survives in
//! `original_source/`; the search design below is original, built directly
//! against the product-state model the rest of this crate already uses.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::{Error, Result};
use crate::model::Model;
use crate::multigram::MultigramId;
use crate::sequence_model::NodeId;
use crate::symbol::SymbolId;

/// A position on the left string, with a virtual "past the end, `TERM`
/// emitted" state reached only by the final transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pos {
    At(usize),
    Done,
}

#[derive(Debug, Clone)]
struct PartialHyp {
    pos: Pos,
    state: NodeId,
    score: f64,
    tokens: Vec<MultigramId>,
}

struct QueueItem {
    priority: f64,
    position: usize,
    seq: u64,
    hyp: PartialHyp,
}

impl QueueItem {
    fn position_key(&self) -> usize {
        self.position
    }
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.position_key() == other.position_key() && self.seq == other.seq
    }
}
impl Eq for QueueItem {}

// `BinaryHeap` is a max-heap; reversing the natural order here turns it
// into the min-heap the search wants, tie-broken by (lower score, smaller
// position, earliest insertion).
impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .partial_cmp(&self.priority)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.position_key().cmp(&self.position_key()))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One completed translation: the multigram sequence chosen (`TERM`
/// excluded), the right-side symbols it spells out, and its `-ln p`.
#[derive(Debug, Clone)]
pub struct Hypothesis {
    pub tokens: Vec<MultigramId>,
    pub right: Vec<SymbolId>,
    pub score: f64,
}

fn right_of(model: &Model, tokens: &[MultigramId]) -> Vec<SymbolId> {
    tokens
        .iter()
        .flat_map(|&t| model.sequitur.inventory.symbol(t).right.clone())
        .collect()
}

/// Expansions reachable from `hyp`: one child per multigram whose left
/// part matches `left[i..i+a]` for some shape `(a, b)` actually present in
/// the inventory, plus the `TERM` transition once `i == left.len()`.
fn expand(model: &Model, left: &[SymbolId], hyp: &PartialHyp) -> Vec<PartialHyp> {
    let Pos::At(i) = hyp.pos else { return Vec::new() };
    let m = left.len();
    let mut out = Vec::new();

    for (a, _b) in model.sequitur.inventory.size_templates() {
        if a == 0 {
            continue;
        }
        let ni = i + a;
        if ni > m {
            continue;
        }
        for q in model.sequitur.inventory.matching_left(&left[i..ni]) {
            let state = model.sequence_model.advance(hyp.state, q);
            let score = hyp.score + model.sequence_model.score(hyp.state, q);
            let mut tokens = hyp.tokens.clone();
            tokens.push(q);
            out.push(PartialHyp { pos: Pos::At(ni), state, score, tokens });
        }
    }

    if i == m {
        let term = model.sequitur.term;
        let score = hyp.score + model.sequence_model.score(hyp.state, term);
        out.push(PartialHyp { pos: Pos::Done, state: hyp.state, score, tokens: hyp.tokens.clone() });
    }

    out
}

/// `q -> min over model states of score(state, q)`: the best case any
/// direct entry for `q` could ever cost, a legitimate lower bound on its
/// actual cost under whatever state decoding is really in.
fn min_score_for(model: &Model, q: MultigramId) -> f64 {
    let sm = &model.sequence_model;
    let mut best = sm.score(sm.root(), q);
    for history in sm.histories() {
        if let Some(state) = sm.state_for(history) {
            let v = sm.score(state, q);
            if v < best {
                best = v;
            }
        }
    }
    best
}

/// `h[i]`: a lower bound on the remaining cost from position `i` to
/// `TERM`, computed once over the position-only DAG (ignoring
/// sequence-model state), used to steer *n*-best search.
fn heuristic_table(model: &Model, left: &[SymbolId]) -> Vec<f64> {
    let m = left.len();
    let term_cost = min_score_for(model, model.sequitur.term);
    let mut h = vec![f64::INFINITY; m + 1];
    h[m] = term_cost;

    for i in (0..m).rev() {
        let mut best = f64::INFINITY;
        for (a, _b) in model.sequitur.inventory.size_templates() {
            if a == 0 {
                continue;
            }
            let ni = i + a;
            if ni > m {
                continue;
            }
            for q in model.sequitur.inventory.matching_left(&left[i..ni]) {
                let candidate = min_score_for(model, q) + h[ni];
                if candidate < best {
                    best = candidate;
                }
            }
        }
        h[i] = best;
    }
    h
}

fn logsumexp2(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let hi = a.max(b);
    let lo = a.min(b);
    hi + (lo - hi).exp().ln_1p()
}

/// First-best stack decoding: plain best-first search, no heuristic needed
/// since `h = 0` is trivially admissible and edge weights are never
/// negative, so the first completed hypothesis popped is the global
/// optimum.
pub fn translate(model: &Model, left: &[SymbolId], stack_limit: usize) -> Result<Hypothesis> {
    let mut heap = BinaryHeap::new();
    let mut seq = 0u64;
    let start = PartialHyp { pos: Pos::At(0), state: model.sequence_model.root(), score: 0.0, tokens: Vec::new() };
    heap.push(QueueItem { priority: start.score, position: 0, seq, hyp: start });

    let mut expansions = 0usize;
    loop {
        let Some(item) = heap.pop() else {
            return Err(Error::TranslationFailure("no path reaches TERM".into()));
        };
        if item.hyp.pos == Pos::Done {
            let right = right_of(model, &item.hyp.tokens);
            return Ok(Hypothesis { tokens: item.hyp.tokens, right, score: item.hyp.score });
        }
        expansions += 1;
        if expansions > stack_limit {
            return Err(Error::TranslationFailure("stack exceeded".into()));
        }
        for child in expand(model, left, &item.hyp) {
            seq += 1;
            let position = if let Pos::At(p) = child.pos { p } else { usize::MAX };
            heap.push(QueueItem { priority: child.score, position, seq, hyp: child });
        }
    }
}

/// *n*-Best decoding: the same search with an admissible heuristic added
/// to the priority, so successive pops of completed hypotheses come out in
/// non-decreasing score order (lazy A* k-shortest-paths). Enumerate with
/// [`NBestSearch::next_hypothesis`]; track enumerated posterior mass with
/// [`NBestSearch::total_log_lik`].
pub struct NBestSearch<'a> {
    model: &'a Model,
    left: Vec<SymbolId>,
    heuristic: Vec<f64>,
    heap: BinaryHeap<QueueItem>,
    seq: u64,
    stack_limit: usize,
    expansions: usize,
    variants_mass: Option<f64>,
    variants_number: Option<usize>,
    emitted: usize,
    mass_so_far: f64,
    log_lik_so_far: f64,
    exhausted: bool,
}

impl<'a> NBestSearch<'a> {
    pub fn new(
        model: &'a Model,
        left: &[SymbolId],
        stack_limit: usize,
        variants_mass: Option<f64>,
        variants_number: Option<usize>,
    ) -> Self {
        let heuristic = heuristic_table(model, left);
        let mut heap = BinaryHeap::new();
        let start = PartialHyp { pos: Pos::At(0), state: model.sequence_model.root(), score: 0.0, tokens: Vec::new() };
        heap.push(QueueItem { priority: heuristic[0], position: 0, seq: 0, hyp: start });
        Self {
            model,
            left: left.to_vec(),
            heuristic,
            heap,
            seq: 1,
            stack_limit,
            expansions: 0,
            variants_mass,
            variants_number,
            emitted: 0,
            mass_so_far: 0.0,
            log_lik_so_far: f64::NEG_INFINITY,
            exhausted: false,
        }
    }

    fn h(&self, pos: Pos) -> f64 {
        match pos {
            Pos::At(i) => self.heuristic[i],
            Pos::Done => 0.0,
        }
    }

    /// `StopIteration` is modelled as `Ok(None)`: the cutoff (stack limit,
    /// `variants_mass`, `variants_number`, or plain exhaustion) has been
    /// reached, not an error.
    pub fn next_hypothesis(&mut self) -> Result<Option<Hypothesis>> {
        if self.exhausted {
            return Ok(None);
        }
        if let Some(n) = self.variants_number {
            if self.emitted >= n {
                self.exhausted = true;
                return Ok(None);
            }
        }
        if let Some(mass) = self.variants_mass {
            if self.mass_so_far >= mass {
                self.exhausted = true;
                return Ok(None);
            }
        }

        loop {
            let Some(item) = self.heap.pop() else {
                self.exhausted = true;
                return Ok(None);
            };
            if item.hyp.pos == Pos::Done {
                self.emitted += 1;
                self.mass_so_far += (-item.hyp.score).exp();
                self.log_lik_so_far = logsumexp2(self.log_lik_so_far, -item.hyp.score);
                let right = right_of(self.model, &item.hyp.tokens);
                return Ok(Some(Hypothesis { tokens: item.hyp.tokens, right, score: item.hyp.score }));
            }
            self.expansions += 1;
            if self.expansions > self.stack_limit {
                return Err(Error::TranslationFailure("stack exceeded".into()));
            }
            for child in expand(self.model, &self.left, &item.hyp) {
                let priority = child.score + self.h(child.pos);
                let position = if let Pos::At(p) = child.pos { p } else { usize::MAX };
                self.heap.push(QueueItem { priority, position, seq: self.seq, hyp: child });
                self.seq += 1;
            }
        }
    }

    /// `ln(Σ p)` over every completed hypothesis returned so far, an
    /// upper estimate of the enumerated posterior mass, sufficient for
    /// normalisation against a caller's running total.
    pub fn total_log_lik(&self) -> f64 {
        self.log_lik_so_far
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Sequitur;

    fn toy_model() -> (Model, Vec<SymbolId>) {
        let mut sequitur = Sequitur::new();
        let a = sequitur.left.index("a");
        let b = sequitur.left.index("b");
        let x = sequitur.right.index("X");
        let y = sequitur.right.index("Y");

        // two ways to spell "ab": one two-symbol step, or two one-symbol
        // steps, giving genuine ambiguity. Probabilities are hand-picked
        // so the two complete paths' masses sum to exactly 1:
        // 0.6 (ab_whole * term) + 0.8 * 0.5 (a_one * b_one * term) = 1.0.
        let ab_whole = sequitur.inventory.index(&[a, b], &[x]);
        let a_one = sequitur.inventory.index(&[a], &[x]);
        let b_one = sequitur.inventory.index(&[b], &[y]);

        let mut sm = crate::sequence_model::SequenceModel::new();
        sm.set_init_and_term(sequitur.term, sequitur.term);
        sm.set(vec![
            (vec![], ab_whole, -0.6f64.ln()),
            (vec![], a_one, -0.8f64.ln()),
            (vec![], b_one, -0.5f64.ln()),
            (vec![], sequitur.term, 0.0),
        ]);
        let model = Model::new(sequitur, sm, vec![0.0]);
        (model, vec![a, b])
    }

    #[test]
    fn translate_reaches_term_and_spells_right_side() {
        let (model, left) = toy_model();
        let hyp = translate(&model, &left, 1000).unwrap();
        assert!(!hyp.right.is_empty());
        assert!(hyp.score.is_finite());
    }

    #[test]
    fn stack_limit_of_one_fails_on_ambiguous_input() {
        let (model, left) = toy_model();
        let err = translate(&model, &left, 1).unwrap_err();
        match err {
            Error::TranslationFailure(msg) => assert!(msg.contains("stack exceeded")),
            other => panic!("expected TranslationFailure, got {other:?}"),
        }
    }

    #[test]
    fn n_best_enumeration_exhausts_to_total_mass_one() {
        let (model, left) = toy_model();
        let mut search = NBestSearch::new(&model, &left, 10_000, None, None);
        let mut count = 0;
        while search.next_hypothesis().unwrap().is_some() {
            count += 1;
            assert!(count < 10_000, "enumeration did not terminate");
        }
        assert!(count >= 2, "ambiguous input must yield at least 2 segmentations");
        assert!((search.total_log_lik().exp() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn n_best_respects_variants_number_cutoff() {
        let (model, left) = toy_model();
        let mut search = NBestSearch::new(&model, &left, 10_000, None, Some(1));
        assert!(search.next_hypothesis().unwrap().is_some());
        assert!(search.next_hypothesis().unwrap().is_none());
    }

    #[test]
    fn empty_left_string_reaches_term_directly() {
        let mut sequitur = Sequitur::new();
        let mut sm = crate::sequence_model::SequenceModel::new();
        sm.set_init_and_term(sequitur.term, sequitur.term);
        sm.set(vec![(vec![], crate::multigram::VOID, 0.0)]);
        let model = Model::new(sequitur, sm, vec![0.0]);
        let hyp = translate(&model, &[], 10).unwrap();
        assert!(hyp.tokens.is_empty());
        assert!(hyp.right.is_empty());
    }
}
