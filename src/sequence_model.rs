//! Sequence model (Component C): a variable-order back-off distribution
//! over sequences of multigrams, represented as a suffix trie of nodes.
//!
//! A `History` is most-recent-first (index 0 is the newest token, as the
//! data model requires). `suffix(history)` drops the *oldest* token (the
//! last element of the vector), which is the standard back-off shortening
//! (discard the token furthest in the past, keep what is closest to the
//! predicted position). See `DESIGN.md` for why this differs textually from
//! the upstream Python reference, which stores histories oldest-first.
//!
//! Internally this is a packed `Vec<Node>` plus a `history -> NodeId` index,
//! matching the "two integer arenas, no pointer graphs" design: a node only
//! references other nodes by `NodeId` (a plain `u32` index), never by
//! pointer, so the whole model can be serialized as-is.

use crate::multigram::{MultigramId, VOID};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};

pub type NodeId = u32;
pub type History = Vec<MultigramId>;

pub const ROOT: NodeId = 0;

/// A suffix-trie node: one distinct history, its back-off parent, its
/// back-off weight (`-ln bow`, stored under the `VOID` slot conceptually),
/// and its direct `(token -> -ln p)` entries sorted by token for binary
/// search.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node {
    history: History,
    backoff: NodeId,
    bow_score: f64,
    direct: Vec<(MultigramId, f64)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceModel {
    nodes: Vec<Node>,
    #[serde(skip)]
    index: AHashMap<History, NodeId>,
    init: MultigramId,
    term: MultigramId,
}

impl Default for SequenceModel {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceModel {
    pub fn new() -> Self {
        let mut m = Self {
            nodes: Vec::new(),
            index: AHashMap::default(),
            init: VOID,
            term: VOID,
        };
        m.ensure_node(History::new());
        m
    }

    pub fn set_init_and_term(&mut self, init: MultigramId, term: MultigramId) {
        self.init = init;
        self.term = term;
    }

    pub fn init(&self) -> MultigramId {
        self.init
    }

    pub fn term(&self) -> MultigramId {
        self.term
    }

    pub fn root(&self) -> NodeId {
        ROOT
    }

    /// Rebuild the index after deserialization (the index itself is not
    /// serialized, `#[serde(skip)]`, so this must be called once after
    /// loading a model from disk).
    pub fn rebuild_index(&mut self) {
        self.index.clear();
        for (i, node) in self.nodes.iter().enumerate() {
            self.index.insert(node.history.clone(), i as NodeId);
        }
    }

    fn ensure_node(&mut self, history: History) -> NodeId {
        if let Some(&id) = self.index.get(&history) {
            return id;
        }
        let backoff = if history.is_empty() {
            0
        } else {
            let mut parent = history.clone();
            parent.pop();
            self.ensure_node(parent)
        };
        let id = self.nodes.len() as NodeId;
        self.nodes.push(Node {
            history: history.clone(),
            backoff,
            bow_score: 0.0,
            direct: Vec::new(),
        });
        self.index.insert(history, id);
        id
    }

    fn direct_score(&self, node: NodeId, token: MultigramId) -> Option<f64> {
        let d = &self.nodes[node as usize].direct;
        d.binary_search_by_key(&token, |&(t, _)| t)
            .ok()
            .map(|i| d[i].1)
    }

    /// Find the state reached by observing `token` while in `state`: the
    /// longest suffix of `token :: history(state)` that is an actual node
    /// of the model, falling back to `ROOT` if even the unigram `(token,)`
    /// is unknown. This is the standard back-off-LM state transition.
    pub fn advance(&self, state: NodeId, token: MultigramId) -> NodeId {
        let mut ctx = self.nodes[state as usize].history.clone();
        loop {
            let mut candidate = Vec::with_capacity(ctx.len() + 1);
            candidate.push(token);
            candidate.extend_from_slice(&ctx);
            if let Some(&id) = self.index.get(&candidate) {
                return id;
            }
            if ctx.is_empty() {
                return ROOT;
            }
            ctx.pop();
        }
    }

    /// `-ln p(token | state)` via the back-off closure: direct entry if
    /// present, else `bow(state) * p(token | suffix(state))` recursively,
    /// accumulated additively in -ln space.
    pub fn score(&self, state: NodeId, token: MultigramId) -> f64 {
        let mut accum = 0.0;
        let mut s = state;
        loop {
            if let Some(v) = self.direct_score(s, token) {
                return accum + v;
            }
            accum += self.nodes[s as usize].bow_score;
            if s == ROOT {
                return accum;
            }
            s = self.nodes[s as usize].backoff;
        }
    }

    pub fn p(&self, state: NodeId, token: MultigramId) -> f64 {
        (-self.score(state, token)).exp()
    }

    pub fn bow_score(&self, state: NodeId) -> f64 {
        self.nodes[state as usize].bow_score
    }

    pub fn bow(&self, state: NodeId) -> f64 {
        (-self.bow_score(state)).exp()
    }

    pub fn direct_entries(&self, state: NodeId) -> impl Iterator<Item = (MultigramId, f64)> + '_ {
        self.nodes[state as usize].direct.iter().copied()
    }

    pub fn history_of(&self, state: NodeId) -> &History {
        &self.nodes[state as usize].history
    }

    pub fn state_for(&self, history: &History) -> Option<NodeId> {
        self.index.get(history).copied()
    }

    pub fn backoff(&self, state: NodeId) -> NodeId {
        self.nodes[state as usize].backoff
    }

    pub fn histories(&self) -> impl Iterator<Item = &History> {
        self.nodes.iter().map(|n| &n.history)
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn max_order(&self) -> usize {
        self.nodes.iter().map(|n| n.history.len()).max().unwrap_or(0)
    }

    /// Flattened `(history, token-or-VOID, score)` rows, used for
    /// persistence, `strip`, `transpose`, ramp-up and wipe-out (matching
    /// the upstream `get()`/`set()` symmetric round-trip).
    pub fn get(&self) -> Vec<(History, MultigramId, f64)> {
        let mut out = Vec::new();
        for node in &self.nodes {
            out.push((node.history.clone(), VOID, node.bow_score));
            for &(token, score) in &node.direct {
                out.push((node.history.clone(), token, score));
            }
        }
        out
    }

    pub fn set(&mut self, data: Vec<(History, MultigramId, f64)>) {
        self.nodes.clear();
        self.index.clear();
        self.ensure_node(History::new());
        for (history, _, _) in &data {
            self.ensure_node(history.clone());
        }
        for (history, token, score) in data {
            let id = self.index[&history];
            if token == VOID {
                self.nodes[id as usize].bow_score = score;
            } else {
                self.nodes[id as usize].direct.push((token, score));
            }
        }
        for node in &mut self.nodes {
            node.direct.sort_by_key(|&(t, _)| t);
        }
    }

    /// `p(t | zerogram) = 1/Q` for any `t`, with no direct entries at all:
    /// the untrained ("oblivious") model.
    pub fn set_zerogram(&mut self, vocabulary_size: usize) {
        self.nodes.clear();
        self.index.clear();
        self.ensure_node(History::new());
        self.nodes[0].bow_score = (vocabulary_size as f64).ln();
    }

    /// For every `(history, predicted)` direct entry, insert `predicted ::
    /// history` as a bare back-off node (weight 1, i.e. `bow_score = 0`) if
    /// it is not already a node, preparing the skeleton for the next
    /// training iteration to learn one deeper order.
    pub fn ramp_up(&mut self) {
        let mut deepenings = Vec::new();
        for node in &self.nodes {
            for &(predicted, _) in &node.direct {
                let mut deeper = Vec::with_capacity(node.history.len() + 1);
                deeper.push(predicted);
                deeper.extend_from_slice(&node.history);
                deepenings.push(deeper);
            }
        }
        for history in deepenings {
            if !self.index.contains_key(&history) {
                self.ensure_node(history);
            }
        }
    }

    /// Reset every node's direct entries and reduce `bow_score` to 0, then
    /// re-seed the root as a uniform zerogram. The history skeleton (which
    /// histories exist) is preserved so a fixed structure can be
    /// re-estimated from scratch.
    pub fn wipe_out(&mut self, vocabulary_size: usize) {
        for node in &mut self.nodes {
            node.direct.clear();
            node.bow_score = 0.0;
        }
        self.nodes[0].bow_score = (vocabulary_size as f64).ln();
    }
}
