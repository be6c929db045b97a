//! Evidence store and Kneser–Ney-style estimator (Component F).
//!
//! `EvidenceStore` aggregates the fractional counts the accumulator
//! harvests from estimation graphs. `kneser_ney_discount` redistributes
//! that mass top-down by absolute discounting, one order at a time, and
//! `compile` turns the discounted evidence into a fresh `SequenceModel`,
//! bottom-up, so that every longer history's conditional can fold in the
//! already-compiled probability of its own suffix.

use crate::error::Error;
use crate::multigram::{MultigramId, VOID};
use crate::sequence_model::{History, SequenceModel};
use ahash::AHashMap;
use tracing::warn;

/// A single `(history, predicted) -> accumulated value` table. Values are
/// always positive; merging identical keys is additive.
#[derive(Debug, Clone, Default)]
pub struct EvidenceStore {
    rows: AHashMap<(History, MultigramId), f64>,
}

impl EvidenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, history: History, predicted: MultigramId, value: f64) {
        if value <= 0.0 {
            return;
        }
        *self.rows.entry((history, predicted)).or_insert(0.0) += value;
    }

    /// Insertion-order-independent merge, used to combine per-worker
    /// evidence buffers from concurrent sample accumulation.
    pub fn merge(&mut self, other: EvidenceStore) {
        for (key, value) in other.rows {
            *self.rows.entry(key).or_insert(0.0) += value;
        }
    }

    pub fn total(&self) -> f64 {
        self.rows.values().sum()
    }

    pub fn maximum_history_length(&self) -> usize {
        self.rows.keys().map(|(h, _)| h.len()).max().unwrap_or(0)
    }

    /// Rows sorted by `(history, predicted)` lexicographically, so
    /// discounting is reproducible regardless of sample-processing order.
    pub fn consolidate(&self) -> Vec<(History, MultigramId, f64)> {
        let mut rows: Vec<(History, MultigramId, f64)> =
            self.rows.iter().map(|(&(ref h, t), &v)| (h.clone(), t, v)).collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        rows
    }

    pub fn grouped(&self) -> AHashMap<History, Vec<(MultigramId, f64)>> {
        let mut groups: AHashMap<History, Vec<(MultigramId, f64)>> = AHashMap::default();
        for (history, predicted, value) in self.consolidate() {
            groups.entry(history).or_default().push((predicted, value));
        }
        groups
    }

    pub fn group_sums(&self) -> AHashMap<History, f64> {
        let mut sums: AHashMap<History, f64> = AHashMap::default();
        for ((history, _), &value) in &self.rows {
            *sums.entry(history.clone()).or_insert(0.0) += value;
        }
        sums
    }
}

/// Per-order `(discounted entries, totals)` produced by
/// [`kneser_ney_discount`], indexed ascending (index 0 is the zerogram).
pub type DiscountedLevel = (Vec<(History, MultigramId, f64)>, AHashMap<History, f64>);

/// Redistribute evidence top-down: for each history length `k` from the
/// deepest observed order down to 0, evidence exceeding `discount[k]` is
/// emitted at that order and the discount is carried to the suffix
/// history; evidence at or under the discount carries in full. At order 0
/// there is no shorter history to carry to, so the clipped remainder is
/// simply absorbed into the zerogram's own back-off weight.
pub fn kneser_ney_discount(evidence: &EvidenceStore, discount: &[f64]) -> Vec<DiscountedLevel> {
    let max_order = evidence.maximum_history_length();
    let mut genuine: Vec<Vec<(History, MultigramId, f64)>> = vec![Vec::new(); max_order + 1];
    for (history, predicted, value) in evidence.consolidate() {
        let order = history.len();
        genuine[order].push((history, predicted, value));
    }

    let mut carried: AHashMap<(History, MultigramId), f64> = AHashMap::default();
    let mut levels: Vec<Option<DiscountedLevel>> = (0..=max_order).map(|_| None).collect();

    for level in (0..=max_order).rev() {
        for (history, predicted, value) in genuine[level].drain(..) {
            *carried.entry((history, predicted)).or_insert(0.0) += value;
        }

        let mut totals: AHashMap<History, f64> = AHashMap::default();
        for ((history, _), &value) in &carried {
            if history.len() == level {
                *totals.entry(history.clone()).or_insert(0.0) += value;
            }
        }

        let d = discount
            .get(level)
            .copied()
            .unwrap_or_else(|| discount.last().copied().unwrap_or(0.0));

        let mut discounted = Vec::new();
        let mut next_carried: AHashMap<(History, MultigramId), f64> = AHashMap::default();
        let this_level: Vec<((History, MultigramId), f64)> = carried
            .iter()
            .filter(|((h, _), _)| h.len() == level)
            .map(|(k, &v)| (k.clone(), v))
            .collect();
        for ((history, predicted), value) in this_level {
            carried.remove(&(history.clone(), predicted));
            if value > d {
                discounted.push((history.clone(), predicted, value - d));
                if level > 0 {
                    let mut suffix = history.clone();
                    suffix.pop();
                    *next_carried.entry((suffix, predicted)).or_insert(0.0) += d;
                }
            } else if level > 0 {
                let mut suffix = history.clone();
                suffix.pop();
                *next_carried.entry((suffix, predicted)).or_insert(0.0) += value;
            }
        }

        levels[level] = Some((discounted, totals));
        carried = next_carried;
    }

    levels.into_iter().map(|l| l.unwrap()).collect()
}

fn neg_ln(p: f64) -> f64 {
    if p <= 0.0 {
        f64::INFINITY
    } else {
        -p.ln()
    }
}

/// Build a fresh sequence model from discounted evidence, processing
/// history orders shortest-first so each longer history's conditional can
/// fold in the already-compiled probability of its suffix. `vocabulary_size`
/// is `Q`, the size-template-weighted count of possible multigrams plus one
/// for `TERM`, used to seed the zerogram's reservation for unseen tokens.
pub fn compile(levels: &[DiscountedLevel], vocabulary_size: usize) -> SequenceModel {
    let zero_gram_probability = 1.0 / vocabulary_size as f64;
    let mut model = SequenceModel::new();
    let mut rows: Vec<(History, MultigramId, f64)> = Vec::new();

    for (discounted, totals) in levels {
        let mut grouped: AHashMap<History, Vec<(MultigramId, f64)>> = AHashMap::default();
        for (history, predicted, value) in discounted {
            if *predicted == crate::multigram::UNK_MULTIGRAM || history.contains(&crate::multigram::UNK_MULTIGRAM) {
                continue;
            }
            grouped.entry(history.clone()).or_default().push((*predicted, *value));
        }

        let mut this_level_rows = Vec::new();
        let mut histories: Vec<&History> = totals.keys().collect();
        histories.sort();
        for history in histories {
            let denom = totals[history];
            if denom <= 0.0 {
                continue;
            }
            let is_root = history.is_empty();
            let entries = grouped.get(history);
            let sum_fraction: f64 = entries
                .map(|e| e.iter().map(|&(_, v)| v / denom).sum())
                .unwrap_or(0.0);
            let mut bow = (1.0 - sum_fraction).max(0.0);
            if is_root {
                bow *= zero_gram_probability;
            }
            this_level_rows.push((history.clone(), VOID, neg_ln(bow)));

            if let Some(entries) = entries {
                for &(predicted, value) in entries {
                    let mut p = value / denom;
                    if is_root {
                        p += bow;
                    } else {
                        let mut suffix = history.clone();
                        suffix.pop();
                        let suffix_state = model
                            .state_for(&suffix)
                            .expect("suffix history must already be compiled at a shallower order");
                        p += bow * model.p(suffix_state, predicted);
                    }
                    if p > 0.0 {
                        this_level_rows.push((history.clone(), predicted, neg_ln(p)));
                    } else {
                        let reason = Error::NumericUnderflow(format!("{history:?} -> {predicted}"));
                        warn!(%reason, "direct probability non-positive, skipping entry");
                    }
                }
            }
        }

        rows.extend(this_level_rows);
        model.set(rows.clone());
    }

    model
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence_model::ROOT;

    #[test]
    fn zerogram_only_evidence_yields_direct_probabilities() {
        let mut ev = EvidenceStore::new();
        ev.add(vec![], 10, 3.0);
        ev.add(vec![], 11, 1.0);
        let levels = kneser_ney_discount(&ev, &[0.0]);
        let model = compile(&levels, 100);
        // direct: 3/4 + bow*zeroGramProb, bow = (1 - 4/4)*zeroGramProb = 0
        let p10 = model.p(ROOT, 10);
        assert!((p10 - 0.75).abs() < 1e-9);
    }

    #[test]
    fn discounting_reserves_mass_for_unseen_tokens() {
        let mut ev = EvidenceStore::new();
        ev.add(vec![], 10, 5.0);
        ev.add(vec![], 11, 5.0);
        let levels = kneser_ney_discount(&ev, &[1.0]);
        let model = compile(&levels, 1000);
        let p_unseen = model.p(ROOT, 999);
        assert!(p_unseen > 0.0);
        let p10 = model.p(ROOT, 10);
        let p11 = model.p(ROOT, 11);
        assert!(p10 < 0.5 && p11 < 0.5);
    }

    #[test]
    fn back_off_chain_through_two_orders() {
        let mut ev = EvidenceStore::new();
        // history [5] (order 1) predicts 20 three times, predicts 21 once.
        ev.add(vec![5], 20, 3.0);
        ev.add(vec![5], 21, 1.0);
        // zerogram evidence for the same tokens, so backoff has something
        // to fall onto.
        ev.add(vec![], 20, 2.0);
        ev.add(vec![], 21, 2.0);
        let discount = vec![0.0, 0.5];
        let levels = kneser_ney_discount(&ev, &discount);
        let model = compile(&levels, 500);
        let s = model.state_for(&vec![5]).unwrap();
        let p20 = model.p(s, 20);
        let p21 = model.p(s, 21);
        assert!(p20 > p21);
        assert!(p20 < 1.0 && p21 > 0.0);
    }

    #[test]
    fn unk_multigram_excluded_from_direct_entries() {
        let mut ev = EvidenceStore::new();
        ev.add(vec![], crate::multigram::UNK_MULTIGRAM, 5.0);
        ev.add(vec![], 7, 5.0);
        let levels = kneser_ney_discount(&ev, &[0.0]);
        let model = compile(&levels, 200);
        // UNK never gets a direct row: p(UNK|root) falls through to bow*zerogram.
        let p_unk = model.p(ROOT, crate::multigram::UNK_MULTIGRAM);
        let p_other_unseen = model.p(ROOT, 123456);
        assert!((p_unk - p_other_unseen).abs() < 1e-12);
    }
}
