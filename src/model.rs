//! Model aggregate: the inventories, sequence model and discount vector
//! that together make up one publishable model (`Sequitur`/`Model` in the
//! reference implementation).
//!
//! `Sequitur` owns the two symbol inventories and the shared multigram
//! inventory; `Model` adds a sequence model and the discount vector it was
//! estimated with. Persistence accepts the older single-component-mixture
//! shape this crate itself used to write, picking the sole component.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::error::{Error, PersistenceError, Result};
use crate::multigram::{MultigramId, MultigramInventory, SizeTemplate, VOID};
use crate::sequence_model::SequenceModel;
use crate::symbol::{SymbolInventory, TERM};

/// The two token spaces and the multigram bijection built over them.
/// `term` is the id of the `(TERM, TERM)` multigram, fixed across every
/// sequence model derived from this inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequitur {
    pub left: SymbolInventory,
    pub right: SymbolInventory,
    pub inventory: MultigramInventory,
    pub term: MultigramId,
}

impl Default for Sequitur {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequitur {
    pub fn new() -> Self {
        Self::with_inventories(SymbolInventory::new(), SymbolInventory::new())
    }

    pub fn with_inventories(left: SymbolInventory, right: SymbolInventory) -> Self {
        let mut inventory = MultigramInventory::new();
        let term = inventory.index(&[TERM], &[TERM]);
        Self { left, right, inventory, term }
    }

    /// `Q`: the size-template-weighted count of possible multigrams, plus
    /// one for `TERM`, used to seed a zerogram and as the estimator's
    /// denominator for unseen-token mass.
    pub fn vocabulary_size(&self, size_templates: &[SizeTemplate]) -> usize {
        let n_left = self.left.size().saturating_sub(1);
        let n_right = self.right.size().saturating_sub(1);
        let mut result: usize = 0;
        for &(l, r) in size_templates {
            result += n_left.pow(l as u32) * n_right.pow(r as u32);
        }
        result + 1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub sequitur: Sequitur,
    pub sequence_model: SequenceModel,
    pub discount: Vec<f64>,
}

impl Model {
    pub fn new(sequitur: Sequitur, sequence_model: SequenceModel, discount: Vec<f64>) -> Self {
        Self { sequitur, sequence_model, discount }
    }

    /// The untrained model: a uniform zerogram over `Q` possible tokens,
    /// no discount yet recorded.
    pub fn oblivious(sequitur: Sequitur, size_templates: &[SizeTemplate]) -> Self {
        let q = sequitur.vocabulary_size(size_templates);
        let mut sequence_model = SequenceModel::new();
        sequence_model.set_init_and_term(sequitur.term, sequitur.term);
        sequence_model.set_zerogram(q);
        Self { sequitur, sequence_model, discount: Vec::new() }
    }

    pub fn ramp_up(&mut self) {
        self.sequence_model.ramp_up();
    }

    pub fn wipe_out(&mut self, size_templates: &[SizeTemplate]) {
        let q = self.sequitur.vocabulary_size(size_templates);
        self.sequence_model.wipe_out(q);
    }

    /// Renumber the multigram inventory to exactly the ids the sequence
    /// model references, contiguously from 1. Used before persisting the
    /// final model so a long training run's append-only inventory growth
    /// doesn't leak into the published artifact.
    pub fn strip(&self) -> Self {
        let mut keep: HashSet<MultigramId> = HashSet::new();
        keep.insert(self.sequitur.term);
        for (history, token, _) in self.sequence_model.get() {
            keep.extend(history.into_iter());
            if token != VOID {
                keep.insert(token);
            }
        }

        let (stripped_inventory, mapping) = self.sequitur.inventory.strip(&keep);
        let mut sequitur =
            Sequitur::with_inventories(self.sequitur.left.clone(), self.sequitur.right.clone());
        sequitur.inventory = stripped_inventory;
        sequitur.term = mapping[&self.sequitur.term];

        let mut rows = Vec::new();
        for (history, token, score) in self.sequence_model.get() {
            let new_history = history.iter().map(|id| mapping[id]).collect();
            let new_token = if token == VOID { VOID } else { mapping[&token] };
            rows.push((new_history, new_token, score));
        }
        let mut sequence_model = SequenceModel::new();
        sequence_model.set_init_and_term(sequitur.term, sequitur.term);
        sequence_model.set(rows);

        Self { sequitur, sequence_model, discount: self.discount.clone() }
    }

    /// Swap left and right (P2G direction): every multigram's left/right
    /// parts swap, replayed in the same insertion order so each multigram
    /// keeps its id (the old inventory's first entry is always the
    /// `(TERM, TERM)` multigram, which is its own transpose).
    pub fn transpose(&self) -> Self {
        let mut sequitur =
            Sequitur::with_inventories(self.sequitur.right.clone(), self.sequitur.left.clone());
        for (old_id, m) in self.sequitur.inventory.iter() {
            let new_id = sequitur.inventory.index(&m.right, &m.left);
            debug_assert_eq!(old_id, new_id, "transpose must preserve multigram ids");
        }
        Self {
            sequitur,
            sequence_model: self.sequence_model.clone(),
            discount: self.discount.clone(),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let persisted = PersistedModel::Single(self.clone());
        let bytes = bincode::serialize(&persisted).map_err(PersistenceError::from)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes).map_err(PersistenceError::from)?;
        std::fs::rename(&tmp, path).map_err(PersistenceError::from)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref()).map_err(PersistenceError::from)?;
        let persisted: PersistedModel = bincode::deserialize(&bytes).map_err(PersistenceError::from)?;
        let mut model = match persisted {
            PersistedModel::Single(model) => model,
            PersistedModel::Mixture { sequitur, components } => {
                if components.len() != 1 {
                    return Err(Error::Persistence(PersistenceError::UnsupportedMixture(
                        components.len(),
                    )));
                }
                let component = components.into_iter().next().unwrap();
                Model {
                    sequitur,
                    sequence_model: component.sequence_model,
                    discount: component.discount,
                }
            }
        };
        model.sequence_model.rebuild_index();
        Ok(model)
    }
}

/// One component of the older mixture-model artifact shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MixtureComponent {
    sequence_model: SequenceModel,
    discount: Vec<f64>,
}

/// On-disk envelope: current artifacts always write `Single`; `Mixture`
/// is read-only back-compat for artifacts this crate wrote before it
/// dropped mixture-model support.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum PersistedModel {
    Single(Model),
    Mixture { sequitur: Sequitur, components: Vec<MixtureComponent> },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence_model::ROOT;

    fn toy_sequitur() -> Sequitur {
        let mut s = Sequitur::new();
        s.left.index("a");
        s.left.index("b");
        s.right.index("x");
        s
    }

    #[test]
    fn oblivious_model_is_a_uniform_zerogram() {
        let sequitur = toy_sequitur();
        let model = Model::oblivious(sequitur, &[(1, 0)]);
        // 2 left symbols (a, b), template (1,0) gives 2 multigrams, plus term.
        assert!((model.sequence_model.p(ROOT, 1) - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn strip_renumbers_and_preserves_scores() {
        let mut sequitur = toy_sequitur();
        let a = sequitur.left.index("a");
        let m1 = sequitur.inventory.index(&[a], &[]);
        let _unused = sequitur.inventory.index(&[a], &[a]); // never referenced by the model

        let mut sm = SequenceModel::new();
        sm.set_init_and_term(sequitur.term, sequitur.term);
        sm.set(vec![(vec![], VOID, 0.5), (vec![], m1, 0.2)]);
        let direct_score = sm.score(ROOT, m1);

        let model = Model::new(sequitur, sm, vec![0.0]);
        let stripped = model.strip();

        // only term and m1 survive; the unused multigram is gone.
        assert_eq!(stripped.sequitur.inventory.size(), 2);
        let new_m1 = stripped.sequitur.inventory.find(&[a], &[]).unwrap();
        assert!((stripped.sequence_model.score(ROOT, new_m1) - direct_score).abs() < 1e-12);
    }

    #[test]
    fn transpose_preserves_multigram_ids() {
        let mut sequitur = toy_sequitur();
        let a = sequitur.left.index("a");
        let x = sequitur.right.index("x");
        let m1 = sequitur.inventory.index(&[a], &[x]);

        let sm = SequenceModel::new();
        let model = Model::new(sequitur, sm, vec![]);
        let transposed = model.transpose();

        assert_eq!(transposed.sequitur.inventory.symbol(m1).left, vec![x]);
        assert_eq!(transposed.sequitur.inventory.symbol(m1).right, vec![a]);
    }

    #[test]
    fn vocabulary_size_counts_term_plus_template_weighted_multigrams() {
        let mut sequitur = Sequitur::new();
        sequitur.left.index("a");
        sequitur.left.index("b");
        sequitur.right.index("x");
        // 2 left symbols, 1 right symbol; template (1,0) gives 2 multigrams, plus 1 for TERM.
        assert_eq!(sequitur.vocabulary_size(&[(1, 0)]), 3);
    }
}
