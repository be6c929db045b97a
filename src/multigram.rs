//! Multigram inventory (Component A/B): a bijection between `(left-slice,
//! right-slice)` pairs and dense multigram ids.
//!
//! Ids start at 1 ("q >= 1" per the data model); id `0` is reserved as
//! `VOID`, mirroring `symbol::VOID`, and is used by the sequence model as the
//! sentinel "predicted" slot that carries a node's back-off weight. The
//! inventory never stores an entry for `VOID`. `UNK_MULTIGRAM` is a second
//! reserved id, also never stored in the inventory, used by `ANONYMIZE`
//! emergence to route every previously-unseen slice through one shared
//! zero-probability bucket without growing the inventory (so held-out
//! evaluation cannot pollute a model under training).
//!
//! Like `SymbolInventory`, a `&mut MultigramInventory` is required to insert
//! (single-writer), while `&MultigramInventory` reads are freely shareable.

use crate::symbol::SymbolId;
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub type MultigramId = u32;

pub const VOID: MultigramId = 0;
pub const UNK_MULTIGRAM: MultigramId = MultigramId::MAX;

/// A size template: an admissible `(|L|, |R|)` shape for a multigram.
pub type SizeTemplate = (usize, usize);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Multigram {
    pub left: Vec<SymbolId>,
    pub right: Vec<SymbolId>,
}

impl Multigram {
    pub fn new(left: Vec<SymbolId>, right: Vec<SymbolId>) -> Self {
        Self { left, right }
    }

    pub fn size_template(&self) -> SizeTemplate {
        (self.left.len(), self.right.len())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultigramInventory {
    list: Vec<Multigram>,
    dir: AHashMap<Multigram, MultigramId>,
}

impl Default for MultigramInventory {
    fn default() -> Self {
        Self::new()
    }
}

impl MultigramInventory {
    pub fn new() -> Self {
        Self {
            list: Vec::new(),
            dir: AHashMap::default(),
        }
    }

    /// Number of multigrams registered (not counting `VOID`).
    pub fn size(&self) -> usize {
        self.list.len()
    }

    /// Assign (or return the existing) id for `(left, right)`. Idempotent
    /// and order-preserving with respect to first insertion.
    pub fn index(&mut self, left: &[SymbolId], right: &[SymbolId]) -> MultigramId {
        let key = Multigram::new(left.to_vec(), right.to_vec());
        if let Some(&id) = self.dir.get(&key) {
            return id;
        }
        let id = (self.list.len() + 1) as MultigramId;
        self.dir.insert(key.clone(), id);
        self.list.push(key);
        id
    }

    /// Look up an id without inserting. Used by `SUPPRESS` emergence.
    pub fn find(&self, left: &[SymbolId], right: &[SymbolId]) -> Option<MultigramId> {
        let key = Multigram::new(left.to_vec(), right.to_vec());
        self.dir.get(&key).copied()
    }

    pub fn symbol(&self, id: MultigramId) -> &Multigram {
        &self.list[(id - 1) as usize]
    }

    /// The distinct `(|L|, |R|)` shapes currently present in the inventory,
    /// used by the decoder to know what left-length expansions are legal.
    pub fn size_templates(&self) -> Vec<SizeTemplate> {
        let set: BTreeSet<SizeTemplate> = self.list.iter().map(Multigram::size_template).collect();
        set.into_iter().collect()
    }

    /// Ids whose left slice exactly matches `left`, with any right part.
    /// Used by the decoder to enumerate candidate expansions at a given
    /// left position without inventing new multigrams.
    pub fn matching_left<'a>(&'a self, left: &'a [SymbolId]) -> impl Iterator<Item = MultigramId> + 'a {
        self.list.iter().enumerate().filter_map(move |(i, m)| {
            if m.left == left {
                Some((i + 1) as MultigramId)
            } else {
                None
            }
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (MultigramId, &Multigram)> {
        self.list
            .iter()
            .enumerate()
            .map(|(i, m)| ((i + 1) as MultigramId, m))
    }

    /// Produce a new inventory renumbered contiguously from exactly the
    /// multigrams in `keep` (the `strip()` operation, driven by the ids a
    /// published sequence model actually references). Returns the mapping
    /// from old id to new id.
    pub fn strip(&self, keep: &std::collections::HashSet<MultigramId>) -> (Self, AHashMap<MultigramId, MultigramId>) {
        let mut result = Self::new();
        let mut mapping = AHashMap::default();
        let mut ids: Vec<MultigramId> = keep.iter().copied().collect();
        ids.sort_unstable();
        for old_id in ids {
            let m = self.symbol(old_id);
            let new_id = result.index(&m.left, &m.right);
            mapping.insert(old_id, new_id);
        }
        (result, mapping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_assigns_dense_ids_starting_at_one() {
        let mut inv = MultigramInventory::new();
        let a = inv.index(&[1, 2], &[3]);
        let b = inv.index(&[4], &[5, 6]);
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(inv.size(), 2);
    }

    #[test]
    fn index_is_idempotent() {
        let mut inv = MultigramInventory::new();
        let a1 = inv.index(&[1], &[2]);
        let a2 = inv.index(&[1], &[2]);
        assert_eq!(a1, a2);
        assert_eq!(inv.size(), 1);
    }

    #[test]
    fn size_templates_reports_distinct_shapes() {
        let mut inv = MultigramInventory::new();
        inv.index(&[1], &[2]); // (1,1)
        inv.index(&[1], &[]); // (1,0)
        inv.index(&[2], &[]); // (1,0) again
        inv.index(&[], &[3]); // (0,1)
        assert_eq!(inv.size_templates(), vec![(0, 1), (1, 0), (1, 1)]);
    }

    #[test]
    fn matching_left_finds_every_shape_sharing_a_prefix() {
        let mut inv = MultigramInventory::new();
        let a = inv.index(&[1], &[2]);
        let b = inv.index(&[1], &[]);
        let _other = inv.index(&[2], &[3]);
        let mut found: Vec<_> = inv.matching_left(&[1]).collect();
        found.sort_unstable();
        assert_eq!(found, vec![a, b]);
    }

    #[test]
    fn strip_renumbers_contiguously_and_preserves_content() {
        let mut inv = MultigramInventory::new();
        let a = inv.index(&[1], &[2]);
        let _b = inv.index(&[3], &[4]);
        let c = inv.index(&[5], &[6]);

        let mut keep = std::collections::HashSet::new();
        keep.insert(a);
        keep.insert(c);

        let (stripped, mapping) = inv.strip(&keep);
        assert_eq!(stripped.size(), 2);
        let new_a = mapping[&a];
        let new_c = mapping[&c];
        assert_eq!(stripped.symbol(new_a).left, vec![1]);
        assert_eq!(stripped.symbol(new_c).left, vec![5]);
    }
}
