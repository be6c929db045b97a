//! Symbol inventory (Component A): a bijection between external tokens and
//! small dense integer ids, with `VOID` and `TERM` pre-inserted.
//!
//! `VOID` is never emitted; it is only ever used as a sentinel (e.g. to mark
//! a sequence-model node's back-off weight entry). `TERM` is both the
//! beginning- and end-of-string symbol for one side of a training pair.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

pub type SymbolId = u32;

pub const VOID: SymbolId = 0;
pub const TERM: SymbolId = 1;

/// Bijection between external symbols (graphemes, phonemes, ...) and dense
/// ids. `index` is idempotent and order-preserving with respect to first
/// insertion; `VOID` and `TERM` occupy ids 0 and 1 before anything else is
/// inserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolInventory {
    list: Vec<String>,
    dir: AHashMap<String, SymbolId>,
}

impl Default for SymbolInventory {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolInventory {
    pub fn new() -> Self {
        let list = vec!["__void__".to_string(), "__term__".to_string()];
        let mut dir = AHashMap::default();
        dir.insert("__term__".to_string(), TERM);
        Self { list, dir }
    }

    /// Number of symbols, including `TERM` but not `VOID`.
    pub fn size(&self) -> usize {
        self.list.len() - 1
    }

    /// Return the id for `sym`, assigning a new one on first sight.
    pub fn index(&mut self, sym: &str) -> SymbolId {
        if let Some(&id) = self.dir.get(sym) {
            return id;
        }
        let id = self.list.len() as SymbolId;
        self.list.push(sym.to_string());
        self.dir.insert(sym.to_string(), id);
        id
    }

    pub fn symbol(&self, id: SymbolId) -> &str {
        &self.list[id as usize]
    }

    pub fn parse(&mut self, seq: &[impl AsRef<str>]) -> Vec<SymbolId> {
        seq.iter().map(|s| self.index(s.as_ref())).collect()
    }

    pub fn format(&self, ids: &[SymbolId]) -> Vec<&str> {
        ids.iter().map(|&id| self.symbol(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserves_void_and_term() {
        let inv = SymbolInventory::new();
        assert_eq!(inv.symbol(VOID), "__void__");
        assert_eq!(inv.symbol(TERM), "__term__");
        assert_eq!(inv.size(), 1);
    }

    #[test]
    fn index_round_trip_assigns_dense_ids() {
        let mut inv = SymbolInventory::new();
        let a = inv.index("abc");
        let b = inv.index("de");
        assert_eq!((a, b), (2, 3));
        assert_eq!(inv.symbol(3), "de");
    }

    #[test]
    fn index_is_idempotent_and_order_preserving() {
        let mut inv = SymbolInventory::new();
        let a1 = inv.index("x");
        let a2 = inv.index("x");
        assert_eq!(a1, a2);
        let b = inv.index("y");
        assert!(b > a1);
    }

    #[test]
    fn parse_and_format_round_trip() {
        let mut inv = SymbolInventory::new();
        let ids = inv.parse(&["a", "b", "a"]);
        assert_eq!(ids[0], ids[2]);
        let syms = inv.format(&ids);
        assert_eq!(syms, vec!["a", "b", "a"]);
    }
}
