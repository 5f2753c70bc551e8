//! The process-wide symbol interning table. Every global symbol name maps to
//! exactly one `Symbol`, whose lifetime spans the whole link. Names are
//! prehashed in parallel while input files are parsed; interning itself runs
//! single threaded so that IDs are deterministic.

use crate::error::Result;
use crate::hash::PassThroughHashMap;
use crate::symbol::Symbol;
use crate::symbol::SymbolName;
use anyhow::Context;
use std::collections::hash_map;
use std::num::NonZeroU32;

/// An index into the symbol table. This is as opposed to a symbol index
/// within an input file, which is an index into the symbol table for just
/// that file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct SymbolId(NonZeroU32);

pub(crate) struct SymbolDb<'data> {
    symbol_ids: PassThroughHashMap<SymbolName<'data>, SymbolId>,
    symbols: Vec<Symbol>,
    names: Vec<SymbolName<'data>>,
}

impl<'data> SymbolDb<'data> {
    pub(crate) fn new() -> Self {
        // Symbol 0 is never used, but allows us to represent IDs with a
        // NonZeroU32.
        Self {
            symbol_ids: Default::default(),
            symbols: vec![Symbol::new()],
            names: vec![SymbolName::new(&[])],
        }
    }

    pub(crate) fn intern(&mut self, name: SymbolName<'data>) -> Result<SymbolId> {
        match self.symbol_ids.entry(name) {
            hash_map::Entry::Occupied(entry) => Ok(*entry.get()),
            hash_map::Entry::Vacant(entry) => {
                let symbol_id = SymbolId(
                    NonZeroU32::new(u32::try_from(self.symbols.len()).context("Too many symbols")?)
                        .unwrap(),
                );
                entry.insert(symbol_id);
                self.symbols.push(Symbol::new());
                self.names.push(name);
                Ok(symbol_id)
            }
        }
    }

    pub(crate) fn get(&self, name: &SymbolName<'data>) -> Option<SymbolId> {
        self.symbol_ids.get(name).copied()
    }

    pub(crate) fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.as_usize()]
    }

    pub(crate) fn symbol_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.as_usize()]
    }

    pub(crate) fn name(&self, id: SymbolId) -> SymbolName<'data> {
        debug_assert_eq!(self.names.len(), self.symbols.len());
        self.names[id.as_usize()]
    }

    pub(crate) fn num_symbols(&self) -> usize {
        self.symbols.len()
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = SymbolId> {
        (1..self.symbols.len() as u32).map(|n| SymbolId(NonZeroU32::new(n).unwrap()))
    }
}

impl SymbolId {
    pub(crate) fn as_usize(self) -> usize {
        self.0.get() as usize
    }
}

impl std::fmt::Display for SymbolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.get().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_dedupes() {
        let mut db = SymbolDb::new();
        let a1 = db.intern(SymbolName::new(b"foo")).unwrap();
        let b = db.intern(SymbolName::new(b"bar")).unwrap();
        let a2 = db.intern(SymbolName::new(b"foo")).unwrap();
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        assert_eq!(db.num_symbols(), 3);
        assert_eq!(db.name(a1).bytes(), b"foo");
        assert_eq!(db.get(&SymbolName::new(b"bar")), Some(b));
        assert_eq!(db.get(&SymbolName::new(b"baz")), None);
    }
}
