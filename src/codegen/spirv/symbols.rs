//! Value table and the forwarding table for merges

use rustc_hash::FxHashMap;
use spirv::Word;

use super::session::Session;
use crate::diagnostics::{InternalError, Result};
use crate::lir::{ArrayId, BlockId, Kind, Region, VarId};

/// Declared array storage
#[derive(Debug, Clone, Copy)]
pub struct ArraySlot {
    pub variable: Word,
    pub element: Kind,
    pub length: u32,
    pub region: Region,
}

/// Per-function mapping from LIR values to ids
#[derive(Debug, Default)]
pub struct SymbolTable {
    values: FxHashMap<VarId, Word>,
    slots: FxHashMap<VarId, Word>,
    /// Ids merges already refer to; the definition must reuse them
    forward: FxHashMap<VarId, Word>,
    arrays: FxHashMap<ArrayId, ArraySlot>,
    labels: FxHashMap<BlockId, Word>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point `var` at `id`, replacing any earlier definition
    pub fn define(&mut self, var: VarId, id: Word) {
        self.values.insert(var, id);
    }

    pub fn lookup(&self, var: VarId) -> Result<Word> {
        self.values
            .get(&var)
            .copied()
            .ok_or_else(|| InternalError::UndefinedValue(var.to_string()).into())
    }

    /// Consult the forwarding table, then fall back to the plain definition
    pub fn resolve_across_blocks(&self, var: VarId) -> Option<Word> {
        self.forward
            .get(&var)
            .or_else(|| self.values.get(&var))
            .copied()
    }

    /// Resolve `var`, failing if nothing defines or forwards it
    pub fn resolve(&self, var: VarId) -> Result<Word> {
        self.resolve_across_blocks(var)
            .ok_or_else(|| InternalError::UndefinedValue(var.to_string()).into())
    }

    /// Reserve the id a later definition of `var` will take
    pub fn reserve(&mut self, var: VarId, session: &mut Session) -> Word {
        *self.forward.entry(var).or_insert_with(|| session.next_id())
    }

    pub fn has_reservation(&self, var: VarId) -> bool {
        self.forward.contains_key(&var)
    }

    /// Id for a new definition of `dst`: the reserved one if a merge is waiting
    pub fn result_id(&mut self, dst: VarId, session: &mut Session) -> Word {
        self.forward
            .remove(&dst)
            .unwrap_or_else(|| session.next_id())
    }

    /// Values still forwarded when the function closes
    pub fn pending(&self) -> Vec<VarId> {
        let mut out: Vec<VarId> = self.forward.keys().copied().collect();
        out.sort();
        out
    }

    pub fn set_slot(&mut self, var: VarId, slot: Word) {
        self.slots.insert(var, slot);
    }

    pub fn slot(&self, var: VarId) -> Option<Word> {
        self.slots.get(&var).copied()
    }

    pub fn set_array(&mut self, id: ArrayId, slot: ArraySlot) {
        self.arrays.insert(id, slot);
    }

    pub fn array(&self, id: ArrayId) -> Option<ArraySlot> {
        self.arrays.get(&id).copied()
    }

    /// Label of `block`, allocated on first mention
    pub fn label(&mut self, block: BlockId, session: &mut Session) -> Word {
        *self
            .labels
            .entry(block)
            .or_insert_with(|| session.next_id())
    }

    /// Drop everything scoped to the function
    pub fn clear(&mut self) {
        self.values.clear();
        self.slots.clear();
        self.forward.clear();
        self.arrays.clear();
        self.labels.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::spirv::session::TargetInfo;

    #[test]
    fn test_lookup_before_define() {
        let table = SymbolTable::new();
        let err = table.lookup(VarId(7)).unwrap_err();
        assert!(err.to_string().contains("%7"));
    }

    #[test]
    fn test_redefinition_overwrites() {
        let mut table = SymbolTable::new();
        table.define(VarId(1), 10);
        table.define(VarId(1), 11);
        assert_eq!(table.lookup(VarId(1)).unwrap(), 11);
    }

    #[test]
    fn test_reservation_is_consumed() {
        let mut session = Session::new(TargetInfo::default());
        let mut table = SymbolTable::new();
        let reserved = table.reserve(VarId(3), &mut session);
        assert_eq!(table.reserve(VarId(3), &mut session), reserved);
        assert_eq!(table.resolve(VarId(3)).unwrap(), reserved);
        assert_eq!(table.pending(), vec![VarId(3)]);

        let id = table.result_id(VarId(3), &mut session);
        assert_eq!(id, reserved);
        table.define(VarId(3), id);
        assert!(table.pending().is_empty());
        assert_ne!(table.result_id(VarId(3), &mut session), reserved);
    }

    #[test]
    fn test_labels_are_stable() {
        let mut session = Session::new(TargetInfo::default());
        let mut table = SymbolTable::new();
        let a = table.label(BlockId(4), &mut session);
        let b = table.label(BlockId(5), &mut session);
        assert_ne!(a, b);
        assert_eq!(table.label(BlockId(4), &mut session), a);
    }
}
