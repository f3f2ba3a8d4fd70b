//! Per-operation instruction emitters
//!
//! Operand loading and result acquisition live here; each operation category
//! has its own file.

mod arith;
mod control;
mod memory;
mod vector;

use rspirv::dr::Operand as SpvOperand;
use rustc_hash::FxHashMap;
use spirv::{MemoryAccess, Word};

use super::builtins::Builtins;
use super::session::Session;
use super::symbols::SymbolTable;
use crate::config::CodegenConfig;
use crate::diagnostics::{InternalError, Result};
use crate::lir::{FunctionKind, Kind, LirFunction, Op, Operand, VarId};

/// Callable function as seen from a call site
#[derive(Debug, Clone)]
pub struct FunctionSignature {
    pub id: Word,
    pub kind: FunctionKind,
    pub return_kind: Kind,
    pub params: Vec<Kind>,
}

/// Translates one function body
pub(crate) struct Emitter<'a> {
    pub session: &'a mut Session,
    pub symbols: &'a mut SymbolTable,
    pub config: &'a CodegenConfig,
    pub function: &'a LirFunction,
    pub builtins: &'a Builtins,
    pub callees: &'a FxHashMap<String, FunctionSignature>,
    /// Shared block void returns branch to
    pub return_block: Option<Word>,
}

impl Emitter<'_> {
    pub fn spill_mode(&self) -> bool {
        !self.config.optimize_load_store
    }

    pub fn kind_of(&self, var: VarId) -> Result<Kind> {
        self.function
            .kind_of(var)
            .ok_or_else(|| InternalError::UndefinedValue(format!("{} has no declared kind", var)).into())
    }

    pub fn operand_kind(&self, operand: &Operand) -> Result<Kind> {
        match operand {
            Operand::Var(v) => self.kind_of(*v),
            Operand::Const(lit) => Ok(lit.kind),
        }
    }

    pub fn type_of(&mut self, kind: Kind) -> Result<Word> {
        self.session.type_of(kind)
    }

    /// Value id of an operand, reloading from its slot in spill mode
    pub fn load_operand(&mut self, operand: &Operand) -> Result<Word> {
        match operand {
            Operand::Const(lit) => self.session.constant(&lit.value, lit.kind),
            Operand::Var(var) => {
                if self.spill_mode() {
                    if let Some(slot) = self.symbols.slot(*var) {
                        let kind = self.kind_of(*var)?;
                        let ty = self.type_of(kind)?;
                        return self
                            .session
                            .emit(spirv::Op::Load, ty, vec![SpvOperand::IdRef(slot)]);
                    }
                }
                self.symbols.resolve(*var)
            }
        }
    }

    /// Load an operand as `kind`; constants are re-declared at that kind
    pub fn load_as(&mut self, operand: &Operand, kind: Kind) -> Result<Word> {
        match operand {
            Operand::Const(lit) if lit.kind != kind => self.session.constant(&lit.value, kind),
            _ => {
                let actual = self.operand_kind(operand)?;
                let id = self.load_operand(operand)?;
                if actual == kind || self.session.type_of(actual)? == self.session.type_of(kind)? {
                    Ok(id)
                } else {
                    self.convert_value(id, actual, kind, true)
                }
            }
        }
    }

    /// Id a new definition of `dst` must use
    pub fn result_for(&mut self, dst: VarId) -> Word {
        self.symbols.result_id(dst, self.session)
    }

    /// Record a definition; spill mode also stores it to the value's slot
    pub fn define(&mut self, dst: VarId, id: Word) -> Result<()> {
        self.symbols.define(dst, id);
        if self.spill_mode() {
            if let Some(slot) = self.symbols.slot(dst) {
                self.session.emit_void(
                    spirv::Op::Store,
                    vec![SpvOperand::IdRef(slot), SpvOperand::IdRef(id)],
                )?;
            }
        }
        Ok(())
    }

    /// Define `dst` as an existing value, copying only when a merge reserved its id
    pub fn forward_value(&mut self, dst: VarId, id: Word) -> Result<()> {
        if self.symbols.has_reservation(dst) {
            let kind = self.kind_of(dst)?;
            let ty = self.type_of(kind)?;
            let result = self.result_for(dst);
            self.session.emit_with_id(
                spirv::Op::CopyObject,
                ty,
                result,
                vec![SpvOperand::IdRef(id)],
            )?;
            return self.define(dst, result);
        }
        self.define(dst, id)
    }

    pub fn aligned(size: u32) -> Vec<SpvOperand> {
        vec![
            SpvOperand::MemoryAccess(MemoryAccess::ALIGNED),
            SpvOperand::LiteralBit32(size.max(1)),
        ]
    }

    pub fn emit_op(&mut self, op: &Op) -> Result<()> {
        tracing::trace!(?op, "emit");
        match op {
            Op::Binary { dst, op, lhs, rhs } => self.emit_binary(*dst, *op, lhs, rhs),
            Op::Unary { dst, op, src } => self.emit_unary(*dst, *op, src),
            Op::Convert { dst, op, src } => self.emit_convert(*dst, *op, src),
            Op::Select {
                dst,
                cmp,
                lhs,
                rhs,
                on_true,
                on_false,
            } => self.emit_select(*dst, *cmp, lhs, rhs, on_true, on_false),
            Op::IntegerTest { dst, lhs, rhs } => self.emit_integer_test(*dst, lhs, rhs),
            Op::Intrinsic { dst, op, args } => self.emit_intrinsic(*dst, *op, args),
            Op::Move { dst, src } => self.emit_move(*dst, src),
            Op::Load { dst, address } => self.emit_load(*dst, address),
            Op::Store { address, value } => self.emit_store(address, value),
            Op::VectorBuild { dst, elements } => self.emit_vector_build(*dst, elements),
            Op::VectorExtract { dst, vector, lane } => {
                self.emit_vector_extract(*dst, vector, *lane)
            }
            Op::VectorInsert {
                dst,
                vector,
                lane,
                value,
            } => self.emit_vector_insert(*dst, vector, *lane, value),
            Op::Call { dst, callee, args } => self.emit_call(*dst, callee, args),
            Op::Phi { dst, .. } => Err(InternalError::Unimplemented(format!(
                "merge for {} after the head of its block",
                dst
            ))
            .into()),
            Op::ThreadId {
                dst,
                query,
                dimension,
            } => self.emit_thread_id(*dst, *query, *dimension),
            Op::Barrier { fence } => self.emit_barrier(*fence),
        }
    }

    fn emit_move(&mut self, dst: VarId, src: &Operand) -> Result<()> {
        let kind = self.kind_of(dst)?;
        let id = self.load_as(src, kind)?;
        self.forward_value(dst, id)
    }

    fn emit_call(&mut self, dst: Option<VarId>, callee: &str, args: &[Operand]) -> Result<()> {
        let signature = self
            .callees
            .get(callee)
            .cloned()
            .ok_or_else(|| InternalError::UnknownFunction(callee.to_string()))?;
        if signature.kind == FunctionKind::Kernel {
            return Err(InternalError::Unimplemented(format!(
                "direct call to kernel `{}`",
                callee
            ))
            .into());
        }
        if signature.params.len() != args.len() {
            return Err(InternalError::Unimplemented(format!(
                "call to `{}` with {} arguments, expected {}",
                callee,
                args.len(),
                signature.params.len()
            ))
            .into());
        }

        let mut operands = vec![SpvOperand::IdRef(signature.id)];
        for (arg, kind) in args.iter().zip(&signature.params) {
            operands.push(SpvOperand::IdRef(self.load_as(arg, *kind)?));
        }

        let ret = self.type_of(signature.return_kind)?;
        match dst {
            Some(dst) => {
                let result = self.result_for(dst);
                self.session
                    .emit_with_id(spirv::Op::FunctionCall, ret, result, operands)?;
                self.define(dst, result)
            }
            None => {
                self.session.emit(spirv::Op::FunctionCall, ret, operands)?;
                Ok(())
            }
        }
    }
}
