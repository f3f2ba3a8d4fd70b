//! Merges, terminators and work-item queries

use rspirv::dr::Operand as SpvOperand;
use spirv::{LoopControl, MemorySemantics, Scope, Word};

use super::Emitter;
use crate::diagnostics::{InternalError, Result};
use crate::lir::{Block, BlockId, Element, Fence, Kind, Op, Operand, Terminator, ThreadQuery, VarId};

impl Emitter<'_> {
    fn predecessors(&self, block: BlockId) -> Vec<BlockId> {
        self.function
            .blocks
            .iter()
            .filter(|b| b.terminator.successors().contains(&block))
            .map(|b| b.id)
            .collect()
    }

    /// One incoming pair per predecessor, and nothing else
    fn check_incoming(
        dst: VarId,
        merge: BlockId,
        preds: &[BlockId],
        incoming: &[(BlockId, Operand)],
    ) -> Result<()> {
        let malformed = |reason: String| -> Result<()> {
            Err(InternalError::MalformedMerge {
                merge: dst.to_string(),
                reason,
            }
            .into())
        };
        let mut seen = Vec::with_capacity(incoming.len());
        for (pred, _) in incoming {
            if !preds.contains(pred) {
                return malformed(format!("{} is not a predecessor of {}", pred, merge));
            }
            if seen.contains(pred) {
                return malformed(format!("{} appears twice", pred));
            }
            seen.push(*pred);
        }
        if incoming.len() != preds.len() {
            return malformed(format!(
                "{} incoming values for {} predecessors of {}",
                incoming.len(),
                preds.len(),
                merge
            ));
        }
        Ok(())
    }

    fn label(&mut self, block: BlockId) -> Word {
        self.symbols.label(block, self.session)
    }

    /// Emit the block's leading phis; returns how many ops they covered
    pub(crate) fn emit_phis(&mut self, block: &Block) -> Result<usize> {
        let phis: Vec<(VarId, &[(BlockId, Operand)])> = block
            .ops
            .iter()
            .map_while(|op| match op {
                Op::Phi { dst, incoming } => Some((*dst, incoming.as_slice())),
                _ => None,
            })
            .collect();
        if phis.is_empty() {
            return Ok(0);
        }

        let preds = self.predecessors(block.id);
        for (dst, incoming) in &phis {
            Self::check_incoming(*dst, block.id, &preds, incoming)?;
        }
        let results: Vec<Word> = phis.iter().map(|(dst, _)| self.result_for(*dst)).collect();

        let mut emitted = Vec::with_capacity(phis.len());
        for (index, (dst, incoming)) in phis.iter().enumerate() {
            let kind = self.kind_of(*dst)?;
            let ty = self.type_of(kind)?;
            let result = results[index];

            let mut pairs = Vec::with_capacity(incoming.len());
            for (pred, operand) in incoming.iter() {
                let value = match operand {
                    Operand::Const(lit) => self.session.constant(&lit.value, kind)?,
                    Operand::Var(var) => {
                        if let Some(pos) = phis.iter().position(|(d, _)| d == var) {
                            results[pos]
                        } else if let Some(id) = self.symbols.resolve_across_blocks(*var) {
                            id
                        } else if preds.len() <= 2 {
                            self.symbols.reserve(*var, self.session)
                        } else {
                            return Err(InternalError::UndefinedValue(format!(
                                "{} reaches merge {} before its definition",
                                var, dst
                            ))
                            .into());
                        }
                    }
                };
                let label = self.label(*pred);
                pairs.push((value, label));
            }

            // A merge that names itself takes the value arriving on its other edges
            let replacement = pairs.iter().map(|(v, _)| *v).find(|v| *v != result);
            let Some(replacement) = replacement else {
                return Err(InternalError::PhiCycle(dst.to_string()).into());
            };
            let mut operands = Vec::with_capacity(pairs.len() * 2);
            for (value, label) in pairs {
                let value = if value == result { replacement } else { value };
                operands.push(SpvOperand::IdRef(value));
                operands.push(SpvOperand::IdRef(label));
            }

            self.session
                .emit_with_id(spirv::Op::Phi, ty, result, operands)?;
            emitted.push((*dst, result));
        }

        for (dst, result) in emitted {
            self.define(dst, result)?;
        }
        Ok(phis.len())
    }

    fn condition(&mut self, operand: &Operand) -> Result<Word> {
        let kind = self.operand_kind(operand)?;
        if kind.is_bool() {
            return self.load_operand(operand);
        }
        if !kind.is_integral() {
            return Err(InternalError::Unimplemented(format!("branch on {}", kind)).into());
        }
        let value = self.load_operand(operand)?;
        let zero = self.session.constant("0", kind)?;
        let bool_ty = self.type_of(Kind::Bool)?;
        self.session.emit(
            spirv::Op::INotEqual,
            bool_ty,
            vec![SpvOperand::IdRef(value), SpvOperand::IdRef(zero)],
        )
    }

    pub(crate) fn emit_terminator(&mut self, terminator: &Terminator) -> Result<()> {
        match terminator {
            Terminator::Jump(target) => {
                let label = self.label(*target);
                self.session.builder().branch(label)?;
            }
            Terminator::Branch {
                condition,
                on_true,
                on_false,
                loop_hint,
            } => {
                let condition = self.condition(condition)?;
                let t = self.label(*on_true);
                let f = self.label(*on_false);
                if let Some(hint) = loop_hint {
                    let merge = self.label(hint.merge);
                    let cont = self.label(hint.continue_target);
                    let control = if hint.unroll {
                        LoopControl::UNROLL
                    } else {
                        LoopControl::NONE
                    };
                    self.session.builder().loop_merge(merge, cont, control, [])?;
                }
                self.session.builder().branch_conditional(condition, t, f, [])?;
            }
            Terminator::Switch {
                selector,
                cases,
                default,
            } => {
                let kind = self.operand_kind(selector)?;
                if !kind.is_integral() {
                    return Err(InternalError::Unimplemented(format!("switch on {}", kind)).into());
                }
                let wide = kind.size() == 8;
                let value = self.load_operand(selector)?;
                let default = self.label(*default);
                let mut targets = Vec::with_capacity(cases.len());
                for (case, block) in cases {
                    let literal = if wide {
                        SpvOperand::LiteralBit64(*case as u64)
                    } else {
                        SpvOperand::LiteralBit32(*case as u32)
                    };
                    targets.push((literal, self.label(*block)));
                }
                self.session.builder().switch(value, default, targets)?;
            }
            Terminator::Return(None) => match self.return_block {
                Some(label) => self.session.builder().branch(label)?,
                None => self.session.builder().ret()?,
            },
            Terminator::Return(Some(value)) => {
                if self.function.is_kernel() {
                    return Err(InternalError::Unimplemented(format!(
                        "kernel `{}` returning a value",
                        self.function.name
                    ))
                    .into());
                }
                let value = self.load_as(value, self.function.return_kind)?;
                self.session.builder().ret_value(value)?;
            }
            Terminator::Unreachable => self.session.builder().unreachable()?,
        }
        Ok(())
    }

    pub(crate) fn emit_thread_id(&mut self, dst: VarId, query: ThreadQuery, dimension: u32) -> Result<()> {
        if dimension > 2 {
            return Err(InternalError::Unimplemented(format!(
                "{:?} dimension {}",
                query, dimension
            ))
            .into());
        }
        let dst_kind = self.kind_of(dst)?;
        if !dst_kind.is_integral() || dst_kind.is_vector() {
            return Err(InternalError::UnsupportedKind(format!("{:?} into {}", query, dst_kind)).into());
        }

        let var = self.builtins.variable(query)?;
        let ulong3 = Kind::vector(Element::I64, 3)?;
        let vec_ty = self.type_of(ulong3)?;
        let long_ty = self.type_of(Kind::I64)?;
        let loaded = self
            .session
            .emit(spirv::Op::Load, vec_ty, vec![SpvOperand::IdRef(var)])?;
        let operands = vec![SpvOperand::IdRef(loaded), SpvOperand::LiteralBit32(dimension)];

        if dst_kind.size() == 8 {
            let result = self.result_for(dst);
            self.session
                .emit_with_id(spirv::Op::CompositeExtract, long_ty, result, operands)?;
            return self.define(dst, result);
        }

        let wide = self.session.emit(spirv::Op::CompositeExtract, long_ty, operands)?;
        let ty = self.type_of(dst_kind)?;
        let result = self.result_for(dst);
        self.session
            .emit_with_id(spirv::Op::UConvert, ty, result, vec![SpvOperand::IdRef(wide)])?;
        self.define(dst, result)
    }

    pub(crate) fn emit_barrier(&mut self, fence: Fence) -> Result<()> {
        let memory = match fence {
            Fence::Local => MemorySemantics::WORKGROUP_MEMORY,
            Fence::Global => MemorySemantics::CROSS_WORKGROUP_MEMORY,
        };
        let semantics = memory | MemorySemantics::SEQUENTIALLY_CONSISTENT;
        let scope = self
            .session
            .constant(&(Scope::Workgroup as u32).to_string(), Kind::I32)?;
        let semantics = self
            .session
            .constant(&semantics.bits().to_string(), Kind::I32)?;
        self.session.emit_void(
            spirv::Op::ControlBarrier,
            vec![
                SpvOperand::IdRef(scope),
                SpvOperand::IdRef(scope),
                SpvOperand::IdRef(semantics),
            ],
        )
    }
}
