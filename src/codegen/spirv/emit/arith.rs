//! Arithmetic, comparison, conversion and extended-math emitters

use rspirv::dr::Operand as SpvOperand;
use spirv::{CLOp, Word};

use super::Emitter;
use crate::diagnostics::{InternalError, Result};
use crate::lir::{BinaryOp, ConvertOp, Intrinsic, Kind, Operand, UnaryOp, VarId};

fn unsupported(what: impl std::fmt::Display) -> crate::diagnostics::Error {
    InternalError::Unimplemented(what.to_string()).into()
}

/// Opcode for `op` on operands of `kind`
pub(crate) fn binary_opcode(op: BinaryOp, kind: Kind) -> Result<spirv::Op> {
    use spirv::Op as S;

    if kind.is_bool() {
        return match op {
            BinaryOp::And => Ok(S::LogicalAnd),
            BinaryOp::Or => Ok(S::LogicalOr),
            BinaryOp::Xor | BinaryOp::Ne => Ok(S::LogicalNotEqual),
            BinaryOp::Eq => Ok(S::LogicalEqual),
            _ => Err(unsupported(format!("{:?} on bool", op))),
        };
    }

    if kind.is_float() {
        return match op {
            BinaryOp::Add => Ok(S::FAdd),
            BinaryOp::Sub => Ok(S::FSub),
            BinaryOp::Mul => Ok(S::FMul),
            BinaryOp::Div => Ok(S::FDiv),
            BinaryOp::Rem => Ok(S::FRem),
            BinaryOp::Eq => Ok(S::FOrdEqual),
            BinaryOp::Ne => Ok(S::FUnordNotEqual),
            BinaryOp::Lt => Ok(S::FOrdLessThan),
            BinaryOp::Le => Ok(S::FOrdLessThanEqual),
            BinaryOp::Gt => Ok(S::FOrdGreaterThan),
            BinaryOp::Ge => Ok(S::FOrdGreaterThanEqual),
            _ => Err(unsupported(format!("{:?} on {}", op, kind))),
        };
    }

    if !kind.is_integral() {
        return Err(unsupported(format!("{:?} on {}", op, kind)));
    }

    Ok(match op {
        BinaryOp::Add => S::IAdd,
        BinaryOp::Sub => S::ISub,
        BinaryOp::Mul => S::IMul,
        BinaryOp::Div => S::SDiv,
        BinaryOp::Rem => S::SRem,
        BinaryOp::UDiv => S::UDiv,
        BinaryOp::URem => S::UMod,
        BinaryOp::And => S::BitwiseAnd,
        BinaryOp::Or => S::BitwiseOr,
        BinaryOp::Xor => S::BitwiseXor,
        BinaryOp::Shl => S::ShiftLeftLogical,
        BinaryOp::Shr => S::ShiftRightArithmetic,
        BinaryOp::UShr => S::ShiftRightLogical,
        BinaryOp::Eq => S::IEqual,
        BinaryOp::Ne => S::INotEqual,
        BinaryOp::Lt => S::SLessThan,
        BinaryOp::Le => S::SLessThanEqual,
        BinaryOp::Gt => S::SGreaterThan,
        BinaryOp::Ge => S::SGreaterThanEqual,
        BinaryOp::ULt => S::ULessThan,
        BinaryOp::ULe => S::ULessThanEqual,
        BinaryOp::UGt => S::UGreaterThan,
        BinaryOp::UGe => S::UGreaterThanEqual,
    })
}

impl Emitter<'_> {
    /// Load both operands at a common width, widening the narrower one
    pub(crate) fn reconcile(&mut self, lhs: &Operand, rhs: &Operand) -> Result<(Word, Word, Kind)> {
        let lk = self.operand_kind(lhs)?;
        let rk = self.operand_kind(rhs)?;

        if lk.size() == rk.size() || lk.is_bool() || rk.is_bool() {
            let a = self.load_operand(lhs)?;
            let b = match rhs {
                Operand::Const(lit) if lit.kind != lk => self.session.constant(&lit.value, lk)?,
                _ => self.load_operand(rhs)?,
            };
            return Ok((a, b, lk));
        }

        if lk.lanes() != rk.lanes() {
            return Err(unsupported(format!("mixing {} and {}", lk, rk)));
        }

        let work = if lk.size() > rk.size() { lk } else { rk };
        let a = self.load_as(lhs, work)?;
        let b = self.load_as(rhs, work)?;
        Ok((a, b, work))
    }

    pub(crate) fn emit_binary(
        &mut self,
        dst: VarId,
        op: BinaryOp,
        lhs: &Operand,
        rhs: &Operand,
    ) -> Result<()> {
        let dst_kind = self.kind_of(dst)?;

        let (a, b, work) = if op.is_shift() {
            let lk = self.operand_kind(lhs)?;
            let a = self.load_operand(lhs)?;
            let b = match rhs {
                Operand::Const(lit) => self.session.constant(&lit.value, lk)?,
                Operand::Var(_) => self.load_operand(rhs)?,
            };
            (a, b, lk)
        } else {
            self.reconcile(lhs, rhs)?
        };

        let opcode = binary_opcode(op, work)?;
        let operands = vec![SpvOperand::IdRef(a), SpvOperand::IdRef(b)];

        if op.is_comparison() {
            if dst_kind != Kind::Bool {
                return Err(unsupported(format!("comparison into {}", dst_kind)));
            }
            let ty = self.type_of(Kind::Bool)?;
            let result = self.result_for(dst);
            self.session.emit_with_id(opcode, ty, result, operands)?;
            return self.define(dst, result);
        }

        let work_ty = self.type_of(work)?;
        let dst_ty = self.type_of(dst_kind)?;
        if work_ty == dst_ty {
            let result = self.result_for(dst);
            self.session.emit_with_id(opcode, work_ty, result, operands)?;
            return self.define(dst, result);
        }

        if op.result_width_can_change()
            && work.is_integral()
            && dst_kind.is_integral()
            && dst_kind.lanes() == work.lanes()
        {
            let wide = self.session.emit(opcode, work_ty, operands)?;
            let result = self.result_for(dst);
            self.session.emit_with_id(
                spirv::Op::UConvert,
                dst_ty,
                result,
                vec![SpvOperand::IdRef(wide)],
            )?;
            return self.define(dst, result);
        }

        Err(unsupported(format!("{:?} producing {} from {}", op, dst_kind, work)))
    }

    pub(crate) fn emit_unary(&mut self, dst: VarId, op: UnaryOp, src: &Operand) -> Result<()> {
        let kind = self.kind_of(dst)?;
        let value = self.load_as(src, kind)?;
        let opcode = match (op, kind) {
            (UnaryOp::Neg, k) if k.is_float() => spirv::Op::FNegate,
            (UnaryOp::Neg, k) if k.is_integral() => spirv::Op::SNegate,
            (UnaryOp::Not, Kind::Bool) => spirv::Op::LogicalNot,
            (UnaryOp::Not, k) if k.is_integral() => spirv::Op::Not,
            _ => return Err(unsupported(format!("{:?} on {}", op, kind))),
        };
        let ty = self.type_of(kind)?;
        let result = self.result_for(dst);
        self.session
            .emit_with_id(opcode, ty, result, vec![SpvOperand::IdRef(value)])?;
        self.define(dst, result)
    }

    pub(crate) fn emit_convert(&mut self, dst: VarId, op: ConvertOp, src: &Operand) -> Result<()> {
        let to = self.kind_of(dst)?;
        let from = self.operand_kind(src)?;
        let value = self.load_operand(src)?;

        if self.type_of(from)? == self.type_of(to)? {
            return self.forward_value(dst, value);
        }

        let (opcode, operands) = self.conversion(value, from, to, op)?;
        let ty = self.type_of(to)?;
        let result = self.result_for(dst);
        self.session.emit_with_id(opcode, ty, result, operands)?;
        self.define(dst, result)
    }

    /// Convert an already loaded value, emitting exactly one instruction
    pub(crate) fn convert_value(&mut self, value: Word, from: Kind, to: Kind, signed: bool) -> Result<Word> {
        if self.type_of(from)? == self.type_of(to)? {
            return Ok(value);
        }
        let op = if signed {
            ConvertOp::Signed
        } else {
            ConvertOp::Unsigned
        };
        let (opcode, operands) = self.conversion(value, from, to, op)?;
        let ty = self.type_of(to)?;
        self.session.emit(opcode, ty, operands)
    }

    fn conversion(
        &mut self,
        value: Word,
        from: Kind,
        to: Kind,
        op: ConvertOp,
    ) -> Result<(spirv::Op, Vec<SpvOperand>)> {
        use spirv::Op as S;

        if from.lanes() != to.lanes() {
            return Err(unsupported(format!("conversion from {} to {}", from, to)));
        }

        if op == ConvertOp::Bitcast {
            if from.size() != to.size() || from.is_bool() || to.is_bool() {
                return Err(unsupported(format!("bitcast from {} to {}", from, to)));
            }
            return Ok((S::Bitcast, vec![SpvOperand::IdRef(value)]));
        }

        if from.is_bool() && to.is_integral() {
            let one = self.session.constant("1", to)?;
            let zero = self.session.constant("0", to)?;
            return Ok((
                S::Select,
                vec![
                    SpvOperand::IdRef(value),
                    SpvOperand::IdRef(one),
                    SpvOperand::IdRef(zero),
                ],
            ));
        }
        if from.is_integral() && to.is_bool() {
            let zero = self.session.constant("0", from)?;
            return Ok((
                S::INotEqual,
                vec![SpvOperand::IdRef(value), SpvOperand::IdRef(zero)],
            ));
        }

        let signed = op == ConvertOp::Signed;
        let opcode = match (from.is_float(), to.is_float()) {
            (false, false) if from.is_integral() && to.is_integral() => {
                if signed {
                    S::SConvert
                } else {
                    S::UConvert
                }
            }
            (false, true) if from.is_integral() => {
                if signed {
                    S::ConvertSToF
                } else {
                    S::ConvertUToF
                }
            }
            (true, false) if to.is_integral() => {
                if signed {
                    S::ConvertFToS
                } else {
                    S::ConvertFToU
                }
            }
            (true, true) => S::FConvert,
            _ => return Err(unsupported(format!("conversion from {} to {}", from, to))),
        };
        Ok((opcode, vec![SpvOperand::IdRef(value)]))
    }

    pub(crate) fn emit_select(
        &mut self,
        dst: VarId,
        cmp: BinaryOp,
        lhs: &Operand,
        rhs: &Operand,
        on_true: &Operand,
        on_false: &Operand,
    ) -> Result<()> {
        if !cmp.is_comparison() {
            return Err(unsupported(format!("select on {:?}", cmp)));
        }
        let (a, b, work) = self.reconcile(lhs, rhs)?;
        let bool_ty = self.type_of(Kind::Bool)?;
        let opcode = binary_opcode(cmp, work)?;
        let condition = self.session.emit(
            opcode,
            bool_ty,
            vec![SpvOperand::IdRef(a), SpvOperand::IdRef(b)],
        )?;

        let kind = self.kind_of(dst)?;
        let t = self.load_as(on_true, kind)?;
        let f = self.load_as(on_false, kind)?;
        let ty = self.type_of(kind)?;
        let result = self.result_for(dst);
        self.session.emit_with_id(
            spirv::Op::Select,
            ty,
            result,
            vec![
                SpvOperand::IdRef(condition),
                SpvOperand::IdRef(t),
                SpvOperand::IdRef(f),
            ],
        )?;
        self.define(dst, result)
    }

    pub(crate) fn emit_integer_test(&mut self, dst: VarId, lhs: &Operand, rhs: &Operand) -> Result<()> {
        let (a, b, work) = self.reconcile(lhs, rhs)?;
        if !work.is_integral() {
            return Err(unsupported(format!("integer test on {}", work)));
        }
        let ty = self.type_of(work)?;
        let masked = self.session.emit(
            spirv::Op::BitwiseAnd,
            ty,
            vec![SpvOperand::IdRef(a), SpvOperand::IdRef(b)],
        )?;
        let zero = self.session.constant("0", work)?;
        let bool_ty = self.type_of(Kind::Bool)?;
        let result = self.result_for(dst);
        self.session.emit_with_id(
            spirv::Op::IEqual,
            bool_ty,
            result,
            vec![SpvOperand::IdRef(masked), SpvOperand::IdRef(zero)],
        )?;
        self.define(dst, result)
    }

    pub(crate) fn emit_intrinsic(&mut self, dst: VarId, op: Intrinsic, args: &[Operand]) -> Result<()> {
        if args.len() != op.arity() {
            return Err(unsupported(format!(
                "{:?} with {} arguments",
                op,
                args.len()
            )));
        }
        let kind = self.kind_of(dst)?;
        let inst = cl_op(op, kind)?;

        let mut operands = Vec::with_capacity(args.len());
        for arg in args {
            operands.push(SpvOperand::IdRef(self.load_as(arg, kind)?));
        }

        let ty = self.type_of(kind)?;
        let result = self.result_for(dst);
        self.session.cl_inst(ty, Some(result), inst, operands)?;
        self.define(dst, result)
    }
}

/// OpenCL.std instruction for an intrinsic at `kind`
pub(crate) fn cl_op(op: Intrinsic, kind: Kind) -> Result<CLOp> {
    let float = kind.is_float();
    let int = kind.is_integral();
    let inst = match op {
        Intrinsic::Sqrt if float => CLOp::sqrt,
        Intrinsic::Rsqrt if float => CLOp::rsqrt,
        Intrinsic::Sin if float => CLOp::sin,
        Intrinsic::Cos if float => CLOp::cos,
        Intrinsic::Tan if float => CLOp::tan,
        Intrinsic::Exp if float => CLOp::exp,
        Intrinsic::Log if float => CLOp::log,
        Intrinsic::Pow if float => CLOp::pow,
        Intrinsic::Floor if float => CLOp::floor,
        Intrinsic::Ceil if float => CLOp::ceil,
        Intrinsic::Fma if float => CLOp::fma,
        Intrinsic::Abs if float => CLOp::fabs,
        Intrinsic::Abs if int => CLOp::s_abs,
        Intrinsic::Min if float => CLOp::fmin,
        Intrinsic::Min if int => CLOp::s_min,
        Intrinsic::Max if float => CLOp::fmax,
        Intrinsic::Max if int => CLOp::s_max,
        Intrinsic::UMin if int => CLOp::u_min,
        Intrinsic::UMax if int => CLOp::u_max,
        Intrinsic::Clz if int => CLOp::clz,
        Intrinsic::Popcount if int => CLOp::popcount,
        _ => return Err(unsupported(format!("{:?} on {}", op, kind))),
    };
    Ok(inst)
}
