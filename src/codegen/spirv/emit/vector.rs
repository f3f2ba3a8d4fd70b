//! Vector construction and lane access

use rspirv::dr::Operand as SpvOperand;
use spirv::Word;

use super::Emitter;
use crate::diagnostics::{InternalError, Result};
use crate::lir::{Kind, Operand, VarId};

impl Emitter<'_> {
    fn vector_kind(&self, dst: VarId) -> Result<Kind> {
        let kind = self.kind_of(dst)?;
        if !kind.is_vector() {
            return Err(InternalError::UnsupportedKind(format!("{} is not a vector", kind)).into());
        }
        Ok(kind)
    }

    fn check_lane(kind: Kind, lane: u32) -> Result<()> {
        if lane >= kind.lanes() {
            return Err(InternalError::Unimplemented(format!(
                "lane {} of {}",
                lane, kind
            ))
            .into());
        }
        Ok(())
    }

    /// Element operand converted to the vector's lane type
    fn lane_value(&mut self, operand: &Operand, lane: Kind) -> Result<Word> {
        if let Operand::Const(lit) = operand {
            return self.session.constant(&lit.value, lane);
        }
        let actual = self.operand_kind(operand)?;
        let value = self.load_operand(operand)?;
        self.convert_value(value, actual, lane, true)
    }

    pub(crate) fn emit_vector_build(&mut self, dst: VarId, elements: &[Operand]) -> Result<()> {
        let kind = self.vector_kind(dst)?;
        if elements.len() != kind.lanes() as usize {
            return Err(InternalError::Unimplemented(format!(
                "{} built from {} elements",
                kind,
                elements.len()
            ))
            .into());
        }

        let ty = self.type_of(kind)?;
        let lane = kind.element();
        let mut object = self.session.emit(spirv::Op::Undef, ty, Vec::new())?;

        let last = elements.len() - 1;
        for (i, element) in elements.iter().enumerate() {
            let value = self.lane_value(element, lane)?;
            let operands = vec![
                SpvOperand::IdRef(value),
                SpvOperand::IdRef(object),
                SpvOperand::LiteralBit32(i as u32),
            ];
            if i == last {
                let result = self.result_for(dst);
                self.session
                    .emit_with_id(spirv::Op::CompositeInsert, ty, result, operands)?;
                object = result;
            } else {
                object = self.session.emit(spirv::Op::CompositeInsert, ty, operands)?;
            }
        }

        self.define(dst, object)
    }

    pub(crate) fn emit_vector_extract(&mut self, dst: VarId, vector: &Operand, lane: u32) -> Result<()> {
        let kind = self.operand_kind(vector)?;
        Self::check_lane(kind, lane)?;
        let dst_kind = self.kind_of(dst)?;
        let source = self.load_operand(vector)?;

        let lane_ty = self.type_of(kind.element())?;
        let operands = vec![SpvOperand::IdRef(source), SpvOperand::LiteralBit32(lane)];

        if self.type_of(dst_kind)? == lane_ty {
            let result = self.result_for(dst);
            self.session
                .emit_with_id(spirv::Op::CompositeExtract, lane_ty, result, operands)?;
            return self.define(dst, result);
        }

        let extracted = self.session.emit(spirv::Op::CompositeExtract, lane_ty, operands)?;
        let converted = self.convert_value(extracted, kind.element(), dst_kind, true)?;
        self.forward_value(dst, converted)
    }

    pub(crate) fn emit_vector_insert(
        &mut self,
        dst: VarId,
        vector: &Operand,
        lane: u32,
        value: &Operand,
    ) -> Result<()> {
        let kind = self.vector_kind(dst)?;
        Self::check_lane(kind, lane)?;
        let source = self.load_as(vector, kind)?;
        let element = self.lane_value(value, kind.element())?;

        let ty = self.type_of(kind)?;
        let result = self.result_for(dst);
        self.session.emit_with_id(
            spirv::Op::CompositeInsert,
            ty,
            result,
            vec![
                SpvOperand::IdRef(element),
                SpvOperand::IdRef(source),
                SpvOperand::LiteralBit32(lane),
            ],
        )?;
        self.define(dst, result)
    }
}
