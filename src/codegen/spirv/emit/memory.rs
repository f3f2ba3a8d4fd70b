//! Address lowering plus loads and stores

use rspirv::dr::Operand as SpvOperand;
use spirv::{CLOp, StorageClass, Word};

use super::Emitter;
use crate::diagnostics::{InternalError, Result};
use crate::lir::{Address, ArrayId, Kind, Operand, Region, VarId};

/// Scalar kind a memory access is typed with
fn access_kind(kind: Kind) -> Kind {
    if kind.is_vector() {
        kind.element()
    } else {
        kind.storage()
    }
}

fn origin(what: impl Into<String>) -> crate::diagnostics::Error {
    InternalError::AddressOrigin(what.into()).into()
}

impl Emitter<'_> {
    /// Byte offset or element index widened to 64 bits
    fn index_to_i64(&mut self, operand: &Operand) -> Result<Word> {
        match operand {
            Operand::Const(lit) => self.session.constant(&lit.value, Kind::I64),
            Operand::Var(var) => {
                let kind = self.kind_of(*var)?;
                let value = self.load_operand(operand)?;
                match kind {
                    Kind::I64 | Kind::Ptr => Ok(value),
                    Kind::I8 | Kind::I16 | Kind::I32 => {
                        let long = self.type_of(Kind::I64)?;
                        self.session
                            .emit(spirv::Op::SConvert, long, vec![SpvOperand::IdRef(value)])
                    }
                    other => Err(origin(format!("{} used as an index ({})", var, other))),
                }
            }
        }
    }

    fn raw_pointer(
        &mut self,
        base: VarId,
        offset: Option<&Operand>,
        storage: StorageClass,
        access: Kind,
    ) -> Result<Word> {
        let base_kind = self.kind_of(base)?;
        if !matches!(base_kind, Kind::I64 | Kind::Ptr) {
            return Err(origin(format!("{} of kind {} is not an address", base, base_kind)));
        }
        let mut address = self.load_operand(&Operand::Var(base))?;
        if let Some(offset) = offset {
            let offset = self.index_to_i64(offset)?;
            let long = self.type_of(Kind::I64)?;
            address = self.session.emit(
                spirv::Op::IAdd,
                long,
                vec![SpvOperand::IdRef(address), SpvOperand::IdRef(offset)],
            )?;
        }
        let pointer = self.session.pointer_to(access, storage)?;
        self.session.emit(
            spirv::Op::ConvertUToPtr,
            pointer,
            vec![SpvOperand::IdRef(address)],
        )
    }

    fn array_pointer(
        &mut self,
        array: ArrayId,
        region: Region,
        index: &Operand,
        access: Kind,
    ) -> Result<Word> {
        let slot = self
            .symbols
            .array(array)
            .ok_or_else(|| origin(format!("{} was never declared", array)))?;
        if slot.region != region {
            return Err(origin(format!(
                "{} is {} but accessed as {}",
                array, slot.region, region
            )));
        }
        let storage = match region {
            Region::Private => StorageClass::Function,
            Region::Local => StorageClass::Workgroup,
        };

        let index = self.index_to_i64(index)?;
        let zero = self.session.constant("0", Kind::I64)?;
        let element = slot.element.storage();
        let element_ptr = self.session.pointer_to(element, storage)?;
        let pointer = self.session.emit(
            spirv::Op::InBoundsPtrAccessChain,
            element_ptr,
            vec![
                SpvOperand::IdRef(slot.variable),
                SpvOperand::IdRef(zero),
                SpvOperand::IdRef(index),
            ],
        )?;

        if self.type_of(element)? == self.type_of(access)? {
            return Ok(pointer);
        }
        let access_ptr = self.session.pointer_to(access, storage)?;
        self.session
            .emit(spirv::Op::Bitcast, access_ptr, vec![SpvOperand::IdRef(pointer)])
    }

    /// Typed pointer for an access of `kind` at `address`
    pub(crate) fn lower_address(&mut self, address: &Address, kind: Kind) -> Result<Word> {
        let access = access_kind(kind);
        match address {
            Address::Heap { base, offset } => {
                self.raw_pointer(*base, offset.as_ref(), StorageClass::CrossWorkgroup, access)
            }
            Address::Generic { base, offset } => {
                self.raw_pointer(*base, offset.as_ref(), StorageClass::Generic, access)
            }
            Address::Private { array, index } => {
                self.array_pointer(*array, Region::Private, index, access)
            }
            Address::Local { array, index } => {
                self.array_pointer(*array, Region::Local, index, access)
            }
        }
    }

    pub(crate) fn emit_load(&mut self, dst: VarId, address: &Address) -> Result<()> {
        let kind = self.kind_of(dst)?;
        let pointer = self.lower_address(address, kind)?;

        if kind.is_vector() {
            let ty = self.type_of(kind)?;
            let zero = self.session.constant("0", Kind::I64)?;
            let result = self.result_for(dst);
            self.session.cl_inst(
                ty,
                Some(result),
                CLOp::vloadn,
                vec![
                    SpvOperand::IdRef(zero),
                    SpvOperand::IdRef(pointer),
                    SpvOperand::LiteralBit32(kind.lanes()),
                ],
            )?;
            return self.define(dst, result);
        }

        let mut operands = vec![SpvOperand::IdRef(pointer)];
        operands.extend(Self::aligned(kind.storage().size()));

        if kind.is_bool() {
            let byte = self.type_of(Kind::I8)?;
            let raw = self.session.emit(spirv::Op::Load, byte, operands)?;
            let zero = self.session.constant("0", Kind::I8)?;
            let bool_ty = self.type_of(Kind::Bool)?;
            let result = self.result_for(dst);
            self.session.emit_with_id(
                spirv::Op::INotEqual,
                bool_ty,
                result,
                vec![SpvOperand::IdRef(raw), SpvOperand::IdRef(zero)],
            )?;
            return self.define(dst, result);
        }

        let ty = self.type_of(kind)?;
        let result = self.result_for(dst);
        self.session
            .emit_with_id(spirv::Op::Load, ty, result, operands)?;
        self.define(dst, result)
    }

    pub(crate) fn emit_store(&mut self, address: &Address, value: &Operand) -> Result<()> {
        let kind = self.operand_kind(value)?;
        let pointer = self.lower_address(address, kind)?;
        let mut value = self.load_operand(value)?;

        if kind.is_vector() {
            let void = self.type_of(Kind::Void)?;
            let zero = self.session.constant("0", Kind::I64)?;
            self.session.cl_inst(
                void,
                None,
                CLOp::vstoren,
                vec![
                    SpvOperand::IdRef(value),
                    SpvOperand::IdRef(zero),
                    SpvOperand::IdRef(pointer),
                ],
            )?;
            return Ok(());
        }

        if kind.is_bool() {
            let byte = self.type_of(Kind::I8)?;
            let one = self.session.constant("1", Kind::I8)?;
            let zero = self.session.constant("0", Kind::I8)?;
            value = self.session.emit(
                spirv::Op::Select,
                byte,
                vec![
                    SpvOperand::IdRef(value),
                    SpvOperand::IdRef(one),
                    SpvOperand::IdRef(zero),
                ],
            )?;
        }

        let mut operands = vec![SpvOperand::IdRef(pointer), SpvOperand::IdRef(value)];
        operands.extend(Self::aligned(kind.storage().size()));
        self.session.emit_void(spirv::Op::Store, operands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::Element;

    #[test]
    fn test_access_kind() {
        assert_eq!(access_kind(Kind::Bool), Kind::I8);
        assert_eq!(access_kind(Kind::F32), Kind::F32);
        assert_eq!(
            access_kind(Kind::vector(Element::F16, 8).unwrap()),
            Kind::F16
        );
    }
}
