//! Assembly session: identifier allocation plus the type and constant tables
//!
//! One session backs exactly one module. It owns the rspirv builder, so two
//! modules assembled concurrently never share ids or declarations.

use indexmap::{IndexMap, IndexSet};
use rspirv::dr::{self, Builder, InsertPoint};
use rustc_hash::FxHashMap;
use spirv::{AddressingModel, Capability, MemoryModel, StorageClass, Word};

use half::f16;

use super::literal::{parse_bool, parse_float, parse_int};
use crate::diagnostics::{Bailout, InternalError, Result};
use crate::lir::{Kind, VECTOR_LANES};

/// Device precision flags the assembler needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetInfo {
    pub fp64: bool,
    pub fp16: bool,
}

impl Default for TargetInfo {
    fn default() -> Self {
        Self {
            fp64: true,
            fp16: true,
        }
    }
}

pub struct Session {
    builder: Builder,
    target: TargetInfo,
    capabilities: IndexSet<Capability>,
    types: FxHashMap<Kind, Word>,
    pointers: FxHashMap<(Word, StorageClass), Word>,
    arrays: FxHashMap<(Kind, u32), Word>,
    function_types: FxHashMap<(Word, Vec<Word>), Word>,
    constants: IndexMap<(String, Kind), Word>,
    cl_import: Option<Word>,
    uses_fp64: bool,
    uses_fp16: bool,
}

impl Session {
    pub fn new(target: TargetInfo) -> Self {
        Self {
            builder: Builder::new(),
            target,
            capabilities: IndexSet::new(),
            types: FxHashMap::default(),
            pointers: FxHashMap::default(),
            arrays: FxHashMap::default(),
            function_types: FxHashMap::default(),
            constants: IndexMap::new(),
            cl_import: None,
            uses_fp64: false,
            uses_fp16: false,
        }
    }

    pub fn target(&self) -> TargetInfo {
        self.target
    }

    /// Fresh identifier, never reused within this module
    pub fn next_id(&mut self) -> Word {
        self.builder.id()
    }

    pub(crate) fn builder(&mut self) -> &mut Builder {
        &mut self.builder
    }

    pub fn module(&self) -> &dr::Module {
        self.builder.module_ref()
    }

    /// Capabilities, extended-instruction import and memory model
    pub fn emit_header(&mut self) {
        self.builder.set_version(1, 2);
        for cap in [Capability::Addresses, Capability::Linkage, Capability::Kernel] {
            self.require(cap);
        }
        self.cl_import = Some(self.builder.ext_inst_import("OpenCL.std"));
        self.builder
            .memory_model(AddressingModel::Physical64, MemoryModel::OpenCL);
    }

    /// Declare a capability once per module
    pub fn require(&mut self, capability: Capability) {
        if self.capabilities.insert(capability) {
            self.builder.capability(capability);
        }
    }

    pub fn capabilities(&self) -> impl Iterator<Item = &Capability> {
        self.capabilities.iter()
    }

    pub fn uses_fp64(&self) -> bool {
        self.uses_fp64
    }

    pub fn uses_fp16(&self) -> bool {
        self.uses_fp16
    }

    fn check_precision(&mut self, kind: Kind) -> Result<()> {
        let supported = match kind {
            Kind::F64 => self.target.fp64,
            Kind::F16 => self.target.fp16,
            _ => true,
        };
        if !supported {
            tracing::warn!("target lacks {} support", kind);
            return Err(Bailout::UnsupportedPrecision { kind }.into());
        }
        Ok(())
    }

    pub fn type_of(&mut self, kind: Kind) -> Result<Word> {
        if let Some(&id) = self.types.get(&kind) {
            return Ok(id);
        }

        let id = match kind {
            Kind::Void => self.builder.type_void(),
            Kind::Bool => self.builder.type_bool(),
            Kind::I8 => {
                self.require(Capability::Int8);
                self.builder.type_int(8, 0)
            }
            Kind::I16 => {
                self.require(Capability::Int16);
                self.builder.type_int(16, 0)
            }
            Kind::I32 => self.builder.type_int(32, 0),
            Kind::I64 => {
                self.require(Capability::Int64);
                self.builder.type_int(64, 0)
            }
            Kind::F16 => {
                self.check_precision(kind)?;
                self.require(Capability::Float16);
                self.uses_fp16 = true;
                self.builder.type_float(16)
            }
            Kind::F32 => self.builder.type_float(32),
            Kind::F64 => {
                self.check_precision(kind)?;
                self.require(Capability::Float64);
                self.uses_fp64 = true;
                self.builder.type_float(64)
            }
            Kind::Ptr => self.type_of(Kind::I64)?,
            Kind::Vector { element, lanes } => {
                if !VECTOR_LANES.contains(&lanes) {
                    return Err(InternalError::UnsupportedKind(kind.to_string()).into());
                }
                let element = self.type_of(element.kind())?;
                if lanes >= 8 {
                    self.require(Capability::Vector16);
                }
                self.builder.type_vector(element, lanes as u32)
            }
        };

        self.types.insert(kind, id);
        Ok(id)
    }

    pub fn pointer_to(&mut self, kind: Kind, storage: StorageClass) -> Result<Word> {
        let pointee = self.type_of(kind)?;
        Ok(self.pointer_to_type(pointee, storage))
    }

    pub fn pointer_to_type(&mut self, pointee: Word, storage: StorageClass) -> Word {
        if let Some(&id) = self.pointers.get(&(pointee, storage)) {
            return id;
        }
        if storage == StorageClass::Generic {
            self.require(Capability::GenericPointer);
        }
        let id = self.builder.type_pointer(None, storage, pointee);
        self.pointers.insert((pointee, storage), id);
        id
    }

    pub fn array_of(&mut self, element: Kind, length: u32) -> Result<Word> {
        if let Some(&id) = self.arrays.get(&(element, length)) {
            return Ok(id);
        }
        let element_ty = self.type_of(element)?;
        let length_id = self.constant(&length.to_string(), Kind::I32)?;
        let id = self.builder.type_array(element_ty, length_id);
        self.arrays.insert((element, length), id);
        Ok(id)
    }

    pub fn function_type(&mut self, ret: Word, params: Vec<Word>) -> Word {
        if let Some(&id) = self.function_types.get(&(ret, params.clone())) {
            return id;
        }
        let id = self.builder.type_function(ret, params.clone());
        self.function_types.insert((ret, params), id);
        id
    }

    /// Typed constant keyed by its literal text
    pub fn constant(&mut self, value: &str, kind: Kind) -> Result<Word> {
        let key = (value.to_string(), kind);
        if let Some(&id) = self.constants.get(&key) {
            return Ok(id);
        }

        let ty = self.type_of(kind)?;
        let id = match kind {
            Kind::Bool => {
                if parse_bool(value)? {
                    self.builder.constant_true(ty)
                } else {
                    self.builder.constant_false(ty)
                }
            }
            Kind::I8 | Kind::I16 | Kind::I32 => {
                let bits = parse_int(value, kind)?;
                self.builder.constant_bit32(ty, bits as u32)
            }
            Kind::I64 | Kind::Ptr => {
                let bits = parse_int(value, kind)?;
                self.builder.constant_bit64(ty, bits)
            }
            Kind::F16 => {
                let v = f16::from_f64(parse_float(value, kind)?);
                self.builder.constant_bit32(ty, v.to_bits() as u32)
            }
            Kind::F32 => {
                let v = parse_float(value, kind)? as f32;
                self.builder.constant_bit32(ty, v.to_bits())
            }
            Kind::F64 => {
                let v = parse_float(value, kind)?;
                self.builder.constant_bit64(ty, v.to_bits())
            }
            Kind::Vector { lanes, .. } => {
                let parts: Vec<&str> = value.split(',').collect();
                if parts.len() != lanes as usize {
                    return Err(InternalError::InvalidLiteral {
                        value: value.to_string(),
                        kind,
                    }
                    .into());
                }
                let mut lanes_ids = Vec::with_capacity(parts.len());
                for part in parts {
                    lanes_ids.push(self.constant(part.trim(), kind.element())?);
                }
                self.builder.constant_composite(ty, lanes_ids)
            }
            Kind::Void => {
                return Err(InternalError::UnsupportedKind("void constant".to_string()).into());
            }
        };

        self.constants.insert(key, id);
        Ok(id)
    }

    /// Number of distinct constants declared so far
    pub fn constant_count(&self) -> usize {
        self.constants.len()
    }

    pub fn cl_import(&self) -> Result<Word> {
        self.cl_import.ok_or_else(|| {
            InternalError::InvalidState {
                action: "emit an extended instruction",
                state: "Empty".to_string(),
            }
            .into()
        })
    }

    /// Append `op` to the current block under a fresh id
    pub fn emit(&mut self, op: spirv::Op, result_type: Word, operands: Vec<dr::Operand>) -> Result<Word> {
        let id = self.next_id();
        self.emit_with_id(op, result_type, id, operands)?;
        Ok(id)
    }

    /// Append `op` to the current block under a caller-chosen id
    pub fn emit_with_id(
        &mut self,
        op: spirv::Op,
        result_type: Word,
        id: Word,
        operands: Vec<dr::Operand>,
    ) -> Result<()> {
        let inst = dr::Instruction::new(op, Some(result_type), Some(id), operands);
        self.builder.insert_into_block(InsertPoint::End, inst)?;
        Ok(())
    }

    /// Append an instruction that produces no value
    pub fn emit_void(&mut self, op: spirv::Op, operands: Vec<dr::Operand>) -> Result<()> {
        let inst = dr::Instruction::new(op, None, None, operands);
        self.builder.insert_into_block(InsertPoint::End, inst)?;
        Ok(())
    }

    /// `OpExtInst` on the OpenCL.std import
    pub fn cl_inst(
        &mut self,
        result_type: Word,
        id: Option<Word>,
        inst: spirv::CLOp,
        operands: Vec<dr::Operand>,
    ) -> Result<Word> {
        let set = self.cl_import()?;
        let id = self
            .builder
            .ext_inst(result_type, id, set, inst as u32, operands)?;
        Ok(id)
    }

    /// Module-scope variable, declared outside any function
    pub fn global_variable(&mut self, pointer_type: Word, storage: StorageClass) -> Word {
        self.builder.variable(pointer_type, None, storage, None)
    }

    /// Function-scope variable appended to the current (entry) block
    pub fn local_variable(&mut self, pointer_type: Word) -> Result<Word> {
        let id = self.next_id();
        let inst = dr::Instruction::new(
            spirv::Op::Variable,
            Some(pointer_type),
            Some(id),
            vec![dr::Operand::StorageClass(StorageClass::Function)],
        );
        self.builder.insert_into_block(InsertPoint::End, inst)?;
        Ok(id)
    }

    pub fn name(&mut self, target: Word, name: impl Into<String>) {
        self.builder.name(target, name);
    }

    /// Consume the session and produce the module words
    pub fn into_words(self) -> Vec<u32> {
        use rspirv::binary::Assemble;
        self.builder.module().assemble()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::Element;
    use proptest::prelude::*;

    fn session() -> Session {
        let mut s = Session::new(TargetInfo::default());
        s.emit_header();
        s
    }

    fn count_op(session: &Session, op: spirv::Op) -> usize {
        session
            .module()
            .types_global_values
            .iter()
            .filter(|i| i.class.opcode == op)
            .count()
    }

    #[test]
    fn test_type_dedup() {
        let mut s = session();
        let a = s.type_of(Kind::I32).unwrap();
        let b = s.type_of(Kind::I32).unwrap();
        assert_eq!(a, b);
        assert_eq!(s.type_of(Kind::Ptr).unwrap(), s.type_of(Kind::I64).unwrap());
        assert_eq!(count_op(&s, spirv::Op::TypeInt), 2);
    }

    #[test]
    fn test_vector_declares_element() {
        let mut s = session();
        let float4 = Kind::vector(Element::F32, 4).unwrap();
        s.type_of(float4).unwrap();
        assert_eq!(count_op(&s, spirv::Op::TypeFloat), 1);
        assert_eq!(count_op(&s, spirv::Op::TypeVector), 1);
        assert!(!s.capabilities().any(|c| *c == Capability::Vector16));

        s.type_of(Kind::vector(Element::F32, 16).unwrap()).unwrap();
        assert!(s.capabilities().any(|c| *c == Capability::Vector16));
    }

    #[test]
    fn test_capabilities_once() {
        let mut s = session();
        s.type_of(Kind::I8).unwrap();
        s.type_of(Kind::vector(Element::I8, 4).unwrap()).unwrap();
        s.pointer_to(Kind::I8, StorageClass::Generic).unwrap();
        s.pointer_to(Kind::I32, StorageClass::Generic).unwrap();
        let caps = &s.module().capabilities;
        let int8 = caps
            .iter()
            .filter(|i| i.operands[0] == dr::Operand::Capability(Capability::Int8))
            .count();
        let generic = caps
            .iter()
            .filter(|i| i.operands[0] == dr::Operand::Capability(Capability::GenericPointer))
            .count();
        assert_eq!(int8, 1);
        assert_eq!(generic, 1);
    }

    #[test]
    fn test_pointer_dedup() {
        let mut s = session();
        let a = s.pointer_to(Kind::F32, StorageClass::CrossWorkgroup).unwrap();
        let b = s.pointer_to(Kind::F32, StorageClass::CrossWorkgroup).unwrap();
        let c = s.pointer_to(Kind::F32, StorageClass::Function).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_precision_bailout() {
        let mut s = Session::new(TargetInfo {
            fp64: false,
            fp16: true,
        });
        s.emit_header();
        let err = s.type_of(Kind::F64).unwrap_err();
        assert!(err.is_bailout());
        assert!(s.type_of(Kind::F16).is_ok());
        assert!(s.uses_fp16());
        assert!(!s.uses_fp64());
    }

    #[test]
    fn test_constant_dedup() {
        let mut s = session();
        let a = s.constant("42", Kind::I32).unwrap();
        let b = s.constant("42", Kind::I32).unwrap();
        let c = s.constant("42", Kind::I64).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(s.constant_count(), 2);
    }

    #[test]
    fn test_vector_constant() {
        let mut s = session();
        let int2 = Kind::vector(Element::I32, 2).unwrap();
        s.constant("1, 2", int2).unwrap();
        assert_eq!(count_op(&s, spirv::Op::ConstantComposite), 1);
        assert!(s.constant("1,2,3", int2).is_err());
    }

    #[test]
    fn test_array_and_function_dedup() {
        let mut s = session();
        let a = s.array_of(Kind::I32, 4).unwrap();
        let b = s.array_of(Kind::I32, 4).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, s.array_of(Kind::I32, 8).unwrap());

        let void = s.type_of(Kind::Void).unwrap();
        let int = s.type_of(Kind::I32).unwrap();
        let f = s.function_type(void, vec![int]);
        assert_eq!(f, s.function_type(void, vec![int]));
        assert_ne!(f, s.function_type(int, vec![int]));
    }

    proptest! {
        #[test]
        fn prop_ids_strictly_increase(n in 1usize..256) {
            let mut s = Session::new(TargetInfo::default());
            let ids: Vec<Word> = (0..n).map(|_| s.next_id()).collect();
            prop_assert!(ids.windows(2).all(|w| w[0] < w[1]));
        }

        #[test]
        fn prop_constant_table_dedups(values in proptest::collection::vec(-1000i64..1000, 1..64)) {
            let mut s = session();
            let mut seen = std::collections::HashMap::new();
            for v in &values {
                let id = s.constant(&v.to_string(), Kind::I32).unwrap();
                if let Some(prev) = seen.insert(*v, id) {
                    prop_assert_eq!(prev, id);
                }
            }
            prop_assert_eq!(s.constant_count(), seen.len());
        }
    }
}
