//! Module assembler: the per-module state machine driving the emitters
//!
//! A module moves through `Empty -> HeaderEmitted -> InFunction -> InBlock ->
//! FunctionClosed` once per function and ends in `Done`. Every transition is
//! checked; a call made in the wrong state is an internal error, and a
//! function that fails half way leaves the assembler unusable.

use rspirv::dr::Operand as SpvOperand;
use rustc_hash::FxHashMap;
use spirv::{
    Decoration, ExecutionMode, ExecutionModel, FunctionControl, LinkageType, StorageClass, Word,
};
use std::fmt;

use super::builtins::Builtins;
use super::emit::{Emitter, FunctionSignature};
use super::session::{Session, TargetInfo};
use super::symbols::{ArraySlot, SymbolTable};
use crate::config::CodegenConfig;
use crate::diagnostics::{Bailout, InternalError, Result};
use crate::lir::{FunctionKind, Kind, LirFunction, LirModule, Region};

/// Frame slots ahead of the first kernel argument
pub const RESERVED_SLOTS: u32 = 3;

/// OpenCL C keywords and type names a function may not be called
const RESERVED_NAMES: &[&str] = &[
    "kernel",
    "__kernel",
    "global",
    "__global",
    "local",
    "__local",
    "constant",
    "__constant",
    "private",
    "__private",
    "generic",
    "__generic",
    "pipe",
    "read_only",
    "write_only",
    "read_write",
    "__read_only",
    "__write_only",
    "__read_write",
    "image1d_t",
    "image1d_array_t",
    "image1d_buffer_t",
    "image2d_t",
    "image2d_array_t",
    "image2d_depth_t",
    "image3d_t",
    "sampler_t",
    "event_t",
    "queue_t",
    "clk_event_t",
    "reserve_id_t",
    "ndrange_t",
    "bool",
    "char",
    "uchar",
    "short",
    "ushort",
    "int",
    "uint",
    "long",
    "ulong",
    "half",
    "float",
    "double",
    "void",
    "size_t",
    "ptrdiff_t",
    "intptr_t",
    "uintptr_t",
    "restrict",
    "volatile",
    "const",
    "static",
    "extern",
    "inline",
    "typedef",
    "struct",
    "union",
    "enum",
    "sizeof",
    "main",
];

pub fn is_reserved_name(name: &str) -> bool {
    RESERVED_NAMES.contains(&name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerState {
    Empty,
    HeaderEmitted,
    InFunction,
    InBlock,
    FunctionClosed,
    Done,
}

impl fmt::Display for AssemblerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AssemblerState::Empty => "Empty",
            AssemblerState::HeaderEmitted => "HeaderEmitted",
            AssemblerState::InFunction => "InFunction",
            AssemblerState::InBlock => "InBlock",
            AssemblerState::FunctionClosed => "FunctionClosed",
            AssemblerState::Done => "Done",
        };
        f.write_str(name)
    }
}

/// Assembled module ready for installation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledModule {
    pub name: String,
    pub words: Vec<u32>,
    pub entry_points: Vec<String>,
}

impl CompiledModule {
    /// Little-endian byte stream
    pub fn to_bytes(&self) -> Vec<u8> {
        words_to_bytes(&self.words)
    }

    pub fn disassemble(&self) -> Result<String> {
        disassemble_words(&self.words)
    }
}

pub fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

pub fn bytes_to_words(bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.len() % 4 != 0 {
        return Err(InternalError::Execution(format!(
            "module length {} is not a whole number of words",
            bytes.len()
        ))
        .into());
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

pub fn disassemble_words(words: &[u32]) -> Result<String> {
    use rspirv::binary::Disassemble;

    let module = rspirv::dr::load_words(words)
        .map_err(|e| InternalError::Execution(format!("malformed module: {:?}", e)))?;
    Ok(module.disassemble())
}

/// Assemble every function of `module` into one binary
pub fn assemble_module(
    module: &LirModule,
    target: TargetInfo,
    config: &CodegenConfig,
) -> Result<CompiledModule> {
    for function in &module.functions {
        ModuleAssembler::check_name(&function.name)?;
    }

    let mut assembler = ModuleAssembler::new(module.name.clone(), target, config.clone());
    assembler.emit_header()?;
    for function in &module.functions {
        assembler.declare_function(function)?;
    }
    for function in &module.functions {
        assembler.assemble_function(function)?;
    }
    assembler.finish()
}

pub struct ModuleAssembler {
    name: String,
    session: Session,
    config: CodegenConfig,
    state: AssemblerState,
    builtins: Builtins,
    symbols: SymbolTable,
    callees: FxHashMap<String, FunctionSignature>,
    kernels: Vec<(String, Word)>,
    functions_assembled: usize,
}

impl ModuleAssembler {
    pub fn new(name: impl Into<String>, target: TargetInfo, config: CodegenConfig) -> Self {
        Self {
            name: name.into(),
            session: Session::new(target),
            config,
            state: AssemblerState::Empty,
            builtins: Builtins::default(),
            symbols: SymbolTable::new(),
            callees: FxHashMap::default(),
            kernels: Vec::new(),
            functions_assembled: 0,
        }
    }

    pub fn state(&self) -> AssemblerState {
        self.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// True while nothing at all has been emitted
    pub fn is_empty(&self) -> bool {
        let module = self.session.module();
        module.capabilities.is_empty()
            && module.types_global_values.is_empty()
            && module.functions.is_empty()
    }

    pub fn check_name(name: &str) -> Result<()> {
        if is_reserved_name(name) {
            tracing::warn!(name, "function name is a reserved keyword");
            return Err(Bailout::ReservedName {
                name: name.to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn expect_state(&self, action: &'static str, allowed: &[AssemblerState]) -> Result<()> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        Err(InternalError::InvalidState {
            action,
            state: self.state.to_string(),
        }
        .into())
    }

    /// Capabilities, memory model and thread builtins, once per module
    pub fn emit_header(&mut self) -> Result<()> {
        self.expect_state("emit the module header", &[AssemblerState::Empty])?;
        self.session.emit_header();
        self.builtins = Builtins::declare(&mut self.session)?;
        self.state = AssemblerState::HeaderEmitted;
        Ok(())
    }

    /// Reserve the id and signature of a function so calls may precede its body
    pub fn declare_function(&mut self, function: &LirFunction) -> Result<FunctionSignature> {
        if let Some(sig) = self.callees.get(&function.name) {
            return Ok(sig.clone());
        }
        self.expect_state(
            "declare a function",
            &[AssemblerState::HeaderEmitted, AssemblerState::FunctionClosed],
        )?;
        let signature = FunctionSignature {
            id: self.session.next_id(),
            kind: function.kind,
            return_kind: function.return_kind,
            params: function.params.iter().map(|p| p.kind).collect(),
        };
        self.callees
            .insert(function.name.clone(), signature.clone());
        Ok(signature)
    }

    pub fn assemble_function(&mut self, function: &LirFunction) -> Result<()> {
        Self::check_name(&function.name)?;
        if self.state == AssemblerState::Empty {
            self.emit_header()?;
        }
        self.expect_state(
            "open a function",
            &[AssemblerState::HeaderEmitted, AssemblerState::FunctionClosed],
        )?;
        let Some(entry) = function.entry() else {
            return Err(InternalError::Unimplemented(format!(
                "function `{}` has no blocks",
                function.name
            ))
            .into());
        };
        if function.is_kernel() && function.return_kind != Kind::Void {
            return Err(InternalError::Unimplemented(format!(
                "kernel `{}` returning {}",
                function.name, function.return_kind
            ))
            .into());
        }

        tracing::debug!(function = %function.name, blocks = function.blocks.len(), "assembling function");
        let signature = self.declare_function(function)?;
        self.symbols.clear();
        self.declare_local_arrays(function)?;

        self.state = AssemblerState::InFunction;
        let params = self.open_function(function, &signature)?;

        self.session.builder().begin_block(None)?;
        self.state = AssemblerState::InBlock;

        let ordinal = self.functions_assembled;
        let debug_names = self.config.debug_names;
        let return_block = (self.config.return_label && function.return_kind == Kind::Void)
            .then(|| self.session.next_id());

        let mut emitter = Emitter {
            session: &mut self.session,
            symbols: &mut self.symbols,
            config: &self.config,
            function,
            builtins: &self.builtins,
            callees: &self.callees,
            return_block,
        };

        declare_private_storage(&mut emitter, function)?;
        bind_parameters(&mut emitter, function, &params)?;
        let entry_label = emitter.symbols.label(entry, emitter.session);
        emitter.session.builder().branch(entry_label)?;

        for block in &function.blocks {
            let label = emitter.symbols.label(block.id, emitter.session);
            emitter.session.builder().begin_block(Some(label))?;
            if debug_names {
                emitter
                    .session
                    .name(label, format!("B{}_kernel{}", block.id.0, ordinal));
            }

            let phis = emitter.emit_phis(block)?;
            for op in &block.ops[phis..] {
                emitter.emit_op(op)?;
            }
            emitter.emit_terminator(&block.terminator)?;
        }

        if let Some(label) = return_block {
            emitter.session.builder().begin_block(Some(label))?;
            emitter.session.builder().ret()?;
        }

        let pending = emitter.symbols.pending();
        if let Some(first) = pending.first() {
            return Err(InternalError::UndefinedValue(format!(
                "{} is referenced by a merge but never defined",
                first
            ))
            .into());
        }

        self.session.builder().end_function()?;
        if function.is_kernel() {
            self.kernels.push((function.name.clone(), signature.id));
        }
        self.functions_assembled += 1;
        self.state = AssemblerState::FunctionClosed;
        Ok(())
    }

    fn declare_local_arrays(&mut self, function: &LirFunction) -> Result<()> {
        for array in function.arrays.iter().filter(|a| a.region == Region::Local) {
            let element = array.element.storage();
            let array_ty = self.session.array_of(element, array.length)?;
            let pointer = self
                .session
                .pointer_to_type(array_ty, StorageClass::Workgroup);
            let variable = self
                .session
                .global_variable(pointer, StorageClass::Workgroup);
            self.session.builder().decorate(
                variable,
                Decoration::Alignment,
                [SpvOperand::LiteralBit32(element.size().max(1))],
            );
            self.symbols.set_array(
                array.id,
                ArraySlot {
                    variable,
                    element: array.element,
                    length: array.length,
                    region: Region::Local,
                },
            );
        }
        Ok(())
    }

    /// Function header and parameters; returns the parameter ids
    fn open_function(&mut self, function: &LirFunction, signature: &FunctionSignature) -> Result<Vec<Word>> {
        let (ret, param_types, control) = match function.kind {
            FunctionKind::Kernel => {
                let byte_ptr = self
                    .session
                    .pointer_to(Kind::I8, StorageClass::CrossWorkgroup)?;
                let long = self.session.type_of(Kind::I64)?;
                let void = self.session.type_of(Kind::Void)?;
                (void, vec![byte_ptr, long], FunctionControl::NONE)
            }
            FunctionKind::Device => {
                let ret = self.session.type_of(function.return_kind)?;
                let mut types = Vec::with_capacity(function.params.len());
                for param in &function.params {
                    types.push(self.session.type_of(param.kind)?);
                }
                (ret, types, FunctionControl::DONT_INLINE)
            }
        };

        let fn_ty = self.session.function_type(ret, param_types.clone());
        self.session
            .builder()
            .begin_function(ret, Some(signature.id), control, fn_ty)?;

        let mut ids = Vec::with_capacity(param_types.len());
        for ty in param_types {
            ids.push(self.session.builder().function_parameter(ty)?);
        }

        if self.config.debug_names {
            self.session.name(signature.id, function.name.clone());
            match function.kind {
                FunctionKind::Kernel => {
                    self.session.name(ids[0], "heap_base");
                    self.session.name(ids[1], "frame_base");
                }
                FunctionKind::Device => {
                    for (param, id) in function.params.iter().zip(&ids) {
                        if let Some(name) = &param.name {
                            self.session.name(*id, name.clone());
                        }
                    }
                }
            }
        }

        match function.kind {
            FunctionKind::Kernel => {
                let interface = self.builtins.interface();
                self.session.builder().entry_point(
                    ExecutionModel::Kernel,
                    signature.id,
                    function.name.clone(),
                    interface,
                );
            }
            FunctionKind::Device => {
                self.session.builder().decorate(
                    signature.id,
                    Decoration::LinkageAttributes,
                    [
                        SpvOperand::LiteralString(function.name.clone()),
                        SpvOperand::LinkageType(LinkageType::Export),
                    ],
                );
            }
        }

        Ok(ids)
    }

    /// Close the module; every function must have been closed
    pub fn finish(mut self) -> Result<CompiledModule> {
        self.expect_state("finish the module", &[AssemblerState::FunctionClosed])?;

        if self.session.uses_fp64() && self.session.uses_fp16() {
            for (_, id) in &self.kernels {
                self.session
                    .builder()
                    .execution_mode(*id, ExecutionMode::ContractionOff, []);
            }
        }

        let entry_points: Vec<String> = self.kernels.iter().map(|(n, _)| n.clone()).collect();
        self.state = AssemblerState::Done;
        let words = self.session.into_words();
        tracing::info!(
            module = %self.name,
            words = words.len(),
            kernels = entry_points.len(),
            "module assembled"
        );
        Ok(CompiledModule {
            name: self.name,
            words,
            entry_points,
        })
    }
}

/// Function-scope variables: private arrays plus, in spill mode, one slot per value
fn declare_private_storage(emitter: &mut Emitter<'_>, function: &LirFunction) -> Result<()> {
    for array in function.arrays.iter().filter(|a| a.region == Region::Private) {
        let array_ty = emitter.session.array_of(array.element.storage(), array.length)?;
        let pointer = emitter
            .session
            .pointer_to_type(array_ty, StorageClass::Function);
        let variable = emitter.session.local_variable(pointer)?;
        emitter.symbols.set_array(
            array.id,
            ArraySlot {
                variable,
                element: array.element,
                length: array.length,
                region: Region::Private,
            },
        );
    }

    if emitter.spill_mode() {
        for (var, kind) in function.all_values() {
            let pointer = emitter.session.pointer_to(kind, StorageClass::Function)?;
            let slot = emitter.session.local_variable(pointer)?;
            if emitter.config.debug_names {
                emitter.session.name(slot, format!("v{}", var.0));
            }
            emitter.symbols.set_slot(var, slot);
        }
    }
    Ok(())
}

/// Define every declared parameter, reading kernel arguments out of the frame
fn bind_parameters(emitter: &mut Emitter<'_>, function: &LirFunction, ids: &[Word]) -> Result<()> {
    if !function.is_kernel() {
        for (param, id) in function.params.iter().zip(ids) {
            emitter.define(param.var, *id)?;
        }
        return Ok(());
    }

    let (heap, frame_base) = (ids[0], ids[1]);
    let byte_ptr = emitter
        .session
        .pointer_to(Kind::I8, StorageClass::CrossWorkgroup)?;
    let slot_ptr = emitter
        .session
        .pointer_to(Kind::I64, StorageClass::CrossWorkgroup)?;
    let long = emitter.type_of(Kind::I64)?;

    let frame_bytes = emitter.session.emit(
        spirv::Op::InBoundsPtrAccessChain,
        byte_ptr,
        vec![SpvOperand::IdRef(heap), SpvOperand::IdRef(frame_base)],
    )?;
    let frame = emitter.session.emit(
        spirv::Op::Bitcast,
        slot_ptr,
        vec![SpvOperand::IdRef(frame_bytes)],
    )?;

    for (i, param) in function.params.iter().enumerate() {
        let index = emitter
            .session
            .constant(&(RESERVED_SLOTS + i as u32).to_string(), Kind::I64)?;
        let address = emitter.session.emit(
            spirv::Op::InBoundsPtrAccessChain,
            slot_ptr,
            vec![SpvOperand::IdRef(frame), SpvOperand::IdRef(index)],
        )?;
        let mut operands = vec![SpvOperand::IdRef(address)];
        operands.extend(Emitter::aligned(8));
        let raw = emitter.session.emit(spirv::Op::Load, long, operands)?;
        let value = coerce_slot(emitter, raw, param.kind)?;
        emitter.define(param.var, value)?;
    }
    Ok(())
}

/// Narrow or reinterpret a raw 64-bit frame slot as `kind`
fn coerce_slot(emitter: &mut Emitter<'_>, raw: Word, kind: Kind) -> Result<Word> {
    fn convert(emitter: &mut Emitter<'_>, op: spirv::Op, to: Kind, value: Word) -> Result<Word> {
        let ty = emitter.type_of(to)?;
        emitter.session.emit(op, ty, vec![SpvOperand::IdRef(value)])
    }

    match kind {
        Kind::I64 | Kind::Ptr => Ok(raw),
        Kind::I8 | Kind::I16 | Kind::I32 => convert(emitter, spirv::Op::UConvert, kind, raw),
        Kind::F64 => convert(emitter, spirv::Op::Bitcast, kind, raw),
        Kind::F32 => {
            let bits = convert(emitter, spirv::Op::UConvert, Kind::I32, raw)?;
            convert(emitter, spirv::Op::Bitcast, kind, bits)
        }
        Kind::F16 => {
            let bits = convert(emitter, spirv::Op::UConvert, Kind::I16, raw)?;
            convert(emitter, spirv::Op::Bitcast, kind, bits)
        }
        Kind::Bool => {
            let zero = emitter.session.constant("0", Kind::I64)?;
            let bool_ty = emitter.type_of(Kind::Bool)?;
            emitter.session.emit(
                spirv::Op::INotEqual,
                bool_ty,
                vec![SpvOperand::IdRef(raw), SpvOperand::IdRef(zero)],
            )
        }
        Kind::Vector { .. } | Kind::Void => Err(InternalError::Unimplemented(format!(
            "kernel parameter of kind {}",
            kind
        ))
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::{FunctionBuilder, Operand, Terminator};

    fn trivial_kernel(name: &str) -> LirFunction {
        let mut b = FunctionBuilder::kernel(name);
        b.terminate(Terminator::Return(None));
        b.build()
    }

    #[test]
    fn test_state_display() {
        assert_eq!(AssemblerState::HeaderEmitted.to_string(), "HeaderEmitted");
        assert_eq!(AssemblerState::Done.to_string(), "Done");
    }

    #[test]
    fn test_reserved_names() {
        assert!(is_reserved_name("kernel"));
        assert!(is_reserved_name("__global"));
        assert!(is_reserved_name("pipe"));
        assert!(!is_reserved_name("saxpy"));
    }

    #[test]
    fn test_finish_requires_closed_function() {
        let mut asm = ModuleAssembler::new("m", TargetInfo::default(), CodegenConfig::default());
        asm.emit_header().unwrap();
        let err = asm.finish().unwrap_err();
        assert!(err.to_string().contains("HeaderEmitted"));
    }

    #[test]
    fn test_header_only_once() {
        let mut asm = ModuleAssembler::new("m", TargetInfo::default(), CodegenConfig::default());
        asm.emit_header().unwrap();
        assert!(asm.emit_header().is_err());
    }

    #[test]
    fn test_failed_function_poisons_assembler() {
        let mut asm = ModuleAssembler::new("m", TargetInfo::default(), CodegenConfig::default());
        let mut b = FunctionBuilder::kernel("midway");
        let undefined = b.var(Kind::I32);
        let y = b.var(Kind::I32);
        b.push(crate::lir::Op::Move {
            dst: y,
            src: Operand::Var(undefined),
        });
        b.terminate(Terminator::Return(None));
        assert!(asm.assemble_function(&b.build()).is_err());
        assert_eq!(asm.state(), AssemblerState::InBlock);

        let err = asm.assemble_function(&trivial_kernel("after")).unwrap_err();
        assert!(err.to_string().contains("InBlock"));
    }

    #[test]
    fn test_bytes_round_trip_and_alignment() {
        let module = LirModule {
            name: "m".to_string(),
            functions: vec![trivial_kernel("k")],
        };
        let compiled = assemble_module(&module, TargetInfo::default(), &CodegenConfig::default()).unwrap();
        let bytes = compiled.to_bytes();
        assert_eq!(bytes.len(), compiled.words.len() * 4);
        assert_eq!(bytes_to_words(&bytes).unwrap(), compiled.words);
        assert!(bytes_to_words(&bytes[..5]).is_err());
        assert_eq!(compiled.words[0], spirv::MAGIC_NUMBER);
    }
}
