//! Host interpreter for assembled kernels
//!
//! Work-items of a launch run one after another on the calling thread, so
//! workgroup barriers are no-ops and local memory is shared in program order.

use half::f16;
use rspirv::dr::{self, Instruction, Operand};
use rustc_hash::FxHashMap;
use spirv::{BuiltIn, CLOp, Decoration, Op, StorageClass, Word};
use std::ops::Range;

use super::memory::DeviceMemory;
use crate::codegen::spirv::literal::{mask, sign_extend};
use crate::diagnostics::{Error, InternalError, Result};
use crate::runtime::backend::LaunchConfig;

const STEP_LIMIT: u64 = 1 << 26;
const CALL_DEPTH_LIMIT: usize = 64;

/// Instructions allowed inside function bodies
const SUPPORTED: &[Op] = &[
    Op::Nop,
    Op::Phi,
    Op::LoopMerge,
    Op::SelectionMerge,
    Op::Branch,
    Op::BranchConditional,
    Op::Switch,
    Op::Return,
    Op::ReturnValue,
    Op::Unreachable,
    Op::Variable,
    Op::Load,
    Op::Store,
    Op::AccessChain,
    Op::InBoundsAccessChain,
    Op::PtrAccessChain,
    Op::InBoundsPtrAccessChain,
    Op::ConvertUToPtr,
    Op::Bitcast,
    Op::CopyObject,
    Op::Undef,
    Op::Select,
    Op::CompositeExtract,
    Op::CompositeInsert,
    Op::FunctionCall,
    Op::ExtInst,
    Op::ControlBarrier,
    Op::MemoryBarrier,
    Op::IAdd,
    Op::ISub,
    Op::IMul,
    Op::SDiv,
    Op::SRem,
    Op::SMod,
    Op::UDiv,
    Op::UMod,
    Op::FAdd,
    Op::FSub,
    Op::FMul,
    Op::FDiv,
    Op::FRem,
    Op::BitwiseAnd,
    Op::BitwiseOr,
    Op::BitwiseXor,
    Op::ShiftLeftLogical,
    Op::ShiftRightLogical,
    Op::ShiftRightArithmetic,
    Op::Not,
    Op::SNegate,
    Op::FNegate,
    Op::LogicalAnd,
    Op::LogicalOr,
    Op::LogicalEqual,
    Op::LogicalNotEqual,
    Op::LogicalNot,
    Op::IEqual,
    Op::INotEqual,
    Op::ULessThan,
    Op::ULessThanEqual,
    Op::UGreaterThan,
    Op::UGreaterThanEqual,
    Op::SLessThan,
    Op::SLessThanEqual,
    Op::SGreaterThan,
    Op::SGreaterThanEqual,
    Op::FOrdEqual,
    Op::FOrdNotEqual,
    Op::FOrdLessThan,
    Op::FOrdLessThanEqual,
    Op::FOrdGreaterThan,
    Op::FOrdGreaterThanEqual,
    Op::FUnordEqual,
    Op::FUnordNotEqual,
    Op::SConvert,
    Op::UConvert,
    Op::FConvert,
    Op::ConvertSToF,
    Op::ConvertUToF,
    Op::ConvertFToS,
    Op::ConvertFToU,
];

const CL_OPS: &[CLOp] = &[
    CLOp::sqrt,
    CLOp::rsqrt,
    CLOp::sin,
    CLOp::cos,
    CLOp::tan,
    CLOp::exp,
    CLOp::log,
    CLOp::pow,
    CLOp::floor,
    CLOp::ceil,
    CLOp::fma,
    CLOp::fabs,
    CLOp::fmin,
    CLOp::fmax,
    CLOp::s_abs,
    CLOp::s_min,
    CLOp::s_max,
    CLOp::u_min,
    CLOp::u_max,
    CLOp::clz,
    CLOp::popcount,
    CLOp::vloadn,
    CLOp::vstoren,
];

fn fault(message: impl Into<String>) -> Error {
    InternalError::Execution(message.into()).into()
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Type {
    Void,
    Bool,
    Int(u32),
    Float(u32),
    Vector(Word, u32),
    Array(Word, u64),
    Pointer(StorageClass, Word),
    Function,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Space {
    /// Absolute device address
    Heap,
    /// Index into the work-item's function variables
    Private(usize),
    Workgroup(Word),
    Input(BuiltIn),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Pointer {
    space: Space,
    offset: u64,
    pointee: Word,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Value {
    Bool(bool),
    Int { bits: u64, width: u32 },
    Float { value: f64, width: u32 },
    Vector(Vec<Value>),
    Pointer(Pointer),
}

fn round_float(value: f64, width: u32) -> f64 {
    match width {
        16 => f16::from_f64(value).to_f64(),
        32 => value as f32 as f64,
        _ => value,
    }
}

impl Value {
    fn int(bits: u64, width: u32) -> Self {
        Value::Int {
            bits: mask(bits, width),
            width,
        }
    }

    fn float(value: f64, width: u32) -> Self {
        Value::Float {
            value: round_float(value, width),
            width,
        }
    }

    fn as_bool(&self) -> Result<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(fault(format!("expected a bool, found {:?}", other))),
        }
    }

    fn as_u64(&self) -> Result<u64> {
        match self {
            Value::Int { bits, .. } => Ok(*bits),
            Value::Pointer(p) if p.space == Space::Heap => Ok(p.offset),
            other => Err(fault(format!("expected an integer, found {:?}", other))),
        }
    }

    fn as_i64(&self) -> Result<i64> {
        match self {
            Value::Int { bits, width } => Ok(sign_extend(*bits, *width)),
            other => Err(fault(format!("expected an integer, found {:?}", other))),
        }
    }

    fn as_f64(&self) -> Result<f64> {
        match self {
            Value::Float { value, .. } => Ok(*value),
            other => Err(fault(format!("expected a float, found {:?}", other))),
        }
    }

    fn as_pointer(&self) -> Result<Pointer> {
        match self {
            Value::Pointer(p) => Ok(*p),
            other => Err(fault(format!("expected a pointer, found {:?}", other))),
        }
    }
}

/// Little-endian in-memory image of a value
fn encode(value: &Value, out: &mut Vec<u8>) -> Result<()> {
    match value {
        Value::Bool(b) => out.push(u8::from(*b)),
        Value::Int { bits, width } => {
            out.extend_from_slice(&bits.to_le_bytes()[..(*width / 8) as usize]);
        }
        Value::Float { value, width } => match width {
            16 => out.extend_from_slice(&f16::from_f64(*value).to_le_bytes()),
            32 => out.extend_from_slice(&(*value as f32).to_le_bytes()),
            _ => out.extend_from_slice(&value.to_le_bytes()),
        },
        Value::Vector(lanes) => {
            for lane in lanes {
                encode(lane, out)?;
            }
        }
        Value::Pointer(p) => match p.space {
            Space::Heap => out.extend_from_slice(&p.offset.to_le_bytes()),
            other => return Err(fault(format!("a {:?} pointer cannot be stored", other))),
        },
    }
    Ok(())
}

/// Apply `f` lane by lane when any argument is a vector; scalars broadcast
fn map_lanes(args: &[Value], f: impl Fn(&[Value]) -> Result<Value>) -> Result<Value> {
    let lanes = args.iter().find_map(|a| match a {
        Value::Vector(lanes) => Some(lanes.len()),
        _ => None,
    });
    let Some(lanes) = lanes else {
        return f(args);
    };

    let mut out = Vec::with_capacity(lanes);
    for i in 0..lanes {
        let lane_args = args
            .iter()
            .map(|a| match a {
                Value::Vector(values) => values
                    .get(i)
                    .cloned()
                    .ok_or_else(|| fault("vector operands differ in length")),
                scalar => Ok(scalar.clone()),
            })
            .collect::<Result<Vec<_>>>()?;
        out.push(f(&lane_args)?);
    }
    Ok(Value::Vector(out))
}

fn id_ref(inst: &Instruction, index: usize) -> Result<Word> {
    match inst.operands.get(index) {
        Some(Operand::IdRef(id)) => Ok(*id),
        other => Err(fault(format!(
            "Op{:?} operand {} is {:?}, expected an id",
            inst.class.opcode, index, other
        ))),
    }
}

fn literal(inst: &Instruction, index: usize) -> Result<u32> {
    match inst.operands.get(index) {
        Some(Operand::LiteralBit32(v)) => Ok(*v),
        other => Err(fault(format!(
            "Op{:?} operand {} is {:?}, expected a literal",
            inst.class.opcode, index, other
        ))),
    }
}

fn result_id(inst: &Instruction) -> Result<Word> {
    inst.result_id
        .ok_or_else(|| fault(format!("Op{:?} has no result id", inst.class.opcode)))
}

fn result_type(inst: &Instruction) -> Result<Word> {
    inst.result_type
        .ok_or_else(|| fault(format!("Op{:?} has no result type", inst.class.opcode)))
}

fn is_conversion(op: Op) -> bool {
    matches!(
        op,
        Op::SConvert
            | Op::UConvert
            | Op::FConvert
            | Op::ConvertSToF
            | Op::ConvertUToF
            | Op::ConvertFToS
            | Op::ConvertFToU
    )
}

fn convert(op: Op, value: &Value, target: Type) -> Result<Value> {
    match (op, target) {
        (Op::SConvert, Type::Int(w)) => Ok(Value::int(value.as_i64()? as u64, w)),
        (Op::UConvert, Type::Int(w)) => Ok(Value::int(value.as_u64()?, w)),
        (Op::ConvertSToF, Type::Float(w)) => Ok(Value::float(value.as_i64()? as f64, w)),
        (Op::ConvertUToF, Type::Float(w)) => Ok(Value::float(value.as_u64()? as f64, w)),
        (Op::ConvertFToS, Type::Int(w)) => Ok(Value::int(value.as_f64()? as i64 as u64, w)),
        (Op::ConvertFToU, Type::Int(w)) => Ok(Value::int(value.as_f64()? as u64, w)),
        (Op::FConvert, Type::Float(w)) => Ok(Value::float(value.as_f64()?, w)),
        (op, target) => Err(fault(format!("Op{:?} cannot produce {:?}", op, target))),
    }
}

fn unary(op: Op, value: &Value) -> Result<Value> {
    match (op, value) {
        (Op::Not, Value::Int { bits, width }) => Ok(Value::int(!bits, *width)),
        (Op::SNegate, Value::Int { bits, width }) => Ok(Value::int(bits.wrapping_neg(), *width)),
        (Op::FNegate, Value::Float { value, width }) => Ok(Value::float(-value, *width)),
        (Op::LogicalNot, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (op, value) => Err(fault(format!("Op{:?} applied to {:?}", op, value))),
    }
}

fn binary(op: Op, lhs: &Value, rhs: &Value) -> Result<Value> {
    match (lhs, rhs) {
        (Value::Int { bits: a, width }, Value::Int { bits: b, .. }) => int_binary(op, *a, *b, *width),
        (Value::Float { value: a, width }, Value::Float { value: b, .. }) => {
            float_binary(op, *a, *b, *width)
        }
        (Value::Bool(a), Value::Bool(b)) => match op {
            Op::LogicalAnd => Ok(Value::Bool(*a && *b)),
            Op::LogicalOr => Ok(Value::Bool(*a || *b)),
            Op::LogicalEqual => Ok(Value::Bool(a == b)),
            Op::LogicalNotEqual => Ok(Value::Bool(a != b)),
            op => Err(fault(format!("Op{:?} applied to bools", op))),
        },
        (lhs, rhs) => Err(fault(format!("Op{:?} applied to {:?} and {:?}", op, lhs, rhs))),
    }
}

fn int_binary(op: Op, a: u64, b: u64, width: u32) -> Result<Value> {
    let (sa, sb) = (sign_extend(a, width), sign_extend(b, width));
    let shift = (b % width as u64) as u32;
    let divide_by_zero = || fault(format!("Op{:?} divides by zero", op));
    let signed_fault = || {
        if sb == 0 {
            divide_by_zero()
        } else {
            fault(format!("Op{:?} overflows {}-bit signed range", op, width))
        }
    };

    let bits = match op {
        Op::IAdd => a.wrapping_add(b),
        Op::ISub => a.wrapping_sub(b),
        Op::IMul => a.wrapping_mul(b),
        Op::SDiv => sa.checked_div(sb).ok_or_else(signed_fault)? as u64,
        Op::SRem => sa.checked_rem(sb).ok_or_else(signed_fault)? as u64,
        Op::SMod => {
            let r = sa.checked_rem(sb).ok_or_else(signed_fault)?;
            if r != 0 && (r < 0) != (sb < 0) {
                (r + sb) as u64
            } else {
                r as u64
            }
        }
        Op::UDiv => a.checked_div(b).ok_or_else(divide_by_zero)?,
        Op::UMod => a.checked_rem(b).ok_or_else(divide_by_zero)?,
        Op::BitwiseAnd => a & b,
        Op::BitwiseOr => a | b,
        Op::BitwiseXor => a ^ b,
        Op::ShiftLeftLogical => a << shift,
        Op::ShiftRightLogical => a >> shift,
        Op::ShiftRightArithmetic => (sa >> shift) as u64,
        Op::IEqual => return Ok(Value::Bool(a == b)),
        Op::INotEqual => return Ok(Value::Bool(a != b)),
        Op::ULessThan => return Ok(Value::Bool(a < b)),
        Op::ULessThanEqual => return Ok(Value::Bool(a <= b)),
        Op::UGreaterThan => return Ok(Value::Bool(a > b)),
        Op::UGreaterThanEqual => return Ok(Value::Bool(a >= b)),
        Op::SLessThan => return Ok(Value::Bool(sa < sb)),
        Op::SLessThanEqual => return Ok(Value::Bool(sa <= sb)),
        Op::SGreaterThan => return Ok(Value::Bool(sa > sb)),
        Op::SGreaterThanEqual => return Ok(Value::Bool(sa >= sb)),
        op => return Err(fault(format!("Op{:?} applied to integers", op))),
    };
    Ok(Value::int(bits, width))
}

fn float_binary(op: Op, a: f64, b: f64, width: u32) -> Result<Value> {
    let unordered = a.is_nan() || b.is_nan();
    let value = match op {
        Op::FAdd => a + b,
        Op::FSub => a - b,
        Op::FMul => a * b,
        Op::FDiv => a / b,
        Op::FRem => a % b,
        Op::FOrdEqual => return Ok(Value::Bool(a == b)),
        Op::FOrdNotEqual => return Ok(Value::Bool(!unordered && a != b)),
        Op::FOrdLessThan => return Ok(Value::Bool(a < b)),
        Op::FOrdLessThanEqual => return Ok(Value::Bool(a <= b)),
        Op::FOrdGreaterThan => return Ok(Value::Bool(a > b)),
        Op::FOrdGreaterThanEqual => return Ok(Value::Bool(a >= b)),
        Op::FUnordEqual => return Ok(Value::Bool(unordered || a == b)),
        Op::FUnordNotEqual => return Ok(Value::Bool(a != b)),
        op => return Err(fault(format!("Op{:?} applied to floats", op))),
    };
    Ok(Value::float(value, width))
}

fn cl_op(number: u32) -> Option<CLOp> {
    CL_OPS.iter().copied().find(|op| *op as u32 == number)
}

fn cl_eval(op: CLOp, args: &[Value]) -> Result<Value> {
    match args {
        [Value::Float { value: x, width }] => {
            let r = match op {
                CLOp::sqrt => x.sqrt(),
                CLOp::rsqrt => 1.0 / x.sqrt(),
                CLOp::sin => x.sin(),
                CLOp::cos => x.cos(),
                CLOp::tan => x.tan(),
                CLOp::exp => x.exp(),
                CLOp::log => x.ln(),
                CLOp::floor => x.floor(),
                CLOp::ceil => x.ceil(),
                CLOp::fabs => x.abs(),
                op => return Err(fault(format!("{:?} applied to a float", op))),
            };
            Ok(Value::float(r, *width))
        }
        [Value::Float { value: x, width }, Value::Float { value: y, .. }] => {
            let r = match op {
                CLOp::pow => x.powf(*y),
                CLOp::fmin => x.min(*y),
                CLOp::fmax => x.max(*y),
                op => return Err(fault(format!("{:?} applied to two floats", op))),
            };
            Ok(Value::float(r, *width))
        }
        [
            Value::Float { value: x, width },
            Value::Float { value: y, .. },
            Value::Float { value: z, .. },
        ] if op == CLOp::fma => Ok(Value::float(x.mul_add(*y, *z), *width)),
        [Value::Int { bits, width }] => {
            let r = match op {
                CLOp::s_abs => sign_extend(*bits, *width).unsigned_abs(),
                CLOp::clz => (bits.leading_zeros() - (64 - width)) as u64,
                CLOp::popcount => bits.count_ones() as u64,
                op => return Err(fault(format!("{:?} applied to an integer", op))),
            };
            Ok(Value::int(r, *width))
        }
        [Value::Int { bits: a, width }, Value::Int { bits: b, .. }] => {
            let (sa, sb) = (sign_extend(*a, *width), sign_extend(*b, *width));
            let r = match op {
                CLOp::s_min => sa.min(sb) as u64,
                CLOp::s_max => sa.max(sb) as u64,
                CLOp::u_min => (*a).min(*b),
                CLOp::u_max => (*a).max(*b),
                op => return Err(fault(format!("{:?} applied to two integers", op))),
            };
            Ok(Value::int(r, *width))
        }
        args => Err(fault(format!("{:?} applied to {:?}", op, args))),
    }
}

#[derive(Debug)]
struct Global {
    storage: StorageClass,
    pointee: Word,
    builtin: Option<BuiltIn>,
}

#[derive(Debug)]
struct Block {
    label: Word,
    body: Vec<Instruction>,
}

#[derive(Debug)]
struct Function {
    params: Vec<(Word, Word)>,
    blocks: Vec<Block>,
    labels: FxHashMap<Word, usize>,
}

/// Decoded module, ready to launch any of its entry points
#[derive(Debug, Default)]
pub struct Program {
    types: FxHashMap<Word, Type>,
    constants: FxHashMap<Word, Value>,
    globals: FxHashMap<Word, Global>,
    functions: FxHashMap<Word, Function>,
    entry_points: FxHashMap<String, Word>,
    cl_import: Option<Word>,
}

impl Program {
    /// Decode a module; the error string is the build log
    pub fn parse(words: &[u32]) -> std::result::Result<Self, String> {
        let module = dr::load_words(words).map_err(|err| format!("invalid module: {:?}", err))?;
        Self::from_module(&module).map_err(|err| err.to_string())
    }

    fn from_module(module: &dr::Module) -> Result<Self> {
        let mut program = Program::default();

        for inst in &module.ext_inst_imports {
            if matches!(inst.operands.first(), Some(Operand::LiteralString(set)) if set == "OpenCL.std") {
                program.cl_import = inst.result_id;
            }
        }

        let mut builtins = FxHashMap::default();
        for inst in &module.annotations {
            if let [
                Operand::IdRef(target),
                Operand::Decoration(Decoration::BuiltIn),
                Operand::BuiltIn(builtin),
                ..,
            ] = inst.operands.as_slice()
            {
                builtins.insert(*target, *builtin);
            }
        }

        for inst in &module.types_global_values {
            program.declare(inst, &builtins)?;
        }

        for inst in &module.entry_points {
            if let [
                Operand::ExecutionModel(_),
                Operand::IdRef(function),
                Operand::LiteralString(name),
                ..,
            ] = inst.operands.as_slice()
            {
                program.entry_points.insert(name.clone(), *function);
            }
        }

        for function in &module.functions {
            program.define(function)?;
        }
        Ok(program)
    }

    fn declare(&mut self, inst: &Instruction, builtins: &FxHashMap<Word, BuiltIn>) -> Result<()> {
        let id = result_id(inst)?;
        match inst.class.opcode {
            Op::TypeVoid => self.add_type(id, Type::Void),
            Op::TypeBool => self.add_type(id, Type::Bool),
            Op::TypeInt => self.add_type(id, Type::Int(literal(inst, 0)?)),
            Op::TypeFloat => self.add_type(id, Type::Float(literal(inst, 0)?)),
            Op::TypeVector => self.add_type(id, Type::Vector(id_ref(inst, 0)?, literal(inst, 1)?)),
            Op::TypeArray => {
                let length = self
                    .constants
                    .get(&id_ref(inst, 1)?)
                    .ok_or_else(|| fault("array length is not a constant"))?
                    .as_u64()?;
                self.add_type(id, Type::Array(id_ref(inst, 0)?, length));
            }
            Op::TypePointer => {
                let Some(Operand::StorageClass(storage)) = inst.operands.first() else {
                    return Err(fault("pointer type without a storage class"));
                };
                self.add_type(id, Type::Pointer(*storage, id_ref(inst, 1)?));
            }
            Op::TypeFunction => self.add_type(id, Type::Function),
            Op::Constant => {
                let bits = match inst.operands.first() {
                    Some(Operand::LiteralBit32(v)) => *v as u64,
                    Some(Operand::LiteralBit64(v)) => *v,
                    other => return Err(fault(format!("constant literal {:?}", other))),
                };
                let value = self.from_bits(bits, result_type(inst)?)?;
                self.constants.insert(id, value);
            }
            Op::ConstantTrue => {
                self.constants.insert(id, Value::Bool(true));
            }
            Op::ConstantFalse => {
                self.constants.insert(id, Value::Bool(false));
            }
            Op::ConstantComposite => {
                let lanes = (0..inst.operands.len())
                    .map(|i| {
                        let lane = id_ref(inst, i)?;
                        self.constants
                            .get(&lane)
                            .cloned()
                            .ok_or_else(|| fault(format!("composite lane %{} is not a constant", lane)))
                    })
                    .collect::<Result<Vec<_>>>()?;
                self.constants.insert(id, Value::Vector(lanes));
            }
            Op::ConstantNull | Op::Undef => {
                let value = self.zero(result_type(inst)?)?;
                self.constants.insert(id, value);
            }
            Op::Variable => {
                let Some(Operand::StorageClass(storage)) = inst.operands.first() else {
                    return Err(fault("variable without a storage class"));
                };
                let global = Global {
                    storage: *storage,
                    pointee: self.pointee(result_type(inst)?)?,
                    builtin: builtins.get(&id).copied(),
                };
                self.globals.insert(id, global);
            }
            other => {
                return Err(fault(format!("unsupported module-scope instruction Op{:?}", other)));
            }
        }
        Ok(())
    }

    fn add_type(&mut self, id: Word, ty: Type) {
        self.types.insert(id, ty);
    }

    fn define(&mut self, function: &dr::Function) -> Result<()> {
        let id = function
            .def
            .as_ref()
            .and_then(|def| def.result_id)
            .ok_or_else(|| fault("function without a definition"))?;
        let params = function
            .parameters
            .iter()
            .map(|p| Ok((result_id(p)?, result_type(p)?)))
            .collect::<Result<Vec<_>>>()?;

        let mut blocks = Vec::with_capacity(function.blocks.len());
        let mut labels = FxHashMap::default();
        for (index, block) in function.blocks.iter().enumerate() {
            let label = block
                .label
                .as_ref()
                .and_then(|l| l.result_id)
                .ok_or_else(|| fault("block without a label"))?;
            if let Some(inst) = block
                .instructions
                .iter()
                .find(|inst| !SUPPORTED.contains(&inst.class.opcode))
            {
                return Err(fault(format!("unsupported instruction Op{:?}", inst.class.opcode)));
            }
            labels.insert(label, index);
            blocks.push(Block {
                label,
                body: block.instructions.clone(),
            });
        }

        self.functions.insert(id, Function {
            params,
            blocks,
            labels,
        });
        Ok(())
    }

    pub fn entry_point(&self, name: &str) -> Option<Word> {
        self.entry_points.get(name).copied()
    }

    pub fn entry_point_names(&self) -> impl Iterator<Item = &str> {
        self.entry_points.keys().map(String::as_str)
    }

    fn function(&self, id: Word) -> Result<&Function> {
        self.functions
            .get(&id)
            .ok_or_else(|| fault(format!("call of undefined function %{}", id)))
    }

    fn ty(&self, id: Word) -> Result<Type> {
        self.types
            .get(&id)
            .copied()
            .ok_or_else(|| fault(format!("%{} is not a type", id)))
    }

    fn scalar_of(&self, id: Word) -> Result<Type> {
        match self.ty(id)? {
            Type::Vector(element, _) => self.ty(element),
            other => Ok(other),
        }
    }

    fn pointee(&self, pointer: Word) -> Result<Word> {
        match self.ty(pointer)? {
            Type::Pointer(_, pointee) => Ok(pointee),
            other => Err(fault(format!("{:?} is not a pointer type", other))),
        }
    }

    fn size_of(&self, id: Word) -> Result<u64> {
        match self.ty(id)? {
            Type::Bool => Ok(1),
            Type::Int(w) | Type::Float(w) => Ok((w / 8) as u64),
            Type::Vector(element, lanes) => Ok(self.size_of(element)? * lanes as u64),
            Type::Array(element, length) => Ok(self.size_of(element)? * length),
            Type::Pointer(..) => Ok(8),
            other => Err(fault(format!("{:?} has no size", other))),
        }
    }

    fn zero(&self, id: Word) -> Result<Value> {
        match self.ty(id)? {
            Type::Bool => Ok(Value::Bool(false)),
            Type::Int(width) => Ok(Value::int(0, width)),
            Type::Float(width) => Ok(Value::float(0.0, width)),
            Type::Vector(element, lanes) => {
                let lane = self.zero(element)?;
                Ok(Value::Vector(vec![lane; lanes as usize]))
            }
            Type::Pointer(_, pointee) => Ok(Value::Pointer(Pointer {
                space: Space::Heap,
                offset: 0,
                pointee,
            })),
            other => Err(fault(format!("no zero value for {:?}", other))),
        }
    }

    fn from_bits(&self, bits: u64, id: Word) -> Result<Value> {
        match self.ty(id)? {
            Type::Bool => Ok(Value::Bool(bits != 0)),
            Type::Int(width) => Ok(Value::int(bits, width)),
            Type::Float(16) => Ok(Value::float(f16::from_bits(bits as u16).to_f64(), 16)),
            Type::Float(32) => Ok(Value::float(f32::from_bits(bits as u32) as f64, 32)),
            Type::Float(width) => Ok(Value::float(f64::from_bits(bits), width)),
            Type::Pointer(_, pointee) => Ok(Value::Pointer(Pointer {
                space: Space::Heap,
                offset: bits,
                pointee,
            })),
            other => Err(fault(format!("{:?} is not a scalar", other))),
        }
    }

    fn decode(&self, bytes: &[u8], id: Word) -> Result<Value> {
        let size = self.size_of(id)? as usize;
        if bytes.len() < size {
            return Err(fault(format!("decoding {} bytes from {}", size, bytes.len())));
        }
        if let Type::Vector(element, lanes) = self.ty(id)? {
            let lane_size = self.size_of(element)? as usize;
            let lanes = (0..lanes as usize)
                .map(|i| self.decode(&bytes[i * lane_size..(i + 1) * lane_size], element))
                .collect::<Result<Vec<_>>>()?;
            return Ok(Value::Vector(lanes));
        }
        let mut raw = [0u8; 8];
        raw[..size].copy_from_slice(&bytes[..size]);
        self.from_bits(u64::from_le_bytes(raw), id)
    }

    fn workgroup_storage(&self) -> Result<FxHashMap<Word, Vec<u8>>> {
        self.globals
            .iter()
            .filter(|(_, g)| g.storage == StorageClass::Workgroup)
            .map(|(id, g)| Ok((*id, vec![0u8; self.size_of(g.pointee)? as usize])))
            .collect()
    }

    /// Run `entry` over the whole NDRange of `config`
    pub fn run(
        &self,
        entry: Word,
        config: &LaunchConfig,
        heap_base: u64,
        frame_base: u64,
        memory: &mut DeviceMemory,
    ) -> Result<()> {
        let function = self.function(entry)?;
        let (heap_param, frame_param) = match function.params.as_slice() {
            [(_, heap), (_, frame)] => (*heap, *frame),
            params => {
                return Err(fault(format!(
                    "kernel takes {} parameters, expected heap and frame",
                    params.len()
                )));
            }
        };
        let heap = Value::Pointer(Pointer {
            space: Space::Heap,
            offset: heap_base,
            pointee: self.pointee(heap_param)?,
        });
        let frame = self.from_bits(frame_base, frame_param)?;

        let groups = config.groups();
        for group in grid(groups) {
            let mut workgroup = self.workgroup_storage()?;
            for local in grid(config.local) {
                let mut invocation = Invocation {
                    program: self,
                    memory: &mut *memory,
                    workgroup: &mut workgroup,
                    private: Vec::new(),
                    item: WorkItem::new(config, group, local),
                    steps: 0,
                };
                invocation.call(entry, vec![heap.clone(), frame.clone()], 0)?;
            }
        }
        Ok(())
    }
}

/// Row-major walk over a 3-D index space
fn grid(dims: [u32; 3]) -> impl Iterator<Item = [u32; 3]> {
    (0..dims[2]).flat_map(move |z| (0..dims[1]).flat_map(move |y| (0..dims[0]).map(move |x| [x, y, z])))
}

#[derive(Debug, Clone, Copy)]
struct WorkItem {
    global_id: [u64; 3],
    global_size: [u64; 3],
    local_id: [u64; 3],
    group_id: [u64; 3],
    local_size: [u64; 3],
}

impl WorkItem {
    fn new(config: &LaunchConfig, group: [u32; 3], local: [u32; 3]) -> Self {
        let widen = |v: [u32; 3]| v.map(u64::from);
        let (group, local_size) = (widen(group), widen(config.local));
        let local = widen(local);
        Self {
            global_id: [0, 1, 2].map(|d| group[d] * local_size[d] + local[d]),
            global_size: widen(config.global),
            local_id: local,
            group_id: group,
            local_size,
        }
    }

    fn builtin(&self, builtin: BuiltIn) -> Result<[u64; 3]> {
        match builtin {
            BuiltIn::GlobalInvocationId => Ok(self.global_id),
            BuiltIn::GlobalSize => Ok(self.global_size),
            BuiltIn::LocalInvocationId => Ok(self.local_id),
            BuiltIn::WorkgroupId => Ok(self.group_id),
            BuiltIn::WorkgroupSize => Ok(self.local_size),
            other => Err(fault(format!("unsupported builtin {:?}", other))),
        }
    }
}

enum Flow {
    Next,
    Jump(Word),
    Return(Option<Value>),
}

fn span(available: usize, offset: u64, len: usize) -> Result<Range<usize>> {
    usize::try_from(offset)
        .ok()
        .and_then(|start| {
            start
                .checked_add(len)
                .filter(|end| *end <= available)
                .map(|end| start..end)
        })
        .ok_or_else(|| fault(format!("access of {} bytes at offset {} is out of bounds", len, offset)))
}

/// State of one work-item
struct Invocation<'a> {
    program: &'a Program,
    memory: &'a mut DeviceMemory,
    workgroup: &'a mut FxHashMap<Word, Vec<u8>>,
    private: Vec<Vec<u8>>,
    item: WorkItem,
    steps: u64,
}

type Locals = FxHashMap<Word, Value>;

impl Invocation<'_> {
    fn call(&mut self, callee: Word, args: Vec<Value>, depth: usize) -> Result<Option<Value>> {
        if depth > CALL_DEPTH_LIMIT {
            return Err(fault("call depth limit exceeded"));
        }
        let program = self.program;
        let function = program.function(callee)?;
        if args.len() != function.params.len() {
            return Err(fault(format!(
                "%{} takes {} arguments, got {}",
                callee,
                function.params.len(),
                args.len()
            )));
        }

        let mut locals: Locals = function.params.iter().map(|(id, _)| *id).zip(args).collect();
        let mut index = 0;
        let mut previous = None;
        'blocks: loop {
            let block = function
                .blocks
                .get(index)
                .ok_or_else(|| fault(format!("%{} has no block {}", callee, index)))?;

            // Every phi of a block reads its inputs before any is written
            let phis = block
                .body
                .iter()
                .take_while(|inst| inst.class.opcode == Op::Phi)
                .count();
            let mut merged = Vec::with_capacity(phis);
            for inst in &block.body[..phis] {
                let from = previous.ok_or_else(|| fault("phi in the entry block"))?;
                let incoming = inst
                    .operands
                    .chunks(2)
                    .find_map(|pair| match pair {
                        [Operand::IdRef(value), Operand::IdRef(label)] if *label == from => Some(*value),
                        _ => None,
                    })
                    .ok_or_else(|| {
                        fault(format!(
                            "phi %{} has no value for block %{}",
                            inst.result_id.unwrap_or_default(),
                            from
                        ))
                    })?;
                merged.push((result_id(inst)?, self.value(&locals, incoming)?));
            }
            locals.extend(merged);

            for inst in &block.body[phis..] {
                self.steps += 1;
                if self.steps > STEP_LIMIT {
                    return Err(fault(format!("kernel exceeded {} steps", STEP_LIMIT)));
                }
                match self.step(inst, &mut locals, depth)? {
                    Flow::Next => {}
                    Flow::Jump(label) => {
                        previous = Some(block.label);
                        index = function
                            .labels
                            .get(&label)
                            .copied()
                            .ok_or_else(|| fault(format!("branch to unknown block %{}", label)))?;
                        continue 'blocks;
                    }
                    Flow::Return(value) => return Ok(value),
                }
            }
            return Err(fault(format!("block %{} has no terminator", block.label)));
        }
    }

    fn value(&self, locals: &Locals, id: Word) -> Result<Value> {
        if let Some(value) = locals.get(&id).or_else(|| self.program.constants.get(&id)) {
            return Ok(value.clone());
        }
        if let Some(global) = self.program.globals.get(&id) {
            let space = match (global.storage, global.builtin) {
                (StorageClass::Input, Some(builtin)) => Space::Input(builtin),
                (StorageClass::Workgroup, _) => Space::Workgroup(id),
                (storage, _) => {
                    return Err(fault(format!("global %{} in {:?} storage", id, storage)));
                }
            };
            return Ok(Value::Pointer(Pointer {
                space,
                offset: 0,
                pointee: global.pointee,
            }));
        }
        Err(fault(format!("%{} is not defined", id)))
    }

    fn arg(&self, locals: &Locals, inst: &Instruction, index: usize) -> Result<Value> {
        self.value(locals, id_ref(inst, index)?)
    }

    fn args(&self, locals: &Locals, inst: &Instruction, from: usize) -> Result<Vec<Value>> {
        (from..inst.operands.len())
            .map(|i| self.arg(locals, inst, i))
            .collect()
    }

    fn step(&mut self, inst: &Instruction, locals: &mut Locals, depth: usize) -> Result<Flow> {
        let program = self.program;
        let op = inst.class.opcode;
        let result = match op {
            Op::Nop | Op::LoopMerge | Op::SelectionMerge | Op::ControlBarrier | Op::MemoryBarrier => {
                return Ok(Flow::Next);
            }
            Op::Branch => return Ok(Flow::Jump(id_ref(inst, 0)?)),
            Op::BranchConditional => {
                let taken = if self.arg(locals, inst, 0)?.as_bool()? { 1 } else { 2 };
                return Ok(Flow::Jump(id_ref(inst, taken)?));
            }
            Op::Switch => return self.switch(inst, locals).map(Flow::Jump),
            Op::Return => return Ok(Flow::Return(None)),
            Op::ReturnValue => return Ok(Flow::Return(Some(self.arg(locals, inst, 0)?))),
            Op::Unreachable => return Err(fault("reached OpUnreachable")),
            Op::Phi => return Err(fault("phi after the head of its block")),
            Op::Store => {
                let pointer = self.arg(locals, inst, 0)?.as_pointer()?;
                let value = self.arg(locals, inst, 1)?;
                self.store(pointer, &value)?;
                return Ok(Flow::Next);
            }
            Op::Variable => {
                let pointee = program.pointee(result_type(inst)?)?;
                self.private.push(vec![0; program.size_of(pointee)? as usize]);
                Value::Pointer(Pointer {
                    space: Space::Private(self.private.len() - 1),
                    offset: 0,
                    pointee,
                })
            }
            Op::Load => {
                let pointer = self.arg(locals, inst, 0)?.as_pointer()?;
                self.load(pointer, result_type(inst)?)?
            }
            Op::AccessChain | Op::InBoundsAccessChain | Op::PtrAccessChain | Op::InBoundsPtrAccessChain => {
                self.access_chain(inst, locals)?
            }
            Op::ConvertUToPtr => Value::Pointer(Pointer {
                space: Space::Heap,
                offset: self.arg(locals, inst, 0)?.as_u64()?,
                pointee: program.pointee(result_type(inst)?)?,
            }),
            Op::Bitcast => {
                let value = self.arg(locals, inst, 0)?;
                let ty = result_type(inst)?;
                match (value, program.ty(ty)?) {
                    (Value::Pointer(p), Type::Pointer(_, pointee)) => Value::Pointer(Pointer { pointee, ..p }),
                    (value, _) => {
                        let mut bytes = Vec::new();
                        encode(&value, &mut bytes)?;
                        if bytes.len() as u64 != program.size_of(ty)? {
                            return Err(fault("bitcast between types of different sizes"));
                        }
                        program.decode(&bytes, ty)?
                    }
                }
            }
            Op::CopyObject => self.arg(locals, inst, 0)?,
            Op::Undef => program.zero(result_type(inst)?)?,
            Op::Select => {
                let condition = self.arg(locals, inst, 0)?.as_bool()?;
                self.arg(locals, inst, if condition { 1 } else { 2 })?
            }
            Op::CompositeExtract => {
                let mut value = self.arg(locals, inst, 0)?;
                for i in 1..inst.operands.len() {
                    let lane = literal(inst, i)? as usize;
                    value = match value {
                        Value::Vector(mut lanes) if lane < lanes.len() => lanes.swap_remove(lane),
                        other => return Err(fault(format!("cannot extract lane {} of {:?}", lane, other))),
                    };
                }
                value
            }
            Op::CompositeInsert => {
                let object = self.arg(locals, inst, 0)?;
                let mut composite = self.arg(locals, inst, 1)?;
                let lane = literal(inst, 2)? as usize;
                match &mut composite {
                    Value::Vector(lanes) if lane < lanes.len() => lanes[lane] = object,
                    other => return Err(fault(format!("cannot insert lane {} into {:?}", lane, other))),
                }
                composite
            }
            Op::FunctionCall => {
                let args = self.args(locals, inst, 1)?;
                match self.call(id_ref(inst, 0)?, args, depth + 1)? {
                    Some(value) => value,
                    None => return Ok(Flow::Next),
                }
            }
            Op::ExtInst => match self.ext_inst(inst, locals)? {
                Some(value) => value,
                None => return Ok(Flow::Next),
            },
            _ => {
                let args = self.args(locals, inst, 0)?;
                if is_conversion(op) {
                    let target = program.scalar_of(result_type(inst)?)?;
                    map_lanes(&args, |a| convert(op, &a[0], target))?
                } else {
                    map_lanes(&args, |a| match a {
                        [x] => unary(op, x),
                        [x, y] => binary(op, x, y),
                        _ => Err(fault(format!("Op{:?} with {} operands", op, a.len()))),
                    })?
                }
            }
        };
        locals.insert(result_id(inst)?, result);
        Ok(Flow::Next)
    }

    fn switch(&self, inst: &Instruction, locals: &Locals) -> Result<Word> {
        let (selector, width) = match self.arg(locals, inst, 0)? {
            Value::Int { bits, width } => (bits, width),
            other => return Err(fault(format!("switch on {:?}", other))),
        };
        for pair in inst.operands.get(2..).unwrap_or_default().chunks(2) {
            let (case, target) = match pair {
                [Operand::LiteralBit32(v), Operand::IdRef(t)] => (*v as u64, *t),
                [Operand::LiteralBit64(v), Operand::IdRef(t)] => (*v, *t),
                other => return Err(fault(format!("malformed switch case {:?}", other))),
            };
            if mask(case, width) == selector {
                return Ok(target);
            }
        }
        id_ref(inst, 1)
    }

    fn access_chain(&self, inst: &Instruction, locals: &Locals) -> Result<Value> {
        let program = self.program;
        let base = self.arg(locals, inst, 0)?.as_pointer()?;
        let mut offset = base.offset as i64;
        let mut current = base.pointee;

        let mut first_index = 1;
        if matches!(inst.class.opcode, Op::PtrAccessChain | Op::InBoundsPtrAccessChain) {
            let element = self.arg(locals, inst, 1)?.as_i64()?;
            offset = offset.wrapping_add(element.wrapping_mul(program.size_of(base.pointee)? as i64));
            first_index = 2;
        }
        for i in first_index..inst.operands.len() {
            let index = self.arg(locals, inst, i)?.as_i64()?;
            current = match program.ty(current)? {
                Type::Array(element, _) | Type::Vector(element, _) => element,
                other => return Err(fault(format!("cannot index into {:?}", other))),
            };
            offset = offset.wrapping_add(index.wrapping_mul(program.size_of(current)? as i64));
        }

        Ok(Value::Pointer(Pointer {
            space: base.space,
            offset: offset as u64,
            pointee: program.pointee(result_type(inst)?)?,
        }))
    }

    fn ext_inst(&mut self, inst: &Instruction, locals: &Locals) -> Result<Option<Value>> {
        if Some(id_ref(inst, 0)?) != self.program.cl_import {
            return Err(fault("extended instruction from an unknown set"));
        }
        let number = match inst.operands.get(1) {
            Some(Operand::LiteralExtInstInteger(n)) => *n,
            other => return Err(fault(format!("extended instruction number {:?}", other))),
        };
        let op = cl_op(number)
            .ok_or_else(|| fault(format!("unsupported OpenCL.std instruction {}", number)))?;

        match op {
            CLOp::vloadn => {
                let ty = result_type(inst)?;
                let offset = self.arg(locals, inst, 2)?.as_u64()?;
                let pointer = self.arg(locals, inst, 3)?.as_pointer()?;
                let size = self.program.size_of(ty)?;
                let start = pointer.offset.wrapping_add(offset.wrapping_mul(size));
                let bytes = self.read(Pointer { offset: start, ..pointer }, size)?;
                self.program.decode(&bytes, ty).map(Some)
            }
            CLOp::vstoren => {
                let data = self.arg(locals, inst, 2)?;
                let offset = self.arg(locals, inst, 3)?.as_u64()?;
                let pointer = self.arg(locals, inst, 4)?.as_pointer()?;
                let mut bytes = Vec::new();
                encode(&data, &mut bytes)?;
                let start = pointer.offset.wrapping_add(offset.wrapping_mul(bytes.len() as u64));
                self.write(Pointer { offset: start, ..pointer }, &bytes)?;
                Ok(None)
            }
            op => {
                let args = self.args(locals, inst, 2)?;
                map_lanes(&args, |a| cl_eval(op, a)).map(Some)
            }
        }
    }

    fn read(&self, pointer: Pointer, len: u64) -> Result<Vec<u8>> {
        let len = len as usize;
        match pointer.space {
            Space::Heap => self.memory.read(pointer.offset, len),
            Space::Private(slot) => {
                let buffer = self
                    .private
                    .get(slot)
                    .ok_or_else(|| fault("dangling function variable"))?;
                Ok(buffer[span(buffer.len(), pointer.offset, len)?].to_vec())
            }
            Space::Workgroup(var) => {
                let buffer = self
                    .workgroup
                    .get(&var)
                    .ok_or_else(|| fault(format!("workgroup variable %{} missing", var)))?;
                Ok(buffer[span(buffer.len(), pointer.offset, len)?].to_vec())
            }
            Space::Input(builtin) => Err(fault(format!("{:?} read through a raw pointer", builtin))),
        }
    }

    fn write(&mut self, pointer: Pointer, data: &[u8]) -> Result<()> {
        let buffer = match pointer.space {
            Space::Heap => return self.memory.write(pointer.offset, data),
            Space::Private(slot) => self
                .private
                .get_mut(slot)
                .ok_or_else(|| fault("dangling function variable"))?,
            Space::Workgroup(var) => self
                .workgroup
                .get_mut(&var)
                .ok_or_else(|| fault(format!("workgroup variable %{} missing", var)))?,
            Space::Input(builtin) => return Err(fault(format!("store to {:?}", builtin))),
        };
        let range = span(buffer.len(), pointer.offset, data.len())?;
        buffer[range].copy_from_slice(data);
        Ok(())
    }

    fn load(&self, pointer: Pointer, ty: Word) -> Result<Value> {
        if let Space::Input(builtin) = pointer.space {
            let ids = self.item.builtin(builtin)?;
            return Ok(Value::Vector(ids.iter().map(|&v| Value::int(v, 64)).collect()));
        }
        let bytes = self.read(pointer, self.program.size_of(ty)?)?;
        self.program.decode(&bytes, ty)
    }

    fn store(&mut self, pointer: Pointer, value: &Value) -> Result<()> {
        let mut bytes = Vec::new();
        encode(value, &mut bytes)?;
        self.write(pointer, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_semantics() {
        assert_eq!(int_binary(Op::IAdd, 250, 10, 8).unwrap(), Value::int(4, 8));
        let minus_seven = (-7i64) as u64;
        assert_eq!(
            int_binary(Op::SDiv, mask(minus_seven, 32), 2, 32).unwrap(),
            Value::int((-3i64) as u64, 32)
        );
        assert_eq!(
            int_binary(Op::ShiftRightArithmetic, mask(minus_seven, 16), 1, 16).unwrap(),
            Value::int((-4i64) as u64, 16)
        );
        assert!(int_binary(Op::UDiv, 1, 0, 32).is_err());
        assert_eq!(
            int_binary(Op::SLessThan, mask(minus_seven, 32), 1, 32).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            int_binary(Op::ULessThan, mask(minus_seven, 32), 1, 32).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_signed_division_faults() {
        let minus_one = u64::MAX;
        let zero = int_binary(Op::SDiv, 5, 0, 64).unwrap_err().to_string();
        assert!(zero.contains("divides by zero"));

        let overflow = int_binary(Op::SDiv, i64::MIN as u64, minus_one, 64).unwrap_err().to_string();
        assert!(overflow.contains("overflows 64-bit signed range"), "{}", overflow);
        assert!(!overflow.contains("zero"));

        let rem = int_binary(Op::SRem, i64::MIN as u64, minus_one, 64).unwrap_err().to_string();
        assert!(rem.contains("overflows"));
    }

    #[test]
    fn test_half_values() {
        assert_eq!(round_float(0.1, 16), 0.0999755859375);
        assert_eq!(round_float(1.0e6, 16), f64::INFINITY);

        let mut bytes = Vec::new();
        encode(&Value::float(-2.0, 16), &mut bytes).unwrap();
        assert_eq!(bytes, vec![0x00, 0xc0]);
    }

    #[test]
    fn test_float_rounding() {
        let v = float_binary(Op::FAdd, 0.1, 0.2, 32).unwrap();
        assert_eq!(v, Value::float(0.3f32 as f64, 32));
        assert_eq!(
            float_binary(Op::FOrdLessThan, f64::NAN, 1.0, 64).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            float_binary(Op::FUnordNotEqual, f64::NAN, 1.0, 64).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_lanewise_broadcast() {
        let v = Value::Vector(vec![Value::int(1, 32), Value::int(2, 32)]);
        let r = map_lanes(&[v, Value::int(10, 32)], |a| binary(Op::IMul, &a[0], &a[1])).unwrap();
        assert_eq!(r, Value::Vector(vec![Value::int(10, 32), Value::int(20, 32)]));
    }

    #[test]
    fn test_cl_ops() {
        assert_eq!(cl_op(CLOp::fma as u32), Some(CLOp::fma));
        assert_eq!(
            cl_eval(CLOp::clz, &[Value::int(1, 32)]).unwrap(),
            Value::int(31, 32)
        );
        assert_eq!(
            cl_eval(CLOp::s_max, &[Value::int((-1i64) as u64, 32), Value::int(3, 32)]).unwrap(),
            Value::int(3, 32)
        );
    }

    #[test]
    fn test_encode_half() {
        let mut bytes = Vec::new();
        encode(&Value::float(1.0, 16), &mut bytes).unwrap();
        assert_eq!(bytes, 0x3c00u16.to_le_bytes());
    }

    #[test]
    fn test_grid_order() {
        let cells: Vec<_> = grid([2, 2, 1]).collect();
        assert_eq!(cells, vec![[0, 0, 0], [1, 0, 0], [0, 1, 0], [1, 1, 0]]);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(Program::parse(&[0xdead_beef, 1, 2]).is_err());
    }
}
