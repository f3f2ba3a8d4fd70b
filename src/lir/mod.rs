//! Low-level input IR
//!
//! The scheduler hands the assembler one SSA function at a time:
//! - variables carry a fixed [`Kind`]
//! - arrays are declared in a fixed memory region
//! - blocks end in exactly one [`Terminator`], and phis lead their block
//!
//! Everything here is plain data and round-trips through JSON so tools can feed
//! the assembler without linking against the scheduler.

pub mod builder;
pub mod kind;

pub use builder::FunctionBuilder;
pub use kind::{Element, Kind, VECTOR_LANES};

use serde::{Deserialize, Serialize};
use std::fmt;

/// SSA value id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VarId(pub u32);

/// Basic block id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u32);

/// Private or local array id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArrayId(pub u32);

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BB{}", self.0)
    }
}

impl fmt::Display for ArrayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// A module handed to the assembler in one piece
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LirModule {
    pub name: String,
    pub functions: Vec<LirFunction>,
}

impl LirModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: Vec::new(),
        }
    }

    pub fn add_function(&mut self, function: LirFunction) {
        self.functions.push(function);
    }

    pub fn function(&self, name: &str) -> Option<&LirFunction> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn kernels(&self) -> impl Iterator<Item = &LirFunction> {
        self.functions
            .iter()
            .filter(|f| f.kind == FunctionKind::Kernel)
    }
}

/// Entry kernel or callable device function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionKind {
    Kernel,
    Device,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LirFunction {
    pub name: String,
    pub kind: FunctionKind,
    pub params: Vec<Param>,
    pub return_kind: Kind,
    /// Kinds of every non-parameter value
    #[serde(default)]
    pub variables: Vec<VarDecl>,
    #[serde(default)]
    pub arrays: Vec<ArrayDecl>,
    /// Program order; the first block is the entry
    pub blocks: Vec<Block>,
}

impl LirFunction {
    pub fn entry(&self) -> Option<BlockId> {
        self.blocks.first().map(|b| b.id)
    }

    pub fn is_kernel(&self) -> bool {
        self.kind == FunctionKind::Kernel
    }

    /// Declared kind of a parameter or variable
    pub fn kind_of(&self, var: VarId) -> Option<Kind> {
        self.params
            .iter()
            .find(|p| p.var == var)
            .map(|p| p.kind)
            .or_else(|| {
                self.variables
                    .iter()
                    .find(|v| v.var == var)
                    .map(|v| v.kind)
            })
    }

    pub fn array(&self, id: ArrayId) -> Option<&ArrayDecl> {
        self.arrays.iter().find(|a| a.id == id)
    }

    /// Parameters and variables in declaration order
    pub fn all_values(&self) -> impl Iterator<Item = (VarId, Kind)> + '_ {
        self.params
            .iter()
            .map(|p| (p.var, p.kind))
            .chain(self.variables.iter().map(|v| (v.var, v.kind)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    pub var: VarId,
    pub kind: Kind,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VarDecl {
    pub var: VarId,
    pub kind: Kind,
}

/// Memory region an array is declared in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    /// Function-private, one copy per work-item
    Private,
    /// Workgroup-local, shared by a workgroup
    Local,
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Region::Private => write!(f, "private"),
            Region::Local => write!(f, "local"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ArrayDecl {
    pub id: ArrayId,
    pub region: Region,
    pub element: Kind,
    pub length: u32,
}

/// Typed literal, keyed by its text
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Literal {
    pub value: String,
    pub kind: Kind,
}

impl Literal {
    pub fn new(value: impl Into<String>, kind: Kind) -> Self {
        Self {
            value: value.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operand {
    Var(VarId),
    Const(Literal),
}

impl Operand {
    pub fn int(value: i64) -> Self {
        Operand::Const(Literal::new(value.to_string(), Kind::I32))
    }

    pub fn long(value: i64) -> Self {
        Operand::Const(Literal::new(value.to_string(), Kind::I64))
    }

    pub fn float(value: f32) -> Self {
        Operand::Const(Literal::new(format!("{:?}", value), Kind::F32))
    }

    pub fn as_var(&self) -> Option<VarId> {
        match self {
            Operand::Var(v) => Some(*v),
            Operand::Const(_) => None,
        }
    }
}

impl From<VarId> for Operand {
    fn from(var: VarId) -> Self {
        Operand::Var(var)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Var(v) => write!(f, "{}", v),
            Operand::Const(lit) => write!(f, "{}:{}", lit.value, lit.kind),
        }
    }
}

/// Abstract address of a load or store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Address {
    /// Cross-device heap, byte offset from a raw 64-bit base
    Heap {
        base: VarId,
        #[serde(default)]
        offset: Option<Operand>,
    },
    /// Generic address space, byte offset from a raw 64-bit base
    Generic {
        base: VarId,
        #[serde(default)]
        offset: Option<Operand>,
    },
    /// Element of a function-private array
    Private { array: ArrayId, index: Operand },
    /// Element of a workgroup-local array
    Local { array: ArrayId, index: Operand },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    UDiv,
    URem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    UShr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    ULt,
    ULe,
    UGt,
    UGe,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::Ne
                | BinaryOp::Lt
                | BinaryOp::Le
                | BinaryOp::Gt
                | BinaryOp::Ge
                | BinaryOp::ULt
                | BinaryOp::ULe
                | BinaryOp::UGt
                | BinaryOp::UGe
        )
    }

    pub fn is_shift(self) -> bool {
        matches!(self, BinaryOp::Shl | BinaryOp::Shr | BinaryOp::UShr)
    }

    /// Integer operations whose result may be narrowed back to the destination width
    pub fn result_width_can_change(self) -> bool {
        matches!(
            self,
            BinaryOp::Add
                | BinaryOp::Sub
                | BinaryOp::Mul
                | BinaryOp::Div
                | BinaryOp::Rem
                | BinaryOp::UDiv
                | BinaryOp::URem
                | BinaryOp::And
                | BinaryOp::Or
                | BinaryOp::Xor
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvertOp {
    /// Value-preserving conversion treating integers as signed
    Signed,
    /// Value-preserving conversion treating integers as unsigned
    Unsigned,
    /// Bit reinterpretation between kinds of equal size
    Bitcast,
}

/// OpenCL extended math
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intrinsic {
    Sqrt,
    Rsqrt,
    Sin,
    Cos,
    Tan,
    Exp,
    Log,
    Pow,
    Floor,
    Ceil,
    Fma,
    Abs,
    Min,
    Max,
    UMin,
    UMax,
    Clz,
    Popcount,
}

impl Intrinsic {
    pub const ALL: [Intrinsic; 18] = [
        Intrinsic::Sqrt,
        Intrinsic::Rsqrt,
        Intrinsic::Sin,
        Intrinsic::Cos,
        Intrinsic::Tan,
        Intrinsic::Exp,
        Intrinsic::Log,
        Intrinsic::Pow,
        Intrinsic::Floor,
        Intrinsic::Ceil,
        Intrinsic::Fma,
        Intrinsic::Abs,
        Intrinsic::Min,
        Intrinsic::Max,
        Intrinsic::UMin,
        Intrinsic::UMax,
        Intrinsic::Clz,
        Intrinsic::Popcount,
    ];

    pub fn arity(self) -> usize {
        match self {
            Intrinsic::Fma => 3,
            Intrinsic::Pow
            | Intrinsic::Min
            | Intrinsic::Max
            | Intrinsic::UMin
            | Intrinsic::UMax => 2,
            _ => 1,
        }
    }
}

/// Work-item coordinate queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadQuery {
    GlobalId,
    GlobalSize,
    LocalId,
    GroupId,
    WorkgroupSize,
}

impl ThreadQuery {
    pub const ALL: [ThreadQuery; 5] = [
        ThreadQuery::GlobalId,
        ThreadQuery::GlobalSize,
        ThreadQuery::LocalId,
        ThreadQuery::GroupId,
        ThreadQuery::WorkgroupSize,
    ];
}

/// Memory a barrier orders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fence {
    Local,
    Global,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Binary {
        dst: VarId,
        op: BinaryOp,
        lhs: Operand,
        rhs: Operand,
    },
    Unary {
        dst: VarId,
        op: UnaryOp,
        src: Operand,
    },
    Convert {
        dst: VarId,
        op: ConvertOp,
        src: Operand,
    },
    /// `dst = (lhs cmp rhs) ? on_true : on_false`
    Select {
        dst: VarId,
        cmp: BinaryOp,
        lhs: Operand,
        rhs: Operand,
        on_true: Operand,
        on_false: Operand,
    },
    /// `dst = (lhs & rhs) == 0`
    IntegerTest {
        dst: VarId,
        lhs: Operand,
        rhs: Operand,
    },
    Intrinsic {
        dst: VarId,
        op: Intrinsic,
        args: Vec<Operand>,
    },
    Move {
        dst: VarId,
        src: Operand,
    },
    Load {
        dst: VarId,
        address: Address,
    },
    Store {
        address: Address,
        value: Operand,
    },
    VectorBuild {
        dst: VarId,
        elements: Vec<Operand>,
    },
    VectorExtract {
        dst: VarId,
        vector: Operand,
        lane: u32,
    },
    VectorInsert {
        dst: VarId,
        vector: Operand,
        lane: u32,
        value: Operand,
    },
    Call {
        #[serde(default)]
        dst: Option<VarId>,
        callee: String,
        args: Vec<Operand>,
    },
    Phi {
        dst: VarId,
        incoming: Vec<(BlockId, Operand)>,
    },
    ThreadId {
        dst: VarId,
        query: ThreadQuery,
        dimension: u32,
    },
    Barrier {
        fence: Fence,
    },
}

impl Op {
    /// Value defined by this operation, if any
    pub fn dst(&self) -> Option<VarId> {
        match self {
            Op::Binary { dst, .. }
            | Op::Unary { dst, .. }
            | Op::Convert { dst, .. }
            | Op::Select { dst, .. }
            | Op::IntegerTest { dst, .. }
            | Op::Intrinsic { dst, .. }
            | Op::Move { dst, .. }
            | Op::Load { dst, .. }
            | Op::VectorBuild { dst, .. }
            | Op::VectorExtract { dst, .. }
            | Op::VectorInsert { dst, .. }
            | Op::Phi { dst, .. }
            | Op::ThreadId { dst, .. } => Some(*dst),
            Op::Call { dst, .. } => *dst,
            Op::Store { .. } | Op::Barrier { .. } => None,
        }
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, Op::Phi { .. })
    }
}

/// Loop header annotation attached to the header's conditional branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopHint {
    pub merge: BlockId,
    pub continue_target: BlockId,
    #[serde(default)]
    pub unroll: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Terminator {
    Jump(BlockId),
    Branch {
        condition: Operand,
        on_true: BlockId,
        on_false: BlockId,
        #[serde(default)]
        loop_hint: Option<LoopHint>,
    },
    Switch {
        selector: Operand,
        cases: Vec<(i64, BlockId)>,
        default: BlockId,
    },
    Return(Option<Operand>),
    Unreachable,
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Jump(b) => vec![*b],
            Terminator::Branch {
                on_true, on_false, ..
            } => vec![*on_true, *on_false],
            Terminator::Switch { cases, default, .. } => {
                let mut out: Vec<BlockId> = cases.iter().map(|(_, b)| *b).collect();
                out.push(*default);
                out
            }
            Terminator::Return(_) | Terminator::Unreachable => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub ops: Vec<Op>,
    pub terminator: Terminator,
}

impl Block {
    pub fn new(id: BlockId) -> Self {
        Self {
            id,
            ops: Vec::new(),
            terminator: Terminator::Unreachable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_ids() {
        assert_eq!(VarId(3).to_string(), "%3");
        assert_eq!(BlockId(1).to_string(), "BB1");
        assert_eq!(ArrayId(0).to_string(), "@0");
    }

    #[test]
    fn test_width_stable_ops() {
        assert!(BinaryOp::Add.result_width_can_change());
        assert!(!BinaryOp::Shl.result_width_can_change());
        assert!(!BinaryOp::Lt.result_width_can_change());
        assert!(BinaryOp::UGe.is_comparison());
    }

    #[test]
    fn test_op_dst() {
        let op = Op::Store {
            address: Address::Private {
                array: ArrayId(0),
                index: Operand::int(1),
            },
            value: Operand::int(2),
        };
        assert_eq!(op.dst(), None);

        let call = Op::Call {
            dst: Some(VarId(4)),
            callee: "f".to_string(),
            args: vec![],
        };
        assert_eq!(call.dst(), Some(VarId(4)));
    }

    #[test]
    fn test_json_shape() {
        let block = Block {
            id: BlockId(0),
            ops: vec![Op::Move {
                dst: VarId(1),
                src: Operand::int(7),
            }],
            terminator: Terminator::Return(None),
        };
        let json = serde_json::to_string(&block).unwrap();
        let back: Block = serde_json::from_str(&json).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn test_switch_successors() {
        let t = Terminator::Switch {
            selector: Operand::int(0),
            cases: vec![(1, BlockId(2)), (5, BlockId(3))],
            default: BlockId(4),
        };
        assert_eq!(t.successors(), vec![BlockId(2), BlockId(3), BlockId(4)]);
    }
}
