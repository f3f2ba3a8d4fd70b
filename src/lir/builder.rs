//! Fluent construction of [`LirFunction`]s

use super::{
    Address, ArrayDecl, ArrayId, BinaryOp, Block, BlockId, ConvertOp, FunctionKind, Kind,
    LirFunction, Op, Operand, Param, Region, Terminator, ThreadQuery, VarDecl, VarId,
};

/// Builder that hands out fresh value, block and array ids
pub struct FunctionBuilder {
    function: LirFunction,
    next_var: u32,
    next_block: u32,
    next_array: u32,
    current: usize,
}

impl FunctionBuilder {
    fn new(name: impl Into<String>, kind: FunctionKind, return_kind: Kind) -> Self {
        Self {
            function: LirFunction {
                name: name.into(),
                kind,
                params: Vec::new(),
                return_kind,
                variables: Vec::new(),
                arrays: Vec::new(),
                blocks: vec![Block::new(BlockId(0))],
            },
            next_var: 0,
            next_block: 1,
            next_array: 0,
            current: 0,
        }
    }

    /// Entry kernel with a void return
    pub fn kernel(name: impl Into<String>) -> Self {
        Self::new(name, FunctionKind::Kernel, Kind::Void)
    }

    /// Device function callable from kernels
    pub fn device(name: impl Into<String>, return_kind: Kind) -> Self {
        Self::new(name, FunctionKind::Device, return_kind)
    }

    fn fresh_var(&mut self) -> VarId {
        let id = VarId(self.next_var);
        self.next_var += 1;
        id
    }

    pub fn param(&mut self, kind: Kind) -> VarId {
        let var = self.fresh_var();
        self.function.params.push(Param {
            var,
            kind,
            name: None,
        });
        var
    }

    pub fn named_param(&mut self, name: impl Into<String>, kind: Kind) -> VarId {
        let var = self.param(kind);
        if let Some(p) = self.function.params.last_mut() {
            p.name = Some(name.into());
        }
        var
    }

    /// Declare a value without defining it
    pub fn var(&mut self, kind: Kind) -> VarId {
        let var = self.fresh_var();
        self.function.variables.push(VarDecl { var, kind });
        var
    }

    pub fn array(&mut self, region: Region, element: Kind, length: u32) -> ArrayId {
        let id = ArrayId(self.next_array);
        self.next_array += 1;
        self.function.arrays.push(ArrayDecl {
            id,
            region,
            element,
            length,
        });
        id
    }

    /// Append a new empty block; the insertion point does not move
    pub fn block(&mut self) -> BlockId {
        let id = BlockId(self.next_block);
        self.next_block += 1;
        self.function.blocks.push(Block::new(id));
        id
    }

    pub fn switch_to(&mut self, block: BlockId) {
        if let Some(idx) = self.function.blocks.iter().position(|b| b.id == block) {
            self.current = idx;
        }
    }

    pub fn current_block(&self) -> BlockId {
        self.function.blocks[self.current].id
    }

    pub fn push(&mut self, op: Op) {
        self.function.blocks[self.current].ops.push(op);
    }

    pub fn terminate(&mut self, terminator: Terminator) {
        self.function.blocks[self.current].terminator = terminator;
    }

    pub fn binary(
        &mut self,
        op: BinaryOp,
        kind: Kind,
        lhs: impl Into<Operand>,
        rhs: impl Into<Operand>,
    ) -> VarId {
        let dst = self.var(kind);
        self.push(Op::Binary {
            dst,
            op,
            lhs: lhs.into(),
            rhs: rhs.into(),
        });
        dst
    }

    pub fn convert(&mut self, op: ConvertOp, kind: Kind, src: impl Into<Operand>) -> VarId {
        let dst = self.var(kind);
        self.push(Op::Convert {
            dst,
            op,
            src: src.into(),
        });
        dst
    }

    pub fn mov(&mut self, kind: Kind, src: impl Into<Operand>) -> VarId {
        let dst = self.var(kind);
        self.push(Op::Move {
            dst,
            src: src.into(),
        });
        dst
    }

    pub fn load(&mut self, kind: Kind, address: Address) -> VarId {
        let dst = self.var(kind);
        self.push(Op::Load { dst, address });
        dst
    }

    pub fn store(&mut self, address: Address, value: impl Into<Operand>) {
        self.push(Op::Store {
            address,
            value: value.into(),
        });
    }

    /// Merge into an already declared value, so back edges can name it first
    pub fn phi_into(&mut self, dst: VarId, incoming: Vec<(BlockId, Operand)>) {
        self.push(Op::Phi { dst, incoming });
    }

    pub fn thread_id(&mut self, query: ThreadQuery, dimension: u32) -> VarId {
        let dst = self.var(Kind::I64);
        self.push(Op::ThreadId {
            dst,
            query,
            dimension,
        });
        dst
    }

    pub fn call(&mut self, callee: impl Into<String>, kind: Kind, args: Vec<Operand>) -> VarId {
        let dst = self.var(kind);
        self.push(Op::Call {
            dst: Some(dst),
            callee: callee.into(),
            args,
        });
        dst
    }

    pub fn build(self) -> LirFunction {
        self.function
    }
}
