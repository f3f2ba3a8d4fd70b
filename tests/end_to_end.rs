//! End-to-end tests: assemble kernels, install them on the simulated device and
//! check what they wrote
//!
//! Every kernel runs twice, once with values kept in registers and once with
//! every value spilled to a function-scope slot.

use pretty_assertions::assert_eq;

use kiln::codegen::assemble_module;
use kiln::config::{CodegenConfig, RuntimeConfig};
use kiln::lir::{
    Address, BinaryOp, BlockId, ConvertOp, Element, Fence, FunctionBuilder, Intrinsic, Kind,
    LirFunction, LirModule, Literal, LoopHint, Op, Operand, Region, Terminator, ThreadQuery, VarId,
};
use kiln::runtime::{DeviceContext, KernelArg, LaunchConfig, cache_key};

const PLAN: u64 = 0;
const DEVICE: usize = 0;

enum Arg {
    Buffer(Vec<u8>),
    Scalar(KernelArg),
}

fn zeros(words: usize) -> Arg {
    Arg::Buffer(vec![0; words * 4])
}

fn i32s(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Assemble `functions`, launch `kernel` and return every buffer argument
fn run(
    functions: Vec<LirFunction>,
    kernel: &str,
    launch: LaunchConfig,
    args: Vec<Arg>,
    optimize_load_store: bool,
) -> Vec<Vec<u8>> {
    let mut module = LirModule::new("e2e");
    for f in functions {
        module.add_function(f);
    }
    let codegen = CodegenConfig {
        optimize_load_store,
        ..CodegenConfig::default()
    };

    let context = DeviceContext::simulated(RuntimeConfig::default());
    let compiled = assemble_module(&module, context.target(DEVICE).unwrap(), &codegen)
        .expect("assembly failed");
    context
        .install_module(PLAN, DEVICE, &module.name, &compiled)
        .expect("install failed");

    let mut kernel_args = Vec::new();
    let mut buffers = Vec::new();
    for arg in args {
        match arg {
            Arg::Scalar(value) => kernel_args.push(value),
            Arg::Buffer(bytes) => {
                let buffer = context.allocate(PLAN, DEVICE, bytes.len()).unwrap();
                context.write_buffer(PLAN, &buffer, 0, &bytes).unwrap();
                kernel_args.push(buffer.into());
                buffers.push(buffer);
            }
        }
    }

    let event = context
        .launch(PLAN, DEVICE, &cache_key(&module.name, kernel), &launch, &kernel_args)
        .expect("launch failed");
    context.wait_for_events(PLAN, DEVICE, &[event]).unwrap();
    assert!(context.get_timers(PLAN, DEVICE, event).unwrap().is_complete());

    buffers
        .iter()
        .map(|b| context.read_buffer(PLAN, b, 0, b.size).unwrap())
        .collect()
}

fn both(check: impl Fn(bool)) {
    for optimize in [true, false] {
        check(optimize);
    }
}

/// Byte offset of the calling work-item's 32-bit slot
fn slot_offset(f: &mut FunctionBuilder) -> VarId {
    let gid = f.thread_id(ThreadQuery::GlobalId, 0);
    f.binary(BinaryOp::Mul, Kind::I64, gid, Operand::long(4))
}

fn sum_to() -> LirFunction {
    let mut f = FunctionBuilder::device("sum_to", Kind::I32);
    let n = f.param(Kind::I32);
    let header = f.block();
    let body = f.block();
    let exit = f.block();

    let i = f.var(Kind::I32);
    let acc = f.var(Kind::I32);
    let i_next = f.var(Kind::I32);
    let acc_next = f.var(Kind::I32);
    f.terminate(Terminator::Jump(header));

    f.switch_to(header);
    f.phi_into(i, vec![(BlockId(0), Operand::int(0)), (body, Operand::Var(i_next))]);
    f.phi_into(acc, vec![(BlockId(0), Operand::int(0)), (body, Operand::Var(acc_next))]);
    let more = f.binary(BinaryOp::Lt, Kind::Bool, i, n);
    f.terminate(Terminator::Branch {
        condition: Operand::Var(more),
        on_true: body,
        on_false: exit,
        loop_hint: Some(LoopHint {
            merge: exit,
            continue_target: body,
            unroll: false,
        }),
    });

    f.switch_to(body);
    f.push(Op::Binary {
        dst: acc_next,
        op: BinaryOp::Add,
        lhs: Operand::Var(acc),
        rhs: Operand::Var(i),
    });
    f.push(Op::Binary {
        dst: i_next,
        op: BinaryOp::Add,
        lhs: Operand::Var(i),
        rhs: Operand::int(1),
    });
    f.terminate(Terminator::Jump(header));

    f.switch_to(exit);
    f.terminate(Terminator::Return(Some(Operand::Var(acc))));
    f.build()
}

fn pick() -> LirFunction {
    let mut f = FunctionBuilder::device("pick", Kind::I32);
    let x = f.param(Kind::I32);
    let one = f.block();
    let seven = f.block();
    let other = f.block();
    let merge = f.block();
    f.terminate(Terminator::Switch {
        selector: Operand::Var(x),
        cases: vec![(1, one), (7, seven)],
        default: other,
    });
    for block in [one, seven, other] {
        f.switch_to(block);
        f.terminate(Terminator::Jump(merge));
    }
    f.switch_to(merge);
    let r = f.var(Kind::I32);
    f.phi_into(
        r,
        vec![
            (one, Operand::int(10)),
            (seven, Operand::int(70)),
            (other, Operand::int(-1)),
        ],
    );
    f.terminate(Terminator::Return(Some(Operand::Var(r))));
    f.build()
}

#[test]
fn test_private_array_round_trip() {
    both(|optimize| {
        let mut f = FunctionBuilder::kernel("scratch");
        let out = f.param(Kind::Ptr);
        let scratch = f.array(Region::Private, Kind::I32, 4);
        let at = |index: i64| Address::Private {
            array: scratch,
            index: Operand::int(index),
        };
        f.store(at(2), Operand::int(42));
        f.store(at(0), Operand::int(7));
        let two = f.load(Kind::I32, at(2));
        let zero = f.load(Kind::I32, at(0));
        f.store(Address::Heap { base: out, offset: None }, two);
        f.store(
            Address::Heap {
                base: out,
                offset: Some(Operand::int(4)),
            },
            zero,
        );
        f.terminate(Terminator::Return(None));

        let buffers = run(vec![f.build()], "scratch", LaunchConfig::new_1d(1, 1), vec![zeros(2)], optimize);
        assert_eq!(i32s(&buffers[0]), vec![42, 7], "optimize_load_store={}", optimize);
    });
}

#[test]
fn test_global_id_indexing() {
    both(|optimize| {
        let mut f = FunctionBuilder::kernel("double_ids");
        let out = f.param(Kind::Ptr);
        let offset = slot_offset(&mut f);
        let gid = f.thread_id(ThreadQuery::GlobalId, 0);
        let value = f.binary(BinaryOp::Mul, Kind::I32, gid, Operand::long(2));
        f.store(
            Address::Heap {
                base: out,
                offset: Some(Operand::Var(offset)),
            },
            value,
        );
        f.terminate(Terminator::Return(None));

        let buffers = run(vec![f.build()], "double_ids", LaunchConfig::new_1d(8, 4), vec![zeros(8)], optimize);
        assert_eq!(i32s(&buffers[0]), vec![0, 2, 4, 6, 8, 10, 12, 14]);
    });
}

#[test]
fn test_scalar_arguments_from_frame() {
    both(|optimize| {
        let mut f = FunctionBuilder::kernel("axpb");
        let out = f.param(Kind::Ptr);
        let a = f.param(Kind::F32);
        let b = f.param(Kind::I32);
        let negate = f.param(Kind::Bool);
        let gid = f.thread_id(ThreadQuery::GlobalId, 0);
        let x = f.convert(ConvertOp::Signed, Kind::F32, gid);
        let bf = f.convert(ConvertOp::Signed, Kind::F32, b);
        let ax = f.binary(BinaryOp::Mul, Kind::F32, a, x);
        let sum = f.binary(BinaryOp::Add, Kind::F32, ax, bf);
        let flipped = f.binary(BinaryOp::Sub, Kind::F32, Operand::float(0.0), sum);
        let picked = f.var(Kind::F32);
        f.push(Op::Select {
            dst: picked,
            cmp: BinaryOp::Ne,
            lhs: Operand::Var(negate),
            rhs: Operand::Const(Literal::new("false", Kind::Bool)),
            on_true: Operand::Var(flipped),
            on_false: Operand::Var(sum),
        });
        let offset = slot_offset(&mut f);
        f.store(
            Address::Heap {
                base: out,
                offset: Some(Operand::Var(offset)),
            },
            picked,
        );
        f.terminate(Terminator::Return(None));
        let kernel = f.build();

        let args = |negate| {
            vec![
                zeros(4),
                Arg::Scalar(KernelArg::F32(0.5)),
                Arg::Scalar(KernelArg::Int(-3)),
                Arg::Scalar(KernelArg::Bool(negate)),
            ]
        };
        let plain = run(vec![kernel.clone()], "axpb", LaunchConfig::new_1d(4, 4), args(false), optimize);
        assert_eq!(f32s(&plain[0]), vec![-3.0, -2.5, -2.0, -1.5]);

        let negated = run(vec![kernel], "axpb", LaunchConfig::new_1d(4, 4), args(true), optimize);
        assert_eq!(f32s(&negated[0]), vec![3.0, 2.5, 2.0, 1.5]);
    });
}

#[test]
fn test_vector_build_store_and_extract() {
    both(|optimize| {
        let float4 = Kind::vector(Element::F32, 4).unwrap();
        let mut f = FunctionBuilder::kernel("lanes");
        let out = f.param(Kind::Ptr);
        let x = f.param(Kind::F32);
        let v = f.var(float4);
        f.push(Op::VectorBuild {
            dst: v,
            elements: vec![
                Operand::Var(x),
                Operand::float(1.0),
                Operand::float(2.0),
                Operand::Var(x),
            ],
        });
        f.store(Address::Heap { base: out, offset: None }, v);
        let lane = f.var(Kind::F32);
        f.push(Op::VectorExtract {
            dst: lane,
            vector: Operand::Var(v),
            lane: 2,
        });
        let scaled = f.binary(BinaryOp::Mul, Kind::F32, lane, x);
        f.store(
            Address::Heap {
                base: out,
                offset: Some(Operand::int(16)),
            },
            scaled,
        );
        f.terminate(Terminator::Return(None));

        let buffers = run(
            vec![f.build()],
            "lanes",
            LaunchConfig::new_1d(1, 1),
            vec![zeros(5), Arg::Scalar(KernelArg::F32(3.5))],
            optimize,
        );
        assert_eq!(f32s(&buffers[0]), vec![3.5, 1.0, 2.0, 3.5, 7.0]);
    });
}

#[test]
fn test_vector_load_from_heap() {
    both(|optimize| {
        let int4 = Kind::vector(Element::I32, 4).unwrap();
        let mut f = FunctionBuilder::kernel("reverse");
        let input = f.param(Kind::Ptr);
        let out = f.param(Kind::Ptr);
        let v = f.load(int4, Address::Heap { base: input, offset: None });
        let mut lanes = Vec::new();
        for lane in (0..4).rev() {
            let value = f.var(Kind::I32);
            f.push(Op::VectorExtract {
                dst: value,
                vector: Operand::Var(v),
                lane,
            });
            lanes.push(Operand::Var(value));
        }
        let reversed = f.var(int4);
        f.push(Op::VectorBuild {
            dst: reversed,
            elements: lanes,
        });
        f.store(Address::Heap { base: out, offset: None }, reversed);
        f.terminate(Terminator::Return(None));

        let input: Vec<u8> = [1i32, 2, 3, 4].iter().flat_map(|v| v.to_le_bytes()).collect();
        let buffers = run(
            vec![f.build()],
            "reverse",
            LaunchConfig::new_1d(1, 1),
            vec![Arg::Buffer(input), zeros(4)],
            optimize,
        );
        assert_eq!(i32s(&buffers[0]), vec![1, 2, 3, 4]);
        assert_eq!(i32s(&buffers[1]), vec![4, 3, 2, 1]);
    });
}

#[test]
fn test_loop_in_device_function() {
    both(|optimize| {
        let mut f = FunctionBuilder::kernel("triangle");
        let out = f.param(Kind::Ptr);
        let n = f.param(Kind::I32);
        let total = f.call("sum_to", Kind::I32, vec![Operand::Var(n)]);
        f.store(Address::Heap { base: out, offset: None }, total);
        f.terminate(Terminator::Return(None));
        let kernel = f.build();

        for (n, expected) in [(5, 10), (0, 0), (100, 4950)] {
            let buffers = run(
                vec![kernel.clone(), sum_to()],
                "triangle",
                LaunchConfig::new_1d(1, 1),
                vec![zeros(1), Arg::Scalar(KernelArg::Int(n))],
                optimize,
            );
            assert_eq!(i32s(&buffers[0]), vec![expected], "n={}", n);
        }
    });
}

#[test]
fn test_switch_merge_per_work_item() {
    both(|optimize| {
        let mut f = FunctionBuilder::kernel("classify");
        let out = f.param(Kind::Ptr);
        let x = f.var(Kind::I32);
        f.push(Op::ThreadId {
            dst: x,
            query: ThreadQuery::GlobalId,
            dimension: 0,
        });
        let class = f.call("pick", Kind::I32, vec![Operand::Var(x)]);
        let offset = slot_offset(&mut f);
        f.store(
            Address::Heap {
                base: out,
                offset: Some(Operand::Var(offset)),
            },
            class,
        );
        f.terminate(Terminator::Return(None));

        let buffers = run(
            vec![pick(), f.build()],
            "classify",
            LaunchConfig::new_1d(8, 2),
            vec![zeros(8)],
            optimize,
        );
        assert_eq!(i32s(&buffers[0]), vec![-1, 10, -1, -1, -1, -1, -1, 70]);
    });
}

#[test]
fn test_local_array_per_workgroup() {
    both(|optimize| {
        let mut f = FunctionBuilder::kernel("tiles");
        let out = f.param(Kind::Ptr);
        let tile = f.array(Region::Local, Kind::I32, 4);
        let lid = f.var(Kind::I32);
        f.push(Op::ThreadId {
            dst: lid,
            query: ThreadQuery::LocalId,
            dimension: 0,
        });
        let group = f.thread_id(ThreadQuery::GroupId, 0);
        let scaled = f.binary(BinaryOp::Mul, Kind::I32, group, Operand::long(100));
        let value = f.binary(BinaryOp::Add, Kind::I32, scaled, lid);
        let at = Address::Local {
            array: tile,
            index: Operand::Var(lid),
        };
        f.store(at.clone(), value);
        f.push(Op::Barrier { fence: Fence::Local });
        let back = f.load(Kind::I32, at);
        let offset = slot_offset(&mut f);
        f.store(
            Address::Heap {
                base: out,
                offset: Some(Operand::Var(offset)),
            },
            back,
        );
        f.terminate(Terminator::Return(None));

        let buffers = run(vec![f.build()], "tiles", LaunchConfig::new_1d(8, 4), vec![zeros(8)], optimize);
        assert_eq!(i32s(&buffers[0]), vec![0, 1, 2, 3, 100, 101, 102, 103]);
    });
}

#[test]
fn test_intrinsic_and_branch() {
    both(|optimize| {
        let mut f = FunctionBuilder::kernel("safe_sqrt");
        let out = f.param(Kind::Ptr);
        let x = f.param(Kind::F32);
        let positive = f.block();
        let negative = f.block();
        let done = f.block();

        let is_negative = f.binary(BinaryOp::Lt, Kind::Bool, x, Operand::float(0.0));
        f.terminate(Terminator::Branch {
            condition: Operand::Var(is_negative),
            on_true: negative,
            on_false: positive,
            loop_hint: None,
        });

        f.switch_to(positive);
        let root = f.var(Kind::F32);
        f.push(Op::Intrinsic {
            dst: root,
            op: Intrinsic::Sqrt,
            args: vec![Operand::Var(x)],
        });
        f.terminate(Terminator::Jump(done));

        f.switch_to(negative);
        f.terminate(Terminator::Jump(done));

        f.switch_to(done);
        let result = f.var(Kind::F32);
        f.phi_into(
            result,
            vec![(positive, Operand::Var(root)), (negative, Operand::float(-1.0))],
        );
        f.store(Address::Heap { base: out, offset: None }, result);
        f.terminate(Terminator::Return(None));
        let kernel = f.build();

        for (x, expected) in [(16.0f32, 4.0f32), (-2.0, -1.0)] {
            let buffers = run(
                vec![kernel.clone()],
                "safe_sqrt",
                LaunchConfig::new_1d(1, 1),
                vec![zeros(1), Arg::Scalar(KernelArg::F32(x))],
                optimize,
            );
            assert_eq!(f32s(&buffers[0]), vec![expected]);
        }
    });
}
