use kiln_dtype::DType;
use kiln_ir::{Fusion, KirNode, MemoryType, ParallelType, UnaryOp};
use kiln_runtime::{CompileOptions, DeviceCapability, IndexTypeOption, RuntimeInfo, TensorArg};
use kiln_schedule::primitives;

use crate::error::Error;
use crate::validation::validate_lowered;
use crate::{lower_fusion, schedule_and_lower};

fn bind(fusion: &Fusion, shapes: &[&[i64]]) -> RuntimeInfo {
    let args: Vec<TensorArg> = fusion
        .input_tensors()
        .iter()
        .zip(shapes)
        .map(|(&tv, sizes)| TensorArg::contiguous(fusion.tensor(tv).dtype, sizes))
        .collect();
    RuntimeInfo::bind(fusion, &args, DeviceCapability::sm80()).unwrap()
}

#[test]
fn end_to_end_pointwise_lowering() {
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 1);
    let t1 = fusion.unary(UnaryOp::Relu, t0);
    fusion.add_output(fusion.tensor(t1).val);

    let args = [TensorArg::contiguous(DType::Float, &[1 << 16])];
    let lowered =
        schedule_and_lower(&mut fusion, &args, DeviceCapability::sm80(), &CompileOptions::default()).unwrap();

    assert_eq!(lowered.scheduler, kiln_schedule::SchedulerKind::PointWise);
    let report = validate_lowered(&fusion, &lowered.kernel);
    assert!(report.for_loops > 0);
    assert!(!lowered.kernel.top_level.is_empty());
    // Every lowered tensor keeps its four domains equivalent.
    for tv in fusion.tensor_ids() {
        kiln_ir::tensor::validate_equivalence(&fusion, tv).unwrap();
    }
}

#[test]
fn symbolic_sizes_become_input_metadata() {
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 2);
    let t1 = fusion.unary(UnaryOp::Neg, t0);
    fusion.add_output(fusion.tensor(t1).val);

    let mut info = bind(&fusion, &[&[8, 8]]);
    lower_fusion(&mut fusion, &mut info, &CompileOptions::default(), &[]).unwrap();

    for (dim, &id) in fusion.tensor(t0).domain.root.clone().iter().enumerate() {
        let extent = fusion.iter_domain(id).extent;
        assert!(matches!(
            fusion.val(extent).kind,
            kiln_ir::ValKind::TensorSize { tv, dim: d } if tv == t0 && d == dim
        ));
    }
}

#[test]
fn allocation_sits_outside_compute_at() {
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 1);
    let mid = fusion.unary(UnaryOp::Exp, t0);
    let out = fusion.unary(UnaryOp::Log, mid);
    fusion.add_output(fusion.tensor(out).val);
    primitives::inline_at(&mut fusion, mid, 1);

    let mut info = bind(&fusion, &[&[64]]);
    let kernel = lower_fusion(&mut fusion, &mut info, &CompileOptions::default(), &[]).unwrap();

    // The allocate for `mid` must appear at a depth <= its compute-at pos.
    let mut alloc_depth = None;
    kernel.visit(|stack, id| {
        if let KirNode::Allocate { tv, .. } = kernel.node(id) {
            if *tv == mid {
                let loops =
                    stack.iter().filter(|&&s| matches!(kernel.node(s), KirNode::ForLoop { .. })).count();
                alloc_depth = Some(loops);
            }
        }
    });
    assert!(alloc_depth.expect("mid is allocated") <= fusion.tensor(mid).compute_at_pos);
}

#[test]
fn forced_int32_overflow_is_rejected() {
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 1);
    let t1 = fusion.unary(UnaryOp::Neg, t0);
    fusion.add_output(fusion.tensor(t1).val);

    let args = [TensorArg::contiguous(DType::Float, &[1 << 29])];
    let mut info = RuntimeInfo::bind(&fusion, &args, DeviceCapability::sm80()).unwrap();
    let options = CompileOptions { index_type: IndexTypeOption::Int32, ..Default::default() };
    let err = lower_fusion(&mut fusion, &mut info, &options, &[]).unwrap_err();
    assert!(matches!(err, Error::IndexTypeOverflow { .. }));
}

#[test]
fn auto_index_type_matches_runtime_info() {
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 1);
    let t1 = fusion.unary(UnaryOp::Neg, t0);
    fusion.add_output(fusion.tensor(t1).val);

    let mut info = bind(&fusion, &[&[128]]);
    let kernel = lower_fusion(&mut fusion, &mut info, &CompileOptions::default(), &[]).unwrap();
    assert_eq!(kernel.summary.index_type, DType::Int32);
}

#[test]
fn disjoint_locals_alias() {
    // Two intermediates with identical footprints and disjoint live ranges.
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 1);
    let a = fusion.unary(UnaryOp::Exp, t0);
    let b = fusion.unary(UnaryOp::Neg, a);
    let c = fusion.unary(UnaryOp::Log, b);
    let d = fusion.unary(UnaryOp::Abs, c);
    fusion.add_output(fusion.tensor(d).val);
    for tv in [a, b, c] {
        primitives::set_memory_type(&mut fusion, tv, MemoryType::Local);
    }

    let mut info = bind(&fusion, &[&[64]]);
    let kernel = lower_fusion(&mut fusion, &mut info, &CompileOptions::default(), &[]).unwrap();
    let report = validate_lowered(&fusion, &kernel);
    assert!(report.allocations >= 3);
    // `a` dies before `c` is defined, so `c` reuses its storage.
    assert!(report.aliased_allocations >= 1);
}

#[test]
fn welford_outputs_never_alias_inputs() {
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 2);
    let cache = fusion.set(t0);
    let (avg, var_n, n) = fusion.welford(cache, &[1]).unwrap();
    let out = fusion.unary(UnaryOp::Neg, avg);
    fusion.add_output(fusion.tensor(out).val);

    let mut info = bind(&fusion, &[&[4, 4]]);
    let kernel = lower_fusion(&mut fusion, &mut info, &CompileOptions::default(), &[]).unwrap();

    // No welford output allocation may alias the welford input's.
    let mut cache_alloc = None;
    let mut welford_allocs = Vec::new();
    kernel.visit(|_, id| {
        if let KirNode::Allocate { tv, alias_of, .. } = kernel.node(id) {
            if *tv == cache {
                cache_alloc = Some(id);
            }
            if [avg, var_n, n].contains(tv) {
                welford_allocs.push((*tv, *alias_of));
            }
        }
    });
    for (_, alias) in welford_allocs {
        assert!(alias.is_none() || alias != cache_alloc);
    }

    // The zero-init landed on the welford accumulators.
    let mut zeroed = 0;
    kernel.visit(|_, id| {
        if let KirNode::Allocate { tv, zero_init: true, .. } = kernel.node(id) {
            if [avg, var_n, n].contains(tv) {
                zeroed += 1;
            }
        }
    });
    assert_eq!(zeroed, 3);
}

#[test]
fn welford_over_a_vectorized_axis_lowers_to_the_wide_variant() {
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 2);
    let (avg, _, _) = fusion.welford(t0, &[1]).unwrap();
    fusion.add_output(fusion.tensor(avg).val);

    // [I, R] -> [I, Ro, Rv]: the inner reduction chunk is a vector lane.
    primitives::split(&mut fusion, avg, 1, 4, true).unwrap();
    primitives::parallelize(&mut fusion, avg, 2, ParallelType::Vectorize).unwrap();

    let mut info = bind(&fusion, &[&[16, 64]]);
    let kernel = lower_fusion(&mut fusion, &mut info, &CompileOptions::default(), &[]).unwrap();

    let mut wide = None;
    kernel.visit(|_, id| {
        if let KirNode::VectorizedWelford { width, .. } = kernel.node(id) {
            wide = Some(*width);
        }
    });
    assert_eq!(wide, Some(4));
}

#[test]
fn kernel_visit_passes_the_scope_stack() {
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 2);
    let t1 = fusion.unary(UnaryOp::Neg, t0);
    fusion.add_output(fusion.tensor(t1).val);

    let mut info = bind(&fusion, &[&[4, 4]]);
    let kernel = lower_fusion(&mut fusion, &mut info, &CompileOptions::default(), &[]).unwrap();

    // The expression statement sits under both loops of the rank-2 nest.
    let mut max_depth = 0;
    kernel.visit(|stack, id| {
        if matches!(kernel.node(id), KirNode::Expr { .. }) {
            max_depth = max_depth.max(stack.len());
        }
    });
    assert_eq!(max_depth, 2);
}

#[test]
fn user_hooks_run_in_append_order() {
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 1);
    let t1 = fusion.unary(UnaryOp::Neg, t0);
    fusion.add_output(fusion.tensor(t1).val);

    let hooks: Vec<crate::LoweringHook> = vec![
        Box::new(|ctx| {
            let sync = ctx.kernel.push(KirNode::BlockSync { aligned: true, war_hazard: false });
            ctx.kernel.top_level.push(sync);
            Ok(())
        }),
        Box::new(|ctx| {
            let sync = ctx.kernel.push(KirNode::BlockSync { aligned: false, war_hazard: true });
            ctx.kernel.top_level.push(sync);
            Ok(())
        }),
    ];

    let mut info = bind(&fusion, &[&[32]]);
    let kernel = lower_fusion(&mut fusion, &mut info, &CompileOptions::default(), &hooks).unwrap();

    let tail: Vec<_> = kernel.top_level.iter().rev().take(2).map(|&id| kernel.node(id).clone()).collect();
    assert_eq!(tail[0], KirNode::BlockSync { aligned: false, war_hazard: true });
    assert_eq!(tail[1], KirNode::BlockSync { aligned: true, war_hazard: false });
}

#[test]
fn parallel_loops_use_hardware_index_names() {
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 1);
    let t1 = fusion.unary(UnaryOp::Neg, t0);
    fusion.add_output(fusion.tensor(t1).val);
    primitives::split(&mut fusion, t1, 0, 128, true).unwrap();
    primitives::parallelize(&mut fusion, t1, 0, ParallelType::BIDx).unwrap();
    primitives::parallelize(&mut fusion, t1, 1, ParallelType::TIDx).unwrap();

    let mut info = bind(&fusion, &[&[4096]]);
    let kernel = lower_fusion(&mut fusion, &mut info, &CompileOptions::default(), &[]).unwrap();

    let mut names = Vec::new();
    kernel.visit(|_, id| {
        if let KirNode::ForLoop { index, .. } = kernel.node(id) {
            if let kiln_ir::ValKind::Symbolic { name: Some(name) } = &fusion.val(*index).kind {
                names.push(name.clone());
            }
        }
    });
    assert!(names.contains(&"blockIdx.x".to_string()));
    assert!(names.contains(&"threadIdx.x".to_string()));
}
