use kiln_dtype::DType;
use kiln_ir::{Fusion, ParallelType, ReductionOpType, UnaryOp};
use kiln_runtime::{CompileOptions, DeviceCapability, RuntimeInfo, TensorArg};
use kiln_schedule::primitives;

use crate::error::Error;
use crate::validation::{validate_lowered, validate_vectorization};
use crate::lower_fusion;

fn bind_1d(fusion: &Fusion, len: i64) -> RuntimeInfo {
    let args = [TensorArg::contiguous(DType::Float, &[len])];
    RuntimeInfo::bind(fusion, &args, DeviceCapability::sm80()).unwrap()
}

/// `sum(t0)` scheduled `split(0,5); split(1,3)`: the inner split needs
/// exactly one non-divisible predicate, the outer one is covered by the
/// root bound.
#[test]
fn nested_non_divisible_split_gets_one_predicate() {
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 1);
    let t1 = fusion.reduction(ReductionOpType::Add, t0, &[0]).unwrap();
    fusion.add_output(fusion.tensor(t1).val);

    primitives::split(&mut fusion, t1, 0, 5, true).unwrap();
    primitives::split(&mut fusion, t1, 1, 3, true).unwrap();
    assert_eq!(fusion.non_divisible_splits().len(), 2);

    let mut info = bind_1d(&fusion, 24);
    let kernel = lower_fusion(&mut fusion, &mut info, &CompileOptions::default(), &[]).unwrap();
    let report = validate_lowered(&fusion, &kernel);
    assert_eq!(report.non_divisible_predicates, 1);
    assert_eq!(report.vectorization_entry_checks, 0);
    assert!(report.if_then_elses > 0);
}

/// `copy(t0)` scheduled `split(0,8,outer); split(1,4); vectorize(inner)`:
/// no per-iteration predicate, one runtime entry check per feeding split.
/// Length 32 passes, length 8 trips the stride check.
#[test]
fn vectorized_non_divisible_split_validates_at_runtime() {
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 1);
    let t1 = fusion.set(t0);
    fusion.add_output(fusion.tensor(t1).val);

    primitives::split(&mut fusion, t1, 0, 8, false).unwrap();
    primitives::split(&mut fusion, t1, 1, 4, true).unwrap();
    primitives::parallelize(&mut fusion, t1, 2, ParallelType::Vectorize).unwrap();

    let mut info = bind_1d(&fusion, 32);
    let kernel = lower_fusion(&mut fusion, &mut info, &CompileOptions::default(), &[]).unwrap();
    let report = validate_lowered(&fusion, &kernel);
    // Validate-at-runtime, never predicate-per-iteration, never both.
    assert_eq!(report.non_divisible_predicates, 0);
    assert!(report.vectorization_entry_checks > 0);

    validate_vectorization(&fusion, &kernel, &mut info).unwrap();

    let mut short_info = bind_1d(&fusion, 8);
    let err = validate_vectorization(&fusion, &kernel, &mut short_info).unwrap_err();
    assert!(matches!(err, Error::VectorizationStrideViolation { width: 4, .. }));
}

/// RNG fills are always predicated, even with a trivially full domain.
#[test]
fn rng_is_always_predicated() {
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 1);
    let t1 = fusion.rand_like(t0, kiln_ir::RNGOpType::Uniform);
    fusion.add_output(fusion.tensor(t1).val);

    let mut info = bind_1d(&fusion, 64);
    let kernel = lower_fusion(&mut fusion, &mut info, &CompileOptions::default(), &[]).unwrap();

    let rng_expr = fusion
        .expr_ids()
        .find(|&e| matches!(fusion.expr(e).kind, kiln_ir::ExprKind::Rng { .. }))
        .unwrap();
    assert!(fusion.expr(rng_expr).write_predicate.is_some());
    let report = validate_lowered(&fusion, &kernel);
    assert!(report.if_then_elses > 0);
}

/// Statically-sized bounds get magic-zero protection so the target compiler
/// cannot fold the check away across an unrolled loop.
#[test]
fn magic_zero_protects_constant_bounds() {
    let mut fusion = Fusion::new();
    let t0 = fusion.full(&[10], DType::Float, kiln_ir::ScalarValue::Float(1.0));
    let t1 = fusion.unary(UnaryOp::Neg, t0);
    fusion.add_output(fusion.tensor(t1).val);
    primitives::split(&mut fusion, t1, 0, 3, true).unwrap();
    primitives::split(&mut fusion, t1, 1, 2, true).unwrap();

    let args: [TensorArg; 0] = [];
    let mut info = RuntimeInfo::bind(&fusion, &args, DeviceCapability::sm80()).unwrap();
    let kernel = lower_fusion(&mut fusion, &mut info, &CompileOptions::default(), &[]).unwrap();
    assert!(kernel.summary.uses_magic_zero);
}

/// A broadcast concretized to mismatched extents forces a bound on every
/// write through it; matching extents need no guard.
#[test]
fn non_unique_broadcast_writes_are_guarded() {
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 1);
    let b = fusion.full(&[4, 8], DType::Float, kiln_ir::ScalarValue::Float(0.0));
    let c = fusion.full(&[4, 9], DType::Float, kiln_ir::ScalarValue::Float(0.0));
    let a = fusion.broadcast(t0, &[false, true]).unwrap();
    let ab = fusion.binary(kiln_ir::BinaryOp::Add, a, b).unwrap();
    let ac = fusion.binary(kiln_ir::BinaryOp::Add, a, c).unwrap();
    fusion.add_output(fusion.tensor(ab).val);
    fusion.add_output(fusion.tensor(ac).val);

    let mut info = bind_1d(&fusion, 4);
    lower_fusion(&mut fusion, &mut info, &CompileOptions::default(), &[]).unwrap();

    for out in [ab, ac] {
        let def = fusion.definition(fusion.tensor(out).val).unwrap();
        assert!(fusion.expr(def).write_predicate.is_some(), "mismatched concretization must be bounded");
    }

    // With matching extents the broadcast is uniquely concretized: no guard.
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 1);
    let b = fusion.full(&[4, 8], DType::Float, kiln_ir::ScalarValue::Float(0.0));
    let c = fusion.full(&[4, 8], DType::Float, kiln_ir::ScalarValue::Float(0.0));
    let a = fusion.broadcast(t0, &[false, true]).unwrap();
    let ab = fusion.binary(kiln_ir::BinaryOp::Add, a, b).unwrap();
    let ac = fusion.binary(kiln_ir::BinaryOp::Add, a, c).unwrap();
    fusion.add_output(fusion.tensor(ab).val);
    fusion.add_output(fusion.tensor(ac).val);

    let mut info = bind_1d(&fusion, 4);
    lower_fusion(&mut fusion, &mut info, &CompileOptions::default(), &[]).unwrap();
    for out in [ab, ac] {
        let def = fusion.definition(fusion.tensor(out).val).unwrap();
        assert!(fusion.expr(def).write_predicate.is_none());
    }
}

/// A write redundant across TIDx is restricted to thread zero.
#[test]
fn thread_redundant_global_write_is_guarded() {
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 2);
    let t1 = fusion.reduction(ReductionOpType::Add, t0, &[1]).unwrap();
    fusion.add_output(fusion.tensor(t1).val);

    // The reduction axis runs on TIDx; the output write itself binds none.
    primitives::split(&mut fusion, t1, 1, 128, true).unwrap();
    primitives::parallelize(&mut fusion, t1, 2, ParallelType::TIDx).unwrap();
    let partial = primitives::rfactor(&mut fusion, t1, &[1]).unwrap();
    let _ = partial;

    let args = [TensorArg::contiguous(DType::Float, &[16, 1024])];
    let mut info = RuntimeInfo::bind(&fusion, &args, DeviceCapability::sm80()).unwrap();
    let kernel = lower_fusion(&mut fusion, &mut info, &CompileOptions::default(), &[]).unwrap();

    let out_def = fusion.definition(fusion.tensor(t1).val).unwrap();
    assert!(fusion.expr(out_def).write_predicate.is_some(), "redundant write must be guarded");
    let report = validate_lowered(&fusion, &kernel);
    assert!(report.if_then_elses > 0);
}
