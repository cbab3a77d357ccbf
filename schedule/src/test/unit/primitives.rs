use kiln_dtype::DType;
use kiln_ir::{Fusion, IdExprKind, IterType, LoadStoreOpType, MemoryType, ParallelType};
use kiln_runtime::DeviceCapability;

use crate::error::Error;
use crate::primitives::{self, ComputeAtMode};
use crate::test::helpers;

#[test]
fn divisible_split_is_not_recorded() {
    let (mut fusion, _, t1) = helpers::unary_fusion(1);
    // Constant extent via full() keeps divisibility decidable.
    let mut fusion2 = Fusion::new();
    let t = fusion2.full(&[24], DType::Float, kiln_ir::ScalarValue::Float(0.0));
    primitives::split(&mut fusion2, t, 0, 6, true).unwrap();
    assert!(fusion2.non_divisible_splits().is_empty());

    // Symbolic extents cannot be proven divisible.
    primitives::split(&mut fusion, t1, 0, 5, true).unwrap();
    assert_eq!(fusion.non_divisible_splits().len(), 1);
}

#[test]
fn non_divisible_split_is_recorded() {
    let mut fusion = Fusion::new();
    let t = fusion.full(&[24], DType::Float, kiln_ir::ScalarValue::Float(0.0));
    primitives::split(&mut fusion, t, 0, 5, true).unwrap();
    let records = fusion.non_divisible_splits();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].0, t);
    match &fusion.id_expr(records[0].1).kind {
        IdExprKind::Split { divisible, .. } => assert_eq!(*divisible, Some(false)),
        other => panic!("expected split, got {other:?}"),
    }
}

#[test]
fn split_by_one_still_creates_axes() {
    let (mut fusion, _, t1) = helpers::unary_fusion(1);
    let before = fusion.tensor(t1).domain.loop_.clone();
    primitives::split(&mut fusion, t1, 0, 1, true).unwrap();
    let after = fusion.tensor(t1).domain.loop_.clone();
    assert_eq!(after.len(), 2);
    assert!(!after.contains(&before[0]));
    assert_eq!(fusion.constant_extent(after[1]), Some(1));
}

#[test]
fn merge_of_two_broadcasts_is_broadcast() {
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 1);
    let t1 = fusion.broadcast(t0, &[true, true, false]).unwrap();
    primitives::merge(&mut fusion, t1, 0, 1).unwrap();
    let merged = fusion.tensor(t1).domain.loop_[0];
    assert_eq!(fusion.iter_domain(merged).iter, IterType::Broadcast);
}

#[test]
fn parallelizing_mixed_broadcast_merge_is_rejected() {
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 1);
    let t1 = fusion.broadcast(t0, &[true, false]).unwrap();
    primitives::merge(&mut fusion, t1, 0, 1).unwrap();
    let err = primitives::parallelize(&mut fusion, t1, 0, ParallelType::TIDx).unwrap_err();
    assert!(matches!(err, Error::InvalidSchedule { .. }));
}

#[test]
fn cp_async_cache_requires_sm80() {
    let (mut fusion, t0, _) = helpers::unary_fusion(1);
    let err =
        primitives::cache_after(&mut fusion, t0, LoadStoreOpType::CpAsync, &DeviceCapability::sm75()).unwrap_err();
    assert!(matches!(err, Error::UnsupportedHardware { required_major: 8, .. }));

    let cache =
        primitives::cache_after(&mut fusion, t0, LoadStoreOpType::CpAsync, &DeviceCapability::sm80()).unwrap();
    assert_eq!(fusion.tensor(cache).memory, MemoryType::Shared);
    // Consumers now read the cache instead of the input.
    assert_eq!(fusion.producers_of(cache), vec![t0]);
}

#[test]
fn cp_async_bulk_requires_sm90() {
    let (mut fusion, t0, _) = helpers::unary_fusion(1);
    let err = primitives::cache_after(&mut fusion, t0, LoadStoreOpType::CpAsyncBulkTensorTile, &DeviceCapability::sm80())
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedHardware { required_major: 9, .. }));
}

#[test]
fn circular_buffer_depth_gate() {
    let (mut fusion, t0, _) = helpers::unary_fusion(1);
    let cache = primitives::cache_after(&mut fusion, t0, LoadStoreOpType::Set, &DeviceCapability::sm80()).unwrap();
    assert!(matches!(
        primitives::circular_buffer(&mut fusion, cache, 1),
        Err(Error::CircularBufferDepth { depth: 1 })
    ));
    primitives::circular_buffer(&mut fusion, cache, 8).unwrap();
    assert!(fusion.tensor(cache).is_circular_buffered());
    assert_eq!(fusion.tensor(cache).circular_buffer_depth, Some(8));
}

#[test]
fn cache_before_reroutes_the_definition() {
    let (mut fusion, _, t1) = helpers::unary_fusion(1);
    let cache = primitives::cache_before(&mut fusion, t1, LoadStoreOpType::Set, &DeviceCapability::sm80()).unwrap();
    // The original unary now defines the cache; a copy materializes t1.
    let t1_def = fusion.definition(fusion.tensor(t1).val).unwrap();
    assert!(matches!(fusion.expr(t1_def).kind, kiln_ir::ExprKind::LoadStore { op: LoadStoreOpType::Set }));
    let cache_def = fusion.definition(fusion.tensor(cache).val).unwrap();
    assert!(matches!(fusion.expr(cache_def).kind, kiln_ir::ExprKind::Unary { .. }));
}

#[test]
fn rfactor_splits_partial_and_final_reduction() {
    let (mut fusion, _, t1) = helpers::sum_fusion(1);
    // [I, R] -> [I, Ro, Ri(TIDx)]
    primitives::split(&mut fusion, t1, 1, 128, true).unwrap();
    let partial = primitives::rfactor(&mut fusion, t1, &[1]).unwrap();

    // Producer keeps the rfactored reduction, consumer finishes the rest.
    let partial_domain = &fusion.tensor(partial).domain;
    assert_eq!(partial_domain.loop_.len(), 3);
    assert!(fusion.iter_domain(partial_domain.loop_[1]).is_reduction());
    assert!(fusion.iter_domain(partial_domain.loop_[2]).is_rfactor);

    let final_domain = &fusion.tensor(t1).domain;
    assert_eq!(final_domain.loop_.len(), 2);
    assert!(fusion.iter_domain(final_domain.loop_[1]).is_reduction());

    // The final reduction consumes the partial.
    assert_eq!(fusion.producers_of(t1), vec![partial]);
}

#[test]
fn compute_at_modes() {
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 2);
    let mid = fusion.unary(kiln_ir::UnaryOp::Exp, t0);
    let out = fusion.unary(kiln_ir::UnaryOp::Log, mid);
    fusion.add_output(fusion.tensor(out).val);

    let max = primitives::max_compatible_depth(&fusion, mid, out);
    assert_eq!(max, 2);

    // Standard rejects beyond the compatible depth.
    assert!(matches!(
        primitives::compute_at(&mut fusion, mid, out, 5, ComputeAtMode::Standard),
        Err(Error::ComputeAtDepth { .. })
    ));
    // BestEffort clamps; MostInlined ignores the request.
    assert_eq!(primitives::compute_at(&mut fusion, mid, out, 5, ComputeAtMode::BestEffort).unwrap(), 2);
    assert_eq!(primitives::compute_at(&mut fusion, mid, out, 0, ComputeAtMode::MostInlined).unwrap(), 2);
    assert_eq!(fusion.tensor(mid).compute_at_pos, 2);
}

#[test]
fn reduction_blocks_inlining() {
    let (fusion, t0, t1) = helpers::sum_fusion(1);
    // The producer-side reduction axis stops inlining past position 1.
    assert_eq!(primitives::max_compatible_depth(&fusion, t0, t1), 1);
}

#[test]
fn welford_parallelization_propagates_to_siblings() {
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 2);
    let (avg, var_n, n) = fusion.welford(t0, &[1]).unwrap();
    fusion.add_output(fusion.tensor(avg).val);

    primitives::parallelize(&mut fusion, avg, 0, ParallelType::BIDx).unwrap();
    for tv in [var_n, n] {
        let id = fusion.tensor(tv).domain.loop_[0];
        assert_eq!(fusion.iter_domain(id).parallel, ParallelType::BIDx);
    }
}
