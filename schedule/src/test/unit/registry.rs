use kiln_dtype::DType;
use kiln_ir::{BinaryOp, Fusion, OutputAlias, UnaryOp};

use crate::error::Error;
use crate::registry::{HeuristicCache, HeuristicSummary, SchedulerKind, choose_heuristic, schedule_fusion};
use crate::test::helpers;

#[test]
fn pointwise_wins_for_elementwise_fusions() {
    let (fusion, _, _) = helpers::unary_fusion(2);
    let mut info = helpers::bind(&fusion, &[&[64, 64]]);
    let summary = HeuristicSummary::new();
    assert_eq!(choose_heuristic(&fusion, &mut info, &summary).unwrap(), SchedulerKind::PointWise);
}

#[test]
fn reduction_wins_over_pointwise() {
    let (fusion, _, _) = helpers::sum_fusion(1);
    let mut info = helpers::bind(&fusion, &[&[64, 512]]);
    let summary = HeuristicSummary::new();
    assert_eq!(choose_heuristic(&fusion, &mut info, &summary).unwrap(), SchedulerKind::Reduction);
}

#[test]
fn persistent_wins_over_reduction_for_normalization() {
    let (fusion, _) = helpers::normalization_fusion();
    let mut info = helpers::bind(&fusion, &[&[128, 1024]]);
    let summary = HeuristicSummary::new();
    assert_eq!(choose_heuristic(&fusion, &mut info, &summary).unwrap(), SchedulerKind::InnerPersistent);
}

#[test]
fn matmul_ops_are_exclusive_to_the_matmul_scheduler() {
    let mut fusion = Fusion::new();
    let a = fusion.input_tensor(DType::Half, 2);
    let b = fusion.input_tensor(DType::Half, 2);
    let c = fusion.matmul(a, b).unwrap();
    fusion.add_output(fusion.tensor(c).val);

    let summary = HeuristicSummary::new();
    // Reduction/pointwise gates must hard-reject the matmul fusion.
    assert!(!SchedulerKind::Reduction.can_schedule_compile_time(&fusion, &summary));
    assert!(!SchedulerKind::PointWise.can_schedule_compile_time(&fusion, &summary));

    let mut info = helpers::bind(&fusion, &[&[128, 64], &[64, 128]]);
    assert_eq!(choose_heuristic(&fusion, &mut info, &summary).unwrap(), SchedulerKind::Matmul);
}

#[test]
fn sdpa_routes_to_expression_evaluation() {
    let mut fusion = Fusion::new();
    let q = fusion.input_tensor(DType::Half, 2);
    let k = fusion.input_tensor(DType::Half, 2);
    let v = fusion.input_tensor(DType::Half, 2);
    let out = fusion.sdpa(q, k, v).unwrap();
    fusion.add_output(fusion.tensor(out).val);

    let summary = HeuristicSummary::new();
    assert!(!SchedulerKind::PointWise.can_schedule_compile_time(&fusion, &summary));
    let mut info = helpers::bind(&fusion, &[&[64, 64], &[64, 64], &[64, 64]]);
    assert_eq!(choose_heuristic(&fusion, &mut info, &summary).unwrap(), SchedulerKind::ExprEval);
}

#[test]
fn alias_only_fusion_is_expression_evaluated() {
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 1);
    let t1 = fusion.unary(UnaryOp::Neg, t0);
    let (t0_val, t1_val) = (fusion.tensor(t0).val, fusion.tensor(t1).val);
    fusion.add_aliased_output(t1_val, OutputAlias::ReuseBuffer { input: t0_val });

    let mut info = helpers::bind(&fusion, &[&[16]]);
    let summary = HeuristicSummary::new();
    assert_eq!(choose_heuristic(&fusion, &mut info, &summary).unwrap(), SchedulerKind::ExprEval);
}

#[test]
fn disconnected_fusion_is_rejected_by_everyone() {
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 1);
    let t1 = fusion.input_tensor(DType::Float, 1);
    let a = fusion.unary(UnaryOp::Neg, t0);
    let b = fusion.unary(UnaryOp::Neg, t1);
    fusion.add_output(fusion.tensor(a).val);
    fusion.add_output(fusion.tensor(b).val);

    let mut info = helpers::bind(&fusion, &[&[16], &[16]]);
    let summary = HeuristicSummary::new();
    assert!(matches!(choose_heuristic(&fusion, &mut info, &summary), Err(Error::SchedulerRejection)));
}

#[test]
fn self_mapping_is_rejected_by_everyone() {
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 2);
    let flipped = fusion.permute(t0, &[1, 0]).unwrap();
    let joined = fusion.binary(BinaryOp::Add, t0, flipped).unwrap();
    fusion.add_output(fusion.tensor(joined).val);

    let mut info = helpers::bind(&fusion, &[&[32, 32]]);
    let summary = HeuristicSummary::new();
    assert!(matches!(choose_heuristic(&fusion, &mut info, &summary), Err(Error::SchedulerRejection)));
}

#[test]
fn heuristic_cache_reuses_decisions() {
    let mut cache = HeuristicCache::new();

    let (mut fusion, _, _) = helpers::unary_fusion(2);
    let mut info = helpers::bind(&fusion, &[&[64, 64]]);
    let (kind, _) = schedule_fusion(&mut fusion, &mut info, Some(&mut cache), false).unwrap();
    assert_eq!(kind, SchedulerKind::PointWise);
    assert_eq!(cache.len(), 1);

    // Same fingerprint: the cached decision is replayed.
    let (mut fusion2, _, _) = helpers::unary_fusion(2);
    let mut info2 = helpers::bind(&fusion2, &[&[64, 64]]);
    assert!(cache.lookup(&fusion2, &info2).is_some());
    let (kind2, _) = schedule_fusion(&mut fusion2, &mut info2, Some(&mut cache), false).unwrap();
    assert_eq!(kind2, SchedulerKind::PointWise);
    assert_eq!(cache.len(), 1);

    // disable_kernel_reuse invalidates the cache before refilling it.
    let (mut fusion3, _, _) = helpers::unary_fusion(2);
    let mut info3 = helpers::bind(&fusion3, &[&[64, 64]]);
    schedule_fusion(&mut fusion3, &mut info3, Some(&mut cache), true).unwrap();
    assert_eq!(cache.len(), 1);
}
