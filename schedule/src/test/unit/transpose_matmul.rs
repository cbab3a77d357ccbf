use kiln_dtype::DType;
use kiln_ir::{ExprKind, Fusion, MemoryType, MmaUnitDim, ParallelType};
use kiln_runtime::DeviceCapability;

use crate::registry::{HeuristicSummary, choose_heuristic, SchedulerKind};
use crate::test::helpers;
use crate::{matmul, transpose};

fn transpose_fusion() -> (Fusion, kiln_ir::TensorViewId, kiln_ir::TensorViewId) {
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 2);
    let t1 = fusion.permute(t0, &[1, 0]).unwrap();
    fusion.add_output(fusion.tensor(t1).val);
    (fusion, t0, t1)
}

#[test]
fn innermost_swap_selects_the_transpose_scheduler() {
    let (fusion, _, _) = transpose_fusion();
    let mut info = helpers::bind(&fusion, &[&[256, 256]]);
    let summary = HeuristicSummary::new();
    assert_eq!(choose_heuristic(&fusion, &mut info, &summary).unwrap(), SchedulerKind::Transpose);
}

#[test]
fn tiny_transposes_fall_back_to_pointwise() {
    let (fusion, _, _) = transpose_fusion();
    // Both dims are under one 32x32 tile.
    let mut info = helpers::bind(&fusion, &[&[8, 8]]);
    let summary = HeuristicSummary::new();
    assert_eq!(choose_heuristic(&fusion, &mut info, &summary).unwrap(), SchedulerKind::PointWise);
}

#[test]
fn transpose_schedule_stages_through_swizzled_shared_memory() {
    let (mut fusion, _, out) = transpose_fusion();
    let mut info = helpers::bind(&fusion, &[&[256, 256]]);
    let summary = HeuristicSummary::new();
    let params = transpose::compute_heuristics(&fusion, &mut info, &summary).unwrap();
    assert_eq!(params.tile, 32);

    transpose::schedule(&mut fusion, &params, &info).unwrap();

    // One tensor landed in shared memory with a swizzled tile.
    let staged = fusion
        .tensor_ids()
        .find(|&tv| fusion.tensor(tv).memory == MemoryType::Shared)
        .expect("transpose stages through shared memory");
    let swizzled = fusion.tensor(staged).domain.loop_.iter().any(|&id| {
        fusion
            .iter_domain(id)
            .definition
            .map(|def| matches!(fusion.id_expr(def).kind, kiln_ir::IdExprKind::Swizzle2D { .. }))
            .unwrap_or(false)
    });
    assert!(swizzled, "shared tile carries a bank-conflict swizzle");

    // The output tile is block-bound with TIDx/TIDy threads.
    let ptypes: Vec<ParallelType> =
        fusion.tensor(out).domain.loop_.iter().map(|&id| fusion.iter_domain(id).parallel).collect();
    assert!(ptypes.contains(&ParallelType::BIDx));
    assert!(ptypes.contains(&ParallelType::TIDx));
    assert!(ptypes.contains(&ParallelType::TIDy));
}

fn matmul_fusion(dtype: DType) -> (Fusion, kiln_ir::TensorViewId) {
    let mut fusion = Fusion::new();
    let a = fusion.input_tensor(dtype, 2);
    let b = fusion.input_tensor(dtype, 2);
    let c = fusion.matmul(a, b).unwrap();
    fusion.add_output(fusion.tensor(c).val);
    (fusion, c)
}

#[test]
fn matmul_tiles_differ_per_generation() {
    let (fusion, _) = matmul_fusion(DType::Half);
    let summary = HeuristicSummary::new();

    let mut ampere = helpers::bind_on(&fusion, &[&[512, 256], &[256, 512]], DeviceCapability::sm80());
    let params = matmul::compute_heuristics(&fusion, &mut ampere, &summary).unwrap();
    assert_eq!((params.cta.m, params.cta.n, params.cta.k), (128, 128, 32));
    assert_eq!(params.stages, 3);
    assert!(!params.use_cp_async_bulk);

    let mut hopper = helpers::bind_on(&fusion, &[&[512, 256], &[256, 512]], DeviceCapability::sm90());
    let params = matmul::compute_heuristics(&fusion, &mut hopper, &summary).unwrap();
    assert_eq!(params.stages, 4);
    assert!(params.use_cp_async_bulk);
    // Row-major A is K-innermost; row-major B is N-innermost.
    assert_eq!(params.a_unit, MmaUnitDim::K);
    assert_eq!(params.b_unit, MmaUnitDim::MN);
}

#[test]
fn matmul_schedule_builds_the_pipeline() {
    let (mut fusion, c) = matmul_fusion(DType::Half);
    let mut info = helpers::bind_on(&fusion, &[&[512, 256], &[256, 512]], DeviceCapability::sm80());
    let summary = HeuristicSummary::new();
    let params = matmul::compute_heuristics(&fusion, &mut info, &summary).unwrap();
    matmul::schedule(&mut fusion, &params, &info).unwrap();

    // Operand stages are shared-memory circular buffers of `stages` depth.
    let staged: Vec<_> = fusion
        .tensor_ids()
        .filter(|&tv| fusion.tensor(tv).memory == MemoryType::Shared)
        .collect();
    assert_eq!(staged.len(), 2);
    for tv in staged {
        assert_eq!(fusion.tensor(tv).circular_buffer_depth, Some(3));
    }

    // The matmul expression now carries its operand unit dims.
    let def = fusion.definition(fusion.tensor(c).val).unwrap();
    assert!(matches!(fusion.expr(def).kind, ExprKind::Mma { a_unit: MmaUnitDim::K, .. }));

    // CTA tile grid binding on the output.
    let ptypes: Vec<ParallelType> =
        fusion.tensor(c).domain.loop_.iter().map(|&id| fusion.iter_domain(id).parallel).collect();
    assert!(ptypes.contains(&ParallelType::BIDx));
    assert!(ptypes.contains(&ParallelType::BIDy));
    assert!(ptypes.contains(&ParallelType::TIDy));
}

#[test]
fn matmul_requires_ampere_or_newer() {
    let (fusion, _) = matmul_fusion(DType::Half);
    let summary = HeuristicSummary::new();
    let mut turing = helpers::bind_on(&fusion, &[&[128, 64], &[64, 128]], DeviceCapability::sm75());
    assert!(!SchedulerKind::Matmul.can_schedule_run_time(&fusion, &mut turing, &summary));
    // Nothing else may take a matmul, so dispatch reports a rejection.
    assert!(choose_heuristic(&fusion, &mut turing, &summary).is_err());
}

#[test]
fn integer_matmul_is_rejected_at_compile_time() {
    let (fusion, _) = matmul_fusion(DType::Int32);
    let summary = HeuristicSummary::new();
    assert!(!SchedulerKind::Matmul.can_schedule_compile_time(&fusion, &summary));
}
