use kiln_dtype::DType;
use kiln_ir::{BinaryOp, Fusion, MemoryType, ParallelType, ReductionOpType};
use kiln_runtime::DeviceCapability;
use kiln_runtime::device::Y_GRID_LIMIT;

use crate::persistent::{self, PersistentKind};
use crate::reduction;
use crate::registry::HeuristicSummary;
use crate::test::helpers;

#[test]
fn small_reduction_stays_in_one_block() {
    let (fusion, _, _) = helpers::sum_fusion(1);
    let mut info = helpers::bind(&fusion, &[&[64, 512]]);
    let summary = HeuristicSummary::new();
    let params = reduction::compute_heuristics(&fusion, &mut info, &summary).unwrap();
    assert!(!params.cross_grid);
    assert!(!params.split_grid_dim_inner_reduction);
    assert!(!params.split_grid_dim_iter_dom_outer);
}

/// Cross-grid inner reduction over a [y_grid_limit + 8, 65538] input: both
/// grid dims overflow their limits and must be serial-split.
#[test]
fn cross_grid_reduction_with_large_iteration_domain() {
    let (mut fusion, _, t1) = helpers::sum_fusion(1);
    let rows = Y_GRID_LIMIT as i64 + 8;
    let mut info = helpers::bind(&fusion, &[&[rows, 65_538]]);
    let summary = HeuristicSummary::new();
    let params = reduction::compute_heuristics(&fusion, &mut info, &summary).unwrap();
    assert!(params.cross_grid);
    assert!(params.split_grid_dim_inner_reduction);
    assert!(params.split_grid_dim_iter_dom_outer);

    reduction::schedule(&mut fusion, &params, &info).unwrap();

    // The final reduction nest carries both grid bindings.
    let ptypes: Vec<ParallelType> = fusion
        .tensor(t1)
        .domain
        .loop_
        .iter()
        .map(|&id| fusion.iter_domain(id).parallel)
        .collect();
    assert!(ptypes.contains(&ParallelType::BIDy), "iteration side is grid-bound: {ptypes:?}");
    assert!(ptypes.contains(&ParallelType::BIDx), "reduction side is grid-bound: {ptypes:?}");
    assert!(ptypes.contains(&ParallelType::TIDx));
}

#[test]
fn rfactor_runs_for_block_reductions() {
    let (mut fusion, _, t1) = helpers::sum_fusion(1);
    let mut info = helpers::bind(&fusion, &[&[64, 2048]]);
    let summary = HeuristicSummary::new();
    let params = reduction::compute_heuristics(&fusion, &mut info, &summary).unwrap();
    reduction::schedule(&mut fusion, &params, &info).unwrap();

    // The reduction output now consumes a partial-reduction producer.
    let producers = fusion.producers_of(t1);
    assert_eq!(producers.len(), 1);
    assert!(fusion.tensor(producers[0]).domain.loop_.iter().any(|&id| fusion.iter_domain(id).is_rfactor));
}

#[test]
fn normalization_is_inner_persistent() {
    let (fusion, _) = helpers::normalization_fusion();
    let summary = HeuristicSummary::new();
    assert!(persistent::can_schedule_compile_time(&fusion, &summary, PersistentKind::Inner));
    assert!(!persistent::can_schedule_compile_time(&fusion, &summary, PersistentKind::Outer));
}

#[test]
fn outer_reduction_normalization_is_outer_persistent() {
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 2);
    let t1 = fusion.reduction(ReductionOpType::Add, t0, &[0]).unwrap();
    let t2 = fusion.broadcast(t1, &[true, false]).unwrap();
    let t3 = fusion.binary(BinaryOp::Sub, t0, t2).unwrap();
    fusion.add_output(fusion.tensor(t3).val);

    let summary = HeuristicSummary::new();
    assert!(persistent::can_schedule_compile_time(&fusion, &summary, PersistentKind::Outer));
    assert!(!persistent::can_schedule_compile_time(&fusion, &summary, PersistentKind::Inner));
}

/// An 80K-float hidden size exceeds the 255 KiB register budget, so at
/// least one persistent buffer moves to shared memory, and the total must
/// respect the device opt-in limit.
#[test]
fn oversized_persistent_buffer_spills_to_shared() {
    let (fusion, _) = helpers::normalization_fusion();

    // 80K floats = 320 KiB > 255 KiB register budget.
    let roomy = DeviceCapability { max_shared_bytes_optin: 512 * 1024, ..DeviceCapability::sm90() };
    let mut info = helpers::bind_on(&fusion, &[&[8, 80_000]], roomy);
    let summary = HeuristicSummary::new();
    let params =
        persistent::compute_heuristics(&fusion, &mut info, &summary, PersistentKind::Inner).unwrap();
    assert!(params.persistent_bytes > 255 * 1024);
    assert!(params.buffers.iter().any(|b| b.in_shared), "register pressure must spill to shared");

    let (mut fusion2, _) = helpers::normalization_fusion();
    let roomy2 = DeviceCapability { max_shared_bytes_optin: 512 * 1024, ..DeviceCapability::sm90() };
    let mut info2 = helpers::bind_on(&fusion2, &[&[8, 80_000]], roomy2);
    let summary2 = HeuristicSummary::new();
    let params2 =
        persistent::compute_heuristics(&fusion2, &mut info2, &summary2, PersistentKind::Inner).unwrap();
    persistent::schedule(&mut fusion2, &params2, &info2).unwrap();
    // The input cache, which is the persistent buffer, landed in shared.
    assert!(fusion2.tensor_ids().any(|tv| fusion2.tensor(tv).memory == MemoryType::Shared));
}

#[test]
fn persistent_buffer_overflow_is_rejected() {
    let (fusion, _) = helpers::normalization_fusion();
    // sm80 opt-in shared (163 KiB) cannot absorb the 320 KiB spill.
    let mut info = helpers::bind(&fusion, &[&[8, 80_000]]);
    let summary = HeuristicSummary::new();
    assert!(!persistent::can_schedule_run_time(&fusion, &mut info, &summary, PersistentKind::Inner));
    assert!(matches!(
        persistent::compute_heuristics(&fusion, &mut info, &summary, PersistentKind::Inner),
        Err(crate::Error::ResourceOverflow { .. })
    ));
}

#[test]
fn welford_vectorizes_on_contiguous_inputs() {
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 2);
    let (avg, _, _) = fusion.welford(t0, &[1]).unwrap();
    fusion.add_output(fusion.tensor(avg).val);

    let mut info = helpers::bind(&fusion, &[&[64, 1024]]);
    let summary = HeuristicSummary::new();
    let params = reduction::compute_heuristics(&fusion, &mut info, &summary).unwrap();
    assert!(params.vectorized_welford);
}
