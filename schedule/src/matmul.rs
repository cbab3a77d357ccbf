//! Matmul scheduler.
//!
//! Tiles the output across CTAs and warps, stages the operands through
//! shared memory with an asynchronous multi-stage pipeline, and accumulates
//! in a register tile. Ampere pipelines via circular-buffered `cp.async`,
//! Hopper via `cp.async.bulk` driven by mbarriers.

use tracing::debug;

use kiln_dtype::DType;
use kiln_ir::{ExprId, ExprKind, Fusion, LoadStoreOpType, MemoryType, MmaUnitDim, ParallelType, TensorViewId};
use kiln_runtime::RuntimeInfo;

use crate::error::{Error, Result};
use crate::primitives;
use crate::registry::HeuristicSummary;

/// CTA/warp/instruction tiles per SM generation, (m, n, k).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileShape {
    pub m: i64,
    pub n: i64,
    pub k: i64,
}

const SM80_CTA: TileShape = TileShape { m: 128, n: 128, k: 32 };
const SM80_WARP: TileShape = TileShape { m: 64, n: 64, k: 32 };
const SM80_INSTR: TileShape = TileShape { m: 16, n: 8, k: 16 };
const SM90_CTA: TileShape = TileShape { m: 128, n: 256, k: 64 };
const SM90_WARP: TileShape = TileShape { m: 64, n: 128, k: 64 };
const SM90_INSTR: TileShape = TileShape { m: 64, n: 8, k: 16 };

#[derive(Debug, Clone, PartialEq)]
pub struct MatmulParams {
    pub cta: TileShape,
    pub warp: TileShape,
    pub instr: TileShape,
    /// Software pipeline depth of the operand loads.
    pub stages: usize,
    /// Hopper bulk-tensor copies instead of per-thread cp.async.
    pub use_cp_async_bulk: bool,
    /// Operand unit dims, inferred from allocation contiguity.
    pub a_unit: MmaUnitDim,
    pub b_unit: MmaUnitDim,
}

fn matmul_expr(fusion: &Fusion) -> Option<ExprId> {
    fusion.expr_ids().find(|&e| fusion.expr(e).is_matmul_family())
}

fn operands(fusion: &Fusion, expr: ExprId) -> Option<(TensorViewId, TensorViewId, TensorViewId)> {
    let e = fusion.expr(expr);
    let a = fusion.val(*e.inputs.first()?).as_tensor()?;
    let b = fusion.val(*e.inputs.get(1)?).as_tensor()?;
    let out = e.outputs.iter().find_map(|&v| fusion.val(v).as_tensor())?;
    Some((a, b, out))
}

pub fn can_schedule_compile_time(fusion: &Fusion, _summary: &HeuristicSummary) -> bool {
    let Some(expr) = matmul_expr(fusion) else { return false };
    let Some((a, b, _)) = operands(fusion, expr) else { return false };
    let supported_dtype = |tv: TensorViewId| {
        matches!(fusion.tensor(tv).dtype, DType::Half | DType::BFloat16 | DType::Float)
    };
    // One matmul per kernel; epilogue pointwise ops are fine.
    let single = fusion.expr_ids().filter(|&e| fusion.expr(e).is_matmul_family()).count() == 1;
    single && supported_dtype(a) && supported_dtype(b) && fusion.tensor(a).rank() == 2 && fusion.tensor(b).rank() == 2
}

pub fn can_schedule_run_time(fusion: &Fusion, info: &mut RuntimeInfo, _summary: &HeuristicSummary) -> bool {
    if info.device.sm_major < 8 {
        return false;
    }
    let Some(expr) = matmul_expr(fusion) else { return false };
    let Some((a, b, _)) = operands(fusion, expr) else { return false };
    // bf16 operands additionally need SM 8.0+, which the gate above covers.
    let _ = (a, b);
    true
}

/// The unit dim of an operand is whichever of its dims is innermost in
/// memory: a K-innermost operand feeds the MMA along K.
fn unit_dim(fusion: &Fusion, info: &RuntimeInfo, tv: TensorViewId, k_is_last: bool) -> MmaUnitDim {
    let contiguous_last = info
        .contiguity_of(tv)
        .and_then(|c| c.last().copied())
        .or_else(|| fusion.tensor(tv).domain.contiguity.last().copied().flatten())
        .unwrap_or(true);
    match (contiguous_last, k_is_last) {
        (true, true) | (false, false) => MmaUnitDim::K,
        _ => MmaUnitDim::MN,
    }
}

pub fn compute_heuristics(
    fusion: &Fusion,
    info: &mut RuntimeInfo,
    _summary: &HeuristicSummary,
) -> Result<MatmulParams> {
    let expr = matmul_expr(fusion)
        .ok_or_else(|| Error::InvalidSchedule { reason: "no matmul in fusion".into() })?;
    let (a, b, _) = operands(fusion, expr)
        .ok_or_else(|| Error::InvalidSchedule { reason: "matmul operands are not tensors".into() })?;

    let hopper = info.device.supports_cp_async_bulk();
    let (cta, warp, instr) = if hopper { (SM90_CTA, SM90_WARP, SM90_INSTR) } else { (SM80_CTA, SM80_WARP, SM80_INSTR) };

    let params = MatmulParams {
        cta,
        warp,
        instr,
        stages: if hopper { 4 } else { 3 },
        use_cp_async_bulk: hopper,
        // A is [M, K] (K last), B is [K, N] (K first).
        a_unit: unit_dim(fusion, info, a, true),
        b_unit: unit_dim(fusion, info, b, false),
    };
    debug!(?params, "matmul heuristics");
    Ok(params)
}

pub fn schedule(fusion: &mut Fusion, params: &MatmulParams, info: &RuntimeInfo) -> Result<()> {
    let expr = matmul_expr(fusion)
        .ok_or_else(|| Error::InvalidSchedule { reason: "no matmul in fusion".into() })?;
    let (a, b, out) = operands(fusion, expr)
        .ok_or_else(|| Error::InvalidSchedule { reason: "matmul operands are not tensors".into() })?;

    // Operand staging: global -> shared via the async path, pipelined.
    let copy_op =
        if params.use_cp_async_bulk { LoadStoreOpType::CpAsyncBulkTensorTile } else { LoadStoreOpType::CpAsync };
    let a_shared = primitives::cache_after(fusion, a, copy_op, &info.device)?;
    let b_shared = primitives::cache_after(fusion, b, copy_op, &info.device)?;
    primitives::circular_buffer(fusion, a_shared, params.stages)?;
    primitives::circular_buffer(fusion, b_shared, params.stages)?;

    // Accumulator lives in registers until the epilogue writes it out.
    let accumulator = primitives::cache_before(fusion, out, LoadStoreOpType::Set, &info.device)?;
    primitives::set_memory_type(fusion, accumulator, MemoryType::Local);

    // CTA tiling of the output: [M, N, K] ->
    // [Mo(BIDx), No(BIDy), Ko, Mw(TIDy), Nw(TIDz), Mi, Ni, Ki].
    primitives::split(fusion, out, 0, params.cta.m, true)?;
    primitives::split(fusion, out, 2, params.cta.n, true)?;
    primitives::split(fusion, out, 4, params.cta.k, true)?;
    // [Mo, Mi, No, Ni, Ko, Ki] -> [Mo, No, Ko, Mi, Ni, Ki]
    primitives::reorder(fusion, out, &[(1, 3), (2, 1), (3, 4), (4, 2)])?;
    primitives::parallelize(fusion, out, 0, ParallelType::BIDx)?;
    primitives::parallelize(fusion, out, 1, ParallelType::BIDy)?;

    // Warp tiling inside the CTA tile.
    primitives::split(fusion, out, 3, params.warp.m, true)?;
    primitives::parallelize(fusion, out, 3, ParallelType::TIDy)?;
    primitives::split(fusion, out, 5, params.warp.n, true)?;
    primitives::parallelize(fusion, out, 5, ParallelType::TIDz)?;

    // Record the operand unit dims on the lowered MMA form.
    if let ExprKind::Matmul | ExprKind::Linear = fusion.expr(expr).kind {
        fusion.expr_mut(expr).kind = ExprKind::Mma { a_unit: params.a_unit, b_unit: params.b_unit };
    }

    primitives::inline_most(fusion, &[a_shared, b_shared, accumulator]);
    // Shared stages and the accumulator persist across the K loop.
    primitives::inline_at(fusion, a_shared, 3);
    primitives::inline_at(fusion, b_shared, 3);
    primitives::inline_at(fusion, accumulator, 2);
    Ok(())
}
