//! Transpose scheduler.
//!
//! When a permute flips the innermost dim, the dominant read is
//! non-coalesced. This scheduler tiles the two swapped dims through shared
//! memory with a bank-conflict-avoiding swizzle, so both the load and the
//! store stay coalesced.

use tracing::debug;

use kiln_ir::{ExprId, ExprKind, Fusion, LoadStoreOpType, MemoryType, ParallelType, Swizzle2DType, SwizzleMode, TensorViewId};
use kiln_runtime::RuntimeInfo;

use crate::error::{Error, Result};
use crate::registry::HeuristicSummary;
use crate::primitives;

const TILE: i64 = 32;

#[derive(Debug, Clone, PartialEq)]
pub struct TransposeParams {
    pub tile: i64,
    /// Swizzle the shared tile instead of padding it.
    pub use_swizzle: bool,
}

/// The permute expression that moves the innermost dim, if any.
fn innermost_swapping_permute(fusion: &Fusion) -> Option<ExprId> {
    fusion.expr_ids().find(|&e| match &fusion.expr(e).kind {
        ExprKind::Permute { perm } => !perm.is_empty() && perm.last() != Some(&(perm.len() - 1)),
        _ => false,
    })
}

pub fn can_schedule_compile_time(fusion: &Fusion, summary: &HeuristicSummary) -> bool {
    summary.reduction_exprs(fusion).is_empty() && innermost_swapping_permute(fusion).is_some()
}

pub fn can_schedule_run_time(fusion: &Fusion, info: &mut RuntimeInfo, _summary: &HeuristicSummary) -> bool {
    // Both tiled extents must cover a full tile, otherwise the pointwise
    // fallback wins.
    let Some(expr) = innermost_swapping_permute(fusion) else { return false };
    let Some(out_tv) = fusion.expr(expr).outputs.iter().find_map(|&v| fusion.val(v).as_tensor()) else {
        return false;
    };
    let logical = fusion.tensor(out_tv).domain.logical.clone();
    if logical.len() < 2 {
        return false;
    }
    logical[logical.len() - 2..]
        .iter()
        .all(|&id| info.extent_of(fusion, id).map(|extent| extent >= TILE).unwrap_or(false))
}

pub fn compute_heuristics(
    fusion: &Fusion,
    _info: &mut RuntimeInfo,
    _summary: &HeuristicSummary,
) -> Result<TransposeParams> {
    innermost_swapping_permute(fusion)
        .ok_or_else(|| Error::InvalidSchedule { reason: "no transpose pattern in fusion".into() })?;
    let params = TransposeParams { tile: TILE, use_swizzle: true };
    debug!(?params, "transpose heuristics");
    Ok(params)
}

pub fn schedule(fusion: &mut Fusion, params: &TransposeParams, info: &RuntimeInfo) -> Result<()> {
    let expr = innermost_swapping_permute(fusion)
        .ok_or_else(|| Error::InvalidSchedule { reason: "no transpose pattern in fusion".into() })?;
    let in_val = fusion.expr(expr).inputs[0];
    let in_tv = fusion.val(in_val).as_tensor().ok_or(Error::Ir { source: kiln_ir::Error::ExpectedTensor })?;
    let out_tv = fusion
        .expr(expr)
        .outputs
        .iter()
        .find_map(|&v| fusion.val(v).as_tensor())
        .ok_or(Error::Ir { source: kiln_ir::Error::ExpectedTensor })?;

    // Stage the input tile through shared memory.
    let staged = primitives::cache_after(fusion, in_tv, LoadStoreOpType::Set, &info.device)?;
    primitives::set_memory_type(fusion, staged, MemoryType::Shared);

    // Tile the output's two innermost dims; the shared stage inherits the
    // same tiling on the swapped axes.
    for tv in [out_tv, staged] {
        let rank = fusion.tensor(tv).domain.loop_.len();
        if rank < 2 {
            continue;
        }
        let (row, col) = (rank - 2, rank - 1);
        primitives::split(fusion, tv, col, params.tile, true)?;
        primitives::split(fusion, tv, row, params.tile, true)?;
        // [.., Ro, Ri, Co, Ci] -> [.., Ro, Co, Ri, Ci]
        primitives::reorder(fusion, tv, &[(row + 1, row + 2), (row + 2, row + 1)])?;
        let (ro, co, ri, ci) = (row, row + 1, row + 2, row + 3);
        primitives::merge(fusion, tv, ro, co)?;
        // [.., Tile(BIDx), Ri(TIDy), Ci(TIDx)]
        primitives::parallelize(fusion, tv, ro, ParallelType::BIDx)?;
        primitives::parallelize(fusion, tv, ri - 1, ParallelType::TIDy)?;
        primitives::parallelize(fusion, tv, ci - 1, ParallelType::TIDx)?;
        if params.use_swizzle && tv == staged {
            primitives::swizzle2d(fusion, tv, ri - 1, ci - 1, Swizzle2DType::Xor, SwizzleMode::Data)?;
        }
    }

    primitives::inline_most(fusion, &[staged]);
    primitives::inline_at(fusion, staged, 1);
    Ok(())
}
