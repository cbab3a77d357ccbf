//! Inner-reduction scheduler.
//!
//! Parallelizes the reduction axis across TIDx (and BIDx for cross-grid
//! reductions), the iteration axis across the remaining grid dims, and
//! rFactors the serial part of the reduction into a partial-reduce producer.

use tracing::debug;

use kiln_ir::{ExprId, ExprKind, Fusion, IterDomainId, LoadStoreOpType, ParallelType, TensorViewId};
use kiln_runtime::RuntimeInfo;
use kiln_runtime::device::Y_GRID_LIMIT;

use crate::compute_at_map::ComputeAtMap;
use crate::error::{Error, Result};
use crate::registry::HeuristicSummary;
use crate::{primitives, propagate, vectorize};

const DEFAULT_TIDX: i64 = 256;
/// Reductions longer than this overflow one block and go cross-grid.
const CROSS_GRID_THRESHOLD: i64 = 32 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct ReductionParams {
    /// Span the reduction across blocks, with a grid sync.
    pub cross_grid: bool,
    /// Serial-split the reduction grid dim to stay under the grid limit.
    pub split_grid_dim_inner_reduction: bool,
    /// Serial-split the iteration grid dim to stay under the grid limit.
    pub split_grid_dim_iter_dom_outer: bool,
    pub tidx: i64,
    pub unroll: usize,
    pub vector_width: usize,
    /// Welford over a contiguous aligned axis lowers to the vectorized
    /// variant.
    pub vectorized_welford: bool,
}

/// First reduction expression and its tensor output.
pub fn first_reduction(fusion: &Fusion, summary: &HeuristicSummary) -> Option<(ExprId, TensorViewId)> {
    let &expr = summary.reduction_exprs(fusion).first()?;
    let tv = fusion.expr(expr).outputs.iter().find_map(|&v| fusion.val(v).as_tensor())?;
    Some((expr, tv))
}

pub fn can_schedule_compile_time(fusion: &Fusion, summary: &HeuristicSummary) -> bool {
    first_reduction(fusion, summary).is_some()
}

pub fn can_schedule_run_time(_fusion: &Fusion, _info: &mut RuntimeInfo, _summary: &HeuristicSummary) -> bool {
    true
}

fn reduction_split(fusion: &Fusion, tv: TensorViewId) -> (Vec<IterDomainId>, Vec<IterDomainId>) {
    let logical = &fusion.tensor(tv).domain.logical;
    let (red, iter): (Vec<_>, Vec<_>) =
        logical.iter().copied().partition(|&id| fusion.iter_domain(id).is_reduction());
    (iter, red)
}

pub fn compute_heuristics(
    fusion: &Fusion,
    info: &mut RuntimeInfo,
    summary: &HeuristicSummary,
) -> Result<ReductionParams> {
    let (expr, tv) = first_reduction(fusion, summary)
        .ok_or_else(|| Error::InvalidSchedule { reason: "no reduction in fusion".into() })?;
    let (iter_ids, red_ids) = reduction_split(fusion, tv);

    let mut red_elems = 1i64;
    for &id in &red_ids {
        red_elems *= info.extent_of(fusion, id)?;
    }
    let mut iter_elems = 1i64;
    for &id in &iter_ids {
        iter_elems *= info.extent_of(fusion, id)?;
    }

    let cross_grid = red_elems > CROSS_GRID_THRESHOLD;
    let split_grid_dim_inner_reduction = cross_grid && red_elems > Y_GRID_LIMIT as i64;
    let split_grid_dim_iter_dom_outer = iter_elems > Y_GRID_LIMIT as i64;

    let io = vectorize::vectorizable_io(fusion, info);
    let vector_width = vectorize::common_vector_width(fusion, info, &io, Some(red_elems));

    let is_welford = matches!(fusion.expr(expr).kind, ExprKind::Welford { .. });
    let vectorized_welford = is_welford && vector_width > 1;

    let params = ReductionParams {
        cross_grid,
        split_grid_dim_inner_reduction,
        split_grid_dim_iter_dom_outer,
        tidx: DEFAULT_TIDX,
        unroll: 2,
        vector_width,
        vectorized_welford,
    };
    debug!(?params, red_elems, iter_elems, "reduction heuristics");
    Ok(params)
}

pub fn schedule(fusion: &mut Fusion, params: &ReductionParams, info: &RuntimeInfo) -> Result<()> {
    let summary = HeuristicSummary::new();
    let (expr, reduction_tv) = first_reduction(fusion, &summary)
        .ok_or_else(|| Error::InvalidSchedule { reason: "no reduction in fusion".into() })?;
    let is_welford = matches!(fusion.expr(expr).kind, ExprKind::Welford { .. });

    // Stage the IO through register caches.
    let mut caches = Vec::new();
    for input in fusion.input_tensors() {
        if !fusion.consumers_of(input).is_empty() {
            caches.push(primitives::cache_after(fusion, input, LoadStoreOpType::Set, &info.device)?);
        }
    }

    let map = ComputeAtMap::build_permitting_self_mapping(fusion);
    let (iter_ref, red_ref) = reduction_split(fusion, reduction_tv);

    let vectorize_reduction = is_welford && params.vectorized_welford;
    shape_tensor(fusion, &map, reduction_tv, &iter_ref, &red_ref, params, vectorize_reduction)?;
    for tv in propagate::spanning_order(fusion, &map, reduction_tv) {
        if fusion.is_input(tv) {
            continue;
        }
        shape_tensor(fusion, &map, tv, &iter_ref, &red_ref, params, vectorize_reduction)?;
    }

    // rFactor the serial/unrolled part of the reduction so the parallel part
    // finishes it. Welford finishes in one pass instead.
    if !is_welford {
        let serial_axes: Vec<usize> = fusion
            .tensor(reduction_tv)
            .domain
            .loop_
            .iter()
            .enumerate()
            .filter(|(_, &id)| {
                let domain = fusion.iter_domain(id);
                domain.is_reduction()
                    && matches!(domain.parallel, ParallelType::Serial | ParallelType::Unroll)
            })
            .map(|(pos, _)| pos)
            .collect();
        if !serial_axes.is_empty() && serial_axes.len() < fusion.tensor(reduction_tv).domain.loop_.len() {
            primitives::rfactor(fusion, reduction_tv, &serial_axes)?;
        }
    }

    primitives::inline_most(fusion, &caches);
    Ok(())
}

/// Shape one tensor of a reduction fusion: iteration dims first, reduction
/// dims collapsed and split across the block (and grid for cross-grid runs).
fn shape_tensor(
    fusion: &mut Fusion,
    map: &ComputeAtMap,
    tv: TensorViewId,
    iter_ref: &[IterDomainId],
    red_ref: &[IterDomainId],
    params: &ReductionParams,
    vectorize_reduction: bool,
) -> Result<()> {
    let rank = fusion.tensor(tv).domain.loop_.len();
    if rank == 0 {
        return Ok(());
    }

    let iter_positions = propagate::positions_mapped_to(fusion, map, tv, iter_ref);
    let red_positions = propagate::positions_mapped_to(fusion, map, tv, red_ref);
    let iter_count = iter_positions.len();
    let red_count = red_positions.len();

    // Iteration dims to the front, reduction dims behind them, anything
    // unmapped (rare) trails and stays serial.
    let mapping: Vec<(usize, usize)> = iter_positions
        .iter()
        .chain(red_positions.iter())
        .enumerate()
        .map(|(new, &old)| (old, new))
        .collect();
    primitives::reorder(fusion, tv, &mapping)?;

    for _ in 1..red_count {
        primitives::merge(fusion, tv, iter_count, iter_count + 1)?;
    }
    for _ in 1..iter_count {
        primitives::merge(fusion, tv, 0, 1)?;
    }
    let has_iter = iter_count > 0;
    let red_axis = usize::from(has_iter);

    if red_count > 0 {
        // [R] -> [Rgrid?, Rserial, TIDx, Unroll-or-Vectorize]
        let inner_factor =
            if vectorize_reduction { params.vector_width.max(1) as i64 } else { params.unroll.max(1) as i64 };
        primitives::split(fusion, tv, red_axis, inner_factor, true)?;
        primitives::split(fusion, tv, red_axis, params.tidx, true)?;
        let mut tidx_pos = red_axis + 1;
        let mut unroll_pos = red_axis + 2;
        if params.cross_grid {
            if params.split_grid_dim_inner_reduction {
                // [Rserial, BIDx, TIDx, Unroll]
                primitives::split(fusion, tv, red_axis, Y_GRID_LIMIT as i64, true)?;
                primitives::parallelize(fusion, tv, red_axis + 1, ParallelType::BIDx)?;
                tidx_pos += 1;
                unroll_pos += 1;
            } else {
                primitives::parallelize(fusion, tv, red_axis, ParallelType::BIDx)?;
            }
        }
        primitives::parallelize(fusion, tv, tidx_pos, ParallelType::TIDx)?;
        let inner_type = if vectorize_reduction { ParallelType::Vectorize } else { ParallelType::Unroll };
        primitives::parallelize(fusion, tv, unroll_pos, inner_type)?;
    }

    if has_iter {
        if params.split_grid_dim_iter_dom_outer {
            primitives::split(fusion, tv, 0, Y_GRID_LIMIT as i64, true)?;
            primitives::parallelize(fusion, tv, 1, ParallelType::BIDy)?;
        } else {
            primitives::parallelize(fusion, tv, 0, ParallelType::BIDy)?;
        }
    }
    Ok(())
}
