//! Pointwise scheduler.
//!
//! Produces one fused elementwise kernel over the union of the output
//! shapes. The logical dims of a reference output are split at a break
//! point: everything left of the break becomes the BIDy side, everything
//! right the vectorized BIDx side.

use tracing::debug;

use kiln_ir::{Fusion, IterDomainId, LoadStoreOpType, ParallelType, TensorViewId};
use kiln_runtime::RuntimeInfo;
use kiln_runtime::device::Y_GRID_LIMIT;

use crate::compute_at_map::ComputeAtMap;
use crate::error::{Error, Result};
use crate::registry::HeuristicSummary;
use crate::{primitives, propagate, vectorize};

/// One warp of parallelism is the floor for the vectorized side.
const MIN_RIGHT_ELEMS: i64 = 32;
const DEFAULT_BDIMX: i64 = 128;
const TIDY_FACTOR: i64 = 8;
/// Problems smaller than this share a block across the outer dim.
const SMALL_PROBLEM_ELEMS: i64 = 16 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct PointwiseParams {
    /// Logical dims left of the break map to BIDy, the rest to BIDx.
    pub break_point: usize,
    pub vector_width: usize,
    pub bdimx: i64,
    /// Share one block across the outer dim for small problems.
    pub use_tidy: bool,
    /// Serial-split the grid-Y dim when it exceeds the hardware limit.
    pub split_grid_y: bool,
    /// Bind left to BIDx and right to BIDy for L2 reuse.
    pub flip_grid_binding: bool,
    pub unroll: usize,
}

pub fn can_schedule_compile_time(fusion: &Fusion, summary: &HeuristicSummary) -> bool {
    summary.reference(fusion).is_some() && summary.reduction_exprs(fusion).is_empty()
}

pub fn compute_heuristics(
    fusion: &Fusion,
    info: &mut RuntimeInfo,
    summary: &HeuristicSummary,
) -> Result<PointwiseParams> {
    let reference = summary
        .reference(fusion)
        .ok_or_else(|| Error::InvalidSchedule { reason: "pointwise fusion has no outputs".into() })?;
    let map = summary
        .compute_at_map(fusion)
        .ok_or_else(|| Error::InvalidSchedule { reason: "id graph has a self mapping".into() })?;

    let ref_ids = fusion.consumer_visible_logical(reference);
    let extents: Vec<i64> =
        ref_ids.iter().map(|&id| info.extent_of(fusion, id)).collect::<kiln_runtime::Result<_>>()?;

    let io = vectorize::vectorizable_io(fusion, info);
    let vector_width = vectorize::common_vector_width(fusion, info, &io, extents.last().copied());

    let unroll = if vector_width > 1 { 1 } else { 2 };
    let break_point = pick_break_point(fusion, map, &ref_ids, &extents, vector_width, unroll)?;

    let right_elems: i64 = extents[break_point..].iter().product();
    let left_elems: i64 = extents[..break_point].iter().product();
    let total = right_elems * left_elems;

    let bdimx = DEFAULT_BDIMX;
    let use_tidy = break_point > 0 && total <= SMALL_PROBLEM_ELEMS;

    let blocks_y = if use_tidy { left_elems / TIDY_FACTOR } else { left_elems };
    let split_grid_y = blocks_y > Y_GRID_LIMIT as i64;

    // When the whole left side is broadcast in some input and the streamed
    // right side overflows half of L2, flipping BIDx/BIDy lets consecutive
    // blocks share the broadcast operand.
    let right_bytes = right_side_bytes(fusion, map, &ref_ids[break_point..]);
    let flip_grid_binding =
        break_point > 0 && left_side_is_broadcast(fusion, map, &ref_ids[..break_point]) && {
            let streamed = right_elems.unsigned_abs().saturating_mul(right_bytes);
            streamed > info.device.l2_bytes / 2
        };

    let params =
        PointwiseParams { break_point, vector_width, bdimx, use_tidy, split_grid_y, flip_grid_binding, unroll };
    debug!(?params, "pointwise heuristics");
    Ok(params)
}

/// Per-dim byte multiple: how many input/output bytes are concrete
/// (non-broadcast) in a dim mapped to `ref_id`.
fn dim_byte_multiple(fusion: &Fusion, map: &ComputeAtMap, ref_id: IterDomainId) -> u64 {
    let mut bytes = 0u64;
    for tv in fusion.input_tensors().into_iter().chain(fusion.output_tensors()) {
        let concrete = fusion.tensor(tv).domain.logical.iter().any(|&id| {
            !fusion.iter_domain(id).is_broadcast()
                && map.are_mapped(id, ref_id, crate::compute_at_map::MappingMode::Permissive)
        });
        if concrete {
            bytes += fusion.tensor(tv).dtype.bytes() as u64;
        }
    }
    bytes
}

fn right_side_bytes(fusion: &Fusion, map: &ComputeAtMap, right_ids: &[IterDomainId]) -> u64 {
    right_ids.iter().map(|&id| dim_byte_multiple(fusion, map, id)).max().unwrap_or(0)
}

fn left_side_is_broadcast(fusion: &Fusion, map: &ComputeAtMap, left_ids: &[IterDomainId]) -> bool {
    fusion.input_tensors().into_iter().any(|tv| {
        let logical = &fusion.tensor(tv).domain.logical;
        let covers_right = logical.iter().any(|&id| !fusion.iter_domain(id).is_broadcast());
        let broadcast_on_left = left_ids.iter().all(|&ref_id| {
            !logical.iter().any(|&id| {
                !fusion.iter_domain(id).is_broadcast()
                    && map.are_mapped(id, ref_id, crate::compute_at_map::MappingMode::Permissive)
            })
        });
        covers_right && broadcast_on_left
    })
}

/// Bytes of the input/output tensors concrete in at least one of the dims.
fn side_bytes(fusion: &Fusion, map: &ComputeAtMap, side_ids: &[IterDomainId]) -> u64 {
    fusion
        .input_tensors()
        .into_iter()
        .chain(fusion.output_tensors())
        .filter(|&tv| {
            fusion.tensor(tv).domain.logical.iter().any(|&id| {
                !fusion.iter_domain(id).is_broadcast()
                    && side_ids
                        .iter()
                        .any(|&ref_id| map.are_mapped(id, ref_id, crate::compute_at_map::MappingMode::Permissive))
            })
        })
        .map(|tv| fusion.tensor(tv).dtype.bytes() as u64)
        .sum()
}

/// Enumerate break points and keep the one with the minimum estimated byte
/// transfer, subject to a warp of right-side parallelism after unrolling. A
/// still-fused reshape pins the break at zero so the view transforms stay on
/// one side.
fn pick_break_point(
    fusion: &Fusion,
    map: &ComputeAtMap,
    ref_ids: &[IterDomainId],
    extents: &[i64],
    vector_width: usize,
    unroll: usize,
) -> Result<usize> {
    let has_reshape =
        fusion.expr_ids().any(|e| matches!(fusion.expr(e).kind, kiln_ir::ExprKind::Reshape));
    if has_reshape || ref_ids.len() <= 1 {
        return Ok(0);
    }

    let min_right = MIN_RIGHT_ELEMS * (vector_width * unroll) as i64;
    let mut best: Option<(u64, usize)> = None;
    for break_point in 0..ref_ids.len() {
        let right_elems: i64 = extents[break_point..].iter().product();
        if right_elems < min_right {
            continue;
        }
        let left_elems: i64 = extents[..break_point].iter().product();
        let cost = side_bytes(fusion, map, &ref_ids[..break_point]) * left_elems.unsigned_abs()
            + side_bytes(fusion, map, &ref_ids[break_point..]) * right_elems.unsigned_abs();
        let better = match best {
            Some((best_cost, _)) => cost < best_cost,
            None => true,
        };
        if better {
            best = Some((cost, break_point));
        }
    }
    Ok(best.map(|(_, bp)| bp).unwrap_or(0))
}

/// Loop positions of the unswitch axis in the scheduled reference nest; the
/// input/output caches inline here so they keep memory-level parallelism.
fn unswitch_depth(break_point: usize) -> usize {
    if break_point > 0 { 3 } else { 2 }
}

pub fn schedule(fusion: &mut Fusion, params: &PointwiseParams, info: &RuntimeInfo) -> Result<()> {
    let summary = HeuristicSummary::new();
    let reference = summary
        .reference(fusion)
        .ok_or_else(|| Error::InvalidSchedule { reason: "pointwise fusion has no outputs".into() })?;

    // Stage the IO through register caches so global accesses vectorize.
    let mut caches: Vec<TensorViewId> = Vec::new();
    for input in fusion.input_tensors() {
        if !fusion.consumers_of(input).is_empty() {
            caches.push(primitives::cache_after(fusion, input, LoadStoreOpType::Set, &info.device)?);
        }
    }
    for output in fusion.output_tensors() {
        if fusion.definition(fusion.tensor(output).val).is_some() {
            caches.push(primitives::cache_before(fusion, output, LoadStoreOpType::Set, &info.device)?);
        }
    }

    let map = ComputeAtMap::build_permitting_self_mapping(fusion);
    let left_ref_ids: Vec<IterDomainId> =
        fusion.consumer_visible_logical(reference)[..params.break_point].to_vec();

    // Shape the reference, then replay on every tensor in spanning order.
    shape_tensor(fusion, &map, reference, &left_ref_ids, params, true)?;
    for tv in propagate::spanning_order(fusion, &map, reference) {
        if fusion.is_input(tv) {
            continue;
        }
        let vectorizes = fusion.is_output(tv) || caches.contains(&tv);
        shape_tensor(fusion, &map, tv, &left_ref_ids, params, vectorizes)?;
    }

    // Caches inline at the unswitch depth; everything else goes as deep as
    // its consumer allows.
    primitives::inline_most(fusion, &caches);
    let depth = unswitch_depth(params.break_point);
    for cache in caches {
        primitives::inline_at(fusion, cache, depth);
    }
    Ok(())
}

/// Apply the pointwise recipe to one tensor: partition its axes by the
/// reference break, collapse each side, split the inner side for
/// vectorization, and bind the grid and block dims.
fn shape_tensor(
    fusion: &mut Fusion,
    map: &ComputeAtMap,
    tv: TensorViewId,
    left_ref_ids: &[IterDomainId],
    params: &PointwiseParams,
    vectorizes: bool,
) -> Result<()> {
    let rank = fusion.tensor(tv).domain.loop_.len();
    if rank == 0 {
        return Ok(());
    }

    let left_positions = propagate::positions_mapped_to(fusion, map, tv, left_ref_ids);
    let left_count = left_positions.len();

    // Pull the left dims to the front, preserving relative order.
    let mapping: Vec<(usize, usize)> = left_positions.iter().enumerate().map(|(new, &old)| (old, new)).collect();
    primitives::reorder(fusion, tv, &mapping)?;

    // Collapse each side to one axis.
    let right_count = rank - left_count;
    for _ in 1..right_count {
        primitives::merge(fusion, tv, left_count, left_count + 1)?;
    }
    for _ in 1..left_count {
        primitives::merge(fusion, tv, 0, 1)?;
    }
    let has_left = left_count > 0;
    let inner = usize::from(has_left);
    if right_count == 0 {
        // Nothing on the vectorized side; bind the collapsed axis outer-only.
        let outer_type = if params.flip_grid_binding { ParallelType::BIDx } else { ParallelType::BIDy };
        return primitives::parallelize(fusion, tv, 0, outer_type);
    }

    // Inner side: [I] -> [BIDx, Unswitch, TIDx, Vectorize].
    primitives::split(fusion, tv, inner, params.vector_width.max(1) as i64, true)?;
    primitives::split(fusion, tv, inner, params.bdimx, true)?;
    primitives::split(fusion, tv, inner, 1, true)?;

    let (grid_inner, grid_outer) = if params.flip_grid_binding {
        (ParallelType::BIDy, ParallelType::BIDx)
    } else {
        (ParallelType::BIDx, ParallelType::BIDy)
    };

    primitives::parallelize(fusion, tv, inner, grid_inner)?;
    primitives::parallelize(fusion, tv, inner + 1, ParallelType::Unswitch)?;
    primitives::parallelize(fusion, tv, inner + 2, ParallelType::TIDx)?;
    if vectorizes && params.vector_width > 1 {
        primitives::parallelize(fusion, tv, inner + 3, ParallelType::Vectorize)?;
    }

    if has_left {
        if params.use_tidy {
            primitives::split(fusion, tv, 0, TIDY_FACTOR, true)?;
            primitives::parallelize(fusion, tv, 1, ParallelType::TIDy)?;
            primitives::parallelize(fusion, tv, 0, grid_outer)?;
        } else if params.split_grid_y {
            primitives::split(fusion, tv, 0, Y_GRID_LIMIT as i64, true)?;
            primitives::parallelize(fusion, tv, 1, grid_outer)?;
        } else {
            primitives::parallelize(fusion, tv, 0, grid_outer)?;
        }
    }
    Ok(())
}
