//! Scheduling primitives.
//!
//! Loop-nest surgery on one tensor view: split, merge, reorder, swizzle,
//! rFactor, cache insertion, inlining, and parallelization. All of it
//! rewrites the loop domain only; root/logical/allocation stay untouched,
//! connected through the transform DAG.

use smallvec::smallvec;
use tracing::trace;

use kiln_dtype::DType;
use kiln_ir::{
    Fusion, IdExpr, IdExprKind, IterDomainId, IterType, LoadStoreOpType, MemoryType, ParallelType, Swizzle2DType,
    SwizzleMode, TensorDomain, TensorViewId,
};
use kiln_runtime::DeviceCapability;

use crate::error::{Error, Result};

/// How `compute_at` resolves an infeasible position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeAtMode {
    /// Fail if the requested depth is not iteration-compatible.
    Standard,
    /// Clamp to the deepest compatible position.
    BestEffort,
    /// Ignore the requested depth, inline as deep as possible.
    MostInlined,
}

fn check_axis(fusion: &Fusion, tv: TensorViewId, axis: usize) -> Result<IterDomainId> {
    let loop_ = &fusion.tensor(tv).domain.loop_;
    loop_.get(axis).copied().ok_or(Error::AxisOutOfBounds { axis, rank: loop_.len() })
}

/// Split `axis` by `factor`. With `inner_split` the factor becomes the inner
/// extent (the common case); otherwise it becomes the outer extent.
///
/// A factor of one is a no-op in iteration but still mints fresh axes. A
/// factor that does not (or may not) divide the extent is recorded on the
/// fusion for the predicate pass.
pub fn split(fusion: &mut Fusion, tv: TensorViewId, axis: usize, factor: i64, inner_split: bool) -> Result<()> {
    if factor <= 0 {
        return Err(Error::InvalidSchedule { reason: format!("split factor must be positive, got {factor}") });
    }
    let src_id = check_axis(fusion, tv, axis)?;
    let src = fusion.iter_domain(src_id).clone();

    let static_extent = fusion.constant_of(src.extent).and_then(|v| v.as_int());
    let divisible = static_extent.map(|extent| extent % factor == 0);

    let factor_val = fusion.new_literal(DType::Index, factor);
    // A statically known extent folds the quotient, so nested splits keep
    // deciding divisibility at schedule time.
    let quotient = match static_extent {
        Some(extent) => fusion.new_literal(DType::Index, (extent + factor - 1) / factor),
        None => fusion.ceil_div(src.extent, factor_val),
    };
    let (outer_extent, inner_extent) = if inner_split { (quotient, factor_val) } else { (factor_val, quotient) };

    let zero = fusion.zero();
    let outer = fusion.new_iter_domain(zero, outer_extent, src.iter);
    let inner = fusion.new_iter_domain(zero, inner_extent, src.iter);
    let split_expr = fusion.push_id_expr(IdExpr {
        kind: IdExprKind::Split { factor: factor_val, inner_split, divisible },
        inputs: smallvec![src_id],
        outputs: smallvec![outer, inner],
    });

    if divisible != Some(true) {
        fusion.record_non_divisible_split(tv, split_expr);
    }

    let loop_ = &mut fusion.tensor_mut(tv).domain.loop_;
    loop_.splice(axis..=axis, [outer, inner]);
    trace!(%tv, axis, factor, inner_split, ?divisible, "split");
    Ok(())
}

/// Merge the axes at positions `outer` and `inner` into one whose extent is
/// the product. Two broadcasts merge into a broadcast.
pub fn merge(fusion: &mut Fusion, tv: TensorViewId, outer: usize, inner: usize) -> Result<()> {
    let outer_id = check_axis(fusion, tv, outer)?;
    let inner_id = check_axis(fusion, tv, inner)?;
    if outer == inner {
        return Err(Error::InvalidSchedule { reason: "cannot merge an axis with itself".into() });
    }
    let (o, i) = (fusion.iter_domain(outer_id).clone(), fusion.iter_domain(inner_id).clone());
    let iter = match (o.iter, i.iter) {
        (IterType::Broadcast, IterType::Broadcast) => IterType::Broadcast,
        (IterType::Reduction, IterType::Reduction) => IterType::Reduction,
        (IterType::Reduction, _) | (_, IterType::Reduction) => {
            return Err(Error::InvalidSchedule {
                reason: "cannot merge a reduction axis with an iteration axis".into(),
            });
        }
        _ => IterType::Iteration,
    };
    let extent = fusion.smul(o.extent, i.extent);
    let zero = fusion.zero();
    let merged = fusion.new_iter_domain(zero, extent, iter);
    fusion.push_id_expr(IdExpr {
        kind: IdExprKind::Merge,
        inputs: smallvec![outer_id, inner_id],
        outputs: smallvec![merged],
    });

    let loop_ = &mut fusion.tensor_mut(tv).domain.loop_;
    let (first, second) = (outer.min(inner), outer.max(inner));
    loop_.remove(second);
    loop_[first] = merged;
    trace!(%tv, outer, inner, "merge");
    Ok(())
}

/// Permute loop axes. `mapping` lists `(old_position, new_position)` pairs;
/// unlisted axes keep their relative order in the remaining slots.
pub fn reorder(fusion: &mut Fusion, tv: TensorViewId, mapping: &[(usize, usize)]) -> Result<()> {
    let loop_ = fusion.tensor(tv).domain.loop_.clone();
    let rank = loop_.len();
    let mut slots: Vec<Option<IterDomainId>> = vec![None; rank];
    let mut placed = vec![false; rank];
    for &(old, new) in mapping {
        if old >= rank || new >= rank {
            return Err(Error::AxisOutOfBounds { axis: old.max(new), rank });
        }
        if slots[new].is_some() || placed[old] {
            return Err(Error::InvalidSchedule { reason: format!("reorder maps position {new} twice") });
        }
        slots[new] = Some(loop_[old]);
        placed[old] = true;
    }
    let mut rest = loop_.iter().copied().enumerate().filter(|&(i, _)| !placed[i]).map(|(_, id)| id);
    let reordered: Vec<IterDomainId> =
        slots.into_iter().map(|slot| slot.unwrap_or_else(|| rest.next().expect("slot count matches rank"))).collect();
    fusion.tensor_mut(tv).domain.loop_ = reordered;
    Ok(())
}

/// Insert a 2-D swizzle over two loop axes. `Data` mode affects indexing
/// only; `Loop` mode also changes iteration order.
pub fn swizzle2d(
    fusion: &mut Fusion,
    tv: TensorViewId,
    axis_x: usize,
    axis_y: usize,
    swizzle: Swizzle2DType,
    mode: SwizzleMode,
) -> Result<()> {
    let x_id = check_axis(fusion, tv, axis_x)?;
    let y_id = check_axis(fusion, tv, axis_y)?;
    let (x, y) = (fusion.iter_domain(x_id).clone(), fusion.iter_domain(y_id).clone());
    let out_x = fusion.new_iter_domain(x.start, x.extent, x.iter);
    let out_y = fusion.new_iter_domain(y.start, y.extent, y.iter);
    fusion.iter_domain_mut(out_x).parallel = x.parallel;
    fusion.iter_domain_mut(out_y).parallel = y.parallel;
    fusion.push_id_expr(IdExpr {
        kind: IdExprKind::Swizzle2D { swizzle, mode },
        inputs: smallvec![x_id, y_id],
        outputs: smallvec![out_x, out_y],
    });
    let loop_ = &mut fusion.tensor_mut(tv).domain.loop_;
    loop_[axis_x] = out_x;
    loop_[axis_y] = out_y;
    Ok(())
}

/// Tag a loop axis with a parallel type.
///
/// Propagates to the sibling outputs of a Welford expression so all three
/// results iterate identically.
pub fn parallelize(fusion: &mut Fusion, tv: TensorViewId, axis: usize, ptype: ParallelType) -> Result<()> {
    let id = check_axis(fusion, tv, axis)?;

    if matches!(ptype, ParallelType::Unroll | ParallelType::Unswitch) && fusion.constant_extent(id) == Some(0) {
        return Err(Error::Ir { source: kiln_ir::Error::UnrollZeroExtent });
    }

    // A merge of a broadcast with a concrete axis cannot be parallelized:
    // its iteration count is not well-defined before concretization.
    if ptype != ParallelType::Serial {
        if let Some(def) = fusion.iter_domain(id).definition {
            let id_expr = fusion.id_expr(def);
            if matches!(id_expr.kind, IdExprKind::Merge) {
                let kinds: Vec<bool> =
                    id_expr.inputs.iter().map(|&i| fusion.iter_domain(i).is_broadcast()).collect();
                if kinds.iter().any(|&b| b) && kinds.iter().any(|&b| !b) {
                    return Err(Error::InvalidSchedule {
                        reason: "cannot parallelize a merge of broadcast and non-broadcast axes".into(),
                    });
                }
            }
        }
    }

    fusion.iter_domain_mut(id).parallel = ptype;

    // Welford sibling propagation.
    let val = fusion.tensor(tv).val;
    if let Some(def) = fusion.definition(val) {
        if matches!(fusion.expr(def).kind, kiln_ir::ExprKind::Welford { .. }) {
            let siblings: Vec<TensorViewId> =
                fusion.expr(def).outputs.iter().filter_map(|&v| fusion.val(v).as_tensor()).collect();
            for sibling in siblings {
                if sibling == tv {
                    continue;
                }
                if let Some(&sib_id) = fusion.tensor(sibling).domain.loop_.get(axis) {
                    fusion.iter_domain_mut(sib_id).parallel = ptype;
                }
            }
        }
    }
    Ok(())
}

/// Split a reduction into a partial-reduction producer and a final-reduction
/// consumer. `axes` (loop positions, all reductions) move into the producer;
/// the remaining reduction axes stay with `tv`.
pub fn rfactor(fusion: &mut Fusion, tv: TensorViewId, axes: &[usize]) -> Result<TensorViewId> {
    let loop_ = fusion.tensor(tv).domain.loop_.clone();
    for &axis in axes {
        let id = check_axis(fusion, tv, axis)?;
        if !fusion.iter_domain(id).is_reduction() {
            return Err(Error::InvalidSchedule { reason: format!("rFactor axis {axis} is not a reduction") });
        }
    }
    let def = fusion
        .definition(fusion.tensor(tv).val)
        .ok_or_else(|| Error::InvalidSchedule { reason: "rFactor target has no definition".into() })?;
    let (op, _) = match &fusion.expr(def).kind {
        kiln_ir::ExprKind::Reduction { op, axes } => (*op, axes.clone()),
        _ => {
            return Err(Error::InvalidSchedule { reason: "rFactor target is not a plain reduction".into() });
        }
    };

    // Producer: rfactored axes stay reductions, other reduction axes become
    // rfactor iteration domains the consumer will finish.
    let dtype = fusion.tensor(tv).dtype;
    let producer_ids: Vec<IterDomainId> = loop_
        .iter()
        .enumerate()
        .map(|(pos, &id)| {
            let src = fusion.iter_domain(id).clone();
            let iter = if axes.contains(&pos) {
                IterType::Reduction
            } else if src.is_reduction() {
                IterType::Iteration
            } else {
                src.iter
            };
            let fresh = fusion.new_iter_domain(src.start, src.extent, iter);
            let fresh_domain = fusion.iter_domain_mut(fresh);
            fresh_domain.is_rfactor = src.is_reduction();
            fresh_domain.parallel = src.parallel;
            fresh
        })
        .collect();
    let contiguity = producer_ids
        .iter()
        .map(|&id| if fusion.iter_domain(id).has_contiguity_slot() { Some(true) } else { None })
        .collect();
    let producer = fusion.new_tensor(dtype, TensorDomain::from_root(producer_ids.clone(), contiguity));
    fusion.tensor_mut(producer).memory = MemoryType::Local;

    // Consumer: drop the rfactored axes, keep finishing the rest.
    let mut remaining_reduction_axes: Vec<usize> = Vec::new();
    let mut consumer_ids: Vec<IterDomainId> = Vec::with_capacity(loop_.len() - axes.len());
    for (pos, &id) in loop_.iter().enumerate() {
        if axes.contains(&pos) {
            continue;
        }
        let src = fusion.iter_domain(id).clone();
        if src.is_reduction() {
            remaining_reduction_axes.push(consumer_ids.len());
        }
        let fresh = fusion.new_iter_domain(src.start, src.extent, src.iter);
        fusion.iter_domain_mut(fresh).parallel = src.parallel;
        consumer_ids.push(fresh);
    }
    let consumer_contiguity = consumer_ids
        .iter()
        .map(|&id| if fusion.iter_domain(id).has_contiguity_slot() { Some(true) } else { None })
        .collect();
    fusion.tensor_mut(tv).domain = TensorDomain::from_root(consumer_ids, consumer_contiguity);

    // Rewire: the original reduction now produces the partial tensor, and a
    // fresh reduction finishes it into `tv`.
    let (tv_val, producer_val) = (fusion.tensor(tv).val, fusion.tensor(producer).val);
    fusion.replace_output(def, tv_val, producer_val);
    fusion.add_expr(
        kiln_ir::ExprKind::Reduction { op, axes: remaining_reduction_axes.iter().copied().collect() },
        smallvec![producer_val],
        smallvec![tv_val],
    );
    trace!(%tv, %producer, ?axes, "rfactor");
    Ok(producer)
}

fn check_load_store_hardware(op: LoadStoreOpType, device: &DeviceCapability) -> Result<()> {
    if let Some(required_major) = op.min_sm_major() {
        if device.sm_major < required_major {
            let what = match op {
                LoadStoreOpType::CpAsync => "cp.async",
                LoadStoreOpType::CpAsyncBulkTensorTile => "cp.async.bulk",
                LoadStoreOpType::LdMatrix => "ldmatrix",
                LoadStoreOpType::StMatrix => "stmatrix",
                LoadStoreOpType::Set => "set",
            };
            return Err(Error::UnsupportedHardware {
                what,
                required_major,
                sm_major: device.sm_major,
                sm_minor: device.sm_minor,
            });
        }
    }
    Ok(())
}

fn mirror_full_logical(fusion: &mut Fusion, tv: TensorViewId) -> TensorDomain {
    let logical = fusion.tensor(tv).domain.logical.clone();
    let ids: Vec<IterDomainId> = logical
        .iter()
        .map(|&id| {
            let src = fusion.iter_domain(id).clone();
            fusion.new_iter_domain(src.start, src.extent, src.iter)
        })
        .collect();
    let contiguity =
        ids.iter().map(|&id| if fusion.iter_domain(id).has_contiguity_slot() { Some(true) } else { None }).collect();
    TensorDomain::from_root(ids, contiguity)
}

/// Insert an intermediate between `tv`'s definition and `tv`, so the
/// original producer writes the cache and a copy materializes `tv`.
pub fn cache_before(
    fusion: &mut Fusion,
    tv: TensorViewId,
    op: LoadStoreOpType,
    device: &DeviceCapability,
) -> Result<TensorViewId> {
    check_load_store_hardware(op, device)?;
    let def = fusion
        .definition(fusion.tensor(tv).val)
        .ok_or_else(|| Error::InvalidSchedule { reason: "cacheBefore target has no definition".into() })?;
    let dtype = fusion.tensor(tv).dtype;
    let domain = mirror_full_logical(fusion, tv);
    let cache = fusion.new_tensor(dtype, domain);
    fusion.tensor_mut(cache).memory = MemoryType::Local;

    let (tv_val, cache_val) = (fusion.tensor(tv).val, fusion.tensor(cache).val);
    fusion.replace_output(def, tv_val, cache_val);
    fusion.add_expr(kiln_ir::ExprKind::LoadStore { op }, smallvec![cache_val], smallvec![tv_val]);
    Ok(cache)
}

/// Insert an intermediate between `tv` and all of its consumers, typically
/// to stage an input through registers or shared memory.
pub fn cache_after(
    fusion: &mut Fusion,
    tv: TensorViewId,
    op: LoadStoreOpType,
    device: &DeviceCapability,
) -> Result<TensorViewId> {
    check_load_store_hardware(op, device)?;
    let dtype = fusion.tensor(tv).dtype;
    let domain = mirror_full_logical(fusion, tv);
    let cache = fusion.new_tensor(dtype, domain);
    fusion.tensor_mut(cache).memory = match op {
        LoadStoreOpType::CpAsync | LoadStoreOpType::CpAsyncBulkTensorTile => MemoryType::Shared,
        _ => MemoryType::Local,
    };

    let (tv_val, cache_val) = (fusion.tensor(tv).val, fusion.tensor(cache).val);
    let consumers: Vec<_> = fusion.uses(tv_val).to_vec();
    for consumer in consumers {
        fusion.replace_input(consumer, tv_val, cache_val);
    }
    fusion.add_expr(kiln_ir::ExprKind::LoadStore { op }, smallvec![tv_val], smallvec![cache_val]);
    Ok(cache)
}

/// Deepest loop position at which `producer` can be inlined into `consumer`:
/// leading axes must pair up with matching extents, and a reduction axis of
/// the producer stops inlining.
pub fn max_compatible_depth(fusion: &Fusion, producer: TensorViewId, consumer: TensorViewId) -> usize {
    let p_loop = &fusion.tensor(producer).domain.loop_;
    let c_loop = &fusion.tensor(consumer).domain.loop_;
    let mut depth = 0;
    for (&p_id, &c_id) in p_loop.iter().zip(c_loop) {
        let (p, c) = (fusion.iter_domain(p_id), fusion.iter_domain(c_id));
        if p.is_reduction() {
            break;
        }
        let same_extent = p.extent == c.extent
            || matches!(
                (fusion.constant_of(p.extent), fusion.constant_of(c.extent)),
                (Some(a), Some(b)) if a == b
            );
        if !same_extent || p.parallel != c.parallel {
            break;
        }
        depth += 1;
    }
    depth
}

/// Inline `producer` at loop depth `pos` of `consumer`. Returns the resolved
/// position.
pub fn compute_at(
    fusion: &mut Fusion,
    producer: TensorViewId,
    consumer: TensorViewId,
    pos: usize,
    mode: ComputeAtMode,
) -> Result<usize> {
    let max = max_compatible_depth(fusion, producer, consumer);
    let resolved = match mode {
        ComputeAtMode::Standard => {
            if pos > max {
                return Err(Error::ComputeAtDepth { pos, max, consumer });
            }
            pos
        }
        ComputeAtMode::BestEffort => pos.min(max),
        ComputeAtMode::MostInlined => max,
    };
    fusion.tensor_mut(producer).compute_at_pos = resolved;
    Ok(resolved)
}

/// Set the compute-at position directly, clamped to the loop rank.
pub fn inline_at(fusion: &mut Fusion, tv: TensorViewId, pos: usize) {
    let rank = fusion.tensor(tv).domain.loop_.len();
    fusion.tensor_mut(tv).compute_at_pos = pos.min(rank);
}

/// Inline every intermediate as deep as its first consumer allows, except
/// the listed tensors.
pub fn inline_most(fusion: &mut Fusion, excluded: &[TensorViewId]) {
    for tv in fusion.tensor_ids().collect::<Vec<_>>() {
        if fusion.is_input(tv) || fusion.is_output(tv) || excluded.contains(&tv) {
            continue;
        }
        let depth =
            fusion.consumers_of(tv).into_iter().map(|c| max_compatible_depth(fusion, tv, c)).min().unwrap_or(0);
        fusion.tensor_mut(tv).compute_at_pos = depth;
    }
}

pub fn set_memory_type(fusion: &mut Fusion, tv: TensorViewId, memory: MemoryType) {
    fusion.tensor_mut(tv).memory = memory;
}

/// Request multi-stage buffering of a producer pipeline. Depth two is a
/// double buffer.
pub fn circular_buffer(fusion: &mut Fusion, tv: TensorViewId, depth: usize) -> Result<()> {
    if depth < 2 {
        return Err(Error::CircularBufferDepth { depth });
    }
    fusion.tensor_mut(tv).circular_buffer_depth = Some(depth);
    Ok(())
}
