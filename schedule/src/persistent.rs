//! Persistent-buffer schedulers.
//!
//! Normalization-style fusions reduce a tensor and feed the result back to
//! the very data that produced it. Keeping that data live in registers (or
//! shared memory) across the reduction avoids a second kernel: the reduced
//! value is broadcast back within the block.

use tracing::{debug, warn};

use kiln_ir::{ExprId, Fusion, LoadStoreOpType, MemoryType, ParallelType, TensorViewId, ValId};
use kiln_runtime::RuntimeInfo;

use crate::compute_at_map::ComputeAtMap;
use crate::error::{Error, Result};
use crate::registry::HeuristicSummary;
use crate::{primitives, propagate, vectorize};

/// Register bytes one block can realistically dedicate to persistent
/// buffers: the register file less launch overhead.
pub const REGISTER_BUDGET_BYTES: u64 = 255 * 1024;

const DEFAULT_TIDX: i64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistentKind {
    /// Reduced axis is innermost (layer-norm forward).
    Inner,
    /// Reduced axis is outermost (batch-norm-like stats).
    Outer,
    /// Both an inner and an outer reduction feed one output.
    InnerOuter,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersistentBuffer {
    pub tv: TensorViewId,
    pub bytes: u64,
    /// Spilled to shared memory when the register budget is exhausted.
    pub in_shared: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersistentParams {
    pub kind: PersistentKind,
    pub tidx: i64,
    pub persistent_bytes: u64,
    pub buffers: Vec<PersistentBuffer>,
    pub vector_width: usize,
}

fn descends_from(fusion: &Fusion, ancestor: ValId, val: ValId) -> bool {
    if ancestor == val {
        return true;
    }
    let mut stack = vec![ancestor];
    let mut seen = std::collections::HashSet::new();
    while let Some(current) = stack.pop() {
        for &expr in fusion.uses(current) {
            for &output in &fusion.expr(expr).outputs {
                if output == val {
                    return true;
                }
                if seen.insert(output) {
                    stack.push(output);
                }
            }
        }
    }
    false
}

/// A reduction participates in a persistent pattern when its result is
/// combined downstream with data that did not pass through it.
fn persistent_pattern(fusion: &Fusion, red: ExprId) -> bool {
    let Some(&red_out) = fusion.expr(red).outputs.first() else { return false };
    fusion.expr_ids().any(|e| {
        let tensor_inputs: Vec<ValId> =
            fusion.expr(e).inputs.iter().copied().filter(|&v| fusion.val(v).as_tensor().is_some()).collect();
        if tensor_inputs.len() < 2 {
            return false;
        }
        let from_reduction = tensor_inputs.iter().filter(|&&v| descends_from(fusion, red_out, v)).count();
        from_reduction >= 1 && from_reduction < tensor_inputs.len()
    })
}

/// Where the reduced axes of a reduction output sit.
fn reduction_position(fusion: &Fusion, tv: TensorViewId) -> Option<PersistentKind> {
    let logical = &fusion.tensor(tv).domain.logical;
    let last_is_red = logical.last().map(|&id| fusion.iter_domain(id).is_reduction())?;
    let first_is_red = logical.first().map(|&id| fusion.iter_domain(id).is_reduction())?;
    match (first_is_red, last_is_red) {
        (_, true) => Some(PersistentKind::Inner),
        (true, false) => Some(PersistentKind::Outer),
        _ => None,
    }
}

fn persistent_reductions(fusion: &Fusion, summary: &HeuristicSummary) -> Vec<(ExprId, TensorViewId, PersistentKind)> {
    summary
        .reduction_exprs(fusion)
        .iter()
        .filter_map(|&expr| {
            let tv = fusion.expr(expr).outputs.iter().find_map(|&v| fusion.val(v).as_tensor())?;
            if !persistent_pattern(fusion, expr) {
                return None;
            }
            reduction_position(fusion, tv).map(|kind| (expr, tv, kind))
        })
        .collect()
}

pub fn can_schedule_compile_time(fusion: &Fusion, summary: &HeuristicSummary, kind: PersistentKind) -> bool {
    let reductions = persistent_reductions(fusion, summary);
    if reductions.is_empty() {
        return false;
    }
    match kind {
        PersistentKind::Inner => {
            reductions.iter().all(|(_, _, k)| *k == PersistentKind::Inner)
        }
        PersistentKind::Outer => {
            reductions.iter().all(|(_, _, k)| *k == PersistentKind::Outer)
        }
        PersistentKind::InnerOuter => {
            reductions.iter().any(|(_, _, k)| *k == PersistentKind::Inner)
                && reductions.iter().any(|(_, _, k)| *k == PersistentKind::Outer)
        }
    }
}

/// Per-block bytes of every tensor that must stay live across a reduction.
fn persistent_buffers(
    fusion: &Fusion,
    info: &mut RuntimeInfo,
    summary: &HeuristicSummary,
) -> Result<Vec<PersistentBuffer>> {
    let mut buffers = Vec::new();
    for (expr, tv, _) in persistent_reductions(fusion, summary) {
        let red_ids: Vec<_> = fusion
            .tensor(tv)
            .domain
            .logical
            .iter()
            .copied()
            .filter(|&id| fusion.iter_domain(id).is_reduction())
            .collect();
        let mut red_elems = 1i64;
        for id in red_ids {
            red_elems *= info.extent_of(fusion, id)?;
        }
        for &input in &fusion.expr(expr).inputs {
            if let Some(input_tv) = fusion.val(input).as_tensor() {
                let bytes = red_elems.unsigned_abs() * fusion.tensor(input_tv).dtype.bytes() as u64;
                if !buffers.iter().any(|b: &PersistentBuffer| b.tv == input_tv) {
                    buffers.push(PersistentBuffer { tv: input_tv, bytes, in_shared: false });
                }
            }
        }
    }
    Ok(buffers)
}

pub fn can_schedule_run_time(
    fusion: &Fusion,
    info: &mut RuntimeInfo,
    summary: &HeuristicSummary,
    _kind: PersistentKind,
) -> bool {
    let Ok(buffers) = persistent_buffers(fusion, info, summary) else { return false };
    let total: u64 = buffers.iter().map(|b| b.bytes).sum();
    total <= REGISTER_BUDGET_BYTES || total <= info.device.max_shared_bytes_optin
        || spill_assignment(buffers, info.device.max_shared_bytes_optin).is_ok()
}

/// Move the largest buffers to shared memory until the register share fits.
fn spill_assignment(mut buffers: Vec<PersistentBuffer>, shared_limit: u64) -> Result<Vec<PersistentBuffer>> {
    let mut register_total: u64 = buffers.iter().map(|b| b.bytes).sum();
    let mut shared_total = 0u64;
    while register_total > REGISTER_BUDGET_BYTES {
        let Some(candidate) = buffers
            .iter_mut()
            .filter(|b| !b.in_shared)
            .max_by_key(|b| b.bytes)
        else {
            break;
        };
        candidate.in_shared = true;
        register_total -= candidate.bytes;
        shared_total += candidate.bytes;
    }
    if shared_total > shared_limit {
        return Err(Error::ResourceOverflow {
            resource: "shared memory persistent buffer",
            required: shared_total,
            limit: shared_limit,
        });
    }
    Ok(buffers)
}

pub fn compute_heuristics(
    fusion: &Fusion,
    info: &mut RuntimeInfo,
    summary: &HeuristicSummary,
    kind: PersistentKind,
) -> Result<PersistentParams> {
    let buffers = persistent_buffers(fusion, info, summary)?;
    let persistent_bytes: u64 = buffers.iter().map(|b| b.bytes).sum();
    let buffers = spill_assignment(buffers, info.device.max_shared_bytes_optin)?;
    if buffers.iter().any(|b| b.in_shared) {
        warn!(persistent_bytes, "register pressure spills persistent buffers to shared memory");
    }

    let io = vectorize::vectorizable_io(fusion, info);
    let vector_width = vectorize::common_vector_width(fusion, info, &io, None);

    let params = PersistentParams { kind, tidx: DEFAULT_TIDX, persistent_bytes, buffers, vector_width };
    debug!(kind = ?params.kind, bytes = params.persistent_bytes, "persistent heuristics");
    Ok(params)
}

pub fn schedule(fusion: &mut Fusion, params: &PersistentParams, info: &RuntimeInfo) -> Result<()> {
    let summary = HeuristicSummary::new();
    let (_, reference, _) = persistent_reductions(fusion, &summary)
        .into_iter()
        .next()
        .ok_or_else(|| Error::InvalidSchedule { reason: "no persistent reduction in fusion".into() })?;

    // Cache inputs; the caches are the actual persistent buffers, so carry
    // the spill decision over to them.
    let mut caches = Vec::new();
    for input in fusion.input_tensors() {
        if fusion.consumers_of(input).is_empty() {
            continue;
        }
        let spilled = params.buffers.iter().any(|b| b.tv == input && b.in_shared);
        let cache = primitives::cache_after(fusion, input, LoadStoreOpType::Set, &info.device)?;
        if spilled {
            primitives::set_memory_type(fusion, cache, MemoryType::Shared);
        }
        caches.push(cache);
    }

    let map = ComputeAtMap::build_permitting_self_mapping(fusion);
    let (iter_ref, red_ref) = {
        let logical = &fusion.tensor(reference).domain.logical;
        let (red, iter): (Vec<_>, Vec<_>) =
            logical.iter().copied().partition(|&id| fusion.iter_domain(id).is_reduction());
        (iter, red)
    };

    shape_tensor(fusion, &map, reference, &iter_ref, &red_ref, params)?;
    for tv in propagate::spanning_order(fusion, &map, reference) {
        if fusion.is_input(tv) {
            continue;
        }
        shape_tensor(fusion, &map, tv, &iter_ref, &red_ref, params)?;
    }

    primitives::inline_most(fusion, &caches);
    // Persistent caches stay at the block level: they must live across the
    // whole reduction loop.
    for cache in caches {
        primitives::inline_at(fusion, cache, 1);
    }
    Ok(())
}

/// Persistent nest: one block per iteration row, the reduction split into a
/// per-thread serial batch and a TIDx stretch that finishes in shared
/// memory or registers.
fn shape_tensor(
    fusion: &mut Fusion,
    map: &ComputeAtMap,
    tv: TensorViewId,
    iter_ref: &[kiln_ir::IterDomainId],
    red_ref: &[kiln_ir::IterDomainId],
    params: &PersistentParams,
) -> Result<()> {
    let rank = fusion.tensor(tv).domain.loop_.len();
    if rank == 0 {
        return Ok(());
    }
    let iter_positions = propagate::positions_mapped_to(fusion, map, tv, iter_ref);
    let red_positions = propagate::positions_mapped_to(fusion, map, tv, red_ref);
    let iter_count = iter_positions.len();
    let red_count = red_positions.len();

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

    match params.kind {
        PersistentKind::Inner | PersistentKind::InnerOuter => {
            if red_count > 0 {
                // [Rbatch, TIDx]: the batch is the per-thread persistent run.
                primitives::split(fusion, tv, red_axis, params.tidx, true)?;
                primitives::parallelize(fusion, tv, red_axis + 1, ParallelType::TIDx)?;
            }
            if has_iter {
                primitives::parallelize(fusion, tv, 0, ParallelType::BIDx)?;
            }
        }
        PersistentKind::Outer => {
            // Iteration tiled across the block; the outer reduction stays a
            // serial per-thread accumulation.
            if has_iter {
                primitives::split(fusion, tv, 0, params.tidx, true)?;
                primitives::parallelize(fusion, tv, 1, ParallelType::TIDx)?;
                primitives::parallelize(fusion, tv, 0, ParallelType::BIDx)?;
            }
        }
    }
    Ok(())
}
