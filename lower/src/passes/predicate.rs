//! Predicate insertion.
//!
//! Four families of guards are added here:
//!
//! - **Non-divisible splits**: a per-iteration `i*factor + j < extent` guard,
//!   except when the split feeds a vectorized axis, in which case a single
//!   runtime check at kernel entry replaces the per-iteration predicate.
//! - **Broadcast concretization**: writes through a non-uniquely concretized
//!   broadcast are bounded by the concrete consumer extent.
//! - **Thread redundancy**: global writes that execute redundantly across a
//!   parallel dim are restricted to index zero of that dim.
//! - **RNG**: rand-like ops are always predicated so an out-of-bounds thread
//!   does not advance its generator state.

use std::collections::HashMap;

use kiln_dtype::DType;
use kiln_ir::{
    EntryCheck, EntryCheckKind, ExprId, ExprKind, Fusion, IdExprKind, IterDomainId, KirId, KirNode, MemoryType,
    ParallelType, ParallelTypeBitmap, ValId,
};
use tracing::trace;

use crate::LowerCtx;
use crate::error::Result;

#[derive(Default)]
struct PredicateState {
    /// Expr -> wrapping if-then-else, so repeated guards conjoin.
    wrapped: HashMap<ExprId, KirId>,
}

pub fn run(ctx: &mut LowerCtx<'_>) -> Result<()> {
    let mut state = PredicateState::default();
    non_divisible_splits(ctx, &mut state)?;
    broadcast_concretization(ctx, &mut state)?;
    thread_redundancy(ctx, &mut state)?;
    rng_predicates(ctx, &mut state)?;
    Ok(())
}

/// Wrap the KIR statement of `expr` in a predicate, conjoining with any
/// guard already present, and mirror it on the expression's write predicate.
fn guard_expr(ctx: &mut LowerCtx<'_>, state: &mut PredicateState, expr: ExprId, predicate: ValId) {
    let combined = match ctx.fusion.expr(expr).write_predicate {
        Some(existing) => ctx.fusion.sand(existing, predicate),
        None => predicate,
    };
    ctx.fusion.expr_mut(expr).write_predicate = Some(combined);

    if let Some(&ite) = state.wrapped.get(&expr) {
        if let KirNode::IfThenElse { predicate: slot, .. } = ctx.kernel.node_mut(ite) {
            *slot = combined;
        }
        return;
    }

    let Some(&node) = ctx.expr_node.get(&expr) else { return };
    let scope = ctx.expr_scope.get(&expr).cloned().unwrap_or_default();
    let ite = ctx.kernel.push(KirNode::IfThenElse {
        predicate: combined,
        then_body: vec![node],
        else_body: Vec::new(),
    });
    ctx.replace_in_scope(&scope, node, ite);
    ctx.expr_stmt.insert(expr, ite);
    state.wrapped.insert(expr, ite);
}

/// Whether an axis (or anything derived from it) is vectorized.
fn feeds_vectorize(fusion: &Fusion, start: &[IterDomainId]) -> Option<IterDomainId> {
    let mut stack: Vec<IterDomainId> = start.to_vec();
    let mut seen = std::collections::HashSet::new();
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        if matches!(
            fusion.iter_domain(id).parallel,
            ParallelType::Vectorize | ParallelType::MisalignedVectorize
        ) {
            return Some(id);
        }
        for id_expr in fusion.id_exprs() {
            if id_expr.inputs.contains(&id) {
                stack.extend(id_expr.outputs.iter().copied());
            }
        }
    }
    None
}

fn non_divisible_splits(ctx: &mut LowerCtx<'_>, state: &mut PredicateState) -> Result<()> {
    for (tv, split) in ctx.fusion.non_divisible_splits().to_vec() {
        let id_expr = ctx.fusion.id_expr(split).clone();
        let IdExprKind::Split { factor, divisible, .. } = id_expr.kind else { continue };
        if divisible == Some(true) {
            continue;
        }
        let input = id_expr.inputs[0];
        let in_extent = ctx.fusion.iter_domain(input).extent;

        if let Some(vectorized) = feeds_vectorize(ctx.fusion, &id_expr.outputs) {
            // Validate-at-runtime: one hoisted entry check, no per-iteration
            // predicate.
            let width = ctx.fusion.constant_extent(vectorized).unwrap_or(1) as usize;
            let width_val = ctx.fusion.new_literal(DType::Index, width as i64);
            let zero = ctx.fusion.zero();
            let remainder = ctx.fusion.smod(in_extent, width_val);
            let predicate = ctx.fusion.seq(remainder, zero);
            ctx.kernel.summary.entry_checks.push(EntryCheck {
                predicate,
                kind: EntryCheckKind::VectorizationStride { tv, width },
            });
            trace!(%tv, width, "hoisted vectorization stride check");
            continue;
        }

        // Predicate-per-iteration on the write of the defining expression.
        let Some(def) = ctx.fusion.definition(ctx.fusion.tensor(tv).val) else { continue };
        let (Some(&outer_idx), Some(&inner_idx)) =
            (ctx.loop_index.get(&id_expr.outputs[0]), ctx.loop_index.get(&id_expr.outputs[1]))
        else {
            continue;
        };
        let mut lhs = ctx.fusion.smul(outer_idx, factor);
        lhs = ctx.fusion.sadd(lhs, inner_idx);

        // A statically known extent lets the target compiler fold the bound
        // check away across an unrolled loop; magic zero keeps it honest.
        if ctx.fusion.constant_of(in_extent).is_some() {
            let magic = ctx.fusion.magic_zero();
            lhs = ctx.fusion.sadd(lhs, magic);
            ctx.kernel.summary.uses_magic_zero = true;
        }

        let predicate = ctx.fusion.slt(lhs, in_extent);
        guard_expr(ctx, state, def, predicate);
        trace!(%tv, "per-iteration non-divisible split predicate");
    }
    Ok(())
}

fn broadcast_concretization(ctx: &mut LowerCtx<'_>, state: &mut PredicateState) -> Result<()> {
    let map = kiln_schedule::ComputeAtMap::build_permitting_self_mapping(ctx.fusion);
    for tv in ctx.fusion.tensor_ids().collect::<Vec<_>>() {
        let logical = ctx.fusion.tensor(tv).domain.logical.clone();
        for id in logical {
            if !ctx.fusion.iter_domain(id).is_broadcast() {
                continue;
            }
            if map.concretization(ctx.fusion, id) != kiln_schedule::BroadcastConcretization::NonUnique {
                continue;
            }
            // Every write through the broadcast is bounded by the extent of
            // the concrete axis the consumer actually iterates.
            let val = ctx.fusion.tensor(tv).val;
            for consumer in ctx.fusion.uses(val).to_vec() {
                let Some(out_tv) =
                    ctx.fusion.expr(consumer).outputs.iter().find_map(|&v| ctx.fusion.val(v).as_tensor())
                else {
                    continue;
                };
                let concrete = ctx
                    .fusion
                    .tensor(out_tv)
                    .domain
                    .loop_
                    .clone()
                    .into_iter()
                    .find(|&c| map.are_mapped(c, id, kiln_schedule::MappingMode::Permissive));
                let Some(concrete) = concrete else {
                    // No consumer axis to bound the write with: the mismatch
                    // cannot be predicated away and the fusion is rejected.
                    return Err(crate::error::Error::Schedule {
                        source: kiln_schedule::Error::NonUniquelyConcretizedBroadcast { id },
                    });
                };
                let Some(&index) = ctx.loop_index.get(&concrete) else { continue };
                let extent = ctx.fusion.iter_domain(concrete).extent;
                let predicate = ctx.fusion.slt(index, extent);
                guard_expr(ctx, state, consumer, predicate);
                trace!(%tv, "predicated non-uniquely concretized broadcast");
            }
        }
    }
    Ok(())
}

fn thread_redundancy(ctx: &mut LowerCtx<'_>, state: &mut PredicateState) -> Result<()> {
    // Parallel types the kernel actually binds.
    let mut used: ParallelTypeBitmap = Default::default();
    for (&id, _) in ctx.loop_index.clone().iter() {
        let ptype = ctx.fusion.iter_domain(id).parallel;
        if ptype.is_thread_dim() || ptype.is_block_dim() {
            used |= ptype;
        }
    }

    for expr in ctx.fusion.expr_ids().collect::<Vec<_>>() {
        let Some(out_tv) = ctx.fusion.expr(expr).outputs.iter().find_map(|&v| ctx.fusion.val(v).as_tensor())
        else {
            continue;
        };
        if ctx.fusion.tensor(out_tv).memory != MemoryType::Global {
            continue;
        }
        // The write iterates the non-reduction axes only: a parallel
        // reduction axis leaves the result redundant across that dim.
        let mut bound: ParallelTypeBitmap = Default::default();
        for &id in &ctx.fusion.tensor(out_tv).domain.loop_ {
            let domain = ctx.fusion.iter_domain(id);
            if domain.is_reduction() {
                continue;
            }
            let ptype = domain.parallel;
            if ptype.is_thread_dim() || ptype.is_block_dim() {
                bound |= ptype;
            }
        }
        let redundant = used - bound;
        if redundant.is_empty() {
            continue;
        }

        // tid == 0 && bid == 0 on every redundant dim.
        let mut predicate: Option<ValId> = None;
        for ptype in redundant {
            let name = match ptype {
                ParallelType::TIDx => "threadIdx.x",
                ParallelType::TIDy => "threadIdx.y",
                ParallelType::TIDz => "threadIdx.z",
                ParallelType::BIDx => "blockIdx.x",
                ParallelType::BIDy => "blockIdx.y",
                ParallelType::BIDz => "blockIdx.z",
                _ => continue,
            };
            let sym = ctx.fusion.new_named_symbol(DType::Index, name);
            let zero = ctx.fusion.zero();
            let eq = ctx.fusion.seq(sym, zero);
            predicate = Some(match predicate {
                None => eq,
                Some(prev) => ctx.fusion.sand(prev, eq),
            });
        }
        let Some(predicate) = predicate else { continue };
        guard_expr(ctx, state, expr, predicate);

        // The redundancy bitmap travels with the allocation when one exists.
        if let Some(&alloc) = ctx.alloc_node.get(&out_tv) {
            if let KirNode::Allocate { write_redundancy, .. } = ctx.kernel.node_mut(alloc) {
                *write_redundancy = redundant;
            }
        }
    }
    Ok(())
}

fn rng_predicates(ctx: &mut LowerCtx<'_>, state: &mut PredicateState) -> Result<()> {
    for expr in ctx.fusion.expr_ids().collect::<Vec<_>>() {
        if !matches!(ctx.fusion.expr(expr).kind, ExprKind::Rng { .. }) {
            continue;
        }
        let Some(out_tv) = ctx.fusion.expr(expr).outputs.iter().find_map(|&v| ctx.fusion.val(v).as_tensor())
        else {
            continue;
        };
        // Bound the flat output index by the logical element count.
        let Some(&node) = ctx.expr_node.get(&expr) else { continue };
        let KirNode::Expr { indices, .. } = ctx.kernel.node(node) else { continue };
        let Some(&out_index_node) = indices.first() else { continue };
        let KirNode::TensorIndex { index, .. } = *ctx.kernel.node(out_index_node) else { continue };

        let logical = ctx.fusion.tensor(out_tv).domain.logical.clone();
        let mut numel: Option<ValId> = None;
        for id in logical {
            let extent = ctx.fusion.iter_domain(id).extent;
            numel = Some(match numel {
                None => extent,
                Some(prev) => ctx.fusion.smul(prev, extent),
            });
        }
        let Some(numel) = numel else { continue };
        let predicate = ctx.fusion.slt(index, numel);
        guard_expr(ctx, state, expr, predicate);
    }
    Ok(())
}
