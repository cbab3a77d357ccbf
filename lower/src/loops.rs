//! Loop-nest construction.
//!
//! Walks the scheduled expressions in dependency order and grows the KIR
//! statement tree: each tensor expression is placed under the for-loops of
//! its output's loop domain, sharing loops with the previous expression up
//! to the inlining depth. Compile-time-expanded axes (Unroll, Unswitch,
//! Vectorize) still materialize as loops here; the emitter flattens them.

use smallvec::SmallVec;

use kiln_dtype::DType;
use kiln_ir::{ExprKind, Fusion, IterDomainId, KirId, KirNode, TensorViewId, ValId, ValKind};

use crate::error::Result;
use crate::LowerCtx;

/// Index val for one materialized loop, named after its parallel binding.
fn loop_index_val(fusion: &mut Fusion, id: IterDomainId) -> ValId {
    let name = match fusion.iter_domain(id).parallel {
        kiln_ir::ParallelType::BIDx => "blockIdx.x",
        kiln_ir::ParallelType::BIDy => "blockIdx.y",
        kiln_ir::ParallelType::BIDz => "blockIdx.z",
        kiln_ir::ParallelType::TIDx => "threadIdx.x",
        kiln_ir::ParallelType::TIDy => "threadIdx.y",
        kiln_ir::ParallelType::TIDz => "threadIdx.z",
        _ => return fusion.new_symbol(DType::Index),
    };
    fusion.new_named_symbol(DType::Index, name)
}

/// Whether two loop levels can be fused into one physical loop. Split
/// quotients of symbolic extents only prove equal under the bound inputs,
/// so the evaluator gets the final word.
fn loops_compatible(ctx: &mut LowerCtx<'_>, a: IterDomainId, b: IterDomainId) -> bool {
    if a == b {
        return true;
    }
    let (da, db) = (ctx.fusion.iter_domain(a).clone(), ctx.fusion.iter_domain(b).clone());
    if da.parallel != db.parallel {
        return false;
    }
    if da.extent == db.extent {
        return true;
    }
    match (ctx.fusion.val(da.extent).as_literal(), ctx.fusion.val(db.extent).as_literal()) {
        (Some(x), Some(y)) => return x == y,
        _ => {}
    }
    let lhs = ctx.info.evaluator_mut().evaluate_int(ctx.fusion, da.extent);
    let rhs = ctx.info.evaluator_mut().evaluate_int(ctx.fusion, db.extent);
    matches!((lhs, rhs), (Ok(x), Ok(y)) if x == y)
}

/// Flat index of `tv` under the current loop nest: the row-major fold of
/// its loop-domain indices, skipping broadcast axes.
fn flat_index(ctx: &mut LowerCtx<'_>, tv: TensorViewId) -> ValId {
    let loop_ = ctx.fusion.tensor(tv).domain.loop_.clone();
    let mut acc: Option<ValId> = None;
    for id in loop_ {
        let domain = ctx.fusion.iter_domain(id);
        if domain.is_broadcast() {
            continue;
        }
        let extent = domain.extent;
        let Some(&index) = ctx.loop_index.get(&id) else { continue };
        acc = Some(match acc {
            None => index,
            Some(prev) => {
                let scaled = ctx.fusion.smul(prev, extent);
                ctx.fusion.sadd(scaled, index)
            }
        });
    }
    acc.unwrap_or_else(|| ctx.fusion.zero())
}

/// Build the loop-nest skeleton for every tensor expression.
pub fn build_loop_nests(ctx: &mut LowerCtx<'_>) -> Result<()> {
    // Open loop stack: (iter domain, kir node).
    let mut stack: Vec<(IterDomainId, KirId)> = Vec::new();

    for expr_id in ctx.fusion.topo_exprs() {
        let expr = ctx.fusion.expr(expr_id).clone();
        let Some(out_tv) = expr.outputs.iter().find_map(|&v| ctx.fusion.val(v).as_tensor()) else {
            // Scalar expressions are materialized inline by the emitter.
            continue;
        };
        if matches!(expr.kind, ExprKind::Sdpa | ExprKind::Reshard) {
            continue;
        }

        let loop_ids = ctx.fusion.tensor(out_tv).domain.loop_.clone();

        // Reuse the open loops up to the inlining depth: either this output
        // is inlined into what follows, or an inlined producer already
        // opened the loops this expression iterates.
        let ca_limit = expr
            .inputs
            .iter()
            .filter_map(|&v| ctx.fusion.val(v).as_tensor())
            .map(|tv| ctx.fusion.tensor(tv).compute_at_pos)
            .chain([ctx.fusion.tensor(out_tv).compute_at_pos])
            .max()
            .unwrap_or(0);
        let mut shared = 0;
        let limit = ca_limit.min(loop_ids.len()).min(stack.len());
        while shared < limit {
            let (open_id, _) = stack[shared];
            if !loops_compatible(ctx, open_id, loop_ids[shared]) {
                break;
            }
            shared += 1;
        }
        stack.truncate(shared);

        // A reused loop drives this tensor's matching axis too.
        for (position, &(open_id, _)) in stack.iter().enumerate().take(shared) {
            if let Some(&index) = ctx.loop_index.get(&open_id) {
                ctx.loop_index.insert(loop_ids[position], index);
            }
        }

        for &id in &loop_ids[shared..] {
            let index = loop_index_val(ctx.fusion, id);
            ctx.loop_index.insert(id, index);
            let node = ctx.kernel.push(KirNode::ForLoop { iter_domain: id, index, body: Vec::new() });
            attach(ctx, &stack, node);
            stack.push((id, node));
        }

        // Tensor operands get explicit index nodes, outputs first.
        let mut indices: SmallVec<[KirId; 4]> = SmallVec::new();
        for &val in expr.outputs.iter().chain(&expr.inputs) {
            if let ValKind::Tensor(operand) = ctx.fusion.val(val).kind {
                let index = flat_index(ctx, operand);
                indices.push(ctx.kernel.push(KirNode::TensorIndex { tv: operand, index }));
            }
        }

        let node = ctx.kernel.push(KirNode::Expr { hir: expr_id, indices });
        attach(ctx, &stack, node);
        ctx.expr_node.insert(expr_id, node);
        ctx.expr_stmt.insert(expr_id, node);
        ctx.expr_scope.insert(expr_id, stack.iter().map(|&(_, node)| node).collect());
    }
    Ok(())
}

fn attach(ctx: &mut LowerCtx<'_>, stack: &[(IterDomainId, KirId)], node: KirId) {
    match stack.last() {
        Some(&(_, parent)) => {
            if let KirNode::ForLoop { body, .. } = ctx.kernel.node_mut(parent) {
                body.push(node);
            }
        }
        None => ctx.kernel.top_level.push(node),
    }
}
