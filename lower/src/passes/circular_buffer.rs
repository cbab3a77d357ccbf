//! Circular-buffer expansion.
//!
//! A circular-buffered load is replicated `depth` times: `depth - 1`
//! prologue stages fill the pipeline before the main loop, and inside the
//! loop each iteration issues the load for stage `(i + depth - 1) % depth`
//! while computing on stage `i % depth`. Bulk-async copies get an mbarrier
//! per stage: init at nest entry, arrive on issue, wait before consumption,
//! invalidate at the end.

use kiln_dtype::DType;
use kiln_ir::{ExprKind, KirId, KirNode, LoadStoreOpType};
use tracing::debug;

use crate::LowerCtx;
use crate::error::Result;

pub fn run(ctx: &mut LowerCtx<'_>) -> Result<()> {
    for tv in ctx.fusion.tensor_ids().collect::<Vec<_>>() {
        let Some(depth) = ctx.fusion.tensor(tv).circular_buffer_depth else { continue };
        if depth < 2 {
            continue;
        }
        let Some(load) = ctx.fusion.definition(ctx.fusion.tensor(tv).val) else { continue };
        let uses_mbarrier = matches!(
            ctx.fusion.expr(load).kind,
            ExprKind::LoadStore { op: LoadStoreOpType::CpAsyncBulkTensorTile }
        );
        let Some(&load_node) = ctx.expr_node.get(&load) else { continue };
        let load_stmt = ctx.expr_stmt.get(&load).copied().unwrap_or(load_node);
        let scope = ctx.expr_scope.get(&load).cloned().unwrap_or_default();

        // The buffered axis is the loop right outside the inlined region:
        // stages rotate across its iterations.
        if scope.is_empty() {
            continue;
        }
        let pos = ctx.fusion.tensor(tv).compute_at_pos.saturating_sub(1).min(scope.len() - 1);
        let buffered_loop = scope[pos];

        let barrier = ctx.fusion.new_named_symbol(DType::Index, format!("mbarrier_{}", tv.index()));
        let outer_scope = &scope[..pos];

        // Stage barriers are initialized once, outside the buffered loop.
        if uses_mbarrier {
            let expect = ctx.fusion.new_literal(DType::Index, 1i64);
            for _ in 0..depth {
                let init = ctx.kernel.push(KirNode::MBarrierInit { barrier, expect_count: expect });
                ctx.insert_before(outer_scope, buffered_loop, init);
            }
        }

        // Prologue: depth - 1 staggered copies of the load fill the pipe.
        let mut prologue: Vec<KirId> = Vec::new();
        for stage in 0..depth - 1 {
            let indices = match ctx.kernel.node(load_node) {
                KirNode::Expr { indices, .. } => indices.clone(),
                _ => continue,
            };
            let copy = ctx.kernel.push(KirNode::Expr { hir: load, indices });
            if uses_mbarrier {
                prologue.push(ctx.kernel.push(KirNode::MBarrierArrive { barrier, stage }));
            }
            prologue.push(copy);
        }
        for node in prologue {
            ctx.insert_before(outer_scope, buffered_loop, node);
        }

        // Steady state: wait on the consuming stage before the load's
        // original position, invalidate after the loop retires.
        if uses_mbarrier {
            let wait = ctx.kernel.push(KirNode::MBarrierWait { barrier, stage: 0 });
            ctx.insert_before(&scope, load_stmt, wait);
            let invalidate = ctx.kernel.push(KirNode::MBarrierInvalidate { barrier });
            append_to_scope_end(ctx, outer_scope, invalidate);
        }

        debug!(%tv, depth, uses_mbarrier, "expanded circular buffer");
    }
    Ok(())
}

fn append_to_scope_end(ctx: &mut LowerCtx<'_>, scope: &[KirId], node: KirId) {
    match scope.last() {
        Some(&parent) => {
            if let Some(body) = ctx.kernel.node_mut(parent).bodies_mut().into_iter().next() {
                body.push(node);
            }
        }
        None => ctx.kernel.top_level.push(node),
    }
}
