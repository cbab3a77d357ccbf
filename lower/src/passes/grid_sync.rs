//! Grid-synchronization insertion.
//!
//! A reduction whose reduction axes bind grid dims cannot finish within one
//! block: the lowered node becomes a `GridReduction` bracketed by a
//! serialized-grid wait/release pair, with a global sync buffer sized by the
//! parallel dims that do not participate in the reduction.

use kiln_dtype::DType;
use kiln_ir::{KirNode, ParallelTypeBitmap};
use tracing::debug;

use crate::LowerCtx;
use crate::error::Result;

/// Sync-buffer bytes: one counter slot per combination of the
/// non-synchronized parallel dims, padded to 16 bytes.
pub fn grid_sync_buffer_size(ctx: &mut LowerCtx<'_>, bitmap: ParallelTypeBitmap) -> u64 {
    let mut slots: i64 = 1;
    for (&id, _) in ctx.loop_index.clone().iter() {
        let domain = ctx.fusion.iter_domain(id);
        let ptype = domain.parallel;
        if !ptype.is_block_dim() || bitmap.contains(ptype) {
            continue;
        }
        let extent = domain.extent;
        if let Ok(elems) = ctx.info.evaluator_mut().evaluate_int(ctx.fusion, extent) {
            slots = slots.saturating_mul(elems.max(1));
        }
    }
    (slots.unsigned_abs() * 8).next_multiple_of(16)
}

pub fn run(ctx: &mut LowerCtx<'_>) -> Result<()> {
    for expr in ctx.fusion.expr_ids().collect::<Vec<_>>() {
        if !ctx.fusion.expr(expr).is_reduction() {
            continue;
        }
        let Some(out_tv) = ctx.fusion.expr(expr).outputs.iter().find_map(|&v| ctx.fusion.val(v).as_tensor())
        else {
            continue;
        };

        // Grid participation: reduction axes bound to BID dims.
        let mut bitmap: ParallelTypeBitmap = Default::default();
        for &id in &ctx.fusion.tensor(out_tv).domain.loop_ {
            let domain = ctx.fusion.iter_domain(id);
            if domain.is_reduction() && domain.parallel.is_block_dim() {
                bitmap |= domain.parallel;
            }
        }
        if bitmap.is_empty() {
            continue;
        }

        let Some(&node) = ctx.expr_stmt.get(&expr) else { continue };
        let scope = ctx.expr_scope.get(&expr).cloned().unwrap_or_default();

        let buffer_bytes = grid_sync_buffer_size(ctx, bitmap);
        ctx.kernel.summary.grid_sync_buffer_bytes = ctx.kernel.summary.grid_sync_buffer_bytes.max(buffer_bytes);
        ctx.kernel.summary.has_grid_reduction = true;

        let sync_buffer = ctx.fusion.new_named_symbol(DType::Index, "grid_sync_buffer");
        let wait = ctx.kernel.push(KirNode::GridSerializeWait { bitmap, sync_buffer });
        let reduction = ctx.kernel.push(KirNode::GridReduction { hir: expr, bitmap, sync_buffer });
        let release = ctx.kernel.push(KirNode::GridSerializeRelease { bitmap, sync_buffer });

        ctx.insert_before(&scope, node, wait);
        ctx.replace_in_scope(&scope, node, reduction);
        ctx.expr_stmt.insert(expr, reduction);
        // Release goes right after the reduction: re-insert before whatever
        // follows by appending to the same body.
        append_after(ctx, &scope, reduction, release);

        debug!(?bitmap, buffer_bytes, "grid reduction lowered");
    }
    Ok(())
}

fn append_after(ctx: &mut LowerCtx<'_>, scope: &[kiln_ir::KirId], target: kiln_ir::KirId, node: kiln_ir::KirId) {
    let body: &mut Vec<kiln_ir::KirId> = match scope.last() {
        Some(&parent) => {
            let parent_node = ctx.kernel.node_mut(parent);
            let Some(body) = parent_node.bodies_mut().into_iter().find(|body| body.contains(&target)) else {
                return;
            };
            body
        }
        None => &mut ctx.kernel.top_level,
    };
    if let Some(pos) = body.iter().position(|&id| id == target) {
        body.insert(pos + 1, node);
    }
}
