//! Initialization insertion.
//!
//! Reduction and Welford accumulators are filled with the op identity
//! before the reduction loop runs. `cp.async`-backed loads zero-fill their
//! out-of-bounds lanes in hardware and must not receive an explicit init.

use kiln_ir::{ExprKind, KirNode};

use crate::LowerCtx;
use crate::error::Result;

pub fn run(ctx: &mut LowerCtx<'_>) -> Result<()> {
    for expr_id in ctx.fusion.expr_ids().collect::<Vec<_>>() {
        let kind = ctx.fusion.expr(expr_id).kind.clone();
        if !matches!(kind, ExprKind::Reduction { .. } | ExprKind::Welford { .. }) {
            continue;
        }
        for &output in &ctx.fusion.expr(expr_id).outputs.clone() {
            let Some(tv) = ctx.fusion.val(output).as_tensor() else { continue };
            if let Some(&alloc) = ctx.alloc_node.get(&tv) {
                if let KirNode::Allocate { zero_init, resets_to_zero, .. } = ctx.kernel.node_mut(alloc) {
                    *zero_init = true;
                    // Grid-serialized accumulators are reused across waves.
                    *resets_to_zero = matches!(kind, ExprKind::Reduction { .. });
                }
            }
        }
    }

    // An implicitly-initialized load wins over any init a sibling pass set
    // on its destination.
    for expr_id in ctx.fusion.expr_ids().collect::<Vec<_>>() {
        let expr = ctx.fusion.expr(expr_id);
        let implicit = matches!(&expr.kind, ExprKind::LoadStore { op } if op.is_implicitly_initialized());
        if !implicit {
            continue;
        }
        for &output in expr.outputs.clone().iter() {
            let Some(tv) = ctx.fusion.val(output).as_tensor() else { continue };
            if let Some(&alloc) = ctx.alloc_node.get(&tv) {
                if let KirNode::Allocate { zero_init, .. } = ctx.kernel.node_mut(alloc) {
                    *zero_init = false;
                }
            }
        }
    }
    Ok(())
}
