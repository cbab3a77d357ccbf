//! Vectorized Welford substitution.
//!
//! A Welford whose reduction runs over a vectorized axis is computed with
//! the vector-wide variant: one update folds the whole vector into the
//! (avg, var·n, n) triple.

use kiln_ir::{ExprKind, KirNode, ParallelType};

use crate::LowerCtx;
use crate::error::Result;

pub fn run(ctx: &mut LowerCtx<'_>) -> Result<()> {
    for expr in ctx.fusion.expr_ids().collect::<Vec<_>>() {
        if !matches!(ctx.fusion.expr(expr).kind, ExprKind::Welford { .. }) {
            continue;
        }
        let Some(out_tv) = ctx.fusion.expr(expr).outputs.iter().find_map(|&v| ctx.fusion.val(v).as_tensor())
        else {
            continue;
        };
        let width = ctx
            .fusion
            .tensor(out_tv)
            .domain
            .loop_
            .iter()
            .find(|&&id| {
                let domain = ctx.fusion.iter_domain(id);
                domain.is_reduction() && domain.parallel == ParallelType::Vectorize
            })
            .and_then(|&id| ctx.fusion.constant_extent(id));
        let Some(width) = width else { continue };
        if width <= 1 {
            continue;
        }

        let Some(&stmt) = ctx.expr_stmt.get(&expr) else { continue };
        let scope = ctx.expr_scope.get(&expr).cloned().unwrap_or_default();
        let node = ctx.kernel.push(KirNode::VectorizedWelford { hir: expr, width: width as usize });
        ctx.replace_in_scope(&scope, stmt, node);
        ctx.expr_stmt.insert(expr, node);
    }
    Ok(())
}
