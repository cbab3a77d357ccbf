//! Memory aliasing.
//!
//! Two allocations may share storage when their live ranges do not overlap
//! and their size, dtype, and memory class agree. Welford outputs must never
//! alias any of the expression's inputs: the running (avg, var·n, n) triple
//! is read back while the inputs are still live.

use std::collections::HashMap;

use kiln_ir::{ExprKind, Fusion, KirNode, TensorViewId, ValId};
use tracing::trace;

use crate::LowerCtx;
use crate::error::Result;

/// Live range of a tensor in topological expression order.
fn live_range(fusion: &Fusion, order: &HashMap<kiln_ir::ExprId, usize>, tv: TensorViewId) -> Option<(usize, usize)> {
    let val = fusion.tensor(tv).val;
    let def = *order.get(&fusion.definition(val)?)?;
    let last_use = fusion.uses(val).iter().filter_map(|e| order.get(e).copied()).max().unwrap_or(def);
    Some((def, last_use))
}

fn welford_conflict(fusion: &Fusion, a: TensorViewId, b: TensorViewId) -> bool {
    fusion.expr_ids().any(|e| {
        let expr = fusion.expr(e);
        if !matches!(expr.kind, ExprKind::Welford { .. }) {
            return false;
        }
        let is_output = |tv: TensorViewId| expr.outputs.iter().any(|&v| fusion.val(v).as_tensor() == Some(tv));
        let is_input = |tv: TensorViewId| expr.inputs.iter().any(|&v| fusion.val(v).as_tensor() == Some(tv));
        (is_output(a) && is_input(b)) || (is_output(b) && is_input(a))
    })
}

fn sizes_match(fusion: &Fusion, a_size: ValId, b_size: ValId) -> bool {
    a_size == b_size
        || matches!(
            (fusion.val(a_size).as_literal(), fusion.val(b_size).as_literal()),
            (Some(x), Some(y)) if x == y
        )
}

pub fn run(ctx: &mut LowerCtx<'_>) -> Result<()> {
    let order: HashMap<kiln_ir::ExprId, usize> =
        ctx.fusion.topo_exprs().into_iter().enumerate().map(|(i, e)| (e, i)).collect();

    let mut allocated: Vec<TensorViewId> = ctx.alloc_node.keys().copied().collect();
    allocated.sort_by_key(|&tv| live_range(ctx.fusion, &order, tv).map(|(def, _)| def).unwrap_or(usize::MAX));
    for (i, &later) in allocated.iter().enumerate() {
        let Some((later_def, _)) = live_range(ctx.fusion, &order, later) else { continue };
        for &earlier in &allocated[..i] {
            if welford_conflict(ctx.fusion, earlier, later) {
                continue;
            }
            let Some((_, earlier_last)) = live_range(ctx.fusion, &order, earlier) else { continue };
            if earlier_last >= later_def {
                continue;
            }
            let (&earlier_node, &later_node) =
                (&ctx.alloc_node[&earlier], &ctx.alloc_node[&later]);
            let compatible = {
                let (ea, la) = (ctx.kernel.node(earlier_node), ctx.kernel.node(later_node));
                match (ea, la) {
                    (
                        KirNode::Allocate { memory: em, size: es, alias_of: None, .. },
                        KirNode::Allocate { memory: lm, size: ls, alias_of: None, .. },
                    ) => {
                        em == lm
                            && ctx.fusion.tensor(earlier).dtype == ctx.fusion.tensor(later).dtype
                            && sizes_match(ctx.fusion, *es, *ls)
                    }
                    _ => false,
                }
            };
            if !compatible {
                continue;
            }
            if let KirNode::Allocate { alias_of, .. } = ctx.kernel.node_mut(later_node) {
                *alias_of = Some(earlier_node);
                trace!(%later, %earlier, "aliased allocation");
            }
            break;
        }
    }
    Ok(())
}
