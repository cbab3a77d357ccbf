//! Block-synchronization insertion.
//!
//! For every shared-memory tensor, the set of threads that wrote it is
//! compared against the set that reads it. If they differ on any TID
//! parallel type, a `BlockSync` goes between the write and the read. The
//! aligned variant is used when every thread of the block reaches the
//! barrier unconditionally (the consumer is not under a predicate); writes
//! that are exclusively redundant skip the sync.

use kiln_ir::{ExprId, Fusion, KirNode, MemoryType, ParallelTypeBitmap, TensorViewId};
use tracing::trace;

use crate::LowerCtx;
use crate::error::Result;

fn thread_bitmap(fusion: &Fusion, tv: TensorViewId) -> ParallelTypeBitmap {
    let mut bitmap: ParallelTypeBitmap = Default::default();
    for &id in &fusion.tensor(tv).domain.loop_ {
        let ptype = fusion.iter_domain(id).parallel;
        if ptype.is_thread_dim() {
            bitmap |= ptype;
        }
    }
    bitmap
}

/// Whether a barrier placed before the statement of `expr` would itself sit
/// under an if-then-else, making convergence conditional. The statement's
/// own predicate wrapper does not count: the barrier goes outside it.
fn barrier_under_predicate(ctx: &LowerCtx<'_>, expr: ExprId) -> bool {
    let Some(&stmt) = ctx.expr_stmt.get(&expr) else { return false };
    let mut found = false;
    ctx.kernel.visit(|stack, id| {
        if id == stmt && stack.iter().any(|&s| matches!(ctx.kernel.node(s), KirNode::IfThenElse { .. })) {
            found = true;
        }
    });
    found
}

pub fn run(ctx: &mut LowerCtx<'_>) -> Result<()> {
    for tv in ctx.fusion.tensor_ids().collect::<Vec<_>>() {
        if ctx.fusion.tensor(tv).memory != MemoryType::Shared {
            continue;
        }
        let val = ctx.fusion.tensor(tv).val;
        let Some(writer) = ctx.fusion.definition(val) else { continue };
        let writers = thread_bitmap(ctx.fusion, tv);

        for reader in ctx.fusion.uses(val).to_vec() {
            let Some(reader_tv) =
                ctx.fusion.expr(reader).outputs.iter().find_map(|&v| ctx.fusion.val(v).as_tensor())
            else {
                continue;
            };
            let readers = thread_bitmap(ctx.fusion, reader_tv);
            if writers == readers && !writers.is_empty() {
                // Same thread covers write and read; RAW stays in-thread.
                continue;
            }
            if writers.is_empty() && readers.is_empty() {
                // Exclusively-redundant single-thread traffic needs no sync.
                continue;
            }
            let Some(&reader_stmt) = ctx.expr_stmt.get(&reader) else { continue };
            let scope = ctx.expr_scope.get(&reader).cloned().unwrap_or_default();

            let aligned = !barrier_under_predicate(ctx, reader) && !barrier_under_predicate(ctx, writer);
            let sync = ctx.kernel.push(KirNode::BlockSync { aligned, war_hazard: false });
            ctx.insert_before(&scope, reader_stmt, sync);
            trace!(%tv, aligned, "inserted block sync");
        }
    }
    Ok(())
}
