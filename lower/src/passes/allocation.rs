//! Allocation placement.
//!
//! Every tensor that owns storage gets a `kir::Allocate` at the innermost
//! loop outside its compute-at position. Unswitched shared-memory tensors
//! hoist above the unswitch loop; circular-buffered tensors allocate outside
//! the buffered axis with their size multiplied by the stage count. Shared
//! allocations receive 16-byte-aligned arena offsets, bounded by the device
//! opt-in limit.

use kiln_dtype::DType;
use kiln_ir::{KirNode, MemoryType, ParallelType, TensorViewId, ValId};
use tracing::trace;

use crate::LowerCtx;
use crate::error::{Error, Result};

const SHARED_ALIGN: u64 = 16;

fn needs_allocation(ctx: &LowerCtx<'_>, tv: TensorViewId) -> bool {
    if ctx.fusion.is_input(tv) || ctx.fusion.is_output(tv) {
        return false;
    }
    ctx.fusion.definition(ctx.fusion.tensor(tv).val).is_some()
}

/// Storage elements of one tensor from `alloc_pos` inward: the product of
/// extents of axes the memory class does not parallelize away.
fn allocation_size(ctx: &mut LowerCtx<'_>, tv: TensorViewId, alloc_pos: usize) -> ValId {
    let loop_ = ctx.fusion.tensor(tv).domain.loop_.clone();
    let memory = ctx.fusion.tensor(tv).memory;
    let mut size: Option<ValId> = None;
    for &id in loop_.iter().skip(alloc_pos) {
        let domain = ctx.fusion.iter_domain(id);
        if domain.is_broadcast() || domain.is_reduction() {
            continue;
        }
        let stored = match memory {
            MemoryType::Local => !domain.parallel.is_thread_dim() && !domain.parallel.is_block_dim(),
            MemoryType::Shared | MemoryType::Tensor => !domain.parallel.is_block_dim(),
            MemoryType::Global => true,
        };
        if !stored {
            continue;
        }
        let extent = domain.extent;
        size = Some(match size {
            None => extent,
            Some(prev) => ctx.fusion.smul(prev, extent),
        });
    }
    size.unwrap_or_else(|| ctx.fusion.one())
}

fn allocation_position(ctx: &LowerCtx<'_>, tv: TensorViewId) -> usize {
    let tensor = ctx.fusion.tensor(tv);
    let mut pos = tensor.compute_at_pos.min(tensor.domain.loop_.len());

    // A circular buffer rotates across the axis right outside the inlined
    // region; its storage must sit outside that axis.
    if tensor.is_circular_buffered() {
        pos = pos.saturating_sub(1);
    }

    // Shared memory may not be allocated inside an unswitched loop: the
    // unswitch duplicates the body, and both copies must see one buffer.
    if matches!(tensor.memory, MemoryType::Shared | MemoryType::Tensor) {
        if let Some(unswitch) = tensor
            .domain
            .loop_
            .iter()
            .position(|&id| ctx.fusion.iter_domain(id).parallel == ParallelType::Unswitch)
        {
            pos = pos.min(unswitch);
        }
    }
    pos
}

pub fn run(ctx: &mut LowerCtx<'_>) -> Result<()> {
    let mut shared_offset: u64 = 0;

    for tv in ctx.fusion.tensor_ids().collect::<Vec<_>>() {
        if !needs_allocation(ctx, tv) {
            continue;
        }
        let def = ctx.fusion.definition(ctx.fusion.tensor(tv).val).expect("checked by needs_allocation");
        let Some(&expr_node) = ctx.expr_node.get(&def) else { continue };
        let scope = ctx.expr_scope.get(&def).cloned().unwrap_or_default();

        let alloc_pos = allocation_position(ctx, tv);
        // Storage covers the inlined region; hoisting the Allocate node
        // (for unswitch or circular buffering) does not grow it.
        let size_from = ctx.fusion.tensor(tv).compute_at_pos.min(ctx.fusion.tensor(tv).domain.loop_.len());
        let mut size = allocation_size(ctx, tv, size_from);
        if let Some(depth) = ctx.fusion.tensor(tv).circular_buffer_depth {
            let depth_val = ctx.fusion.new_literal(DType::Index, depth as i64);
            size = ctx.fusion.smul(size, depth_val);
        }

        let memory = ctx.fusion.tensor(tv).memory;
        let address = if matches!(memory, MemoryType::Shared | MemoryType::Tensor) {
            let bytes = evaluated_bytes(ctx, tv, size);
            let address = ctx.fusion.new_named_symbol(DType::Index, format!("smem_{}", tv.index()));
            shared_offset = shared_offset.next_multiple_of(SHARED_ALIGN) + bytes;
            Some(address)
        } else {
            None
        };

        let node = ctx.kernel.push(KirNode::Allocate {
            tv,
            memory,
            size,
            alias_of: None,
            zero_init: false,
            resets_to_zero: false,
            address,
            write_redundancy: Default::default(),
        });

        // Place at the innermost loop outside the compute-at position.
        let scope_prefix = &scope[..alloc_pos.min(scope.len())];
        let target = scope.get(alloc_pos).copied().unwrap_or(expr_node);
        ctx.insert_before(scope_prefix, target, node);
        ctx.alloc_node.insert(tv, node);
        trace!(%tv, alloc_pos, "placed allocation");
    }

    let shared_total = shared_offset.next_multiple_of(SHARED_ALIGN);
    let limit = ctx.info.device.max_shared_bytes_optin;
    if shared_total > limit {
        return Err(Error::SharedMemoryOverflow { required: shared_total, limit });
    }
    ctx.kernel.summary.shared_bytes = shared_total;
    Ok(())
}

fn evaluated_bytes(ctx: &mut LowerCtx<'_>, tv: TensorViewId, size: ValId) -> u64 {
    let elsize = ctx.fusion.tensor(tv).dtype.bytes() as u64;
    ctx.info
        .evaluator_mut()
        .evaluate_int(ctx.fusion, size)
        .map(|elems| elems.unsigned_abs() * elsize)
        .unwrap_or(0)
}
