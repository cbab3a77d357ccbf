//! Replace symbolic sizes.
//!
//! Input-tensor extents become `metadata(T).logical_size[i]` expressions so
//! the emitted kernel reads sizes straight from the launcher's tensor
//! arguments. Because mirrored domains share their extent vals, rewriting
//! the val in place also substitutes every Exact-mapped intermediate extent.

use kiln_ir::ValKind;

use crate::LowerCtx;
use crate::error::Result;

pub fn run(ctx: &mut LowerCtx<'_>) -> Result<()> {
    for tv in ctx.fusion.input_tensors() {
        let root = ctx.fusion.tensor(tv).domain.root.clone();
        for (dim, id) in root.into_iter().enumerate() {
            let extent = ctx.fusion.iter_domain(id).extent;
            let val = ctx.fusion.val_mut(extent);
            if matches!(val.kind, ValKind::Symbolic { .. }) {
                val.kind = ValKind::TensorSize { tv, dim };
            }
        }
    }
    Ok(())
}
