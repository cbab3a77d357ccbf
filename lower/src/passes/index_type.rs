//! Index-type lowering.
//!
//! Every index val minted for loops and tensor indexing is re-typed to the
//! kernel index type picked from the bound inputs (or forced by options).

use kiln_dtype::DType;
use kiln_ir::ValKind;
use kiln_runtime::IndexTypeOption;

use crate::LowerCtx;
use crate::error::{Error, Result};

pub fn run(ctx: &mut LowerCtx<'_>) -> Result<()> {
    let index_type = match ctx.options.index_type {
        IndexTypeOption::Auto => ctx.info.smallest_index_type,
        IndexTypeOption::Int64 => DType::Int64,
        IndexTypeOption::Int32 => {
            if ctx.info.smallest_index_type == DType::Int64 {
                return Err(Error::IndexTypeOverflow { max_offset: ctx.info.max_byte_offset });
            }
            DType::Int32
        }
    };
    ctx.kernel.summary.index_type = index_type;

    // Re-type the abstract Index vals: loop indices, extents, and the index
    // arithmetic derived from them.
    for val_id in ctx.fusion.val_ids().collect::<Vec<_>>() {
        let val = ctx.fusion.val_mut(val_id);
        if val.dtype == DType::Index && !matches!(val.kind, ValKind::MagicZero) {
            val.dtype = index_type;
        }
    }
    Ok(())
}
