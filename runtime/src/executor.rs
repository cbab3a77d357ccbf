//! Output shape inference and output buffer allocation.

use kiln_dtype::DType;
use kiln_ir::{Fusion, OutputAlias, TensorViewId};
use tracing::trace;

use crate::error::{Error, Result};
use crate::info::RuntimeInfo;

/// Size/stride description of one output allocation dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputShape {
    pub tv: TensorViewId,
    pub dtype: DType,
    pub sizes: Vec<i64>,
    pub strides: Vec<i64>,
}

/// A buffer handed back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputBuffer {
    /// Freshly allocated storage, optionally NaN-filled for debugging.
    New { shape: OutputShape, bytes: i64, fill_nan: bool },
    /// The aliased input buffer, updated in place by the kernel.
    Reused { input_index: usize },
    /// Computed at output time by the expression evaluator as a view of the
    /// aliased input.
    Evaluated { input_index: usize, shape: OutputShape },
}

/// Infer size and stride of every output's allocation domain by expression
/// evaluation against the bound inputs.
///
/// Expanded broadcast dims get stride 0; zero-extent dims get stride 1;
/// everything else gets the contiguous running product.
pub fn infer_output_shapes(fusion: &Fusion, info: &mut RuntimeInfo) -> Result<Vec<OutputShape>> {
    fusion
        .output_tensors()
        .into_iter()
        .map(|tv| {
            let alloc: Vec<_> = fusion
                .tensor(tv)
                .domain
                .allocation
                .iter()
                .copied()
                .filter(|&id| !fusion.iter_domain(id).is_reduction())
                .collect();

            let mut sizes = Vec::with_capacity(alloc.len());
            let mut expanded = Vec::with_capacity(alloc.len());
            for &id in &alloc {
                let domain = fusion.iter_domain(id);
                let is_expanded = domain.expanded_extent.is_some();
                let size =
                    if domain.is_broadcast() && !is_expanded { 1 } else { info.extent_of(fusion, id)? };
                sizes.push(size);
                expanded.push(is_expanded);
            }

            let mut strides = vec![0i64; sizes.len()];
            let mut running = 1i64;
            for dim in (0..sizes.len()).rev() {
                strides[dim] = if expanded[dim] {
                    0
                } else if sizes[dim] == 0 {
                    1
                } else {
                    running
                };
                if !expanded[dim] {
                    running *= sizes[dim].max(1);
                }
            }

            trace!(?tv, ?sizes, ?strides, "inferred output shape");
            Ok(OutputShape { tv, dtype: fusion.tensor(tv).dtype, sizes, strides })
        })
        .collect()
}

/// Produce one [`OutputBuffer`] per fusion output, honoring declared aliases.
pub fn allocate_outputs(fusion: &Fusion, info: &mut RuntimeInfo, fill_nan: bool) -> Result<Vec<OutputBuffer>> {
    let shapes = infer_output_shapes(fusion, info)?;
    fusion
        .outputs()
        .iter()
        .zip(shapes)
        .map(|(output, shape)| match output.alias {
            OutputAlias::New => {
                let bytes = shape.sizes.iter().product::<i64>() * shape.dtype.bytes() as i64;
                Ok(OutputBuffer::New { shape, bytes, fill_nan })
            }
            OutputAlias::ReuseBuffer { input } => {
                let index = input_index(fusion, input).ok_or(Error::MissingAliasSource { tv: shape.tv })?;
                Ok(OutputBuffer::Reused { input_index: index })
            }
            OutputAlias::Evaluate { input } => {
                let index = input_index(fusion, input).ok_or(Error::MissingAliasSource { tv: shape.tv })?;
                Ok(OutputBuffer::Evaluated { input_index: index, shape })
            }
        })
        .collect()
}

fn input_index(fusion: &Fusion, val: kiln_ir::ValId) -> Option<usize> {
    fusion.inputs().iter().position(|&input| input == val)
}
