//! Vectorization feasibility analysis.

use kiln_ir::{Fusion, TensorViewId};
use kiln_runtime::RuntimeInfo;
use kiln_runtime::info::MAX_VECTOR_BYTES;

/// Whether `tv` can be accessed with vector loads at all: its innermost
/// non-broadcast allocation axis must be contiguous, and merging across a
/// discontiguous pair disables vectorization.
pub fn innermost_contiguous(fusion: &Fusion, info: &RuntimeInfo, tv: TensorViewId) -> bool {
    let domain = &fusion.tensor(tv).domain;
    let has_iteration_axis = domain
        .allocation
        .iter()
        .any(|&id| fusion.iter_domain(id).has_contiguity_slot() && !fusion.iter_domain(id).is_reduction());
    if !has_iteration_axis {
        return false;
    }
    match info.contiguity_of(tv) {
        Some(contiguity) => contiguity.last().copied().unwrap_or(false),
        // Intermediates are dense by construction.
        None => domain.contiguity.last().copied().flatten().unwrap_or(false),
    }
}

/// Largest power-of-two vector width (in elements) usable for `tv`, bounded
/// by pointer alignment and the hardware's 16-byte access size. Returns 1
/// when vectorization is not possible.
pub fn max_vector_width(fusion: &Fusion, info: &RuntimeInfo, tv: TensorViewId) -> usize {
    if !innermost_contiguous(fusion, info, tv) {
        return 1;
    }
    let elsize = fusion.tensor(tv).dtype.bytes() as u64;
    let bytes = info.alignment_of(tv).min(MAX_VECTOR_BYTES);
    (bytes / elsize).max(1) as usize
}

/// Common vector width across the fusion's vectorizable inputs and outputs,
/// further shrunk to divide a statically known innermost extent.
pub fn common_vector_width(fusion: &Fusion, info: &RuntimeInfo, io: &[TensorViewId], inner_extent: Option<i64>) -> usize {
    let mut width = io.iter().map(|&tv| max_vector_width(fusion, info, tv)).min().unwrap_or(1);
    if let Some(extent) = inner_extent {
        while width > 1 && extent % width as i64 != 0 {
            width /= 2;
        }
    }
    width.max(1)
}

/// Fusion inputs and outputs that admit vector access.
pub fn vectorizable_io(fusion: &Fusion, info: &RuntimeInfo) -> Vec<TensorViewId> {
    fusion
        .input_tensors()
        .into_iter()
        .chain(fusion.output_tensors())
        .filter(|&tv| max_vector_width(fusion, info, tv) > 1)
        .collect()
}
