//! Bound-input metadata.

use std::collections::HashMap;

use kiln_dtype::DType;
use kiln_ir::{Fusion, IterDomainId, TensorViewId};
use tracing::debug;

use crate::device::DeviceCapability;
use crate::error::{Error, Result};
use crate::eval::ExpressionEvaluator;

/// Metadata of one tensor argument as the launcher sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorArg {
    pub dtype: DType,
    pub sizes: Vec<i64>,
    pub strides: Vec<i64>,
    /// Device address, used only for alignment analysis.
    pub ptr: u64,
}

impl TensorArg {
    /// A contiguous row-major tensor at a 16-byte-aligned address.
    pub fn contiguous(dtype: DType, sizes: &[i64]) -> Self {
        let mut strides = vec![1i64; sizes.len()];
        for dim in (0..sizes.len().saturating_sub(1)).rev() {
            strides[dim] = strides[dim + 1] * sizes[dim + 1];
        }
        Self { dtype, sizes: sizes.to_vec(), strides, ptr: 0 }
    }

    pub fn numel(&self) -> i64 {
        self.sizes.iter().product()
    }

    /// Largest byte offset this argument can generate, plus one element.
    fn max_byte_offset(&self) -> i64 {
        let spread: i64 = self.sizes.iter().zip(&self.strides).map(|(&s, &st)| (s - 1).max(0) * st.abs()).sum();
        (spread + 1) * self.dtype.bytes() as i64
    }

    fn contiguity(&self) -> Vec<bool> {
        let mut expected = 1i64;
        let mut out = vec![false; self.sizes.len()];
        for dim in (0..self.sizes.len()).rev() {
            out[dim] = self.strides[dim] == expected || self.sizes[dim] == 1;
            expected *= self.sizes[dim].max(1);
        }
        out
    }
}

/// Everything the schedulers may ask about one invocation's inputs.
///
/// Construction binds each input tensor's symbolic extents into the
/// evaluator, picks the smallest index type, and caches per-input alignment
/// and contiguity.
#[derive(Debug)]
pub struct RuntimeInfo {
    pub device: DeviceCapability,
    pub smallest_index_type: DType,
    pub max_byte_offset: i64,
    evaluator: ExpressionEvaluator,
    alignment: HashMap<TensorViewId, u64>,
    contiguity: HashMap<TensorViewId, Vec<bool>>,
    args: HashMap<TensorViewId, TensorArg>,
}

/// The widest vectorized access the hardware issues (float4 / 16 bytes).
pub const MAX_VECTOR_BYTES: u64 = 16;

impl RuntimeInfo {
    pub fn bind(fusion: &Fusion, args: &[TensorArg], device: DeviceCapability) -> Result<Self> {
        let input_tvs = fusion.input_tensors();
        if input_tvs.len() != args.len() {
            return Err(Error::ArgumentCountMismatch { expected: input_tvs.len(), actual: args.len() });
        }

        let mut evaluator = ExpressionEvaluator::new();
        let mut alignment = HashMap::new();
        let mut contiguity = HashMap::new();
        let mut arg_map = HashMap::new();
        let mut max_offset: i64 = 0;

        for (index, (&tv, arg)) in input_tvs.iter().zip(args).enumerate() {
            let root = fusion.tensor(tv).domain.root.clone();
            if root.len() != arg.sizes.len() {
                return Err(Error::ArgumentRankMismatch { index, tv, expected: root.len(), actual: arg.sizes.len() });
            }
            for (&id, &size) in root.iter().zip(&arg.sizes) {
                evaluator.bind(fusion.iter_domain(id).extent, size);
            }
            max_offset = max_offset.max(arg.max_byte_offset());
            alignment.insert(tv, input_alignment(arg));
            contiguity.insert(tv, arg.contiguity());
            arg_map.insert(tv, arg.clone());
        }

        // Intermediates and outputs contribute their dense footprint.
        for tv in fusion.tensor_ids() {
            if arg_map.contains_key(&tv) {
                continue;
            }
            if let Some(numel) = dense_numel(fusion, &mut evaluator, tv) {
                max_offset = max_offset.max(numel * fusion.tensor(tv).dtype.bytes() as i64);
            }
        }

        let smallest_index_type = if max_offset <= i32::MAX as i64 { DType::Int32 } else { DType::Int64 };
        debug!(max_offset, ?smallest_index_type, "bound runtime info");

        Ok(Self { device, smallest_index_type, max_byte_offset: max_offset, evaluator, alignment, contiguity, args: arg_map })
    }

    /// Largest power-of-two access size (bytes) valid for `tv`, capped at
    /// the hardware vector width.
    pub fn alignment_of(&self, tv: TensorViewId) -> u64 {
        self.alignment.get(&tv).copied().unwrap_or(MAX_VECTOR_BYTES)
    }

    pub fn ptr_of(&self, tv: TensorViewId) -> Option<u64> {
        self.args.get(&tv).map(|arg| arg.ptr)
    }

    pub fn contiguity_of(&self, tv: TensorViewId) -> Option<&[bool]> {
        self.contiguity.get(&tv).map(|v| v.as_slice())
    }

    pub fn arg_of(&self, tv: TensorViewId) -> Option<&TensorArg> {
        self.args.get(&tv)
    }

    pub fn evaluator_mut(&mut self) -> &mut ExpressionEvaluator {
        &mut self.evaluator
    }

    /// Concrete extent of an iteration domain under the current bindings.
    pub fn extent_of(&mut self, fusion: &Fusion, id: IterDomainId) -> Result<i64> {
        let domain = fusion.iter_domain(id);
        let extent = domain.expanded_extent.unwrap_or(domain.extent);
        self.evaluator.evaluate_int(fusion, extent)
    }
}

fn dense_numel(fusion: &Fusion, evaluator: &mut ExpressionEvaluator, tv: TensorViewId) -> Option<i64> {
    fusion
        .tensor(tv)
        .domain
        .logical
        .iter()
        .filter(|&&id| !fusion.iter_domain(id).is_reduction())
        .map(|&id| evaluator.evaluate_int(fusion, fusion.iter_domain(id).extent).ok())
        .try_fold(1i64, |acc, extent| extent.map(|e| acc * e))
}

/// Power-of-two alignment of an input: bounded by the pointer's address
/// alignment and by the byte strides of every discontiguous dimension.
fn input_alignment(arg: &TensorArg) -> u64 {
    let elsize = arg.dtype.bytes() as u64;
    let mut align = if arg.ptr == 0 { MAX_VECTOR_BYTES } else { 1u64 << arg.ptr.trailing_zeros().min(4) };
    let contiguity = arg.contiguity();
    for (dim, &contiguous) in contiguity.iter().enumerate() {
        if !contiguous && arg.strides[dim] != 0 {
            let stride_bytes = (arg.strides[dim].unsigned_abs()) * elsize;
            align = gcd(align, stride_bytes);
        }
    }
    // Round down to a power of two.
    let mut pow2 = 1;
    while pow2 * 2 <= align && pow2 * 2 <= MAX_VECTOR_BYTES {
        pow2 *= 2;
    }
    pow2
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 { a } else { gcd(b, a % b) }
}
