//! Scalar data types for the kiln compiler.
//!
//! Every value in the fusion IR carries a [`DType`]. Tensors additionally
//! carry one per element; pointer and opaque values are modeled at the IR
//! layer, not here.

pub mod promote;

#[cfg(test)]
pub mod test;

pub use promote::{promote, promote_all};

use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// No common type exists in the promotion lattice.
    #[snafu(display("type promotion failed: no common type for {lhs:?} and {rhs:?}"))]
    NoCommonType { lhs: DType, rhs: DType },

    /// Unsigned types only promote through an explicit bit-cast roundtrip.
    #[snafu(display("unsigned type {dtype:?} requires an explicit bit-cast to participate in promotion"))]
    UnsignedNeedsBitCast { dtype: DType },

    /// Promotion over an empty type list.
    #[snafu(display("cannot promote an empty list of types"))]
    EmptyPromotion,
}

/// Scalar element type.
///
/// Declaration order is a topological order of the promotion lattice: a type
/// never appears before one of its promotion parents. [`promote`] relies on
/// this when picking the least common ancestor.
#[derive(Debug, Hash, PartialOrd, Ord)]
#[derive(strum::EnumCount, strum::EnumIter, strum::VariantArray)]
#[derive(enumset::EnumSetType)]
#[enumset(repr = "u16")]
pub enum DType {
    Bool = 0,

    Int32 = 1,
    Int64 = 2,

    UInt32 = 3,
    UInt64 = 4,

    Half = 5,
    BFloat16 = 6,
    Float = 7,
    Double = 8,

    ComplexFloat = 9,
    ComplexDouble = 10,

    /// Kernel index arithmetic. Concrete width (32 or 64 bit) is chosen per
    /// invocation by the runtime layer.
    Index = 11,
}

impl DType {
    /// Size of one element in bytes.
    ///
    /// `Index` reports its widest realization; the runtime may narrow it to
    /// four bytes after index-type selection.
    pub const fn bytes(&self) -> usize {
        match self {
            Self::Bool => 1,
            Self::Int32 | Self::UInt32 | Self::Float => 4,
            Self::Int64 | Self::UInt64 | Self::Double | Self::Index => 8,
            Self::Half | Self::BFloat16 => 2,
            Self::ComplexFloat => 8,
            Self::ComplexDouble => 16,
        }
    }

    pub const fn is_boolean(&self) -> bool {
        matches!(self, Self::Bool)
    }

    pub const fn is_integral(&self) -> bool {
        matches!(self, Self::Int32 | Self::Int64 | Self::UInt32 | Self::UInt64 | Self::Index)
    }

    pub const fn is_unsigned(&self) -> bool {
        matches!(self, Self::UInt32 | Self::UInt64)
    }

    pub const fn is_floating_point(&self) -> bool {
        matches!(self, Self::Half | Self::BFloat16 | Self::Float | Self::Double)
    }

    pub const fn is_complex(&self) -> bool {
        matches!(self, Self::ComplexFloat | Self::ComplexDouble)
    }

    /// Reduced-precision floats need hardware support checks (bf16 below
    /// SM 8.0 is rejected at schedule time).
    pub const fn is_reduced_precision(&self) -> bool {
        matches!(self, Self::Half | Self::BFloat16)
    }

    /// Name as it appears in generated kernel source.
    pub const fn kernel_name(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int32 => "int",
            Self::Int64 => "int64_t",
            Self::UInt32 => "unsigned int",
            Self::UInt64 => "uint64_t",
            Self::Half => "__half",
            Self::BFloat16 => "__bfloat",
            Self::Float => "float",
            Self::Double => "double",
            Self::ComplexFloat => "std::complex<float>",
            Self::ComplexDouble => "std::complex<double>",
            Self::Index => "kiln_index_t",
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
