//! Tensor and scalar expressions.
//!
//! An [`Expr`] produces one or more output [`Val`]s from input [`Val`]s and
//! optionally carries read/write predicates. The kind is a plain tagged
//! variant; passes dispatch by matching on it.

use smallvec::SmallVec;

use crate::val::ValId;

crate::define_id! {
    /// Handle of an [`Expr`] inside its fusion.
    ExprId
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(strum::EnumIter)]
pub enum UnaryOp {
    Neg,
    Abs,
    Exp,
    Log,
    Sqrt,
    Rsqrt,
    Reciprocal,
    Relu,
    Sigmoid,
    Tanh,
    IsNan,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(strum::EnumIter)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Max,
    Min,
    Pow,
    And,
    Or,
    Xor,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl BinaryOp {
    /// Comparison operators produce Bool regardless of operand types.
    pub const fn is_comparison(&self) -> bool {
        matches!(self, Self::Lt | Self::Le | Self::Gt | Self::Ge | Self::Eq | Self::Ne)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TernaryOp {
    Where,
    Clamp,
    Lerp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReductionOpType {
    Add,
    Mul,
    Max,
    Min,
}

impl ReductionOpType {
    /// Identity element used when initializing the accumulator.
    pub fn init(&self, dtype: kiln_dtype::DType) -> crate::val::ScalarValue {
        use crate::val::ScalarValue;
        let float = dtype.is_floating_point() || dtype.is_complex();
        match self {
            Self::Add => {
                if float {
                    ScalarValue::Float(0.0)
                } else {
                    ScalarValue::Int(0)
                }
            }
            Self::Mul => {
                if float {
                    ScalarValue::Float(1.0)
                } else {
                    ScalarValue::Int(1)
                }
            }
            Self::Max => {
                if float {
                    ScalarValue::Float(f64::NEG_INFINITY)
                } else {
                    ScalarValue::Int(i64::MIN)
                }
            }
            Self::Min => {
                if float {
                    ScalarValue::Float(f64::INFINITY)
                } else {
                    ScalarValue::Int(i64::MAX)
                }
            }
        }
    }
}

/// How a cache load/store is realized in hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LoadStoreOpType {
    /// Plain register copy / global access.
    #[default]
    Set,
    /// Asynchronous global-to-shared copy. SM 8.0+.
    CpAsync,
    /// Bulk tensor-tile async copy driven by mbarriers. SM 9.0+.
    CpAsyncBulkTensorTile,
    /// Shared-to-register fragment load for MMA. SM 7.5+.
    LdMatrix,
    /// Register-to-shared fragment store. SM 9.0+.
    StMatrix,
}

impl LoadStoreOpType {
    /// Minimum SM major version, if the op is gated on hardware.
    pub const fn min_sm_major(&self) -> Option<u32> {
        match self {
            Self::Set => None,
            Self::LdMatrix => Some(7),
            Self::CpAsync => Some(8),
            Self::CpAsyncBulkTensorTile | Self::StMatrix => Some(9),
        }
    }

    /// `cp.async` variants zero-fill out-of-bounds lanes themselves, so the
    /// lowered kernel must not emit an explicit init for their destination.
    pub const fn is_implicitly_initialized(&self) -> bool {
        matches!(self, Self::CpAsync | Self::CpAsyncBulkTensorTile)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RNGOpType {
    Uniform,
    Normal,
}

/// Which operand dimension an MMA input contributes (set by the matmul
/// scheduler from allocation contiguity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MmaUnitDim {
    K,
    MN,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Unary { op: UnaryOp },
    Binary { op: BinaryOp },
    Ternary { op: TernaryOp },
    Cast,
    BitCast,

    /// Reduce `axes` of the input with `op`. The init value is the op
    /// identity unless overridden by rFactor.
    Reduction { op: ReductionOpType, axes: SmallVec<[usize; 2]> },

    /// Streaming mean-and-variance. Outputs (avg, var·n, n).
    Welford { axes: SmallVec<[usize; 2]> },

    /// Insert broadcast domains where `is_broadcast_dim` is true.
    Broadcast { is_broadcast_dim: SmallVec<[bool; 8]> },

    /// Remove broadcast domains where `is_squeeze_dim` is true.
    Squeeze { is_squeeze_dim: SmallVec<[bool; 8]> },

    /// Reshape: output root mirrors the input logical domain, output logical
    /// is derived from it by the view transform DAG.
    Reshape,

    /// Dimension permutation; axes are reordered, not transformed.
    Permute { perm: SmallVec<[usize; 8]> },

    /// Slice: per-dim resize of the input window.
    Slice { left: SmallVec<[i64; 4]>, right: SmallVec<[i64; 4]> },

    /// Pointwise copy between memory locations, possibly hardware-assisted.
    LoadStore { op: LoadStoreOpType },

    Matmul,
    Linear,
    Mma { a_unit: MmaUnitDim, b_unit: MmaUnitDim },

    /// Scaled dot-product attention, opaque to every scheduler but ExprEval.
    Sdpa,

    /// Philox-style RNG fill. Always predicated during lowering so an
    /// out-of-bounds thread does not advance its state.
    Rng { op: RNGOpType, seed: ValId, offset: ValId },

    /// Materialize a constant-filled tensor.
    Full { fill: ValId },

    /// Inter-device resharding marker; single-device schedulers reject it.
    Reshard,
}

/// An expression node. Inputs and outputs are vals of the owning fusion.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub inputs: SmallVec<[ValId; 4]>,
    pub outputs: SmallVec<[ValId; 2]>,
    /// Guard evaluated before any read this expression performs.
    pub read_predicate: Option<ValId>,
    /// Guard evaluated before the output write.
    pub write_predicate: Option<ValId>,
}

impl Expr {
    pub fn new(kind: ExprKind, inputs: SmallVec<[ValId; 4]>, outputs: SmallVec<[ValId; 2]>) -> Self {
        Self { kind, inputs, outputs, read_predicate: None, write_predicate: None }
    }

    pub fn is_reduction(&self) -> bool {
        matches!(self.kind, ExprKind::Reduction { .. } | ExprKind::Welford { .. })
    }

    pub fn is_matmul_family(&self) -> bool {
        matches!(self.kind, ExprKind::Matmul | ExprKind::Linear | ExprKind::Mma { .. })
    }
}
