//! Scalar and tensor-carrying values.

use kiln_dtype::DType;

use crate::expr::ExprId;
use crate::tensor::TensorViewId;

crate::define_id! {
    /// Handle of a [`Val`] inside its fusion.
    ValId
}

/// A compile-time scalar constant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarValue {
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl ScalarValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Bool(b) => Some(*b as i64),
            Self::Float(_) => None,
        }
    }

    pub fn as_float(&self) -> f64 {
        match self {
            Self::Int(v) => *v as f64,
            Self::Float(v) => *v,
            Self::Bool(b) => *b as u8 as f64,
        }
    }

    pub fn is_zero(&self) -> bool {
        match self {
            Self::Int(v) => *v == 0,
            Self::Float(v) => *v == 0.0,
            Self::Bool(b) => !*b,
        }
    }
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for ScalarValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// What a [`Val`] stands for.
#[derive(Debug, Clone, PartialEq)]
pub enum ValKind {
    /// A literal scalar. Never a fusion input.
    Literal(ScalarValue),

    /// A symbolic scalar, bound at invocation time (tensor extents, user
    /// scalars). The name is only for diagnostics and emitted source.
    Symbolic { name: Option<String> },

    /// A tensor value; the payload points at the owning view.
    Tensor(TensorViewId),

    /// `metadata(tv).logical_size[dim]` - the extent of an input tensor as
    /// seen by the kernel launcher. Substituted for symbolic extents during
    /// lowering.
    TensorSize { tv: TensorViewId, dim: usize },

    /// `metadata(tv).logical_stride[dim]`.
    TensorStride { tv: TensorViewId, dim: usize },

    /// A runtime-zero-valued symbol that defeats compiler constant folding
    /// of predicates across loop boundaries.
    MagicZero,
}

/// An IR node carrying a data type.
#[derive(Debug, Clone, PartialEq)]
pub struct Val {
    pub dtype: DType,
    pub kind: ValKind,
    /// The expression producing this value, if any.
    pub definition: Option<ExprId>,
}

impl Val {
    pub fn is_scalar(&self) -> bool {
        !matches!(self.kind, ValKind::Tensor(_))
    }

    pub fn is_literal(&self) -> bool {
        matches!(self.kind, ValKind::Literal(_))
    }

    pub fn as_tensor(&self) -> Option<TensorViewId> {
        match self.kind {
            ValKind::Tensor(tv) => Some(tv),
            _ => None,
        }
    }

    pub fn as_literal(&self) -> Option<ScalarValue> {
        match self.kind {
            ValKind::Literal(v) => Some(v),
            _ => None,
        }
    }
}
