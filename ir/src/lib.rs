//! Fusion IR for the kiln compiler.
//!
//! All IR nodes live in pools owned by a single [`Fusion`]; handles
//! ([`ValId`], [`ExprId`], [`IterDomainId`], [`IdExprId`], [`TensorViewId`])
//! are plain indices into those pools. Equality of nodes is handle equality,
//! and a handle is only meaningful together with the fusion that minted it.
//! There is no ambient "current fusion": every API takes the container
//! explicitly.
//!
//! # Module organization
//!
//! - [`fusion`] - the arena container, input/output registration, use-def
//! - [`expr`] - tensor and scalar expressions
//! - [`iter_domain`] - loop axes and the transform DAG over them
//! - [`tensor`] - `TensorDomain` / `TensorView`
//! - [`ops`] - operator constructors (the surface the front-end and the
//!   schedulers build fusions with)
//! - [`kir`] - the lowered kernel IR

pub mod error;
pub mod expr;
pub mod fusion;
pub mod iter_domain;
pub mod kir;
pub mod ops;
pub mod tensor;
pub mod val;

#[cfg(test)]
pub mod test;

pub use error::{Error, Result};
pub use expr::{
    BinaryOp, Expr, ExprId, ExprKind, LoadStoreOpType, MmaUnitDim, RNGOpType, ReductionOpType, TernaryOp, UnaryOp,
};
pub use fusion::{Fusion, FusionOutput, OutputAlias};
pub use kir::{EntryCheck, EntryCheckKind, Kernel, KernelSummary, KirId, KirNode};
pub use iter_domain::{
    IdExpr, IdExprId, IdExprKind, IterDomain, IterDomainId, IterType, ParallelType, ParallelTypeBitmap, Swizzle2DType,
    SwizzleMode,
};
pub use kiln_dtype::DType;
pub use tensor::{MemoryType, TensorDomain, TensorView, TensorViewId};
pub use val::{ScalarValue, Val, ValId, ValKind};

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u32);

        impl $name {
            pub(crate) fn new(index: usize) -> Self {
                Self(index as u32)
            }

            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}{}", stringify!($name).chars().next().unwrap().to_lowercase(), self.0)
            }
        }
    };
}

pub(crate) use define_id;
