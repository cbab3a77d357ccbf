//! Iteration domains and the transform DAG over them.
//!
//! An [`IterDomain`] is one loop axis. Scheduler primitives never mutate an
//! axis in place: they mint new axes connected to the old ones through
//! [`IdExpr`] nodes (split/merge/swizzle/resize), so every domain list a
//! tensor designates stays a valid end state of the same DAG.

use enumset::EnumSet;

use crate::val::ValId;

crate::define_id! {
    /// Handle of an [`IterDomain`] inside its fusion.
    IterDomainId
}

crate::define_id! {
    /// Handle of an [`IdExpr`] inside its fusion.
    IdExprId
}

/// How an axis is mapped onto the machine.
#[derive(Debug, Hash, PartialOrd, Ord)]
#[derive(strum::EnumCount, strum::EnumIter, strum::VariantArray)]
#[derive(enumset::EnumSetType)]
#[enumset(repr = "u16")]
pub enum ParallelType {
    Serial,
    BIDx,
    BIDy,
    BIDz,
    TIDx,
    TIDy,
    TIDz,
    Unroll,
    Unswitch,
    Vectorize,
    MisalignedVectorize,
    /// Grouped grid reduction lane.
    Group,
}

/// Set of parallel types, used for sync buffers and redundancy tracking.
pub type ParallelTypeBitmap = EnumSet<ParallelType>;

impl ParallelType {
    pub const fn is_thread_dim(&self) -> bool {
        matches!(self, Self::TIDx | Self::TIDy | Self::TIDz)
    }

    pub const fn is_block_dim(&self) -> bool {
        matches!(self, Self::BIDx | Self::BIDy | Self::BIDz)
    }

    /// Compile-time expanded axes never materialize as hardware loops.
    pub const fn is_compile_time_expanded(&self) -> bool {
        matches!(self, Self::Unroll | Self::Unswitch | Self::Vectorize | Self::MisalignedVectorize)
    }

    pub fn thread_dims() -> ParallelTypeBitmap {
        Self::TIDx | Self::TIDy | Self::TIDz
    }

    pub fn block_dims() -> ParallelTypeBitmap {
        Self::BIDx | Self::BIDy | Self::BIDz
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IterType {
    Iteration,
    Reduction,
    Broadcast,
    /// Not yet known to be iteration or broadcast (pre-concretization).
    Symbolic,
    Stride,
    GatherScatter,
    VectorComponent,
}

/// Bank-conflict-avoiding shared-memory swizzles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Swizzle2DType {
    ZShape,
    Xor,
    CyclicShift,
}

/// Whether a swizzle remaps only the indexing math or also loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SwizzleMode {
    Data,
    Loop,
}

/// Producer of new iteration domains.
#[derive(Debug, Clone, PartialEq)]
pub enum IdExprKind {
    /// `in -> (outer, inner)`. `inner_split` picks which output receives the
    /// factor. `divisible` is `Some(true)` when the factor statically divides
    /// the extent, `Some(false)` when it statically does not, `None` when the
    /// extent is symbolic.
    Split { factor: ValId, inner_split: bool, divisible: Option<bool> },

    /// `(outer, inner) -> out` with extent `outer_extent * inner_extent`.
    Merge,

    /// Two-axis swizzle.
    Swizzle2D { swizzle: Swizzle2DType, mode: SwizzleMode },

    /// Window change: `out_extent = left + in_extent + right`.
    Resize { left: ValId, right: ValId },
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdExpr {
    pub kind: IdExprKind,
    pub inputs: smallvec::SmallVec<[IterDomainId; 2]>,
    pub outputs: smallvec::SmallVec<[IterDomainId; 2]>,
}

/// One loop axis.
#[derive(Debug, Clone, PartialEq)]
pub struct IterDomain {
    pub start: ValId,
    pub extent: ValId,
    /// For a broadcast later expanded: the extent it expands to.
    pub expanded_extent: Option<ValId>,
    pub parallel: ParallelType,
    pub iter: IterType,
    /// Set on domains produced by rFactor.
    pub is_rfactor: bool,
    /// TIDx axes padded to a warp multiple for warp-collective ops.
    pub padded_to_warp: bool,
    /// The transform that produced this axis; `None` for root domains.
    pub definition: Option<IdExprId>,
}

impl IterDomain {
    pub fn is_broadcast(&self) -> bool {
        matches!(self.iter, IterType::Broadcast)
    }

    pub fn is_reduction(&self) -> bool {
        matches!(self.iter, IterType::Reduction)
    }

    /// Broadcast and stride axes carry no contiguity flag in the allocation
    /// domain.
    pub fn has_contiguity_slot(&self) -> bool {
        !matches!(self.iter, IterType::Broadcast | IterType::Stride)
    }
}
