//! Kernel IR.
//!
//! The lowered form of a fusion: an explicit loop nest with allocations,
//! predicates, and synchronization. Nodes live in an arena owned by the
//! [`Kernel`]; compute expressions are carried by reference back into the
//! fusion rather than re-encoded.

use smallvec::SmallVec;

use kiln_dtype::DType;

use crate::expr::ExprId;
use crate::iter_domain::{IterDomainId, ParallelTypeBitmap};
use crate::tensor::{MemoryType, TensorViewId};
use crate::val::ValId;

crate::define_id! {
    /// Handle of a [`KirNode`] inside its kernel.
    KirId
}

/// A check evaluated once at kernel entry, before any loop runs.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryCheck {
    pub predicate: ValId,
    pub kind: EntryCheckKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryCheckKind {
    /// A vectorized non-divisible split: `ceilDiv(extent, outer) % width == 0`.
    VectorizationStride { tv: TensorViewId, width: usize },
    /// The base pointer of a vectorized input/output must be width-aligned.
    PointerAlignment { tv: TensorViewId, width: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub enum KirNode {
    ForLoop {
        iter_domain: IterDomainId,
        index: ValId,
        body: Vec<KirId>,
    },

    IfThenElse {
        predicate: ValId,
        then_body: Vec<KirId>,
        else_body: Vec<KirId>,
    },

    Allocate {
        tv: TensorViewId,
        memory: MemoryType,
        /// Element count, already multiplied by circular-buffer depth.
        size: ValId,
        /// Storage shared with an earlier allocation of disjoint lifetime.
        alias_of: Option<KirId>,
        zero_init: bool,
        resets_to_zero: bool,
        /// Shared-memory arena offset symbol, assigned late.
        address: Option<ValId>,
        /// Parallel dims on which the writing thread is redundant.
        write_redundancy: ParallelTypeBitmap,
    },

    BlockSync {
        aligned: bool,
        war_hazard: bool,
    },

    GridSync {
        bitmap: ParallelTypeBitmap,
        sync_buffer: ValId,
    },

    /// Serialized-grid entry/exit pair wrapped around grid reductions.
    GridSerializeWait {
        bitmap: ParallelTypeBitmap,
        sync_buffer: ValId,
    },
    GridSerializeRelease {
        bitmap: ParallelTypeBitmap,
        sync_buffer: ValId,
    },

    /// A view together with its flattened index expression.
    TensorIndex {
        tv: TensorViewId,
        index: ValId,
    },

    /// A fusion expression placed in the nest; `indices` point at the
    /// [`KirNode::TensorIndex`] of each tensor operand, outputs first.
    Expr {
        hir: ExprId,
        indices: SmallVec<[KirId; 4]>,
    },

    MBarrierInit {
        barrier: ValId,
        expect_count: ValId,
    },
    MBarrierArrive {
        barrier: ValId,
        stage: usize,
    },
    MBarrierWait {
        barrier: ValId,
        stage: usize,
    },
    MBarrierInvalidate {
        barrier: ValId,
    },

    GridReduction {
        hir: ExprId,
        bitmap: ParallelTypeBitmap,
        sync_buffer: ValId,
    },
    GridBroadcast {
        hir: ExprId,
        bitmap: ParallelTypeBitmap,
        sync_buffer: ValId,
    },
    VectorizedWelford {
        hir: ExprId,
        width: usize,
    },
}

impl KirNode {
    /// Nested statement lists, for generic traversal.
    pub fn bodies(&self) -> SmallVec<[&Vec<KirId>; 2]> {
        match self {
            Self::ForLoop { body, .. } => SmallVec::from_slice(&[body]),
            Self::IfThenElse { then_body, else_body, .. } => SmallVec::from_slice(&[then_body, else_body]),
            _ => SmallVec::new(),
        }
    }

    pub fn bodies_mut(&mut self) -> SmallVec<[&mut Vec<KirId>; 2]> {
        let mut out = SmallVec::new();
        match self {
            Self::ForLoop { body, .. } => out.push(body),
            Self::IfThenElse { then_body, else_body, .. } => {
                out.push(then_body);
                out.push(else_body);
            }
            _ => {}
        }
        out
    }

    pub fn is_sync(&self) -> bool {
        matches!(self, Self::BlockSync { .. } | Self::GridSync { .. })
    }
}

/// Facts about the lowered kernel the launcher and emitter need.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelSummary {
    pub index_type: DType,
    pub entry_checks: Vec<EntryCheck>,
    /// Static shared-memory bytes (16-byte-aligned arena offsets).
    pub shared_bytes: u64,
    pub grid_sync_buffer_bytes: u64,
    pub has_grid_reduction: bool,
    pub uses_magic_zero: bool,
    /// Set when the register-pressure model decided to spill persistent
    /// buffers; the emitter forwards this as a warning.
    pub register_spill_expected: bool,
}

impl Default for KernelSummary {
    fn default() -> Self {
        Self {
            index_type: DType::Index,
            entry_checks: Vec::new(),
            shared_bytes: 0,
            grid_sync_buffer_bytes: 0,
            has_grid_reduction: false,
            uses_magic_zero: false,
            register_spill_expected: false,
        }
    }
}

/// The lowered kernel: an arena of [`KirNode`]s plus the top-level statement
/// list and the launch summary.
#[derive(Debug, Default)]
pub struct Kernel {
    nodes: Vec<KirNode>,
    pub top_level: Vec<KirId>,
    pub summary: KernelSummary,
}

impl Kernel {
    pub fn new() -> Self {
        Self { nodes: Vec::new(), top_level: Vec::new(), summary: KernelSummary::default() }
    }

    pub fn push(&mut self, node: KirNode) -> KirId {
        self.nodes.push(node);
        KirId::new(self.nodes.len() - 1)
    }

    pub fn node(&self, id: KirId) -> &KirNode {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: KirId) -> &mut KirNode {
        &mut self.nodes[id.index()]
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = KirId> {
        (0..self.nodes.len()).map(KirId::new)
    }

    /// Depth-first walk of the statement tree in emission order. The visitor
    /// receives the scope stack (enclosing for-loop/ITE chain) explicitly.
    pub fn visit(&self, mut visitor: impl FnMut(&[KirId], KirId)) {
        let mut stack: Vec<KirId> = Vec::new();
        self.visit_list(&self.top_level, &mut stack, &mut visitor);
    }

    fn visit_list(&self, list: &[KirId], stack: &mut Vec<KirId>, visitor: &mut impl FnMut(&[KirId], KirId)) {
        for &id in list {
            visitor(stack, id);
            stack.push(id);
            for body in self.node(id).bodies() {
                // Clone keeps the arena borrow and the recursion untangled.
                let body = body.clone();
                self.visit_list(&body, stack, visitor);
            }
            stack.pop();
        }
    }
}
