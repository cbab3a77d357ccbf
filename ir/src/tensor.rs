//! Tensor domains and views.

use std::collections::HashSet;

use crate::fusion::Fusion;
use crate::iter_domain::IterDomainId;
use crate::val::ValId;

crate::define_id! {
    /// Handle of a [`TensorView`] inside its fusion.
    TensorViewId
}

/// Where a tensor's storage lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemoryType {
    #[default]
    Global,
    Shared,
    Local,
    /// Tensor-memory (Hopper TMA-addressable) storage.
    Tensor,
}

/// The four designated ID lists of a tensor.
///
/// `root` is the pre-reshape domain, `logical` the user-visible shape,
/// `allocation` the physical layout, `loop` the schedule's nest. The lists
/// are decoupled: each must merely be a valid end state of the transform DAG
/// rooted at the root domain. [`validate_equivalence`] checks exactly that.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TensorDomain {
    pub root: Vec<IterDomainId>,
    pub logical: Vec<IterDomainId>,
    pub allocation: Vec<IterDomainId>,
    pub loop_: Vec<IterDomainId>,
    /// One entry per allocation ID that iterates memory (broadcast and stride
    /// axes are skipped). `Some(true)`: contiguous with its neighbor;
    /// `Some(false)`: strided; `None`: unknown.
    pub contiguity: Vec<Option<bool>>,
    /// Intermediate nodes of the transform DAG that no designated list
    /// currently contains.
    pub additional: Vec<IterDomainId>,
}

impl TensorDomain {
    /// A fresh domain where all four lists coincide.
    pub fn from_root(root: Vec<IterDomainId>, contiguity: Vec<Option<bool>>) -> Self {
        Self {
            logical: root.clone(),
            allocation: root.clone(),
            loop_: root.clone(),
            root,
            contiguity,
            additional: Vec::new(),
        }
    }

    pub fn rank(&self) -> usize {
        self.logical.len()
    }
}

/// A tensor: domain, element type, storage class, and inlining position.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorView {
    pub domain: TensorDomain,
    pub dtype: kiln_dtype::DType,
    pub memory: MemoryType,
    /// Requested circular-buffering depth (2 = double buffering).
    pub circular_buffer_depth: Option<usize>,
    /// Loop depth at which this tensor is computed inside its consumer.
    pub compute_at_pos: usize,
    /// The val this view backs.
    pub val: ValId,
}

impl TensorView {
    pub fn rank(&self) -> usize {
        self.domain.rank()
    }

    pub fn is_circular_buffered(&self) -> bool {
        self.circular_buffer_depth.map(|d| d >= 2).unwrap_or(false)
    }

    pub fn has_reduction(&self, fusion: &Fusion) -> bool {
        self.domain.logical.iter().any(|&id| fusion.iter_domain(id).is_reduction())
    }
}

/// Transitive closure of the transform DAG from a seed set, walking IdExprs
/// both forward and backward.
fn transform_closure(fusion: &Fusion, seed: &[IterDomainId]) -> HashSet<IterDomainId> {
    let mut known: HashSet<IterDomainId> = seed.iter().copied().collect();
    loop {
        let mut changed = false;
        for id_expr in fusion.id_exprs() {
            let forward = id_expr.inputs.iter().all(|i| known.contains(i));
            let backward = id_expr.outputs.iter().all(|o| known.contains(o));
            if forward {
                for o in &id_expr.outputs {
                    changed |= known.insert(*o);
                }
            }
            if backward {
                for i in &id_expr.inputs {
                    changed |= known.insert(*i);
                }
            }
        }
        if !changed {
            return known;
        }
    }
}

/// Check that `d1` is reachable from `d0` (and vice versa) through the
/// transform DAG, ignoring broadcast placeholders, which may be introduced or
/// dropped freely between designated domains.
pub fn domains_equivalent(fusion: &Fusion, d0: &[IterDomainId], d1: &[IterDomainId]) -> bool {
    let covers = |from: &[IterDomainId], to: &[IterDomainId]| {
        let closure = transform_closure(fusion, from);
        to.iter().all(|&id| closure.contains(&id) || fusion.iter_domain(id).is_broadcast())
    };
    covers(d0, d1) && covers(d1, d0)
}

/// Validate the pairwise equivalence of all four designated domains of `tv`.
pub fn validate_equivalence(fusion: &Fusion, tv: TensorViewId) -> crate::Result<()> {
    let domain = &fusion.tensor(tv).domain;
    let named: [(&'static str, &[IterDomainId]); 4] = [
        ("root", &domain.root),
        ("logical", &domain.logical),
        ("allocation", &domain.allocation),
        ("loop", &domain.loop_),
    ];
    for (i, (lhs_name, lhs)) in named.iter().enumerate() {
        for (rhs_name, rhs) in named.iter().skip(i + 1) {
            if !domains_equivalent(fusion, lhs, rhs) {
                return Err(crate::Error::DomainsNotEquivalent { tv, lhs: lhs_name, rhs: rhs_name });
            }
        }
    }
    Ok(())
}

/// Extent values of a designated domain list, skipping reduction axes.
pub fn iteration_extents(fusion: &Fusion, ids: &[IterDomainId]) -> Vec<ValId> {
    ids.iter().filter(|&&id| !fusion.iter_domain(id).is_reduction()).map(|&id| fusion.iter_domain(id).extent).collect()
}
