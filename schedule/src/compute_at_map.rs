//! Disjoint-set graph over iteration domains.
//!
//! The [`ComputeAtMap`] records which axes of different tensors correspond,
//! under three progressively looser equivalences:
//!
//! - **Exact**: extent and transform history are structurally identical.
//! - **Permissive**: exact, plus a broadcast axis maps with any axis it could
//!   broadcast to.
//! - **Loop**: axes sharing a physical loop after inlining.
//!
//! Mappings are seeded pairwise between each producer's logical domain and
//! its consumer's root domain, then propagated forward through structurally
//! identical transforms, so reshaped tensors stay connected.

use std::collections::HashMap;

use itertools::Itertools;

use kiln_ir::{ExprKind, Fusion, IdExprKind, IterDomainId, TensorViewId};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingMode {
    Exact,
    Permissive,
    Loop,
}

/// How a broadcast axis resolves downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastConcretization {
    /// Reduced away without ever being materialized; no parallel broadcast
    /// instruction is needed.
    NonConcretized,
    /// All concretizing extents are provably equal.
    Unique,
    /// Mismatched concrete extents; writes through the axis must be
    /// predicated per consumer, or the fusion rejected.
    NonUnique,
}

/// Union-find keyed by iteration-domain handle. Queries are non-mutating
/// (no path compression), which keeps `are_mapped` callable on `&self`.
#[derive(Debug, Default, Clone)]
struct DisjointSets {
    parent: HashMap<IterDomainId, IterDomainId>,
}

impl DisjointSets {
    fn find(&self, mut id: IterDomainId) -> IterDomainId {
        while let Some(&parent) = self.parent.get(&id) {
            if parent == id {
                break;
            }
            id = parent;
        }
        id
    }

    fn join(&mut self, a: IterDomainId, b: IterDomainId) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent.insert(ra.max(rb), ra.min(rb));
        }
    }

    fn mapped(&self, a: IterDomainId, b: IterDomainId) -> bool {
        a == b || self.find(a) == self.find(b)
    }

    /// Every id recorded in the structure that shares `id`'s set.
    fn set_of(&self, id: IterDomainId) -> Vec<IterDomainId> {
        let root = self.find(id);
        let mut out: Vec<_> = self.parent.keys().copied().filter(|&other| self.find(other) == root).collect();
        for extra in [id, root] {
            if !out.contains(&extra) {
                out.push(extra);
            }
        }
        out.sort();
        out
    }
}

#[derive(Debug, Clone)]
pub struct ComputeAtMap {
    exact: DisjointSets,
    permissive: DisjointSets,
    loop_: DisjointSets,
}

impl ComputeAtMap {
    /// Build the graph, rejecting fusions where two distinct axes of the same
    /// tensor land in one exact set.
    pub fn build(fusion: &Fusion) -> Result<Self> {
        let map = Self::build_permitting_self_mapping(fusion);
        if let Some((tv, a, b)) = map.find_self_mapping(fusion) {
            return Err(Error::SelfMapping { tv, a, b });
        }
        Ok(map)
    }

    pub fn build_permitting_self_mapping(fusion: &Fusion) -> Self {
        let mut exact = DisjointSets::default();
        let mut permissive = DisjointSets::default();

        // Seed: pairwise producer-logical to consumer-root correspondence.
        for expr_id in fusion.topo_exprs() {
            for (producer_id, consumer_id) in pairwise_map(fusion, expr_id) {
                let p_bcast = fusion.iter_domain(producer_id).is_broadcast();
                let c_bcast = fusion.iter_domain(consumer_id).is_broadcast();
                if p_bcast == c_bcast {
                    exact.join(producer_id, consumer_id);
                }
                permissive.join(producer_id, consumer_id);
            }
        }

        // Propagate through structurally identical transforms to fixpoint:
        // if the inputs of two id-exprs are mapped and the transforms agree,
        // their outputs are mapped too.
        let id_exprs: Vec<_> = fusion.id_exprs().cloned().collect();
        loop {
            let mut changed = false;
            for (lhs, rhs) in id_exprs.iter().tuple_combinations() {
                if lhs.inputs.len() != rhs.inputs.len() || lhs.outputs.len() != rhs.outputs.len() {
                    continue;
                }
                if !kinds_structurally_equal(fusion, &lhs.kind, &rhs.kind) {
                    continue;
                }
                let exact_inputs = lhs.inputs.iter().zip(&rhs.inputs).all(|(&a, &b)| exact.mapped(a, b));
                let permissive_inputs =
                    lhs.inputs.iter().zip(&rhs.inputs).all(|(&a, &b)| permissive.mapped(a, b));
                if exact_inputs {
                    for (&a, &b) in lhs.outputs.iter().zip(&rhs.outputs) {
                        if !exact.mapped(a, b) {
                            exact.join(a, b);
                            changed = true;
                        }
                    }
                }
                if permissive_inputs {
                    for (&a, &b) in lhs.outputs.iter().zip(&rhs.outputs) {
                        if !permissive.mapped(a, b) {
                            permissive.join(a, b);
                            changed = true;
                        }
                    }
                }
            }
            if !changed {
                break;
            }
        }

        // Loop sets: positions above the compute-at point share the physical
        // loop with each consumer.
        let mut loop_ = DisjointSets::default();
        for tv in fusion.tensor_ids() {
            let pos = fusion.tensor(tv).compute_at_pos;
            if pos == 0 {
                continue;
            }
            let producer_loop = fusion.tensor(tv).domain.loop_.clone();
            for consumer in fusion.consumers_of(tv) {
                let consumer_loop = &fusion.tensor(consumer).domain.loop_;
                for i in 0..pos.min(producer_loop.len()).min(consumer_loop.len()) {
                    loop_.join(producer_loop[i], consumer_loop[i]);
                }
            }
        }

        Self { exact, permissive, loop_ }
    }

    pub fn are_mapped(&self, a: IterDomainId, b: IterDomainId, mode: MappingMode) -> bool {
        match mode {
            MappingMode::Exact => self.exact.mapped(a, b),
            MappingMode::Permissive => self.permissive.mapped(a, b) || self.exact.mapped(a, b),
            MappingMode::Loop => self.loop_.mapped(a, b),
        }
    }

    pub fn mapped_set(&self, id: IterDomainId, mode: MappingMode) -> Vec<IterDomainId> {
        match mode {
            MappingMode::Exact => self.exact.set_of(id),
            MappingMode::Permissive => self.permissive.set_of(id),
            MappingMode::Loop => self.loop_.set_of(id),
        }
    }

    /// First self-mapped pair among the designated domains of any tensor.
    pub fn find_self_mapping(&self, fusion: &Fusion) -> Option<(TensorViewId, IterDomainId, IterDomainId)> {
        for tv in fusion.tensor_ids() {
            let domain = &fusion.tensor(tv).domain;
            let mut ids: Vec<IterDomainId> = Vec::new();
            for list in [&domain.root, &domain.logical, &domain.allocation, &domain.loop_] {
                for &id in list {
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
            }
            for (i, &a) in ids.iter().enumerate() {
                for &b in &ids[i + 1..] {
                    if self.exact.mapped(a, b) {
                        return Some((tv, a, b));
                    }
                }
            }
        }
        None
    }

    /// Resolve how a broadcast axis concretizes across the fusion.
    ///
    /// Equality of two concretizing extents is proven either by the exact
    /// graph or by matching literal extents; anything else is treated as
    /// mismatched.
    pub fn concretization(&self, fusion: &Fusion, broadcast: IterDomainId) -> BroadcastConcretization {
        debug_assert!(fusion.iter_domain(broadcast).is_broadcast());
        let concrete: Vec<IterDomainId> = self
            .permissive
            .set_of(broadcast)
            .into_iter()
            .filter(|&id| !fusion.iter_domain(id).is_broadcast())
            .collect();
        if concrete.is_empty() {
            return BroadcastConcretization::NonConcretized;
        }
        let first = concrete[0];
        let all_equal = concrete[1..].iter().all(|&other| {
            self.exact.mapped(first, other)
                || match (fusion.constant_extent(first), fusion.constant_extent(other)) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                }
        });
        if all_equal { BroadcastConcretization::Unique } else { BroadcastConcretization::NonUnique }
    }

    pub fn is_concretized(&self, fusion: &Fusion, broadcast: IterDomainId) -> bool {
        self.concretization(fusion, broadcast) != BroadcastConcretization::NonConcretized
    }

    pub fn is_uniquely_concretized(&self, fusion: &Fusion, broadcast: IterDomainId) -> bool {
        self.concretization(fusion, broadcast) == BroadcastConcretization::Unique
    }
}

fn kinds_structurally_equal(fusion: &Fusion, lhs: &IdExprKind, rhs: &IdExprKind) -> bool {
    match (lhs, rhs) {
        (
            IdExprKind::Split { factor: fa, inner_split: ia, .. },
            IdExprKind::Split { factor: fb, inner_split: ib, .. },
        ) => {
            ia == ib
                && (fa == fb
                    || matches!(
                        (fusion.constant_of(*fa), fusion.constant_of(*fb)),
                        (Some(a), Some(b)) if a == b
                    ))
        }
        (IdExprKind::Merge, IdExprKind::Merge) => true,
        (
            IdExprKind::Swizzle2D { swizzle: sa, mode: ma },
            IdExprKind::Swizzle2D { swizzle: sb, mode: mb },
        ) => sa == sb && ma == mb,
        (IdExprKind::Resize { left: la, right: ra }, IdExprKind::Resize { left: lb, right: rb }) => {
            la == lb && ra == rb
        }
        _ => false,
    }
}

/// Producer/consumer axis correspondence introduced by one expression.
fn pairwise_map(fusion: &Fusion, expr_id: kiln_ir::ExprId) -> Vec<(IterDomainId, IterDomainId)> {
    let expr = fusion.expr(expr_id);
    let mut pairs = Vec::new();

    let producer_tvs: Vec<TensorViewId> =
        expr.inputs.iter().filter_map(|&v| fusion.val(v).as_tensor()).collect();
    let consumer_tvs: Vec<TensorViewId> =
        expr.outputs.iter().filter_map(|&v| fusion.val(v).as_tensor()).collect();

    for &consumer in &consumer_tvs {
        let c_root = fusion.tensor(consumer).domain.root.clone();
        match &expr.kind {
            // Opaque ops introduce no axis correspondence.
            ExprKind::Sdpa | ExprKind::Reshard => {}

            ExprKind::Broadcast { is_broadcast_dim } => {
                let producer = producer_tvs[0];
                let p_logical = fusion.consumer_visible_logical(producer);
                let mut p_iter = p_logical.iter();
                for (&flag, &c_id) in is_broadcast_dim.iter().zip(&c_root) {
                    if !flag {
                        if let Some(&p_id) = p_iter.next() {
                            pairs.push((p_id, c_id));
                        }
                    }
                }
            }

            ExprKind::Squeeze { is_squeeze_dim } => {
                let producer = producer_tvs[0];
                let p_logical = fusion.consumer_visible_logical(producer);
                let kept = p_logical.iter().zip(is_squeeze_dim).filter(|(_, &flag)| !flag).map(|(&id, _)| id);
                for (p_id, &c_id) in kept.zip(&c_root) {
                    pairs.push((p_id, c_id));
                }
            }

            ExprKind::Matmul => {
                let (a, b) = (producer_tvs[0], producer_tvs[1]);
                let a_ids = fusion.consumer_visible_logical(a);
                let b_ids = fusion.consumer_visible_logical(b);
                // out root is [M, N, K-reduction].
                pairs.push((a_ids[0], c_root[0]));
                pairs.push((a_ids[1], c_root[2]));
                pairs.push((b_ids[0], c_root[2]));
                pairs.push((b_ids[1], c_root[1]));
            }

            ExprKind::Linear => {
                let (x, w) = (producer_tvs[0], producer_tvs[1]);
                let x_ids = fusion.consumer_visible_logical(x);
                let w_ids = fusion.consumer_visible_logical(w);
                let n_pos = c_root.len() - 2;
                let k_pos = c_root.len() - 1;
                for (i, &x_id) in x_ids[..x_ids.len() - 1].iter().enumerate() {
                    pairs.push((x_id, c_root[i]));
                }
                pairs.push((*x_ids.last().expect("linear input is non-empty"), c_root[k_pos]));
                pairs.push((w_ids[0], c_root[n_pos]));
                pairs.push((w_ids[1], c_root[k_pos]));
                if let Some(&bias) = producer_tvs.get(2) {
                    let bias_ids = fusion.consumer_visible_logical(bias);
                    pairs.push((bias_ids[0], c_root[n_pos]));
                }
            }

            // Everything else pairs positionally: the consumer root was
            // minted by mirroring the producers' visible logical domains.
            // When the consumer still carries reduction axes a cache copy
            // skipped, pair against its iteration axes only.
            _ => {
                for &producer in &producer_tvs {
                    let p_logical = fusion.consumer_visible_logical(producer);
                    let c_ids: Vec<IterDomainId> = if p_logical.len() == c_root.len() {
                        c_root.clone()
                    } else {
                        c_root.iter().copied().filter(|&id| !fusion.iter_domain(id).is_reduction()).collect()
                    };
                    for (&p_id, &c_id) in p_logical.iter().zip(&c_ids) {
                        pairs.push((p_id, c_id));
                    }
                }
            }
        }
    }
    pairs
}
