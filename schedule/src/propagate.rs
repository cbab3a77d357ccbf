//! Spanning-tree transform propagation.
//!
//! A scheduler shapes one reference tensor, then walks every other tensor in
//! maximum-spanning-tree order of the logical-domain graph (edges weighted by
//! how many axes two tensors share) and replays the recipe on each. Walking
//! the heaviest edges first keeps the replay loss-free wherever tensors agree.

use kiln_ir::{Fusion, IterDomainId, TensorViewId};

use crate::compute_at_map::{ComputeAtMap, MappingMode};

/// Number of permissively mapped axis pairs between two logical domains.
pub fn mapped_dim_count(fusion: &Fusion, map: &ComputeAtMap, a: TensorViewId, b: TensorViewId) -> usize {
    let a_ids = fusion.tensor(a).domain.logical.clone();
    let b_ids = fusion.tensor(b).domain.logical.clone();
    a_ids
        .iter()
        .map(|&a_id| b_ids.iter().filter(|&&b_id| map.are_mapped(a_id, b_id, MappingMode::Permissive)).count())
        .sum()
}

/// Visit order for propagation: a maximum spanning tree of the tensor graph
/// grown from `reference` (Prim's algorithm; dataflow neighbors only).
pub fn spanning_order(fusion: &Fusion, map: &ComputeAtMap, reference: TensorViewId) -> Vec<TensorViewId> {
    let all: Vec<TensorViewId> = fusion.tensor_ids().collect();
    let mut in_tree = vec![false; all.len()];
    in_tree[reference.index()] = true;
    let mut order = Vec::new();

    loop {
        let mut best: Option<(usize, TensorViewId)> = None;
        for &tree_tv in std::iter::once(&reference).chain(order.iter()) {
            for next in fusion.producers_of(tree_tv).into_iter().chain(fusion.consumers_of(tree_tv)) {
                if in_tree[next.index()] {
                    continue;
                }
                let weight = mapped_dim_count(fusion, map, tree_tv, next);
                if best.map(|(w, _)| weight > w).unwrap_or(true) {
                    best = Some((weight, next));
                }
            }
        }
        match best {
            Some((_, next)) => {
                in_tree[next.index()] = true;
                order.push(next);
            }
            None => break,
        }
    }
    order
}

/// Positions of `tv`'s loop axes that correspond (permissively) to any of
/// the given reference axes.
pub fn positions_mapped_to(
    fusion: &Fusion,
    map: &ComputeAtMap,
    tv: TensorViewId,
    reference_ids: &[IterDomainId],
) -> Vec<usize> {
    fusion
        .tensor(tv)
        .domain
        .loop_
        .iter()
        .enumerate()
        .filter(|(_, &id)| {
            reference_ids.iter().any(|&ref_id| map.are_mapped(id, ref_id, MappingMode::Permissive))
        })
        .map(|(pos, _)| pos)
        .collect()
}
