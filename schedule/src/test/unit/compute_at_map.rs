use kiln_dtype::DType;
use kiln_ir::{BinaryOp, Fusion, UnaryOp};

use crate::compute_at_map::{BroadcastConcretization, ComputeAtMap, MappingMode};
use crate::test::helpers;

#[test]
fn producer_consumer_axes_are_exact_mapped() {
    let (fusion, t0, t1) = helpers::unary_fusion(2);
    let map = ComputeAtMap::build(&fusion).unwrap();
    let p = &fusion.tensor(t0).domain.logical;
    let c = &fusion.tensor(t1).domain.root;
    for (&a, &b) in p.iter().zip(c) {
        assert!(map.are_mapped(a, b, MappingMode::Exact));
        assert!(map.are_mapped(a, b, MappingMode::Permissive));
    }
    // Distinct dims stay unmapped.
    assert!(!map.are_mapped(p[0], c[1], MappingMode::Permissive));
}

#[test]
fn mapping_is_transitive_across_a_chain() {
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 1);
    let t1 = fusion.unary(UnaryOp::Neg, t0);
    let t2 = fusion.unary(UnaryOp::Abs, t1);
    fusion.add_output(fusion.tensor(t2).val);

    let map = ComputeAtMap::build(&fusion).unwrap();
    let first = fusion.tensor(t0).domain.logical[0];
    let last = fusion.tensor(t2).domain.logical[0];
    assert!(map.are_mapped(first, last, MappingMode::Exact));
    // Reflexive and symmetric.
    assert!(map.are_mapped(first, first, MappingMode::Exact));
    assert!(map.are_mapped(last, first, MappingMode::Exact));
}

#[test]
fn broadcast_maps_permissively_but_not_exactly() {
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 1);
    let t1 = fusion.input_tensor(DType::Float, 2);
    let t2 = fusion.broadcast(t0, &[true, false]).unwrap();
    let t3 = fusion.binary(BinaryOp::Add, t2, t1).unwrap();
    fusion.add_output(fusion.tensor(t3).val);

    let map = ComputeAtMap::build(&fusion).unwrap();
    let bcast = fusion.tensor(t2).domain.logical[0];
    let concrete = fusion.tensor(t3).domain.root[0];
    assert!(map.are_mapped(bcast, concrete, MappingMode::Permissive));
    assert!(!map.are_mapped(bcast, concrete, MappingMode::Exact));
}

/// A broadcast consumed by two consumers of matching extent is uniquely
/// concretized; mismatched extents make it non-unique.
#[test]
fn concretization_uniqueness() {
    // Matching: both consumers share the same extent (literal 8).
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 1);
    let b = fusion.full(&[4, 8], DType::Float, kiln_ir::ScalarValue::Float(0.0));
    let c = fusion.full(&[4, 8], DType::Float, kiln_ir::ScalarValue::Float(0.0));
    let a = fusion.broadcast(t0, &[false, true]).unwrap();
    let ab = fusion.binary(BinaryOp::Add, a, b).unwrap();
    let ac = fusion.binary(BinaryOp::Add, a, c).unwrap();
    fusion.add_output(fusion.tensor(ab).val);
    fusion.add_output(fusion.tensor(ac).val);

    let map = ComputeAtMap::build(&fusion).unwrap();
    let bcast = fusion.tensor(a).domain.logical[1];
    assert_eq!(map.concretization(&fusion, bcast), BroadcastConcretization::Unique);
    assert!(map.is_uniquely_concretized(&fusion, bcast));

    // Mismatched: consumers of extent 8 and 9.
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 1);
    let b = fusion.full(&[4, 8], DType::Float, kiln_ir::ScalarValue::Float(0.0));
    let c = fusion.full(&[4, 9], DType::Float, kiln_ir::ScalarValue::Float(0.0));
    let a = fusion.broadcast(t0, &[false, true]).unwrap();
    let ab = fusion.binary(BinaryOp::Add, a, b).unwrap();
    let ac = fusion.binary(BinaryOp::Add, a, c).unwrap();
    fusion.add_output(fusion.tensor(ab).val);
    fusion.add_output(fusion.tensor(ac).val);

    let map = ComputeAtMap::build(&fusion).unwrap();
    let bcast = fusion.tensor(a).domain.logical[1];
    assert_eq!(map.concretization(&fusion, bcast), BroadcastConcretization::NonUnique);
}

#[test]
fn unconsumed_broadcast_is_non_concretized() {
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 1);
    let a = fusion.broadcast(t0, &[false, true]).unwrap();
    fusion.add_output(fusion.tensor(a).val);

    let map = ComputeAtMap::build(&fusion).unwrap();
    let bcast = fusion.tensor(a).domain.logical[1];
    assert_eq!(map.concretization(&fusion, bcast), BroadcastConcretization::NonConcretized);
    assert!(!map.is_concretized(&fusion, bcast));
}

#[test]
fn self_mapping_is_rejected() {
    // A tensor consuming the same producer twice through a permute maps its
    // own two axes together.
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 2);
    let flipped = fusion.permute(t0, &[1, 0]).unwrap();
    let joined = fusion.binary(BinaryOp::Add, t0, flipped).unwrap();
    fusion.add_output(fusion.tensor(joined).val);

    // t0's two axes end up exact-mapped through the permute cycle.
    assert!(ComputeAtMap::build(&fusion).is_err());
    // The permitting constructor still builds for inspection.
    let map = ComputeAtMap::build_permitting_self_mapping(&fusion);
    assert!(map.find_self_mapping(&fusion).is_some());
}
