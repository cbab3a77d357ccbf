use kiln_dtype::DType;
use test_case::test_case;

use crate::{BinaryOp, Error, ExprKind, Fusion, IterType, ReductionOpType, ScalarValue};

#[test_case(DType::Float, DType::Double => DType::Double)]
#[test_case(DType::Int32, DType::Float => DType::Float)]
#[test_case(DType::Half, DType::BFloat16 => DType::Float)]
fn binary_promotes(lhs: DType, rhs: DType) -> DType {
    let mut fusion = Fusion::new();
    let a = fusion.input_tensor(lhs, 2);
    let b = fusion.input_tensor(rhs, 2);
    let out = fusion.binary(BinaryOp::Add, a, b).unwrap();
    fusion.tensor(out).dtype
}

#[test]
fn comparison_yields_bool() {
    let mut fusion = Fusion::new();
    let a = fusion.input_tensor(DType::Float, 1);
    let b = fusion.input_tensor(DType::Float, 1);
    let out = fusion.binary(BinaryOp::Lt, a, b).unwrap();
    assert_eq!(fusion.tensor(out).dtype, DType::Bool);
}

#[test]
fn reduction_marks_axes() {
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 2);
    let t1 = fusion.reduction(ReductionOpType::Add, t0, &[1]).unwrap();
    let domain = &fusion.tensor(t1).domain;
    assert_eq!(domain.rank(), 2);
    assert!(!fusion.iter_domain(domain.logical[0]).is_reduction());
    assert!(fusion.iter_domain(domain.logical[1]).is_reduction());
    // A consumer sees only the iteration axis.
    assert_eq!(fusion.consumer_visible_logical(t1).len(), 1);
}

#[test]
fn welford_has_three_sibling_outputs() {
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 2);
    let (avg, var_n, n) = fusion.welford(t0, &[1]).unwrap();
    let def = fusion.definition(fusion.tensor(avg).val).unwrap();
    assert_eq!(fusion.definition(fusion.tensor(var_n).val), Some(def));
    assert_eq!(fusion.definition(fusion.tensor(n).val), Some(def));
    assert_eq!(fusion.tensor(n).dtype, DType::Index);
}

#[test]
fn broadcast_then_squeeze_roundtrips_rank() {
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 2);
    let t1 = fusion.broadcast(t0, &[false, true, false]).unwrap();
    assert_eq!(fusion.tensor(t1).rank(), 3);
    assert!(fusion.iter_domain(fusion.tensor(t1).domain.logical[1]).is_broadcast());

    let t2 = fusion.squeeze(t1, &[false, true, false]).unwrap();
    assert_eq!(fusion.tensor(t2).rank(), 2);
}

#[test]
fn squeeze_rejects_concrete_axis() {
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 2);
    let err = fusion.squeeze(t0, &[true, false]).unwrap_err();
    assert!(matches!(err, Error::NotABroadcast { axis: 0 }));
}

#[test]
fn reshape_checks_totals() {
    let mut fusion = Fusion::new();
    let t0 = fusion.full(&[4, 6], DType::Float, ScalarValue::Float(0.0));
    let ok = fusion.reshape(t0, &[8, 3]).unwrap();
    assert_eq!(fusion.tensor(ok).rank(), 2);
    // Root differs from logical after a reshape.
    let domain = &fusion.tensor(ok).domain;
    assert_ne!(domain.root, domain.logical);

    let err = fusion.reshape(t0, &[5, 5]).unwrap_err();
    assert!(matches!(err, Error::ReshapeSizeMismatch { input_elements: 24, output_elements: 25 }));
}

#[test]
fn matmul_builds_mnk_domain() {
    let mut fusion = Fusion::new();
    let a = fusion.input_tensor(DType::Half, 2);
    let b = fusion.input_tensor(DType::Half, 2);
    let c = fusion.matmul(a, b).unwrap();
    let domain = &fusion.tensor(c).domain;
    assert_eq!(domain.rank(), 3);
    assert_eq!(fusion.iter_domain(domain.logical[2]).iter, IterType::Reduction);
    let def = fusion.definition(fusion.tensor(c).val).unwrap();
    assert!(matches!(fusion.expr(def).kind, ExprKind::Matmul));
}

#[test]
fn slice_resizes_logical_domain() {
    let mut fusion = Fusion::new();
    let t0 = fusion.full(&[10], DType::Float, ScalarValue::Float(1.0));
    let t1 = fusion.slice(t0, &[(2, 7)]).unwrap();
    let domain = &fusion.tensor(t1).domain;
    assert_ne!(domain.root, domain.logical);
    assert_eq!(fusion.constant_extent(domain.logical[0]), Some(5));
}
