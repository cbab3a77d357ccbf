use kiln_dtype::DType;

use crate::{BinaryOp, Error, Fusion, ScalarValue, UnaryOp};

#[test]
fn literal_cannot_be_fusion_input() {
    let mut fusion = Fusion::new();
    let lit = fusion.new_literal(DType::Float, 2.0);
    let err = fusion.add_input(lit).unwrap_err();
    assert!(matches!(err, Error::LiteralFusionInput { value: ScalarValue::Float(v) } if v == 2.0));

    let sym = fusion.new_symbol(DType::Float);
    fusion.add_input(sym).unwrap();
    assert_eq!(fusion.inputs().len(), 1);
}

#[test]
fn replace_input_preserves_predicates() {
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 1);
    let t1 = fusion.unary(UnaryOp::Neg, t0);
    let expr = fusion.definition(fusion.tensor(t1).val).unwrap();

    let pred = fusion.new_symbol(DType::Bool);
    fusion.expr_mut(expr).read_predicate = Some(pred);
    fusion.expr_mut(expr).write_predicate = Some(pred);

    let replacement = fusion.input_tensor(DType::Float, 1);
    let (old_val, new_val) = (fusion.tensor(t0).val, fusion.tensor(replacement).val);
    fusion.replace_input(expr, old_val, new_val);

    let e = fusion.expr(expr);
    assert_eq!(e.inputs.as_slice(), &[new_val]);
    assert_eq!(e.read_predicate, Some(pred));
    assert_eq!(e.write_predicate, Some(pred));
    assert!(fusion.uses(old_val).is_empty());
    assert_eq!(fusion.uses(new_val), &[expr]);
}

#[test]
fn topo_order_puts_producers_first() {
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 2);
    let t1 = fusion.unary(UnaryOp::Neg, t0);
    let t2 = fusion.unary(UnaryOp::Abs, t1);
    let t3 = fusion.binary(BinaryOp::Add, t1, t2).unwrap();
    fusion.add_output(fusion.tensor(t3).val);

    let order = fusion.topo_exprs();
    let position = |tv| {
        let def = fusion.definition(fusion.tensor(tv).val).unwrap();
        order.iter().position(|&e| e == def).unwrap()
    };
    assert!(position(t1) < position(t2));
    assert!(position(t2) < position(t3));
    assert_eq!(order.len(), 3);
}

#[test]
fn producer_consumer_queries() {
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 1);
    let t1 = fusion.unary(UnaryOp::Exp, t0);
    let t2 = fusion.unary(UnaryOp::Log, t1);
    fusion.add_output(fusion.tensor(t2).val);

    assert_eq!(fusion.producers_of(t1), vec![t0]);
    assert_eq!(fusion.consumers_of(t1), vec![t2]);
    assert!(fusion.is_weakly_connected());
    assert!(fusion.is_input(t0));
    assert!(fusion.is_output(t2));
}

#[test]
fn disconnected_graphs_are_detected() {
    let mut fusion = Fusion::new();
    let t0 = fusion.input_tensor(DType::Float, 1);
    let t1 = fusion.input_tensor(DType::Float, 1);
    let a = fusion.unary(UnaryOp::Neg, t0);
    let b = fusion.unary(UnaryOp::Neg, t1);
    fusion.add_output(fusion.tensor(a).val);
    fusion.add_output(fusion.tensor(b).val);
    assert!(!fusion.is_weakly_connected());
}
