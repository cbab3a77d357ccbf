use kiln_dtype::DType;
use kiln_ir::{Fusion, ScalarValue};

use crate::ExpressionEvaluator;
use crate::error::Error;

#[test]
fn evaluates_bound_symbols_and_arithmetic() {
    let mut fusion = Fusion::new();
    let n = fusion.new_symbol(DType::Index);
    let four = fusion.new_literal(DType::Index, 4i64);
    let blocks = fusion.ceil_div(n, four);

    let mut evaluator = ExpressionEvaluator::new();
    evaluator.bind(n, 10i64);
    assert_eq!(evaluator.evaluate_int(&fusion, blocks).unwrap(), 3);

    evaluator.bind(n, 12i64);
    assert_eq!(evaluator.evaluate_int(&fusion, blocks).unwrap(), 3);
}

#[test]
fn magic_zero_evaluates_to_zero() {
    let mut fusion = Fusion::new();
    let mz = fusion.magic_zero();
    let mut evaluator = ExpressionEvaluator::new();
    assert_eq!(evaluator.evaluate(&fusion, mz).unwrap(), ScalarValue::Int(0));
}

#[test]
fn unbound_symbol_is_an_error() {
    let mut fusion = Fusion::new();
    let n = fusion.new_symbol(DType::Index);
    let mut evaluator = ExpressionEvaluator::new();
    assert!(matches!(evaluator.evaluate(&fusion, n), Err(Error::UnboundValue { .. })));
}

#[test]
fn comparisons_yield_bools() {
    let mut fusion = Fusion::new();
    let n = fusion.new_symbol(DType::Index);
    let eight = fusion.new_literal(DType::Index, 8i64);
    let pred = fusion.slt(n, eight);

    let mut evaluator = ExpressionEvaluator::new();
    evaluator.bind(n, 3i64);
    assert_eq!(evaluator.evaluate(&fusion, pred).unwrap(), ScalarValue::Bool(true));
    evaluator.bind(n, 9i64);
    assert_eq!(evaluator.evaluate(&fusion, pred).unwrap(), ScalarValue::Bool(false));
}
