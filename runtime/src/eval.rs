//! Scalar expression evaluation against input bindings.

use std::collections::HashMap;

use kiln_ir::{BinaryOp, ExprKind, Fusion, ScalarValue, UnaryOp, ValId, ValKind};

use crate::error::{Error, Result};

/// Evaluates symbolic scalars (extents, predicates, index math) given a set
/// of bindings. Results are memoized per evaluator instance.
#[derive(Debug, Default)]
pub struct ExpressionEvaluator {
    bindings: HashMap<ValId, ScalarValue>,
    memo: HashMap<ValId, ScalarValue>,
}

impl ExpressionEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, val: ValId, value: impl Into<ScalarValue>) {
        self.bindings.insert(val, value.into());
        self.memo.clear();
    }

    pub fn binding(&self, val: ValId) -> Option<ScalarValue> {
        self.bindings.get(&val).copied()
    }

    pub fn evaluate(&mut self, fusion: &Fusion, val: ValId) -> Result<ScalarValue> {
        if let Some(&value) = self.memo.get(&val) {
            return Ok(value);
        }
        let value = self.evaluate_uncached(fusion, val)?;
        self.memo.insert(val, value);
        Ok(value)
    }

    /// Evaluate to an integer, for extents and index math.
    pub fn evaluate_int(&mut self, fusion: &Fusion, val: ValId) -> Result<i64> {
        let value = self.evaluate(fusion, val)?;
        value.as_int().ok_or(Error::NotAScalarExpression { val })
    }

    fn evaluate_uncached(&mut self, fusion: &Fusion, val: ValId) -> Result<ScalarValue> {
        match &fusion.val(val).kind {
            ValKind::Literal(value) => return Ok(*value),
            ValKind::MagicZero => return Ok(ScalarValue::Int(0)),
            _ => {}
        }
        if let Some(&bound) = self.bindings.get(&val) {
            return Ok(bound);
        }
        let Some(def) = fusion.definition(val) else {
            return Err(Error::UnboundValue { val });
        };
        let expr = fusion.expr(def);
        match &expr.kind {
            ExprKind::Binary { op } => {
                let lhs = self.evaluate(fusion, expr.inputs[0])?;
                let rhs = self.evaluate(fusion, expr.inputs[1])?;
                self.apply_binary(val, *op, lhs, rhs)
            }
            ExprKind::Unary { op } => {
                let operand = self.evaluate(fusion, expr.inputs[0])?;
                Ok(apply_unary(*op, operand))
            }
            _ => Err(Error::NotAScalarExpression { val }),
        }
    }

    fn apply_binary(&self, val: ValId, op: BinaryOp, lhs: ScalarValue, rhs: ScalarValue) -> Result<ScalarValue> {
        use ScalarValue::*;
        if let (Some(l), Some(r)) = (lhs.as_int(), rhs.as_int()) {
            let out = match op {
                BinaryOp::Add => Int(l + r),
                BinaryOp::Sub => Int(l - r),
                BinaryOp::Mul => Int(l * r),
                BinaryOp::Div => {
                    if r == 0 {
                        return Err(Error::EvalDivisionByZero { val });
                    }
                    Int(l / r)
                }
                BinaryOp::Mod => {
                    if r == 0 {
                        return Err(Error::EvalDivisionByZero { val });
                    }
                    Int(l % r)
                }
                BinaryOp::Max => Int(l.max(r)),
                BinaryOp::Min => Int(l.min(r)),
                BinaryOp::And => Bool(l != 0 && r != 0),
                BinaryOp::Or => Bool(l != 0 || r != 0),
                BinaryOp::Xor => Int(l ^ r),
                BinaryOp::Lt => Bool(l < r),
                BinaryOp::Le => Bool(l <= r),
                BinaryOp::Gt => Bool(l > r),
                BinaryOp::Ge => Bool(l >= r),
                BinaryOp::Eq => Bool(l == r),
                BinaryOp::Ne => Bool(l != r),
                BinaryOp::Pow => Int(l.pow(r.max(0) as u32)),
            };
            return Ok(out);
        }
        let (l, r) = (lhs.as_float(), rhs.as_float());
        let out = match op {
            BinaryOp::Add => Float(l + r),
            BinaryOp::Sub => Float(l - r),
            BinaryOp::Mul => Float(l * r),
            BinaryOp::Div => Float(l / r),
            BinaryOp::Mod => Float(l % r),
            BinaryOp::Max => Float(l.max(r)),
            BinaryOp::Min => Float(l.min(r)),
            BinaryOp::Pow => Float(l.powf(r)),
            BinaryOp::Lt => Bool(l < r),
            BinaryOp::Le => Bool(l <= r),
            BinaryOp::Gt => Bool(l > r),
            BinaryOp::Ge => Bool(l >= r),
            BinaryOp::Eq => Bool(l == r),
            BinaryOp::Ne => Bool(l != r),
            BinaryOp::And | BinaryOp::Or | BinaryOp::Xor => {
                return Err(Error::NotAScalarExpression { val });
            }
        };
        Ok(out)
    }
}

fn apply_unary(op: UnaryOp, operand: ScalarValue) -> ScalarValue {
    use ScalarValue::*;
    match (op, operand) {
        (UnaryOp::Neg, Int(v)) => Int(-v),
        (UnaryOp::Neg, Float(v)) => Float(-v),
        (UnaryOp::Abs, Int(v)) => Int(v.abs()),
        (UnaryOp::Abs, Float(v)) => Float(v.abs()),
        (UnaryOp::Not, Bool(b)) => Bool(!b),
        (_, v) => Float(match op {
            UnaryOp::Exp => v.as_float().exp(),
            UnaryOp::Log => v.as_float().ln(),
            UnaryOp::Sqrt => v.as_float().sqrt(),
            UnaryOp::Rsqrt => v.as_float().sqrt().recip(),
            UnaryOp::Reciprocal => v.as_float().recip(),
            _ => v.as_float(),
        }),
    }
}
