//! The fusion container.
//!
//! A [`Fusion`] owns every IR node of one tensor program: vals, exprs,
//! iteration domains, transform expressions, and tensor views. Dropping the
//! fusion drops all of them; handles from one fusion are meaningless in
//! another.

use smallvec::SmallVec;

use kiln_dtype::DType;

use crate::error::{Error, Result};
use crate::expr::{Expr, ExprId, ExprKind};
use crate::iter_domain::{IdExpr, IdExprId, IterDomain, IterDomainId, IterType, ParallelType};
use crate::tensor::{MemoryType, TensorDomain, TensorView, TensorViewId};
use crate::val::{ScalarValue, Val, ValId, ValKind};

/// How an output tensor relates to the buffers the caller passes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputAlias {
    /// Freshly allocated at launch.
    New,
    /// Returns the aliased input buffer directly; the kernel updated it in
    /// place.
    ReuseBuffer { input: ValId },
    /// Computed by the expression evaluator at output time and validated to
    /// be a view of the aliased input.
    Evaluate { input: ValId },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FusionOutput {
    pub val: ValId,
    pub alias: OutputAlias,
}

#[derive(Debug, Default)]
pub struct Fusion {
    vals: Vec<Val>,
    exprs: Vec<Expr>,
    iter_domains: Vec<IterDomain>,
    id_exprs: Vec<IdExpr>,
    tensors: Vec<TensorView>,
    uses: Vec<SmallVec<[ExprId; 2]>>,
    inputs: Vec<ValId>,
    outputs: Vec<FusionOutput>,
    /// Splits whose factor does not (or may not) divide the parent extent,
    /// recorded at schedule time and consumed by the predicate pass.
    non_divisible_splits: Vec<(TensorViewId, IdExprId)>,
}

impl Fusion {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- node access -------------------------------------------------------

    pub fn val(&self, id: ValId) -> &Val {
        &self.vals[id.index()]
    }

    pub fn val_mut(&mut self, id: ValId) -> &mut Val {
        &mut self.vals[id.index()]
    }

    pub fn expr(&self, id: ExprId) -> &Expr {
        &self.exprs[id.index()]
    }

    pub fn expr_mut(&mut self, id: ExprId) -> &mut Expr {
        &mut self.exprs[id.index()]
    }

    pub fn iter_domain(&self, id: IterDomainId) -> &IterDomain {
        &self.iter_domains[id.index()]
    }

    pub fn iter_domain_mut(&mut self, id: IterDomainId) -> &mut IterDomain {
        &mut self.iter_domains[id.index()]
    }

    pub fn id_expr(&self, id: IdExprId) -> &IdExpr {
        &self.id_exprs[id.index()]
    }

    pub fn id_exprs(&self) -> impl Iterator<Item = &IdExpr> {
        self.id_exprs.iter()
    }

    pub fn tensor(&self, id: TensorViewId) -> &TensorView {
        &self.tensors[id.index()]
    }

    pub fn tensor_mut(&mut self, id: TensorViewId) -> &mut TensorView {
        &mut self.tensors[id.index()]
    }

    pub fn num_exprs(&self) -> usize {
        self.exprs.len()
    }

    pub fn num_vals(&self) -> usize {
        self.vals.len()
    }

    pub fn val_ids(&self) -> impl Iterator<Item = ValId> {
        (0..self.vals.len()).map(ValId::new)
    }

    pub fn expr_ids(&self) -> impl Iterator<Item = ExprId> {
        (0..self.exprs.len()).map(ExprId::new)
    }

    pub fn tensor_ids(&self) -> impl Iterator<Item = TensorViewId> {
        (0..self.tensors.len()).map(TensorViewId::new)
    }

    pub fn iter_domain_ids(&self) -> impl Iterator<Item = IterDomainId> {
        (0..self.iter_domains.len()).map(IterDomainId::new)
    }

    // ---- construction ------------------------------------------------------

    pub fn new_val(&mut self, dtype: DType, kind: ValKind) -> ValId {
        self.vals.push(Val { dtype, kind, definition: None });
        self.uses.push(SmallVec::new());
        ValId::new(self.vals.len() - 1)
    }

    pub fn new_literal(&mut self, dtype: DType, value: impl Into<ScalarValue>) -> ValId {
        self.new_val(dtype, ValKind::Literal(value.into()))
    }

    pub fn new_symbol(&mut self, dtype: DType) -> ValId {
        self.new_val(dtype, ValKind::Symbolic { name: None })
    }

    pub fn new_named_symbol(&mut self, dtype: DType, name: impl Into<String>) -> ValId {
        self.new_val(dtype, ValKind::Symbolic { name: Some(name.into()) })
    }

    pub fn zero(&mut self) -> ValId {
        self.new_literal(DType::Index, 0i64)
    }

    pub fn one(&mut self) -> ValId {
        self.new_literal(DType::Index, 1i64)
    }

    pub fn magic_zero(&mut self) -> ValId {
        self.new_val(DType::Index, ValKind::MagicZero)
    }

    pub fn new_iter_domain(&mut self, start: ValId, extent: ValId, iter: IterType) -> IterDomainId {
        self.iter_domains.push(IterDomain {
            start,
            extent,
            expanded_extent: None,
            parallel: ParallelType::Serial,
            iter,
            is_rfactor: false,
            padded_to_warp: false,
            definition: None,
        });
        IterDomainId::new(self.iter_domains.len() - 1)
    }

    pub fn push_iter_domain(&mut self, id: IterDomain) -> IterDomainId {
        self.iter_domains.push(id);
        IterDomainId::new(self.iter_domains.len() - 1)
    }

    pub fn push_id_expr(&mut self, expr: IdExpr) -> IdExprId {
        let id = IdExprId::new(self.id_exprs.len());
        for &out in &expr.outputs {
            self.iter_domains[out.index()].definition = Some(id);
        }
        self.id_exprs.push(expr);
        id
    }

    /// Mint a tensor view (and its backing val) from a domain.
    pub fn new_tensor(&mut self, dtype: DType, domain: TensorDomain) -> TensorViewId {
        let tv = TensorViewId::new(self.tensors.len());
        let val = self.new_val(dtype, ValKind::Tensor(tv));
        self.tensors.push(TensorView {
            domain,
            dtype,
            memory: MemoryType::Global,
            circular_buffer_depth: None,
            compute_at_pos: 0,
            val,
        });
        tv
    }

    /// Create an input tensor of `rank` symbolic extents, fully contiguous,
    /// and register it as a fusion input.
    pub fn input_tensor(&mut self, dtype: DType, rank: usize) -> TensorViewId {
        let index = self.tensors.len();
        let zero = self.zero();
        let root: Vec<IterDomainId> = (0..rank)
            .map(|dim| {
                let extent = self.new_named_symbol(DType::Index, format!("T{index}.size[{dim}]"));
                self.new_iter_domain(zero, extent, IterType::Iteration)
            })
            .collect();
        let contiguity = vec![Some(true); rank];
        let tv = self.new_tensor(dtype, TensorDomain::from_root(root, contiguity));
        let val = self.tensor(tv).val;
        self.add_input(val).expect("tensor vals are always valid inputs");
        tv
    }

    // ---- inputs and outputs ------------------------------------------------

    /// Register a fusion input. Only symbolic scalars and tensors qualify;
    /// a literal is rejected.
    pub fn add_input(&mut self, val: ValId) -> Result<()> {
        if val.index() >= self.vals.len() {
            return Err(Error::ForeignValue { val });
        }
        if let ValKind::Literal(value) = self.val(val).kind {
            return Err(Error::LiteralFusionInput { value });
        }
        self.inputs.push(val);
        Ok(())
    }

    pub fn add_output(&mut self, val: ValId) {
        self.outputs.push(FusionOutput { val, alias: OutputAlias::New });
    }

    pub fn add_aliased_output(&mut self, val: ValId, alias: OutputAlias) {
        self.outputs.push(FusionOutput { val, alias });
    }

    pub fn inputs(&self) -> &[ValId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[FusionOutput] {
        &self.outputs
    }

    pub fn input_tensors(&self) -> Vec<TensorViewId> {
        self.inputs.iter().filter_map(|&v| self.val(v).as_tensor()).collect()
    }

    pub fn output_tensors(&self) -> Vec<TensorViewId> {
        self.outputs.iter().filter_map(|o| self.val(o.val).as_tensor()).collect()
    }

    pub fn is_input(&self, tv: TensorViewId) -> bool {
        self.inputs.iter().any(|&v| self.val(v).as_tensor() == Some(tv))
    }

    pub fn is_output(&self, tv: TensorViewId) -> bool {
        self.outputs.iter().any(|o| self.val(o.val).as_tensor() == Some(tv))
    }

    // ---- expressions and use-def -------------------------------------------

    pub fn add_expr(&mut self, kind: ExprKind, inputs: SmallVec<[ValId; 4]>, outputs: SmallVec<[ValId; 2]>) -> ExprId {
        let id = ExprId::new(self.exprs.len());
        for &input in &inputs {
            self.uses[input.index()].push(id);
        }
        for &output in &outputs {
            self.vals[output.index()].definition = Some(id);
        }
        self.exprs.push(Expr::new(kind, inputs, outputs));
        id
    }

    pub fn definition(&self, val: ValId) -> Option<ExprId> {
        self.val(val).definition
    }

    pub fn uses(&self, val: ValId) -> &[ExprId] {
        &self.uses[val.index()]
    }

    /// Replace `old` with `new` in the inputs of `expr`, keeping the
    /// expression's read and write predicates untouched.
    pub fn replace_input(&mut self, expr: ExprId, old: ValId, new: ValId) {
        let e = &mut self.exprs[expr.index()];
        let mut replaced = false;
        for input in e.inputs.iter_mut() {
            if *input == old {
                *input = new;
                replaced = true;
            }
        }
        if replaced {
            self.uses[old.index()].retain(|u| *u != expr);
            self.uses[new.index()].push(expr);
        }
    }

    /// Replace `old` with `new` in the outputs of `expr`, moving the
    /// definition link along.
    pub fn replace_output(&mut self, expr: ExprId, old: ValId, new: ValId) {
        let e = &mut self.exprs[expr.index()];
        for output in e.outputs.iter_mut() {
            if *output == old {
                *output = new;
            }
        }
        if self.vals[old.index()].definition == Some(expr) {
            self.vals[old.index()].definition = None;
        }
        self.vals[new.index()].definition = Some(expr);
    }

    /// Expressions in dependency order (producers before consumers).
    pub fn topo_exprs(&self) -> Vec<ExprId> {
        let mut visited = vec![false; self.exprs.len()];
        let mut order = Vec::with_capacity(self.exprs.len());
        // Iterative post-order DFS over the def chain of each expression.
        for root in 0..self.exprs.len() {
            if visited[root] {
                continue;
            }
            let mut stack = vec![(ExprId::new(root), false)];
            while let Some((expr, expanded)) = stack.pop() {
                if expanded {
                    if !visited[expr.index()] {
                        visited[expr.index()] = true;
                        order.push(expr);
                    }
                    continue;
                }
                if visited[expr.index()] {
                    continue;
                }
                stack.push((expr, true));
                for &input in &self.exprs[expr.index()].inputs {
                    if let Some(def) = self.definition(input) {
                        if !visited[def.index()] {
                            stack.push((def, false));
                        }
                    }
                }
            }
        }
        order
    }

    /// Tensors read by the expression defining `tv`.
    pub fn producers_of(&self, tv: TensorViewId) -> Vec<TensorViewId> {
        let val = self.tensor(tv).val;
        let Some(def) = self.definition(val) else { return Vec::new() };
        self.expr(def).inputs.iter().filter_map(|&v| self.val(v).as_tensor()).collect()
    }

    /// Tensors produced by expressions reading `tv`.
    pub fn consumers_of(&self, tv: TensorViewId) -> Vec<TensorViewId> {
        let val = self.tensor(tv).val;
        self.uses(val)
            .iter()
            .flat_map(|&e| self.expr(e).outputs.iter())
            .filter_map(|&v| self.val(v).as_tensor())
            .collect()
    }

    /// Weak connectivity over the tensor dataflow graph. Single-tensor
    /// fusions are trivially connected.
    pub fn is_weakly_connected(&self) -> bool {
        let tensors: Vec<TensorViewId> = self.tensor_ids().collect();
        if tensors.len() <= 1 {
            return true;
        }
        let mut seen = vec![false; tensors.len()];
        let mut stack = vec![tensors[0]];
        seen[0] = true;
        while let Some(tv) = stack.pop() {
            for next in self.producers_of(tv).into_iter().chain(self.consumers_of(tv)) {
                if !seen[next.index()] {
                    seen[next.index()] = true;
                    stack.push(next);
                }
            }
        }
        seen.into_iter().all(|s| s)
    }

    // ---- schedule bookkeeping ----------------------------------------------

    pub fn record_non_divisible_split(&mut self, tv: TensorViewId, split: IdExprId) {
        self.non_divisible_splits.push((tv, split));
    }

    pub fn non_divisible_splits(&self) -> &[(TensorViewId, IdExprId)] {
        &self.non_divisible_splits
    }

    /// Constant-fold a scalar val if it is a literal.
    pub fn constant_of(&self, val: ValId) -> Option<ScalarValue> {
        self.val(val).as_literal()
    }

    /// Literal integer extent, if statically known.
    pub fn constant_extent(&self, id: IterDomainId) -> Option<i64> {
        self.constant_of(self.iter_domain(id).extent).and_then(|v| v.as_int())
    }
}
