//! Operator constructors.
//!
//! These are the surface through which the front-end (and the schedulers,
//! for cache tensors) build fusion graphs. Every constructor mints the output
//! tensor's root domain by mirroring the producer's logical domain, so that
//! the domain graph can later pair producer and consumer axes positionally.

use smallvec::{SmallVec, smallvec};

use kiln_dtype::DType;

use crate::error::{Error, Result};
use crate::expr::{BinaryOp, ExprKind, LoadStoreOpType, RNGOpType, ReductionOpType, TernaryOp, UnaryOp};
use crate::fusion::Fusion;
use crate::iter_domain::{IdExpr, IdExprKind, IterDomainId, IterType};
use crate::tensor::{TensorDomain, TensorViewId};
use crate::val::{ScalarValue, ValId, ValKind};

impl Fusion {
    /// Logical domain of `tv` with reduction axes dropped - the shape a
    /// consumer of `tv` observes.
    pub fn consumer_visible_logical(&self, tv: TensorViewId) -> Vec<IterDomainId> {
        self.tensor(tv).domain.logical.iter().copied().filter(|&id| !self.iter_domain(id).is_reduction()).collect()
    }

    /// Mirror `template` into fresh iteration domains sharing the extents.
    fn mirror_ids(&mut self, template: &[IterDomainId]) -> Vec<IterDomainId> {
        template
            .iter()
            .map(|&id| {
                let src = self.iter_domain(id).clone();
                let fresh = self.new_iter_domain(src.start, src.extent, src.iter);
                self.iter_domain_mut(fresh).expanded_extent = src.expanded_extent;
                fresh
            })
            .collect()
    }

    fn intermediate_like(&mut self, dtype: DType, template: &[IterDomainId]) -> TensorViewId {
        let root = self.mirror_ids(template);
        let contiguity = self.default_contiguity(&root);
        self.new_tensor(dtype, TensorDomain::from_root(root, contiguity))
    }

    // ---- scalar expressions ------------------------------------------------

    /// Scalar binary expression with promotion. Comparison ops yield Bool.
    pub fn scalar_binary(&mut self, op: BinaryOp, lhs: ValId, rhs: ValId) -> Result<ValId> {
        let lt = self.val(lhs).dtype;
        let rt = self.val(rhs).dtype;
        let dtype = if op.is_comparison() {
            DType::Bool
        } else {
            kiln_dtype::promote(lt, rt).map_err(|source| Error::Promotion { source })?
        };
        let out = self.new_symbol(dtype);
        self.add_expr(ExprKind::Binary { op }, smallvec![lhs, rhs], smallvec![out]);
        Ok(out)
    }

    pub fn sadd(&mut self, lhs: ValId, rhs: ValId) -> ValId {
        self.scalar_binary(BinaryOp::Add, lhs, rhs).expect("index arithmetic promotes")
    }

    pub fn smul(&mut self, lhs: ValId, rhs: ValId) -> ValId {
        self.scalar_binary(BinaryOp::Mul, lhs, rhs).expect("index arithmetic promotes")
    }

    pub fn ssub(&mut self, lhs: ValId, rhs: ValId) -> ValId {
        self.scalar_binary(BinaryOp::Sub, lhs, rhs).expect("index arithmetic promotes")
    }

    pub fn smod(&mut self, lhs: ValId, rhs: ValId) -> ValId {
        self.scalar_binary(BinaryOp::Mod, lhs, rhs).expect("index arithmetic promotes")
    }

    pub fn sdiv(&mut self, lhs: ValId, rhs: ValId) -> ValId {
        self.scalar_binary(BinaryOp::Div, lhs, rhs).expect("index arithmetic promotes")
    }

    /// `(lhs + rhs - 1) / rhs` as a symbolic expression.
    pub fn ceil_div(&mut self, lhs: ValId, rhs: ValId) -> ValId {
        let one = self.one();
        let bumped = self.sadd(lhs, rhs);
        let bumped = self.ssub(bumped, one);
        self.sdiv(bumped, rhs)
    }

    pub fn slt(&mut self, lhs: ValId, rhs: ValId) -> ValId {
        self.scalar_binary(BinaryOp::Lt, lhs, rhs).expect("comparisons always type")
    }

    pub fn seq(&mut self, lhs: ValId, rhs: ValId) -> ValId {
        self.scalar_binary(BinaryOp::Eq, lhs, rhs).expect("comparisons always type")
    }

    pub fn sand(&mut self, lhs: ValId, rhs: ValId) -> ValId {
        self.scalar_binary(BinaryOp::And, lhs, rhs).expect("bool conjunction always types")
    }

    // ---- pointwise ---------------------------------------------------------

    pub fn unary(&mut self, op: UnaryOp, input: TensorViewId) -> TensorViewId {
        let dtype = match op {
            UnaryOp::IsNan | UnaryOp::Not => DType::Bool,
            _ => self.tensor(input).dtype,
        };
        let template = self.consumer_visible_logical(input);
        let out = self.intermediate_like(dtype, &template);
        let (in_val, out_val) = (self.tensor(input).val, self.tensor(out).val);
        self.add_expr(ExprKind::Unary { op }, smallvec![in_val], smallvec![out_val]);
        out
    }

    /// Pointwise binary op. Operands must have equal rank; size-1 broadcast
    /// axes pair with concrete axes (the concrete extent wins).
    pub fn binary(&mut self, op: BinaryOp, lhs: TensorViewId, rhs: TensorViewId) -> Result<TensorViewId> {
        let lhs_ids = self.consumer_visible_logical(lhs);
        let rhs_ids = self.consumer_visible_logical(rhs);
        if lhs_ids.len() != rhs_ids.len() {
            return Err(Error::RankMismatch { expected: lhs_ids.len(), actual: rhs_ids.len() });
        }
        let dtype = if op.is_comparison() {
            DType::Bool
        } else {
            kiln_dtype::promote(self.tensor(lhs).dtype, self.tensor(rhs).dtype)
                .map_err(|source| Error::Promotion { source })?
        };
        // Where one side broadcasts, mirror the concrete side.
        let template: Vec<IterDomainId> = lhs_ids
            .iter()
            .zip(&rhs_ids)
            .map(|(&l, &r)| if self.iter_domain(l).is_broadcast() { r } else { l })
            .collect();
        let out = self.intermediate_like(dtype, &template);
        let (lv, rv, ov) = (self.tensor(lhs).val, self.tensor(rhs).val, self.tensor(out).val);
        self.add_expr(ExprKind::Binary { op }, smallvec![lv, rv], smallvec![ov]);
        Ok(out)
    }

    pub fn ternary(
        &mut self,
        op: TernaryOp,
        a: TensorViewId,
        b: TensorViewId,
        c: TensorViewId,
    ) -> Result<TensorViewId> {
        let template = self.consumer_visible_logical(b);
        let dtype = kiln_dtype::promote(self.tensor(b).dtype, self.tensor(c).dtype)
            .map_err(|source| Error::Promotion { source })?;
        let out = self.intermediate_like(dtype, &template);
        let (av, bv, cv, ov) =
            (self.tensor(a).val, self.tensor(b).val, self.tensor(c).val, self.tensor(out).val);
        self.add_expr(ExprKind::Ternary { op }, smallvec![av, bv, cv], smallvec![ov]);
        Ok(out)
    }

    pub fn cast(&mut self, input: TensorViewId, dtype: DType) -> TensorViewId {
        let template = self.consumer_visible_logical(input);
        let out = self.intermediate_like(dtype, &template);
        let (iv, ov) = (self.tensor(input).val, self.tensor(out).val);
        self.add_expr(ExprKind::Cast, smallvec![iv], smallvec![ov]);
        out
    }

    /// Reinterpret the raw bits as `dtype`. This is the only route between
    /// unsigned and signed element types.
    pub fn bit_cast(&mut self, input: TensorViewId, dtype: DType) -> Result<TensorViewId> {
        let src = self.tensor(input).dtype;
        if src.bytes() != dtype.bytes() {
            return Err(Error::Malformed {
                what: format!("bit cast requires equal widths, got {src} -> {dtype}"),
            });
        }
        let template = self.consumer_visible_logical(input);
        let out = self.intermediate_like(dtype, &template);
        let (iv, ov) = (self.tensor(input).val, self.tensor(out).val);
        self.add_expr(ExprKind::BitCast, smallvec![iv], smallvec![ov]);
        Ok(out)
    }

    /// Plain copy; the scheduler's cache insertion reuses this with a
    /// hardware-assisted [`LoadStoreOpType`].
    pub fn set(&mut self, input: TensorViewId) -> TensorViewId {
        self.set_with(input, LoadStoreOpType::Set)
    }

    pub fn set_with(&mut self, input: TensorViewId, op: LoadStoreOpType) -> TensorViewId {
        let dtype = self.tensor(input).dtype;
        let template = self.consumer_visible_logical(input);
        let out = self.intermediate_like(dtype, &template);
        let (iv, ov) = (self.tensor(input).val, self.tensor(out).val);
        self.add_expr(ExprKind::LoadStore { op }, smallvec![iv], smallvec![ov]);
        out
    }

    // ---- reductions --------------------------------------------------------

    /// Reduce `axes` of the input. The output keeps the reduced axes in its
    /// domain, flagged [`IterType::Reduction`]; consumers do not see them.
    pub fn reduction(&mut self, op: ReductionOpType, input: TensorViewId, axes: &[usize]) -> Result<TensorViewId> {
        let template = self.consumer_visible_logical(input);
        self.check_axes(axes, template.len())?;
        let root = self.reduction_root(&template, axes);
        let contiguity = self.default_contiguity(&root);
        let dtype = self.tensor(input).dtype;
        let out = self.new_tensor(dtype, TensorDomain::from_root(root, contiguity));
        let (iv, ov) = (self.tensor(input).val, self.tensor(out).val);
        self.add_expr(
            ExprKind::Reduction { op, axes: axes.iter().copied().collect() },
            smallvec![iv],
            smallvec![ov],
        );
        Ok(out)
    }

    /// Welford mean/variance. Returns (avg, var·n, n) views sharing one
    /// defining expression; parallelization of one output propagates to its
    /// siblings.
    pub fn welford(&mut self, input: TensorViewId, axes: &[usize]) -> Result<(TensorViewId, TensorViewId, TensorViewId)> {
        let template = self.consumer_visible_logical(input);
        self.check_axes(axes, template.len())?;
        let dtype = self.tensor(input).dtype;
        let mut mk = |fusion: &mut Fusion, dt: DType| {
            let root = fusion.reduction_root(&template, axes);
            let contiguity = fusion.default_contiguity(&root);
            fusion.new_tensor(dt, TensorDomain::from_root(root, contiguity))
        };
        let avg = mk(self, dtype);
        let var_n = mk(self, dtype);
        let n = mk(self, DType::Index);
        let iv = self.tensor(input).val;
        let outs: SmallVec<[ValId; 2]> =
            smallvec![self.tensor(avg).val, self.tensor(var_n).val, self.tensor(n).val];
        self.add_expr(ExprKind::Welford { axes: axes.iter().copied().collect() }, smallvec![iv], outs);
        Ok((avg, var_n, n))
    }

    fn reduction_root(&mut self, template: &[IterDomainId], axes: &[usize]) -> Vec<IterDomainId> {
        template
            .iter()
            .enumerate()
            .map(|(dim, &id)| {
                let src = self.iter_domain(id).clone();
                let iter = if axes.contains(&dim) { IterType::Reduction } else { src.iter };
                self.new_iter_domain(src.start, src.extent, iter)
            })
            .collect()
    }

    fn default_contiguity(&self, root: &[IterDomainId]) -> Vec<Option<bool>> {
        root.iter().map(|&id| if self.iter_domain(id).has_contiguity_slot() { Some(true) } else { None }).collect()
    }

    fn check_axes(&self, axes: &[usize], rank: usize) -> Result<()> {
        for &axis in axes {
            if axis >= rank {
                return Err(Error::AxisOutOfRange { axis, rank });
            }
        }
        Ok(())
    }

    // ---- shape ops ---------------------------------------------------------

    /// Insert broadcast axes where the flag is true. The flag list describes
    /// the output rank.
    pub fn broadcast(&mut self, input: TensorViewId, is_broadcast_dim: &[bool]) -> Result<TensorViewId> {
        let template = self.consumer_visible_logical(input);
        let concrete = is_broadcast_dim.iter().filter(|b| !**b).count();
        if concrete != template.len() {
            return Err(Error::RankMismatch { expected: template.len(), actual: concrete });
        }
        let zero = self.zero();
        let one = self.one();
        let mut source = template.iter();
        let root: Vec<IterDomainId> = is_broadcast_dim
            .iter()
            .map(|&flag| {
                if flag {
                    self.new_iter_domain(zero, one, IterType::Broadcast)
                } else {
                    let &id = source.next().expect("rank checked above");
                    let src = self.iter_domain(id).clone();
                    self.new_iter_domain(src.start, src.extent, src.iter)
                }
            })
            .collect();
        let contiguity = self.default_contiguity(&root);
        let dtype = self.tensor(input).dtype;
        let out = self.new_tensor(dtype, TensorDomain::from_root(root, contiguity));
        let (iv, ov) = (self.tensor(input).val, self.tensor(out).val);
        self.add_expr(
            ExprKind::Broadcast { is_broadcast_dim: is_broadcast_dim.iter().copied().collect() },
            smallvec![iv],
            smallvec![ov],
        );
        Ok(out)
    }

    /// Remove broadcast axes where the flag is true. Squeezing a
    /// non-broadcast axis is rejected.
    pub fn squeeze(&mut self, input: TensorViewId, is_squeeze_dim: &[bool]) -> Result<TensorViewId> {
        let template = self.consumer_visible_logical(input);
        if is_squeeze_dim.len() != template.len() {
            return Err(Error::RankMismatch { expected: template.len(), actual: is_squeeze_dim.len() });
        }
        for (axis, (&flag, &id)) in is_squeeze_dim.iter().zip(&template).enumerate() {
            if flag && !self.iter_domain(id).is_broadcast() {
                return Err(Error::NotABroadcast { axis });
            }
        }
        let kept: Vec<IterDomainId> =
            template.iter().zip(is_squeeze_dim).filter(|(_, &flag)| !flag).map(|(&id, _)| id).collect();
        let dtype = self.tensor(input).dtype;
        let out = self.intermediate_like(dtype, &kept);
        let (iv, ov) = (self.tensor(input).val, self.tensor(out).val);
        self.add_expr(
            ExprKind::Squeeze { is_squeeze_dim: is_squeeze_dim.iter().copied().collect() },
            smallvec![iv],
            smallvec![ov],
        );
        Ok(out)
    }

    /// Reshape to `new_sizes`. The output's root mirrors the input's logical
    /// domain; its logical domain is derived through a merge-then-split
    /// transform chain, so downstream scheduling sees one connected DAG.
    pub fn reshape(&mut self, input: TensorViewId, new_sizes: &[i64]) -> Result<TensorViewId> {
        let template = self.consumer_visible_logical(input);

        // Static totals must agree when both sides are fully known.
        let in_total: Option<i64> =
            template.iter().map(|&id| self.constant_extent(id)).try_fold(1i64, |acc, e| e.map(|e| acc * e));
        let out_total: i64 = new_sizes.iter().product();
        if let Some(in_total) = in_total {
            if in_total != out_total {
                return Err(Error::ReshapeSizeMismatch { input_elements: in_total, output_elements: out_total });
            }
        }

        let root = self.mirror_ids(&template);
        let mut additional = Vec::new();

        // Merge the root left to right into a single axis.
        let merged = if root.len() == 1 {
            root[0]
        } else {
            let mut acc = root[0];
            for &next in &root[1..] {
                let merged_extent = {
                    let (a, b) = (self.iter_domain(acc).extent, self.iter_domain(next).extent);
                    self.smul(a, b)
                };
                let zero = self.zero();
                let out = self.new_iter_domain(zero, merged_extent, IterType::Iteration);
                self.push_id_expr(IdExpr {
                    kind: IdExprKind::Merge,
                    inputs: smallvec![acc, next],
                    outputs: smallvec![out],
                });
                additional.push(out);
                acc = out;
            }
            acc
        };

        // Split the merged axis into the new sizes, outer to inner.
        let mut logical = Vec::with_capacity(new_sizes.len());
        let mut rest = merged;
        for (dim, &size) in new_sizes.iter().enumerate() {
            if dim + 1 == new_sizes.len() {
                logical.push(rest);
                break;
            }
            let inner_total: i64 = new_sizes[dim + 1..].iter().product();
            let factor = self.new_literal(DType::Index, inner_total);
            let zero = self.zero();
            let outer_extent = self.new_literal(DType::Index, size);
            let outer = self.new_iter_domain(zero, outer_extent, IterType::Iteration);
            let inner_extent = self.new_literal(DType::Index, inner_total);
            let inner = self.new_iter_domain(zero, inner_extent, IterType::Iteration);
            self.push_id_expr(IdExpr {
                kind: IdExprKind::Split { factor, inner_split: true, divisible: Some(true) },
                inputs: smallvec![rest],
                outputs: smallvec![outer, inner],
            });
            logical.push(outer);
            additional.push(inner);
            rest = inner;
        }
        // The final logical IDs are no longer "additional".
        additional.retain(|id| !logical.contains(id));

        let contiguity = self.default_contiguity(&logical);
        let dtype = self.tensor(input).dtype;
        let out = self.new_tensor(
            dtype,
            TensorDomain {
                root,
                logical: logical.clone(),
                allocation: logical.clone(),
                loop_: logical,
                contiguity,
                additional,
            },
        );
        let (iv, ov) = (self.tensor(input).val, self.tensor(out).val);
        self.add_expr(ExprKind::Reshape, smallvec![iv], smallvec![ov]);
        Ok(out)
    }

    /// Permute logical dimensions. The output's root mirrors the producer's
    /// order; the logical list is the same set reordered, so no transform
    /// node is needed.
    pub fn permute(&mut self, input: TensorViewId, perm: &[usize]) -> Result<TensorViewId> {
        let template = self.consumer_visible_logical(input);
        if perm.len() != template.len() {
            return Err(Error::RankMismatch { expected: template.len(), actual: perm.len() });
        }
        self.check_axes(perm, template.len())?;
        let root = self.mirror_ids(&template);
        let logical: Vec<IterDomainId> = perm.iter().map(|&dim| root[dim]).collect();
        let contiguity = self.default_contiguity(&logical);
        let dtype = self.tensor(input).dtype;
        let out = self.new_tensor(
            dtype,
            TensorDomain {
                root,
                logical: logical.clone(),
                allocation: logical.clone(),
                loop_: logical,
                contiguity,
                additional: Vec::new(),
            },
        );
        let (iv, ov) = (self.tensor(input).val, self.tensor(out).val);
        self.add_expr(ExprKind::Permute { perm: perm.iter().copied().collect() }, smallvec![iv], smallvec![ov]);
        Ok(out)
    }

    /// Slice `[start, stop)` windows per dimension, lowered as negative
    /// resizes on the logical domain.
    pub fn slice(&mut self, input: TensorViewId, ranges: &[(i64, i64)]) -> Result<TensorViewId> {
        let template = self.consumer_visible_logical(input);
        if ranges.len() != template.len() {
            return Err(Error::RankMismatch { expected: template.len(), actual: ranges.len() });
        }
        let root = self.mirror_ids(&template);
        let zero = self.zero();
        let mut logical = Vec::with_capacity(root.len());
        for (&in_id, &(start, stop)) in root.iter().zip(ranges) {
            if start == 0 && self.constant_extent(in_id) == Some(stop) {
                logical.push(in_id);
                continue;
            }
            let left = self.new_literal(DType::Index, -start);
            let in_extent = self.iter_domain(in_id).extent;
            let stop_val = self.new_literal(DType::Index, stop);
            let right_sym = self.ssub(stop_val, in_extent);
            let out_extent = self.new_literal(DType::Index, stop - start);
            let out = self.new_iter_domain(zero, out_extent, IterType::Iteration);
            self.push_id_expr(IdExpr {
                kind: IdExprKind::Resize { left, right: right_sym },
                inputs: smallvec![in_id],
                outputs: smallvec![out],
            });
            logical.push(out);
        }
        let contiguity = self.default_contiguity(&logical);
        let dtype = self.tensor(input).dtype;
        let out = self.new_tensor(
            dtype,
            TensorDomain {
                root,
                logical: logical.clone(),
                allocation: logical.clone(),
                loop_: logical,
                contiguity,
                additional: Vec::new(),
            },
        );
        let (iv, ov) = (self.tensor(input).val, self.tensor(out).val);
        self.add_expr(
            ExprKind::Slice {
                left: ranges.iter().map(|r| r.0).collect(),
                right: ranges.iter().map(|r| r.1).collect(),
            },
            smallvec![iv],
            smallvec![ov],
        );
        Ok(out)
    }

    // ---- matmul family -----------------------------------------------------

    /// `[M, K] x [K, N] -> [M, N]` with a reduction axis over K.
    pub fn matmul(&mut self, a: TensorViewId, b: TensorViewId) -> Result<TensorViewId> {
        let a_ids = self.consumer_visible_logical(a);
        let b_ids = self.consumer_visible_logical(b);
        if a_ids.len() != 2 || b_ids.len() != 2 {
            return Err(Error::Malformed { what: "matmul expects rank-2 operands".into() });
        }
        let (m, k) = (a_ids[0], a_ids[1]);
        let n = b_ids[1];
        let root = {
            let m_src = self.iter_domain(m).clone();
            let n_src = self.iter_domain(n).clone();
            let k_src = self.iter_domain(k).clone();
            vec![
                self.new_iter_domain(m_src.start, m_src.extent, IterType::Iteration),
                self.new_iter_domain(n_src.start, n_src.extent, IterType::Iteration),
                self.new_iter_domain(k_src.start, k_src.extent, IterType::Reduction),
            ]
        };
        let contiguity = self.default_contiguity(&root);
        let dtype = kiln_dtype::promote(self.tensor(a).dtype, self.tensor(b).dtype)
            .map_err(|source| Error::Promotion { source })?;
        let out = self.new_tensor(dtype, TensorDomain::from_root(root, contiguity));
        let (av, bv, ov) = (self.tensor(a).val, self.tensor(b).val, self.tensor(out).val);
        self.add_expr(ExprKind::Matmul, smallvec![av, bv], smallvec![ov]);
        Ok(out)
    }

    /// `x [.., K] x w [N, K] (+ bias[N]) -> [.., N]`.
    pub fn linear(&mut self, x: TensorViewId, w: TensorViewId, bias: Option<TensorViewId>) -> Result<TensorViewId> {
        let x_ids = self.consumer_visible_logical(x);
        let w_ids = self.consumer_visible_logical(w);
        if x_ids.is_empty() || w_ids.len() != 2 {
            return Err(Error::Malformed { what: "linear expects x[..,K] and w[N,K]".into() });
        }
        let mut root: Vec<IterDomainId> = Vec::with_capacity(x_ids.len() + 1);
        for &id in &x_ids[..x_ids.len() - 1] {
            let src = self.iter_domain(id).clone();
            root.push(self.new_iter_domain(src.start, src.extent, IterType::Iteration));
        }
        let n_src = self.iter_domain(w_ids[0]).clone();
        root.push(self.new_iter_domain(n_src.start, n_src.extent, IterType::Iteration));
        let k_src = self.iter_domain(*x_ids.last().expect("checked non-empty")).clone();
        root.push(self.new_iter_domain(k_src.start, k_src.extent, IterType::Reduction));
        let contiguity = self.default_contiguity(&root);
        let dtype = kiln_dtype::promote(self.tensor(x).dtype, self.tensor(w).dtype)
            .map_err(|source| Error::Promotion { source })?;
        let out = self.new_tensor(dtype, TensorDomain::from_root(root, contiguity));
        let mut inputs: SmallVec<[ValId; 4]> = smallvec![self.tensor(x).val, self.tensor(w).val];
        if let Some(bias) = bias {
            inputs.push(self.tensor(bias).val);
        }
        let ov = self.tensor(out).val;
        self.add_expr(ExprKind::Linear, inputs, smallvec![ov]);
        Ok(out)
    }

    // ---- misc --------------------------------------------------------------

    pub fn rand_like(&mut self, input: TensorViewId, op: RNGOpType) -> TensorViewId {
        let dtype = self.tensor(input).dtype;
        let template = self.consumer_visible_logical(input);
        let out = self.intermediate_like(dtype, &template);
        let seed = self.new_named_symbol(DType::Index, "rng_seed");
        let offset = self.new_named_symbol(DType::Index, "rng_offset");
        let (iv, ov) = (self.tensor(input).val, self.tensor(out).val);
        self.add_expr(ExprKind::Rng { op, seed, offset }, smallvec![iv], smallvec![ov]);
        out
    }

    pub fn full(&mut self, sizes: &[i64], dtype: DType, fill: ScalarValue) -> TensorViewId {
        let zero = self.zero();
        let root: Vec<IterDomainId> = sizes
            .iter()
            .map(|&size| {
                let extent = self.new_literal(DType::Index, size);
                self.new_iter_domain(zero, extent, IterType::Iteration)
            })
            .collect();
        let contiguity = vec![Some(true); root.len()];
        let out = self.new_tensor(dtype, TensorDomain::from_root(root, contiguity));
        let fill = self.new_literal(dtype, fill);
        let ov = self.tensor(out).val;
        self.add_expr(ExprKind::Full { fill }, smallvec![fill], smallvec![ov]);
        out
    }

    /// Scaled dot-product attention. Opaque: only the expression-eval path
    /// may consume it.
    pub fn sdpa(&mut self, q: TensorViewId, k: TensorViewId, v: TensorViewId) -> Result<TensorViewId> {
        let template = self.consumer_visible_logical(q);
        let dtype = self.tensor(q).dtype;
        let out = self.intermediate_like(dtype, &template);
        let (qv, kv, vv, ov) =
            (self.tensor(q).val, self.tensor(k).val, self.tensor(v).val, self.tensor(out).val);
        self.add_expr(ExprKind::Sdpa, smallvec![qv, kv, vv], smallvec![ov]);
        Ok(out)
    }
}
