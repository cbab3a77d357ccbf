//! Inspection passes over a lowered kernel.
//!
//! These never mutate: they return a report (or an error for the runtime
//! checks). The report backs the lowering invariants the test-suite holds
//! every scheduled fusion to.

use kiln_ir::{EntryCheckKind, Fusion, Kernel, KirNode, ScalarValue};
use kiln_runtime::RuntimeInfo;

use crate::error::{Error, Result};

/// What a lowered kernel looks like, structurally.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoweringReport {
    /// Per-iteration predicates guarding non-divisible inner splits.
    pub non_divisible_predicates: usize,
    /// Hoisted entry checks for vectorized non-divisible splits.
    pub vectorization_entry_checks: usize,
    pub block_syncs: usize,
    pub aligned_block_syncs: usize,
    pub grid_reductions: usize,
    pub allocations: usize,
    pub aliased_allocations: usize,
    pub if_then_elses: usize,
    pub for_loops: usize,
}

/// Count the structural features of the lowered stream.
pub fn validate_lowered(fusion: &Fusion, kernel: &Kernel) -> LoweringReport {
    let mut report = LoweringReport::default();

    for &(tv, split) in fusion.non_divisible_splits() {
        let id_expr = fusion.id_expr(split);
        // Splits straight off a root axis are covered by the root bound; the
        // dedicated non-divisible predicate guards derived axes only.
        let derived = fusion.iter_domain(id_expr.inputs[0]).definition.is_some();
        let vectorized = kernel
            .summary
            .entry_checks
            .iter()
            .any(|check| matches!(check.kind, EntryCheckKind::VectorizationStride { tv: check_tv, .. } if check_tv == tv));
        if derived && !vectorized {
            report.non_divisible_predicates += 1;
        }
    }
    report.vectorization_entry_checks = kernel
        .summary
        .entry_checks
        .iter()
        .filter(|check| matches!(check.kind, EntryCheckKind::VectorizationStride { .. }))
        .count();

    kernel.visit(|_, id| match kernel.node(id) {
        KirNode::BlockSync { aligned, .. } => {
            report.block_syncs += 1;
            if *aligned {
                report.aligned_block_syncs += 1;
            }
        }
        KirNode::GridReduction { .. } => report.grid_reductions += 1,
        KirNode::Allocate { alias_of, .. } => {
            report.allocations += 1;
            if alias_of.is_some() {
                report.aliased_allocations += 1;
            }
        }
        KirNode::IfThenElse { .. } => report.if_then_elses += 1,
        KirNode::ForLoop { .. } => report.for_loops += 1,
        _ => {}
    });
    report
}

/// Evaluate the kernel's entry checks against the bound inputs. A failed
/// vectorization-stride check is fatal for the invocation (the compiled
/// kernel itself stays valid for other shapes).
pub fn validate_vectorization(fusion: &Fusion, kernel: &Kernel, info: &mut RuntimeInfo) -> Result<()> {
    for check in &kernel.summary.entry_checks {
        let pass = info
            .evaluator_mut()
            .evaluate(fusion, check.predicate)
            .map(|value| value == ScalarValue::Bool(true) || value.as_int() == Some(1))
            .unwrap_or(false);
        if pass {
            continue;
        }
        match check.kind {
            EntryCheckKind::VectorizationStride { tv, width } | EntryCheckKind::PointerAlignment { tv, width } => {
                return Err(Error::VectorizationStrideViolation { tv, width });
            }
        }
    }
    Ok(())
}
