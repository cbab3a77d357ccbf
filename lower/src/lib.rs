//! Lowering: scheduled fusion IR to kernel IR.
//!
//! [`lower_fusion`] runs the ordered pass pipeline over one scheduled
//! fusion and returns the [`Kernel`] ready for textual emission:
//!
//! 1. symbolic sizes -> input metadata expressions
//! 2. loop-nest construction
//! 3. allocation placement
//! 4. initialization insertion
//! 5. predicate insertion (non-divisible splits, broadcasts, RNG,
//!    thread redundancy, magic zero)
//! 6. index-type lowering
//! 7. block-sync insertion
//! 8. grid-sync insertion
//! 9. circular-buffer expansion
//! 10. memory aliasing, then user hooks in append order

pub mod error;
pub mod loops;
pub mod passes;
pub mod validation;

#[cfg(test)]
pub mod test;

use std::collections::HashMap;

use tracing::debug;

use kiln_ir::{ExprId, Fusion, IterDomainId, Kernel, KirId, TensorViewId, ValId};
use kiln_runtime::{CompileOptions, RuntimeInfo, TensorArg};
use kiln_schedule::registry::{HeuristicParams, SchedulerKind};

pub use error::{Error, Result};
pub use validation::{LoweringReport, validate_lowered, validate_vectorization};

/// A user-registered pass, run after the built-in pipeline in append order.
pub type LoweringHook = Box<dyn Fn(&mut LowerCtx<'_>) -> Result<()>>;

/// Shared state of one lowering run.
pub struct LowerCtx<'a> {
    pub fusion: &'a mut Fusion,
    pub info: &'a mut RuntimeInfo,
    pub options: &'a CompileOptions,
    pub kernel: Kernel,
    /// Loop index val of each materialized iteration domain.
    pub loop_index: HashMap<IterDomainId, ValId>,
    /// KIR node of each lowered fusion expression.
    pub expr_node: HashMap<ExprId, KirId>,
    /// Outermost statement standing for the expression in its body: the
    /// expr node itself, or the if-then-else a predicate pass wrapped it in.
    pub expr_stmt: HashMap<ExprId, KirId>,
    /// Enclosing for-loop chain of each lowered expression, outermost first.
    pub expr_scope: HashMap<ExprId, Vec<KirId>>,
    /// Allocate node of each buffered tensor.
    pub alloc_node: HashMap<TensorViewId, KirId>,
}

impl<'a> LowerCtx<'a> {
    fn new(fusion: &'a mut Fusion, info: &'a mut RuntimeInfo, options: &'a CompileOptions) -> Self {
        Self {
            fusion,
            info,
            options,
            kernel: Kernel::new(),
            loop_index: HashMap::new(),
            expr_node: HashMap::new(),
            expr_stmt: HashMap::new(),
            expr_scope: HashMap::new(),
            alloc_node: HashMap::new(),
        }
    }

    /// Replace `target` with `replacement` in the body that contains it.
    /// Used by the predicate passes to wrap statements in if-then-else.
    pub fn replace_in_scope(&mut self, scope: &[KirId], target: KirId, replacement: KirId) {
        let body: &mut Vec<KirId> = match scope.last() {
            Some(&parent) => {
                let node = self.kernel.node_mut(parent);
                let Some(body) = node.bodies_mut().into_iter().find(|body| body.contains(&target)) else {
                    return;
                };
                body
            }
            None => &mut self.kernel.top_level,
        };
        if let Some(slot) = body.iter_mut().find(|id| **id == target) {
            *slot = replacement;
        }
    }

    /// Insert `node` immediately before `target` in the body containing it.
    pub fn insert_before(&mut self, scope: &[KirId], target: KirId, node: KirId) {
        let body: &mut Vec<KirId> = match scope.last() {
            Some(&parent) => {
                let parent_node = self.kernel.node_mut(parent);
                let Some(body) = parent_node.bodies_mut().into_iter().find(|body| body.contains(&target)) else {
                    return;
                };
                body
            }
            None => &mut self.kernel.top_level,
        };
        if let Some(pos) = body.iter().position(|&id| id == target) {
            body.insert(pos, node);
        }
    }
}

/// Run one pass, with entry/exit tracing when `function_trace` matches its
/// name.
fn staged(
    ctx: &mut LowerCtx<'_>,
    name: &'static str,
    pass: fn(&mut LowerCtx<'_>) -> Result<()>,
) -> Result<()> {
    let traced = ctx.options.function_trace.iter().any(|pattern| name.contains(pattern.as_str()));
    if traced {
        debug!(pass = name, "enter");
    }
    let out = pass(ctx);
    if traced {
        debug!(pass = name, ok = out.is_ok(), "exit");
    }
    out
}

/// Run the full lowering pipeline over a scheduled fusion.
pub fn lower_fusion(
    fusion: &mut Fusion,
    info: &mut RuntimeInfo,
    options: &CompileOptions,
    hooks: &[LoweringHook],
) -> Result<Kernel> {
    let mut ctx = LowerCtx::new(fusion, info, options);

    staged(&mut ctx, "replace_symbolic_sizes", passes::symbolic_sizes::run)?;
    staged(&mut ctx, "build_loop_nests", loops::build_loop_nests)?;
    staged(&mut ctx, "allocation", passes::allocation::run)?;
    staged(&mut ctx, "initialization", passes::init::run)?;
    staged(&mut ctx, "predicate", passes::predicate::run)?;
    staged(&mut ctx, "index_type", passes::index_type::run)?;
    staged(&mut ctx, "vectorized_welford", passes::welford::run)?;
    staged(&mut ctx, "block_sync", passes::sync::run)?;
    staged(&mut ctx, "grid_sync", passes::grid_sync::run)?;
    staged(&mut ctx, "circular_buffer", passes::circular_buffer::run)?;
    staged(&mut ctx, "memory_alias", passes::alias::run)?;

    for hook in hooks {
        hook(&mut ctx)?;
    }

    debug!(nodes = ctx.kernel.num_nodes(), "lowering complete");
    Ok(ctx.kernel)
}

/// A fully scheduled and lowered kernel, plus the decisions that shaped it.
#[derive(Debug)]
pub struct LoweredKernel {
    pub kernel: Kernel,
    pub scheduler: SchedulerKind,
    pub params: HeuristicParams,
}

/// The top-level entry: bind inputs, pick a scheduler, transform the fusion,
/// and lower it. A [`kiln_schedule::Error::SchedulerRejection`] means the
/// caller should segment the fusion and retry per segment.
pub fn schedule_and_lower(
    fusion: &mut Fusion,
    args: &[TensorArg],
    device: kiln_runtime::DeviceCapability,
    options: &CompileOptions,
) -> Result<LoweredKernel> {
    let mut info = RuntimeInfo::bind(fusion, args, device)?;
    let (scheduler, params) =
        kiln_schedule::registry::schedule_fusion(fusion, &mut info, None, options.disable_kernel_reuse)?;
    let kernel = lower_fusion(fusion, &mut info, options, &[])?;
    Ok(LoweredKernel { kernel, scheduler, params })
}

/// Scheduler selection without mutation, for callers that cache kernels.
pub fn choose_heuristic(
    fusion: &Fusion,
    args: &[TensorArg],
    device: kiln_runtime::DeviceCapability,
) -> Result<SchedulerKind> {
    let mut info = RuntimeInfo::bind(fusion, args, device)?;
    let summary = kiln_schedule::HeuristicSummary::new();
    Ok(kiln_schedule::choose_heuristic(fusion, &mut info, &summary)?)
}
