//! Scheduler registry and dispatch.
//!
//! One entry per scheduler kind, consulted in a fixed priority order. Each
//! entry exposes a structural compile-time gate, a size-dependent run-time
//! gate, heuristic computation, and the schedule itself; the first kind whose
//! gates both pass wins. Expensive compile-time analyses are memoized in a
//! [`HeuristicSummary`] so re-dispatch on new inputs only re-binds metadata.

use std::cell::OnceCell;
use std::hash::{Hash, Hasher};

use indexmap::IndexMap;

use tracing::debug;

use kiln_ir::{ExprKind, Fusion, IterType, TensorViewId};
use kiln_runtime::RuntimeInfo;

use crate::compute_at_map::ComputeAtMap;
use crate::error::{Error, Result};
use crate::{matmul, persistent, pointwise, reduction, transpose};

/// Scheduler kinds in dispatch priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(strum::EnumIter, strum::VariantArray)]
pub enum SchedulerKind {
    ExprEval,
    NoOp,
    Matmul,
    Transpose,
    InnerPersistent,
    OuterPersistent,
    InnerOuterPersistent,
    Reduction,
    PointWise,
}

impl SchedulerKind {
    pub const PRIORITY_ORDER: [Self; 9] = [
        Self::ExprEval,
        Self::NoOp,
        Self::Matmul,
        Self::Transpose,
        Self::InnerPersistent,
        Self::OuterPersistent,
        Self::InnerOuterPersistent,
        Self::Reduction,
        Self::PointWise,
    ];
}

/// Parameters computed by `compute_heuristics`, consumed by `schedule`.
#[derive(Debug, Clone, PartialEq)]
pub enum HeuristicParams {
    ExprEval,
    NoOp,
    Pointwise(pointwise::PointwiseParams),
    Reduction(reduction::ReductionParams),
    Persistent(persistent::PersistentParams),
    Transpose(transpose::TransposeParams),
    Matmul(matmul::MatmulParams),
}

/// Memoized compile-time analyses, valid for one fusion.
#[derive(Debug, Default)]
pub struct HeuristicSummary {
    compute_at_map: OnceCell<Option<ComputeAtMap>>,
    reference: OnceCell<Option<TensorViewId>>,
    reduction_exprs: OnceCell<Vec<kiln_ir::ExprId>>,
    structure: OnceCell<FusionStructure>,
}

/// Cheap structural facts shared by every gate.
#[derive(Debug, Clone, Default)]
pub struct FusionStructure {
    pub has_matmul: bool,
    pub has_sdpa: bool,
    pub has_reshard: bool,
    pub has_rng: bool,
    pub num_tensor_exprs: usize,
    pub weakly_connected: bool,
}

impl HeuristicSummary {
    pub fn new() -> Self {
        Self::default()
    }

    /// The domain graph, or `None` when the fusion self-maps.
    pub fn compute_at_map(&self, fusion: &Fusion) -> Option<&ComputeAtMap> {
        self.compute_at_map.get_or_init(|| ComputeAtMap::build(fusion).ok()).as_ref()
    }

    pub fn structure(&self, fusion: &Fusion) -> &FusionStructure {
        self.structure.get_or_init(|| {
            let mut out = FusionStructure { weakly_connected: fusion.is_weakly_connected(), ..Default::default() };
            for expr_id in fusion.expr_ids() {
                let expr = fusion.expr(expr_id);
                let tensor_valued = expr.outputs.iter().any(|&v| fusion.val(v).as_tensor().is_some());
                if tensor_valued {
                    out.num_tensor_exprs += 1;
                }
                match expr.kind {
                    ExprKind::Matmul | ExprKind::Linear | ExprKind::Mma { .. } => out.has_matmul = true,
                    ExprKind::Sdpa => out.has_sdpa = true,
                    ExprKind::Reshard => out.has_reshard = true,
                    ExprKind::Rng { .. } => out.has_rng = true,
                    _ => {}
                }
            }
            out
        })
    }

    pub fn reduction_exprs(&self, fusion: &Fusion) -> &[kiln_ir::ExprId] {
        self.reduction_exprs.get_or_init(|| {
            fusion.expr_ids().filter(|&e| fusion.expr(e).is_reduction()).collect()
        })
    }

    /// Reference tensor: the output with the most non-reduction logical dims,
    /// ties broken by output order.
    pub fn reference(&self, fusion: &Fusion) -> Option<TensorViewId> {
        *self.reference.get_or_init(|| {
            fusion
                .output_tensors()
                .into_iter()
                .map(|tv| {
                    let dims = fusion
                        .tensor(tv)
                        .domain
                        .logical
                        .iter()
                        .filter(|&&id| fusion.iter_domain(id).iter != IterType::Reduction)
                        .count();
                    (tv, dims)
                })
                // max_by_key returns the last maximum; scan manually to keep
                // the first output on ties.
                .fold(None, |best: Option<(TensorViewId, usize)>, (tv, dims)| match best {
                    Some((_, best_dims)) if best_dims >= dims => best,
                    _ => Some((tv, dims)),
                })
                .map(|(tv, _)| tv)
        })
    }
}

/// Structural rejections shared by every single-device scheduler.
fn common_rejection(kind: SchedulerKind, fusion: &Fusion, summary: &HeuristicSummary) -> Option<&'static str> {
    let structure = summary.structure(fusion);
    if structure.has_reshard {
        return Some("resharding ops need a multi-device scheduler");
    }
    if summary.compute_at_map(fusion).is_none() {
        return Some("id graph has a self mapping");
    }
    if !structure.weakly_connected {
        return Some("fusion is not weakly connected");
    }
    if structure.has_matmul && kind != SchedulerKind::Matmul {
        return Some("matmul ops are exclusive to the matmul scheduler");
    }
    if structure.has_sdpa && kind != SchedulerKind::ExprEval {
        return Some("sdpa ops are exclusive to the expression evaluator");
    }
    None
}

impl SchedulerKind {
    pub fn can_schedule_compile_time(self, fusion: &Fusion, summary: &HeuristicSummary) -> bool {
        if let Some(reason) = common_rejection(self, fusion, summary) {
            debug!(kind = ?self, reason, "compile-time rejection");
            return false;
        }
        match self {
            Self::ExprEval => expr_eval_accepts(fusion, summary),
            Self::NoOp => summary.structure(fusion).num_tensor_exprs == 0,
            Self::Matmul => matmul::can_schedule_compile_time(fusion, summary),
            Self::Transpose => transpose::can_schedule_compile_time(fusion, summary),
            Self::InnerPersistent => persistent::can_schedule_compile_time(fusion, summary, persistent::PersistentKind::Inner),
            Self::OuterPersistent => persistent::can_schedule_compile_time(fusion, summary, persistent::PersistentKind::Outer),
            Self::InnerOuterPersistent => {
                persistent::can_schedule_compile_time(fusion, summary, persistent::PersistentKind::InnerOuter)
            }
            Self::Reduction => reduction::can_schedule_compile_time(fusion, summary),
            Self::PointWise => pointwise::can_schedule_compile_time(fusion, summary),
        }
    }

    pub fn can_schedule_run_time(self, fusion: &Fusion, info: &mut RuntimeInfo, summary: &HeuristicSummary) -> bool {
        match self {
            Self::ExprEval | Self::NoOp | Self::PointWise => true,
            Self::Matmul => matmul::can_schedule_run_time(fusion, info, summary),
            Self::Transpose => transpose::can_schedule_run_time(fusion, info, summary),
            Self::InnerPersistent => {
                persistent::can_schedule_run_time(fusion, info, summary, persistent::PersistentKind::Inner)
            }
            Self::OuterPersistent => {
                persistent::can_schedule_run_time(fusion, info, summary, persistent::PersistentKind::Outer)
            }
            Self::InnerOuterPersistent => {
                persistent::can_schedule_run_time(fusion, info, summary, persistent::PersistentKind::InnerOuter)
            }
            Self::Reduction => reduction::can_schedule_run_time(fusion, info, summary),
        }
    }

    pub fn compute_heuristics(
        self,
        fusion: &Fusion,
        info: &mut RuntimeInfo,
        summary: &HeuristicSummary,
    ) -> Result<HeuristicParams> {
        Ok(match self {
            Self::ExprEval => HeuristicParams::ExprEval,
            Self::NoOp => HeuristicParams::NoOp,
            Self::Matmul => HeuristicParams::Matmul(matmul::compute_heuristics(fusion, info, summary)?),
            Self::Transpose => HeuristicParams::Transpose(transpose::compute_heuristics(fusion, info, summary)?),
            Self::InnerPersistent => HeuristicParams::Persistent(persistent::compute_heuristics(
                fusion,
                info,
                summary,
                persistent::PersistentKind::Inner,
            )?),
            Self::OuterPersistent => HeuristicParams::Persistent(persistent::compute_heuristics(
                fusion,
                info,
                summary,
                persistent::PersistentKind::Outer,
            )?),
            Self::InnerOuterPersistent => HeuristicParams::Persistent(persistent::compute_heuristics(
                fusion,
                info,
                summary,
                persistent::PersistentKind::InnerOuter,
            )?),
            Self::Reduction => HeuristicParams::Reduction(reduction::compute_heuristics(fusion, info, summary)?),
            Self::PointWise => HeuristicParams::Pointwise(pointwise::compute_heuristics(fusion, info, summary)?),
        })
    }

    pub fn schedule(self, fusion: &mut Fusion, params: &HeuristicParams, info: &RuntimeInfo) -> Result<()> {
        match (self, params) {
            (Self::ExprEval, HeuristicParams::ExprEval) | (Self::NoOp, HeuristicParams::NoOp) => Ok(()),
            (Self::Matmul, HeuristicParams::Matmul(p)) => matmul::schedule(fusion, p, info),
            (Self::Transpose, HeuristicParams::Transpose(p)) => transpose::schedule(fusion, p, info),
            (
                Self::InnerPersistent | Self::OuterPersistent | Self::InnerOuterPersistent,
                HeuristicParams::Persistent(p),
            ) => persistent::schedule(fusion, p, info),
            (Self::Reduction, HeuristicParams::Reduction(p)) => reduction::schedule(fusion, p, info),
            (Self::PointWise, HeuristicParams::Pointwise(p)) => pointwise::schedule(fusion, p, info),
            _ => Err(Error::InvalidSchedule { reason: "heuristic params do not match scheduler kind".into() }),
        }
    }
}

fn expr_eval_accepts(fusion: &Fusion, summary: &HeuristicSummary) -> bool {
    if summary.structure(fusion).has_sdpa {
        return true;
    }
    // Also covers alias-only fusions the evaluator resolves without a kernel.
    !fusion.outputs().is_empty()
        && fusion.outputs().iter().all(|o| !matches!(o.alias, kiln_ir::OutputAlias::New))
}

/// Pick the winning scheduler without mutating the fusion.
pub fn choose_heuristic(fusion: &Fusion, info: &mut RuntimeInfo, summary: &HeuristicSummary) -> Result<SchedulerKind> {
    for kind in SchedulerKind::PRIORITY_ORDER {
        if kind.can_schedule_compile_time(fusion, summary) && kind.can_schedule_run_time(fusion, info, summary) {
            debug!(?kind, "selected scheduler");
            return Ok(kind);
        }
    }
    Err(Error::SchedulerRejection)
}

/// Fingerprint of the input metadata a cached heuristic decision depends on.
fn concretization_fingerprint(fusion: &Fusion, info: &RuntimeInfo) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    info.smallest_index_type.hash(&mut hasher);
    for tv in fusion.input_tensors() {
        fusion.tensor(tv).dtype.hash(&mut hasher);
        fusion.tensor(tv).rank().hash(&mut hasher);
        if let Some(contiguity) = info.contiguity_of(tv) {
            contiguity.hash(&mut hasher);
        }
    }
    hasher.finish()
}

/// Heuristic decisions persisted across invocations of the same fusion,
/// keyed by device and input fingerprint.
#[derive(Debug, Default)]
pub struct HeuristicCache {
    entries: IndexMap<(u32, u32, u64), (SchedulerKind, HeuristicParams)>,
}

impl HeuristicCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn key(&self, fusion: &Fusion, info: &RuntimeInfo) -> (u32, u32, u64) {
        (info.device.sm_major, info.device.sm_minor, concretization_fingerprint(fusion, info))
    }

    pub fn lookup(&self, fusion: &Fusion, info: &RuntimeInfo) -> Option<&(SchedulerKind, HeuristicParams)> {
        self.entries.get(&self.key(fusion, info))
    }

    pub fn insert(&mut self, fusion: &Fusion, info: &RuntimeInfo, kind: SchedulerKind, params: HeuristicParams) {
        let key = self.key(fusion, info);
        self.entries.insert(key, (kind, params));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Dispatch and apply: pick the scheduler, compute (or re-use) heuristics,
/// and transform the fusion in place.
pub fn schedule_fusion(
    fusion: &mut Fusion,
    info: &mut RuntimeInfo,
    cache: Option<&mut HeuristicCache>,
    disable_reuse: bool,
) -> Result<(SchedulerKind, HeuristicParams)> {
    let summary = HeuristicSummary::new();

    if let Some(cache) = &cache {
        if !disable_reuse {
            if let Some((kind, params)) = cache.lookup(fusion, info) {
                let (kind, params) = (*kind, params.clone());
                kind.schedule(fusion, &params, info)?;
                return Ok((kind, params));
            }
        }
    }

    let kind = choose_heuristic(fusion, info, &summary)?;
    let params = kind.compute_heuristics(fusion, info, &summary)?;
    kind.schedule(fusion, &params, info)?;

    if let Some(cache) = cache {
        if disable_reuse {
            cache.clear();
        }
        cache.insert(fusion, info, kind, params.clone());
    }
    Ok((kind, params))
}
