//! Scheduling layer of the kiln compiler.
//!
//! Sits between the fusion IR and lowering: builds the domain graph, applies
//! loop transformations, and picks a scheduling strategy per fusion.
//!
//! # Module organization
//!
//! - [`compute_at_map`] - disjoint-set graph over iteration domains
//! - [`primitives`] - split/merge/reorder/rFactor/cache/inline/parallelize
//! - [`vectorize`] - vectorization feasibility analysis
//! - [`propagate`] - spanning-tree transform propagation
//! - [`registry`] - scheduler dispatch, heuristic summary and cache
//! - [`pointwise`], [`reduction`], [`persistent`], [`transpose`], [`matmul`] -
//!   the individual schedulers
//! - [`segmenter`] - fallback fusion partitioning interface

pub mod compute_at_map;
pub mod error;
pub mod matmul;
pub mod persistent;
pub mod pointwise;
pub mod primitives;
pub mod propagate;
pub mod reduction;
pub mod registry;
pub mod segmenter;
pub mod transpose;
pub mod vectorize;

#[cfg(test)]
pub mod test;

pub use compute_at_map::{BroadcastConcretization, ComputeAtMap, MappingMode};
pub use error::{Error, Result};
pub use primitives::{
    ComputeAtMode, cache_after, cache_before, circular_buffer, compute_at, inline_at, inline_most, merge,
    parallelize, reorder, rfactor, set_memory_type, split, swizzle2d,
};
pub use registry::{HeuristicCache, HeuristicParams, HeuristicSummary, SchedulerKind, choose_heuristic, schedule_fusion};
pub use segmenter::{Segment, segment_fusion};
