//! Per-invocation runtime information.
//!
//! Built once per kernel launch: bound input metadata, the device's
//! capability table, the smallest usable index type, and per-input alignment
//! and contiguity. Schedulers consult this through [`RuntimeInfo`]; the
//! executor glue infers and allocates output buffers from it.

pub mod device;
pub mod error;
pub mod eval;
pub mod executor;
pub mod info;

#[cfg(test)]
pub mod test;

pub use device::DeviceCapability;
pub use error::{Error, Result};
pub use eval::ExpressionEvaluator;
pub use executor::{OutputBuffer, allocate_outputs, infer_output_shapes};
pub use info::{RuntimeInfo, TensorArg};

use kiln_dtype::DType;

/// Requested kernel index type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexTypeOption {
    /// Pick the smallest type that fits the bound inputs.
    #[default]
    Auto,
    Int32,
    Int64,
}

/// Compilation options threaded through scheduling and lowering.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    pub index_type: IndexTypeOption,
    /// Upper bound for registers per thread handed to the assembler.
    pub maxrregcount: Option<u32>,
    /// Warn (via `tracing`) when the emitter reports a register spill.
    pub warn_register_spill: bool,
    /// Debug-fill freshly allocated output tensors with NaN.
    pub fill_allocation_with_nan: bool,
    /// Always lower from scratch, bypassing the heuristic cache.
    pub disable_kernel_reuse: bool,
    /// Regexes of function names to trace on entry/exit.
    pub function_trace: Vec<String>,
}

impl CompileOptions {
    pub fn resolved_index_type(&self, smallest: DType) -> DType {
        match self.index_type {
            IndexTypeOption::Auto => smallest,
            IndexTypeOption::Int32 => DType::Int32,
            IndexTypeOption::Int64 => DType::Int64,
        }
    }
}
