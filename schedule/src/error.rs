use snafu::Snafu;

use kiln_ir::{IterDomainId, TensorViewId};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Two distinct axes of the same tensor fell into one exact set.
    #[snafu(display("self mapping: axes {a} and {b} of tensor {tv} are exact-mapped"))]
    SelfMapping { tv: TensorViewId, a: IterDomainId, b: IterDomainId },

    #[snafu(display("axis {axis} out of bounds for loop domain of rank {rank}"))]
    AxisOutOfBounds { axis: usize, rank: usize },

    #[snafu(display("invalid schedule: {reason}"))]
    InvalidSchedule { reason: String },

    #[snafu(display("{what} requires SM {required_major}.0 or newer, target is SM {sm_major}.{sm_minor}"))]
    UnsupportedHardware { what: &'static str, required_major: u32, sm_major: u32, sm_minor: u32 },

    #[snafu(display("resource overflow: {resource} needs {required} but the device limit is {limit}"))]
    ResourceOverflow { resource: &'static str, required: u64, limit: u64 },

    #[snafu(display("broadcast axis {id} concretizes to multiple mismatched extents"))]
    NonUniquelyConcretizedBroadcast { id: IterDomainId },

    /// Every scheduler rejected the fusion; the caller must segment.
    #[snafu(display("no scheduler accepted the fusion; segment and retry"))]
    SchedulerRejection,

    #[snafu(display("circular buffering needs depth >= 2, got {depth}"))]
    CircularBufferDepth { depth: usize },

    #[snafu(display("compute-at position {pos} exceeds compatible depth {max} with consumer {consumer}"))]
    ComputeAtDepth { pos: usize, max: usize, consumer: TensorViewId },

    #[snafu(display("ir error: {source}"))]
    Ir { source: kiln_ir::Error },

    #[snafu(display("runtime error: {source}"))]
    Runtime { source: kiln_runtime::Error },
}

impl From<kiln_ir::Error> for Error {
    fn from(source: kiln_ir::Error) -> Self {
        Self::Ir { source }
    }
}

impl From<kiln_runtime::Error> for Error {
    fn from(source: kiln_runtime::Error) -> Self {
        Self::Runtime { source }
    }
}
