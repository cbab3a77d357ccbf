use snafu::Snafu;

use kiln_ir::TensorViewId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("index type overflow: int32 forced but inputs need {max_offset} byte offsets"))]
    IndexTypeOverflow { max_offset: i64 },

    #[snafu(display("shared memory overflow: kernel needs {required} bytes, device opt-in limit is {limit}"))]
    SharedMemoryOverflow { required: u64, limit: u64 },

    #[snafu(display("grid dimension {dim} needs {required} blocks, limit is {limit}"))]
    GridOverflow { dim: &'static str, required: i64, limit: u64 },

    #[snafu(display(
        "vectorization stride violation: tensor {tv} fails the runtime divisibility check (width {width})"
    ))]
    VectorizationStrideViolation { tv: TensorViewId, width: usize },

    #[snafu(display("tensor {tv} has no loop nest to lower"))]
    MissingLoopNest { tv: TensorViewId },

    #[snafu(display("lowering invariant broken: {what}"))]
    Invariant { what: String },

    #[snafu(display("ir error: {source}"))]
    Ir { source: kiln_ir::Error },

    #[snafu(display("schedule error: {source}"))]
    Schedule { source: kiln_schedule::Error },

    #[snafu(display("runtime error: {source}"))]
    Runtime { source: kiln_runtime::Error },
}

impl From<kiln_ir::Error> for Error {
    fn from(source: kiln_ir::Error) -> Self {
        Self::Ir { source }
    }
}

impl From<kiln_schedule::Error> for Error {
    fn from(source: kiln_schedule::Error) -> Self {
        Self::Schedule { source }
    }
}

impl From<kiln_runtime::Error> for Error {
    fn from(source: kiln_runtime::Error) -> Self {
        Self::Runtime { source }
    }
}
