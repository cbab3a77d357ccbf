use kiln_dtype::DType;
use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// A literal scalar can never be a fusion input; bind a symbol instead.
    #[snafu(display("invalid input: literal scalar {value:?} cannot be a fusion input"))]
    LiteralFusionInput { value: crate::val::ScalarValue },

    /// The value is not registered with this fusion.
    #[snafu(display("invalid input: value {val} does not belong to this fusion"))]
    ForeignValue { val: crate::val::ValId },

    #[snafu(display("invalid input: tensor rank mismatch, expected {expected} got {actual}"))]
    RankMismatch { expected: usize, actual: usize },

    #[snafu(display("invalid input: reshape totals do not match ({input_elements} vs {output_elements})"))]
    ReshapeSizeMismatch { input_elements: i64, output_elements: i64 },

    #[snafu(display("invalid input: axis {axis} out of range for rank {rank}"))]
    AxisOutOfRange { axis: usize, rank: usize },

    /// Squeeze and broadcast-flag ops only accept broadcast iteration domains.
    #[snafu(display("invalid input: axis {axis} is not a broadcast domain"))]
    NotABroadcast { axis: usize },

    #[snafu(display("invalid input: expected a tensor-valued operand"))]
    ExpectedTensor,

    #[snafu(display("invalid input: {what}"))]
    Malformed { what: String },

    #[snafu(display("type promotion failed: {source}"))]
    Promotion { source: kiln_dtype::Error },

    /// Unrolling a zero-extent axis never terminates expansion.
    #[snafu(display("invalid schedule: cannot unroll an axis of extent 0"))]
    UnrollZeroExtent,

    /// Root/logical/allocation/loop must stay reachable from one another
    /// through the transform DAG.
    #[snafu(display("domain {lhs} and {rhs} of tensor {tv} are not equivalent under the transform DAG"))]
    DomainsNotEquivalent { tv: crate::tensor::TensorViewId, lhs: &'static str, rhs: &'static str },

    #[snafu(display("bf16 requires SM 8.0 or newer, got SM {sm_major}.{sm_minor}"))]
    BFloat16Unsupported { sm_major: u32, sm_minor: u32 },

    #[snafu(display("operation is not defined for dtype {dtype}"))]
    InvalidDTypeForOp { dtype: DType },
}
