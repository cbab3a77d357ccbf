use snafu::Snafu;

use kiln_ir::{TensorViewId, ValId};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// int32 indexing was forced but the bound inputs need 64-bit offsets.
    #[snafu(display("index type overflow: int32 requested but max byte offset is {max_offset}"))]
    IndexTypeOverflow { max_offset: i64 },

    #[snafu(display(
        "vectorization stride violation: tensor {tv} extent {extent} is not divisible by vector width {width}"
    ))]
    VectorizationStrideViolation { tv: TensorViewId, extent: i64, width: usize },

    #[snafu(display("vectorization alignment violation: tensor {tv} pointer is aligned to {alignment} bytes, need {required}"))]
    VectorizationAlignmentViolation { tv: TensorViewId, alignment: u64, required: u64 },

    #[snafu(display("wrong number of arguments: fusion has {expected} inputs, got {actual}"))]
    ArgumentCountMismatch { expected: usize, actual: usize },

    #[snafu(display("argument {index} rank mismatch: tensor {tv} has rank {expected}, argument has rank {actual}"))]
    ArgumentRankMismatch { index: usize, tv: TensorViewId, expected: usize, actual: usize },

    #[snafu(display("cannot evaluate value {val}: no binding and no definition"))]
    UnboundValue { val: ValId },

    #[snafu(display("cannot evaluate value {val}: expression kind is not scalar"))]
    NotAScalarExpression { val: ValId },

    #[snafu(display("division by zero while evaluating {val}"))]
    EvalDivisionByZero { val: ValId },

    #[snafu(display("output {tv} aliases input that was not provided"))]
    MissingAliasSource { tv: TensorViewId },
}
