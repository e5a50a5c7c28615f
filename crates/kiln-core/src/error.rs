use crate::dtype::DType;
use crate::shape::Shape;

/// All errors that can occur within kiln.
///
/// A single error type is shared by every crate in the workspace: graph
/// construction, job compilation, and kernel execution all propagate the same
/// enum, which keeps `?` chains flat across crate boundaries.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Shape mismatch between a declared contract and a provided value.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Operation requires a specific rank.
    #[error("rank mismatch: expected rank {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },

    /// DType mismatch between two operands or a contract and a value.
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    /// Two shapes cannot be broadcast together.
    #[error("shapes {lhs} and {rhs} are not broadcast-compatible")]
    BroadcastMismatch { lhs: Shape, rhs: Shape },

    /// Dimension index out of range for the tensor's rank.
    #[error("dimension out of range: dim {dim} for rank {rank}")]
    DimOutOfRange { dim: usize, rank: usize },

    /// Element count mismatch when creating a tensor from a slice.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Cannot reshape because element counts differ.
    #[error("cannot reshape: source has {src} elements, target shape {dst_shape} has {dst}")]
    ReshapeElementMismatch {
        src: usize,
        dst: usize,
        dst_shape: Shape,
    },

    /// A job was invoked with the wrong number of arguments.
    #[error("job '{job}' takes {expected} inputs, got {got}")]
    InputArityMismatch {
        job: String,
        expected: usize,
        got: usize,
    },

    /// An input did not match its placeholder contract.
    #[error("input '{placeholder}' violates its declared contract: {reason}")]
    PlaceholderViolation { placeholder: String, reason: String },

    /// An execution engine does not implement the requested operation.
    #[error("{engine} engine does not support op '{op}'")]
    UnsupportedOp { engine: String, op: String },

    /// Lookup of a compiled job that was never registered (or was cleared).
    #[error("no job named '{0}' in this session")]
    UnknownJob(String),

    /// Lookup of a graph output that does not exist.
    #[error("no output named '{0}'")]
    UnknownOutput(String),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }
}

/// Convenience Result type used throughout kiln.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
