use crate::dtype::DType;
use crate::shape::Shape;

/// All errors that can occur within Vole.
///
/// Every failure in the core is a precondition violation or an unsupported
/// configuration. Nothing inside the crate catches and retries; the error is
/// propagated to the caller with a message naming the expected and actual
/// values.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Shape mismatch between two tensors or between a tensor and its node.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Two shapes cannot be broadcast against each other.
    #[error("shapes {lhs} and {rhs} are not broadcast-compatible")]
    BroadcastMismatch { lhs: Shape, rhs: Shape },

    /// Operation requires a specific rank (number of dimensions).
    #[error("rank mismatch: expected rank {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },

    /// Axis index (possibly negative) out of range for the tensor's rank.
    #[error("axis {axis} out of range for shape with {rank} dimensions")]
    AxisOutOfRange { axis: i64, rank: usize },

    /// Cannot reshape because element counts differ.
    #[error(
        "cannot reshape: source has {src} elements, target shape {dst_shape} has {dst} elements"
    )]
    ReshapeElementMismatch {
        src: usize,
        dst: usize,
        dst_shape: Shape,
    },

    /// Transpose permutation does not match the rank or is not a permutation.
    #[error("invalid transpose axes {axes:?} for shape {shape}")]
    InvalidPermutation { axes: Vec<usize>, shape: Shape },

    /// Step index out of bounds along the selected axis.
    #[error("step index {index} out of bounds for axis {axis} with size {size}")]
    StepOutOfBounds {
        index: usize,
        axis: usize,
        size: usize,
    },

    /// A step view is only contiguous when every dimension before `axis` is 1.
    #[error("step along axis {axis} of {shape} is not a contiguous slice")]
    NonContiguousStep { axis: usize, shape: Shape },

    /// A view or subtensor reaches past the end of its memory block.
    #[error("view of {len} elements at offset {offset} exceeds memory of {capacity} elements")]
    ViewOutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },

    /// A shape with a zero-sized dimension where every dimension must be positive.
    #[error("shape {shape} has a zero-sized dimension")]
    ZeroDim { shape: Shape },

    /// DType mismatch between tensors.
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    /// An exact reservation would be exceeded by an allocation.
    #[error("out of memory: requested {requested} bytes, {available} of {reserved} reserved bytes left")]
    OutOfMemory {
        requested: usize,
        available: usize,
        reserved: usize,
    },

    /// A node was read before the forward pass produced its value.
    #[error("node {id} ({kind}) has not been evaluated")]
    NotEvaluated { id: usize, kind: &'static str },

    /// An expression handle was used with a graph that did not create it.
    #[error("expression {id} belongs to graph {owner}, not graph {graph}")]
    ForeignExpr { id: usize, owner: u64, graph: u64 },

    /// A NaN or Inf was produced while `check_nan` is enabled.
    #[error("non-finite value produced by node {id} ({kind})")]
    NonFinite { id: usize, kind: &'static str },

    /// A collective needs more replicas than were supplied.
    #[error("{op} requires at least {required} replicas, got {got}")]
    InsufficientReplicas {
        op: &'static str,
        required: usize,
        got: usize,
    },

    /// The requested configuration is recognised but not implemented.
    #[error("unsupported configuration: {0}")]
    Unsupported(String),

    /// A failure reported by a process-group transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// A lock guarding tensor memory was poisoned by a panicking writer.
    #[error("memory lock poisoned")]
    LockPoisoned,

    /// A worker thread panicked during a collective.
    #[error("worker for shard {0} panicked")]
    WorkerPanicked(usize),

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

/// Convenience Result type used throughout Vole.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
