use thiserror::Error;

/// Failures surfaced by the tracking and traversal layers. None of these are
/// recoverable: a failed traversal can leave gradient accumulators in a
/// partial state, and the caller must discard them.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("in-place mutation of a tracked value is unsupported")]
    UnsupportedMutation,

    #[error("{identifier} is not a scalar; backward requires an explicit out-gradient")]
    NotScalar { identifier: String },

    #[error("cycle detected in the computation graph")]
    CyclicGraph,

    #[error("operation {operation} returned {actual} gradient slots for {expected} inputs")]
    GradientArityMismatch {
        operation: &'static str,
        expected: usize,
        actual: usize,
    },
}
