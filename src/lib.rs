#![allow(mixed_script_confusables)]

//! A dynamic reverse-mode differentiation tracker for array computations.
//!
//! Wrap arrays as tracked [`Value`]s, compute with the provided primitives
//! (or any elementwise function, via [`broadcast_apply`]), and call
//! [`backward`] on the result; every tracked input's gradient accumulator
//! then holds the derivative of the result with respect to that input. The
//! graph is implicit: each primitive call on a tracked argument records
//! itself, and the backward traversal walks the records in reverse
//! topological order.

mod broadcast;
mod dual;
mod error;
mod graph;
#[cfg(test)]
mod gradient_check;
mod nn;
mod operations;
mod reductions;
mod registry;

pub use broadcast::broadcast_apply;
pub use dual::Dual;
pub use error::TrackerError;
pub use graph::{
    back, backward, constant, data, gradient, leaf, track, CallRecord, TrackedValue,
    TrackedValueBuilder, Value,
};
pub use nn::{conv2d, kernels, log_softmax, max_pool2d, mean_pool2d, softmax};
pub use operations::{
    add, concatenate_along, diagonal, dot, hcat, matmul, multiply, negate, permute, repeat,
    reshape, slice, take, transpose, vcat, Operation,
};
pub use reductions::{maximum, mean, minimum, product, sum};
pub use registry::{descriptor, Arity, OperationDescriptor};
