//! Finite-difference harness for the derivative-rule tests.

use approx::assert_abs_diff_eq;
use ndarray::prelude::*;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;

use crate::graph::{backward, constant, data, leaf, Value};
use crate::reductions::sum;

pub(crate) fn random_array(shape: &[usize]) -> ArrayD<f32> {
    Array::random(shape, Uniform::new(-1.0, 1.0)).into_dyn()
}

/// Central differences. The step is coarse because we're in f32.
pub(crate) fn numerical_gradient(
    function: impl Fn(&ArrayD<f32>) -> f32,
    at: &ArrayD<f32>,
) -> ArrayD<f32> {
    let h = 1e-2;
    let mut gradient = Array::zeros(at.shape()).into_dyn();
    for index in ndarray::indices(at.raw_dim()) {
        let mut ahead = at.clone();
        ahead[index.slice()] += h;
        let mut behind = at.clone();
        behind[index.slice()] -= h;
        gradient[index.slice()] = (function(&ahead) - function(&behind)) / (2.0 * h);
    }
    gradient
}

/// Check a unary tracked operation against finite differences of
/// sum(operation(x)).
pub(crate) fn check_unary_gradient(operation: impl Fn(&Value) -> Value, at: &ArrayD<f32>) {
    let x = leaf(at.clone());
    let total = sum(&operation(&x), None);
    backward(&total, None).expect("traversal should succeed");
    let analytic = x.gradient().expect("leaf should carry a gradient");
    let numerical = numerical_gradient(|a| data(&operation(&constant(a.clone()))).sum(), at);
    assert_abs_diff_eq!(analytic, numerical, epsilon = 1e-2);
}

/// Check a binary tracked operation against finite differences with respect
/// to each argument in turn.
pub(crate) fn check_binary_gradient(
    operation: impl Fn(&Value, &Value) -> Value,
    left: &ArrayD<f32>,
    right: &ArrayD<f32>,
) {
    let a = leaf(left.clone());
    let b = leaf(right.clone());
    let total = sum(&operation(&a, &b), None);
    backward(&total, None).expect("traversal should succeed");

    let numerical_left = numerical_gradient(
        |at| data(&operation(&constant(at.clone()), &constant(right.clone()))).sum(),
        left,
    );
    assert_abs_diff_eq!(
        a.gradient().expect("leaf should carry a gradient"),
        numerical_left,
        epsilon = 1e-2
    );

    let numerical_right = numerical_gradient(
        |at| data(&operation(&constant(left.clone()), &constant(at.clone()))).sum(),
        right,
    );
    assert_abs_diff_eq!(
        b.gradient().expect("leaf should carry a gradient"),
        numerical_right,
        epsilon = 1e-2
    );
}
