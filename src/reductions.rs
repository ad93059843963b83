use std::rc::Rc;

use ndarray::prelude::*;
use ndarray::arr0;

use crate::graph::{track, TrackedValue, Value};
use crate::operations::Operation;

/// Reducers collapse either the whole array (axis `None`, yielding a
/// zero-dimensional result) or one axis (axis `Some`, dropping that axis
/// from the shape).

fn broadcast_over(out_gradient: &ArrayD<f32>, axis: Option<usize>, shape: &[usize]) -> ArrayD<f32> {
    match axis {
        None => {
            let δ = *out_gradient
                .iter()
                .next()
                .expect("out-gradient should be a scalar");
            Array::from_elem(shape, δ).into_dyn()
        }
        Some(axis) => out_gradient
            .clone()
            .insert_axis(Axis(axis))
            .broadcast(shape)
            .expect("reduced gradient should broadcast over the original shape")
            .to_owned(),
    }
}

pub struct Sum {
    pub axis: Option<usize>,
}

impl Operation for Sum {
    fn name(&self) -> &'static str {
        "sum"
    }

    fn evaluate(&self, inputs: &[ArrayViewD<f32>]) -> ArrayD<f32> {
        match self.axis {
            None => arr0(inputs[0].sum()).into_dyn(),
            Some(axis) => inputs[0].sum_axis(Axis(axis)),
        }
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        inputs: &[Rc<TrackedValue>],
    ) -> Vec<Option<ArrayD<f32>>> {
        vec![Some(broadcast_over(
            out_gradient,
            self.axis,
            inputs[0].data().shape(),
        ))]
    }
}

pub struct Mean {
    pub axis: Option<usize>,
}

impl Operation for Mean {
    fn name(&self) -> &'static str {
        "mean"
    }

    fn evaluate(&self, inputs: &[ArrayViewD<f32>]) -> ArrayD<f32> {
        match self.axis {
            None => arr0(inputs[0].sum() / inputs[0].len() as f32).into_dyn(),
            Some(axis) => inputs[0]
                .mean_axis(Axis(axis))
                .expect("reduced axis should be non-empty"),
        }
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        inputs: &[Rc<TrackedValue>],
    ) -> Vec<Option<ArrayD<f32>>> {
        let shape = inputs[0].data().shape().to_vec();
        let count = match self.axis {
            None => inputs[0].data().len(),
            Some(axis) => shape[axis],
        } as f32;
        vec![Some(
            broadcast_over(out_gradient, self.axis, &shape) / count,
        )]
    }
}

/// Gradient of each element of a product is the product of all the others,
/// computed as exclusive prefix and suffix products so that zeros in the
/// input don't poison the whole row (as division by the element would).
fn exclusive_products(lane: &[f32]) -> Vec<f32> {
    let n = lane.len();
    let mut products = vec![1.; n];
    let mut prefix = 1.;
    for i in 0..n {
        products[i] = prefix;
        prefix *= lane[i];
    }
    let mut suffix = 1.;
    for i in (0..n).rev() {
        products[i] *= suffix;
        suffix *= lane[i];
    }
    products
}

pub struct Product {
    pub axis: Option<usize>,
}

impl Operation for Product {
    fn name(&self) -> &'static str {
        "product"
    }

    fn evaluate(&self, inputs: &[ArrayViewD<f32>]) -> ArrayD<f32> {
        match self.axis {
            None => arr0(inputs[0].product()).into_dyn(),
            Some(axis) => inputs[0].map_axis(Axis(axis), |lane| lane.product()),
        }
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        inputs: &[Rc<TrackedValue>],
    ) -> Vec<Option<ArrayD<f32>>> {
        let data = inputs[0].data();
        let mut gradient = Array::zeros(data.shape()).into_dyn();
        match self.axis {
            None => {
                let δ = *out_gradient
                    .iter()
                    .next()
                    .expect("out-gradient should be a scalar");
                let elements = data.iter().copied().collect::<Vec<_>>();
                for (slot, exclusive) in gradient.iter_mut().zip(exclusive_products(&elements)) {
                    *slot = δ * exclusive;
                }
            }
            Some(axis) => {
                for ((lane, mut gradient_lane), &δ) in data
                    .lanes(Axis(axis))
                    .into_iter()
                    .zip(gradient.lanes_mut(Axis(axis)))
                    .zip(out_gradient.iter())
                {
                    let elements = lane.iter().copied().collect::<Vec<_>>();
                    for (slot, exclusive) in
                        gradient_lane.iter_mut().zip(exclusive_products(&elements))
                    {
                        *slot = δ * exclusive;
                    }
                }
            }
        }
        vec![Some(gradient)]
    }
}

/// Ties route the whole gradient to the first occurrence.
fn leading_extremum(lane: &[f32], minimize: bool) -> (usize, f32) {
    let mut position = 0;
    let mut best = lane[0];
    for (index, &candidate) in lane.iter().enumerate().skip(1) {
        let better = if minimize {
            candidate < best
        } else {
            candidate > best
        };
        if better {
            position = index;
            best = candidate;
        }
    }
    (position, best)
}

fn evaluate_extremum(input: &ArrayViewD<f32>, axis: Option<usize>, minimize: bool) -> ArrayD<f32> {
    match axis {
        None => {
            let elements = input.iter().copied().collect::<Vec<_>>();
            arr0(leading_extremum(&elements, minimize).1).into_dyn()
        }
        Some(axis) => input.map_axis(Axis(axis), |lane| {
            let elements = lane.iter().copied().collect::<Vec<_>>();
            leading_extremum(&elements, minimize).1
        }),
    }
}

fn extremum_backward(
    out_gradient: &ArrayD<f32>,
    input: &ArrayD<f32>,
    axis: Option<usize>,
    minimize: bool,
) -> ArrayD<f32> {
    let mut gradient = Array::zeros(input.shape()).into_dyn();
    match axis {
        None => {
            let δ = *out_gradient
                .iter()
                .next()
                .expect("out-gradient should be a scalar");
            let elements = input.iter().copied().collect::<Vec<_>>();
            let (position, _) = leading_extremum(&elements, minimize);
            *gradient
                .iter_mut()
                .nth(position)
                .expect("winning position should be in bounds") = δ;
        }
        Some(axis) => {
            for ((lane, mut gradient_lane), &δ) in input
                .lanes(Axis(axis))
                .into_iter()
                .zip(gradient.lanes_mut(Axis(axis)))
                .zip(out_gradient.iter())
            {
                let elements = lane.iter().copied().collect::<Vec<_>>();
                let (position, _) = leading_extremum(&elements, minimize);
                gradient_lane[position] = δ;
            }
        }
    }
    gradient
}

pub struct Maximum {
    pub axis: Option<usize>,
}

impl Operation for Maximum {
    fn name(&self) -> &'static str {
        "maximum"
    }

    fn evaluate(&self, inputs: &[ArrayViewD<f32>]) -> ArrayD<f32> {
        evaluate_extremum(&inputs[0], self.axis, false)
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        inputs: &[Rc<TrackedValue>],
    ) -> Vec<Option<ArrayD<f32>>> {
        vec![Some(extremum_backward(
            out_gradient,
            &inputs[0].data(),
            self.axis,
            false,
        ))]
    }
}

pub struct Minimum {
    pub axis: Option<usize>,
}

impl Operation for Minimum {
    fn name(&self) -> &'static str {
        "minimum"
    }

    fn evaluate(&self, inputs: &[ArrayViewD<f32>]) -> ArrayD<f32> {
        evaluate_extremum(&inputs[0], self.axis, true)
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        inputs: &[Rc<TrackedValue>],
    ) -> Vec<Option<ArrayD<f32>>> {
        vec![Some(extremum_backward(
            out_gradient,
            &inputs[0].data(),
            self.axis,
            true,
        ))]
    }
}

pub fn sum(x: &Value, axis: Option<usize>) -> Value {
    track(Box::new(Sum { axis }), vec![x.clone()])
}

pub fn mean(x: &Value, axis: Option<usize>) -> Value {
    track(Box::new(Mean { axis }), vec![x.clone()])
}

pub fn product(x: &Value, axis: Option<usize>) -> Value {
    track(Box::new(Product { axis }), vec![x.clone()])
}

pub fn maximum(x: &Value, axis: Option<usize>) -> Value {
    track(Box::new(Maximum { axis }), vec![x.clone()])
}

pub fn minimum(x: &Value, axis: Option<usize>) -> Value {
    track(Box::new(Minimum { axis }), vec![x.clone()])
}
