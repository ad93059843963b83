use std::rc::Rc;

use ndarray::prelude::*;
use ndarray::IxDyn;

use crate::dual::Dual;
use crate::graph::{track, TrackedValue, Value};
use crate::operations::Operation;

/// Sum a gradient down to the shape an operand had before broadcasting:
/// collapse the prepended axes, then the axes that were stretched from
/// length one.
pub(crate) fn unbroadcast(gradient: &ArrayD<f32>, shape: &[usize]) -> ArrayD<f32> {
    let mut gradient = gradient.clone();
    while gradient.ndim() > shape.len() {
        gradient = gradient.sum_axis(Axis(0));
    }
    for (axis, &extent) in shape.iter().enumerate() {
        if gradient.shape()[axis] != extent {
            gradient = gradient.sum_axis(Axis(axis)).insert_axis(Axis(axis));
        }
    }
    gradient
}

/// The result shape of co-broadcasting, aligning shapes at their trailing
/// dimensions.
fn broadcast_shape(shapes: &[Vec<usize>]) -> Vec<usize> {
    let ndim = shapes.iter().map(|shape| shape.len()).max().unwrap_or(0);
    let mut result = vec![1; ndim];
    for shape in shapes {
        let offset = ndim - shape.len();
        for (dimension, &extent) in shape.iter().enumerate() {
            let slot = &mut result[offset + dimension];
            if *slot == 1 {
                *slot = extent;
            } else {
                assert!(
                    extent == 1 || extent == *slot,
                    "shapes should be broadcast-compatible"
                );
            }
        }
    }
    result
}

/// The operand coordinate that a result coordinate reads from: trailing-axis
/// aligned, pinned to zero along stretched axes.
fn source_coordinate(index: &IxDyn, shape: &[usize], result_dimensionality: usize) -> Vec<usize> {
    let offset = result_dimensionality - shape.len();
    shape
        .iter()
        .enumerate()
        .map(|(dimension, &extent)| {
            if extent == 1 {
                0
            } else {
                index[offset + dimension]
            }
        })
        .collect()
}

/// Elementwise application of a user-supplied function, differentiated by
/// evaluating the function over dual numbers. The signature forces the
/// function to return a dual, so its derivative can never be silently
/// dropped. The backward pass re-evaluates the function instead of storing
/// per-element partials from the forward pass.
pub struct BroadcastApply {
    pub function: Box<dyn Fn(&[Dual<f32>]) -> Dual<f32>>,
}

impl BroadcastApply {
    fn arguments_at(&self, index: &IxDyn, inputs: &[ArrayViewD<f32>]) -> Vec<Dual<f32>> {
        let width = inputs.len();
        inputs
            .iter()
            .enumerate()
            .map(|(slot, input)| {
                let coordinate = source_coordinate(index, input.shape(), index.ndim());
                Dual::seeded(input[coordinate.as_slice()], width, slot)
            })
            .collect()
    }
}

impl Operation for BroadcastApply {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    fn evaluate(&self, inputs: &[ArrayViewD<f32>]) -> ArrayD<f32> {
        let shapes = inputs
            .iter()
            .map(|input| input.shape().to_vec())
            .collect::<Vec<_>>();
        let result_shape = broadcast_shape(&shapes);
        ArrayD::from_shape_fn(IxDyn(&result_shape), |index| {
            (self.function)(&self.arguments_at(&index, inputs)).value()
        })
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        inputs: &[Rc<TrackedValue>],
    ) -> Vec<Option<ArrayD<f32>>> {
        let data = inputs.iter().map(|input| input.data()).collect::<Vec<_>>();
        let views = data.iter().map(|array| array.view()).collect::<Vec<_>>();
        let mut gradients = views
            .iter()
            .map(|view| Array::zeros(view.shape()).into_dyn())
            .collect::<Vec<_>>();
        for (index, &δ) in out_gradient.indexed_iter() {
            let result = (self.function)(&self.arguments_at(&index, &views));
            for (slot, gradient) in gradients.iter_mut().enumerate() {
                // accumulating at the source coordinate sums over the
                // stretched axes as a side effect
                let coordinate = source_coordinate(&index, views[slot].shape(), index.ndim());
                gradient[coordinate.as_slice()] += δ * result.partial(slot);
            }
        }
        gradients.into_iter().map(Some).collect()
    }
}

pub fn broadcast_apply<F>(function: F, inputs: &[Value]) -> Value
where
    F: Fn(&[Dual<f32>]) -> Dual<f32> + 'static,
{
    track(
        Box::new(BroadcastApply {
            function: Box::new(function),
        }),
        inputs.to_vec(),
    )
}
