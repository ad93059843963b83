use std::rc::Rc;

use ndarray::prelude::*;

use crate::graph::{track, TrackedValue, Value};
use crate::operations::Operation;

/// The raw array math, separated from graph bookkeeping so the backward
/// passes (and tests) can call it directly.
pub mod kernels {
    use ndarray::prelude::*;

    /// Softmax along the last axis, shifted by the lane maximum for
    /// stability. exp(x − max) never overflows.
    pub fn softmax(input: &ArrayViewD<f32>) -> ArrayD<f32> {
        let mut output = input.to_owned();
        let last = output.ndim() - 1;
        for mut lane in output.lanes_mut(Axis(last)) {
            let top = lane.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            lane.mapv_inplace(|x| (x - top).exp());
            let normalizer = lane.sum();
            lane.mapv_inplace(|e| e / normalizer);
        }
        output
    }

    /// s ⊙ (Δ − ⟨Δ, s⟩) per lane, which is the softmax Jacobian applied to Δ
    /// without materializing the Jacobian.
    pub fn softmax_backward(out_gradient: &ArrayD<f32>, output: &ArrayD<f32>) -> ArrayD<f32> {
        let mut gradient = out_gradient * output;
        let last = gradient.ndim() - 1;
        for (mut lane, s_lane) in gradient
            .lanes_mut(Axis(last))
            .into_iter()
            .zip(output.lanes(Axis(last)))
        {
            let inner = lane.sum();
            for (slot, &s) in lane.iter_mut().zip(s_lane) {
                *slot -= inner * s;
            }
        }
        gradient
    }

    pub fn log_softmax(input: &ArrayViewD<f32>) -> ArrayD<f32> {
        let mut output = input.to_owned();
        let last = output.ndim() - 1;
        for mut lane in output.lanes_mut(Axis(last)) {
            let top = lane.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let normalizer = lane.iter().map(|&x| (x - top).exp()).sum::<f32>().ln();
            lane.mapv_inplace(|x| x - top - normalizer);
        }
        output
    }

    /// Δ − exp(output) · ΣΔ per lane.
    pub fn log_softmax_backward(out_gradient: &ArrayD<f32>, output: &ArrayD<f32>) -> ArrayD<f32> {
        let mut gradient = out_gradient.clone();
        let last = gradient.ndim() - 1;
        for (mut lane, out_lane) in gradient
            .lanes_mut(Axis(last))
            .into_iter()
            .zip(output.lanes(Axis(last)))
        {
            let total = lane.sum();
            for (slot, &o) in lane.iter_mut().zip(out_lane) {
                *slot -= o.exp() * total;
            }
        }
        gradient
    }

    /// Valid-region cross-correlation of a 2-D signal with a 2-D kernel.
    pub fn conv2d(signal: &ArrayView2<f32>, kernel: &ArrayView2<f32>) -> Array2<f32> {
        let (height, width) = signal.dim();
        let (kernel_height, kernel_width) = kernel.dim();
        assert!(
            kernel_height <= height && kernel_width <= width,
            "kernel should fit within the signal"
        );
        let out_height = height - kernel_height + 1;
        let out_width = width - kernel_width + 1;
        Array2::from_shape_fn((out_height, out_width), |(i, j)| {
            let mut accumulator = 0.;
            for a in 0..kernel_height {
                for b in 0..kernel_width {
                    accumulator += signal[[i + a, j + b]] * kernel[[a, b]];
                }
            }
            accumulator
        })
    }

    pub fn conv2d_backward_signal(
        out_gradient: &ArrayView2<f32>,
        kernel: &ArrayView2<f32>,
        signal_shape: (usize, usize),
    ) -> Array2<f32> {
        let (kernel_height, kernel_width) = kernel.dim();
        let mut gradient = Array2::zeros(signal_shape);
        for ((i, j), &δ) in out_gradient.indexed_iter() {
            for a in 0..kernel_height {
                for b in 0..kernel_width {
                    gradient[[i + a, j + b]] += δ * kernel[[a, b]];
                }
            }
        }
        gradient
    }

    pub fn conv2d_backward_kernel(
        out_gradient: &ArrayView2<f32>,
        signal: &ArrayView2<f32>,
        kernel_shape: (usize, usize),
    ) -> Array2<f32> {
        let mut gradient = Array2::zeros(kernel_shape);
        for ((i, j), &δ) in out_gradient.indexed_iter() {
            for a in 0..kernel_shape.0 {
                for b in 0..kernel_shape.1 {
                    gradient[[a, b]] += δ * signal[[i + a, j + b]];
                }
            }
        }
        gradient
    }

    fn pooled_dimensions(input: &ArrayView2<f32>, window: (usize, usize)) -> (usize, usize) {
        // trailing rows and columns that don't fill a window are dropped
        let (height, width) = input.dim();
        (height / window.0, width / window.1)
    }

    /// First occurrence wins within each window, for gradient routing.
    fn window_argmax(
        input: &ArrayView2<f32>,
        window: (usize, usize),
        i: usize,
        j: usize,
    ) -> (usize, usize) {
        let mut best = f32::NEG_INFINITY;
        let mut position = (i * window.0, j * window.1);
        for a in 0..window.0 {
            for b in 0..window.1 {
                let coordinate = (i * window.0 + a, j * window.1 + b);
                if input[coordinate] > best {
                    best = input[coordinate];
                    position = coordinate;
                }
            }
        }
        position
    }

    pub fn max_pool2d(input: &ArrayView2<f32>, window: (usize, usize)) -> Array2<f32> {
        let (out_height, out_width) = pooled_dimensions(input, window);
        Array2::from_shape_fn((out_height, out_width), |(i, j)| {
            input[window_argmax(input, window, i, j)]
        })
    }

    pub fn max_pool2d_backward(
        out_gradient: &ArrayView2<f32>,
        input: &ArrayView2<f32>,
        window: (usize, usize),
    ) -> Array2<f32> {
        let mut gradient = Array2::zeros(input.dim());
        for ((i, j), &δ) in out_gradient.indexed_iter() {
            gradient[window_argmax(input, window, i, j)] += δ;
        }
        gradient
    }

    pub fn mean_pool2d(input: &ArrayView2<f32>, window: (usize, usize)) -> Array2<f32> {
        let (out_height, out_width) = pooled_dimensions(input, window);
        let count = (window.0 * window.1) as f32;
        Array2::from_shape_fn((out_height, out_width), |(i, j)| {
            let mut accumulator = 0.;
            for a in 0..window.0 {
                for b in 0..window.1 {
                    accumulator += input[[i * window.0 + a, j * window.1 + b]];
                }
            }
            accumulator / count
        })
    }

    pub fn mean_pool2d_backward(
        out_gradient: &ArrayView2<f32>,
        input_shape: (usize, usize),
        window: (usize, usize),
    ) -> Array2<f32> {
        let count = (window.0 * window.1) as f32;
        let mut gradient = Array2::zeros(input_shape);
        for ((i, j), &δ) in out_gradient.indexed_iter() {
            for a in 0..window.0 {
                for b in 0..window.1 {
                    gradient[[i * window.0 + a, j * window.1 + b]] += δ / count;
                }
            }
        }
        gradient
    }
}

pub struct Softmax {}

impl Operation for Softmax {
    fn name(&self) -> &'static str {
        "softmax"
    }

    fn evaluate(&self, inputs: &[ArrayViewD<f32>]) -> ArrayD<f32> {
        kernels::softmax(&inputs[0])
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        inputs: &[Rc<TrackedValue>],
    ) -> Vec<Option<ArrayD<f32>>> {
        // recompute the forward output rather than storing it on the record
        let output = kernels::softmax(&inputs[0].data().view());
        vec![Some(kernels::softmax_backward(out_gradient, &output))]
    }
}

pub struct LogSoftmax {}

impl Operation for LogSoftmax {
    fn name(&self) -> &'static str {
        "log_softmax"
    }

    fn evaluate(&self, inputs: &[ArrayViewD<f32>]) -> ArrayD<f32> {
        kernels::log_softmax(&inputs[0])
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        inputs: &[Rc<TrackedValue>],
    ) -> Vec<Option<ArrayD<f32>>> {
        let output = kernels::log_softmax(&inputs[0].data().view());
        vec![Some(kernels::log_softmax_backward(out_gradient, &output))]
    }
}

pub struct Convolution2d {}

impl Operation for Convolution2d {
    fn name(&self) -> &'static str {
        "conv2d"
    }

    fn evaluate(&self, inputs: &[ArrayViewD<f32>]) -> ArrayD<f32> {
        let signal = inputs[0]
            .clone()
            .into_dimensionality::<Ix2>()
            .expect("signal should be two-dimensional");
        let kernel = inputs[1]
            .clone()
            .into_dimensionality::<Ix2>()
            .expect("kernel should be two-dimensional");
        kernels::conv2d(&signal, &kernel).into_dyn()
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        inputs: &[Rc<TrackedValue>],
    ) -> Vec<Option<ArrayD<f32>>> {
        let signal_data = inputs[0].data();
        let kernel_data = inputs[1].data();
        let signal = signal_data
            .view()
            .into_dimensionality::<Ix2>()
            .expect("signal should be two-dimensional");
        let kernel = kernel_data
            .view()
            .into_dimensionality::<Ix2>()
            .expect("kernel should be two-dimensional");
        let δ = out_gradient
            .view()
            .into_dimensionality::<Ix2>()
            .expect("out-gradient should be two-dimensional");
        vec![
            Some(kernels::conv2d_backward_signal(&δ, &kernel, signal.dim()).into_dyn()),
            Some(kernels::conv2d_backward_kernel(&δ, &signal, kernel.dim()).into_dyn()),
        ]
    }
}

pub struct MaxPool2d {
    pub window: (usize, usize),
}

impl Operation for MaxPool2d {
    fn name(&self) -> &'static str {
        "max_pool2d"
    }

    fn evaluate(&self, inputs: &[ArrayViewD<f32>]) -> ArrayD<f32> {
        let input = inputs[0]
            .clone()
            .into_dimensionality::<Ix2>()
            .expect("input should be two-dimensional");
        kernels::max_pool2d(&input, self.window).into_dyn()
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        inputs: &[Rc<TrackedValue>],
    ) -> Vec<Option<ArrayD<f32>>> {
        let input_data = inputs[0].data();
        let input = input_data
            .view()
            .into_dimensionality::<Ix2>()
            .expect("input should be two-dimensional");
        let δ = out_gradient
            .view()
            .into_dimensionality::<Ix2>()
            .expect("out-gradient should be two-dimensional");
        vec![Some(
            kernels::max_pool2d_backward(&δ, &input, self.window).into_dyn(),
        )]
    }
}

pub struct MeanPool2d {
    pub window: (usize, usize),
}

impl Operation for MeanPool2d {
    fn name(&self) -> &'static str {
        "mean_pool2d"
    }

    fn evaluate(&self, inputs: &[ArrayViewD<f32>]) -> ArrayD<f32> {
        let input = inputs[0]
            .clone()
            .into_dimensionality::<Ix2>()
            .expect("input should be two-dimensional");
        kernels::mean_pool2d(&input, self.window).into_dyn()
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        inputs: &[Rc<TrackedValue>],
    ) -> Vec<Option<ArrayD<f32>>> {
        let input_data = inputs[0].data();
        let input = input_data
            .view()
            .into_dimensionality::<Ix2>()
            .expect("input should be two-dimensional");
        let δ = out_gradient
            .view()
            .into_dimensionality::<Ix2>()
            .expect("out-gradient should be two-dimensional");
        vec![Some(
            kernels::mean_pool2d_backward(&δ, input.dim(), self.window).into_dyn(),
        )]
    }
}

pub fn softmax(x: &Value) -> Value {
    track(Box::new(Softmax {}), vec![x.clone()])
}

pub fn log_softmax(x: &Value) -> Value {
    track(Box::new(LogSoftmax {}), vec![x.clone()])
}

pub fn conv2d(signal: &Value, kernel: &Value) -> Value {
    track(
        Box::new(Convolution2d {}),
        vec![signal.clone(), kernel.clone()],
    )
}

pub fn max_pool2d(x: &Value, window: (usize, usize)) -> Value {
    track(Box::new(MaxPool2d { window }), vec![x.clone()])
}

pub fn mean_pool2d(x: &Value, window: (usize, usize)) -> Value {
    track(Box::new(MeanPool2d { window }), vec![x.clone()])
}
