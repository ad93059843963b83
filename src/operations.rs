use std::ops::Range;
use std::rc::Rc;

use ndarray::prelude::*;
use ndarray::{arr0, concatenate, SliceInfoElem};

use crate::broadcast::unbroadcast;
use crate::graph::{track, TrackedValue, Value};

/// One derivative rule. `evaluate` computes the primal result from the
/// inputs' raw data; `backward` maps an upstream gradient to one slot per
/// input, where `None` marks a non-differentiable input (index sequences and
/// the like). Non-array parameters (target shapes, axes, window sizes) live
/// as fields on the implementing struct and get no slot.
pub trait Operation {
    fn name(&self) -> &'static str;

    fn evaluate(&self, inputs: &[ArrayViewD<f32>]) -> ArrayD<f32>;

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        inputs: &[Rc<TrackedValue>],
    ) -> Vec<Option<ArrayD<f32>>>;
}

pub struct Negation {}

impl Operation for Negation {
    fn name(&self) -> &'static str {
        "negate"
    }

    fn evaluate(&self, inputs: &[ArrayViewD<f32>]) -> ArrayD<f32> {
        inputs[0].mapv(|x| -x)
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        _inputs: &[Rc<TrackedValue>],
    ) -> Vec<Option<ArrayD<f32>>> {
        vec![Some(-out_gradient.clone())]
    }
}

pub struct Transpose {}

impl Operation for Transpose {
    fn name(&self) -> &'static str {
        "transpose"
    }

    fn evaluate(&self, inputs: &[ArrayViewD<f32>]) -> ArrayD<f32> {
        inputs[0].t().to_owned()
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        _inputs: &[Rc<TrackedValue>],
    ) -> Vec<Option<ArrayD<f32>>> {
        // transposing again restores the original axis order
        vec![Some(out_gradient.t().to_owned())]
    }
}

pub struct Slice {
    pub ranges: Vec<Range<usize>>,
}

impl Slice {
    fn slice_elements(&self) -> Vec<SliceInfoElem> {
        self.ranges
            .iter()
            .map(|range| SliceInfoElem::Slice {
                start: range.start as isize,
                end: Some(range.end as isize),
                step: 1,
            })
            .collect()
    }
}

impl Operation for Slice {
    fn name(&self) -> &'static str {
        "slice"
    }

    fn evaluate(&self, inputs: &[ArrayViewD<f32>]) -> ArrayD<f32> {
        inputs[0].slice(self.slice_elements().as_slice()).to_owned()
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        inputs: &[Rc<TrackedValue>],
    ) -> Vec<Option<ArrayD<f32>>> {
        // Δ scattered into the sliced positions of a zero array
        let mut gradient = Array::zeros(inputs[0].data().shape()).into_dyn();
        gradient
            .slice_mut(self.slice_elements().as_slice())
            .assign(out_gradient);
        vec![Some(gradient)]
    }
}

/// Integer-index selection along an axis (an embedding-style lookup). The
/// second input is the index sequence, which being non-differentiable gets
/// the sentinel slot.
pub struct Take {
    pub axis: usize,
}

impl Take {
    fn indices(&self, input: &ArrayViewD<f32>) -> Vec<usize> {
        // indices are morally usize integers, but arrays here are f32; a
        // bare cast would quietly send negatives and NaN to row zero
        input
            .iter()
            .map(|&index| {
                assert!(
                    index >= 0. && index.fract() == 0.,
                    "index should be a non-negative integer, got {}",
                    index
                );
                index as usize
            })
            .collect::<Vec<_>>()
    }
}

impl Operation for Take {
    fn name(&self) -> &'static str {
        "take"
    }

    fn evaluate(&self, inputs: &[ArrayViewD<f32>]) -> ArrayD<f32> {
        let indices = self.indices(&inputs[1]);
        inputs[0].select(Axis(self.axis), &indices)
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        inputs: &[Rc<TrackedValue>],
    ) -> Vec<Option<ArrayD<f32>>> {
        let indices = self.indices(&inputs[1].data().view());
        let mut gradient = Array::zeros(inputs[0].data().shape()).into_dyn();
        for (position, &index) in indices.iter().enumerate() {
            // repeated indices accumulate
            let mut selected = gradient.index_axis_mut(Axis(self.axis), index);
            selected += &out_gradient.index_axis(Axis(self.axis), position);
        }
        vec![Some(gradient), None]
    }
}

pub struct Reshape {
    pub new_shape: Vec<usize>,
}

impl Operation for Reshape {
    fn name(&self) -> &'static str {
        "reshape"
    }

    fn evaluate(&self, inputs: &[ArrayViewD<f32>]) -> ArrayD<f32> {
        inputs[0]
            .as_standard_layout()
            .to_owned()
            .into_shape_with_order(self.new_shape.clone())
            .expect("input should fit the target shape")
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        inputs: &[Rc<TrackedValue>],
    ) -> Vec<Option<ArrayD<f32>>> {
        vec![Some(
            out_gradient
                .as_standard_layout()
                .to_owned()
                .into_shape_with_order(inputs[0].data().shape().to_vec())
                .expect("gradient should fit the original shape"),
        )]
    }
}

pub struct Permute {
    pub axes: Vec<usize>,
}

impl Operation for Permute {
    fn name(&self) -> &'static str {
        "permute"
    }

    fn evaluate(&self, inputs: &[ArrayViewD<f32>]) -> ArrayD<f32> {
        let permuted = inputs[0].to_owned().permuted_axes(self.axes.as_slice());
        permuted.as_standard_layout().to_owned()
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        _inputs: &[Rc<TrackedValue>],
    ) -> Vec<Option<ArrayD<f32>>> {
        let mut inverse = vec![0; self.axes.len()];
        for (position, &axis) in self.axes.iter().enumerate() {
            inverse[axis] = position;
        }
        let restored = out_gradient.clone().permuted_axes(inverse.as_slice());
        vec![Some(restored.as_standard_layout().to_owned())]
    }
}

/// Tiling with per-dimension inner (element-wise) and outer (whole-array)
/// multipliers. Every destination coordinate maps to exactly one source
/// coordinate per dimension.
pub struct Repeat {
    pub inner: Vec<usize>,
    pub outer: Vec<usize>,
}

impl Repeat {
    fn source_coordinate(&self, index: &IxDyn, shape: &[usize]) -> Vec<usize> {
        (0..shape.len())
            .map(|d| (index[d] % (shape[d] * self.inner[d])) / self.inner[d])
            .collect()
    }
}

impl Operation for Repeat {
    fn name(&self) -> &'static str {
        "repeat"
    }

    fn evaluate(&self, inputs: &[ArrayViewD<f32>]) -> ArrayD<f32> {
        let input = &inputs[0];
        let shape = input.shape().to_vec();
        assert_eq!(shape.len(), self.inner.len(), "one inner multiplier per dimension");
        assert_eq!(shape.len(), self.outer.len(), "one outer multiplier per dimension");
        let expanded_shape = (0..shape.len())
            .map(|d| shape[d] * self.inner[d] * self.outer[d])
            .collect::<Vec<_>>();
        ArrayD::from_shape_fn(IxDyn(&expanded_shape), |index| {
            input[self.source_coordinate(&index, &shape).as_slice()]
        })
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        inputs: &[Rc<TrackedValue>],
    ) -> Vec<Option<ArrayD<f32>>> {
        let shape = inputs[0].data().shape().to_vec();
        let mut gradient = Array::zeros(shape.as_slice()).into_dyn();
        for (index, &contribution) in out_gradient.indexed_iter() {
            let source = self.source_coordinate(&index, &shape);
            gradient[source.as_slice()] += contribution;
        }
        vec![Some(gradient)]
    }
}

pub struct Concatenate {
    pub axis: usize,
}

impl Operation for Concatenate {
    fn name(&self) -> &'static str {
        "concatenate"
    }

    fn evaluate(&self, inputs: &[ArrayViewD<f32>]) -> ArrayD<f32> {
        concatenate(Axis(self.axis), inputs).expect("shapes should concatenate")
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        inputs: &[Rc<TrackedValue>],
    ) -> Vec<Option<ArrayD<f32>>> {
        // carve Δ back into blocks at a running offset along the
        // concatenation axis
        let mut gradients = Vec::new();
        let mut offset = 0;
        for input in inputs {
            let extent = input.data().shape()[self.axis];
            let elements = (0..out_gradient.ndim())
                .map(|d| {
                    if d == self.axis {
                        SliceInfoElem::Slice {
                            start: offset as isize,
                            end: Some((offset + extent) as isize),
                            step: 1,
                        }
                    } else {
                        SliceInfoElem::Slice {
                            start: 0,
                            end: None,
                            step: 1,
                        }
                    }
                })
                .collect::<Vec<_>>();
            gradients.push(Some(out_gradient.slice(elements.as_slice()).to_owned()));
            offset += extent;
        }
        gradients
    }
}

pub struct Addition {}

impl Operation for Addition {
    fn name(&self) -> &'static str {
        "add"
    }

    fn evaluate(&self, inputs: &[ArrayViewD<f32>]) -> ArrayD<f32> {
        &inputs[0] + &inputs[1]
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        inputs: &[Rc<TrackedValue>],
    ) -> Vec<Option<ArrayD<f32>>> {
        // addition passes Δ through, modulo undoing any forward broadcast
        vec![
            Some(unbroadcast(out_gradient, inputs[0].data().shape())),
            Some(unbroadcast(out_gradient, inputs[1].data().shape())),
        ]
    }
}

pub struct Multiplication {}

impl Operation for Multiplication {
    fn name(&self) -> &'static str {
        "multiply"
    }

    fn evaluate(&self, inputs: &[ArrayViewD<f32>]) -> ArrayD<f32> {
        &inputs[0] * &inputs[1]
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        inputs: &[Rc<TrackedValue>],
    ) -> Vec<Option<ArrayD<f32>>> {
        // d/dx(xy) = y
        let a = inputs[0].data();
        let b = inputs[1].data();
        vec![
            Some(unbroadcast(&(out_gradient * b), a.shape())),
            Some(unbroadcast(&(out_gradient * a), b.shape())),
        ]
    }
}

pub struct DotProduct {}

impl Operation for DotProduct {
    fn name(&self) -> &'static str {
        "dot"
    }

    fn evaluate(&self, inputs: &[ArrayViewD<f32>]) -> ArrayD<f32> {
        let a = inputs[0]
            .clone()
            .into_dimensionality::<Ix1>()
            .expect("one-dimensional");
        let b = inputs[1]
            .clone()
            .into_dimensionality::<Ix1>()
            .expect("one-dimensional");
        arr0(a.dot(&b)).into_dyn()
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        inputs: &[Rc<TrackedValue>],
    ) -> Vec<Option<ArrayD<f32>>> {
        let δ = *out_gradient
            .iter()
            .next()
            .expect("out-gradient should be a scalar");
        let a = inputs[0]
            .data()
            .view()
            .into_dimensionality::<Ix1>()
            .expect("one-dimensional");
        let b = inputs[1]
            .data()
            .view()
            .into_dimensionality::<Ix1>()
            .expect("one-dimensional");
        vec![
            Some((&b.to_owned() * δ).into_dyn()),
            Some((&a.to_owned() * δ).into_dyn()),
        ]
    }
}

/// Matrix product handling 1-D and 2-D operands uniformly: vectors are
/// promoted to single-row (left) or single-column (right) matrices for the
/// multiplication, and both the result and the gradients are squeezed back.
pub struct MatrixMultiplication {}

impl Operation for MatrixMultiplication {
    fn name(&self) -> &'static str {
        "matmul"
    }

    fn evaluate(&self, inputs: &[ArrayViewD<f32>]) -> ArrayD<f32> {
        let lhs_vector = inputs[0].ndim() == 1;
        let rhs_vector = inputs[1].ndim() == 1;
        let lhs = if lhs_vector {
            inputs[0].clone().insert_axis(Axis(0))
        } else {
            inputs[0].clone()
        }
        .into_dimensionality::<Ix2>()
        .expect("left operand should be one- or two-dimensional");
        let rhs = if rhs_vector {
            inputs[1].clone().insert_axis(Axis(1))
        } else {
            inputs[1].clone()
        }
        .into_dimensionality::<Ix2>()
        .expect("right operand should be one- or two-dimensional");
        let mut product = lhs.dot(&rhs).into_dyn();
        if rhs_vector {
            let last = product.ndim() - 1;
            product = product.remove_axis(Axis(last));
        }
        if lhs_vector {
            product = product.remove_axis(Axis(0));
        }
        product
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        inputs: &[Rc<TrackedValue>],
    ) -> Vec<Option<ArrayD<f32>>> {
        let lhs_data = inputs[0].data();
        let rhs_data = inputs[1].data();
        let lhs_vector = lhs_data.ndim() == 1;
        let rhs_vector = rhs_data.ndim() == 1;
        let lhs = if lhs_vector {
            lhs_data.view().insert_axis(Axis(0))
        } else {
            lhs_data.view()
        }
        .into_dimensionality::<Ix2>()
        .expect("left operand should be one- or two-dimensional");
        let rhs = if rhs_vector {
            rhs_data.view().insert_axis(Axis(1))
        } else {
            rhs_data.view()
        }
        .into_dimensionality::<Ix2>()
        .expect("right operand should be one- or two-dimensional");

        // re-promote the out-gradient the same way the forward squeezed
        let mut δ = out_gradient.view();
        if lhs_vector {
            δ = δ.insert_axis(Axis(0));
        }
        if rhs_vector {
            let end = δ.ndim();
            δ = δ.insert_axis(Axis(end));
        }
        let δ = δ
            .into_dimensionality::<Ix2>()
            .expect("out-gradient should match the product's dimensionality");

        // matrix multiplication is not commutative; Δ·Bᵗ and Aᵗ·Δ
        let mut gradient_lhs = δ.dot(&rhs.t()).into_dyn();
        if lhs_vector {
            gradient_lhs = gradient_lhs.remove_axis(Axis(0));
        }
        let mut gradient_rhs = lhs.t().dot(&δ).into_dyn();
        if rhs_vector {
            gradient_rhs = gradient_rhs.remove_axis(Axis(1));
        }
        vec![Some(gradient_lhs), Some(gradient_rhs)]
    }
}

/// Build a square matrix with the input vector on the diagonal.
pub struct Diagonal {}

impl Operation for Diagonal {
    fn name(&self) -> &'static str {
        "diagonal"
    }

    fn evaluate(&self, inputs: &[ArrayViewD<f32>]) -> ArrayD<f32> {
        let vector = inputs[0]
            .clone()
            .into_dimensionality::<Ix1>()
            .expect("one-dimensional");
        Array2::from_diag(&vector).into_dyn()
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        _inputs: &[Rc<TrackedValue>],
    ) -> Vec<Option<ArrayD<f32>>> {
        let δ = out_gradient
            .view()
            .into_dimensionality::<Ix2>()
            .expect("two-dimensional");
        vec![Some(δ.diag().to_owned().into_dyn())]
    }
}

pub fn negate(x: &Value) -> Value {
    track(Box::new(Negation {}), vec![x.clone()])
}

pub fn transpose(x: &Value) -> Value {
    track(Box::new(Transpose {}), vec![x.clone()])
}

pub fn slice(x: &Value, ranges: Vec<Range<usize>>) -> Value {
    track(Box::new(Slice { ranges }), vec![x.clone()])
}

pub fn take(x: &Value, indices: &Value, axis: usize) -> Value {
    track(Box::new(Take { axis }), vec![x.clone(), indices.clone()])
}

pub fn reshape(x: &Value, new_shape: Vec<usize>) -> Value {
    track(Box::new(Reshape { new_shape }), vec![x.clone()])
}

pub fn permute(x: &Value, axes: Vec<usize>) -> Value {
    track(Box::new(Permute { axes }), vec![x.clone()])
}

pub fn repeat(x: &Value, inner: Vec<usize>, outer: Vec<usize>) -> Value {
    track(Box::new(Repeat { inner, outer }), vec![x.clone()])
}

pub fn concatenate_along(axis: usize, inputs: &[Value]) -> Value {
    track(Box::new(Concatenate { axis }), inputs.to_vec())
}

/// Concatenate along the first axis (stacking rows).
pub fn vcat(inputs: &[Value]) -> Value {
    concatenate_along(0, inputs)
}

/// Concatenate along the second axis (stacking columns).
pub fn hcat(inputs: &[Value]) -> Value {
    concatenate_along(1, inputs)
}

pub fn add(a: &Value, b: &Value) -> Value {
    track(Box::new(Addition {}), vec![a.clone(), b.clone()])
}

pub fn multiply(a: &Value, b: &Value) -> Value {
    track(Box::new(Multiplication {}), vec![a.clone(), b.clone()])
}

pub fn dot(a: &Value, b: &Value) -> Value {
    track(Box::new(DotProduct {}), vec![a.clone(), b.clone()])
}

pub fn matmul(a: &Value, b: &Value) -> Value {
    track(Box::new(MatrixMultiplication {}), vec![a.clone(), b.clone()])
}

pub fn diagonal(x: &Value) -> Value {
    track(Box::new(Diagonal {}), vec![x.clone()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gradient_check::{check_binary_gradient, check_unary_gradient, random_array};
    use crate::graph::{backward, constant, data, gradient, leaf};
    use crate::reductions::sum;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_negation() {
        let x = leaf(array![1., -2., 3.].into_dyn());
        let y = negate(&x);
        assert_eq!(data(&y), array![-1., 2., -3.].into_dyn());
        backward(&y, Some(array![1., 1., 1.].into_dyn())).expect("traversal should succeed");
        assert_eq!(gradient(&x).unwrap(), array![-1., -1., -1.].into_dyn());
        check_unary_gradient(negate, &random_array(&[2, 3]));
    }

    #[test]
    fn test_transpose_carries_gradient_elements_back() {
        let x = leaf(array![[1., 2., 3.], [4., 5., 6.]].into_dyn());
        let y = transpose(&x);
        assert_eq!(data(&y).shape(), &[3, 2]);
        // a non-uniform out-gradient distinguishes transposition from mere
        // reshaping
        let out_gradient = array![[0.1, 0.2], [0.3, 0.4], [0.5, 0.6]].into_dyn();
        backward(&y, Some(out_gradient)).expect("traversal should succeed");
        assert_abs_diff_eq!(
            gradient(&x).unwrap(),
            array![[0.1, 0.3, 0.5], [0.2, 0.4, 0.6]].into_dyn()
        );
    }

    #[test]
    fn test_slice_scatters_gradient_into_original_positions() {
        let x = leaf(array![[1., 2., 3.], [4., 5., 6.]].into_dyn());
        let y = slice(&x, vec![0..2, 1..3]);
        assert_eq!(data(&y), array![[2., 3.], [5., 6.]].into_dyn());
        backward(&y, Some(array![[1., 2.], [3., 4.]].into_dyn())).expect("traversal should succeed");
        assert_eq!(
            gradient(&x).unwrap(),
            array![[0., 1., 2.], [0., 3., 4.]].into_dyn()
        );
        check_unary_gradient(|x| slice(x, vec![1..2, 0..3]), &random_array(&[2, 3]));
    }

    #[test]
    fn test_take_accumulates_repeated_indices_and_skips_index_gradient() {
        let weights = leaf(array![[1., 2.], [3., 4.], [5., 6.]].into_dyn());
        let indices = constant(array![0., 2., 0.].into_dyn());
        let y = take(&weights, &indices, 0);
        assert_eq!(
            data(&y),
            array![[1., 2.], [5., 6.], [1., 2.]].into_dyn()
        );
        backward(&y, Some(Array::ones((3, 2)).into_dyn())).expect("traversal should succeed");
        // row 0 was plucked twice, row 1 never
        assert_eq!(
            gradient(&weights).unwrap(),
            array![[2., 2.], [0., 0.], [1., 1.]].into_dyn()
        );
    }

    #[test]
    #[should_panic(expected = "index should be a non-negative integer")]
    fn test_take_rejects_negative_indices() {
        let weights = leaf(array![[1., 2.], [3., 4.]].into_dyn());
        let indices = constant(array![0., -1.].into_dyn());
        take(&weights, &indices, 0);
    }

    #[test]
    #[should_panic(expected = "index should be a non-negative integer")]
    fn test_take_rejects_fractional_indices() {
        let weights = leaf(array![[1., 2.], [3., 4.]].into_dyn());
        let indices = constant(array![0.5].into_dyn());
        take(&weights, &indices, 0);
    }

    #[test]
    fn test_reshape_roundtrip_restores_shape_exactly() {
        let x = leaf(array![[1., 2., 3.], [4., 5., 6.]].into_dyn());
        let y = reshape(&x, vec![3, 2]);
        assert_eq!(data(&y).shape(), &[3, 2]);
        backward(&y, Some(array![[1., 2.], [3., 4.], [5., 6.]].into_dyn()))
            .expect("traversal should succeed");
        let restored = gradient(&x).unwrap();
        assert_eq!(restored.shape(), &[2, 3]);
        assert_eq!(restored, array![[1., 2., 3.], [4., 5., 6.]].into_dyn());
    }

    #[test]
    fn test_permute_backward_applies_inverse_permutation() {
        let x = leaf(
            Array::from_shape_vec((2, 3, 4), (0..24).map(|n| n as f32).collect())
                .expect("shape should fit")
                .into_dyn(),
        );
        let y = permute(&x, vec![2, 0, 1]);
        assert_eq!(data(&y).shape(), &[4, 2, 3]);
        // seeding with the permuted forward data makes the expected
        // reconstruction the original data itself
        let seed = data(&y);
        backward(&y, Some(seed)).expect("traversal should succeed");
        assert_eq!(gradient(&x).unwrap(), data(&x));
        check_unary_gradient(|x| permute(x, vec![1, 0]), &random_array(&[3, 2]));
    }

    #[test]
    fn test_repeat_inner_and_outer_tiling() {
        let x = leaf(array![1., 2.].into_dyn());
        let tiled = repeat(&x, vec![2], vec![1]);
        assert_eq!(data(&tiled), array![1., 1., 2., 2.].into_dyn());
        backward(&tiled, Some(array![1., 2., 3., 4.].into_dyn()))
            .expect("traversal should succeed");
        // each source element collects Δ over its two destinations
        assert_eq!(gradient(&x).unwrap(), array![3., 7.].into_dyn());

        let y = leaf(array![1., 2.].into_dyn());
        let wrapped = repeat(&y, vec![1], vec![2]);
        assert_eq!(data(&wrapped), array![1., 2., 1., 2.].into_dyn());
        backward(&wrapped, Some(array![1., 2., 3., 4.].into_dyn()))
            .expect("traversal should succeed");
        assert_eq!(gradient(&y).unwrap(), array![4., 6.].into_dyn());
    }

    #[test]
    fn test_repeat_combined_multipliers_forward() {
        let x = constant(array![1., 2.].into_dyn());
        let tiled = repeat(&x, vec![2], vec![2]);
        assert_eq!(
            data(&tiled),
            array![1., 1., 2., 2., 1., 1., 2., 2.].into_dyn()
        );
    }

    #[test]
    fn test_concatenation_roundtrip_with_ones() {
        let a = leaf(array![[1., 2.], [3., 4.]].into_dyn());
        let b = leaf(array![[5., 6.]].into_dyn());
        let stacked = vcat(&[a.clone(), b.clone()]);
        assert_eq!(
            data(&stacked),
            array![[1., 2.], [3., 4.], [5., 6.]].into_dyn()
        );
        backward(&stacked, Some(Array::ones((3, 2)).into_dyn()))
            .expect("traversal should succeed");
        assert_eq!(gradient(&a).unwrap(), Array::ones((2, 2)).into_dyn());
        assert_eq!(gradient(&b).unwrap(), Array::ones((1, 2)).into_dyn());
    }

    #[test]
    fn test_hcat_blocks_carve_at_running_offset() {
        let a = leaf(array![[1., 2.], [3., 4.]].into_dyn());
        let b = leaf(array![[4., 5.], [6., 7.]].into_dyn());
        let result = hcat(&[a.clone(), b.clone()]);
        assert_eq!(
            data(&result),
            array![[1., 2., 4., 5.], [3., 4., 6., 7.]].into_dyn()
        );
        let out_gradient = array![[1., 2., 3., 4.], [5., 6., 7., 8.]].into_dyn();
        backward(&result, Some(out_gradient)).expect("traversal should succeed");
        assert_eq!(gradient(&a).unwrap(), array![[1., 2.], [5., 6.]].into_dyn());
        assert_eq!(gradient(&b).unwrap(), array![[3., 4.], [7., 8.]].into_dyn());
    }

    #[test]
    fn test_matrix_multiplication() {
        let a = leaf(array![[1., 2.], [3., 4.]].into_dyn());
        let b = leaf(array![[5., 6.], [7., 8.]].into_dyn());
        let result = matmul(&a, &b);
        assert_eq!(data(&result), array![[19., 22.], [43., 50.]].into_dyn());

        backward(&result, Some(array![[1., 1.], [1., 1.]].into_dyn()))
            .expect("traversal should succeed");
        // Δ·Bᵗ and Aᵗ·Δ
        assert_eq!(
            gradient(&a).unwrap(),
            array![[11., 15.], [11., 15.]].into_dyn()
        );
        assert_eq!(gradient(&b).unwrap(), array![[4., 4.], [6., 6.]].into_dyn());
    }

    #[test]
    fn test_matrix_multiplication_non_square() {
        let a = leaf(array![[1., 2., 3.], [4., 5., 6.]].into_dyn());
        let b = leaf(array![[7., 8.], [9., 10.], [11., 12.]].into_dyn());
        let result = matmul(&a, &b);
        assert_eq!(
            data(&result),
            array![[58., 64.], [139., 154.]].into_dyn()
        );

        backward(&result, Some(Array::ones((2, 2)).into_dyn()))
            .expect("traversal should succeed");
        assert_eq!(
            gradient(&a).unwrap(),
            array![[15., 19., 23.], [15., 19., 23.]].into_dyn()
        );
        assert_eq!(
            gradient(&b).unwrap(),
            array![[5., 5.], [7., 7.], [9., 9.]].into_dyn()
        );
    }

    #[test]
    fn test_matrix_vector_forms() {
        // matrix × vector
        let m = leaf(array![[1., 2.], [3., 4.]].into_dyn());
        let v = leaf(array![5., 6.].into_dyn());
        let result = matmul(&m, &v);
        assert_eq!(data(&result), array![17., 39.].into_dyn());
        backward(&result, Some(array![1., 1.].into_dyn())).expect("traversal should succeed");
        assert_eq!(gradient(&m).unwrap(), array![[5., 6.], [5., 6.]].into_dyn());
        assert_eq!(gradient(&v).unwrap(), array![4., 6.].into_dyn());

        // vector × matrix
        check_binary_gradient(matmul, &random_array(&[3]), &random_array(&[3, 2]));
        // vector × vector collapses to a scalar
        let u = constant(array![1., 2.].into_dyn());
        let w = constant(array![3., 4.].into_dyn());
        assert_eq!(data(&matmul(&u, &w)).ndim(), 0);
        assert_eq!(data(&matmul(&u, &w)).sum(), 11.);
        check_binary_gradient(matmul, &random_array(&[4]), &random_array(&[4]));
    }

    #[test]
    fn test_dot_product() {
        let a = leaf(array![1., 2., 3.].into_dyn());
        let b = leaf(array![4., 5., 6.].into_dyn());
        let result = dot(&a, &b);
        assert_eq!(data(&result).sum(), 32.);
        backward(&result, None).expect("traversal should succeed");
        assert_eq!(gradient(&a).unwrap(), array![4., 5., 6.].into_dyn());
        assert_eq!(gradient(&b).unwrap(), array![1., 2., 3.].into_dyn());
    }

    #[test]
    fn test_diagonal_construction() {
        let x = leaf(array![1., 2., 3.].into_dyn());
        let d = diagonal(&x);
        assert_eq!(
            data(&d),
            array![[1., 0., 0.], [0., 2., 0.], [0., 0., 3.]].into_dyn()
        );
        let out_gradient = array![[1., 2., 3.], [4., 5., 6.], [7., 8., 9.]].into_dyn();
        backward(&d, Some(out_gradient)).expect("traversal should succeed");
        assert_eq!(gradient(&x).unwrap(), array![1., 5., 9.].into_dyn());
    }

    #[test]
    fn test_addition_unbroadcasts_to_each_operand() {
        let a = leaf(array![[1., 2., 3.], [4., 5., 6.]].into_dyn());
        let b = leaf(array![10., 20., 30.].into_dyn());
        let result = add(&a, &b);
        assert_eq!(
            data(&result),
            array![[11., 22., 33.], [14., 25., 36.]].into_dyn()
        );
        backward(&result, Some(array![[1., 2., 3.], [4., 5., 6.]].into_dyn()))
            .expect("traversal should succeed");
        assert_eq!(
            gradient(&a).unwrap(),
            array![[1., 2., 3.], [4., 5., 6.]].into_dyn()
        );
        // the broadcast row collects a sum over the expanded axis
        assert_eq!(gradient(&b).unwrap(), array![5., 7., 9.].into_dyn());
    }

    #[test]
    fn test_elementwise_gradients_match_finite_differences() {
        check_binary_gradient(add, &random_array(&[2, 3]), &random_array(&[2, 3]));
        check_binary_gradient(multiply, &random_array(&[2, 3]), &random_array(&[2, 3]));
        check_binary_gradient(multiply, &random_array(&[2, 3]), &random_array(&[3]));
        check_binary_gradient(dot, &random_array(&[4]), &random_array(&[4]));
        check_binary_gradient(matmul, &random_array(&[2, 3]), &random_array(&[3, 2]));
        check_unary_gradient(transpose, &random_array(&[2, 4]));
        check_unary_gradient(|x| reshape(x, vec![6]), &random_array(&[2, 3]));
        check_unary_gradient(|x| repeat(x, vec![2, 1], vec![1, 2]), &random_array(&[2, 2]));
        check_unary_gradient(diagonal, &random_array(&[3]));
    }

    #[test]
    fn test_multiplication_backward_uses_other_argument() {
        let a = leaf(array![2.].into_dyn());
        let b = leaf(array![3.].into_dyn());
        let product = multiply(&a, &b);
        let total = sum(&product, None);
        backward(&total, None).expect("traversal should succeed");
        assert_eq!(gradient(&a).unwrap(), array![3.].into_dyn());
        assert_eq!(gradient(&b).unwrap(), array![2.].into_dyn());
    }
}
