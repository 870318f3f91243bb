pub mod conv2d;
pub mod max_pool;

use std::fmt::Debug;
use ndarray::{Array3, Array4, ArrayD, ArrayView4};

use crate::error::{LayerError, Result};

/// Contract between a layer and whatever sequences it inside a network.
///
/// All tensors are (batch, channel, row, column).
pub trait Layer: Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// Output of the layer for `input`.
    fn fprop(&mut self, input: ArrayView4<f32>) -> Result<Array4<f32>>;

    /// Gradient with respect to `input`, given the gradient with respect to
    /// `output` (the result of the preceding `fprop` on the same input).
    fn bprop(
        &mut self,
        input: ArrayView4<f32>,
        output: ArrayView4<f32>,
        grad_output: ArrayView4<f32>,
    ) -> Result<Array4<f32>>;

    /// Gradients with respect to each entry of `params()`, in the same order.
    fn grads_wrt_params(
        &self,
        input: ArrayView4<f32>,
        grad_output: ArrayView4<f32>,
    ) -> Result<Vec<ArrayD<f32>>>;

    fn params(&self) -> Vec<ArrayD<f32>>;
    fn set_params(&mut self, params: Vec<ArrayD<f32>>) -> Result<()>;

    fn clone_box(&self) -> Box<dyn Layer>;
}

impl Clone for Box<dyn Layer> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

pub(crate) fn check_same_shape(expected: &[usize], got: &[usize], what: &str) -> Result<()> {
    if expected != got {
        return Err(LayerError::shape(expected, got, format!("{what} shape")));
    }
    Ok(())
}

/// Stacks per-sample results back into a batch, in sample order.
pub(crate) fn assemble<T: Clone + Default>(
    shape: (usize, usize, usize, usize),
    samples: Vec<Array3<T>>,
) -> Array4<T> {
    let mut batch = Array4::<T>::default(shape);
    for (mut slot, sample) in batch.outer_iter_mut().zip(samples) {
        slot.assign(&sample);
    }
    batch
}

pub use conv2d::{ConvGrads, ConvolutionalLayer};
pub use max_pool::{ArgmaxCache, MaxPooling2DLayer};
