use ndarray::ArrayD;

use crate::error::{LayerError, Result};
use crate::layers::Layer;
use crate::model::Sequential;

/// Plain gradient descent: `param -= learning_rate * grad`.
#[derive(Debug, Clone)]
pub struct Optimizer {
    pub learning_rate: f32,
}

impl Optimizer {
    pub fn new(learning_rate: f32) -> Self {
        Self { learning_rate }
    }

    pub fn step(&self, layer: &mut dyn Layer, grads: &[ArrayD<f32>]) -> Result<()> {
        let params = layer.params();
        if params.len() != grads.len() {
            return Err(LayerError::shape(&[params.len()], &[grads.len()], "gradient count"));
        }

        let mut updated = Vec::with_capacity(params.len());
        for (mut param, grad) in params.into_iter().zip(grads) {
            if param.shape() != grad.shape() {
                return Err(LayerError::shape(param.shape(), grad.shape(), "gradient"));
            }
            param.scaled_add(-self.learning_rate, grad);
            updated.push(param);
        }
        layer.set_params(updated)
    }

    /// Applies `param_grads` (as returned by `Sequential::bprop`) to every layer.
    pub fn apply(&self, model: &mut Sequential, param_grads: &[Vec<ArrayD<f32>>]) -> Result<()> {
        if model.layers.len() != param_grads.len() {
            return Err(LayerError::shape(&[model.layers.len()], &[param_grads.len()], "layer count"));
        }
        for (layer, grads) in model.layers.iter_mut().zip(param_grads) {
            self.step(layer.as_mut(), grads)?;
        }
        Ok(())
    }
}
