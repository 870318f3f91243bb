use ndarray::{Array4, ArrayD, ArrayView4};
use tracing::debug;

use crate::error::{LayerError, Result};
use crate::layers::Layer;

/// Layers applied in order; gradients flow back in reverse.
#[derive(Debug, Clone, Default)]
pub struct Sequential {
    pub layers: Vec<Box<dyn Layer>>,
}

/// Result of a backward pass through a `Sequential`.
#[derive(Debug, Clone)]
pub struct Backward {
    pub grad_input: Array4<f32>,
    /// One entry per layer, each ordered like that layer's `params()`.
    pub param_grads: Vec<Vec<ArrayD<f32>>>,
}

impl Sequential {
    pub fn new(layers: Vec<Box<dyn Layer>>) -> Self {
        Sequential { layers }
    }

    pub fn push<L: Layer + 'static>(&mut self, layer: L) {
        self.layers.push(Box::new(layer));
    }

    /// Forward pass. Returns every activation, starting with `input` itself,
    /// so `activations.last()` is the network output.
    pub fn fprop(&mut self, input: ArrayView4<f32>) -> Result<Vec<Array4<f32>>> {
        let mut activations = Vec::with_capacity(self.layers.len() + 1);
        activations.push(input.to_owned());
        for layer in &mut self.layers {
            let output = layer.fprop(activations[activations.len() - 1].view())?;
            activations.push(output);
        }
        Ok(activations)
    }

    /// Backward pass over the activations from the matching `fprop`.
    pub fn bprop(&mut self, activations: &[Array4<f32>], grad_output: ArrayView4<f32>) -> Result<Backward> {
        if activations.len() != self.layers.len() + 1 {
            return Err(LayerError::shape(
                &[self.layers.len() + 1],
                &[activations.len()],
                "activation count",
            ));
        }

        let mut param_grads = vec![Vec::new(); self.layers.len()];
        let mut grad = grad_output.to_owned();
        for (i, layer) in self.layers.iter_mut().enumerate().rev() {
            let (input, output) = (&activations[i], &activations[i + 1]);
            param_grads[i] = layer.grads_wrt_params(input.view(), grad.view())?;
            grad = layer.bprop(input.view(), output.view(), grad.view())?;
        }
        debug!(layers = self.layers.len(), grad_input = ?grad.shape(), "sequential bprop");

        Ok(Backward { grad_input: grad, param_grads })
    }

    pub fn parameter_count(&self) -> usize {
        self.layers
            .iter()
            .flat_map(|layer| layer.params())
            .map(|p| p.len())
            .sum()
    }
}
