use std::fmt;

use ndarray::{Array3, Array4, ArrayD, ArrayView4, Axis, Zip};
use rayon::prelude::*;
use tracing::{debug, trace};

use super::{assemble, check_same_shape, Layer};
use crate::error::{LayerError, Result};
use crate::hyperparameters::PoolConfig;

/// Where each pooled value came from.
///
/// `positions()[[n, c, oh, ow]]` is the absolute (row, column) in the input
/// that produced `output[[n, c, oh, ow]]`. Only `MaxPooling2DLayer::pool`
/// builds one, so every position lies inside `input_shape()`.
#[derive(Debug, Clone, PartialEq)]
pub struct ArgmaxCache {
    input_shape: [usize; 4],
    output_shape: [usize; 4],
    positions: Array4<(usize, usize)>,
}

impl ArgmaxCache {
    pub fn input_shape(&self) -> [usize; 4] {
        self.input_shape
    }

    pub fn output_shape(&self) -> [usize; 4] {
        self.output_shape
    }

    pub fn positions(&self) -> &Array4<(usize, usize)> {
        &self.positions
    }
}

#[derive(Debug, Clone)]
pub struct MaxPooling2DLayer {
    config: PoolConfig,
    cached_input: Option<Array4<f32>>,
    cache: Option<ArgmaxCache>,
}

impl MaxPooling2DLayer {
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(MaxPooling2DLayer { config, cached_input: None, cache: None })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Cache left by the last `fprop`, if `bprop` has not consumed it yet.
    pub fn cache(&self) -> Option<&ArgmaxCache> {
        self.cache.as_ref()
    }

    /// Output shape for an input of dimensions `(batch, channel, row, column)`.
    pub fn output_shape(&self, input_dim: (usize, usize, usize, usize)) -> Result<(usize, usize, usize, usize)> {
        let (batch, channels, height, width) = input_dim;
        let (out_h, out_w) = self.config.output_spatial(height, width).ok_or_else(|| {
            let (extent_h, extent_w) = self.config.pool_extent();
            LayerError::ShapeMismatch {
                expected: vec![extent_h, extent_w],
                got: vec![height, width],
                message: "input smaller than the dilated pooling window".to_string(),
            }
        })?;
        Ok((batch, channels, out_h, out_w))
    }

    /// Max over every window, plus the argmax of each one.
    ///
    /// Ties go to the first maximum in row-major scan order of the window.
    pub fn pool(&self, input: ArrayView4<f32>) -> Result<(Array4<f32>, ArgmaxCache)> {
        let shape = self.output_shape(input.dim())?;
        let (batch, channels, out_h, out_w) = shape;
        let c = self.config;

        let samples: Vec<(Array3<f32>, Array3<(usize, usize)>)> = (0..batch)
            .into_par_iter()
            .map(|n| {
                let sample = input.index_axis(Axis(0), n);
                let mut values = Array3::<f32>::zeros((channels, out_h, out_w));
                let mut positions = Array3::<(usize, usize)>::default((channels, out_h, out_w));

                for ch in 0..channels {
                    for oh in 0..out_h {
                        for ow in 0..out_w {
                            let h_start = oh * c.stride_height;
                            let w_start = ow * c.stride_width;

                            let mut max_pos = (h_start, w_start);
                            let mut max_val = sample[[ch, h_start, w_start]];
                            for ph in 0..c.pool_height {
                                let row = h_start + ph * c.dilation_height;
                                for pw in 0..c.pool_width {
                                    let col = w_start + pw * c.dilation_width;
                                    let val = sample[[ch, row, col]];
                                    if val > max_val {
                                        max_val = val;
                                        max_pos = (row, col);
                                    }
                                }
                            }

                            values[[ch, oh, ow]] = max_val;
                            positions[[ch, oh, ow]] = max_pos;
                        }
                    }
                }
                (values, positions)
            })
            .collect();

        let (in_n, in_c, in_h, in_w) = input.dim();
        let (values, positions): (Vec<_>, Vec<_>) = samples.into_iter().unzip();
        let output = assemble(shape, values);
        let cache = ArgmaxCache {
            input_shape: [in_n, in_c, in_h, in_w],
            output_shape: [batch, channels, out_h, out_w],
            positions: assemble(shape, positions),
        };
        Ok((output, cache))
    }

    /// Sends each upstream gradient to the input position recorded in `cache`.
    /// Positions that won several windows receive the sum.
    pub fn route_grads(&self, cache: &ArgmaxCache, grad_output: ArrayView4<f32>) -> Result<Array4<f32>> {
        check_same_shape(&cache.output_shape, grad_output.shape(), "grad_output")?;
        let [batch, channels, in_h, in_w] = cache.input_shape;

        let samples: Vec<Array3<f32>> = (0..batch)
            .into_par_iter()
            .map(|n| {
                let upstream = grad_output.index_axis(Axis(0), n);
                let positions = cache.positions.index_axis(Axis(0), n);
                let mut grad = Array3::<f32>::zeros((channels, in_h, in_w));
                for ((ch, oh, ow), &(row, col)) in positions.indexed_iter() {
                    grad[[ch, row, col]] += upstream[[ch, oh, ow]];
                }
                grad
            })
            .collect();

        Ok(assemble((batch, channels, in_h, in_w), samples))
    }
}

// Bitwise, so a NaN produced by fprop still matches itself.
fn same_values(a: ArrayView4<f32>, b: ArrayView4<f32>) -> bool {
    Zip::from(a).and(b).all(|&x, &y| x.to_bits() == y.to_bits())
}

impl Layer for MaxPooling2DLayer {
    fn name(&self) -> &'static str {
        "MaxPooling2DLayer"
    }

    fn fprop(&mut self, input: ArrayView4<f32>) -> Result<Array4<f32>> {
        let (output, cache) = self.pool(input)?;
        debug!(layer = self.name(), input = ?input.shape(), output = ?output.shape(), "fprop");
        trace!(positions = cache.positions.len(), "argmax cache stored");
        self.cached_input = Some(input.to_owned());
        self.cache = Some(cache);
        Ok(output)
    }

    fn bprop(
        &mut self,
        input: ArrayView4<f32>,
        output: ArrayView4<f32>,
        grad_output: ArrayView4<f32>,
    ) -> Result<Array4<f32>> {
        let (cached_input, cache) = match (&self.cached_input, &self.cache) {
            (Some(cached_input), Some(cache)) => (cached_input, cache),
            _ => {
                return Err(LayerError::StaleState(
                    "bprop called without a preceding fprop".to_string(),
                ))
            }
        };
        if input.shape() != &cache.input_shape[..] {
            return Err(LayerError::StaleState(format!(
                "bprop input shape {:?} differs from the last fprop input shape {:?}",
                input.shape(),
                cache.input_shape
            )));
        }
        if !same_values(input, cached_input.view()) {
            return Err(LayerError::StaleState(
                "bprop input differs from the last fprop input".to_string(),
            ));
        }
        check_same_shape(&cache.output_shape, output.shape(), "output")?;
        let output_matches = cache.positions.indexed_iter().all(|((n, ch, oh, ow), &(row, col))| {
            output[[n, ch, oh, ow]].to_bits() == cached_input[[n, ch, row, col]].to_bits()
        });
        if !output_matches {
            return Err(LayerError::StaleState(
                "bprop output differs from the last fprop output".to_string(),
            ));
        }

        let grad_input = self.route_grads(cache, grad_output)?;
        self.cached_input = None;
        self.cache = None;
        trace!("argmax cache consumed");
        debug!(layer = self.name(), grad_output = ?grad_output.shape(), grad_input = ?grad_input.shape(), "bprop");
        Ok(grad_input)
    }

    fn grads_wrt_params(
        &self,
        _input: ArrayView4<f32>,
        _grad_output: ArrayView4<f32>,
    ) -> Result<Vec<ArrayD<f32>>> {
        Ok(Vec::new())
    }

    fn params(&self) -> Vec<ArrayD<f32>> {
        Vec::new()
    }

    fn set_params(&mut self, params: Vec<ArrayD<f32>>) -> Result<()> {
        if !params.is_empty() {
            return Err(LayerError::shape(&[0], &[params.len()], "parameter count"));
        }
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}

impl fmt::Display for MaxPooling2DLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.config;
        write!(
            f,
            "MaxPooling2DLayer(pool=({}, {}), stride=({}, {}), dilation=({}, {}))",
            c.pool_height, c.pool_width, c.stride_height, c.stride_width, c.dilation_height, c.dilation_width,
        )
    }
}
