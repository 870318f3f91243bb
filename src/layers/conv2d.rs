use std::fmt;

use ndarray::{Array1, Array3, Array4, ArrayD, ArrayView4, Axis, Ix1, Ix4};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;
use tracing::debug;

use super::{assemble, check_same_shape, Layer};
use crate::error::{LayerError, Result};
use crate::hyperparameters::ConvConfig;

/// Valid-only 2-D convolution with stride and dilation.
#[derive(Debug, Clone)]
pub struct ConvolutionalLayer {
    config: ConvConfig,
    kernel: Array4<f32>,
    bias: Array1<f32>,
}

/// Parameter gradients summed over the batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvGrads {
    pub kernel: Array4<f32>,
    pub bias: Array1<f32>,
}

impl ConvolutionalLayer {
    /// He-normal kernel, zero bias.
    pub fn new(config: ConvConfig) -> Result<Self> {
        Self::with_rng(config, &mut rand::rng())
    }

    pub fn with_rng<R: Rng + ?Sized>(config: ConvConfig, rng: &mut R) -> Result<Self> {
        config.validate()?;

        let fan_in = config.input_channels * config.kernel_height * config.kernel_width;
        let std_dev = (2.0 / fan_in as f32).sqrt();
        let normal_dist = Normal::new(0.0, std_dev)
            .map_err(|e| LayerError::InvalidConfiguration(e.to_string()))?;

        let kernel = Array4::from_shape_fn(config.kernel_shape(), |_| normal_dist.sample(&mut *rng));
        let bias = Array1::zeros(config.output_channels);

        Ok(ConvolutionalLayer { config, kernel, bias })
    }

    pub fn with_params(config: ConvConfig, kernel: Array4<f32>, bias: Array1<f32>) -> Result<Self> {
        config.validate()?;
        let mut layer = ConvolutionalLayer {
            config,
            kernel: Array4::zeros(config.kernel_shape()),
            bias: Array1::zeros(config.output_channels),
        };
        layer.set_kernel(kernel)?;
        layer.set_bias(bias)?;
        Ok(layer)
    }

    pub fn config(&self) -> &ConvConfig {
        &self.config
    }

    pub fn kernel(&self) -> &Array4<f32> {
        &self.kernel
    }

    pub fn bias(&self) -> &Array1<f32> {
        &self.bias
    }

    pub fn set_kernel(&mut self, kernel: Array4<f32>) -> Result<()> {
        let (oc, ic, kh, kw) = self.config.kernel_shape();
        check_same_shape(&[oc, ic, kh, kw], kernel.shape(), "kernel")?;
        self.kernel = kernel;
        Ok(())
    }

    pub fn set_bias(&mut self, bias: Array1<f32>) -> Result<()> {
        check_same_shape(&[self.config.output_channels], bias.shape(), "bias")?;
        self.bias = bias;
        Ok(())
    }

    /// Output shape for an input of dimensions `(batch, channel, row, column)`.
    pub fn output_shape(&self, input_dim: (usize, usize, usize, usize)) -> Result<(usize, usize, usize, usize)> {
        let (batch, channels, height, width) = input_dim;
        if channels != self.config.input_channels {
            return Err(LayerError::ShapeMismatch {
                expected: vec![self.config.input_channels],
                got: vec![channels],
                message: "input channels do not match kernel input channels".to_string(),
            });
        }
        let (out_h, out_w) = self.config.output_spatial(height, width).ok_or_else(|| {
            let (extent_h, extent_w) = self.config.kernel_extent();
            LayerError::ShapeMismatch {
                expected: vec![extent_h, extent_w],
                got: vec![height, width],
                message: "input smaller than the dilated kernel".to_string(),
            }
        })?;
        Ok((batch, self.config.output_channels, out_h, out_w))
    }

    pub fn forward(&self, input: ArrayView4<f32>) -> Result<Array4<f32>> {
        let shape = self.output_shape(input.dim())?;
        let (batch, out_c, out_h, out_w) = shape;
        let (in_c, k_h, k_w) = (self.config.input_channels, self.config.kernel_height, self.config.kernel_width);
        let (s_h, s_w) = (self.config.stride_height, self.config.stride_width);
        let (d_h, d_w) = (self.config.dilation_height, self.config.dilation_width);
        let kernel = &self.kernel;

        let samples: Vec<Array3<f32>> = (0..batch)
            .into_par_iter()
            .map(|n| {
                let sample = input.index_axis(Axis(0), n);
                let mut out = Array3::<f32>::zeros((out_c, out_h, out_w));
                for ((oc, oh, ow), value) in out.indexed_iter_mut() {
                    let mut sum = 0.0f32;
                    for ic in 0..in_c {
                        for kh in 0..k_h {
                            let row = oh * s_h + kh * d_h;
                            for kw in 0..k_w {
                                let col = ow * s_w + kw * d_w;
                                sum += sample[[ic, row, col]] * kernel[[oc, ic, kh, kw]];
                            }
                        }
                    }
                    *value = sum;
                }

                // One scalar per output channel
                for (mut channel, &b) in out.axis_iter_mut(Axis(0)).zip(self.bias.iter()) {
                    channel.map_inplace(|x| *x += b);
                }
                out
            })
            .collect();

        Ok(assemble(shape, samples))
    }

    /// Gradient with respect to the input: the transpose of `forward`,
    /// scattering each upstream gradient back through every kernel tap.
    pub fn backward(&self, input: ArrayView4<f32>, grad_output: ArrayView4<f32>) -> Result<Array4<f32>> {
        let (batch, out_c, out_h, out_w) = self.output_shape(input.dim())?;
        check_same_shape(&[batch, out_c, out_h, out_w], grad_output.shape(), "grad_output")?;

        let (in_c, in_h, in_w) = (input.shape()[1], input.shape()[2], input.shape()[3]);
        let (k_h, k_w) = (self.config.kernel_height, self.config.kernel_width);
        let (s_h, s_w) = (self.config.stride_height, self.config.stride_width);
        let (d_h, d_w) = (self.config.dilation_height, self.config.dilation_width);
        let kernel = &self.kernel;

        let samples: Vec<Array3<f32>> = (0..batch)
            .into_par_iter()
            .map(|n| {
                let upstream = grad_output.index_axis(Axis(0), n);
                let mut grad = Array3::<f32>::zeros((in_c, in_h, in_w));
                for ((oc, oh, ow), &g) in upstream.indexed_iter() {
                    for ic in 0..in_c {
                        for kh in 0..k_h {
                            let row = oh * s_h + kh * d_h;
                            for kw in 0..k_w {
                                let col = ow * s_w + kw * d_w;
                                grad[[ic, row, col]] += kernel[[oc, ic, kh, kw]] * g;
                            }
                        }
                    }
                }
                grad
            })
            .collect();

        Ok(assemble((batch, in_c, in_h, in_w), samples))
    }

    /// Kernel and bias gradients, summed across the batch.
    pub fn compute_grads(&self, input: ArrayView4<f32>, grad_output: ArrayView4<f32>) -> Result<ConvGrads> {
        let (batch, out_c, out_h, out_w) = self.output_shape(input.dim())?;
        check_same_shape(&[batch, out_c, out_h, out_w], grad_output.shape(), "grad_output")?;

        let kernel_shape = self.config.kernel_shape();
        let (s_h, s_w) = (self.config.stride_height, self.config.stride_width);
        let (d_h, d_w) = (self.config.dilation_height, self.config.dilation_width);

        // Per-sample partials, merged below in batch order.
        let partials: Vec<(Array4<f32>, Array1<f32>)> = (0..batch)
            .into_par_iter()
            .map(|n| {
                let sample = input.index_axis(Axis(0), n);
                let upstream = grad_output.index_axis(Axis(0), n);
                let mut grad_kernel = Array4::<f32>::zeros(kernel_shape);
                for ((oc, ic, kh, kw), value) in grad_kernel.indexed_iter_mut() {
                    let mut sum = 0.0f32;
                    for oh in 0..out_h {
                        let row = oh * s_h + kh * d_h;
                        for ow in 0..out_w {
                            let col = ow * s_w + kw * d_w;
                            sum += sample[[ic, row, col]] * upstream[[oc, oh, ow]];
                        }
                    }
                    *value = sum;
                }
                let grad_bias = upstream.sum_axis(Axis(2)).sum_axis(Axis(1));
                (grad_kernel, grad_bias)
            })
            .collect();

        let mut grads = ConvGrads {
            kernel: Array4::zeros(kernel_shape),
            bias: Array1::zeros(out_c),
        };
        for (grad_kernel, grad_bias) in partials {
            grads.kernel += &grad_kernel;
            grads.bias += &grad_bias;
        }
        Ok(grads)
    }
}

impl Layer for ConvolutionalLayer {
    fn name(&self) -> &'static str {
        "ConvolutionalLayer"
    }

    fn fprop(&mut self, input: ArrayView4<f32>) -> Result<Array4<f32>> {
        let output = self.forward(input)?;
        debug!(layer = self.name(), input = ?input.shape(), output = ?output.shape(), "fprop");
        Ok(output)
    }

    fn bprop(
        &mut self,
        input: ArrayView4<f32>,
        output: ArrayView4<f32>,
        grad_output: ArrayView4<f32>,
    ) -> Result<Array4<f32>> {
        check_same_shape(output.shape(), grad_output.shape(), "grad_output")?;
        let grad_input = self.backward(input, grad_output)?;
        debug!(layer = self.name(), grad_output = ?grad_output.shape(), grad_input = ?grad_input.shape(), "bprop");
        Ok(grad_input)
    }

    fn grads_wrt_params(
        &self,
        input: ArrayView4<f32>,
        grad_output: ArrayView4<f32>,
    ) -> Result<Vec<ArrayD<f32>>> {
        let grads = self.compute_grads(input, grad_output)?;
        debug!(layer = self.name(), batch = input.shape()[0], "grads_wrt_params");
        Ok(vec![grads.kernel.into_dyn(), grads.bias.into_dyn()])
    }

    fn params(&self) -> Vec<ArrayD<f32>> {
        vec![self.kernel.clone().into_dyn(), self.bias.clone().into_dyn()]
    }

    fn set_params(&mut self, params: Vec<ArrayD<f32>>) -> Result<()> {
        let [kernel, bias]: [ArrayD<f32>; 2] = params.try_into().map_err(|p: Vec<ArrayD<f32>>| {
            LayerError::shape(&[2], &[p.len()], "parameter count")
        })?;
        let (oc, ic, kh, kw) = self.config.kernel_shape();
        let kernel = kernel
            .into_dimensionality::<Ix4>()
            .map_err(|_| LayerError::shape(&[oc, ic, kh, kw], &[], "kernel rank"))?;
        let bias = bias
            .into_dimensionality::<Ix1>()
            .map_err(|_| LayerError::shape(&[oc], &[], "bias rank"))?;

        // Validate both before touching either.
        check_same_shape(&[oc, ic, kh, kw], kernel.shape(), "kernel")?;
        check_same_shape(&[oc], bias.shape(), "bias")?;
        self.kernel = kernel;
        self.bias = bias;
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}

impl fmt::Display for ConvolutionalLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.config;
        write!(
            f,
            "ConvolutionalLayer(input_channels={}, output_channels={}, kernel=({}, {}), stride=({}, {}), dilation=({}, {}))",
            c.input_channels,
            c.output_channels,
            c.kernel_height,
            c.kernel_width,
            c.stride_height,
            c.stride_width,
            c.dilation_height,
            c.dilation_width,
        )
    }
}
