//! Convolution and max-pooling layers with stride and dilation.
//!
//! Both layers implement [`Layer`]: `fprop`, `bprop` (gradient with respect
//! to the input) and `grads_wrt_params`. Tensors are `ndarray::Array4<f32>`
//! laid out as (batch, channel, row, column).

mod error;
mod hyperparameters;
mod layers;
mod model;
mod optimizer;

pub use error::{LayerError, Result};
pub use hyperparameters::{output_size, window_extent, ConvConfig, PoolConfig};
pub use layers::{ArgmaxCache, ConvGrads, ConvolutionalLayer, Layer, MaxPooling2DLayer};
pub use model::{Backward, Sequential};
pub use optimizer::Optimizer;
