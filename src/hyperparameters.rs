use crate::error::{LayerError, Result};

/// Span of a dilated window, `dilation * (window - 1) + 1`.
///
/// `None` for a zero-sized window or when the span overflows `usize`.
pub fn window_extent(window: usize, dilation: usize) -> Option<usize> {
    if window == 0 {
        return None;
    }
    dilation.checked_mul(window - 1)?.checked_add(1)
}

/// Number of output positions along one spatial axis.
///
/// Returns `None` when the dilated window does not fit inside the input.
pub fn output_size(input: usize, window: usize, stride: usize, dilation: usize) -> Option<usize> {
    if stride == 0 || dilation == 0 {
        return None;
    }
    let extent = window_extent(window, dilation)?;
    if input < extent {
        return None;
    }
    Some((input - extent) / stride + 1)
}

fn ensure_positive(fields: &[(&str, usize)]) -> Result<()> {
    for (name, value) in fields {
        if *value == 0 {
            return Err(LayerError::InvalidConfiguration(format!("{name} must be > 0")));
        }
    }
    Ok(())
}

fn ensure_extent(axis: &str, window: usize, dilation: usize) -> Result<()> {
    window_extent(window, dilation).map(|_| ()).ok_or_else(|| {
        LayerError::InvalidConfiguration(format!(
            "dilated {axis} window ({window} taps, dilation {dilation}) overflows usize"
        ))
    })
}

/// Construction-time options for a convolutional layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvConfig {
    pub input_channels: usize,
    pub output_channels: usize,
    pub kernel_height: usize,
    pub kernel_width: usize,
    pub stride_height: usize,
    pub stride_width: usize,
    pub dilation_height: usize,
    pub dilation_width: usize,
}

impl ConvConfig {
    /// Unit stride and no dilation; use the `with_*` setters to change them.
    pub fn new(
        input_channels: usize,
        output_channels: usize,
        kernel_height: usize,
        kernel_width: usize,
    ) -> Self {
        ConvConfig {
            input_channels,
            output_channels,
            kernel_height,
            kernel_width,
            stride_height: 1,
            stride_width: 1,
            dilation_height: 1,
            dilation_width: 1,
        }
    }

    pub fn with_stride(mut self, height: usize, width: usize) -> Self {
        self.stride_height = height;
        self.stride_width = width;
        self
    }

    pub fn with_dilation(mut self, height: usize, width: usize) -> Self {
        self.dilation_height = height;
        self.dilation_width = width;
        self
    }

    pub fn validate(&self) -> Result<()> {
        ensure_positive(&[
            ("input_channels", self.input_channels),
            ("output_channels", self.output_channels),
            ("kernel_height", self.kernel_height),
            ("kernel_width", self.kernel_width),
            ("stride_height", self.stride_height),
            ("stride_width", self.stride_width),
            ("dilation_height", self.dilation_height),
            ("dilation_width", self.dilation_width),
        ])?;
        ensure_extent("kernel height", self.kernel_height, self.dilation_height)?;
        ensure_extent("kernel width", self.kernel_width, self.dilation_width)
    }

    /// Dilated kernel span as (rows, columns). Saturates on overflow.
    pub fn kernel_extent(&self) -> (usize, usize) {
        (
            window_extent(self.kernel_height, self.dilation_height).unwrap_or(usize::MAX),
            window_extent(self.kernel_width, self.dilation_width).unwrap_or(usize::MAX),
        )
    }

    pub fn kernel_shape(&self) -> (usize, usize, usize, usize) {
        (
            self.output_channels,
            self.input_channels,
            self.kernel_height,
            self.kernel_width,
        )
    }

    /// Output (height, width) for an input of the given spatial size.
    pub fn output_spatial(&self, input_height: usize, input_width: usize) -> Option<(usize, usize)> {
        let height = output_size(input_height, self.kernel_height, self.stride_height, self.dilation_height)?;
        let width = output_size(input_width, self.kernel_width, self.stride_width, self.dilation_width)?;
        Some((height, width))
    }
}

impl Default for ConvConfig {
    fn default() -> Self {
        ConvConfig::new(1, 1, 3, 3)
    }
}

/// Construction-time options for a max-pooling layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub pool_height: usize,
    pub pool_width: usize,
    pub stride_height: usize,
    pub stride_width: usize,
    pub dilation_height: usize,
    pub dilation_width: usize,
}

impl PoolConfig {
    /// Stride defaults to the pool size, so windows do not overlap.
    pub fn new(pool_height: usize, pool_width: usize) -> Self {
        PoolConfig {
            pool_height,
            pool_width,
            stride_height: pool_height,
            stride_width: pool_width,
            dilation_height: 1,
            dilation_width: 1,
        }
    }

    pub fn with_stride(mut self, height: usize, width: usize) -> Self {
        self.stride_height = height;
        self.stride_width = width;
        self
    }

    pub fn with_dilation(mut self, height: usize, width: usize) -> Self {
        self.dilation_height = height;
        self.dilation_width = width;
        self
    }

    pub fn validate(&self) -> Result<()> {
        ensure_positive(&[
            ("pool_height", self.pool_height),
            ("pool_width", self.pool_width),
            ("stride_height", self.stride_height),
            ("stride_width", self.stride_width),
            ("dilation_height", self.dilation_height),
            ("dilation_width", self.dilation_width),
        ])?;
        ensure_extent("pool height", self.pool_height, self.dilation_height)?;
        ensure_extent("pool width", self.pool_width, self.dilation_width)
    }

    /// Dilated window span as (rows, columns). Saturates on overflow.
    pub fn pool_extent(&self) -> (usize, usize) {
        (
            window_extent(self.pool_height, self.dilation_height).unwrap_or(usize::MAX),
            window_extent(self.pool_width, self.dilation_width).unwrap_or(usize::MAX),
        )
    }

    pub fn output_spatial(&self, input_height: usize, input_width: usize) -> Option<(usize, usize)> {
        let height = output_size(input_height, self.pool_height, self.stride_height, self.dilation_height)?;
        let width = output_size(input_width, self.pool_width, self.stride_width, self.dilation_width)?;
        Some((height, width))
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig::new(2, 2)
    }
}
