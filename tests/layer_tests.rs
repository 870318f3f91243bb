use approx::{assert_abs_diff_eq, assert_relative_eq};
use convpool::{ConvConfig, ConvolutionalLayer, Layer, LayerError, MaxPooling2DLayer, PoolConfig};
use ndarray::{array, Array, Array1, Array4};

fn random_tensor(rng: &mut fastrand::Rng, shape: (usize, usize, usize, usize)) -> Array4<f32> {
    Array4::from_shape_fn(shape, |_| rng.f32() * 2.0 - 1.0)
}

/// Distinct values 0.1 apart in shuffled order, so small perturbations never
/// change which element wins a pooling window.
fn distinct_tensor(rng: &mut fastrand::Rng, shape: (usize, usize, usize, usize)) -> Array4<f32> {
    let (n, c, h, w) = shape;
    let mut values: Vec<f32> = (0..n * c * h * w).map(|i| i as f32 * 0.1).collect();
    rng.shuffle(&mut values);
    Array4::from_shape_vec(shape, values).unwrap()
}

fn to_f64(a: &Array4<f32>) -> Array4<f64> {
    a.mapv(f64::from)
}

// Scalar loss sum(output * weights), so dL/doutput = weights.
fn weighted_sum(output: &Array4<f64>, weights: &Array4<f64>) -> f64 {
    (output * weights).sum()
}

fn numeric_grad<F>(x: &Array4<f64>, eps: f64, mut loss: F) -> Array4<f64>
where
    F: FnMut(&Array4<f64>) -> f64,
{
    let mut grad = Array4::<f64>::zeros(x.dim());
    for (idx, g) in grad.indexed_iter_mut() {
        let mut plus = x.clone();
        plus[idx] += eps;
        let mut minus = x.clone();
        minus[idx] -= eps;
        *g = (loss(&plus) - loss(&minus)) / (2.0 * eps);
    }
    grad
}

/// Direct f64 evaluation of the strided, dilated convolution.
fn reference_conv(config: &ConvConfig, x: &Array4<f64>, kernel: &Array4<f64>, bias: &Array1<f64>) -> Array4<f64> {
    let (batch, _, height, width) = x.dim();
    let (out_c, in_c, k_h, k_w) = config.kernel_shape();
    let (out_h, out_w) = config.output_spatial(height, width).unwrap();
    Array4::from_shape_fn((batch, out_c, out_h, out_w), |(n, oc, oh, ow)| {
        let mut sum = bias[oc];
        for ic in 0..in_c {
            for kh in 0..k_h {
                for kw in 0..k_w {
                    let row = oh * config.stride_height + kh * config.dilation_height;
                    let col = ow * config.stride_width + kw * config.dilation_width;
                    sum += x[[n, ic, row, col]] * kernel[[oc, ic, kh, kw]];
                }
            }
        }
        sum
    })
}

/// Direct f64 evaluation of dilated max pooling.
fn reference_pool(config: &PoolConfig, x: &Array4<f64>) -> Array4<f64> {
    let (batch, channels, height, width) = x.dim();
    let (out_h, out_w) = config.output_spatial(height, width).unwrap();
    Array4::from_shape_fn((batch, channels, out_h, out_w), |(n, ch, oh, ow)| {
        let mut best = f64::NEG_INFINITY;
        for ph in 0..config.pool_height {
            for pw in 0..config.pool_width {
                let row = oh * config.stride_height + ph * config.dilation_height;
                let col = ow * config.stride_width + pw * config.dilation_width;
                best = best.max(x[[n, ch, row, col]]);
            }
        }
        best
    })
}

fn conv_configs() -> Vec<ConvConfig> {
    vec![
        ConvConfig::new(2, 3, 3, 2),
        ConvConfig::new(2, 3, 3, 2).with_stride(2, 1),
        ConvConfig::new(2, 3, 2, 2).with_dilation(2, 3),
        ConvConfig::new(2, 3, 2, 3).with_stride(2, 2).with_dilation(2, 1),
    ]
}

#[test]
fn test_conv_shape_law() {
    let input = Array4::<f32>::zeros((2, 2, 9, 8));
    for config in conv_configs() {
        let mut layer = ConvolutionalLayer::new(config).unwrap();
        let output = layer.fprop(input.view()).unwrap();

        let expected_h = (9 - 1 - config.dilation_height * (config.kernel_height - 1)) / config.stride_height + 1;
        let expected_w = (8 - 1 - config.dilation_width * (config.kernel_width - 1)) / config.stride_width + 1;
        assert_eq!(output.shape(), &[2, 3, expected_h, expected_w], "config {:?}", config);
    }
}

#[test]
fn test_pool_shape_law() {
    let input = Array4::<f32>::zeros((1, 3, 10, 7));
    let configs = [
        PoolConfig::new(2, 2),
        PoolConfig::new(3, 2).with_stride(1, 2),
        PoolConfig::new(2, 3).with_stride(2, 1).with_dilation(3, 2),
    ];
    for config in configs {
        let mut layer = MaxPooling2DLayer::new(config).unwrap();
        let output = layer.fprop(input.view()).unwrap();

        let expected_h = (10 - 1 - config.dilation_height * (config.pool_height - 1)) / config.stride_height + 1;
        let expected_w = (7 - 1 - config.dilation_width * (config.pool_width - 1)) / config.stride_width + 1;
        assert_eq!(output.shape(), &[1, 3, expected_h, expected_w], "config {:?}", config);
    }
}

#[test]
fn test_conv_bprop_matches_finite_differences() {
    let mut rng = fastrand::Rng::with_seed(42);
    for config in conv_configs() {
        let kernel = random_tensor(&mut rng, config.kernel_shape());
        let bias = Array1::from_shape_fn(config.output_channels, |_| rng.f32());
        let mut layer = ConvolutionalLayer::with_params(config, kernel.clone(), bias.clone()).unwrap();
        let (kernel, bias) = (to_f64(&kernel), bias.mapv(f64::from));

        let input = random_tensor(&mut rng, (2, 2, 7, 6));
        let output = layer.fprop(input.view()).unwrap();
        let reference = reference_conv(&config, &to_f64(&input), &kernel, &bias);
        for (a, r) in output.iter().zip(reference.iter()) {
            assert_abs_diff_eq!(*a as f64, *r, epsilon = 1e-5);
        }

        let weights = random_tensor(&mut rng, output.dim());
        let analytic = layer.bprop(input.view(), output.view(), weights.view()).unwrap();
        let weights = to_f64(&weights);
        let numeric = numeric_grad(&to_f64(&input), 1e-4, |x| {
            weighted_sum(&reference_conv(&config, x, &kernel, &bias), &weights)
        });

        for (a, n) in analytic.iter().zip(numeric.iter()) {
            assert_relative_eq!(*a as f64, *n, epsilon = 1e-4, max_relative = 1e-4);
        }
    }
}

#[test]
fn test_conv_param_grads_match_finite_differences() {
    let mut rng = fastrand::Rng::with_seed(7);
    for config in conv_configs() {
        let kernel = random_tensor(&mut rng, config.kernel_shape());
        let bias = Array1::from_shape_fn(config.output_channels, |_| rng.f32());
        let layer = ConvolutionalLayer::with_params(config, kernel.clone(), bias.clone()).unwrap();

        let input = random_tensor(&mut rng, (3, 2, 6, 7));
        let output = layer.forward(input.view()).unwrap();
        let weights = random_tensor(&mut rng, output.dim());
        let grads = layer.compute_grads(input.view(), weights.view()).unwrap();

        let (x, weights64) = (to_f64(&input), to_f64(&weights));
        let (kernel, bias) = (to_f64(&kernel), bias.mapv(f64::from));

        let numeric_kernel = numeric_grad(&kernel, 1e-4, |k| {
            weighted_sum(&reference_conv(&config, &x, k, &bias), &weights64)
        });
        for (a, n) in grads.kernel.iter().zip(numeric_kernel.iter()) {
            assert_relative_eq!(*a as f64, *n, epsilon = 1e-4, max_relative = 1e-4);
        }

        // Bias gradient is the upstream gradient summed over batch and space.
        for oc in 0..config.output_channels {
            let eps = 1e-4;
            let (mut plus, mut minus) = (bias.clone(), bias.clone());
            plus[oc] += eps;
            minus[oc] -= eps;
            let numeric = (weighted_sum(&reference_conv(&config, &x, &kernel, &plus), &weights64)
                - weighted_sum(&reference_conv(&config, &x, &kernel, &minus), &weights64))
                / (2.0 * eps);
            assert_relative_eq!(grads.bias[oc] as f64, numeric, epsilon = 1e-4, max_relative = 1e-4);

            let direct: f32 = weights.index_axis(ndarray::Axis(1), oc).sum();
            assert_abs_diff_eq!(grads.bias[oc], direct, epsilon = 1e-4);
        }
    }
}

#[test]
fn test_pool_bprop_matches_finite_differences() {
    let mut rng = fastrand::Rng::with_seed(3);
    let configs = [
        PoolConfig::new(2, 2),
        PoolConfig::new(3, 3).with_stride(1, 1),
        PoolConfig::new(2, 3).with_stride(1, 2).with_dilation(2, 1),
    ];
    for config in configs {
        let mut layer = MaxPooling2DLayer::new(config).unwrap();
        let input = distinct_tensor(&mut rng, (2, 2, 6, 7));
        let output = layer.fprop(input.view()).unwrap();
        assert_eq!(to_f64(&output), reference_pool(&config, &to_f64(&input)));

        let weights = random_tensor(&mut rng, output.dim());
        let analytic = layer.bprop(input.view(), output.view(), weights.view()).unwrap();
        let weights = to_f64(&weights);
        let numeric = numeric_grad(&to_f64(&input), 1e-4, |x| weighted_sum(&reference_pool(&config, x), &weights));

        for (a, n) in analytic.iter().zip(numeric.iter()) {
            assert_abs_diff_eq!(*a as f64, *n, epsilon = 1e-6);
        }
    }
}

#[test]
fn test_conv_overlap_accumulates_every_window() {
    let config = ConvConfig::new(1, 1, 2, 2);
    let layer = ConvolutionalLayer::with_params(config, Array4::ones((1, 1, 2, 2)), array![0.0]).unwrap();
    let grad_output = array![[[[1.0f32, 2.0], [3.0, 4.0]]]];

    let grad = layer.backward(Array4::zeros((1, 1, 3, 3)).view(), grad_output.view()).unwrap();

    // The centre is read by all four windows, the corners by one each.
    assert_eq!(grad[[0, 0, 1, 1]], 10.0);
    assert_eq!(grad[[0, 0, 0, 0]], 1.0);
    assert_eq!(grad[[0, 0, 0, 1]], 3.0);
    assert_eq!(grad[[0, 0, 2, 2]], 4.0);
}

#[test]
fn test_pool_overlap_accumulates_every_window() {
    let mut input = Array4::<f32>::zeros((1, 1, 4, 4));
    input[[0, 0, 1, 2]] = 5.0;
    let mut layer = MaxPooling2DLayer::new(PoolConfig::new(3, 3).with_stride(1, 1)).unwrap();

    let output = layer.fprop(input.view()).unwrap();
    assert_eq!(output, Array4::<f32>::from_elem((1, 1, 2, 2), 5.0));

    let grad_output = array![[[[1.0f32, 2.0], [3.0, 4.0]]]];
    let grad = layer.bprop(input.view(), output.view(), grad_output.view()).unwrap();
    assert_eq!(grad[[0, 0, 1, 2]], 10.0);
    assert_eq!(grad.sum(), 10.0);
}

#[test]
fn test_fprop_is_deterministic_across_thread_counts() {
    let mut rng = fastrand::Rng::with_seed(11);
    let config = ConvConfig::new(3, 4, 3, 3).with_stride(1, 2);
    let mut conv = ConvolutionalLayer::new(config).unwrap();
    let mut pool = MaxPooling2DLayer::new(PoolConfig::new(2, 2).with_stride(1, 1)).unwrap();

    // Plenty of ties for the pooling layer.
    let input = random_tensor(&mut rng, (6, 3, 9, 9)).mapv(|v| (v * 2.0).round());

    let conv_out = conv.fprop(input.view()).unwrap();
    let pool_out = pool.fprop(input.view()).unwrap();
    let positions = pool.cache().unwrap().positions().clone();

    let single = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
    single.install(|| {
        assert_eq!(conv.fprop(input.view()).unwrap(), conv_out);
        assert_eq!(pool.fprop(input.view()).unwrap(), pool_out);
        assert_eq!(pool.cache().unwrap().positions(), &positions);
    });

    let grads = conv.compute_grads(input.view(), conv_out.view()).unwrap();
    let again = single.install(|| conv.compute_grads(input.view(), conv_out.view()).unwrap());
    assert_eq!(grads, again);
}

#[test]
fn test_convolution_scenario() {
    let input: Array4<f32> = Array::range(1.0, 17.0, 1.0).into_shape_with_order((1, 1, 4, 4)).unwrap();
    let config = ConvConfig::new(1, 1, 2, 2);
    let mut layer = ConvolutionalLayer::with_params(config, Array4::ones((1, 1, 2, 2)), array![0.0]).unwrap();

    let output = layer.fprop(input.view()).unwrap();
    assert_eq!(output.shape(), &[1, 1, 3, 3]);
    for oh in 0..3 {
        for ow in 0..3 {
            let window: f32 = input.slice(ndarray::s![0, 0, oh..oh + 2, ow..ow + 2]).sum();
            assert_eq!(output[[0, 0, oh, ow]], window);
        }
    }
}

#[test]
fn test_dilation_scenario() {
    let input: Array4<f32> = Array::range(1.0, 17.0, 1.0).into_shape_with_order((1, 1, 4, 4)).unwrap();
    let config = ConvConfig::new(1, 1, 2, 2).with_dilation(2, 2);
    let mut layer = ConvolutionalLayer::with_params(config, Array4::ones((1, 1, 2, 2)), array![0.0]).unwrap();

    let output = layer.fprop(input.view()).unwrap();
    assert_eq!(output.shape(), &[1, 1, 2, 2]);
    for oh in 0..2 {
        for ow in 0..2 {
            let window: f32 = input.slice(ndarray::s![0, 0, oh..oh + 3;2, ow..ow + 3;2]).sum();
            assert_eq!(output[[0, 0, oh, ow]], window);
        }
    }
}

#[test]
fn test_max_pooling_scenario() {
    let input = array![[[[0.1f32, 0.2, 0.3], [0.4, 0.9, 0.5], [0.6, 0.7, 0.8]]]];
    let mut layer = MaxPooling2DLayer::new(PoolConfig::new(2, 2).with_stride(1, 1)).unwrap();

    let output = layer.fprop(input.view()).unwrap();
    assert!(output.iter().all(|&v| v == 0.9));

    let grad = layer
        .bprop(input.view(), output.view(), Array4::ones((1, 1, 2, 2)).view())
        .unwrap();
    let mut expected = Array4::<f32>::zeros((1, 1, 3, 3));
    expected[[0, 0, 1, 1]] = 4.0;
    assert_eq!(grad, expected);
}

#[test]
fn test_layers_as_trait_objects() {
    let mut layers: Vec<Box<dyn Layer>> = vec![
        Box::new(ConvolutionalLayer::new(ConvConfig::new(1, 2, 2, 2)).unwrap()),
        Box::new(MaxPooling2DLayer::new(PoolConfig::new(2, 2)).unwrap()),
    ];
    let input = Array4::<f32>::ones((1, 1, 5, 5));

    let hidden = layers[0].fprop(input.view()).unwrap();
    let output = layers[1].fprop(hidden.view()).unwrap();
    assert_eq!(output.shape(), &[1, 2, 2, 2]);

    let names: Vec<_> = layers.iter().map(|l| l.name()).collect();
    assert_eq!(names, ["ConvolutionalLayer", "MaxPooling2DLayer"]);

    let copy = layers[0].clone();
    assert_eq!(copy.params(), layers[0].params());
}

#[test]
fn test_errors_are_reported_not_panicked() {
    let mut conv = ConvolutionalLayer::new(ConvConfig::new(2, 1, 3, 3)).unwrap();
    assert!(matches!(
        conv.fprop(Array4::zeros((1, 1, 5, 5)).view()),
        Err(LayerError::ShapeMismatch { .. })
    ));
    assert!(matches!(
        conv.fprop(Array4::zeros((1, 2, 2, 5)).view()),
        Err(LayerError::ShapeMismatch { .. })
    ));

    let mut pool = MaxPooling2DLayer::new(PoolConfig::new(2, 2)).unwrap();
    let x = Array4::<f32>::zeros((1, 1, 4, 4));
    let y = Array4::<f32>::zeros((1, 1, 2, 2));
    assert!(matches!(pool.bprop(x.view(), y.view(), y.view()), Err(LayerError::StaleState(_))));

    assert!(matches!(
        ConvolutionalLayer::new(ConvConfig::new(1, 1, 2, 2).with_dilation(0, 1)),
        Err(LayerError::InvalidConfiguration(_))
    ));
}
