use ndarray::{Array1, Array4, ArrayD, ArrayViewD, ArrayViewMutD, IxDyn};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{check_shape, contiguous, contiguous_mut, source_index, Activation, Initializer, Padding};
use crate::simd::{axpy, dot};
use crate::{Error, Result};

fn unit_strides() -> [usize; 2] {
    [1, 1]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conv2DConfig {
    #[serde(default)]
    pub name: String,
    pub filters: usize,
    pub kernel_size: [usize; 2],
    #[serde(default = "unit_strides")]
    pub strides: [usize; 2],
    #[serde(default)]
    pub padding: Padding,
    #[serde(default)]
    pub activation: Activation,
    #[serde(default)]
    pub kernel_initializer: Initializer,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_input_shape: Option<Vec<Option<usize>>>,
}

impl Conv2DConfig {
    pub fn new(filters: usize, kernel_size: [usize; 2]) -> Self {
        Self {
            name: String::new(),
            filters,
            kernel_size,
            strides: unit_strides(),
            padding: Padding::Valid,
            activation: Activation::Linear,
            kernel_initializer: Initializer::GlorotUniform,
            batch_input_shape: None,
        }
    }

    pub fn with_strides(mut self, strides: [usize; 2]) -> Self {
        self.strides = strides;
        self
    }

    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_kernel_initializer(mut self, initializer: Initializer) -> Self {
        self.kernel_initializer = initializer;
        self
    }

    // Per-sample (height, width, channels); the batch axis is left open
    pub fn with_input_shape(mut self, shape: [usize; 3]) -> Self {
        self.batch_input_shape = Some(vec![None, Some(shape[0]), Some(shape[1]), Some(shape[2])]);
        self
    }
}

// 2D convolution over (height, width, channels) input.
// Kernel layout is (kernel_h, kernel_w, in_channels, filters) so that the filters for one
// input cell are contiguous.
#[derive(Debug, Clone)]
pub struct Conv2D {
    config: Conv2DConfig,
    input_shape: [usize; 3],
    output_shape: [usize; 3],
    leading: [usize; 2],
    kernel: Array4<f32>,
    bias: Array1<f32>,
}

impl Conv2D {
    pub fn new(config: Conv2DConfig, input_shape: &[usize], rng: &mut impl Rng) -> Result<Self> {
        let &[height, width, channels] = input_shape else {
            return Err(Error::structure(format!(
                "{} expects (height, width, channels) input, got {:?}",
                config.name, input_shape
            )));
        };
        let [kernel_h, kernel_w] = config.kernel_size;
        let [stride_h, stride_w] = config.strides;
        if config.filters == 0 || channels == 0 {
            return Err(Error::structure(format!(
                "{} needs at least one filter and one input channel",
                config.name
            )));
        }
        let out_h = config.padding.output_len(height, kernel_h, stride_h);
        let out_w = config.padding.output_len(width, kernel_w, stride_w);
        let (Some(out_h), Some(out_w)) = (out_h, out_w) else {
            return Err(Error::structure(format!(
                "{}: kernel {:?} with strides {:?} does not fit input {:?}",
                config.name, config.kernel_size, config.strides, input_shape
            )));
        };

        let receptive_field = kernel_h * kernel_w;
        let kernel = config.kernel_initializer.init(
            (kernel_h, kernel_w, channels, config.filters),
            receptive_field * channels,
            receptive_field * config.filters,
            rng,
        );
        let bias = Array1::zeros(config.filters);
        let leading = [
            config.padding.leading(height, kernel_h, stride_h),
            config.padding.leading(width, kernel_w, stride_w),
        ];

        Ok(Self {
            output_shape: [out_h, out_w, config.filters],
            input_shape: [height, width, channels],
            leading,
            kernel,
            bias,
            config,
        })
    }

    pub fn config(&self) -> &Conv2DConfig {
        &self.config
    }

    pub fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    pub fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        check_shape(&self.config.name, &self.input_shape, input.shape())?;
        let x = contiguous(input, "convolution input")?;
        let kernel = self.kernel_slice()?;
        let bias = self.bias_slice()?;
        let [out_h, out_w, filters] = self.output_shape;

        let mut output = vec![0.0_f32; out_h * out_w * filters];
        for (cell, out) in output.chunks_exact_mut(filters).enumerate() {
            out.copy_from_slice(bias);
            self.for_each_tap(cell / out_w, cell % out_w, |x_offset, k_offset| {
                let value = x[x_offset];
                if value != 0.0 {
                    axpy(value, &kernel[k_offset..k_offset + filters], out);
                }
            });
        }
        self.config.activation.apply(&mut output, filters);
        Ok(ArrayD::from_shape_vec(IxDyn(&self.output_shape), output)?)
    }

    pub fn backward(
        &self,
        input: &ArrayD<f32>,
        output: &ArrayD<f32>,
        grad_output: &ArrayD<f32>,
        grads: &mut [ArrayD<f32>],
        need_input_grad: bool,
    ) -> Result<Option<ArrayD<f32>>> {
        check_shape(&self.config.name, &self.input_shape, input.shape())?;
        check_shape(&self.config.name, &self.output_shape, output.shape())?;
        check_shape(&self.config.name, &self.output_shape, grad_output.shape())?;
        let x = contiguous(input, "convolution input")?;
        let y = contiguous(output, "convolution output")?;
        let kernel = self.kernel_slice()?;
        let [_, out_w, filters] = self.output_shape;

        let mut delta = contiguous(grad_output, "convolution gradient")?.to_vec();
        self.config.activation.backward(y, &mut delta, filters);

        let count = grads.len();
        let [kernel_grad, bias_grad] = grads else {
            return Err(Error::shape(format!(
                "{} expects 2 gradient tensors, got {}",
                self.config.name, count
            )));
        };
        let kernel_grad = contiguous_mut(kernel_grad, "kernel gradient")?;
        let bias_grad = contiguous_mut(bias_grad, "bias gradient")?;

        let mut input_grad = need_input_grad.then(|| vec![0.0_f32; x.len()]);
        for (cell, d) in delta.chunks_exact(filters).enumerate() {
            axpy(1.0, d, bias_grad);
            self.for_each_tap(cell / out_w, cell % out_w, |x_offset, k_offset| {
                let value = x[x_offset];
                if value != 0.0 {
                    axpy(value, d, &mut kernel_grad[k_offset..k_offset + filters]);
                }
                if let Some(input_grad) = input_grad.as_mut() {
                    input_grad[x_offset] += dot(&kernel[k_offset..k_offset + filters], d);
                }
            });
        }

        input_grad
            .map(|g| ArrayD::from_shape_vec(IxDyn(&self.input_shape), g))
            .transpose()
            .map_err(Error::from)
    }

    // Visit every (input offset, kernel offset) pair feeding output cell (oy, ox).
    // The kernel offset points at the start of the `filters` weights for that tap.
    #[inline]
    fn for_each_tap(&self, oy: usize, ox: usize, mut f: impl FnMut(usize, usize)) {
        let [height, width, channels] = self.input_shape;
        let [kernel_h, kernel_w] = self.config.kernel_size;
        let [stride_h, stride_w] = self.config.strides;
        let [lead_h, lead_w] = self.leading;
        let filters = self.config.filters;
        for ky in 0..kernel_h {
            let Some(iy) = source_index(oy, ky, stride_h, lead_h, height) else {
                continue;
            };
            for kx in 0..kernel_w {
                let Some(ix) = source_index(ox, kx, stride_w, lead_w, width) else {
                    continue;
                };
                let x_base = (iy * width + ix) * channels;
                let k_base = (ky * kernel_w + kx) * channels * filters;
                for c in 0..channels {
                    f(x_base + c, k_base + c * filters);
                }
            }
        }
    }

    fn kernel_slice(&self) -> Result<&[f32]> {
        self.kernel
            .as_slice()
            .ok_or_else(|| Error::shape("convolution kernel is not contiguous"))
    }

    fn bias_slice(&self) -> Result<&[f32]> {
        self.bias
            .as_slice()
            .ok_or_else(|| Error::shape("convolution bias is not contiguous"))
    }

    pub fn params(&self) -> Vec<(&'static str, ArrayViewD<'_, f32>)> {
        vec![
            ("kernel", self.kernel.view().into_dyn()),
            ("bias", self.bias.view().into_dyn()),
        ]
    }

    pub fn params_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        vec![
            self.kernel.view_mut().into_dyn(),
            self.bias.view_mut().into_dyn(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use rand::{rngs::SmallRng, SeedableRng};

    fn ramp_input(shape: [usize; 3]) -> ArrayD<f32> {
        let n = shape.iter().product::<usize>();
        let values = (0..n).map(|i| ((i * 7) % 11) as f32 / 10.0 - 0.4).collect();
        ArrayD::from_shape_vec(IxDyn(&shape), values).unwrap()
    }

    fn weighted_sum(output: &ArrayD<f32>, weights: &ArrayD<f32>) -> f32 {
        output.iter().zip(weights.iter()).map(|(a, b)| a * b).sum()
    }

    #[test]
    fn test_output_shape_valid() {
        let mut rng = SmallRng::seed_from_u64(0);
        let config = Conv2DConfig::new(32, [3, 3]).with_activation(Activation::Relu);
        let conv = Conv2D::new(config, &[28, 28, 1], &mut rng).unwrap();
        assert_eq!(conv.output_shape(), &[26, 26, 32]);
        assert_eq!(conv.params()[0].1.shape(), &[3, 3, 1, 32]);
        assert_eq!(conv.params()[1].1.shape(), &[32]);
    }

    #[test]
    fn test_output_shape_same_strided() {
        let mut rng = SmallRng::seed_from_u64(0);
        let config = Conv2DConfig::new(4, [3, 3])
            .with_strides([2, 2])
            .with_padding(Padding::Same);
        let conv = Conv2D::new(config, &[7, 8, 2], &mut rng).unwrap();
        assert_eq!(conv.output_shape(), &[4, 4, 4]);
    }

    #[test]
    fn test_kernel_larger_than_input_is_structural_error() {
        let mut rng = SmallRng::seed_from_u64(0);
        let config = Conv2DConfig::new(1, [5, 5]);
        let err = Conv2D::new(config, &[3, 3, 1], &mut rng).unwrap_err();
        assert!(matches!(err, Error::Structure(_)));
    }

    #[test]
    fn test_flat_input_is_structural_error() {
        let mut rng = SmallRng::seed_from_u64(0);
        let err = Conv2D::new(Conv2DConfig::new(1, [1, 1]), &[784], &mut rng).unwrap_err();
        assert!(matches!(err, Error::Structure(_)));
    }

    #[test]
    fn test_forward_box_filter() {
        let mut rng = SmallRng::seed_from_u64(0);
        let config = Conv2DConfig::new(1, [2, 2]).with_kernel_initializer(Initializer::Zeros);
        let mut conv = Conv2D::new(config, &[3, 3, 1], &mut rng).unwrap();
        conv.kernel.fill(1.0);
        conv.bias.fill(0.5);

        let input = Array3::from_shape_vec((3, 3, 1), (1..=9).map(|v| v as f32).collect())
            .unwrap()
            .into_dyn();
        let output = conv.forward(&input).unwrap();
        assert_eq!(output.shape(), &[2, 2, 1]);
        let expected = [1. + 2. + 4. + 5., 2. + 3. + 5. + 6., 4. + 5. + 7. + 8., 5. + 6. + 8. + 9.];
        for (got, want) in output.iter().zip(expected) {
            assert!((got - (want + 0.5)).abs() < 1e-5);
        }
    }

    #[test]
    fn test_forward_rejects_wrong_shape() {
        let mut rng = SmallRng::seed_from_u64(0);
        let conv = Conv2D::new(Conv2DConfig::new(2, [3, 3]), &[5, 5, 1], &mut rng).unwrap();
        let err = conv.forward(&ramp_input([6, 5, 1])).unwrap_err();
        assert!(matches!(err, Error::Shape(_)));
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let mut rng = SmallRng::seed_from_u64(42);
        let config = Conv2DConfig::new(3, [3, 2])
            .with_strides([2, 1])
            .with_padding(Padding::Same);
        let conv = Conv2D::new(config, &[5, 4, 2], &mut rng).unwrap();
        let input = ramp_input([5, 4, 2]);
        let output = conv.forward(&input).unwrap();
        // Loss = sum(output * upstream) so the upstream gradient is the weights themselves
        let upstream = ramp_input([3, 4, 3]);
        assert_eq!(output.shape(), upstream.shape());

        let mut grads = vec![
            ArrayD::zeros(IxDyn(&[3, 2, 2, 3])),
            ArrayD::zeros(IxDyn(&[3])),
        ];
        let input_grad = conv
            .backward(&input, &output, &upstream, &mut grads, true)
            .unwrap()
            .unwrap();

        let eps = 1e-2;
        let loss = |conv: &Conv2D, input: &ArrayD<f32>| {
            weighted_sum(&conv.forward(input).unwrap(), &upstream)
        };

        for index in [0, 5, 17, 35] {
            let mut plus = conv.clone();
            let mut minus = conv.clone();
            plus.kernel.as_slice_mut().unwrap()[index] += eps;
            minus.kernel.as_slice_mut().unwrap()[index] -= eps;
            let numeric = (loss(&plus, &input) - loss(&minus, &input)) / (2.0 * eps);
            let analytic = grads[0].as_slice().unwrap()[index];
            assert!((numeric - analytic).abs() < 1e-2, "kernel[{}]", index);
        }

        for index in 0..3 {
            let mut plus = conv.clone();
            let mut minus = conv.clone();
            plus.bias[index] += eps;
            minus.bias[index] -= eps;
            let numeric = (loss(&plus, &input) - loss(&minus, &input)) / (2.0 * eps);
            let analytic = grads[1].as_slice().unwrap()[index];
            assert!((numeric - analytic).abs() < 1e-2, "bias[{}]", index);
        }

        for index in [0, 9, 22, 39] {
            let mut plus = input.clone();
            let mut minus = input.clone();
            plus.as_slice_mut().unwrap()[index] += eps;
            minus.as_slice_mut().unwrap()[index] -= eps;
            let numeric = (loss(&conv, &plus) - loss(&conv, &minus)) / (2.0 * eps);
            let analytic = input_grad.as_slice().unwrap()[index];
            assert!((numeric - analytic).abs() < 1e-2, "input[{}]", index);
        }
    }

    #[test]
    fn test_no_input_gradient_when_not_needed() {
        let mut rng = SmallRng::seed_from_u64(1);
        let conv = Conv2D::new(Conv2DConfig::new(2, [2, 2]), &[3, 3, 1], &mut rng).unwrap();
        let input = ramp_input([3, 3, 1]);
        let output = conv.forward(&input).unwrap();
        let mut grads = vec![ArrayD::zeros(IxDyn(&[2, 2, 1, 2])), ArrayD::zeros(IxDyn(&[2]))];
        let result = conv
            .backward(&input, &output, &output, &mut grads, false)
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_backward_rejects_mismatched_input() {
        let mut rng = SmallRng::seed_from_u64(1);
        let conv = Conv2D::new(Conv2DConfig::new(2, [2, 2]), &[3, 3, 1], &mut rng).unwrap();
        let input = ramp_input([3, 3, 1]);
        let output = conv.forward(&input).unwrap();
        let mut grads = vec![ArrayD::zeros(IxDyn(&[2, 2, 1, 2])), ArrayD::zeros(IxDyn(&[2]))];
        let err = conv
            .backward(&ramp_input([4, 4, 1]), &output, &output, &mut grads, true)
            .unwrap_err();
        assert!(matches!(err, Error::Shape(_)));
    }
}
