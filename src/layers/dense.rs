use ndarray::{Array1, Array2, ArrayD, ArrayViewD, ArrayViewMutD, IxDyn};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{check_shape, contiguous, contiguous_mut, Activation, Initializer};
use crate::simd::{axpy, dot};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseConfig {
    #[serde(default)]
    pub name: String,
    pub units: usize,
    #[serde(default)]
    pub activation: Activation,
    #[serde(default)]
    pub kernel_initializer: Initializer,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_input_shape: Option<Vec<Option<usize>>>,
}

impl DenseConfig {
    pub fn new(units: usize) -> Self {
        Self {
            name: String::new(),
            units,
            activation: Activation::Linear,
            kernel_initializer: Initializer::GlorotUniform,
            batch_input_shape: None,
        }
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_kernel_initializer(mut self, initializer: Initializer) -> Self {
        self.kernel_initializer = initializer;
        self
    }

    pub fn with_input_len(mut self, len: usize) -> Self {
        self.batch_input_shape = Some(vec![None, Some(len)]);
        self
    }
}

// Fully connected layer: y = activation(x . kernel + bias), kernel is (inputs, units)
#[derive(Debug, Clone)]
pub struct Dense {
    config: DenseConfig,
    input_len: usize,
    output_shape: [usize; 1],
    kernel: Array2<f32>,
    bias: Array1<f32>,
}

impl Dense {
    pub fn new(config: DenseConfig, input_shape: &[usize], rng: &mut impl Rng) -> Result<Self> {
        let &[input_len] = input_shape else {
            return Err(Error::structure(format!(
                "{} expects a flat input, got {:?} (add a Flatten layer first)",
                config.name, input_shape
            )));
        };
        if input_len == 0 || config.units == 0 {
            return Err(Error::structure(format!(
                "{} needs non-empty input and at least one unit",
                config.name
            )));
        }
        let kernel = config
            .kernel_initializer
            .init((input_len, config.units), input_len, config.units, rng);
        Ok(Self {
            output_shape: [config.units],
            bias: Array1::zeros(config.units),
            input_len,
            kernel,
            config,
        })
    }

    pub fn config(&self) -> &DenseConfig {
        &self.config
    }

    pub fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    pub fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        check_shape(&self.config.name, &[self.input_len], input.shape())?;
        let x = contiguous(input, "dense input")?;
        let kernel = self.kernel_slice()?;
        let units = self.config.units;

        let mut output = self.bias.to_vec();
        for (&value, row) in x.iter().zip(kernel.chunks_exact(units)) {
            // Mostly zeros after a ReLU
            if value != 0.0 {
                axpy(value, row, &mut output);
            }
        }
        self.config.activation.apply(&mut output, units);
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
        check_shape(&self.config.name, &self.output_shape, grad_output.shape())?;
        check_shape(&self.config.name, &self.output_shape, output.shape())?;
        let y = contiguous(output, "dense output")?;

        let mut delta = contiguous(grad_output, "dense gradient")?.to_vec();
        self.config.activation.backward(y, &mut delta, self.config.units);
        self.backward_delta(input, &delta, grads, need_input_grad)
    }

    // Like `backward`, but `delta` is already the gradient w.r.t. the pre-activation values
    pub fn backward_delta(
        &self,
        input: &ArrayD<f32>,
        delta: &[f32],
        grads: &mut [ArrayD<f32>],
        need_input_grad: bool,
    ) -> Result<Option<ArrayD<f32>>> {
        check_shape(&self.config.name, &[self.input_len], input.shape())?;
        check_shape(&self.config.name, &self.output_shape, &[delta.len()])?;
        let x = contiguous(input, "dense input")?;
        let kernel = self.kernel_slice()?;
        let units = self.config.units;

        let count = grads.len();
        let [kernel_grad, bias_grad] = grads else {
            return Err(Error::shape(format!(
                "{} expects 2 gradient tensors, got {}",
                self.config.name, count
            )));
        };
        axpy(1.0, delta, contiguous_mut(bias_grad, "bias gradient")?);
        let kernel_grad = contiguous_mut(kernel_grad, "kernel gradient")?;
        for (&value, row) in x.iter().zip(kernel_grad.chunks_exact_mut(units)) {
            if value != 0.0 {
                axpy(value, delta, row);
            }
        }

        if !need_input_grad {
            return Ok(None);
        }
        let input_grad: Vec<f32> = kernel
            .chunks_exact(units)
            .map(|row| dot(row, delta))
            .collect();
        Ok(Some(ArrayD::from_shape_vec(IxDyn(&[self.input_len]), input_grad)?))
    }

    pub fn activation(&self) -> Activation {
        self.config.activation
    }

    fn kernel_slice(&self) -> Result<&[f32]> {
        self.kernel
            .as_slice()
            .ok_or_else(|| Error::shape("dense kernel is not contiguous"))
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
    use rand::{rngs::SmallRng, SeedableRng};

    fn flat(values: &[f32]) -> ArrayD<f32> {
        ArrayD::from_shape_vec(IxDyn(&[values.len()]), values.to_vec()).unwrap()
    }

    #[test]
    fn test_spatial_input_is_structural_error() {
        let mut rng = SmallRng::seed_from_u64(0);
        let err = Dense::new(DenseConfig::new(10), &[13, 13, 32], &mut rng).unwrap_err();
        assert!(matches!(err, Error::Structure(_)));
    }

    #[test]
    fn test_forward_affine() {
        let mut rng = SmallRng::seed_from_u64(0);
        let mut dense = Dense::new(DenseConfig::new(2), &[3], &mut rng).unwrap();
        dense.kernel = Array2::from_shape_vec((3, 2), vec![1.0, 0.0, 0.0, 1.0, 1.0, -1.0]).unwrap();
        dense.bias = Array1::from(vec![0.5, -0.5]);
        let output = dense.forward(&flat(&[1.0, 2.0, 3.0])).unwrap();
        assert_eq!(output.as_slice().unwrap(), &[4.5, -1.5]);
    }

    #[test]
    fn test_softmax_output_is_distribution() {
        let mut rng = SmallRng::seed_from_u64(9);
        let dense = Dense::new(
            DenseConfig::new(10).with_activation(Activation::Softmax),
            &[20],
            &mut rng,
        )
        .unwrap();
        let input = flat(&(0..20).map(|i| i as f32 / 10.0).collect::<Vec<_>>());
        let output = dense.forward(&input).unwrap();
        assert!((output.sum() - 1.0).abs() < 1e-5);
        assert!(output.iter().all(|&p| p > 0.0));
    }

    #[test]
    fn test_gradients_are_outer_products() {
        let mut rng = SmallRng::seed_from_u64(5);
        let dense = Dense::new(DenseConfig::new(3), &[4], &mut rng).unwrap();
        let x = flat(&[0.5, 0.0, -1.0, 2.0]);
        let y = dense.forward(&x).unwrap();
        let upstream = flat(&[1.0, -2.0, 0.5]);

        let mut grads = vec![ArrayD::zeros(IxDyn(&[4, 3])), ArrayD::zeros(IxDyn(&[3]))];
        let input_grad = dense
            .backward(&x, &y, &upstream, &mut grads, true)
            .unwrap()
            .unwrap();

        let x = x.as_slice().unwrap();
        let upstream_values = upstream.as_slice().unwrap();
        let kernel_grad = grads[0].as_slice().unwrap();
        let input_grad = input_grad.as_slice().unwrap();
        for i in 0..4 {
            for j in 0..3 {
                let expected = x[i] * upstream_values[j];
                assert!((kernel_grad[i * 3 + j] - expected).abs() < 1e-6);
            }
            let expected: f32 = (0..3)
                .map(|j| dense.kernel[[i, j]] * upstream_values[j])
                .sum();
            assert!((input_grad[i] - expected).abs() < 1e-5);
        }
        assert_eq!(grads[1], upstream);
    }

    #[test]
    fn test_relu_blocks_gradient_of_dead_units() {
        let mut rng = SmallRng::seed_from_u64(5);
        let mut dense = Dense::new(
            DenseConfig::new(2).with_activation(Activation::Relu),
            &[1],
            &mut rng,
        )
        .unwrap();
        dense.kernel = Array2::from_shape_vec((1, 2), vec![1.0, -1.0]).unwrap();
        let x = flat(&[1.0]);
        let y = dense.forward(&x).unwrap();
        let mut grads = vec![ArrayD::zeros(IxDyn(&[1, 2])), ArrayD::zeros(IxDyn(&[2]))];
        dense
            .backward(&x, &y, &flat(&[1.0, 1.0]), &mut grads, false)
            .unwrap();
        assert_eq!(grads[1].as_slice().unwrap(), &[1.0, 0.0]);
    }

    #[test]
    fn test_backward_rejects_mismatched_input() {
        let mut rng = SmallRng::seed_from_u64(5);
        let dense = Dense::new(DenseConfig::new(3), &[4], &mut rng).unwrap();
        let x = flat(&[0.5, 0.0, -1.0, 2.0]);
        let y = dense.forward(&x).unwrap();
        let mut grads = vec![ArrayD::zeros(IxDyn(&[4, 3])), ArrayD::zeros(IxDyn(&[3]))];
        let err = dense
            .backward(&flat(&[1.0, 2.0]), &y, &flat(&[1.0, 1.0, 1.0]), &mut grads, true)
            .unwrap_err();
        assert!(matches!(err, Error::Shape(_)));
        let err = dense
            .backward(&x, &flat(&[1.0]), &flat(&[1.0, 1.0, 1.0]), &mut grads, true)
            .unwrap_err();
        assert!(matches!(err, Error::Shape(_)));
    }

    #[test]
    fn test_backward_delta_skips_activation() {
        let mut rng = SmallRng::seed_from_u64(5);
        let dense = Dense::new(
            DenseConfig::new(2).with_activation(Activation::Softmax),
            &[2],
            &mut rng,
        )
        .unwrap();
        let x = flat(&[1.0, -2.0]);
        let mut grads = vec![ArrayD::zeros(IxDyn(&[2, 2])), ArrayD::zeros(IxDyn(&[2]))];
        dense.backward_delta(&x, &[0.25, -0.25], &mut grads, false).unwrap();
        assert_eq!(grads[1].as_slice().unwrap(), &[0.25, -0.25]);
        assert_eq!(grads[0].as_slice().unwrap(), &[0.25, -0.25, -0.5, 0.5]);
        assert!(dense.backward_delta(&x, &[1.0], &mut grads, false).is_err());
    }
}
