// Layer kinds the classifier is assembled from.
//
// Every layer works on one sample at a time: activations are row-major `ArrayD<f32>` without a
// batch axis, laid out (height, width, channels) for spatial layers.

mod activation;
pub use activation::Activation;

mod conv2d;
pub use conv2d::{Conv2D, Conv2DConfig};

mod max_pooling2d;
pub use max_pooling2d::{MaxPooling2D, MaxPooling2DConfig};

mod flatten;
pub use flatten::{Flatten, FlattenConfig};

mod dense;
pub use dense::{Dense, DenseConfig};

use ndarray::{Array, ArrayD, ArrayViewD, ArrayViewMutD, Dimension, ShapeBuilder};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

// How a sliding window treats the border of its input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Padding {
    // Only windows that fit entirely inside the input
    #[default]
    Valid,
    // Zero-pad so that output length = ceil(input / stride)
    Same,
}

impl Padding {
    pub fn output_len(self, input: usize, window: usize, stride: usize) -> Option<usize> {
        if window == 0 || stride == 0 {
            return None;
        }
        match self {
            Padding::Valid => (input >= window).then(|| (input - window) / stride + 1),
            Padding::Same => (input > 0).then(|| (input + stride - 1) / stride),
        }
    }

    // Number of implicit padding cells before the first input cell
    pub fn leading(self, input: usize, window: usize, stride: usize) -> usize {
        match self {
            Padding::Valid => 0,
            Padding::Same => {
                let output = (input + stride - 1) / stride;
                ((output - 1) * stride + window).saturating_sub(input) / 2
            }
        }
    }
}

// Position in the input that window cell `offset` of output cell `index` reads from, if any
#[inline]
pub(crate) fn source_index(
    index: usize,
    offset: usize,
    stride: usize,
    leading: usize,
    input_len: usize,
) -> Option<usize> {
    (index * stride + offset)
        .checked_sub(leading)
        .filter(|&position| position < input_len)
}

// Kernel initialization scheme. Biases always start at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Initializer {
    #[default]
    GlorotUniform,
    HeUniform,
    Zeros,
}

impl Initializer {
    pub fn init<Sh, D>(self, shape: Sh, fan_in: usize, fan_out: usize, rng: &mut impl Rng) -> Array<f32, D>
    where
        Sh: ShapeBuilder<Dim = D>,
        D: Dimension,
    {
        let limit = match self {
            Initializer::GlorotUniform => (6.0 / (fan_in + fan_out) as f32).sqrt(),
            Initializer::HeUniform => (6.0 / fan_in as f32).sqrt(),
            Initializer::Zeros => 0.0,
        };
        if limit.is_finite() && limit > 0.0 {
            Array::from_shape_simple_fn(shape, || rng.gen_range(-limit..limit))
        } else {
            Array::zeros(shape)
        }
    }
}

// Serializable description of one layer, tagged the way the topology file stores it:
// {"class_name": "Dense", "config": {...}}
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class_name", content = "config")]
pub enum LayerConfig {
    Conv2D(Conv2DConfig),
    MaxPooling2D(MaxPooling2DConfig),
    Flatten(FlattenConfig),
    Dense(DenseConfig),
}

impl LayerConfig {
    pub fn name(&self) -> &str {
        match self {
            LayerConfig::Conv2D(config) => &config.name,
            LayerConfig::MaxPooling2D(config) => &config.name,
            LayerConfig::Flatten(config) => &config.name,
            LayerConfig::Dense(config) => &config.name,
        }
    }

    pub fn set_name(&mut self, name: String) {
        match self {
            LayerConfig::Conv2D(config) => config.name = name,
            LayerConfig::MaxPooling2D(config) => config.name = name,
            LayerConfig::Flatten(config) => config.name = name,
            LayerConfig::Dense(config) => config.name = name,
        }
    }

    // Prefix for generated names: conv2d, conv2d_1, ...
    pub fn default_prefix(&self) -> &'static str {
        match self {
            LayerConfig::Conv2D(_) => "conv2d",
            LayerConfig::MaxPooling2D(_) => "max_pooling2d",
            LayerConfig::Flatten(_) => "flatten",
            LayerConfig::Dense(_) => "dense",
        }
    }

    pub fn class_name(&self) -> &'static str {
        match self {
            LayerConfig::Conv2D(_) => "Conv2D",
            LayerConfig::MaxPooling2D(_) => "MaxPooling2D",
            LayerConfig::Flatten(_) => "Flatten",
            LayerConfig::Dense(_) => "Dense",
        }
    }

    // Declared input shape including the (unknown) batch axis, if this layer declares one
    pub fn batch_input_shape(&self) -> Option<&[Option<usize>]> {
        match self {
            LayerConfig::Conv2D(config) => config.batch_input_shape.as_deref(),
            LayerConfig::Dense(config) => config.batch_input_shape.as_deref(),
            LayerConfig::MaxPooling2D(_) | LayerConfig::Flatten(_) => None,
        }
    }
}

impl From<Conv2DConfig> for LayerConfig {
    fn from(config: Conv2DConfig) -> Self {
        LayerConfig::Conv2D(config)
    }
}

impl From<MaxPooling2DConfig> for LayerConfig {
    fn from(config: MaxPooling2DConfig) -> Self {
        LayerConfig::MaxPooling2D(config)
    }
}

impl From<FlattenConfig> for LayerConfig {
    fn from(config: FlattenConfig) -> Self {
        LayerConfig::Flatten(config)
    }
}

impl From<DenseConfig> for LayerConfig {
    fn from(config: DenseConfig) -> Self {
        LayerConfig::Dense(config)
    }
}

// A built layer: configuration plus resolved shapes and parameters
#[derive(Debug, Clone)]
pub enum Layer {
    Conv2D(Conv2D),
    MaxPooling2D(MaxPooling2D),
    Flatten(Flatten),
    Dense(Dense),
}

impl Layer {
    // Build against the per-sample output shape of the previous layer
    pub fn build(config: &LayerConfig, input_shape: &[usize], rng: &mut impl Rng) -> Result<Self> {
        Ok(match config {
            LayerConfig::Conv2D(config) => Layer::Conv2D(Conv2D::new(config.clone(), input_shape, rng)?),
            LayerConfig::MaxPooling2D(config) => {
                Layer::MaxPooling2D(MaxPooling2D::new(config.clone(), input_shape)?)
            }
            LayerConfig::Flatten(config) => Layer::Flatten(Flatten::new(config.clone(), input_shape)?),
            LayerConfig::Dense(config) => Layer::Dense(Dense::new(config.clone(), input_shape, rng)?),
        })
    }

    pub fn config(&self) -> LayerConfig {
        match self {
            Layer::Conv2D(layer) => layer.config().clone().into(),
            Layer::MaxPooling2D(layer) => layer.config().clone().into(),
            Layer::Flatten(layer) => layer.config().clone().into(),
            Layer::Dense(layer) => layer.config().clone().into(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Layer::Conv2D(layer) => &layer.config().name,
            Layer::MaxPooling2D(layer) => &layer.config().name,
            Layer::Flatten(layer) => &layer.config().name,
            Layer::Dense(layer) => &layer.config().name,
        }
    }

    pub fn output_shape(&self) -> &[usize] {
        match self {
            Layer::Conv2D(layer) => layer.output_shape(),
            Layer::MaxPooling2D(layer) => layer.output_shape(),
            Layer::Flatten(layer) => layer.output_shape(),
            Layer::Dense(layer) => layer.output_shape(),
        }
    }

    pub fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        match self {
            Layer::Conv2D(layer) => layer.forward(input),
            Layer::MaxPooling2D(layer) => layer.forward(input),
            Layer::Flatten(layer) => layer.forward(input),
            Layer::Dense(layer) => layer.forward(input),
        }
    }

    // Accumulate parameter gradients into `grads` (one tensor per parameter, same order as `params`)
    // and return the gradient w.r.t. the input when `need_input_grad` is set.
    pub fn backward(
        &self,
        input: &ArrayD<f32>,
        output: &ArrayD<f32>,
        grad_output: &ArrayD<f32>,
        grads: &mut [ArrayD<f32>],
        need_input_grad: bool,
    ) -> Result<Option<ArrayD<f32>>> {
        match self {
            Layer::Conv2D(layer) => layer.backward(input, output, grad_output, grads, need_input_grad),
            Layer::MaxPooling2D(layer) => layer.backward(input, output, grad_output, need_input_grad),
            Layer::Flatten(layer) => layer.backward(grad_output, need_input_grad),
            Layer::Dense(layer) => layer.backward(input, output, grad_output, grads, need_input_grad),
        }
    }

    pub fn params(&self) -> Vec<(&'static str, ArrayViewD<'_, f32>)> {
        match self {
            Layer::Conv2D(layer) => layer.params(),
            Layer::Dense(layer) => layer.params(),
            Layer::MaxPooling2D(_) | Layer::Flatten(_) => Vec::new(),
        }
    }

    pub fn params_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        match self {
            Layer::Conv2D(layer) => layer.params_mut(),
            Layer::Dense(layer) => layer.params_mut(),
            Layer::MaxPooling2D(_) | Layer::Flatten(_) => Vec::new(),
        }
    }

    pub fn param_count(&self) -> usize {
        self.params().iter().map(|(_, p)| p.len()).sum()
    }
}

// Borrow an activation as a flat slice; everything the layers produce is row-major
pub(crate) fn contiguous<'a>(values: &'a ArrayD<f32>, what: &str) -> Result<&'a [f32]> {
    values
        .as_slice()
        .ok_or_else(|| Error::shape(format!("{} is not contiguous", what)))
}

pub(crate) fn contiguous_mut<'a>(values: &'a mut ArrayD<f32>, what: &str) -> Result<&'a mut [f32]> {
    values
        .as_slice_mut()
        .ok_or_else(|| Error::shape(format!("{} is not contiguous", what)))
}

pub(crate) fn check_shape(layer: &str, expected: &[usize], actual: &[usize]) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(Error::shape(format!(
            "layer {} expected shape {:?}, got {:?}",
            layer, expected, actual
        )))
    }
}
