use std::collections::HashSet;
use std::fmt::Write;

use ndarray::{Array2, ArrayD, ArrayView4, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::backend;
use crate::layers::{
    contiguous, Activation, Conv2DConfig, DenseConfig, FlattenConfig, Layer, LayerConfig,
    MaxPooling2DConfig,
};
use crate::{Error, Result, IMAGE_SIDE, N_CLASSES};

pub const SEQUENTIAL: &str = "Sequential";

// What gets written to the topology file: {"class_name": "Sequential", "config": {...}}
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub class_name: String,
    pub config: SequentialConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequentialConfig {
    pub name: String,
    pub layers: Vec<LayerConfig>,
}

// The digit classifier: 32 3x3 convolutions, 2x2 max pooling, flatten,
// 100 hidden units and a 10-way softmax
pub fn mnist_cnn() -> Vec<LayerConfig> {
    vec![
        Conv2DConfig::new(32, [3, 3])
            .with_strides([1, 1])
            .with_activation(Activation::Relu)
            .with_input_shape([IMAGE_SIDE, IMAGE_SIDE, 1])
            .into(),
        MaxPooling2DConfig::new([2, 2]).into(),
        FlattenConfig::default().into(),
        DenseConfig::new(100).with_activation(Activation::Relu).into(),
        DenseConfig::new(N_CLASSES)
            .with_activation(Activation::Softmax)
            .into(),
    ]
}

// An ordered stack of layers, each built against the output shape of the one before it
#[derive(Debug, Clone)]
pub struct Sequential {
    name: String,
    input_shape: Vec<usize>,
    layers: Vec<Layer>,
}

impl Sequential {
    pub fn build(
        name: impl Into<String>,
        mut configs: Vec<LayerConfig>,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        let first = configs
            .first()
            .ok_or_else(|| Error::structure("a model needs at least one layer"))?;
        let input_shape = declared_input_shape(first)?;
        assign_names(&mut configs)?;

        let mut shape = input_shape.clone();
        let mut layers = Vec::with_capacity(configs.len());
        for config in &configs {
            let layer = Layer::build(config, &shape, rng)?;
            shape = layer.output_shape().to_vec();
            layers.push(layer);
        }

        Ok(Self {
            name: name.into(),
            input_shape,
            layers,
        })
    }

    // Rebuild from a stored topology. Parameters are freshly initialized.
    pub fn from_topology(topology: &Topology, rng: &mut impl Rng) -> Result<Self> {
        if topology.class_name != SEQUENTIAL {
            return Err(Error::structure(format!(
                "unsupported model class {}",
                topology.class_name
            )));
        }
        Self::build(
            topology.config.name.clone(),
            topology.config.layers.clone(),
            rng,
        )
    }

    pub fn topology(&self) -> Topology {
        Topology {
            class_name: SEQUENTIAL.to_string(),
            config: SequentialConfig {
                name: self.name.clone(),
                layers: self.layers.iter().map(Layer::config).collect(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [Layer] {
        &mut self.layers
    }

    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    pub fn output_shape(&self) -> &[usize] {
        self.layers
            .last()
            .map_or(&self.input_shape[..], |layer| layer.output_shape())
    }

    pub fn param_count(&self) -> usize {
        self.layers.iter().map(Layer::param_count).sum()
    }

    // Inference on one sample
    pub fn forward(&self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        self.layers
            .iter()
            .try_fold(input, |activation, layer| layer.forward(&activation))
    }

    // Forward pass that keeps every intermediate activation for backpropagation.
    // trace[0] is the input and trace[i + 1] is the output of layer i.
    pub fn forward_trace(&self, input: ArrayD<f32>) -> Result<Vec<ArrayD<f32>>> {
        let mut trace = Vec::with_capacity(self.layers.len() + 1);
        trace.push(input);
        for layer in &self.layers {
            let output = layer.forward(&trace[trace.len() - 1])?;
            trace.push(output);
        }
        Ok(trace)
    }

    // Backpropagate the gradient of the loss w.r.t. the model output through a recorded trace,
    // adding the parameter gradients into `grads`
    pub fn backward(
        &self,
        trace: &[ArrayD<f32>],
        grad_output: ArrayD<f32>,
        grads: &mut Gradients,
    ) -> Result<()> {
        self.check_trace(trace)?;
        self.backward_through(trace, self.layers.len(), grad_output, grads)
    }

    // Whether the output layer is a Dense layer with a softmax activation
    pub fn ends_in_softmax(&self) -> bool {
        matches!(self.layers.last(), Some(Layer::Dense(dense)) if dense.activation() == Activation::Softmax)
    }

    // Backpropagate starting from the gradient w.r.t. the output layer's pre-activation values
    // (the logits), skipping its activation. The output layer must be Dense.
    pub fn backward_from_logits(
        &self,
        trace: &[ArrayD<f32>],
        delta: &[f32],
        grads: &mut Gradients,
    ) -> Result<()> {
        self.check_trace(trace)?;
        let last = self.layers.len() - 1;
        let Some(Layer::Dense(dense)) = self.layers.last() else {
            return Err(Error::structure("backpropagating from logits needs a Dense output layer"));
        };
        match dense.backward_delta(&trace[last], delta, grads.layer_mut(last), last > 0)? {
            Some(grad) => self.backward_through(trace, last, grad, grads),
            None => Ok(()),
        }
    }

    fn check_trace(&self, trace: &[ArrayD<f32>]) -> Result<()> {
        if self.layers.is_empty() || trace.len() != self.layers.len() + 1 {
            return Err(Error::shape(format!(
                "trace has {} activations for {} layers",
                trace.len(),
                self.layers.len()
            )));
        }
        Ok(())
    }

    // Backpropagate `grad`, the gradient w.r.t. the output of layer `end - 1`, down to the input
    fn backward_through(
        &self,
        trace: &[ArrayD<f32>],
        end: usize,
        grad: ArrayD<f32>,
        grads: &mut Gradients,
    ) -> Result<()> {
        let mut grad = grad;
        for (i, layer) in self.layers[..end].iter().enumerate().rev() {
            // The input images need no gradient
            let need_input_grad = i > 0;
            match layer.backward(&trace[i], &trace[i + 1], &grad, grads.layer_mut(i), need_input_grad)? {
                Some(input_grad) => grad = input_grad,
                None => break,
            }
        }
        Ok(())
    }

    // Class probabilities for a batch of (N, height, width, channels) images
    pub fn predict(&self, images: ArrayView4<f32>) -> Result<Array2<f32>> {
        let n = images.len_of(Axis(0));
        let out_len: usize = self.output_shape().iter().product();
        let rows = backend::map_samples(n, |i| self.forward(sample(&images, i)));

        let mut values = Vec::with_capacity(n * out_len);
        for row in rows {
            let row = row?;
            values.extend_from_slice(contiguous(&row, "model output")?);
        }
        Ok(Array2::from_shape_vec((n, out_len), values)?)
    }

    // Table of layers, output shapes and parameter counts
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Model: \"{}\"", self.name);
        let _ = writeln!(out, "{:<30}{:<25}{:>10}", "Layer (type)", "Output Shape", "Param #");
        for layer in &self.layers {
            let shape = layer
                .output_shape()
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            let _ = writeln!(
                out,
                "{:<30}{:<25}{:>10}",
                format!("{} ({})", layer.name(), layer.config().class_name()),
                format!("(None, {})", shape),
                layer.param_count()
            );
        }
        let _ = write!(out, "Total params: {}", self.param_count());
        out
    }
}

// One sample from a batch, copied out in row-major order
pub(crate) fn sample(images: &ArrayView4<f32>, index: usize) -> ArrayD<f32> {
    images
        .index_axis(Axis(0), index)
        .as_standard_layout()
        .into_owned()
        .into_dyn()
}

fn declared_input_shape(first: &LayerConfig) -> Result<Vec<usize>> {
    let declared = first.batch_input_shape().ok_or_else(|| {
        Error::structure(format!(
            "the first layer ({}) must declare its input shape",
            first.class_name()
        ))
    })?;
    // The leading entry is the open batch axis
    let shape: Option<Vec<usize>> = declared.iter().skip(1).copied().collect();
    match shape {
        Some(shape) if !shape.is_empty() && shape.iter().all(|&d| d > 0) => Ok(shape),
        _ => Err(Error::structure(format!(
            "invalid input shape {:?}",
            declared
        ))),
    }
}

// Give unnamed layers conv2d, conv2d_1, dense, dense_1, ... and reject duplicates,
// since parameters are stored under layer names
fn assign_names(configs: &mut [LayerConfig]) -> Result<()> {
    let mut used: HashSet<String> = configs
        .iter()
        .map(|config| config.name().to_string())
        .filter(|name| !name.is_empty())
        .collect();
    let explicit = configs.iter().filter(|c| !c.name().is_empty()).count();
    if used.len() != explicit {
        return Err(Error::structure("layer names must be unique"));
    }

    for config in configs.iter_mut().filter(|c| c.name().is_empty()) {
        let prefix = config.default_prefix();
        let name = (0..)
            .map(|k| {
                if k == 0 {
                    prefix.to_string()
                } else {
                    format!("{}_{}", prefix, k)
                }
            })
            .find(|candidate| !used.contains(candidate))
            .unwrap_or_else(|| prefix.to_string());
        used.insert(name.clone());
        config.set_name(name);
    }
    Ok(())
}

// Parameter gradients, one tensor per parameter per layer, shaped like the parameters
#[derive(Debug, Clone)]
pub struct Gradients {
    layers: Vec<Vec<ArrayD<f32>>>,
}

impl Gradients {
    pub fn zeros_like(model: &Sequential) -> Self {
        let layers = model
            .layers
            .iter()
            .map(|layer| {
                layer
                    .params()
                    .iter()
                    .map(|(_, param)| ArrayD::zeros(param.raw_dim()))
                    .collect()
            })
            .collect();
        Self { layers }
    }

    pub fn layer(&self, index: usize) -> &[ArrayD<f32>] {
        &self.layers[index]
    }

    pub fn layer_mut(&mut self, index: usize) -> &mut [ArrayD<f32>] {
        &mut self.layers[index]
    }

    // Sum of two partial accumulations
    pub fn merge(mut self, other: Self) -> Self {
        for (mine, theirs) in self.layers.iter_mut().zip(other.layers) {
            for (a, b) in mine.iter_mut().zip(theirs) {
                *a += &b;
            }
        }
        self
    }

    pub fn scale(&mut self, factor: f32) {
        self.layers
            .iter_mut()
            .flatten()
            .for_each(|grad| grad.mapv_inplace(|g| g * factor));
    }
}
