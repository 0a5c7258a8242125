use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use super::{check_shape, contiguous};
use crate::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlattenConfig {
    #[serde(default)]
    pub name: String,
}

impl FlattenConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

// Collapse (height, width, channels) into one row-major vector
#[derive(Debug, Clone)]
pub struct Flatten {
    config: FlattenConfig,
    input_shape: Vec<usize>,
    output_shape: [usize; 1],
}

impl Flatten {
    pub fn new(config: FlattenConfig, input_shape: &[usize]) -> Result<Self> {
        let len: usize = input_shape.iter().product();
        if input_shape.is_empty() || len == 0 {
            return Err(Error::structure(format!(
                "{} cannot flatten shape {:?}",
                config.name, input_shape
            )));
        }
        Ok(Self {
            config,
            input_shape: input_shape.to_vec(),
            output_shape: [len],
        })
    }

    pub fn config(&self) -> &FlattenConfig {
        &self.config
    }

    pub fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    pub fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        check_shape(&self.config.name, &self.input_shape, input.shape())?;
        let values = contiguous(input, "flatten input")?.to_vec();
        Ok(ArrayD::from_shape_vec(IxDyn(&self.output_shape), values)?)
    }

    pub fn backward(&self, grad_output: &ArrayD<f32>, need_input_grad: bool) -> Result<Option<ArrayD<f32>>> {
        if !need_input_grad {
            return Ok(None);
        }
        check_shape(&self.config.name, &self.output_shape, grad_output.shape())?;
        let values = contiguous(grad_output, "flatten gradient")?.to_vec();
        Ok(Some(ArrayD::from_shape_vec(IxDyn(&self.input_shape), values)?))
    }
}
