use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use super::{check_shape, contiguous, source_index, Padding};
use crate::{Error, Result};

fn square_pool() -> [usize; 2] {
    [2, 2]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaxPooling2DConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default = "square_pool")]
    pub pool_size: [usize; 2],
    // Defaults to the pool size
    #[serde(default)]
    pub strides: Option<[usize; 2]>,
    #[serde(default)]
    pub padding: Padding,
}

impl MaxPooling2DConfig {
    pub fn new(pool_size: [usize; 2]) -> Self {
        Self {
            name: String::new(),
            pool_size,
            strides: None,
            padding: Padding::Valid,
        }
    }

    pub fn with_strides(mut self, strides: [usize; 2]) -> Self {
        self.strides = Some(strides);
        self
    }

    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    pub fn effective_strides(&self) -> [usize; 2] {
        self.strides.unwrap_or(self.pool_size)
    }
}

// Per-channel maximum over a sliding window. No parameters.
#[derive(Debug, Clone)]
pub struct MaxPooling2D {
    config: MaxPooling2DConfig,
    input_shape: [usize; 3],
    output_shape: [usize; 3],
    leading: [usize; 2],
}

impl MaxPooling2D {
    pub fn new(config: MaxPooling2DConfig, input_shape: &[usize]) -> Result<Self> {
        let &[height, width, channels] = input_shape else {
            return Err(Error::structure(format!(
                "{} expects (height, width, channels) input, got {:?}",
                config.name, input_shape
            )));
        };
        let [pool_h, pool_w] = config.pool_size;
        let [stride_h, stride_w] = config.effective_strides();
        let out_h = config.padding.output_len(height, pool_h, stride_h);
        let out_w = config.padding.output_len(width, pool_w, stride_w);
        let (Some(out_h), Some(out_w)) = (out_h, out_w) else {
            return Err(Error::structure(format!(
                "{}: pool {:?} does not fit input {:?}",
                config.name, config.pool_size, input_shape
            )));
        };
        let leading = [
            config.padding.leading(height, pool_h, stride_h),
            config.padding.leading(width, pool_w, stride_w),
        ];
        Ok(Self {
            config,
            input_shape: [height, width, channels],
            output_shape: [out_h, out_w, channels],
            leading,
        })
    }

    pub fn config(&self) -> &MaxPooling2DConfig {
        &self.config
    }

    pub fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    pub fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        check_shape(&self.config.name, &self.input_shape, input.shape())?;
        let x = contiguous(input, "pooling input")?;
        let [out_h, out_w, channels] = self.output_shape;

        let mut output = vec![0.0_f32; out_h * out_w * channels];
        for (cell, out) in output.chunks_exact_mut(channels).enumerate() {
            for (c, out) in out.iter_mut().enumerate() {
                *out = self
                    .argmax(x, cell / out_w, cell % out_w, c)
                    .map_or(0.0, |offset| x[offset]);
            }
        }
        Ok(ArrayD::from_shape_vec(IxDyn(&self.output_shape), output)?)
    }

    // The window maximum is recomputed from the input, so the forward output is not needed.
    // Ties route the gradient to the first maximal cell in the window.
    pub fn backward(
        &self,
        input: &ArrayD<f32>,
        _output: &ArrayD<f32>,
        grad_output: &ArrayD<f32>,
        need_input_grad: bool,
    ) -> Result<Option<ArrayD<f32>>> {
        if !need_input_grad {
            return Ok(None);
        }
        check_shape(&self.config.name, &self.input_shape, input.shape())?;
        check_shape(&self.config.name, &self.output_shape, grad_output.shape())?;
        let x = contiguous(input, "pooling input")?;
        let grad = contiguous(grad_output, "pooling gradient")?;
        let [_, out_w, channels] = self.output_shape;

        let mut input_grad = vec![0.0_f32; x.len()];
        for (cell, g) in grad.chunks_exact(channels).enumerate() {
            for (c, &g) in g.iter().enumerate() {
                if let Some(offset) = self.argmax(x, cell / out_w, cell % out_w, c) {
                    input_grad[offset] += g;
                }
            }
        }
        Ok(Some(ArrayD::from_shape_vec(IxDyn(&self.input_shape), input_grad)?))
    }

    // Offset of the largest input value in the window of output cell (oy, ox), channel c
    fn argmax(&self, x: &[f32], oy: usize, ox: usize, c: usize) -> Option<usize> {
        let [height, width, channels] = self.input_shape;
        let [pool_h, pool_w] = self.config.pool_size;
        let [stride_h, stride_w] = self.config.effective_strides();
        let [lead_h, lead_w] = self.leading;

        let mut best: Option<usize> = None;
        for ky in 0..pool_h {
            let Some(iy) = source_index(oy, ky, stride_h, lead_h, height) else {
                continue;
            };
            for kx in 0..pool_w {
                let Some(ix) = source_index(ox, kx, stride_w, lead_w, width) else {
                    continue;
                };
                let offset = (iy * width + ix) * channels + c;
                if best.map_or(true, |b| x[offset] > x[b]) {
                    best = Some(offset);
                }
            }
        }
        best
    }
}
