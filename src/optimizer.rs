use ndarray::{ArrayD, Zip};

use crate::model::{Gradients, Sequential};
use crate::{Error, Result};

// Stochastic gradient descent with momentum.
//
//   velocity = momentum * velocity - learning_rate * grad
//   param   += velocity                                   (plain)
//   param   += momentum * velocity - learning_rate * grad (nesterov)
#[derive(Debug, Clone)]
pub struct Sgd {
    learning_rate: f32,
    momentum: f32,
    nesterov: bool,
    // One buffer per parameter per layer, created on the first step
    velocities: Vec<Vec<ArrayD<f32>>>,
}

impl Sgd {
    pub fn new(learning_rate: f32, momentum: f32) -> Result<Self> {
        if !(learning_rate.is_finite() && learning_rate > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "learning rate must be positive, got {}",
                learning_rate
            )));
        }
        if !(0.0..1.0).contains(&momentum) {
            return Err(Error::InvalidConfig(format!(
                "momentum must be in [0, 1), got {}",
                momentum
            )));
        }
        Ok(Self {
            learning_rate,
            momentum,
            nesterov: false,
            velocities: Vec::new(),
        })
    }

    pub fn with_nesterov(mut self, nesterov: bool) -> Self {
        self.nesterov = nesterov;
        self
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    // Apply one update to every parameter of `model`
    pub fn step(&mut self, model: &mut Sequential, grads: &Gradients) -> Result<()> {
        if self.velocities.is_empty() {
            self.velocities = model
                .layers()
                .iter()
                .map(|layer| {
                    layer
                        .params()
                        .iter()
                        .map(|(_, param)| ArrayD::zeros(param.raw_dim()))
                        .collect()
                })
                .collect();
        }

        let (lr, momentum, nesterov) = (self.learning_rate, self.momentum, self.nesterov);
        for (index, (layer, velocities)) in model
            .layers_mut()
            .iter_mut()
            .zip(self.velocities.iter_mut())
            .enumerate()
        {
            let layer_grads = grads.layer(index);
            let mut params = layer.params_mut();
            if params.len() != layer_grads.len() || params.len() != velocities.len() {
                return Err(Error::shape(format!(
                    "layer {} has {} parameters but {} gradients",
                    index,
                    params.len(),
                    layer_grads.len()
                )));
            }
            for ((param, velocity), grad) in params.iter_mut().zip(velocities.iter_mut()).zip(layer_grads) {
                if param.shape() != grad.shape() {
                    return Err(Error::shape(format!(
                        "gradient shape {:?} does not match parameter shape {:?}",
                        grad.shape(),
                        param.shape()
                    )));
                }
                Zip::from(param)
                    .and(velocity)
                    .and(grad)
                    .for_each(|w, v, &g| {
                        *v = momentum * *v - lr * g;
                        *w += if nesterov { momentum * *v - lr * g } else { *v };
                    });
            }
        }
        Ok(())
    }
}
