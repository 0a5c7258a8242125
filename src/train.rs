// Fitting and evaluating a model on a preprocessed split.
//
// Samples inside a batch are independent, so each worker of the backend accumulates gradients
// for its share of the batch and the partial sums are added together. The model is only
// modified by the optimizer, between batches.

use std::path::Path;
use std::time::Instant;

use log::{debug, info};
use ndarray::{ArrayD, ArrayView2, ArrayView4, Axis, IxDyn};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;

use crate::backend;
use crate::layers::contiguous;
use crate::loss::{
    categorical_crossentropy, categorical_crossentropy_grad, is_correct, softmax_crossentropy_delta,
    METRICS_NAMES,
};
use crate::model::{sample, Gradients, Sequential};
use crate::optimizer::Sgd;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FitOptions {
    pub epochs: usize,
    pub batch_size: usize,
    // Reshuffle the sample order at the start of every epoch
    pub shuffle: bool,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 32,
            shuffle: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub loss: f32,
    pub accuracy: f32,
    pub millis: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct History {
    pub records: Vec<EpochRecord>,
}

impl History {
    pub fn last(&self) -> Option<&EpochRecord> {
        self.records.last()
    }

    // One row per epoch: epoch,loss,accuracy,millis
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in &self.records {
            writer.serialize(record)?;
        }
        writer.flush().map_err(|source| Error::io(path, source))?;
        Ok(())
    }
}

// Aggregate loss and accuracy over a split
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score {
    pub loss: f32,
    pub accuracy: f32,
}

impl Score {
    pub fn metrics_names() -> [&'static str; 2] {
        METRICS_NAMES
    }

    // Values in the order of metrics_names()
    pub fn values(&self) -> [f32; 2] {
        [self.loss, self.accuracy]
    }
}

// What one worker has accumulated over its share of a batch
struct BatchStats {
    grads: Gradients,
    loss: f64,
    correct: usize,
}

impl BatchStats {
    fn zeros(model: &Sequential) -> Self {
        Self {
            grads: Gradients::zeros_like(model),
            loss: 0.0,
            correct: 0,
        }
    }

    fn add_sample(mut self, model: &Sequential, input: ArrayD<f32>, target: &[f32]) -> Result<Self> {
        let trace = model.forward_trace(input)?;
        let output = trace
            .last()
            .ok_or_else(|| Error::structure("empty forward trace"))?;
        let probs = contiguous(output, "model output")?;

        self.loss += categorical_crossentropy(probs, target) as f64;
        if is_correct(probs, target) {
            self.correct += 1;
        }
        if model.ends_in_softmax() {
            // Softmax + cross-entropy: start from the logits
            let delta = softmax_crossentropy_delta(probs, target);
            model.backward_from_logits(&trace, &delta, &mut self.grads)?;
        } else {
            let grad = categorical_crossentropy_grad(probs, target);
            let grad = ArrayD::from_shape_vec(IxDyn(output.shape()), grad)?;
            model.backward(&trace, grad, &mut self.grads)?;
        }
        Ok(self)
    }

    fn merge(self, other: Self) -> Self {
        Self {
            grads: self.grads.merge(other.grads),
            loss: self.loss + other.loss,
            correct: self.correct + other.correct,
        }
    }
}

// Check that images and one-hot targets fit the model and each other; returns the sample count
fn check_split(model: &Sequential, x: &ArrayView4<f32>, y: &ArrayView2<f32>) -> Result<usize> {
    let n = x.len_of(Axis(0));
    if n != y.nrows() {
        return Err(Error::shape(format!(
            "{} images but {} targets",
            n,
            y.nrows()
        )));
    }
    if n == 0 {
        return Err(Error::shape("no samples"));
    }
    if &x.shape()[1..] != model.input_shape() {
        return Err(Error::shape(format!(
            "images are {:?} but the model expects {:?}",
            &x.shape()[1..],
            model.input_shape()
        )));
    }
    let classes: usize = model.output_shape().iter().product();
    if y.ncols() != classes {
        return Err(Error::shape(format!(
            "targets have {} classes but the model outputs {}",
            y.ncols(),
            classes
        )));
    }
    Ok(n)
}

// Train `model` with mini-batch SGD. Returns the mean loss and accuracy of every epoch,
// measured on the fly while the epoch runs.
pub fn fit(
    model: &mut Sequential,
    optimizer: &mut Sgd,
    x: ArrayView4<f32>,
    y: ArrayView2<f32>,
    options: &FitOptions,
    rng: &mut impl Rng,
) -> Result<History> {
    let n = check_split(model, &x, &y)?;
    if options.batch_size == 0 {
        return Err(Error::InvalidConfig("batch size must be at least 1".into()));
    }
    let n_batches = (n + options.batch_size - 1) / options.batch_size;

    let mut history = History::default();
    let mut order: Vec<usize> = (0..n).collect();
    for epoch in 1..=options.epochs {
        let now = Instant::now();
        if options.shuffle {
            order.shuffle(rng);
        }

        let mut loss = 0.0;
        let mut correct = 0;
        for (b, batch) in order.chunks(options.batch_size).enumerate() {
            let current: &Sequential = model;
            let stats = backend::fold_samples(
                batch.len(),
                || Ok(BatchStats::zeros(current)),
                |acc: Result<BatchStats>, i| {
                    let index = batch[i];
                    let target = y.row(index).to_vec();
                    acc?.add_sample(current, sample(&x, index), &target)
                },
                |left, right| Ok(left?.merge(right?)),
            )?;

            loss += stats.loss;
            correct += stats.correct;
            let mut grads = stats.grads;
            grads.scale(1.0 / batch.len() as f32);
            optimizer.step(model, &grads)?;

            if (b + 1) % 100 == 0 || b + 1 == n_batches {
                debug!(
                    "epoch {} batch {}/{} - loss: {:.4}",
                    epoch,
                    b + 1,
                    n_batches,
                    stats.loss / batch.len() as f64
                );
            }
        }

        let record = EpochRecord {
            epoch,
            loss: (loss / n as f64) as f32,
            accuracy: correct as f32 / n as f32,
            millis: now.elapsed().as_millis() as u64,
        };
        info!(
            "Epoch {}/{} - loss: {:.4} - accuracy: {:.4} [{}ms]",
            epoch, options.epochs, record.loss, record.accuracy, record.millis
        );
        history.records.push(record);
    }
    Ok(history)
}

// Loss and accuracy of `model` over a whole split, without touching the parameters
pub fn evaluate(model: &Sequential, x: ArrayView4<f32>, y: ArrayView2<f32>) -> Result<Score> {
    let n = check_split(model, &x, &y)?;
    let now = Instant::now();
    let probs = model.predict(x)?;

    let mut loss = 0.0_f64;
    let mut correct = 0;
    for (p, t) in probs.rows().into_iter().zip(y.rows()) {
        let (p, t) = (p.to_vec(), t.to_vec());
        loss += categorical_crossentropy(&p, &t) as f64;
        if is_correct(&p, &t) {
            correct += 1;
        }
    }
    let score = Score {
        loss: (loss / n as f64) as f32,
        accuracy: correct as f32 / n as f32,
    };
    info!(
        "Evaluated {} samples - loss: {:.4} - accuracy: {:.4} [{}ms]",
        n,
        score.loss,
        score.accuracy,
        now.elapsed().as_millis()
    );
    Ok(score)
}
