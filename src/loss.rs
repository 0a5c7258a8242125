// Categorical cross-entropy and the accuracy metric

// Probabilities are clipped to [EPSILON, 1 - EPSILON] before taking the log
pub const EPSILON: f32 = 1e-7;

// Names of the values reported by evaluation, in order
pub const METRICS_NAMES: [&str; 2] = ["loss", "accuracy"];

#[inline]
fn clip(p: f32) -> f32 {
    p.clamp(EPSILON, 1.0 - EPSILON)
}

// -sum(target * log(probs))
pub fn categorical_crossentropy(probs: &[f32], target: &[f32]) -> f32 {
    probs
        .iter()
        .zip(target)
        .filter(|(_, t)| **t != 0.0)
        .map(|(&p, &t)| -t * clip(p).ln())
        .sum()
}

// Gradient of the loss w.r.t. the probabilities
pub fn categorical_crossentropy_grad(probs: &[f32], target: &[f32]) -> Vec<f32> {
    probs
        .iter()
        .zip(target)
        .map(|(&p, &t)| if t == 0.0 { 0.0 } else { -t / clip(p) })
        .collect()
}

// Gradient of the loss w.r.t. the logits of a softmax output: probs * sum(target) - target.
// Unlike chaining `categorical_crossentropy_grad` through the softmax, this does not vanish
// when a wrong class saturates.
pub fn softmax_crossentropy_delta(probs: &[f32], target: &[f32]) -> Vec<f32> {
    let total: f32 = target.iter().sum();
    probs
        .iter()
        .zip(target)
        .map(|(&p, &t)| p * total - t)
        .collect()
}

// Index of the largest value (first one wins on ties)
pub fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, best_value), (i, &v)| {
            if v > best_value {
                (i, v)
            } else {
                (best, best_value)
            }
        })
        .0
}

// A prediction counts as correct when its most probable class is the target's class
pub fn is_correct(probs: &[f32], target: &[f32]) -> bool {
    argmax(probs) == argmax(target)
}
