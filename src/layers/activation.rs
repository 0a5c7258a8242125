use serde::{Deserialize, Serialize};

// Element-wise (or, for softmax, last-axis) nonlinearity applied after a layer's affine part
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Linear,
    Relu,
    Softmax,
}

impl Activation {
    // Apply in place. `values` is a sequence of rows of length `axis_len` (the last axis);
    // softmax normalizes each row independently.
    pub fn apply(self, values: &mut [f32], axis_len: usize) {
        match self {
            Activation::Linear => {}
            Activation::Relu => values.iter_mut().for_each(|v| *v = v.max(0.0)),
            Activation::Softmax => values.chunks_mut(axis_len).for_each(softmax),
        }
    }

    // Turn the gradient w.r.t. the activation's output into the gradient w.r.t. its input, in place.
    // `output` is what `apply` produced.
    pub fn backward(self, output: &[f32], grad: &mut [f32], axis_len: usize) {
        match self {
            Activation::Linear => {}
            Activation::Relu => {
                for (g, &y) in grad.iter_mut().zip(output) {
                    if y <= 0.0 {
                        *g = 0.0;
                    }
                }
            }
            Activation::Softmax => {
                // Jacobian-vector product: dz_i = p_i * (g_i - sum_j g_j p_j)
                for (g, p) in grad.chunks_mut(axis_len).zip(output.chunks(axis_len)) {
                    let weighted: f32 = g.iter().zip(p).map(|(g, p)| g * p).sum();
                    g.iter_mut().zip(p).for_each(|(g, p)| *g = p * (*g - weighted));
                }
            }
        }
    }
}

fn softmax(row: &mut [f32]) {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for v in row.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    row.iter_mut().for_each(|v| *v /= sum);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relu_forward_and_mask() {
        let mut values = [-1.0, 0.0, 2.5];
        Activation::Relu.apply(&mut values, 3);
        assert_eq!(values, [0.0, 0.0, 2.5]);

        let mut grad = [1.0, 1.0, 1.0];
        Activation::Relu.backward(&values, &mut grad, 3);
        assert_eq!(grad, [0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let mut values = [1.0, 2.0, 3.0, 1000.0, 1000.0, 1000.0];
        Activation::Softmax.apply(&mut values, 3);
        for row in values.chunks(3) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-6);
            assert!(row.iter().all(|p| p.is_finite()));
        }
        assert!(values[2] > values[1] && values[1] > values[0]);
    }

    #[test]
    fn test_softmax_backward_matches_finite_difference() {
        let logits = [0.3_f32, -1.2, 0.8, 0.1];
        let upstream = [0.5_f32, -2.0, 1.0, 0.25];
        let loss = |z: &[f32]| {
            let mut p = z.to_vec();
            Activation::Softmax.apply(&mut p, 4);
            p.iter().zip(&upstream).map(|(p, g)| p * g).sum::<f32>()
        };

        let mut probs = logits;
        Activation::Softmax.apply(&mut probs, 4);
        let mut grad = upstream;
        Activation::Softmax.backward(&probs, &mut grad, 4);

        let eps = 1e-3;
        for i in 0..4 {
            let mut plus = logits;
            let mut minus = logits;
            plus[i] += eps;
            minus[i] -= eps;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * eps);
            assert!((numeric - grad[i]).abs() < 1e-3, "index {}", i);
        }
    }

    #[test]
    fn test_serialized_names() {
        assert_eq!(
            serde_json::to_string(&Activation::Relu).unwrap(),
            "\"relu\""
        );
        let parsed: Activation = serde_json::from_str("\"softmax\"").unwrap();
        assert_eq!(parsed, Activation::Softmax);
    }
}
