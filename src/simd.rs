// SIMD inner loops shared by the convolution and dense layers
use super::Lane;

const LANES: usize = 8;

#[inline]
fn load(chunk: &[f32]) -> Lane {
    let mut lanes = [0.0_f32; LANES];
    lanes.copy_from_slice(chunk);
    Lane::from(lanes)
}

// y += a * x
#[inline]
pub fn axpy(a: f32, x: &[f32], y: &mut [f32]) {
    debug_assert_eq!(x.len(), y.len());
    let scale = Lane::splat(a);
    let mut xs = x.chunks_exact(LANES);
    let mut ys = y.chunks_exact_mut(LANES);
    for (x_chunk, y_chunk) in (&mut xs).zip(&mut ys) {
        let sum = scale * load(x_chunk) + load(y_chunk);
        y_chunk.copy_from_slice(&sum.to_array());
    }
    for (x, y) in xs.remainder().iter().zip(ys.into_remainder()) {
        *y += a * x;
    }
}

// Sum of x[i] * y[i]
#[inline]
pub fn dot(x: &[f32], y: &[f32]) -> f32 {
    debug_assert_eq!(x.len(), y.len());
    let mut acc = Lane::splat(0.0);
    let mut xs = x.chunks_exact(LANES);
    let mut ys = y.chunks_exact(LANES);
    for (x_chunk, y_chunk) in (&mut xs).zip(&mut ys) {
        acc = acc + load(x_chunk) * load(y_chunk);
    }
    let tail: f32 = xs
        .remainder()
        .iter()
        .zip(ys.remainder())
        .map(|(x, y)| x * y)
        .sum();
    acc.to_array().iter().sum::<f32>() + tail
}
