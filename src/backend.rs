// The numerical backend: where per-sample work gets executed.
//
// With the `parallel` feature, samples are spread over the rayon worker pool.
// Without it everything runs on the calling thread, and the binary refuses to train.

#[cfg(feature = "parallel")]
use rayon::prelude::*;

// Name of the cargo feature that enables the accelerated backend
pub const ACCELERATED_FEATURE: &str = "parallel";

// Build-time capability check, the counterpart of asking a GPU framework whether it was built with CUDA
pub fn is_built_with_parallel() -> bool {
    cfg!(feature = "parallel")
}

// What the binary prints before refusing to train without the accelerated backend
pub fn missing_backend_message() -> String {
    format!("Not built with {} backend", ACCELERATED_FEATURE)
}

// Number of workers the backend can dispatch onto (0 if the accelerated backend is not compiled in)
pub fn available_workers() -> usize {
    #[cfg(feature = "parallel")]
    {
        rayon::current_num_threads()
    }
    #[cfg(not(feature = "parallel"))]
    {
        0
    }
}

// Apply `f` to every sample index in 0..n, keeping the output in index order
pub fn map_samples<T, F>(n: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Sync + Send,
{
    #[cfg(feature = "parallel")]
    {
        (0..n).into_par_iter().map(f).collect()
    }
    #[cfg(not(feature = "parallel"))]
    {
        (0..n).map(f).collect()
    }
}

// Fold every sample index in 0..n into an accumulator.
// Each worker starts from its own `identity()` and the partial results are combined with `reduce`,
// so `identity()` must be neutral for `reduce` (zero gradients, empty vectors, ...).
// With n == 0 the result is a single `identity()`.
pub fn fold_samples<T, I, F, R>(n: usize, identity: I, fold: F, reduce: R) -> T
where
    T: Send,
    I: Fn() -> T + Sync + Send,
    F: Fn(T, usize) -> T + Sync + Send,
    R: Fn(T, T) -> T + Sync + Send,
{
    #[cfg(feature = "parallel")]
    {
        (0..n)
            .into_par_iter()
            .fold(&identity, &fold)
            .reduce_with(&reduce)
            .unwrap_or_else(&identity)
    }
    #[cfg(not(feature = "parallel"))]
    {
        let _ = &reduce;
        (0..n).fold(identity(), fold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(feature = "parallel")]
    fn test_parallel_backend_is_detected() {
        assert!(is_built_with_parallel());
        assert!(available_workers() >= 1);
    }

    #[test]
    fn test_map_samples_keeps_order() {
        let squares = map_samples(100, |i| i * i);
        assert_eq!(squares.len(), 100);
        assert!(squares.iter().enumerate().all(|(i, &s)| s == i * i));
    }

    #[test]
    fn test_fold_samples_sums() {
        let total = fold_samples(1000, || 0_usize, |acc, i| acc + i, |a, b| a + b);
        assert_eq!(total, 999 * 1000 / 2);
    }

    #[test]
    fn test_fold_samples_empty() {
        let total = fold_samples(0, || 7_usize, |acc, i| acc + i, |a, b| a + b);
        assert_eq!(total, 7);
    }

    #[test]
    fn test_fold_samples_visits_each_index_once() {
        let mut seen = fold_samples(
            500,
            Vec::new,
            |mut acc, i| {
                acc.push(i);
                acc
            },
            |mut a, b| {
                a.extend(b);
                a
            },
        );
        seen.sort_unstable();
        assert_eq!(seen, (0..500).collect::<Vec<_>>());
    }

    #[test]
    fn test_missing_backend_message() {
        assert_eq!(missing_backend_message(), "Not built with parallel backend");
    }
}
