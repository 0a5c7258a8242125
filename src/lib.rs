pub mod backend;
pub mod config;
pub mod error;
pub mod layers;
pub mod loss;
pub mod mnist;
pub mod model;
pub mod optimizer;
pub mod persist;
pub mod pipeline;
pub mod simd;
pub mod train;

pub use error::{Error, Result};

// MNIST images are 28x28 grayscale digits 0-9
pub const IMAGE_SIDE: usize = 28;
pub const N_CLASSES: usize = 10;

// SIMD register used by the inner loops
pub type Lane = wide::f32x8;
