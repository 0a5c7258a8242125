use std::path::PathBuf;

use clap::Parser;

use crate::train::FitOptions;
use crate::{Error, Result};

/// Train a convolutional MNIST classifier, save it and report its test accuracy
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "cnn_mnist", version)]
pub struct RunConfig {
    /// Directory containing the dataset archive
    #[arg(long, env = "DATA_FILE_PATH")]
    pub data_dir: Option<PathBuf>,

    /// Name of the dataset archive inside the data directory
    #[arg(long, default_value = "mnist.npz")]
    pub dataset_file: String,

    #[arg(long, default_value_t = 10)]
    pub epochs: usize,

    #[arg(long, default_value_t = 32)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 0.01)]
    pub learning_rate: f32,

    #[arg(long, default_value_t = 0.9)]
    pub momentum: f32,

    /// Use Nesterov momentum
    #[arg(long)]
    pub nesterov: bool,

    /// Keep the sample order fixed across epochs
    #[arg(long)]
    pub no_shuffle: bool,

    /// Seed for weight initialization and shuffling
    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// Where to write the model topology
    #[arg(long, default_value = "model1.json")]
    pub model_json: PathBuf,

    /// Where to write the model parameters
    #[arg(long, default_value = "model1.h5")]
    pub model_weights: PathBuf,

    /// Also write the per-epoch loss and accuracy to this CSV file
    #[arg(long)]
    pub history: Option<PathBuf>,
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig("batch size must be at least 1".into()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(Error::InvalidConfig(format!(
                "momentum must be in [0, 1), got {}",
                self.momentum
            )));
        }
        Ok(())
    }

    pub fn fit_options(&self) -> FitOptions {
        FitOptions {
            epochs: self.epochs,
            batch_size: self.batch_size,
            shuffle: !self.no_shuffle,
        }
    }
}
