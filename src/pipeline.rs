// The end-to-end run: load, preprocess, build, fit, save, evaluate

use log::info;
use rand::{rngs::SmallRng, SeedableRng};

use crate::config::RunConfig;
use crate::mnist::{dataset_path, load_mnist, prepare_images, to_categorical};
use crate::model::{mnist_cnn, Sequential};
use crate::optimizer::Sgd;
use crate::persist::{save_topology, save_weights};
use crate::train::{evaluate, fit, History, Score};
use crate::Result;

#[derive(Debug, Clone)]
pub struct Report {
    pub history: History,
    pub score: Score,
}

pub fn run(config: &RunConfig) -> Result<Report> {
    config.validate()?;
    let path = dataset_path(config.data_dir.as_deref(), &config.dataset_file)?;
    let ((train_images, train_labels), (test_images, test_labels)) = load_mnist(&path)?;

    let x_train = prepare_images(train_images)?;
    let y_train = to_categorical(&train_labels, None)?;
    info!("Training tensors: x {:?}, y {:?}", x_train.shape(), y_train.shape());

    let mut rng = SmallRng::seed_from_u64(config.seed);
    let mut model = Sequential::build("sequential", mnist_cnn(), &mut rng)?;
    info!("\n{}", model.summary());

    let mut optimizer = Sgd::new(config.learning_rate, config.momentum)?.with_nesterov(config.nesterov);
    info!(
        "SGD with learning rate {} and momentum {}{}",
        optimizer.learning_rate(),
        optimizer.momentum(),
        if config.nesterov { " (nesterov)" } else { "" }
    );
    let history = fit(
        &mut model,
        &mut optimizer,
        x_train.view(),
        y_train.view(),
        &config.fit_options(),
        &mut rng,
    )?;
    if let Some(history_path) = &config.history {
        history.write_csv(history_path)?;
        info!("Wrote training history to {}", history_path.display());
    }

    save_topology(&model, &config.model_json)?;
    save_weights(&model, &config.model_weights)?;
    println!("Saved model to disk");

    let x_test = prepare_images(test_images)?;
    let y_test = to_categorical(&test_labels, None)?;
    let score = evaluate(&model, x_test.view(), y_test.view())?;

    Ok(Report { history, score })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::load_model;
    use crate::Error;
    use clap::Parser;
    use ndarray::{Array1, Array3};
    use ndarray_npy::NpzWriter;
    use rand::Rng;
    use std::fs::{self, File};
    use std::path::Path;

    // Random pixels and labels; label 9 is always present so the one-hot width is 10
    fn write_random_dataset(path: &Path, n_train: usize, n_test: usize) {
        write_dataset(path, n_train, n_test, 10);
    }

    // Labels are drawn from 0..test_classes for the test split; the highest one is always present
    fn write_dataset(path: &Path, n_train: usize, n_test: usize, test_classes: u8) {
        let mut rng = SmallRng::seed_from_u64(42);
        let mut split = |n: usize, classes: u8| {
            let images = Array3::from_shape_simple_fn((n, 28, 28), || rng.gen::<u8>());
            let mut labels = Array1::from_shape_simple_fn(n, || rng.gen_range(0..classes));
            labels[0] = classes - 1;
            (images, labels)
        };
        let (x_train, y_train) = split(n_train, 10);
        let (x_test, y_test) = split(n_test, test_classes);

        let mut npz = NpzWriter::new(File::create(path).unwrap());
        npz.add_array("x_train", &x_train).unwrap();
        npz.add_array("y_train", &y_train).unwrap();
        npz.add_array("x_test", &x_test).unwrap();
        npz.add_array("y_test", &y_test).unwrap();
        npz.finish().unwrap();
    }

    #[test]
    fn test_smoke_run() {
        let dir = tempfile::tempdir().unwrap();
        write_random_dataset(&dir.path().join("mnist.npz"), 100, 20);
        let out = |name: &str| dir.path().join(name).display().to_string();
        let config = RunConfig::parse_from([
            "cnn_mnist".to_string(),
            "--data-dir".to_string(),
            dir.path().display().to_string(),
            "--epochs".to_string(),
            "1".to_string(),
            "--model-json".to_string(),
            out("model1.json"),
            "--model-weights".to_string(),
            out("model1.h5"),
            "--history".to_string(),
            out("history.csv"),
        ]);

        let report = run(&config).unwrap();
        assert_eq!(report.history.records.len(), 1);
        let accuracy = report.score.accuracy * 100.0;
        assert!((0.0..=100.0).contains(&accuracy));
        assert!(report.score.loss.is_finite());

        for name in ["model1.json", "model1.h5", "history.csv"] {
            assert!(fs::metadata(dir.path().join(name)).unwrap().len() > 0);
        }
        let restored = load_model(&dir.path().join("model1.json"), &dir.path().join("model1.h5")).unwrap();
        assert_eq!(restored.param_count(), 542_230);
    }

    #[test]
    fn test_missing_data_dir_fails_before_training() {
        let config = RunConfig {
            data_dir: None,
            ..RunConfig::parse_from(["cnn_mnist"])
        };
        assert!(matches!(run(&config), Err(Error::MissingConfig(_))));
    }

    #[test]
    fn test_missing_dataset_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig::parse_from([
            "cnn_mnist".to_string(),
            "--data-dir".to_string(),
            dir.path().display().to_string(),
        ]);
        assert!(matches!(run(&config), Err(Error::Io { .. })));
    }

    #[test]
    fn test_both_splits_infer_their_class_count() {
        let dir = tempfile::tempdir().unwrap();
        // The test labels stop at 3, so they one-hot to 4 columns against 10 outputs
        write_dataset(&dir.path().join("mnist.npz"), 40, 10, 4);
        let out = |name: &str| dir.path().join(name).display().to_string();
        let config = RunConfig::parse_from([
            "cnn_mnist".to_string(),
            "--data-dir".to_string(),
            dir.path().display().to_string(),
            "--epochs".to_string(),
            "1".to_string(),
            "--model-json".to_string(),
            out("model1.json"),
            "--model-weights".to_string(),
            out("model1.h5"),
        ]);
        assert!(matches!(run(&config), Err(Error::Shape(_))));
    }
}
