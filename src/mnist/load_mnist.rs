use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use log::info;
use ndarray::{Array, Array1, Array3, Axis, Dimension};
use ndarray_npy::{NpzReader, ReadNpzError};

use crate::persist::archive_entry;
use crate::{Error, Result};

// Environment variable naming the directory that holds the dataset
pub const DATA_PATH_VAR: &str = "DATA_FILE_PATH";
pub const DATASET_FILE: &str = "mnist.npz";

// (images, labels) with images shaped (N, 28, 28)
pub type Split = (Array3<u8>, Array1<u8>);

// Resolve the dataset file inside the data directory.
// The directory is mandatory; there is no download fallback.
pub fn dataset_path(data_dir: Option<&Path>, file_name: &str) -> Result<PathBuf> {
    let dir = data_dir.ok_or(Error::MissingConfig(DATA_PATH_VAR))?;
    Ok(dir.join(file_name))
}

// Load the MNIST archive.
// Returns ((train_images, train_labels), (test_images, test_labels)).
// The archive must hold x_train, y_train, x_test and y_test as uint8 arrays.
pub fn load_mnist(path: &Path) -> Result<(Split, Split)> {
    let file = File::open(path).map_err(|source| Error::io(path, source))?;
    let mut npz = NpzReader::new(BufReader::new(file)).map_err(|source| read_error(path, source))?;
    let entries = npz.names().map_err(|source| read_error(path, source))?;

    let train = read_split(&mut npz, &entries, path, "x_train", "y_train")?;
    let test = read_split(&mut npz, &entries, path, "x_test", "y_test")?;

    info!(
        "Loaded {} training and {} test examples from {}",
        train.1.len(),
        test.1.len(),
        path.display()
    );
    Ok((train, test))
}

type Archive = NpzReader<BufReader<File>>;

fn read_split(npz: &mut Archive, entries: &[String], path: &Path, images: &str, labels: &str) -> Result<Split> {
    let x: Array3<u8> = read_entry(npz, entries, path, images)?;
    let y: Array1<u8> = read_entry(npz, entries, path, labels)?;
    if x.len_of(Axis(0)) != y.len() {
        return Err(Error::shape(format!(
            "{} holds {} images but {} holds {} labels",
            images,
            x.len_of(Axis(0)),
            labels,
            y.len()
        )));
    }
    Ok((x, y))
}

fn read_entry<D: Dimension>(npz: &mut Archive, entries: &[String], path: &Path, name: &str) -> Result<Array<u8, D>> {
    let entry = archive_entry(entries, name).ok_or_else(|| Error::MissingEntry {
        path: path.to_path_buf(),
        name: name.to_string(),
    })?;
    npz.by_name(entry).map_err(|source| read_error(path, source))
}

fn read_error(path: &Path, source: ReadNpzError) -> Error {
    Error::ReadArchive {
        path: path.to_path_buf(),
        source,
    }
}
