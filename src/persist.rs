// Saving and restoring a trained model.
//
// The topology goes to a JSON document, the parameters to an npz archive with one entry per
// tensor, named "<layer>/<param>" (e.g. "conv2d/kernel", "dense_1/bias").
// Existing files are overwritten.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;

use log::info;
use ndarray::ArrayD;
use ndarray_npy::{NpzReader, NpzWriter, ReadNpzError, WriteNpzError};
use rand::{rngs::SmallRng, SeedableRng};

use crate::model::{Sequential, Topology};
use crate::{Error, Result};

pub fn save_topology(model: &Sequential, path: &Path) -> Result<()> {
    let json = serde_json::to_string(&model.topology())?;
    fs::write(path, json).map_err(|source| Error::io(path, source))?;
    info!("Wrote topology of {} to {}", model.name(), path.display());
    Ok(())
}

pub fn load_topology(path: &Path) -> Result<Topology> {
    let json = fs::read_to_string(path).map_err(|source| Error::io(path, source))?;
    Ok(serde_json::from_str(&json)?)
}

pub fn save_weights(model: &Sequential, path: &Path) -> Result<()> {
    let file = File::create(path).map_err(|source| Error::io(path, source))?;
    let write_error = |source: WriteNpzError| Error::WriteArchive {
        path: path.to_path_buf(),
        source,
    };

    let mut npz = NpzWriter::new(file);
    let mut count = 0;
    for layer in model.layers() {
        for (param, values) in layer.params() {
            npz.add_array(entry_name(layer.name(), param), &values)
                .map_err(write_error)?;
            count += 1;
        }
    }
    npz.finish().map_err(write_error)?;
    info!("Wrote {} parameter tensors to {}", count, path.display());
    Ok(())
}

// Overwrite every parameter of `model` with the values stored in the archive.
// Every tensor must be present with exactly the parameter's shape.
pub fn load_weights(model: &mut Sequential, path: &Path) -> Result<()> {
    let file = File::open(path).map_err(|source| Error::io(path, source))?;
    let read_error = |source: ReadNpzError| Error::ReadArchive {
        path: path.to_path_buf(),
        source,
    };
    let mut npz = NpzReader::new(BufReader::new(file)).map_err(read_error)?;
    let entries = npz.names().map_err(read_error)?;

    for layer in model.layers_mut() {
        let layer_name = layer.name().to_string();
        let param_names: Vec<&'static str> = layer.params().iter().map(|(name, _)| *name).collect();
        for (param_name, mut param) in param_names.into_iter().zip(layer.params_mut()) {
            let name = entry_name(&layer_name, param_name);
            let entry = archive_entry(&entries, &name).ok_or_else(|| Error::MissingEntry {
                path: path.to_path_buf(),
                name: name.clone(),
            })?;
            let stored: ArrayD<f32> = npz.by_name(entry).map_err(read_error)?;
            if stored.shape() != param.shape() {
                return Err(Error::shape(format!(
                    "{} is stored as {:?} but the model expects {:?}",
                    name,
                    stored.shape(),
                    param.shape()
                )));
            }
            param.assign(&stored);
        }
    }
    Ok(())
}

// Rebuild a model from its topology file and fill in its parameters
pub fn load_model(topology_path: &Path, weights_path: &Path) -> Result<Sequential> {
    let topology = load_topology(topology_path)?;
    // Initial values are discarded when the weights are loaded
    let mut model = Sequential::from_topology(&topology, &mut SmallRng::seed_from_u64(0))?;
    load_weights(&mut model, weights_path)?;
    Ok(model)
}

fn entry_name(layer: &str, param: &str) -> String {
    format!("{}/{}", layer, param)
}

// Find an archive entry by name, with or without the .npy suffix numpy adds
pub(crate) fn archive_entry<'a>(entries: &'a [String], name: &str) -> Option<&'a str> {
    entries
        .iter()
        .map(String::as_str)
        .find(|entry| *entry == name || entry.strip_suffix(".npy") == Some(name))
}
