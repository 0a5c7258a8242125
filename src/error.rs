use std::path::PathBuf;

use ndarray_npy::{ReadNpzError, WriteNpzError};
use thiserror::Error;

// Every failure in the pipeline ends up here; nothing is recovered locally.
#[derive(Debug, Error)]
pub enum Error {
    // A required setting (environment variable or flag) was not provided
    #[error("missing configuration: {0} is not set")]
    MissingConfig(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to read archive {}: {source}", .path.display())]
    ReadArchive {
        path: PathBuf,
        source: ReadNpzError,
    },

    #[error("failed to write archive {}: {source}", .path.display())]
    WriteArchive {
        path: PathBuf,
        source: WriteNpzError,
    },

    #[error("archive {} has no entry named {name}", .path.display())]
    MissingEntry { path: PathBuf, name: String },

    #[error("malformed topology: {0}")]
    Topology(#[from] serde_json::Error),

    #[error("failed to write history: {0}")]
    History(#[from] csv::Error),

    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error(transparent)]
    Reshape(#[from] ndarray::ShapeError),

    // Layers that cannot be chained together
    #[error("structural error: {0}")]
    Structure(String),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn shape(reason: impl Into<String>) -> Self {
        Self::Shape(reason.into())
    }

    pub fn structure(reason: impl Into<String>) -> Self {
        Self::Structure(reason.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
