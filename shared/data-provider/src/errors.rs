use std::path::PathBuf;

use finetune_modeling::ModelError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{path}:{line}: invalid JSON: {source}")]
    Json {
        path: PathBuf,
        line: usize,
        source: serde_json::Error,
    },

    #[error("{path}:{line}: row has no column \"{column}\"")]
    MissingColumn {
        path: PathBuf,
        line: usize,
        column: String,
    },

    #[error("index {index} is out of range for a dataset of {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("expected {expected} rows, got {actual}")]
    RowCount { expected: usize, actual: usize },

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}
