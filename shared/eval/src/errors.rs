use std::path::PathBuf;

use finetune_data_provider::DataError;
use finetune_modeling::{DistributedError, ModelError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EvalError {
    #[error("unknown metric \"{name}\", expected one of {known:?}")]
    UnknownMetric { name: String, known: Vec<&'static str> },

    #[error("evaluation output has no entry \"{0}\"")]
    MissingEntry(String),

    #[error("failed to write predictions to {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to encode predictions: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Distributed(#[from] DistributedError),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}
