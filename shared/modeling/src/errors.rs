use std::path::PathBuf;

use finetune_core::{CancelledBarrier, ConfigError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("batch has no tensor named \"{0}\"")]
    MissingTensor(String),

    #[error("batch has no text column named \"{0}\"")]
    MissingText(String),

    #[error("shape mismatch for \"{name}\": {reason}")]
    Shape { name: String, reason: String },

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

#[derive(Debug, Error)]
pub enum DistributedError {
    #[error("timed out after {timeout_secs}s waiting for all {world_size} workers to join")]
    JoinTimeout { timeout_secs: u64, world_size: usize },

    #[error("process group was cancelled")]
    Cancelled,

    #[error("rank {rank} is out of range for a world of {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    #[error("value gathered from rank {0} has an unexpected type")]
    TypeMismatch(usize),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

impl From<CancelledBarrier> for DistributedError {
    fn from(_: CancelledBarrier) -> Self {
        DistributedError::Cancelled
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint {path} is missing tensor \"{name}\"")]
    MissingTensor { path: PathBuf, name: String },

    #[error("checkpoint {path} has unexpected tensor \"{name}\"")]
    UnexpectedTensor { path: PathBuf, name: String },

    #[error("failed to create checkpoint directory {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("got {queries} queries, {responses} responses and {rewards} rewards")]
    LengthMismatch {
        queries: usize,
        responses: usize,
        rewards: usize,
    },

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Distributed(#[from] DistributedError),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}
