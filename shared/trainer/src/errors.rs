use finetune_data_provider::DataError;
use finetune_eval::EvalError;
use finetune_modeling::{CheckpointError, DistributedError, ModelError, PolicyError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StepError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Distributed(#[from] DistributedError),

    #[error("policy update failed: {0}")]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error(
        "training loss became {loss} at iteration {iteration}. Try a lower learning rate, \
         a different dtype or no mixed precision; gradient clipping can also stabilize training"
    )]
    Divergence { iteration: u64, loss: f64 },

    #[error("training was cancelled")]
    Cancelled,

    #[error("training step failed: {0}")]
    Step(#[from] StepError),

    #[error("evaluation failed: {0}")]
    Eval(#[from] EvalError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Distributed(#[from] DistributedError),

    #[error("failed to save checkpoint: {0}")]
    Checkpoint(#[from] CheckpointError),
}

impl TrainingError {
    /// Whether this is only the echo of another worker's failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            TrainingError::Cancelled
                | TrainingError::Distributed(DistributedError::Cancelled)
                | TrainingError::Step(StepError::Distributed(DistributedError::Cancelled))
                | TrainingError::Step(StepError::Policy(PolicyError::Distributed(
                    DistributedError::Cancelled
                )))
                | TrainingError::Eval(EvalError::Distributed(DistributedError::Cancelled))
        )
    }
}
