use candle_core::{Device, Tensor};
use finetune_modeling::{Batch, EvalOutput};

use crate::{DataError, ValidationFrame};

/// A dataset the training loop can batch, move to a device and post-process.
pub trait SupervisedDataset: Send + Sync + std::fmt::Debug {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Builds a host-side batch from the rows at `indices`.
    fn collate(&self, indices: &[usize]) -> Result<Batch, DataError>;

    fn batch_to_device(&self, batch: Batch, device: &Device) -> Result<Batch, DataError> {
        Ok(batch.to_device(device)?)
    }

    /// Decodes generated ids `[batch, new_tokens]` into one string per row.
    fn postprocess_batch_predictions(&self, ids: &Tensor) -> Result<Vec<String>, DataError>;

    /// Adds decoded predictions and reference columns to gathered evaluation output.
    fn postprocess_output(
        &self,
        frame: &ValidationFrame,
        output: EvalOutput,
    ) -> Result<EvalOutput, DataError>;
}
