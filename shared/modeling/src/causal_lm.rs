use candle_core::{DType, Device, Tensor, Var};
use finetune_core::{MixedPrecision, PredictionConfig};

use crate::{Batch, EvalOutput, ModelError};

/// Compute precision handed to a model inside a mixed-precision scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Autocast {
    dtype: DType,
}

impl Autocast {
    pub fn full() -> Self {
        Self { dtype: DType::F32 }
    }

    pub fn for_precision(precision: MixedPrecision) -> Self {
        let dtype = match precision {
            MixedPrecision::No => DType::F32,
            MixedPrecision::Fp16 => DType::F16,
            MixedPrecision::Bf16 => DType::BF16,
        };
        Self { dtype }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn is_reduced(&self) -> bool {
        self.dtype != DType::F32
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    pub do_sample: bool,
    pub temperature: f64,
    pub seed: u64,
}

impl GenerationConfig {
    pub fn from_prediction(prediction: &PredictionConfig, seed: u64) -> Self {
        Self {
            max_new_tokens: prediction.max_new_tokens,
            do_sample: prediction.do_sample,
            temperature: prediction.temperature,
            seed,
        }
    }
}

#[derive(Debug)]
pub struct ModelOutput {
    /// Mean loss over the batch, attached to the autograd graph.
    pub loss: Tensor,
}

pub trait CausalLM: Send + std::fmt::Debug {
    fn forward(&mut self, batch: &Batch, autocast: Autocast) -> Result<ModelOutput, ModelError>;

    /// Per-example `loss`, plus `predicted_answer_ids` when `generation` is given.
    fn inference(
        &mut self,
        batch: &Batch,
        autocast: Autocast,
        generation: Option<&GenerationConfig>,
    ) -> Result<EvalOutput, ModelError>;

    /// Continues every prompt row; returns `[batch, max_new_tokens]` ids, padded after EOS.
    fn generate(
        &mut self,
        batch: &Batch,
        config: &GenerationConfig,
    ) -> Result<Tensor, ModelError>;

    /// Log-probability of each `response` token given the preceding tokens.
    fn response_log_probs(
        &self,
        query: &[u32],
        response: &[u32],
        autocast: Autocast,
    ) -> Result<Tensor, ModelError>;

    /// Every parameter, trainable or not, in a stable order.
    fn named_variables(&self) -> Vec<(String, Var)>;

    fn trainable_variables(&self) -> Vec<(String, Var)>;

    /// Makes input embeddings trainable and keeps them in full precision.
    fn force_embedding_gradients(&mut self) -> Result<(), ModelError>;

    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;

    fn pad_token_id(&self) -> Option<u32>;

    fn eos_token_id(&self) -> u32;

    fn device(&self) -> &Device;
}
