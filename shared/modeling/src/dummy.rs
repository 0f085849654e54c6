use crate::{Autocast, Batch, CausalLM, EvalOutput, GenerationConfig, ModelError, ModelOutput};
use candle_core::{DType, Device, Tensor, Var};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// Call counters shared between a [`DummyModel`] and whoever inspects it.
#[derive(Debug, Default)]
pub struct DummyCounters {
    pub forward: AtomicUsize,
    pub inference: AtomicUsize,
    pub generate: AtomicUsize,
}

/// A model whose training losses and evaluation losses are scripted.
///
/// The `i`-th call to `forward` returns `train_losses[i % len]` as a loss that
/// still depends on the single parameter, so backward and optimizer steps work.
/// The `i`-th `inference` call reports `eval_losses[i % len]` for every example.
#[derive(Debug)]
pub struct DummyModel {
    weight: Var,
    train_losses: Vec<f32>,
    eval_losses: Vec<f32>,
    counters: Arc<DummyCounters>,
    device: Device,
    training: bool,
    pad_token_id: u32,
    eos_token_id: u32,
}

impl Default for DummyModel {
    fn default() -> Self {
        Self::new(vec![1.0], vec![1.0])
    }
}

impl DummyModel {
    pub fn new(train_losses: Vec<f32>, eval_losses: Vec<f32>) -> Self {
        let weight = Var::zeros(4, DType::F32, &Device::Cpu)
            .expect("allocating a 4-element cpu tensor");
        Self {
            weight,
            train_losses,
            eval_losses,
            counters: Arc::new(DummyCounters::default()),
            device: Device::Cpu,
            training: true,
            pad_token_id: 0,
            eos_token_id: 1,
        }
    }

    pub fn with_special_tokens(mut self, pad_token_id: u32, eos_token_id: u32) -> Self {
        self.pad_token_id = pad_token_id;
        self.eos_token_id = eos_token_id;
        self
    }

    pub fn counters(&self) -> Arc<DummyCounters> {
        self.counters.clone()
    }

    fn scripted(values: &[f32], call: usize) -> f32 {
        if values.is_empty() {
            0.0
        } else {
            values[call % values.len()]
        }
    }

    fn anchored(&self, value: f32) -> Result<Tensor, ModelError> {
        Ok(self
            .weight
            .as_tensor()
            .sum_all()?
            .affine(0.0, value as f64)?)
    }
}

impl CausalLM for DummyModel {
    fn forward(&mut self, _batch: &Batch, _autocast: Autocast) -> Result<ModelOutput, ModelError> {
        let call = self.counters.forward.fetch_add(1, Ordering::SeqCst);
        let loss = self.anchored(Self::scripted(&self.train_losses, call))?;
        Ok(ModelOutput { loss })
    }

    fn inference(
        &mut self,
        batch: &Batch,
        _autocast: Autocast,
        generation: Option<&GenerationConfig>,
    ) -> Result<EvalOutput, ModelError> {
        let call = self.counters.inference.fetch_add(1, Ordering::SeqCst);
        let value = Self::scripted(&self.eval_losses, call);
        let rows = batch.len();
        let mut output = EvalOutput::new();
        output.insert_tensor("loss", Tensor::new(vec![value; rows], &Device::Cpu)?);
        if let Some(config) = generation {
            output.insert_tensor("predicted_answer_ids", self.generate(batch, config)?);
        }
        Ok(output)
    }

    fn generate(
        &mut self,
        batch: &Batch,
        config: &GenerationConfig,
    ) -> Result<Tensor, ModelError> {
        self.counters.generate.fetch_add(1, Ordering::SeqCst);
        let rows = batch.len();
        let mut ids = vec![self.pad_token_id; rows * config.max_new_tokens];
        for row in 0..rows {
            ids[row * config.max_new_tokens] = self.eos_token_id;
        }
        Ok(Tensor::from_vec(ids, (rows, config.max_new_tokens), &Device::Cpu)?)
    }

    fn response_log_probs(
        &self,
        _query: &[u32],
        response: &[u32],
        _autocast: Autocast,
    ) -> Result<Tensor, ModelError> {
        let zeros = Tensor::zeros(response.len(), DType::F32, &Device::Cpu)?;
        Ok(zeros.broadcast_add(&self.weight.as_tensor().sum_all()?)?)
    }

    fn named_variables(&self) -> Vec<(String, Var)> {
        vec![("dummy.weight".to_string(), self.weight.clone())]
    }

    fn trainable_variables(&self) -> Vec<(String, Var)> {
        self.named_variables()
    }

    fn force_embedding_gradients(&mut self) -> Result<(), ModelError> {
        Ok(())
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn pad_token_id(&self) -> Option<u32> {
        Some(self.pad_token_id)
    }

    fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }

    fn device(&self) -> &Device {
        &self.device
    }
}
