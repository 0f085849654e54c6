use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::ops::log_softmax;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::{Autocast, Batch, CausalLM, EvalOutput, GenerationConfig, ModelError, ModelOutput};

#[derive(Debug, Clone, PartialEq)]
pub struct BigramConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub pad_token_id: Option<u32>,
    pub eos_token_id: u32,
    pub init_range: f32,
}

impl BigramConfig {
    pub fn new(vocab_size: usize, hidden_size: usize, pad_token_id: Option<u32>, eos_token_id: u32) -> Self {
        Self {
            vocab_size,
            hidden_size,
            pad_token_id,
            eos_token_id,
            init_range: 0.02,
        }
    }
}

/// A next-token model conditioned only on the previous token: an embedding
/// lookup followed by a linear head.
///
/// Input embeddings start frozen; [`CausalLM::force_embedding_gradients`] makes
/// them trainable.
#[derive(Debug)]
pub struct BigramLM {
    config: BigramConfig,
    device: Device,
    embed_tokens: Var,
    lm_head: Var,
    lm_head_bias: Var,
    embeddings_trainable: bool,
    training: bool,
    generation_calls: u64,
}

fn uniform(rng: &mut ChaCha8Rng, len: usize, range: f32) -> Vec<f32> {
    (0..len).map(|_| rng.random_range(-range..range)).collect()
}

impl BigramLM {
    /// Initializes weights from `seed`, so every worker built with the same seed
    /// starts from the same replica.
    pub fn new(config: BigramConfig, seed: u64, device: &Device) -> Result<Self, ModelError> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let (v, h) = (config.vocab_size, config.hidden_size);
        let embed = Tensor::from_vec(uniform(&mut rng, v * h, config.init_range), (v, h), device)?;
        let head = Tensor::from_vec(uniform(&mut rng, h * v, config.init_range), (h, v), device)?;
        let bias = Tensor::zeros(v, DType::F32, device)?;
        debug!(vocab_size = v, hidden_size = h, seed, "Initialized bigram model");
        Ok(Self {
            config,
            device: device.clone(),
            embed_tokens: Var::from_tensor(&embed)?,
            lm_head: Var::from_tensor(&head)?,
            lm_head_bias: Var::from_tensor(&bias)?,
            embeddings_trainable: false,
            training: true,
            generation_calls: 0,
        })
    }

    pub fn config(&self) -> &BigramConfig {
        &self.config
    }

    fn pad_or_eos(&self) -> u32 {
        self.config.pad_token_id.unwrap_or(self.config.eos_token_id)
    }

    /// `[b, l]` ids to `[b, l, vocab]` f32 logits.
    fn logits(&self, ids: &Tensor, autocast: Autocast) -> Result<Tensor, ModelError> {
        let (b, l) = ids.dims2()?;
        let dtype = autocast.dtype();
        let embed = if self.embeddings_trainable {
            self.embed_tokens.as_tensor().clone()
        } else {
            self.embed_tokens.as_tensor().detach().to_dtype(dtype)?
        };
        let hidden = embed
            .index_select(&ids.flatten_all()?, 0)?
            .to_dtype(dtype)?;
        let logits = hidden
            .matmul(&self.lm_head.as_tensor().to_dtype(dtype)?)?
            .broadcast_add(&self.lm_head_bias.as_tensor().to_dtype(dtype)?)?
            .to_dtype(DType::F32)?;
        Ok(logits.reshape((b, l, self.config.vocab_size))?)
    }

    /// Negative log-likelihood of every next token, `[b, t - 1]`.
    fn token_nll(&self, input_ids: &Tensor, autocast: Autocast) -> Result<Tensor, ModelError> {
        let (_, t) = input_ids.dims2()?;
        if t < 2 {
            return Err(ModelError::Shape {
                name: "input_ids".to_string(),
                reason: format!("need at least 2 positions, got {t}"),
            });
        }
        let inputs = input_ids.narrow(1, 0, t - 1)?.contiguous()?;
        let targets = input_ids.narrow(1, 1, t - 1)?.contiguous()?;
        let log_probs = log_softmax(&self.logits(&inputs, autocast)?, D::Minus1)?;
        Ok(log_probs
            .gather(&targets.unsqueeze(2)?, 2)?
            .squeeze(2)?
            .neg()?)
    }

    /// Target mask aligned with [`Self::token_nll`].
    fn target_mask(&self, batch: &Batch) -> Result<Tensor, ModelError> {
        let mask = match batch.get_tensor("loss_mask") {
            Some(mask) => mask.clone(),
            None => batch.tensor("attention_mask")?.to_dtype(DType::F32)?,
        };
        let (_, t) = mask.dims2()?;
        Ok(mask.narrow(1, 1, t - 1)?.to_dtype(DType::F32)?)
    }

    fn choose_token(
        &self,
        logits: &[f32],
        config: &GenerationConfig,
        rng: &mut ChaCha8Rng,
    ) -> u32 {
        if !config.do_sample || config.temperature <= 0.0 {
            return argmax(logits);
        }
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let weights: Vec<f64> = logits
            .iter()
            .map(|&l| (((l - max) as f64) / config.temperature).exp())
            .collect();
        let total: f64 = weights.iter().sum();
        let mut target = rng.random::<f64>() * total;
        for (index, weight) in weights.iter().enumerate() {
            if target < *weight {
                return index as u32;
            }
            target -= weight;
        }
        argmax(logits)
    }
}

fn argmax(values: &[f32]) -> u32 {
    values
        .iter()
        .enumerate()
        .fold((0usize, f32::NEG_INFINITY), |best, (i, &v)| {
            if v > best.1 {
                (i, v)
            } else {
                best
            }
        })
        .0 as u32
}

impl CausalLM for BigramLM {
    fn forward(&mut self, batch: &Batch, autocast: Autocast) -> Result<ModelOutput, ModelError> {
        let nll = self.token_nll(batch.tensor("input_ids")?, autocast)?;
        let mask = self.target_mask(batch)?;
        let count = mask.sum_all()?.to_scalar::<f32>()?.max(1.0);
        let loss = (nll * mask)?.sum_all()?.affine(1.0 / count as f64, 0.0)?;
        Ok(ModelOutput { loss })
    }

    fn inference(
        &mut self,
        batch: &Batch,
        autocast: Autocast,
        generation: Option<&GenerationConfig>,
    ) -> Result<EvalOutput, ModelError> {
        let nll = self.token_nll(batch.tensor("input_ids")?, autocast)?.detach();
        let mask = self.target_mask(batch)?;
        let totals = (&nll * &mask)?.sum(1)?.to_vec1::<f32>()?;
        let counts = mask.sum(1)?.to_vec1::<f32>()?;
        let losses: Vec<f32> = totals
            .iter()
            .zip(&counts)
            .map(|(total, count)| total / count.max(1.0))
            .collect();

        let mut output = EvalOutput::new();
        output.insert_tensor("loss", Tensor::new(losses, &self.device)?);
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
        let prompt = match batch.get_tensor("prompt_input_ids") {
            Some(prompt) => prompt,
            None => batch.tensor("input_ids")?,
        };
        let (b, t) = prompt.dims2()?;
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed.wrapping_add(self.generation_calls));
        self.generation_calls += 1;

        let pad = self.pad_or_eos();
        let eos = self.config.eos_token_id;
        let mut current = prompt.narrow(1, t - 1, 1)?.squeeze(1)?.to_vec1::<u32>()?;
        let mut finished = vec![false; b];
        let mut generated = vec![pad; b * config.max_new_tokens];
        for position in 0..config.max_new_tokens {
            if finished.iter().all(|f| *f) {
                break;
            }
            let ids = Tensor::from_vec(current.clone(), (b, 1), &self.device)?;
            let logits = self
                .logits(&ids, Autocast::full())?
                .squeeze(1)?
                .detach()
                .to_vec2::<f32>()?;
            for (row, row_logits) in logits.iter().enumerate() {
                if finished[row] {
                    continue;
                }
                let token = self.choose_token(row_logits, config, &mut rng);
                generated[row * config.max_new_tokens + position] = token;
                current[row] = token;
                if token == eos {
                    finished[row] = true;
                }
            }
        }
        Ok(Tensor::from_vec(
            generated,
            (b, config.max_new_tokens),
            &self.device,
        )?)
    }

    fn response_log_probs(
        &self,
        query: &[u32],
        response: &[u32],
        autocast: Autocast,
    ) -> Result<Tensor, ModelError> {
        if query.is_empty() || response.is_empty() {
            return Err(ModelError::Shape {
                name: "query/response".to_string(),
                reason: format!(
                    "query ({}) and response ({}) must be non-empty",
                    query.len(),
                    response.len()
                ),
            });
        }
        let sequence: Vec<u32> = query.iter().chain(response).copied().collect();
        let len = sequence.len();
        let ids = Tensor::from_vec(sequence, (1, len), &self.device)?;
        let token_log_probs = self.token_nll(&ids, autocast)?.neg()?;
        Ok(token_log_probs
            .narrow(1, query.len() - 1, response.len())?
            .squeeze(0)?)
    }

    fn named_variables(&self) -> Vec<(String, Var)> {
        vec![
            ("embed_tokens.weight".to_string(), self.embed_tokens.clone()),
            ("lm_head.weight".to_string(), self.lm_head.clone()),
            ("lm_head.bias".to_string(), self.lm_head_bias.clone()),
        ]
    }

    fn trainable_variables(&self) -> Vec<(String, Var)> {
        self.named_variables()
            .into_iter()
            .filter(|(name, _)| self.embeddings_trainable || !name.starts_with("embed_tokens"))
            .collect()
    }

    fn force_embedding_gradients(&mut self) -> Result<(), ModelError> {
        if self.embed_tokens.dtype() != DType::F32 {
            let full = self.embed_tokens.as_tensor().to_dtype(DType::F32)?;
            self.embed_tokens = Var::from_tensor(&full)?;
        }
        self.embeddings_trainable = true;
        Ok(())
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn pad_token_id(&self) -> Option<u32> {
        self.config.pad_token_id
    }

    fn eos_token_id(&self) -> u32 {
        self.config.eos_token_id
    }

    fn device(&self) -> &Device {
        &self.device
    }
}
