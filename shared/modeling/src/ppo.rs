use candle_core::{DType, Tensor, Var};
use candle_nn::{Optimizer, SGD};
use finetune_core::TrainingConfig;
use tracing::{debug, trace};

use crate::{
    Accelerator, Autocast, CausalLM, GroupedAdamW, LrScheduler, PolicyError, StepOutput,
};

/// Everything a training step mutates, borrowed for the duration of one step.
pub struct StepContext<'a> {
    pub model: &'a mut dyn CausalLM,
    pub optimizer: &'a mut GroupedAdamW,
    pub scheduler: &'a mut LrScheduler,
    pub accelerator: &'a mut Accelerator,
}

/// Turns scored `(query, response)` pairs into policy updates.
///
/// Implementations own their optimizer steps: the orchestrator does not step the
/// optimizer or scheduler after an RLHF step.
pub trait PolicyUpdateTrainer: Send + std::fmt::Debug {
    fn step(
        &mut self,
        ctx: &mut StepContext<'_>,
        queries: &[Vec<u32>],
        responses: &[Vec<u32>],
        rewards: &[f32],
    ) -> Result<StepOutput, PolicyError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PpoConfig {
    pub ppo_epochs: usize,
    pub clip_range: f64,
    pub value_learning_rate: f64,
    pub value_coef: f64,
    /// Zero disables clipping.
    pub max_grad_norm: f64,
}

impl PpoConfig {
    pub fn from_training(training: &TrainingConfig) -> Self {
        Self {
            ppo_epochs: training.ppo_epochs.max(1),
            clip_range: training.ppo_clip,
            value_learning_rate: training.value_learning_rate,
            value_coef: training.value_loss_coef,
            max_grad_norm: training.gradient_clip,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct EpochStats {
    policy_loss: f64,
    clipfrac: f64,
    approxkl: f64,
}

/// Clipped-ratio policy optimization against a learned scalar reward baseline.
///
/// The baseline is fit on the rewards of the whole group, so every replica keeps
/// the same value estimate without synchronizing its gradient.
pub struct PpoTrainer {
    config: PpoConfig,
    baseline: Var,
    baseline_optimizer: SGD,
}

impl std::fmt::Debug for PpoTrainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PpoTrainer")
            .field("config", &self.config)
            .field("baseline", &self.baseline_value().ok())
            .finish()
    }
}

impl PpoTrainer {
    pub fn new(config: PpoConfig) -> Result<Self, PolicyError> {
        let baseline = Var::zeros(1, DType::F32, &candle_core::Device::Cpu)?;
        let baseline_optimizer = SGD::new(vec![baseline.clone()], config.value_learning_rate)?;
        Ok(Self {
            config,
            baseline,
            baseline_optimizer,
        })
    }

    pub fn config(&self) -> &PpoConfig {
        &self.config
    }

    pub fn baseline_value(&self) -> Result<f64, PolicyError> {
        Ok(self.baseline.as_tensor().to_vec1::<f32>()?[0] as f64)
    }

    fn advantages(&self, local: &[f32], global: &[f32]) -> Result<Vec<f64>, PolicyError> {
        let value = self.baseline_value()?;
        let raw: Vec<f64> = local.iter().map(|r| *r as f64 - value).collect();
        if global.len() < 2 {
            return Ok(raw);
        }
        let centered: Vec<f64> = global.iter().map(|r| *r as f64 - value).collect();
        let mean = centered.iter().sum::<f64>() / centered.len() as f64;
        let var = centered.iter().map(|a| (a - mean).powi(2)).sum::<f64>()
            / (centered.len() - 1) as f64;
        let std = var.sqrt();
        if std < 1e-8 {
            return Ok(raw.into_iter().map(|a| a - mean).collect());
        }
        Ok(raw.into_iter().map(|a| (a - mean) / std).collect())
    }

    fn fit_baseline(&mut self, rewards: &[f32]) -> Result<f64, PolicyError> {
        if rewards.is_empty() {
            return Ok(0.0);
        }
        let targets = Tensor::new(rewards, &candle_core::Device::Cpu)?;
        let predicted = self.baseline.as_tensor().broadcast_as(rewards.len())?;
        let loss = (predicted - targets)?.sqr()?.mean_all()?;
        let value_loss = loss.to_scalar::<f32>()? as f64;
        self.baseline_optimizer.backward_step(&loss)?;
        Ok(value_loss)
    }
}

fn zero_loss(model: &dyn CausalLM) -> Result<Tensor, PolicyError> {
    let mut total: Option<Tensor> = None;
    for (_, var) in model.trainable_variables() {
        let term = var.as_tensor().to_dtype(DType::F32)?.sum_all()?.affine(0.0, 0.0)?;
        total = Some(match total {
            Some(acc) => (acc + term)?,
            None => term,
        });
    }
    match total {
        Some(total) => Ok(total),
        None => Ok(Tensor::zeros((), DType::F32, model.device())?),
    }
}

struct Sample {
    index: usize,
    old_log_probs: Tensor,
}

fn policy_loss(
    model: &dyn CausalLM,
    samples: &[Sample],
    queries: &[Vec<u32>],
    responses: &[Vec<u32>],
    advantages: &[f64],
    clip_range: f64,
    autocast: Autocast,
) -> Result<(Tensor, EpochStats), PolicyError> {
    if samples.is_empty() {
        return Ok((zero_loss(model)?, EpochStats::default()));
    }
    let mut losses = Vec::with_capacity(samples.len());
    let mut clipped_tokens = 0usize;
    let mut tokens = 0usize;
    let mut kl_sum = 0.0f64;
    for sample in samples {
        let new_log_probs =
            model.response_log_probs(&queries[sample.index], &responses[sample.index], autocast)?;
        let log_ratio = (&new_log_probs - &sample.old_log_probs)?;
        let ratio = log_ratio.exp()?;
        let advantage = advantages[sample.index];
        let unclipped = ratio.affine(-advantage, 0.0)?;
        let clipped = ratio
            .clamp(1.0 - clip_range, 1.0 + clip_range)?
            .affine(-advantage, 0.0)?;
        losses.push(unclipped.maximum(&clipped)?.mean_all()?);

        let ratios = ratio.detach().to_vec1::<f32>()?;
        clipped_tokens += ratios
            .iter()
            .filter(|r| ((**r as f64) - 1.0).abs() > clip_range)
            .count();
        tokens += ratios.len();
        kl_sum += log_ratio.detach().sqr()?.sum_all()?.to_scalar::<f32>()? as f64 * 0.5;
    }
    let loss = Tensor::stack(&losses, 0)?.mean_all()?;
    let stats = EpochStats {
        policy_loss: loss.to_scalar::<f32>()? as f64,
        clipfrac: clipped_tokens as f64 / tokens.max(1) as f64,
        approxkl: kl_sum / tokens.max(1) as f64,
    };
    Ok((loss, stats))
}

impl PolicyUpdateTrainer for PpoTrainer {
    fn step(
        &mut self,
        ctx: &mut StepContext<'_>,
        queries: &[Vec<u32>],
        responses: &[Vec<u32>],
        rewards: &[f32],
    ) -> Result<StepOutput, PolicyError> {
        if queries.len() != responses.len() || queries.len() != rewards.len() {
            return Err(PolicyError::LengthMismatch {
                queries: queries.len(),
                responses: responses.len(),
                rewards: rewards.len(),
            });
        }
        let model = &mut *ctx.model;
        let optimizer = &mut *ctx.optimizer;
        let scheduler = &mut *ctx.scheduler;
        let accelerator = &mut *ctx.accelerator;
        let autocast = accelerator.autocast(|autocast| autocast);

        let all_rewards: Vec<f32> = accelerator.gather(rewards.to_vec())?.concat();
        let mean_scores = if all_rewards.is_empty() {
            0.0
        } else {
            all_rewards.iter().map(|r| *r as f64).sum::<f64>() / all_rewards.len() as f64
        };
        let value = self.baseline_value()?;
        let advantages = self.advantages(rewards, &all_rewards)?;

        let mut samples = Vec::new();
        for (index, (query, response)) in queries.iter().zip(responses).enumerate() {
            if query.is_empty() || response.is_empty() {
                trace!(index, "Skipping sample with empty query or response");
                continue;
            }
            let old_log_probs = model.response_log_probs(query, response, autocast)?.detach();
            samples.push(Sample {
                index,
                old_log_probs,
            });
        }

        let vars: Vec<Var> = model
            .trainable_variables()
            .into_iter()
            .map(|(_, var)| var)
            .collect();
        let mut totals = EpochStats::default();
        for _ in 0..self.config.ppo_epochs {
            let stats = accelerator.accumulate(true, |accelerator| {
                let (loss, stats) = policy_loss(
                    &*model,
                    &samples,
                    queries,
                    responses,
                    &advantages,
                    self.config.clip_range,
                    autocast,
                )?;
                accelerator.backward(&loss, &vars)?;
                if self.config.max_grad_norm > 0.0 {
                    accelerator.clip_grad_norm(self.config.max_grad_norm, &vars)?;
                }
                accelerator.step(optimizer)?;
                accelerator.zero_grad();
                Ok::<_, PolicyError>(stats)
            })?;
            totals.policy_loss += stats.policy_loss;
            totals.clipfrac += stats.clipfrac;
            totals.approxkl += stats.approxkl;
        }
        scheduler.step(optimizer);

        let epochs = self.config.ppo_epochs as f64;
        let value_loss = self.fit_baseline(&all_rewards)? * self.config.value_coef;
        let policy = totals.policy_loss / epochs;
        debug!(
            samples = samples.len(),
            policy_loss = policy,
            value_loss,
            "PPO step"
        );

        let mut output = StepOutput::new();
        output.insert("ppo/loss/total", policy + value_loss);
        output.insert("ppo/loss/policy", policy);
        output.insert("ppo/loss/value", value_loss);
        output.insert("ppo/policy/clipfrac", totals.clipfrac / epochs);
        output.insert("ppo/policy/approxkl", totals.approxkl / epochs);
        output.insert("ppo/mean_scores", mean_scores);
        output.insert("ppo/val/value", value);
        Ok(output)
    }
}
