use candle_core::{DType, Device, Var};
use finetune_core::TrainingConfig;
use finetune_data_provider::SupervisedDataset;
use finetune_modeling::{
    Batch, GenerationConfig, PolicyUpdateTrainer, RewardScorer, StepContext, StepOutput,
};
use tracing::trace;

use crate::StepError;

/// Drops the left padding of `ids`: everything before the first attended position.
/// A row with no attended position is kept whole.
pub fn strip_left_padding(ids: &[u32], attention_mask: &[u32]) -> Vec<u32> {
    match attention_mask.iter().position(|m| *m != 0) {
        Some(start) => ids[start..].to_vec(),
        None => ids.to_vec(),
    }
}

/// Cuts `ids` at the first `pad`. A row without padding is kept whole.
pub fn strip_right_padding(ids: &[u32], pad: u32) -> Vec<u32> {
    match ids.iter().position(|id| *id == pad) {
        Some(end) => ids[..end].to_vec(),
        None => ids.to_vec(),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisedStep {
    grad_accumulation: usize,
    gradient_clip: f64,
}

impl SupervisedStep {
    pub fn new(training: &TrainingConfig) -> Self {
        Self {
            grad_accumulation: training.grad_accumulation.max(1),
            gradient_clip: training.gradient_clip,
        }
    }

    fn run(
        &self,
        batch: &Batch,
        ctx: &mut StepContext<'_>,
        last_in_epoch: bool,
    ) -> Result<StepOutput, StepError> {
        let model = &mut *ctx.model;
        let optimizer = &mut *ctx.optimizer;
        let scheduler = &mut *ctx.scheduler;
        let vars: Vec<Var> = model
            .trainable_variables()
            .into_iter()
            .map(|(_, var)| var)
            .collect();
        ctx.accelerator.accumulate(last_in_epoch, |accelerator| {
            let output = accelerator.autocast(|autocast| model.forward(batch, autocast))?;
            let mut loss = output.loss;
            if self.grad_accumulation > 1 {
                loss = loss.affine(1.0 / self.grad_accumulation as f64, 0.0)?;
            }
            accelerator.backward(&loss, &vars)?;
            let value = loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;

            if self.gradient_clip > 0.0 && accelerator.sync_gradients() {
                let norm = accelerator.clip_grad_norm(self.gradient_clip, &vars)?;
                trace!(norm, "Clipped gradients");
            }
            if accelerator.step(optimizer)? {
                scheduler.step(optimizer);
            }
            accelerator.zero_grad();

            let mut output = StepOutput::new();
            output.insert("loss", value);
            Ok::<_, StepError>(output)
        })
    }
}

/// Generate, score, then update the policy on the scored rollouts.
#[derive(Debug)]
pub struct RlhfStep {
    scorer: RewardScorer,
    policy: Box<dyn PolicyUpdateTrainer>,
    generation: GenerationConfig,
}

impl RlhfStep {
    pub fn new(
        scorer: RewardScorer,
        policy: Box<dyn PolicyUpdateTrainer>,
        generation: GenerationConfig,
    ) -> Self {
        Self {
            scorer,
            policy,
            generation,
        }
    }

    pub fn scorer(&self) -> &RewardScorer {
        &self.scorer
    }

    fn run(
        &mut self,
        batch: &Batch,
        ctx: &mut StepContext<'_>,
        dataset: &dyn SupervisedDataset,
    ) -> Result<StepOutput, StepError> {
        let generated = ctx.model.generate(batch, &self.generation)?.detach();
        let predicted_text = dataset.postprocess_batch_predictions(&generated)?;

        let prompts = batch.text("reward_model_prompt_text")?;
        let device = ctx.accelerator.device().clone();
        let scorer = &mut self.scorer;
        let scores = ctx
            .accelerator
            .autocast(|autocast| scorer.score(&device, prompts, &predicted_text, autocast))?;

        let input_ids = batch
            .tensor("input_ids")?
            .to_device(&Device::Cpu)?
            .to_vec2::<u32>()?;
        let attention_mask = batch
            .tensor("attention_mask")?
            .to_device(&Device::Cpu)?
            .to_dtype(DType::U32)?
            .to_vec2::<u32>()?;
        let queries: Vec<Vec<u32>> = input_ids
            .iter()
            .zip(&attention_mask)
            .map(|(ids, mask)| strip_left_padding(ids, mask))
            .collect();

        let pad = ctx
            .model
            .pad_token_id()
            .unwrap_or_else(|| ctx.model.eos_token_id());
        let responses: Vec<Vec<u32>> = generated
            .to_device(&Device::Cpu)?
            .to_vec2::<u32>()?
            .iter()
            .map(|ids| strip_right_padding(ids, pad))
            .collect();
        let rewards: Vec<f32> = scores.iter().map(|score| *score as f32).collect();
        trace!(rollouts = rewards.len(), "Scored rollouts");

        Ok(self.policy.step(ctx, &queries, &responses, &rewards)?)
    }
}

/// How one training iteration turns a batch into parameter updates.
#[derive(Debug)]
pub enum StepExecutor {
    Supervised(SupervisedStep),
    Rlhf(RlhfStep),
}

impl StepExecutor {
    pub fn supervised(training: &TrainingConfig) -> Self {
        StepExecutor::Supervised(SupervisedStep::new(training))
    }

    pub fn is_rlhf(&self) -> bool {
        matches!(self, StepExecutor::Rlhf(_))
    }

    /// Key of the scalar reported as the training loss.
    pub fn loss_key(&self) -> &'static str {
        match self {
            StepExecutor::Supervised(_) => "loss",
            StepExecutor::Rlhf(_) => "ppo/loss/total",
        }
    }

    pub fn run(
        &mut self,
        batch: &Batch,
        ctx: &mut StepContext<'_>,
        dataset: &dyn SupervisedDataset,
        last_in_epoch: bool,
    ) -> Result<StepOutput, StepError> {
        match self {
            StepExecutor::Supervised(step) => step.run(batch, ctx, last_in_epoch),
            StepExecutor::Rlhf(step) => step.run(batch, ctx, dataset),
        }
    }
}
