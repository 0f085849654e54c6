use std::sync::Arc;

use finetune_core::{LossWindow, Objective, RunConfig, RunState};
use finetune_data_provider::{DataLoader, ValidationFrame};
use finetune_eval::{EvalRequest, EvalScores, EvaluationCoordinator};
use finetune_metrics::{ExperimentLogger, LogChannel};
use finetune_modeling::{
    Accelerator, CausalLM, CheckpointStore, GroupRole, GroupedAdamW, LrScheduler, StepContext,
    StepOutput,
};
use finetune_tui::training_progress_bar;
use indicatif::ProgressBar;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{StepExecutor, TrainingError};

const VALIDATION_MODE: &str = "validation";

/// Everything one worker trains with. Each worker owns its own replica.
#[derive(Debug)]
pub struct TrainingParts {
    pub model: Box<dyn CausalLM>,
    pub optimizer: GroupedAdamW,
    pub scheduler: LrScheduler,
    pub executor: StepExecutor,
    pub train_loader: DataLoader,
    pub eval_loader: DataLoader,
    pub validation_frame: Arc<ValidationFrame>,
    pub evaluator: EvaluationCoordinator,
    pub checkpoints: Box<dyn CheckpointStore>,
    /// Only the coordinator carries a logger.
    pub logger: Option<Box<dyn ExperimentLogger>>,
}

/// Drives one worker through the epoch loop: steps, periodic evaluation, best
/// checkpoint tracking and coordinator-side logging.
#[derive(Debug)]
pub struct TrainingOrchestrator {
    config: Arc<RunConfig>,
    accelerator: Accelerator,
    parts: TrainingParts,
    run_state: RunState,
    objective: Objective,
    losses: LossWindow<10>,
    cancel: CancellationToken,
}

impl TrainingOrchestrator {
    pub fn new(
        config: Arc<RunConfig>,
        accelerator: Accelerator,
        parts: TrainingParts,
        cancel: CancellationToken,
    ) -> Self {
        let run_state = RunState::new(
            config.seed(),
            accelerator.rank(),
            accelerator.world_size(),
            config.environment.number_of_workers,
        );
        let objective = Objective::new(parts.evaluator.metric().direction);
        Self {
            config,
            accelerator,
            parts,
            run_state,
            objective,
            losses: LossWindow::default(),
            cancel,
        }
    }

    pub fn model(&self) -> &dyn CausalLM {
        self.parts.model.as_ref()
    }

    pub fn accelerator(&self) -> &Accelerator {
        &self.accelerator
    }

    pub fn objective(&self) -> &Objective {
        &self.objective
    }

    pub fn run_state(&self) -> &RunState {
        &self.run_state
    }

    pub fn optimizer(&self) -> &GroupedAdamW {
        &self.parts.optimizer
    }

    pub fn logger_mut(&mut self) -> Option<&mut (dyn ExperimentLogger + 'static)> {
        self.parts.logger.as_deref_mut()
    }

    pub fn into_parts(self) -> (Accelerator, TrainingParts) {
        (self.accelerator, self.parts)
    }

    fn log(&mut self, channel: LogChannel, key: &str, value: f64) {
        if !self.accelerator.is_coordinator() {
            return;
        }
        let step = self.run_state.current_global_step();
        if let Some(logger) = self.parts.logger.as_mut() {
            logger.log(channel, key, value, step);
        }
    }

    fn check_cancelled(&self) -> Result<(), TrainingError> {
        if self.cancel.is_cancelled() {
            return Err(TrainingError::Cancelled);
        }
        Ok(())
    }

    fn evaluate(&mut self) -> Result<EvalScores, TrainingError> {
        let logger = self
            .parts
            .logger
            .as_mut()
            .map(|logger| &mut **logger as &mut dyn ExperimentLogger);
        let scores = self.parts.evaluator.evaluate(
            &self.run_state,
            &self.accelerator,
            self.parts.model.as_mut(),
            EvalRequest {
                loader: &self.parts.eval_loader,
                frame: &self.parts.validation_frame,
                mode: VALIDATION_MODE,
            },
            logger,
        )?;
        Ok(scores)
    }

    /// Saves a checkpoint when `metric` strictly beats the best value so far.
    fn track_best(&mut self, metric: f64) -> Result<(), TrainingError> {
        if !self.accelerator.is_coordinator() || !self.config.training.save_best_checkpoint {
            return Ok(());
        }
        if !self.objective.is_improvement(metric) {
            debug!(metric, best = self.objective.best(), "No improvement");
            return Ok(());
        }
        let path = self.parts.checkpoints.save(
            self.parts.model.as_ref(),
            &self.config.output_directory,
            &self.config,
        )?;
        info!(
            metric,
            previous = self.objective.best(),
            path = %path.display(),
            "Validation metric improved, saved checkpoint"
        );
        self.objective.record(metric);
        Ok(())
    }

    fn log_step(&mut self, output: &StepOutput, loss: f64) {
        if self.parts.executor.is_rlhf() {
            for (key, value) in output.iter() {
                if value.is_finite() {
                    self.log(LogChannel::Train, key, value);
                }
            }
        }
        self.log(LogChannel::Train, "loss", loss);
        if let Some(lr) = self.parts.optimizer.learning_rate(GroupRole::Base) {
            self.log(LogChannel::Meta, "lr", lr);
        }
        if !self.config.training.differential_learning_rate_layers.is_empty() {
            if let Some(lr) = self.parts.optimizer.learning_rate(GroupRole::Differential) {
                self.log(LogChannel::Meta, "lr_diff", lr);
            }
        }
        let step = self.run_state.current_global_step() as f64;
        self.log(LogChannel::Internal, "current_step", step);
    }

    /// Runs the whole training loop and returns the scores of the last evaluation.
    pub fn run(&mut self) -> Result<EvalScores, TrainingError> {
        let training = self.config.training.clone();
        let mut scores = EvalScores::default();

        if training.evaluate_before_training || training.epochs == 0 {
            if self.accelerator.is_coordinator() {
                info!("Evaluating before training");
            }
            scores = self.evaluate()?;
            self.parts.model.set_training(true);
        }

        let steps_per_epoch = self.parts.train_loader.len();
        let eval_interval = training.evaluation_interval(steps_per_epoch);
        let progress_every = (steps_per_epoch / 20).max(1);
        debug!(
            rank = self.accelerator.rank(),
            steps_per_epoch, eval_interval, "Starting training"
        );

        for epoch in 0..training.epochs {
            self.check_cancelled()?;
            let seed = self.run_state.epoch_seed(epoch);
            self.parts.train_loader.set_epoch_seed(seed);
            if self.accelerator.is_coordinator() {
                info!("Training Epoch: {}/{}", epoch + 1, training.epochs);
            }

            let mut progress: Option<ProgressBar> = Some(training_progress_bar(
                steps_per_epoch as u64,
                self.accelerator.is_coordinator(),
            ));
            let loader = self.parts.train_loader.clone();
            let dataset = loader.dataset().clone();

            for (itr, batch) in loader.iter().enumerate() {
                self.check_cancelled()?;
                let iteration = self.run_state.begin_iteration(training.batch_size);
                let batch = dataset.batch_to_device(batch?, self.accelerator.device())?;
                let last_in_epoch = itr + 1 == steps_per_epoch;

                let mut ctx = StepContext {
                    model: self.parts.model.as_mut(),
                    optimizer: &mut self.parts.optimizer,
                    scheduler: &mut self.parts.scheduler,
                    accelerator: &mut self.accelerator,
                };
                let output =
                    self.parts
                        .executor
                        .run(&batch, &mut ctx, dataset.as_ref(), last_in_epoch)?;
                let loss = output
                    .get(self.parts.executor.loss_key())
                    .unwrap_or(f64::NAN);

                if !self.parts.executor.is_rlhf()
                    && !loss.is_finite()
                    && iteration >= training.nan_warmup_iterations
                {
                    return Err(TrainingError::Divergence { iteration, loss });
                }
                self.losses.push(loss);

                if self.accelerator.is_coordinator() {
                    self.log_step(&output, loss);
                    if let Some(bar) = progress.as_ref() {
                        if (itr + 1) % progress_every == 0 || last_in_epoch {
                            bar.set_position(itr as u64 + 1);
                            bar.set_message(format!("train loss: {:.2}", self.losses.mean()));
                        }
                    }
                }

                if (itr + 1) % eval_interval == 0 {
                    if training.evaluation_epochs == 1.0 {
                        if let Some(bar) = progress.take() {
                            bar.finish();
                        }
                    }
                    scores = self.evaluate()?;
                    self.track_best(scores.metric)?;
                    self.parts.model.set_training(true);
                }
            }

            if let Some(bar) = progress.take() {
                bar.finish();
            }
            self.accelerator.wait_for_everyone()?;
            self.log(LogChannel::Internal, "epoch", (epoch + 1) as f64);
        }

        if self.accelerator.is_distributed() {
            self.accelerator.wait_for_everyone()?;
        }
        Ok(scores)
    }
}
