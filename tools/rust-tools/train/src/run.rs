use std::{
    sync::{Arc, Once},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow};
use finetune_core::RunConfig;
use finetune_data_provider::{
    ByteTokenizer, ConversationDataset, DataLoader, DatasetMode, SupervisedDataset,
    ValidationFrame,
};
use finetune_eval::{EvalScores, EvaluationCoordinator, MetricRegistry, MetricSpec};
use finetune_metrics::{ExperimentLogger, LocalLogger, LogChannel, format_runtime, write_flag};
use finetune_modeling::{
    Accelerator, BigramConfig, BigramLM, CONFIG_FILE, CausalLM, CheckpointStore, DeviceSpec,
    DistributedError, GenerationConfig, GroupedAdamW, LrScheduler, OptimizerSettings,
    OverlapRewardModel, PpoConfig, PpoTrainer, ProcessGroup, RewardScorer, SafetensorsCheckpoint,
    parse_devices,
};
use finetune_trainer::{
    RlhfStep, StepExecutor, TrainingError, TrainingOrchestrator, TrainingParts,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How long workers wait for each other to come up.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(800);

pub const FLAGS_FILE: &str = "flags.json";

/// Cancels the process group and the run token, once.
#[derive(Debug)]
struct Teardown {
    group: ProcessGroup,
    cancel: CancellationToken,
    once: Once,
}

impl Teardown {
    fn trigger(&self, rank: usize) {
        self.once.call_once(|| {
            warn!(rank, "Tearing down the process group");
            self.group.cancel();
            self.cancel.cancel();
        });
    }
}

/// Triggers the teardown if the worker thread unwinds, so siblings blocked in
/// a collective are released without waiting for the parent to join this rank.
struct PanicGuard {
    teardown: Arc<Teardown>,
    rank: usize,
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!(rank = self.rank, "Worker panicked");
            self.teardown.trigger(self.rank);
        }
    }
}

/// Runs `work` on its own thread. Any failure, panics included, tears the group down.
fn spawn_worker<T, F>(rank: usize, teardown: Arc<Teardown>, work: F) -> JoinHandle<Result<T>>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    std::thread::spawn(move || {
        let _guard = PanicGuard {
            teardown: teardown.clone(),
            rank,
        };
        let result = work();
        if let Err(err) = &result {
            if !is_cancellation(err) {
                error!(rank, "Worker failed: {err:#}");
            }
            teardown.trigger(rank);
        }
        result
    })
}

/// Everything a worker thread needs, shared across the group.
#[derive(Clone)]
struct WorkerShared {
    config: Arc<RunConfig>,
    group: ProcessGroup,
    train: Arc<dyn SupervisedDataset>,
    validation: Arc<dyn SupervisedDataset>,
    frame: Arc<ValidationFrame>,
    metric: MetricSpec,
    cancel: CancellationToken,
}

/// Whether `err` only echoes a failure that happened somewhere else.
fn is_cancellation(err: &anyhow::Error) -> bool {
    if let Some(err) = err.downcast_ref::<TrainingError>() {
        return err.is_cancellation();
    }
    matches!(
        err.downcast_ref::<DistributedError>(),
        Some(DistributedError::Cancelled)
    )
}

fn load_frame(config: &RunConfig, path: &std::path::Path) -> Result<ValidationFrame> {
    let frame = ValidationFrame::load_jsonl(
        path,
        &config.dataset.prompt_column,
        &config.dataset.answer_column,
    )?;
    info!(path = %path.display(), rows = frame.len(), "Loaded dataset");
    Ok(frame)
}

pub fn run(config: RunConfig, cancel: CancellationToken) -> Result<()> {
    let start = Instant::now();
    let metric = MetricRegistry::builtin().get(&config.prediction.metric)?;
    std::fs::create_dir_all(&config.output_directory).with_context(|| {
        format!(
            "Failed to create output directory {}",
            config.output_directory.display()
        )
    })?;
    // The effective config is kept even when the run fails later on.
    let cfg = config.output_directory.join(CONFIG_FILE);
    config
        .save(&cfg)
        .with_context(|| format!("Failed to save config {}", cfg.display()))?;

    let mode = if config.training.use_rlhf {
        DatasetMode::Rlhf
    } else {
        DatasetMode::Supervised
    };
    let max_length = config.dataset.max_length;
    let train_frame = load_frame(&config, &config.dataset.train_path)?;
    let frame = load_frame(&config, &config.dataset.validation_path)?;
    let train: Arc<dyn SupervisedDataset> =
        Arc::new(ConversationDataset::from_frame(&train_frame, max_length, mode));
    let validation: Arc<dyn SupervisedDataset> = Arc::new(ConversationDataset::from_frame(
        &frame,
        max_length,
        DatasetMode::Supervised,
    ));

    let devices = parse_devices(&config.environment.devices)?;
    let group = ProcessGroup::new(devices.len(), JOIN_TIMEOUT);
    let teardown = Arc::new(Teardown {
        group: group.clone(),
        cancel: cancel.clone(),
        once: Once::new(),
    });

    // Ctrl-C has to unblock workers parked in a collective too.
    let finished = CancellationToken::new();
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
        runtime.spawn({
            let cancel = cancel.clone();
            let finished = finished.clone();
            let group = group.clone();
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => group.cancel(),
                    _ = finished.cancelled() => {}
                }
            }
        });
    }

    let shared = WorkerShared {
        config: Arc::new(config),
        group,
        train,
        validation,
        frame: Arc::new(frame),
        metric,
        cancel,
    };
    info!(world_size = devices.len(), "Spawning workers");
    let handles: Vec<JoinHandle<Result<EvalScores>>> = devices
        .into_iter()
        .enumerate()
        .map(|(rank, device)| {
            let shared = shared.clone();
            spawn_worker(rank, teardown.clone(), move || worker(rank, device, &shared))
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for (rank, handle) in handles.into_iter().enumerate() {
        let result = handle.join().unwrap_or_else(|_| {
            teardown.trigger(rank);
            Err(anyhow!("worker {rank} panicked"))
        });
        results.push(result);
    }
    finished.cancel();

    let mut errors: Vec<anyhow::Error> = results.into_iter().filter_map(Result::err).collect();
    if !errors.is_empty() {
        let root = errors
            .iter()
            .position(|err| !is_cancellation(err))
            .unwrap_or(0);
        return Err(errors.swap_remove(root));
    }

    let runtime = format_runtime(start.elapsed());
    let flags = shared.config.output_directory.join(FLAGS_FILE);
    write_flag(&flags, "status", "finished")?;
    write_flag(&flags, "info", &format!("Runtime: {runtime}"))?;
    info!(runtime, "Finished training");
    Ok(())
}

fn build_model(config: &RunConfig, device: &candle_core::Device) -> Result<BigramLM> {
    let mut model = BigramLM::new(
        BigramConfig::new(
            ByteTokenizer::VOCAB_SIZE,
            config.architecture.hidden_size,
            Some(ByteTokenizer::PAD),
            ByteTokenizer::EOS,
        ),
        config.seed(),
        device,
    )?;
    if let Some(path) = &config.architecture.pretrained_weights {
        SafetensorsCheckpoint
            .load(&mut model, path, false)
            .with_context(|| format!("Failed to load pretrained weights {}", path.display()))?;
    }
    if config.architecture.force_embedding_gradients {
        model.force_embedding_gradients()?;
    }
    Ok(model)
}

/// Planned training and validation samples across the whole group, in the
/// same unit as `current_step`.
fn run_totals(
    config: &RunConfig,
    train_batches: usize,
    eval_batches: usize,
    world_size: usize,
) -> (usize, usize) {
    let training = &config.training;
    let train = train_batches * training.epochs * training.batch_size * world_size;
    let validation = eval_batches
        * training.number_of_evaluations(train_batches)
        * config.inference_batch_size()
        * world_size;
    (train, validation)
}

fn coordinator_logger(
    config: &RunConfig,
    train_loader: &DataLoader,
    eval_loader: &DataLoader,
    world_size: usize,
) -> Box<dyn ExperimentLogger> {
    let mut logger = LocalLogger::new(&config.output_directory);
    let (total_training_steps, total_validation_steps) =
        run_totals(config, train_loader.len(), eval_loader.len(), world_size);
    logger.log(
        LogChannel::Internal,
        "total_training_steps",
        total_training_steps as f64,
        0,
    );
    logger.log(
        LogChannel::Internal,
        "total_validation_steps",
        total_validation_steps as f64,
        0,
    );
    logger.log(
        LogChannel::Internal,
        "global_start_time",
        chrono::Utc::now().timestamp() as f64,
        0,
    );
    Box::new(logger)
}

fn worker(rank: usize, device: DeviceSpec, shared: &WorkerShared) -> Result<EvalScores> {
    let config = &shared.config;
    let training = &config.training;
    let world_size = shared.group.world_size();

    shared.group.join(rank)?;
    info!(rank, %device, "Worker joined");
    let device = device.open()?;
    let accelerator = Accelerator::new(
        shared.group.clone(),
        rank,
        device.clone(),
        config.environment.mixed_precision,
        training.grad_accumulation,
    );

    let model = build_model(config, &device)?;
    let train_loader = DataLoader::train(shared.train.clone(), training.batch_size, rank, world_size);
    let eval_loader = DataLoader::eval(
        shared.validation.clone(),
        config.inference_batch_size(),
        rank,
        world_size,
    );

    let mut optimizer = GroupedAdamW::new(
        model.trainable_variables(),
        &OptimizerSettings::from_training(training),
    )?;
    let scheduler = LrScheduler::new(training.lr_schedule(train_loader.len()), &mut optimizer);
    let generation = GenerationConfig::from_prediction(&config.prediction, config.seed());
    let executor = if training.use_rlhf {
        let reward_model = OverlapRewardModel::new(&device)?;
        let scorer = RewardScorer::new(
            Box::new(reward_model),
            &device,
            training.offload_reward_model,
        )?;
        let policy = PpoTrainer::new(PpoConfig::from_training(training))?;
        StepExecutor::Rlhf(RlhfStep::new(scorer, Box::new(policy), generation.clone()))
    } else {
        StepExecutor::supervised(training)
    };

    let logger = accelerator
        .is_coordinator()
        .then(|| coordinator_logger(config, &train_loader, &eval_loader, world_size));
    let evaluator = EvaluationCoordinator::new(
        shared.metric.clone(),
        generation,
        config.output_directory.clone(),
    );

    let mut orchestrator = TrainingOrchestrator::new(
        config.clone(),
        accelerator,
        TrainingParts {
            model: Box::new(model),
            optimizer,
            scheduler,
            executor,
            train_loader,
            eval_loader,
            validation_frame: shared.frame.clone(),
            evaluator,
            checkpoints: Box::new(SafetensorsCheckpoint),
            logger,
        },
        shared.cancel.clone(),
    );
    let scores = orchestrator.run()?;

    if orchestrator.accelerator().is_coordinator() {
        if let Some(logger) = orchestrator.logger_mut() {
            logger.reset_external();
        }
        if !training.save_best_checkpoint {
            let path = SafetensorsCheckpoint.save(
                orchestrator.model(),
                &config.output_directory,
                config,
            )?;
            info!(path = %path.display(), "Saved last checkpoint");
        }
        info!(
            loss = scores.loss,
            metric = shared.metric.name,
            value = scores.metric,
            "Final validation scores"
        );
    }
    Ok(scores)
}
