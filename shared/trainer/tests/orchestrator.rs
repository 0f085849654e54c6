use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use approx::assert_relative_eq;
use candle_core::Device;
use finetune_core::{MixedPrecision, RunConfig, ScheduleKind};
use finetune_data_provider::{
    ByteTokenizer, ConversationDataset, ConversationRecord, DataLoader, DatasetMode,
    SupervisedDataset, ValidationFrame,
};
use finetune_eval::{EvalScores, EvaluationCoordinator, MetricRegistry};
use finetune_metrics::{ExperimentLogger, LogChannel, MemoryLogger};
use finetune_modeling::{
    Accelerator, BigramConfig, BigramLM, CausalLM, CheckpointError, CheckpointStore,
    DummyCounters, DummyModel, GenerationConfig, GroupedAdamW, LrScheduler, OptimizerSettings,
    OverlapRewardModel, Placement, PpoConfig, PpoTrainer, ProcessGroup, RewardScorer,
    WEIGHTS_FILE,
};
use finetune_trainer::{
    RlhfStep, StepExecutor, TrainingError, TrainingOrchestrator, TrainingParts,
};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default, Clone)]
struct RecordingStore {
    saves: Arc<AtomicUsize>,
}

impl CheckpointStore for RecordingStore {
    fn save(
        &self,
        _model: &dyn CausalLM,
        dir: &Path,
        _config: &RunConfig,
    ) -> Result<PathBuf, CheckpointError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(dir.join(WEIGHTS_FILE))
    }

    fn load(
        &self,
        _model: &mut dyn CausalLM,
        _path: &Path,
        _strict: bool,
    ) -> Result<(), CheckpointError> {
        Ok(())
    }
}

fn run_config(dir: &Path) -> RunConfig {
    let mut config = RunConfig::default();
    config.output_directory = dir.to_path_buf();
    config.environment.seed = 0;
    config.training.batch_size = 2;
    config.training.epochs = 1;
    config.training.learning_rate = 1e-2;
    config.prediction.metric = "Perplexity".to_string();
    config.prediction.max_new_tokens = 4;
    config
}

fn records(n: usize) -> Vec<ConversationRecord> {
    (0..n)
        .map(|i| ConversationRecord::new(format!("question {i}"), format!("answer {i}")))
        .collect()
}

fn bigram() -> BigramLM {
    let config = BigramConfig::new(
        ByteTokenizer::VOCAB_SIZE,
        8,
        Some(ByteTokenizer::PAD),
        ByteTokenizer::EOS,
    );
    BigramLM::new(config, 0, &Device::Cpu).unwrap()
}

struct Fixture {
    config: Arc<RunConfig>,
    group: ProcessGroup,
    train_rows: usize,
    eval_rows: usize,
    mode: DatasetMode,
}

impl Fixture {
    fn new(config: RunConfig, train_rows: usize) -> Self {
        let group = ProcessGroup::new(config.world_size(), Duration::from_secs(10));
        let mode = if config.training.use_rlhf {
            DatasetMode::Rlhf
        } else {
            DatasetMode::Supervised
        };
        Self {
            config: Arc::new(config),
            group,
            train_rows,
            eval_rows: 2,
            mode,
        }
    }

    fn orchestrator(
        &self,
        rank: usize,
        model: Box<dyn CausalLM>,
        executor: StepExecutor,
        logger: Option<Box<dyn ExperimentLogger>>,
        checkpoints: Box<dyn CheckpointStore>,
        cancel: CancellationToken,
    ) -> TrainingOrchestrator {
        let training = &self.config.training;
        let world_size = self.group.world_size();
        let train: Arc<dyn SupervisedDataset> = Arc::new(ConversationDataset::new(
            records(self.train_rows),
            32,
            self.mode,
        ));
        let frame = ValidationFrame::from_records(records(self.eval_rows));
        let eval: Arc<dyn SupervisedDataset> = Arc::new(ConversationDataset::from_frame(
            &frame,
            32,
            DatasetMode::Supervised,
        ));
        let train_loader = DataLoader::train(train, training.batch_size, rank, world_size);
        let eval_loader =
            DataLoader::eval(eval, self.config.inference_batch_size(), rank, world_size);

        let mut optimizer = GroupedAdamW::new(
            model.trainable_variables(),
            &OptimizerSettings::from_training(training),
        )
        .unwrap();
        let scheduler = LrScheduler::new(training.lr_schedule(train_loader.len()), &mut optimizer);
        let metric = MetricRegistry::builtin()
            .get(&self.config.prediction.metric)
            .unwrap();
        let evaluator = EvaluationCoordinator::new(
            metric,
            GenerationConfig::from_prediction(&self.config.prediction, 0),
            self.config.output_directory.clone(),
        );
        let accelerator = Accelerator::new(
            self.group.clone(),
            rank,
            Device::Cpu,
            MixedPrecision::No,
            training.grad_accumulation,
        );
        TrainingOrchestrator::new(
            self.config.clone(),
            accelerator,
            TrainingParts {
                model,
                optimizer,
                scheduler,
                executor,
                train_loader,
                eval_loader,
                validation_frame: Arc::new(frame),
                evaluator,
                checkpoints,
                logger,
            },
            cancel,
        )
    }

    fn supervised(&self, model: Box<dyn CausalLM>, logger: &MemoryLogger) -> TrainingOrchestrator {
        self.orchestrator(
            0,
            model,
            StepExecutor::supervised(&self.config.training),
            Some(Box::new(logger.clone())),
            Box::new(RecordingStore::default()),
            CancellationToken::new(),
        )
    }
}

fn dummy(train_losses: Vec<f32>, eval_losses: Vec<f32>) -> (Box<dyn CausalLM>, Arc<DummyCounters>) {
    let model = DummyModel::new(train_losses, eval_losses);
    let counters = model.counters();
    (Box::new(model), counters)
}

fn values(logger: &MemoryLogger, channel: LogChannel, key: &str) -> Vec<f64> {
    logger
        .values(channel, key)
        .into_iter()
        .map(|(_, value)| value)
        .collect()
}

#[test_log::test]
fn single_epoch_evaluates_once() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(run_config(dir.path()), 8);
    let logger = MemoryLogger::new();
    let (model, counters) = dummy(vec![1.0], vec![0.25]);

    let scores = fixture.supervised(model, &logger).run().unwrap();

    assert_eq!(counters.forward.load(Ordering::SeqCst), 4);
    assert_eq!(counters.inference.load(Ordering::SeqCst), 1);
    assert_relative_eq!(scores.loss, 0.25, epsilon = 1e-6);
    assert_relative_eq!(scores.metric, 0.25f64.exp(), epsilon = 1e-6);
    assert_eq!(
        values(&logger, LogChannel::Internal, "current_step"),
        vec![2.0, 4.0, 6.0, 8.0]
    );
    assert_eq!(values(&logger, LogChannel::Internal, "epoch"), vec![1.0]);
    assert!(dir.path().join("validation_predictions.json").exists());
}

#[test_log::test]
fn checkpoints_only_on_strict_improvement() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = run_config(dir.path());
    config.training.epochs = 3;
    config.training.save_best_checkpoint = true;
    let fixture = Fixture::new(config, 8);
    let store = RecordingStore::default();
    let logger = MemoryLogger::new();
    let (model, _) = dummy(vec![1.0], vec![1.0, 1.0, 0.5]);

    let mut orchestrator = fixture.orchestrator(
        0,
        model,
        StepExecutor::supervised(&fixture.config.training),
        Some(Box::new(logger.clone())),
        Box::new(store.clone()),
        CancellationToken::new(),
    );
    orchestrator.run().unwrap();

    assert_eq!(values(&logger, LogChannel::Validation, "Perplexity").len(), 3);
    assert_eq!(store.saves.load(Ordering::SeqCst), 2);
    assert_relative_eq!(orchestrator.objective().best(), 0.5f64.exp(), epsilon = 1e-6);
}

#[test_log::test]
fn nan_loss_inside_warmup_is_tolerated() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(run_config(dir.path()), 60);
    let mut losses = vec![1.0; 30];
    losses[5] = f32::NAN;
    let (model, counters) = dummy(losses, vec![1.0]);

    fixture.supervised(model, &MemoryLogger::new()).run().unwrap();
    assert_eq!(counters.forward.load(Ordering::SeqCst), 30);
}

#[test_log::test]
fn nan_loss_after_warmup_aborts() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(run_config(dir.path()), 60);
    let mut losses = vec![1.0; 30];
    losses[25] = f32::NAN;
    let (model, counters) = dummy(losses, vec![1.0]);

    let err = fixture
        .supervised(model, &MemoryLogger::new())
        .run()
        .unwrap_err();
    assert!(
        matches!(err, TrainingError::Divergence { iteration: 25, loss } if loss.is_nan()),
        "{err:?}"
    );
    assert_eq!(counters.inference.load(Ordering::SeqCst), 0);
}

#[test_log::test]
fn zero_epochs_only_evaluates() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = run_config(dir.path());
    config.training.epochs = 0;
    let fixture = Fixture::new(config, 8);
    let logger = MemoryLogger::new();
    let (model, counters) = dummy(vec![1.0], vec![0.75]);

    let scores = fixture.supervised(model, &logger).run().unwrap();

    assert_eq!(counters.forward.load(Ordering::SeqCst), 0);
    assert_eq!(counters.inference.load(Ordering::SeqCst), 1);
    assert_relative_eq!(scores.loss, 0.75, epsilon = 1e-6);
    assert_eq!(logger.values(LogChannel::Validation, "loss").len(), 1);
    assert!(values(&logger, LogChannel::Train, "loss").is_empty());
}

#[test_log::test]
fn accumulated_loss_is_scaled_down() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = run_config(dir.path());
    config.training.grad_accumulation = 4;
    let fixture = Fixture::new(config, 8);
    let logger = MemoryLogger::new();
    let (model, _) = dummy(vec![2.0], vec![1.0]);

    fixture.supervised(model, &logger).run().unwrap();

    let losses = values(&logger, LogChannel::Train, "loss");
    assert_eq!(losses.len(), 4);
    for loss in losses {
        assert_relative_eq!(loss, 0.5, epsilon = 1e-6);
    }
}

#[test_log::test]
fn differential_learning_rate_is_logged_every_step() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = run_config(dir.path());
    config.training.differential_learning_rate_layers = vec!["lm_head.bias".to_string()];
    config.training.differential_learning_rate = 1e-4;
    config.training.schedule = ScheduleKind::Constant;
    let fixture = Fixture::new(config, 8);
    let logger = MemoryLogger::new();

    fixture.supervised(Box::new(bigram()), &logger).run().unwrap();

    let lr = values(&logger, LogChannel::Meta, "lr");
    let lr_diff = values(&logger, LogChannel::Meta, "lr_diff");
    assert_eq!(lr.len(), 4);
    assert_eq!(lr_diff.len(), 4);
    for (base, differential) in lr.iter().zip(&lr_diff) {
        assert_relative_eq!(*base, 1e-2);
        assert_relative_eq!(*differential, 1e-4);
    }
}

#[test_log::test]
fn rlhf_run_logs_ppo_diagnostics_and_parks_reward_model() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = run_config(dir.path());
    config.training.use_rlhf = true;
    config.training.offload_reward_model = true;
    config.training.ppo_epochs = 2;
    let fixture = Fixture::new(config, 8);
    let logger = MemoryLogger::new();

    let training = &fixture.config.training;
    let scorer = RewardScorer::new(
        Box::new(OverlapRewardModel::new(&Device::Cpu).unwrap()),
        &Device::Cpu,
        training.offload_reward_model,
    )
    .unwrap();
    let policy = PpoTrainer::new(PpoConfig::from_training(training)).unwrap();
    let executor = StepExecutor::Rlhf(RlhfStep::new(
        scorer,
        Box::new(policy),
        GenerationConfig::from_prediction(&fixture.config.prediction, 0),
    ));
    let mut orchestrator = fixture.orchestrator(
        0,
        Box::new(bigram()),
        executor,
        Some(Box::new(logger.clone())),
        Box::new(RecordingStore::default()),
        CancellationToken::new(),
    );
    orchestrator.run().unwrap();

    let totals = values(&logger, LogChannel::Train, "ppo/loss/total");
    assert_eq!(totals.len(), 4);
    assert_eq!(values(&logger, LogChannel::Train, "loss"), totals);
    assert_eq!(values(&logger, LogChannel::Train, "ppo/mean_scores").len(), 4);

    let (_, parts) = orchestrator.into_parts();
    match parts.executor {
        StepExecutor::Rlhf(step) => assert_eq!(step.scorer().placement(), Placement::Offloaded),
        other => panic!("unexpected executor {other:?}"),
    }
}

#[test_log::test]
fn workers_advance_the_global_step_together() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = run_config(dir.path());
    config.environment.devices = vec!["cpu".to_string(), "cpu".to_string()];
    let fixture = Arc::new(Fixture::new(config, 8));
    let logger = MemoryLogger::new();

    let handles: Vec<_> = (0..2)
        .map(|rank| {
            let fixture = fixture.clone();
            let logger = logger.clone();
            thread::spawn(move || {
                let (model, counters) = dummy(vec![1.0], vec![0.5]);
                let logger: Option<Box<dyn ExperimentLogger>> =
                    (rank == 0).then(|| Box::new(logger) as Box<dyn ExperimentLogger>);
                let scores = fixture
                    .orchestrator(
                        rank,
                        model,
                        StepExecutor::supervised(&fixture.config.training),
                        logger,
                        Box::new(RecordingStore::default()),
                        CancellationToken::new(),
                    )
                    .run()
                    .unwrap();
                (scores, counters.forward.load(Ordering::SeqCst))
            })
        })
        .collect();
    let outcomes: Vec<(EvalScores, usize)> =
        handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_relative_eq!(outcomes[0].0.loss, 0.5, epsilon = 1e-6);
    assert_eq!(outcomes[1].0, EvalScores::default());
    for (_, forward_calls) in &outcomes {
        assert_eq!(*forward_calls, 2);
    }
    assert_eq!(
        values(&logger, LogChannel::Internal, "current_step"),
        vec![4.0, 8.0]
    );
}

#[test_log::test]
fn cancelled_run_stops_before_training() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(run_config(dir.path()), 8);
    let (model, counters) = dummy(vec![1.0], vec![1.0]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = fixture
        .orchestrator(
            0,
            model,
            StepExecutor::supervised(&fixture.config.training),
            None,
            Box::new(RecordingStore::default()),
            cancel,
        )
        .run()
        .unwrap_err();
    assert!(err.is_cancellation());
    assert_eq!(counters.forward.load(Ordering::SeqCst), 0);
}
