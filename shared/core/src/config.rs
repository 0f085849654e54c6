use std::path::{Path, PathBuf};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::{LearningRateSchedule, ScheduleKind};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid override \"{0}\", expected section.key=value")]
    InvalidOverride(String),

    #[error("unknown config section \"{0}\"")]
    UnknownSection(String),

    #[error("RLHF is not supported with force_embedding_gradients.")]
    RlhfWithEmbeddingGradients,

    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: String,
    },
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MixedPrecision {
    #[default]
    No,
    Fp16,
    Bf16,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Negative values draw a random seed at startup.
    pub seed: i64,
    /// One worker is spawned per entry: `cpu`, `cuda`, `cuda:N`, `metal`, `metal:N`.
    pub devices: Vec<String>,
    pub mixed_precision: MixedPrecision,
    /// Data-loading workers per device; only enters the per-epoch seed.
    pub number_of_workers: usize,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            seed: -1,
            devices: vec!["cpu".to_string()],
            mixed_precision: MixedPrecision::No,
            number_of_workers: 1,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DatasetConfig {
    pub train_path: PathBuf,
    pub validation_path: PathBuf,
    pub prompt_column: String,
    pub answer_column: String,
    pub max_length: usize,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            train_path: PathBuf::from("data/train.jsonl"),
            validation_path: PathBuf::from("data/validation.jsonl"),
            prompt_column: "prompt".to_string(),
            answer_column: "answer".to_string(),
            max_length: 256,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ArchitectureConfig {
    pub hidden_size: usize,
    pub pretrained_weights: Option<PathBuf>,
    pub force_embedding_gradients: bool,
}

impl Default for ArchitectureConfig {
    fn default() -> Self {
        Self {
            hidden_size: 64,
            pretrained_weights: None,
            force_embedding_gradients: false,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub grad_accumulation: usize,
    pub learning_rate: f64,
    pub differential_learning_rate_layers: Vec<String>,
    pub differential_learning_rate: f64,
    pub weight_decay: f64,
    pub gradient_clip: f64,
    pub schedule: ScheduleKind,
    pub warmup_epochs: f64,
    /// Fraction of an epoch between evaluations, in `(0, 1]`.
    pub evaluation_epochs: f64,
    pub evaluate_before_training: bool,
    pub save_best_checkpoint: bool,
    /// Non-finite supervised losses are tolerated before this many iterations.
    pub nan_warmup_iterations: u64,
    pub use_rlhf: bool,
    pub offload_reward_model: bool,
    pub ppo_epochs: usize,
    pub ppo_clip: f64,
    pub value_learning_rate: f64,
    pub value_loss_coef: f64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 1,
            batch_size: 4,
            grad_accumulation: 1,
            learning_rate: 1e-3,
            differential_learning_rate_layers: Vec::new(),
            differential_learning_rate: 1e-5,
            weight_decay: 0.0,
            gradient_clip: 0.0,
            schedule: ScheduleKind::Cosine,
            warmup_epochs: 0.0,
            evaluation_epochs: 1.0,
            evaluate_before_training: false,
            save_best_checkpoint: false,
            nan_warmup_iterations: 20,
            use_rlhf: false,
            offload_reward_model: false,
            ppo_epochs: 4,
            ppo_clip: 0.2,
            value_learning_rate: 1e-2,
            value_loss_coef: 0.1,
        }
    }
}

impl TrainingConfig {
    /// Evaluation cadence in iterations, never zero.
    pub fn evaluation_interval(&self, steps_per_epoch: usize) -> usize {
        ((steps_per_epoch as f64 * self.evaluation_epochs).round() as usize).max(1)
    }

    /// Number of evaluations a run performs, including the pre-training one.
    pub fn number_of_evaluations(&self, steps_per_epoch: usize) -> usize {
        let interval = self.evaluation_interval(steps_per_epoch);
        self.epochs * (steps_per_epoch / interval) + usize::from(self.evaluate_before_training)
    }

    /// The optimizer only steps on synchronizing micro-steps, so the schedule is
    /// measured in accumulation windows.
    pub fn lr_schedule(&self, steps_per_epoch: usize) -> LearningRateSchedule {
        let optimizer_steps_per_epoch =
            steps_per_epoch.div_ceil(self.grad_accumulation.max(1)) as u64;
        let total_steps = optimizer_steps_per_epoch * self.epochs as u64;
        let warmup_steps = (self.warmup_epochs * optimizer_steps_per_epoch as f64).round() as u64;
        LearningRateSchedule::new(self.schedule, warmup_steps, total_steps)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct PredictionConfig {
    pub metric: String,
    pub max_new_tokens: usize,
    pub do_sample: bool,
    pub temperature: f64,
    /// Zero reuses the training batch size.
    pub batch_size_inference: usize,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            metric: "Perplexity".to_string(),
            max_new_tokens: 32,
            do_sample: false,
            temperature: 1.0,
            batch_size_inference: 0,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_file: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    pub experiment_name: String,
    pub output_directory: PathBuf,
    pub environment: EnvironmentConfig,
    pub dataset: DatasetConfig,
    pub architecture: ArchitectureConfig,
    pub training: TrainingConfig,
    pub prediction: PredictionConfig,
    pub logging: LoggingConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            experiment_name: "finetune".to_string(),
            output_directory: PathBuf::from("output"),
            environment: EnvironmentConfig::default(),
            dataset: DatasetConfig::default(),
            architecture: ArchitectureConfig::default(),
            training: TrainingConfig::default(),
            prediction: PredictionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

const SECTIONS: [&str; 6] = [
    "environment",
    "dataset",
    "architecture",
    "training",
    "prediction",
    "logging",
];

impl RunConfig {
    /// Parses a TOML document and applies `section.key=value` overrides on top.
    pub fn from_toml_str(source: &str, overrides: &[String]) -> Result<Self, ConfigError> {
        let mut table: toml::Table = toml::from_str(source)?;
        for raw in overrides {
            apply_override(&mut table, raw)?;
        }
        Ok(toml::Value::Table(table).try_into()?)
    }

    pub fn load(path: &Path, overrides: &[String]) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source, overrides)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Resolves derived settings; call once, before validation.
    pub fn normalize(&mut self) {
        if self.training.epochs == 0 {
            self.training.evaluate_before_training = true;
        }
        if self.training.save_best_checkpoint && self.training.evaluation_epochs != 1.0 {
            info!(
                evaluation_epochs = self.training.evaluation_epochs,
                "Saving the best checkpoint requires evaluating once per epoch"
            );
            self.training.evaluation_epochs = 1.0;
        }
        if self.environment.seed < 0 {
            self.environment.seed = rand::rng().random_range(0..1_000_000);
        }
        if self.environment.devices.is_empty() {
            warn!("No devices configured, falling back to cpu");
            self.environment.devices.push("cpu".to_string());
        }
    }

    /// Pre-flight checks for settings that cannot be trained with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.architecture.force_embedding_gradients && self.training.use_rlhf {
            return Err(ConfigError::RlhfWithEmbeddingGradients);
        }
        let training = &self.training;
        if training.batch_size == 0 {
            return invalid("training.batch_size", "must be at least 1");
        }
        if training.grad_accumulation == 0 {
            return invalid("training.grad_accumulation", "must be at least 1");
        }
        if !(training.evaluation_epochs > 0.0 && training.evaluation_epochs <= 1.0) {
            return invalid(
                "training.evaluation_epochs",
                format!("{} is outside (0, 1]", training.evaluation_epochs),
            );
        }
        if training.gradient_clip < 0.0 || !training.gradient_clip.is_finite() {
            return invalid("training.gradient_clip", "must be a finite value >= 0");
        }
        if training.use_rlhf && training.ppo_epochs == 0 {
            return invalid("training.ppo_epochs", "must be at least 1");
        }
        if self.dataset.max_length < 2 {
            return invalid("dataset.max_length", "must be at least 2");
        }
        if self.prediction.max_new_tokens == 0 {
            return invalid("prediction.max_new_tokens", "must be at least 1");
        }
        if self.environment.devices.is_empty() {
            return invalid("environment.devices", "at least one device is required");
        }
        Ok(())
    }

    pub fn seed(&self) -> u64 {
        self.environment.seed.max(0) as u64
    }

    pub fn world_size(&self) -> usize {
        self.environment.devices.len()
    }

    pub fn inference_batch_size(&self) -> usize {
        match self.prediction.batch_size_inference {
            0 => self.training.batch_size,
            n => n,
        }
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> Result<(), ConfigError> {
    Err(ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    })
}

fn apply_override(table: &mut toml::Table, raw: &str) -> Result<(), ConfigError> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| ConfigError::InvalidOverride(raw.to_string()))?;
    let value = parse_override_value(value.trim());
    let path: Vec<&str> = key.trim().split('.').collect();
    match path.as_slice() {
        [field] if !field.is_empty() => {
            table.insert(field.to_string(), value);
        }
        [section, field] if !field.is_empty() => {
            if !SECTIONS.contains(section) {
                return Err(ConfigError::UnknownSection(section.to_string()));
            }
            let entry = table
                .entry(section.to_string())
                .or_insert_with(|| toml::Value::Table(toml::Table::new()));
            let toml::Value::Table(section_table) = entry else {
                return Err(ConfigError::InvalidOverride(raw.to_string()));
            };
            section_table.insert(field.to_string(), value);
        }
        _ => return Err(ConfigError::InvalidOverride(raw.to_string())),
    }
    Ok(())
}

/// Values are read as TOML literals; anything that doesn't parse is taken as a string.
fn parse_override_value(raw: &str) -> toml::Value {
    toml::from_str::<toml::Table>(&format!("value = {raw}"))
        .ok()
        .and_then(|mut parsed| parsed.remove("value"))
        .unwrap_or_else(|| toml::Value::String(raw.to_string()))
}
