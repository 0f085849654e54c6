mod barrier;
mod config;
mod data_shuffle;
mod loss_window;
mod lr_schedule;
mod objective;
mod run_state;

pub use barrier::{Barrier, CancellableBarrier, CancelledBarrier};
pub use config::{
    ArchitectureConfig, ConfigError, DatasetConfig, EnvironmentConfig, LoggingConfig,
    MixedPrecision, PredictionConfig, RunConfig, TrainingConfig,
};
pub use data_shuffle::Shuffle;
pub use loss_window::LossWindow;
pub use lr_schedule::{LearningRateSchedule, ScheduleKind};
pub use objective::{Objective, ObjectiveDirection};
pub use run_state::RunState;
