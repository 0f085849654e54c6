mod errors;
mod orchestrator;
mod step;

pub use errors::{StepError, TrainingError};
pub use orchestrator::{TrainingOrchestrator, TrainingParts};
pub use step::{strip_left_padding, strip_right_padding, RlhfStep, StepExecutor, SupervisedStep};
