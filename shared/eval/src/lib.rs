mod coordinator;
mod errors;
mod metrics;

pub use coordinator::{run_inference, EvalRequest, EvalScores, EvaluationCoordinator};
pub use errors::EvalError;
pub use metrics::{MetricRegistry, MetricSpec, Reduction};
