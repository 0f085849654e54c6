mod accelerator;
mod batch;
mod causal_lm;
mod checkpoint;
mod device_utils;
mod distributed;
mod dummy;
mod errors;
mod models;
mod optimizer;
mod ppo;
mod reward;

pub use accelerator::Accelerator;
pub use batch::{Batch, EvalOutput, StepOutput};
pub use causal_lm::{Autocast, CausalLM, GenerationConfig, ModelOutput};
pub use checkpoint::{CheckpointStore, SafetensorsCheckpoint, CONFIG_FILE, WEIGHTS_FILE};
pub use device_utils::{has_cuda, has_metal, parse_device, parse_devices, DeviceSpec};
pub use distributed::ProcessGroup;
pub use dummy::{DummyCounters, DummyModel};
pub use errors::{CheckpointError, DistributedError, ModelError, PolicyError};
pub use models::{BigramConfig, BigramLM, OverlapRewardModel};
pub use optimizer::{GroupRole, GroupedAdamW, LrScheduler, OptimizerSettings};
pub use ppo::{PolicyUpdateTrainer, PpoConfig, PpoTrainer, StepContext};
pub use reward::{Placement, RewardModel, RewardScorer};
