mod bigram;
mod overlap_reward;

pub use bigram::{BigramConfig, BigramLM};
pub use overlap_reward::OverlapRewardModel;
