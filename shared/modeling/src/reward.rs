use candle_core::Device;
use tracing::debug;

use crate::{Autocast, ModelError};

pub trait RewardModel: Send + std::fmt::Debug {
    /// One score per `(prompt, response)` pair.
    fn get_score(
        &self,
        prompts: &[String],
        responses: &[String],
        autocast: Autocast,
    ) -> Result<Vec<f64>, ModelError>;

    fn to_device(&mut self, device: &Device) -> Result<(), ModelError>;
}

/// Where the reward model's weights currently live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// On the worker's compute device.
    Resident,
    /// Parked in host memory between scoring calls.
    Offloaded,
}

/// Owns a reward model and moves it between host and device around scoring.
#[derive(Debug)]
pub struct RewardScorer {
    model: Box<dyn RewardModel>,
    placement: Placement,
    offload: bool,
}

impl RewardScorer {
    pub fn new(
        mut model: Box<dyn RewardModel>,
        device: &Device,
        offload: bool,
    ) -> Result<Self, ModelError> {
        let placement = if offload {
            model.to_device(&Device::Cpu)?;
            Placement::Offloaded
        } else {
            model.to_device(device)?;
            Placement::Resident
        };
        Ok(Self {
            model,
            placement,
            offload,
        })
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    fn transition(&mut self, to: Placement, device: &Device) -> Result<(), ModelError> {
        if self.placement == to {
            return Ok(());
        }
        match to {
            Placement::Resident => self.model.to_device(device)?,
            Placement::Offloaded => self.model.to_device(&Device::Cpu)?,
        }
        debug!(from = ?self.placement, to = ?to, "Moved reward model");
        self.placement = to;
        Ok(())
    }

    /// Scores the pairs on `device`. With offloading enabled the model is moved in
    /// for the call and parked again afterwards, even if scoring failed.
    pub fn score(
        &mut self,
        device: &Device,
        prompts: &[String],
        responses: &[String],
        autocast: Autocast,
    ) -> Result<Vec<f64>, ModelError> {
        if self.offload {
            self.transition(Placement::Resident, device)?;
        }
        let scores = self.model.get_score(prompts, responses, autocast);
        if self.offload {
            self.transition(Placement::Offloaded, device)?;
        }
        scores
    }
}
