use candle_core::{DType, Device, Tensor};

use crate::{Autocast, ModelError, RewardModel};

/// Rewards responses for reusing bytes of their prompt, weighted per byte value.
#[derive(Debug)]
pub struct OverlapRewardModel {
    byte_weights: Tensor,
    device: Device,
}

impl OverlapRewardModel {
    pub fn new(device: &Device) -> Result<Self, ModelError> {
        Ok(Self {
            byte_weights: Tensor::ones(256, DType::F32, device)?,
            device: device.clone(),
        })
    }

    pub fn with_weights(weights: &[f32; 256], device: &Device) -> Result<Self, ModelError> {
        Ok(Self {
            byte_weights: Tensor::new(weights.as_slice(), device)?,
            device: device.clone(),
        })
    }

    fn score_one(&self, prompt: &str, response: &str, autocast: Autocast) -> Result<f64, ModelError> {
        if response.is_empty() {
            return Ok(0.0);
        }
        let mut presence = vec![0f32; 256];
        for byte in prompt.bytes() {
            presence[byte as usize] = 1.0;
        }
        let presence = Tensor::new(presence, &self.device)?;
        let ids: Vec<u32> = response.bytes().map(u32::from).collect();
        let ids = Tensor::new(ids, &self.device)?;
        let dtype = autocast.dtype();
        let weighted = (self.byte_weights.to_dtype(dtype)?.index_select(&ids, 0)?
            * presence.to_dtype(dtype)?.index_select(&ids, 0)?)?;
        Ok(weighted
            .to_dtype(DType::F32)?
            .mean_all()?
            .to_scalar::<f32>()? as f64)
    }
}

impl RewardModel for OverlapRewardModel {
    fn get_score(
        &self,
        prompts: &[String],
        responses: &[String],
        autocast: Autocast,
    ) -> Result<Vec<f64>, ModelError> {
        if prompts.len() != responses.len() {
            return Err(ModelError::Shape {
                name: "reward inputs".to_string(),
                reason: format!("{} prompts, {} responses", prompts.len(), responses.len()),
            });
        }
        prompts
            .iter()
            .zip(responses)
            .map(|(prompt, response)| self.score_one(prompt, response, autocast))
            .collect()
    }

    fn to_device(&mut self, device: &Device) -> Result<(), ModelError> {
        self.byte_weights = self.byte_weights.to_device(device)?;
        self.device = device.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn scores_fraction_of_reused_bytes() {
        let model = OverlapRewardModel::new(&Device::Cpu).unwrap();
        let scores = model
            .get_score(
                &["abc".to_string(), "abc".to_string(), "abc".to_string()],
                &["abab".to_string(), "axyz".to_string(), String::new()],
                Autocast::full(),
            )
            .unwrap();
        assert_relative_eq!(scores[0], 1.0);
        assert_relative_eq!(scores[1], 0.25);
        assert_relative_eq!(scores[2], 0.0);
    }

    #[test]
    fn mismatched_inputs_are_rejected() {
        let model = OverlapRewardModel::new(&Device::Cpu).unwrap();
        assert!(model
            .get_score(&["a".to_string()], &[], Autocast::full())
            .is_err());
    }
}
