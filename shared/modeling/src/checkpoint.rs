use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
};

use candle_core::{Device, Tensor};
use finetune_core::RunConfig;
use tracing::{info, warn};

use crate::{CausalLM, CheckpointError};

pub const WEIGHTS_FILE: &str = "checkpoint.safetensors";
pub const CONFIG_FILE: &str = "cfg.toml";

pub trait CheckpointStore: Send + Sync + std::fmt::Debug {
    /// Writes the model weights and the run config into `dir`; returns the weights path.
    fn save(
        &self,
        model: &dyn CausalLM,
        dir: &Path,
        config: &RunConfig,
    ) -> Result<PathBuf, CheckpointError>;

    /// Loads weights from `path` into `model`. Non-strict loads skip tensors that are
    /// missing or unknown and warn about them.
    fn load(&self, model: &mut dyn CausalLM, path: &Path, strict: bool)
        -> Result<(), CheckpointError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SafetensorsCheckpoint;

impl CheckpointStore for SafetensorsCheckpoint {
    fn save(
        &self,
        model: &dyn CausalLM,
        dir: &Path,
        config: &RunConfig,
    ) -> Result<PathBuf, CheckpointError> {
        std::fs::create_dir_all(dir).map_err(|source| CheckpointError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let tensors = model
            .named_variables()
            .into_iter()
            .map(|(name, var)| Ok((name, var.as_tensor().to_device(&Device::Cpu)?)))
            .collect::<Result<HashMap<String, Tensor>, candle_core::Error>>()?;
        let path = dir.join(WEIGHTS_FILE);
        candle_core::safetensors::save(&tensors, &path)?;
        config.save(&dir.join(CONFIG_FILE))?;
        info!(path = %path.display(), tensors = tensors.len(), "Saved checkpoint");
        Ok(path)
    }

    fn load(
        &self,
        model: &mut dyn CausalLM,
        path: &Path,
        strict: bool,
    ) -> Result<(), CheckpointError> {
        let weights = if path.is_dir() {
            path.join(WEIGHTS_FILE)
        } else {
            path.to_path_buf()
        };
        let mut tensors = candle_core::safetensors::load(&weights, model.device())?;
        let mut loaded = 0usize;
        let mut known = HashSet::new();
        for (name, var) in model.named_variables() {
            known.insert(name.clone());
            match tensors.remove(&name) {
                Some(tensor) => {
                    var.set(&tensor.to_dtype(var.dtype())?)?;
                    loaded += 1;
                }
                None if strict => {
                    return Err(CheckpointError::MissingTensor {
                        path: weights,
                        name,
                    });
                }
                None => warn!(name, "Checkpoint has no weights for tensor, keeping init"),
            }
        }
        if let Some(name) = tensors.into_keys().find(|name| !known.contains(name)) {
            if strict {
                return Err(CheckpointError::UnexpectedTensor {
                    path: weights,
                    name,
                });
            }
            warn!(name, "Ignoring unexpected tensor in checkpoint");
        }
        info!(path = %weights.display(), loaded, "Loaded checkpoint");
        Ok(())
    }
}
