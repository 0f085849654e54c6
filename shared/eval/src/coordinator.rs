use std::{collections::BTreeMap, path::PathBuf};

use candle_core::{DType, Tensor};
use finetune_core::RunState;
use finetune_data_provider::{DataLoader, ValidationFrame};
use finetune_metrics::{ExperimentLogger, LogChannel};
use finetune_modeling::{Accelerator, CausalLM, EvalOutput, GenerationConfig};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::{EvalError, MetricSpec};

/// Loss and metric of one evaluation pass, as seen by the coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EvalScores {
    pub loss: f64,
    pub metric: f64,
}

/// One evaluation pass over a split.
#[derive(Debug, Clone, Copy)]
pub struct EvalRequest<'a> {
    pub loader: &'a DataLoader,
    pub frame: &'a ValidationFrame,
    /// Split name; selects the log channel and the predictions file name.
    pub mode: &'a str,
}

/// Runs the model over every batch of `loader` and concatenates the per-example
/// outputs. Generates when `generation` is given.
pub fn run_inference(
    accelerator: &Accelerator,
    model: &mut dyn CausalLM,
    loader: &DataLoader,
    generation: Option<&GenerationConfig>,
) -> Result<EvalOutput, EvalError> {
    let dataset = loader.dataset();
    let mut output = EvalOutput::new();
    for batch in loader.iter() {
        let batch = dataset.batch_to_device(batch?, accelerator.device())?;
        let batch_output =
            accelerator.autocast(|autocast| model.inference(&batch, autocast, generation))?;
        output.extend(batch_output.detach())?;
    }
    Ok(output)
}

/// Concatenates every entry across the group in rank order.
fn gather_output(accelerator: &Accelerator, output: EvalOutput) -> Result<EvalOutput, EvalError> {
    if !accelerator.is_distributed() {
        return Ok(output);
    }
    let (tensors, texts) = output.into_parts();
    let mut gathered_tensors = BTreeMap::new();
    for (name, tensor) in tensors {
        gathered_tensors.insert(name, accelerator.gather_concat(&tensor)?);
    }
    let mut gathered_texts = BTreeMap::new();
    for (name, text) in texts {
        gathered_texts.insert(name, accelerator.gather(text)?.concat());
    }
    Ok(EvalOutput::from_parts(gathered_tensors, gathered_texts))
}

fn mean_loss(output: &EvalOutput) -> Result<f64, EvalError> {
    match output.tensor("loss") {
        Some(loss) if loss.elem_count() > 0 => Ok(loss
            .to_dtype(DType::F64)?
            .mean_all()?
            .to_scalar::<f64>()?),
        _ => Ok(0.0),
    }
}

fn column_values(tensor: &Tensor) -> Result<Option<Vec<Value>>, EvalError> {
    if tensor.rank() != 1 {
        return Ok(None);
    }
    Ok(Some(
        tensor
            .to_dtype(DType::F64)?
            .to_vec1::<f64>()?
            .into_iter()
            .map(Value::from)
            .collect(),
    ))
}

#[derive(Debug, Clone)]
pub struct EvaluationCoordinator {
    metric: MetricSpec,
    generation: GenerationConfig,
    output_directory: PathBuf,
}

impl EvaluationCoordinator {
    pub fn new(metric: MetricSpec, generation: GenerationConfig, output_directory: PathBuf) -> Self {
        Self {
            metric,
            generation,
            output_directory,
        }
    }

    pub fn metric(&self) -> &MetricSpec {
        &self.metric
    }

    pub fn generation(&self) -> &GenerationConfig {
        &self.generation
    }

    /// Evaluates `model` on the request's split.
    ///
    /// Every rank runs inference on its shard and takes part in the gather; the
    /// coordinator scores, logs and saves predictions, then all ranks meet at a
    /// barrier. Non-coordinators return zeroed scores.
    pub fn evaluate(
        &self,
        run_state: &RunState,
        accelerator: &Accelerator,
        model: &mut dyn CausalLM,
        request: EvalRequest<'_>,
        logger: Option<&mut dyn ExperimentLogger>,
    ) -> Result<EvalScores, EvalError> {
        model.set_training(false);
        let generation = self.metric.requires_generation.then_some(&self.generation);
        let local = run_inference(accelerator, model, request.loader, generation)?;
        debug!(rank = accelerator.rank(), lengths = ?local.lengths()?, "Local inference done");

        let mut output = gather_output(accelerator, local)?.detach();
        let dataset = request.loader.dataset();
        output.truncate(dataset.len())?;

        let mut scores = EvalScores::default();
        if accelerator.is_coordinator() {
            let output = dataset.postprocess_output(request.frame, output)?;
            scores.loss = mean_loss(&output)?;
            scores.metric = self.metric.score(&output)?;

            let step = run_state.current_global_step();
            if let Some(logger) = logger {
                let channel = LogChannel::for_mode(request.mode);
                logger.log(channel, "loss", scores.loss, step);
                logger.log(channel, self.metric.name, scores.metric, step);
            }
            info!(
                mode = request.mode,
                loss = scores.loss,
                metric = self.metric.name,
                value = scores.metric,
                "{} {}: {:.5}",
                request.mode,
                self.metric.name,
                scores.metric
            );
            self.save_predictions(&output, request.mode)?;
        }

        accelerator.wait_for_everyone()?;
        Ok(scores)
    }

    /// Writes text entries and per-example scalar entries as JSON columns.
    fn save_predictions(&self, output: &EvalOutput, mode: &str) -> Result<PathBuf, EvalError> {
        let mut columns = Map::new();
        for (name, tensor) in output.tensors() {
            if let Some(values) = column_values(tensor)? {
                columns.insert(name.clone(), Value::Array(values));
            }
        }
        for (name, text) in output.texts() {
            columns.insert(
                name.clone(),
                Value::Array(text.iter().cloned().map(Value::String).collect()),
            );
        }
        let path = self.output_directory.join(format!("{mode}_predictions.json"));
        let io_err = |source| EvalError::Io {
            path: path.clone(),
            source,
        };
        std::fs::create_dir_all(&self.output_directory).map_err(io_err)?;
        std::fs::write(&path, serde_json::to_vec_pretty(&Value::Object(columns))?)
            .map_err(io_err)?;
        debug!(path = %path.display(), "Saved predictions");
        Ok(path)
    }
}
