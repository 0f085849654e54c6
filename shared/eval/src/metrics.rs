use candle_core::DType;
use finetune_core::ObjectiveDirection;
use finetune_modeling::EvalOutput;

use crate::EvalError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    Mean,
    Median,
}

impl Reduction {
    /// NaN for no values.
    pub fn apply(&self, values: &[f64]) -> f64 {
        if values.is_empty() {
            return f64::NAN;
        }
        match self {
            Reduction::Mean => values.iter().sum::<f64>() / values.len() as f64,
            Reduction::Median => {
                let mut sorted = values.to_vec();
                sorted.sort_by(f64::total_cmp);
                let mid = sorted.len() / 2;
                if sorted.len() % 2 == 0 {
                    (sorted[mid - 1] + sorted[mid]) / 2.0
                } else {
                    sorted[mid]
                }
            }
        }
    }
}

pub type MetricFn = fn(&EvalOutput) -> Result<Vec<f64>, EvalError>;

/// A per-example score and how it is reduced and compared.
#[derive(Debug, Clone, Copy)]
pub struct MetricSpec {
    pub name: &'static str,
    pub direction: ObjectiveDirection,
    pub reduction: Reduction,
    /// Whether the score reads generated text, so inference has to generate.
    pub requires_generation: bool,
    pub compute: MetricFn,
}

impl MetricSpec {
    pub fn score(&self, output: &EvalOutput) -> Result<f64, EvalError> {
        Ok(self.reduction.apply(&(self.compute)(output)?))
    }
}

fn texts<'a>(output: &'a EvalOutput, name: &str) -> Result<&'a [String], EvalError> {
    output
        .text(name)
        .ok_or_else(|| EvalError::MissingEntry(name.to_string()))
}

fn perplexity(output: &EvalOutput) -> Result<Vec<f64>, EvalError> {
    let losses = output
        .tensor("loss")
        .ok_or_else(|| EvalError::MissingEntry("loss".to_string()))?
        .to_dtype(DType::F64)?
        .flatten_all()?
        .to_vec1::<f64>()?;
    Ok(losses.into_iter().map(f64::exp).collect())
}

fn exact_match(output: &EvalOutput) -> Result<Vec<f64>, EvalError> {
    let predicted = texts(output, "predicted_text")?;
    let target = texts(output, "target_text")?;
    Ok(predicted
        .iter()
        .zip(target)
        .map(|(p, t)| f64::from(u8::from(p.trim() == t.trim())))
        .collect())
}

fn token_f1_one(predicted: &str, target: &str) -> f64 {
    let predicted: Vec<&str> = predicted.split_whitespace().collect();
    let target: Vec<&str> = target.split_whitespace().collect();
    if predicted.is_empty() || target.is_empty() {
        return f64::from(u8::from(predicted.is_empty() && target.is_empty()));
    }
    let mut remaining: Vec<&str> = target.clone();
    let mut common = 0usize;
    for token in &predicted {
        if let Some(position) = remaining.iter().position(|t| t == token) {
            remaining.swap_remove(position);
            common += 1;
        }
    }
    if common == 0 {
        return 0.0;
    }
    let precision = common as f64 / predicted.len() as f64;
    let recall = common as f64 / target.len() as f64;
    2.0 * precision * recall / (precision + recall)
}

fn token_f1(output: &EvalOutput) -> Result<Vec<f64>, EvalError> {
    let predicted = texts(output, "predicted_text")?;
    let target = texts(output, "target_text")?;
    Ok(predicted
        .iter()
        .zip(target)
        .map(|(p, t)| token_f1_one(p, t))
        .collect())
}

/// Metrics selectable by name in `prediction.metric`.
#[derive(Debug, Clone)]
pub struct MetricRegistry {
    metrics: Vec<MetricSpec>,
}

impl MetricRegistry {
    pub fn builtin() -> Self {
        Self {
            metrics: vec![
                MetricSpec {
                    name: "Perplexity",
                    direction: ObjectiveDirection::Minimize,
                    reduction: Reduction::Median,
                    requires_generation: false,
                    compute: perplexity,
                },
                MetricSpec {
                    name: "ExactMatch",
                    direction: ObjectiveDirection::Maximize,
                    reduction: Reduction::Mean,
                    requires_generation: true,
                    compute: exact_match,
                },
                MetricSpec {
                    name: "TokenF1",
                    direction: ObjectiveDirection::Maximize,
                    reduction: Reduction::Mean,
                    requires_generation: true,
                    compute: token_f1,
                },
            ],
        }
    }

    /// Adds or replaces a metric by name.
    pub fn register(&mut self, metric: MetricSpec) {
        self.metrics.retain(|m| m.name != metric.name);
        self.metrics.push(metric);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.metrics.iter().map(|m| m.name).collect()
    }

    pub fn get(&self, name: &str) -> Result<MetricSpec, EvalError> {
        self.metrics
            .iter()
            .find(|m| m.name == name)
            .copied()
            .ok_or_else(|| EvalError::UnknownMetric {
                name: name.to_string(),
                known: self.names(),
            })
    }
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::{Device, Tensor};
    use rstest::rstest;

    fn text_output(predicted: &[&str], target: &[&str]) -> EvalOutput {
        let mut output = EvalOutput::new();
        output.insert_text("predicted_text", predicted.iter().map(|s| s.to_string()).collect());
        output.insert_text("target_text", target.iter().map(|s| s.to_string()).collect());
        output
    }

    #[rstest]
    #[case(Reduction::Mean, &[1.0, 2.0, 6.0], 3.0)]
    #[case(Reduction::Median, &[6.0, 1.0, 2.0], 2.0)]
    #[case(Reduction::Median, &[4.0, 1.0, 2.0, 3.0], 2.5)]
    fn reductions(#[case] reduction: Reduction, #[case] values: &[f64], #[case] expected: f64) {
        assert_relative_eq!(reduction.apply(values), expected);
    }

    #[test]
    fn perplexity_is_median_of_exp_loss() {
        let mut output = EvalOutput::new();
        output.insert_tensor(
            "loss",
            Tensor::new(&[0f32, 1.0, 2.0], &Device::Cpu).unwrap(),
        );
        let metric = MetricRegistry::builtin().get("Perplexity").unwrap();
        assert_eq!(metric.direction, ObjectiveDirection::Minimize);
        assert_relative_eq!(metric.score(&output).unwrap(), 1f64.exp(), epsilon = 1e-6);
    }

    #[test]
    fn exact_match_ignores_surrounding_whitespace() {
        let output = text_output(&["Paris ", "4", "no"], &["Paris", "4", "yes"]);
        let metric = MetricRegistry::builtin().get("ExactMatch").unwrap();
        assert_relative_eq!(metric.score(&output).unwrap(), 2.0 / 3.0);
    }

    #[test]
    fn token_f1_gives_partial_credit() {
        let output = text_output(&["the cat sat"], &["the cat"]);
        let metric = MetricRegistry::builtin().get("TokenF1").unwrap();
        // precision 2/3, recall 1
        assert_relative_eq!(metric.score(&output).unwrap(), 0.8);
    }

    #[test]
    fn unknown_metric_lists_known_names() {
        let err = MetricRegistry::builtin().get("BLEU").unwrap_err();
        match err {
            EvalError::UnknownMetric { name, known } => {
                assert_eq!(name, "BLEU");
                assert_eq!(known, vec!["Perplexity", "ExactMatch", "TokenF1"]);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn text_metrics_need_generated_text() {
        let metric = MetricRegistry::builtin().get("ExactMatch").unwrap();
        assert!(metric.requires_generation);
        assert!(matches!(
            metric.score(&EvalOutput::new()),
            Err(EvalError::MissingEntry(_))
        ));
    }
}
