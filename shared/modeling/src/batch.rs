use std::collections::BTreeMap;

use candle_core::{Device, Tensor};

use crate::ModelError;

/// Named tensors and text columns for one batch.
///
/// Tensor entries share a leading batch dimension. Keys are kept sorted so every
/// worker walks them in the same order during collectives.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    tensors: BTreeMap<String, Tensor>,
    texts: BTreeMap<String, Vec<String>>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tensor(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.insert_tensor(name, tensor);
        self
    }

    pub fn with_text(mut self, name: impl Into<String>, text: Vec<String>) -> Self {
        self.insert_text(name, text);
        self
    }

    pub fn insert_tensor(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn insert_text(&mut self, name: impl Into<String>, text: Vec<String>) {
        self.texts.insert(name.into(), text);
    }

    pub fn tensor(&self, name: &str) -> Result<&Tensor, ModelError> {
        self.tensors
            .get(name)
            .ok_or_else(|| ModelError::MissingTensor(name.to_string()))
    }

    pub fn get_tensor(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn text(&self, name: &str) -> Result<&[String], ModelError> {
        self.texts
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| ModelError::MissingText(name.to_string()))
    }

    pub fn tensor_names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn text_names(&self) -> impl Iterator<Item = &str> {
        self.texts.keys().map(String::as_str)
    }

    /// Rows in the batch, taken from the first entry.
    pub fn len(&self) -> usize {
        self.tensors
            .values()
            .next()
            .and_then(|t| t.dims().first().copied())
            .or_else(|| self.texts.values().next().map(Vec::len))
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_device(&self, device: &Device) -> Result<Batch, ModelError> {
        let tensors = self
            .tensors
            .iter()
            .map(|(name, tensor)| Ok((name.clone(), tensor.to_device(device)?)))
            .collect::<Result<_, candle_core::Error>>()?;
        Ok(Batch {
            tensors,
            texts: self.texts.clone(),
        })
    }
}

/// Per-example outputs of an inference pass.
///
/// Tensor entries have the example on their leading dimension; text entries hold
/// one string per example.
#[derive(Debug, Clone, Default)]
pub struct EvalOutput {
    tensors: BTreeMap<String, Tensor>,
    texts: BTreeMap<String, Vec<String>>,
}

impl EvalOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_tensor(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn insert_text(&mut self, name: impl Into<String>, text: Vec<String>) {
        self.texts.insert(name.into(), text);
    }

    pub fn tensor(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn text(&self, name: &str) -> Option<&[String]> {
        self.texts.get(name).map(Vec::as_slice)
    }

    pub fn tensors(&self) -> &BTreeMap<String, Tensor> {
        &self.tensors
    }

    pub fn texts(&self) -> &BTreeMap<String, Vec<String>> {
        &self.texts
    }

    pub fn into_parts(self) -> (BTreeMap<String, Tensor>, BTreeMap<String, Vec<String>>) {
        (self.tensors, self.texts)
    }

    pub fn from_parts(
        tensors: BTreeMap<String, Tensor>,
        texts: BTreeMap<String, Vec<String>>,
    ) -> Self {
        Self { tensors, texts }
    }

    /// Appends the examples of `other` after the examples already held.
    pub fn extend(&mut self, other: EvalOutput) -> Result<(), ModelError> {
        for (name, tensor) in other.tensors {
            let merged = match self.tensors.remove(&name) {
                Some(existing) => Tensor::cat(&[&existing, &tensor], 0)?,
                None => tensor,
            };
            self.tensors.insert(name, merged);
        }
        for (name, text) in other.texts {
            self.texts.entry(name).or_default().extend(text);
        }
        Ok(())
    }

    /// Keeps only the first `len` examples of every entry.
    pub fn truncate(&mut self, len: usize) -> Result<(), ModelError> {
        for tensor in self.tensors.values_mut() {
            let rows = tensor.dim(0)?;
            if rows > len {
                *tensor = tensor.narrow(0, 0, len)?;
            }
        }
        for text in self.texts.values_mut() {
            text.truncate(len);
        }
        Ok(())
    }

    /// Drops the autograd history of every tensor.
    pub fn detach(self) -> Self {
        Self {
            tensors: self
                .tensors
                .into_iter()
                .map(|(name, tensor)| (name, tensor.detach()))
                .collect(),
            texts: self.texts,
        }
    }

    /// Number of examples in each entry, keyed by entry name.
    pub fn lengths(&self) -> Result<BTreeMap<String, usize>, ModelError> {
        let mut lengths = BTreeMap::new();
        for (name, tensor) in &self.tensors {
            lengths.insert(name.clone(), tensor.dim(0)?);
        }
        for (name, text) in &self.texts {
            lengths.insert(name.clone(), text.len());
        }
        Ok(lengths)
    }
}

/// Scalar diagnostics of one optimization step, in insertion-independent order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutput(BTreeMap<String, f64>);

impl StepOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: f64) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, f64)> for StepOutput {
    fn from_iter<T: IntoIterator<Item = (String, f64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn output(losses: &[f32], texts: &[&str]) -> EvalOutput {
        let mut output = EvalOutput::new();
        output.insert_tensor(
            "loss",
            Tensor::new(losses, &Device::Cpu).unwrap(),
        );
        output.insert_text("prompt_text", texts.iter().map(|s| s.to_string()).collect());
        output
    }

    #[test]
    fn extend_then_truncate_keeps_order() {
        let mut all = output(&[1.0, 2.0], &["a", "b"]);
        all.extend(output(&[3.0, 4.0], &["c", "d"])).unwrap();
        all.truncate(3).unwrap();

        assert_eq!(
            all.tensor("loss").unwrap().to_vec1::<f32>().unwrap(),
            vec![1.0, 2.0, 3.0]
        );
        assert_eq!(all.text("prompt_text").unwrap(), ["a", "b", "c"]);
        assert_eq!(
            all.lengths().unwrap().into_values().collect::<Vec<_>>(),
            vec![3, 3]
        );
    }

    #[test]
    fn truncate_longer_than_contents_is_noop() {
        let mut out = output(&[1.0], &["a"]);
        out.truncate(10).unwrap();
        assert_eq!(out.tensor("loss").unwrap().dims(), &[1]);
    }

    #[test]
    fn batch_lookup_errors_name_the_key() {
        let batch = Batch::new().with_text("prompt", vec!["x".to_string()]);
        assert_eq!(batch.len(), 1);
        let err = batch.tensor("input_ids").unwrap_err();
        assert_eq!(err.to_string(), "batch has no tensor named \"input_ids\"");
    }
}
