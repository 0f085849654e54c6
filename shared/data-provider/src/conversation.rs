use std::{
    io::{BufRead, BufReader},
    path::Path,
};

use candle_core::{Device, Tensor};
use finetune_modeling::{Batch, EvalOutput};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{ByteTokenizer, DataError, SupervisedDataset};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub prompt: String,
    pub answer: String,
}

impl ConversationRecord {
    pub fn new(prompt: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            answer: answer.into(),
        }
    }
}

/// The raw rows of a split, kept alongside the dataset for post-processing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationFrame {
    records: Vec<ConversationRecord>,
}

fn column_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl ValidationFrame {
    pub fn from_records(records: Vec<ConversationRecord>) -> Self {
        Self { records }
    }

    /// Reads one JSON object per line, taking the prompt and answer from the named
    /// columns. Blank lines are skipped.
    pub fn load_jsonl(
        path: &Path,
        prompt_column: &str,
        answer_column: &str,
    ) -> Result<Self, DataError> {
        let io_err = |source| DataError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = std::fs::File::open(path).map_err(io_err)?;
        let mut records = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(io_err)?;
            if line.trim().is_empty() {
                continue;
            }
            let row: serde_json::Map<String, Value> =
                serde_json::from_str(&line).map_err(|source| DataError::Json {
                    path: path.to_path_buf(),
                    line: index + 1,
                    source,
                })?;
            let column = |name: &str| {
                row.get(name)
                    .map(column_text)
                    .ok_or_else(|| DataError::MissingColumn {
                        path: path.to_path_buf(),
                        line: index + 1,
                        column: name.to_string(),
                    })
            };
            records.push(ConversationRecord {
                prompt: column(prompt_column)?,
                answer: column(answer_column)?,
            });
        }
        debug!(path = %path.display(), rows = records.len(), "Loaded conversation rows");
        Ok(Self { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[ConversationRecord] {
        &self.records
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetMode {
    /// Prompt and answer, loss on the answer.
    Supervised,
    /// Prompts only, for rollouts.
    Rlhf,
}

/// Byte-tokenized prompt/answer pairs.
///
/// Supervised batches carry `input_ids` and `attention_mask` (left padded, `u32`),
/// a `loss_mask` over answer tokens and the closing EOS, and the prompt on its own
/// as `prompt_input_ids`/`prompt_attention_mask` for generation. RLHF batches carry
/// only the prompt as `input_ids`. Both carry the raw prompts as
/// `reward_model_prompt_text`.
#[derive(Debug, Clone)]
pub struct ConversationDataset {
    records: Vec<ConversationRecord>,
    tokenizer: ByteTokenizer,
    max_length: usize,
    mode: DatasetMode,
}

struct Encoded {
    ids: Vec<u32>,
    prompt_len: usize,
}

fn left_pad(rows: &[Vec<u32>], pad: u32) -> (Vec<u32>, Vec<u32>, usize) {
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut ids = Vec::with_capacity(rows.len() * width);
    let mut mask = Vec::with_capacity(rows.len() * width);
    for row in rows {
        let padding = width - row.len();
        ids.extend(std::iter::repeat_n(pad, padding));
        ids.extend_from_slice(row);
        mask.extend(std::iter::repeat_n(0u32, padding));
        mask.extend(std::iter::repeat_n(1u32, row.len()));
    }
    (ids, mask, width)
}

impl ConversationDataset {
    pub fn new(records: Vec<ConversationRecord>, max_length: usize, mode: DatasetMode) -> Self {
        Self {
            records,
            tokenizer: ByteTokenizer,
            max_length: max_length.max(2),
            mode,
        }
    }

    pub fn from_frame(frame: &ValidationFrame, max_length: usize, mode: DatasetMode) -> Self {
        Self::new(frame.records().to_vec(), max_length, mode)
    }

    pub fn mode(&self) -> DatasetMode {
        self.mode
    }

    pub fn tokenizer(&self) -> &ByteTokenizer {
        &self.tokenizer
    }

    fn prompt_ids(&self, record: &ConversationRecord) -> Vec<u32> {
        let mut ids = self.tokenizer.encode(&record.prompt);
        if ids.is_empty() {
            ids.push(ByteTokenizer::EOS);
        }
        if ids.len() > self.max_length {
            ids.drain(..ids.len() - self.max_length);
        }
        ids
    }

    /// Prompt, answer and EOS, cut from the left to fit `max_length`.
    fn encode(&self, record: &ConversationRecord) -> Encoded {
        let mut ids = self.tokenizer.encode(&record.prompt);
        if ids.is_empty() {
            ids.push(ByteTokenizer::EOS);
        }
        let mut prompt_len = ids.len();
        ids.extend(self.tokenizer.encode(&record.answer));
        ids.push(ByteTokenizer::EOS);
        if ids.len() > self.max_length {
            let cut = ids.len() - self.max_length;
            ids.drain(..cut);
            prompt_len = prompt_len.saturating_sub(cut).max(1);
        }
        Encoded { ids, prompt_len }
    }

    fn rows(&self, indices: &[usize]) -> Result<Vec<&ConversationRecord>, DataError> {
        indices
            .iter()
            .map(|&index| {
                self.records.get(index).ok_or(DataError::IndexOutOfRange {
                    index,
                    len: self.records.len(),
                })
            })
            .collect()
    }
}

impl SupervisedDataset for ConversationDataset {
    fn len(&self) -> usize {
        self.records.len()
    }

    fn collate(&self, indices: &[usize]) -> Result<Batch, DataError> {
        let rows = self.rows(indices)?;
        let b = rows.len();
        let prompts: Vec<Vec<u32>> = rows.iter().map(|r| self.prompt_ids(r)).collect();
        let (prompt_ids, prompt_mask, prompt_width) = left_pad(&prompts, ByteTokenizer::PAD);
        let prompt_ids = Tensor::from_vec(prompt_ids, (b, prompt_width), &Device::Cpu)?;
        let prompt_mask = Tensor::from_vec(prompt_mask, (b, prompt_width), &Device::Cpu)?;
        let prompt_text = rows.iter().map(|r| r.prompt.clone()).collect();

        let batch = match self.mode {
            DatasetMode::Rlhf => Batch::new()
                .with_tensor("input_ids", prompt_ids)
                .with_tensor("attention_mask", prompt_mask),
            DatasetMode::Supervised => {
                let encoded: Vec<Encoded> = rows.iter().map(|r| self.encode(r)).collect();
                let sequences: Vec<Vec<u32>> = encoded.iter().map(|e| e.ids.clone()).collect();
                let (ids, mask, width) = left_pad(&sequences, ByteTokenizer::PAD);
                let mut loss_mask = vec![0f32; b * width];
                for (row, example) in encoded.iter().enumerate() {
                    let start = row * width + (width - example.ids.len()) + example.prompt_len;
                    for value in &mut loss_mask[start..(row + 1) * width] {
                        *value = 1.0;
                    }
                }
                Batch::new()
                    .with_tensor("input_ids", Tensor::from_vec(ids, (b, width), &Device::Cpu)?)
                    .with_tensor(
                        "attention_mask",
                        Tensor::from_vec(mask, (b, width), &Device::Cpu)?,
                    )
                    .with_tensor(
                        "loss_mask",
                        Tensor::from_vec(loss_mask, (b, width), &Device::Cpu)?,
                    )
                    .with_tensor("prompt_input_ids", prompt_ids)
                    .with_tensor("prompt_attention_mask", prompt_mask)
            }
        };
        Ok(batch.with_text("reward_model_prompt_text", prompt_text))
    }

    fn postprocess_batch_predictions(&self, ids: &Tensor) -> Result<Vec<String>, DataError> {
        Ok(ids
            .to_device(&Device::Cpu)?
            .to_vec2::<u32>()?
            .iter()
            .map(|row| self.tokenizer.decode(row))
            .collect())
    }

    fn postprocess_output(
        &self,
        frame: &ValidationFrame,
        mut output: EvalOutput,
    ) -> Result<EvalOutput, DataError> {
        if let Some(ids) = output.tensor("predicted_answer_ids") {
            let predicted = self.postprocess_batch_predictions(ids)?;
            if predicted.len() != frame.len() {
                return Err(DataError::RowCount {
                    expected: frame.len(),
                    actual: predicted.len(),
                });
            }
            output.insert_text("predicted_text", predicted);
        }
        output.insert_text(
            "target_text",
            frame.records().iter().map(|r| r.answer.clone()).collect(),
        );
        output.insert_text(
            "prompt_text",
            frame.records().iter().map(|r| r.prompt.clone()).collect(),
        );
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn dataset(mode: DatasetMode) -> ConversationDataset {
        ConversationDataset::new(
            vec![
                ConversationRecord::new("ab", "c"),
                ConversationRecord::new("x", "yz"),
            ],
            16,
            mode,
        )
    }

    #[test]
    fn supervised_batch_is_left_padded_with_answer_mask() {
        let batch = dataset(DatasetMode::Supervised).collate(&[0, 1]).unwrap();
        let pad = ByteTokenizer::PAD;
        let eos = ByteTokenizer::EOS;
        let ids = batch.tensor("input_ids").unwrap().to_vec2::<u32>().unwrap();
        assert_eq!(
            ids,
            vec![
                vec![pad, 97, 98, 99, eos],
                vec![pad, 120, 121, 122, eos],
            ]
        );
        let mask = batch.tensor("attention_mask").unwrap().to_vec2::<u32>().unwrap();
        assert_eq!(mask, vec![vec![0, 1, 1, 1, 1], vec![0, 1, 1, 1, 1]]);
        let loss_mask = batch.tensor("loss_mask").unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(
            loss_mask,
            vec![vec![0., 0., 0., 1., 1.], vec![0., 0., 1., 1., 1.]]
        );
        let prompts = batch
            .tensor("prompt_input_ids")
            .unwrap()
            .to_vec2::<u32>()
            .unwrap();
        assert_eq!(prompts, vec![vec![97, 98], vec![pad, 120]]);
        assert_eq!(
            batch.text("reward_model_prompt_text").unwrap(),
            &["ab".to_string(), "x".to_string()]
        );
    }

    #[test]
    fn rlhf_batch_holds_prompts_only() {
        let batch = dataset(DatasetMode::Rlhf).collate(&[1]).unwrap();
        let ids = batch.tensor("input_ids").unwrap().to_vec2::<u32>().unwrap();
        assert_eq!(ids, vec![vec![120]]);
        assert!(batch.get_tensor("loss_mask").is_none());
    }

    #[test]
    fn long_examples_are_cut_from_the_left() {
        let dataset = ConversationDataset::new(
            vec![ConversationRecord::new("abcdef", "gh")],
            4,
            DatasetMode::Supervised,
        );
        let batch = dataset.collate(&[0]).unwrap();
        let ids = batch.tensor("input_ids").unwrap().to_vec2::<u32>().unwrap();
        assert_eq!(ids, vec![vec![102, 103, 104, ByteTokenizer::EOS]]);
        let loss_mask = batch.tensor("loss_mask").unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(loss_mask, vec![vec![0., 1., 1., 1.]]);
    }

    #[test]
    fn out_of_range_index_is_an_error() {
        let err = dataset(DatasetMode::Supervised).collate(&[5]).unwrap_err();
        assert!(matches!(err, DataError::IndexOutOfRange { index: 5, len: 2 }));
    }

    #[test]
    fn postprocess_decodes_predictions() {
        let dataset = dataset(DatasetMode::Supervised);
        let frame = ValidationFrame::from_records(dataset.records.clone());
        let mut output = EvalOutput::new();
        let ids = Tensor::new(
            &[[99u32, ByteTokenizer::EOS, ByteTokenizer::PAD], [121, 122, ByteTokenizer::EOS]],
            &Device::Cpu,
        )
        .unwrap();
        output.insert_tensor("predicted_answer_ids", ids);
        let output = dataset.postprocess_output(&frame, output).unwrap();
        assert_eq!(
            output.text("predicted_text").unwrap(),
            &["c".to_string(), "yz".to_string()]
        );
        assert_eq!(
            output.text("target_text").unwrap(),
            &["c".to_string(), "yz".to_string()]
        );
    }
}
