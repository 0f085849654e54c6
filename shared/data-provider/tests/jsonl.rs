use std::{io::Write, sync::Arc};

use finetune_data_provider::{
    ConversationDataset, DataError, DataLoader, DatasetMode, SupervisedDataset, ValidationFrame,
};
use pretty_assertions::assert_eq;

fn write_rows(rows: &[&str]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    for row in rows {
        writeln!(file, "{row}").unwrap();
    }
    file
}

#[test_log::test]
fn loads_configured_columns() {
    let file = write_rows(&[
        r#"{"question": "2+2", "reply": "4"}"#,
        "",
        r#"{"question": "capital of France", "reply": "Paris", "extra": 1}"#,
        r#"{"question": 7, "reply": "seven"}"#,
    ]);
    let frame = ValidationFrame::load_jsonl(file.path(), "question", "reply").unwrap();
    assert_eq!(frame.len(), 3);
    assert_eq!(frame.records()[1].answer, "Paris");
    assert_eq!(frame.records()[2].prompt, "7");
}

#[test_log::test]
fn missing_column_names_the_line() {
    let file = write_rows(&[r#"{"prompt": "a", "answer": "b"}"#, r#"{"prompt": "c"}"#]);
    let err = ValidationFrame::load_jsonl(file.path(), "prompt", "answer").unwrap_err();
    match err {
        DataError::MissingColumn { line, column, .. } => {
            assert_eq!(line, 2);
            assert_eq!(column, "answer");
        }
        other => panic!("unexpected error {other}"),
    }
}

#[test_log::test]
fn loader_covers_every_row_once_per_epoch() {
    let rows: Vec<String> = (0..12)
        .map(|i| format!(r#"{{"prompt": "q{i}", "answer": "a{i}"}}"#))
        .collect();
    let file = write_rows(&rows.iter().map(String::as_str).collect::<Vec<_>>());
    let frame = ValidationFrame::load_jsonl(file.path(), "prompt", "answer").unwrap();
    let dataset: Arc<dyn SupervisedDataset> = Arc::new(ConversationDataset::from_frame(
        &frame,
        64,
        DatasetMode::Rlhf,
    ));

    let mut seen = Vec::new();
    for rank in 0..3 {
        let mut loader = DataLoader::train(dataset.clone(), 2, rank, 3);
        loader.set_epoch_seed(100 + rank as u64);
        assert_eq!(loader.len(), 2);
        for batch in loader.iter() {
            let batch = batch.unwrap();
            seen.extend(batch.text("reward_model_prompt_text").unwrap().to_vec());
        }
    }
    seen.sort();
    let mut expected: Vec<String> = (0..12).map(|i| format!("q{i}")).collect();
    expected.sort();
    assert_eq!(seen, expected);
}
