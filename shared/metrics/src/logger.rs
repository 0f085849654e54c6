use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogChannel {
    Train,
    Validation,
    Meta,
    Internal,
}

impl LogChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogChannel::Train => "train",
            LogChannel::Validation => "validation",
            LogChannel::Meta => "meta",
            LogChannel::Internal => "internal",
        }
    }

    /// Channel for an evaluation run in `mode`; anything but "train" logs as validation.
    pub fn for_mode(mode: &str) -> Self {
        if mode == "train" {
            LogChannel::Train
        } else {
            LogChannel::Validation
        }
    }
}

impl std::fmt::Display for LogChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub channel: LogChannel,
    pub key: String,
    pub value: f64,
    pub step: u64,
}

pub trait ExperimentLogger: Send + std::fmt::Debug {
    fn log(&mut self, channel: LogChannel, key: &str, value: f64, step: u64);

    /// Detaches from any external tracking service at the end of a run.
    fn reset_external(&mut self) {}
}

/// Appends every record as one JSON line to `<dir>/logs.jsonl` and traces it.
///
/// Write failures are reported once per record and never fail the run.
#[derive(Debug)]
pub struct LocalLogger {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

#[derive(Serialize)]
struct Line<'a> {
    time: String,
    channel: LogChannel,
    key: &'a str,
    value: f64,
    step: u64,
}

impl LocalLogger {
    pub const FILE_NAME: &'static str = "logs.jsonl";

    pub fn new(dir: &Path) -> Self {
        let path = dir.join(Self::FILE_NAME);
        let writer = std::fs::create_dir_all(dir)
            .and_then(|_| OpenOptions::new().create(true).append(true).open(&path))
            .map(BufWriter::new)
            .map_err(|err| warn!(path = %path.display(), "Failed to open experiment log: {err}"))
            .ok();
        Self { path, writer }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ExperimentLogger for LocalLogger {
    fn log(&mut self, channel: LogChannel, key: &str, value: f64, step: u64) {
        debug!(%channel, key, value, step, "metric");
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let line = Line {
            time: chrono::Utc::now().to_rfc3339(),
            channel,
            key,
            value,
            step,
        };
        let result = serde_json::to_writer(&mut *writer, &line)
            .map_err(std::io::Error::from)
            .and_then(|_| writer.write_all(b"\n"))
            .and_then(|_| writer.flush());
        if let Err(err) = result {
            warn!(path = %self.path.display(), "Failed to write experiment log: {err}");
        }
    }

    fn reset_external(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(err) = writer.flush() {
                warn!(path = %self.path.display(), "Failed to flush experiment log: {err}");
            }
        }
        info!(path = %self.path.display(), "Closed experiment log");
    }
}

/// Keeps records in memory; clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct MemoryLogger {
    records: Arc<Mutex<Vec<LogRecord>>>,
    resets: Arc<Mutex<usize>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Values logged under `key` on `channel`, in logging order.
    pub fn values(&self, channel: LogChannel, key: &str) -> Vec<(u64, f64)> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.channel == channel && r.key == key)
            .map(|r| (r.step, r.value))
            .collect()
    }

    pub fn resets(&self) -> usize {
        *self.resets.lock().unwrap()
    }
}

impl ExperimentLogger for MemoryLogger {
    fn log(&mut self, channel: LogChannel, key: &str, value: f64, step: u64) {
        self.records.lock().unwrap().push(LogRecord {
            channel,
            key: key.to_string(),
            value,
            step,
        });
    }

    fn reset_external(&mut self) {
        *self.resets.lock().unwrap() += 1;
    }
}
