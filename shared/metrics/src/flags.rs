use std::{path::Path, time::Duration};

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlagError {
    #[error("failed to access flag file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("flag file {path} is not a JSON object: {source}")]
    Json {
        path: String,
        source: serde_json::Error,
    },
}

/// Sets `key` to `value` in the JSON object stored at `path`, keeping other keys.
pub fn write_flag(path: &Path, key: &str, value: &str) -> Result<(), FlagError> {
    let display = path.display().to_string();
    let mut flags: Map<String, Value> = match std::fs::read_to_string(path) {
        Ok(contents) if !contents.trim().is_empty() => serde_json::from_str(&contents)
            .map_err(|source| FlagError::Json {
                path: display.clone(),
                source,
            })?,
        Ok(_) => Map::new(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Map::new(),
        Err(source) => {
            return Err(FlagError::Io {
                path: display,
                source,
            })
        }
    };
    flags.insert(key.to_string(), Value::String(value.to_string()));
    let contents = serde_json::to_string_pretty(&flags).map_err(|source| FlagError::Json {
        path: display.clone(),
        source,
    })?;
    std::fs::write(path, contents).map_err(|source| FlagError::Io {
        path: display,
        source,
    })
}

/// `HH:MM:SS`, with a `<days>d ` prefix once the run took longer than a day.
pub fn format_runtime(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    if total <= 86_400 {
        return format!("{:02}:{:02}:{:02}", total / 3600, total % 3600 / 60, total % 60);
    }
    let (days, rest) = (total / 86_400, total % 86_400);
    format!(
        "{days}d {:02}:{:02}:{:02}",
        rest / 3600,
        rest % 3600 / 60,
        rest % 60
    )
}
