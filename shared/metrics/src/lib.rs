mod flags;
mod logger;

pub use flags::{format_runtime, write_flag, FlagError};
pub use logger::{ExperimentLogger, LocalLogger, LogChannel, LogRecord, MemoryLogger};
