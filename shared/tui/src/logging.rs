use std::{fs::OpenOptions, path::PathBuf};

use clap::ValueEnum;
use tracing::Level;
use tracing_subscriber::{
    filter::FromEnvError, fmt, layer::SubscriberExt, EnvFilter, Layer, Registry,
};

#[derive(Clone, Debug, Copy, ValueEnum, PartialEq)]
pub enum LogOutput {
    Console,
    Json,
}

pub struct LoggingBuilder {
    output: LogOutput,
    level: Level,
    write_logs_file: Option<PathBuf>,
}

impl Default for LoggingBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggingBuilder {
    /// Create a new logging builder with default settings
    pub fn new() -> Self {
        Self {
            output: LogOutput::Console,
            level: Level::INFO,
            write_logs_file: None,
        }
    }

    /// Set the log output format
    pub fn with_output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    /// Set the log level
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Also append detailed logs to this file
    pub fn with_log_file<P: Into<Option<PathBuf>>>(mut self, path: P) -> Self {
        self.write_logs_file = path.into();
        self
    }

    /// Install the global subscriber
    pub fn init(self) -> anyhow::Result<()> {
        init_logging_core(self.output, self.level, self.write_logs_file)
    }
}

/// Create a new logging builder
pub fn logging() -> LoggingBuilder {
    LoggingBuilder::new()
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn init_logging_core(
    output: LogOutput,
    level: Level,
    write_logs_file: Option<PathBuf>,
) -> anyhow::Result<()> {
    let quiet = |filter: EnvFilter| -> anyhow::Result<EnvFilter> {
        Ok(filter
            .add_directive("tokio=off".parse()?)
            .add_directive("runtime=off".parse()?))
    };
    let output_logs_filter = quiet(
        EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env()?,
    )?;

    let make_detailed_logs_filter = || -> Result<EnvFilter, FromEnvError> {
        if std::env::var("WRITE_RUST_LOG").is_ok() {
            EnvFilter::builder()
                .with_env_var("WRITE_RUST_LOG")
                .from_env()
        } else {
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env()
        }
    };

    let mut layers: Vec<BoxedLayer> = vec![match output {
        LogOutput::Console => fmt::layer()
            .with_writer(std::io::stdout)
            .with_filter(output_logs_filter)
            .boxed(),
        LogOutput::Json => fmt::layer()
            .json()
            .with_writer(std::io::stdout)
            .flatten_event(true)
            .with_current_span(true)
            .with_filter(output_logs_filter)
            .boxed(),
    }];

    if let Some(path) = write_logs_file {
        let log_file = OpenOptions::new().append(true).create(true).open(&path)?;
        layers.push(
            fmt::layer()
                .with_ansi(false)
                .with_writer(log_file)
                .with_filter(quiet(make_detailed_logs_filter()?)?)
                .boxed(),
        );
    }

    tracing::subscriber::set_global_default(tracing_subscriber::registry().with(layers))?;
    Ok(())
}
