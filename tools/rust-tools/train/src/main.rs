use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use finetune_core::RunConfig;
use finetune_tui::{LogOutput, logging, setup_ctrl_c};
use tracing::{error, info};

mod run;

#[derive(Parser, Debug)]
#[command(name = "train")]
#[command(about = "Supervised and RLHF fine-tuning of a causal language model")]
struct Args {
    /// Run configuration in TOML
    #[arg(long, short)]
    config: PathBuf,

    /// Override one config value, e.g. `--set training.epochs=3`. Repeatable.
    #[arg(long = "set", value_name = "SECTION.KEY=VALUE")]
    overrides: Vec<String>,

    #[arg(long, env = "FINETUNE_LOG", value_enum, default_value_t = LogOutput::Console)]
    log: LogOutput,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = RunConfig::load(&args.config, &args.overrides)
        .with_context(|| format!("Failed to load config {}", args.config.display()))?;
    logging()
        .with_output(args.log)
        .with_log_file(config.logging.log_file.clone())
        .init()?;

    // For ctrl-c handling
    let cancel = setup_ctrl_c();

    config.normalize();
    config.validate()?;
    info!(
        experiment = %config.experiment_name,
        output = %config.output_directory.display(),
        seed = config.seed(),
        "Starting run"
    );

    let result = tokio::task::spawn_blocking(move || run::run(config, cancel)).await?;
    if let Err(err) = &result {
        error!("Run failed: {err:#}");
    }
    result
}
