mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::logging::LogFormat;

#[derive(Parser)]
#[command(
    name = "marketsync",
    version,
    about = "Resumable market-data ingestion pipelines"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log line format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline once, resuming an unfinished run if there is one
    Run {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Enable fault injection using the pipeline's chaos settings
        #[arg(long)]
        chaos: bool,
    },
    /// Validate pipeline configuration, sources, and state backend
    Check {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
    },
    /// Show the latest run of a pipeline
    Status {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
    },
    /// List recent runs of a pipeline, newest first
    Runs {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Maximum number of runs to show
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Mark a run left `running` by a crashed process as failed
    Recover {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level, cli.log_format);

    match cli.command {
        Commands::Run { pipeline, chaos } => commands::run::execute(&pipeline, chaos).await,
        Commands::Check { pipeline } => commands::check::execute(&pipeline).await,
        Commands::Status { pipeline } => commands::status::execute(&pipeline),
        Commands::Runs { pipeline, limit } => commands::runs::execute(&pipeline, limit),
        Commands::Recover { pipeline } => commands::recover::execute(&pipeline),
    }
}
